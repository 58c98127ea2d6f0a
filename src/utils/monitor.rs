use crate::adapters::net::LOOPBACK_IFACE;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const SYS_CLASS_NET: &str = "/sys/class/net";
pub const CAPS_DIR: &str = "caps";
/// Shortest sampling period accepted by [`Monitor::spawn`].
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

const MEBI: f64 = 1_048_576.0;
const GIBI: f64 = 1_073_741_824.0;
const MEGA: f64 = 1_000_000.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceMeasures {
    /// Mbit/s
    pub capacity: f64,
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

/// Latest resource measures of the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measures {
    pub cpu_count: u32,
    pub cpu_free: f64,
    /// MiB
    pub memory_total: f64,
    pub memory_free: f64,
    /// GiB
    pub disk_total: f64,
    pub disk_free: f64,
    pub interfaces: BTreeMap<String, InterfaceMeasures>,
}

/// Docker (cgroup v1) accounting files.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    root: PathBuf,
}

impl CgroupReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Nanoseconds of CPU time used by each CPU.
    pub fn cpu_usage_percpu(&self) -> std::io::Result<Vec<u64>> {
        let raw = fs::read_to_string(self.root.join("cpu/cpuacct.usage_percpu"))?;
        Ok(parse_percpu(&raw))
    }

    pub fn memory_limit(&self) -> std::io::Result<f64> {
        read_number(&self.root.join("memory/memory.limit_in_bytes"))
    }

    pub fn memory_usage(&self) -> std::io::Result<f64> {
        read_number(&self.root.join("memory/memory.usage_in_bytes"))
    }
}

fn parse_percpu(raw: &str) -> Vec<u64> {
    raw.split_whitespace()
        .filter_map(|v| v.parse::<u64>().ok())
        .collect()
}

fn read_number(path: &Path) -> std::io::Result<f64> {
    fs::read_to_string(path)?
        .trim()
        .parse::<f64>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// CPUs busy between two cgroup readings taken `elapsed` apart.
fn cgroup_cpu_busy(before: &[u64], after: &[u64], elapsed: Duration) -> f64 {
    let elapsed_ns = elapsed.as_nanos() as f64;
    if elapsed_ns <= 0.0 {
        return 0.0;
    }
    before
        .iter()
        .zip(after)
        .map(|(b, a)| a.saturating_sub(*b) as f64 / elapsed_ns)
        .sum()
}

/// Free bandwidth (Mbit/s) once `bytes` were moved during `period`.
fn free_bandwidth(capacity_mbps: f64, bytes: u64, period: Duration) -> f64 {
    let secs = period.as_secs_f64();
    if secs <= 0.0 {
        return capacity_mbps;
    }
    let used_bps = bytes as f64 * 8.0 / secs;
    ((capacity_mbps * MEGA - used_bps) / MEGA).max(0.0)
}

/// Periodic sampler of CPU, memory, disk and interface usage.
pub struct Monitor {
    period: Duration,
    data_dir: PathBuf,
    sys_net: PathBuf,
    cgroup: Option<CgroupReader>,
    system: System,
    disks: Disks,
    networks: Networks,
    capacities: BTreeMap<String, f64>,
    last_percpu: Option<Vec<u64>>,
    last_sample: Instant,
    measures: Measures,
}

impl Monitor {
    /// `IS_CONTAINER` 有設定時改用 cgroup
    pub fn new(period: Duration, data_dir: impl Into<PathBuf>) -> Self {
        let cgroup = std::env::var_os("IS_CONTAINER").map(|_| CgroupReader::new(CGROUP_ROOT));
        Self::with_sources(period, data_dir, cgroup, SYS_CLASS_NET)
    }

    pub fn with_sources(
        period: Duration,
        data_dir: impl Into<PathBuf>,
        cgroup: Option<CgroupReader>,
        sys_net: impl Into<PathBuf>,
    ) -> Self {
        let mut monitor = Self {
            period,
            data_dir: data_dir.into(),
            sys_net: sys_net.into(),
            cgroup,
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            capacities: BTreeMap::new(),
            last_percpu: None,
            last_sample: Instant::now(),
            measures: Measures::default(),
        };
        monitor.sample_constants();
        monitor
    }

    pub fn measures(&self) -> &Measures {
        &self.measures
    }

    fn sample_constants(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let host_memory = self.system.total_memory() as f64;

        let mut cpu_count = self.system.cpus().len() as u32;
        let mut memory_total = host_memory;
        if let Some(cgroup) = &self.cgroup {
            match cgroup.cpu_usage_percpu() {
                Ok(percpu) if !percpu.is_empty() => {
                    cpu_count = percpu.len() as u32;
                    self.last_percpu = Some(percpu);
                }
                Ok(_) => tracing::error!("Empty Docker control group for CPU. Switching to sysinfo"),
                Err(e) => tracing::error!(
                    "Unable to read Docker control group for CPU ({}). Switching to sysinfo",
                    e
                ),
            }
            match cgroup.memory_limit() {
                Ok(limit) => memory_total = limit.min(host_memory),
                Err(e) => tracing::error!(
                    "Unable to read Docker control group for memory ({}). Switching to sysinfo",
                    e
                ),
            }
        }

        self.measures.cpu_count = cpu_count;
        self.measures.cpu_free = cpu_count as f64;
        self.measures.memory_total = memory_total / MEBI;
        self.measures.memory_free = self.system.available_memory() as f64 / MEBI;
        self.sample_disk();
        self.sample_interfaces(Duration::ZERO);
        self.last_sample = Instant::now();
    }

    /// Takes one sample of the variable measures.
    pub fn sample(&mut self) -> &Measures {
        let elapsed = self.last_sample.elapsed();
        self.last_sample = Instant::now();
        self.sample_host(elapsed);
        self.sample_disk();
        self.sample_interfaces(elapsed);
        &self.measures
    }

    fn sample_host(&mut self, elapsed: Duration) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let cpu_count = self.measures.cpu_count as f64;

        let cgroup_busy = self.cgroup.as_ref().and_then(|cgroup| {
            let now = cgroup.cpu_usage_percpu().ok()?;
            let busy = self
                .last_percpu
                .as_ref()
                .map(|before| cgroup_cpu_busy(before, &now, elapsed));
            self.last_percpu = Some(now);
            busy
        });
        let busy = cgroup_busy.unwrap_or_else(|| {
            self.system
                .cpus()
                .iter()
                .map(|cpu| f64::from(cpu.cpu_usage()) / 100.0)
                .sum()
        });
        self.measures.cpu_free = (cpu_count - busy).max(0.0);

        let cgroup_memory = self
            .cgroup
            .as_ref()
            .and_then(|cgroup| cgroup.memory_usage().ok())
            .map(|used| self.measures.memory_total - used / MEBI);
        self.measures.memory_free =
            cgroup_memory.unwrap_or_else(|| self.system.available_memory() as f64 / MEBI);
    }

    /// 資料目錄所在的檔案系統
    fn sample_disk(&mut self) {
        self.disks.refresh(true);
        let target = fs::canonicalize(&self.data_dir).unwrap_or_else(|_| self.data_dir.clone());
        let disk = self
            .disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());
        if let Some(disk) = disk {
            self.measures.disk_total = disk.total_space() as f64 / GIBI;
            self.measures.disk_free = disk.available_space() as f64 / GIBI;
        }
    }

    fn sample_interfaces(&mut self, elapsed: Duration) {
        self.networks.refresh(true);
        let mut interfaces = BTreeMap::new();
        for (name, data) in self.networks.list() {
            if name == LOOPBACK_IFACE {
                continue;
            }
            let capacity = match self.capacities.get(name) {
                Some(capacity) => *capacity,
                None => {
                    let capacity = self.read_capacity(name);
                    self.capacities.insert(name.clone(), capacity);
                    capacity
                }
            };
            interfaces.insert(
                name.clone(),
                InterfaceMeasures {
                    capacity,
                    bandwidth_up: free_bandwidth(capacity, data.transmitted(), elapsed),
                    bandwidth_down: free_bandwidth(capacity, data.received(), elapsed),
                    tx_packets: data.total_packets_transmitted(),
                    rx_packets: data.total_packets_received(),
                },
            );
        }
        // 消失的介面直接移除
        self.capacities.retain(|name, _| interfaces.contains_key(name));
        self.measures.interfaces = interfaces;
    }

    /// Capacity from `<data_dir>/caps/<iface>`, else the link speed (cached
    /// back into the caps file).
    fn read_capacity(&self, iface: &str) -> f64 {
        let caps_file = self.data_dir.join(CAPS_DIR).join(iface);
        match read_number(&caps_file) {
            Ok(capacity) => return capacity,
            Err(e) => tracing::debug!(
                "Couldn't read capacity for {} from {} ({}). Switching to link speed",
                iface,
                caps_file.display(),
                e
            ),
        }

        let speed = read_number(&self.sys_net.join(iface).join("speed"))
            .ok()
            .filter(|speed| *speed > 0.0)
            .unwrap_or(0.0);
        tracing::info!("Updating capacity in file {}", caps_file.display());
        let written = fs::create_dir_all(self.data_dir.join(CAPS_DIR))
            .and_then(|_| fs::write(&caps_file, speed.to_string()));
        if let Err(e) = written {
            tracing::warn!("Couldn't write {}: {}", caps_file.display(), e);
        }
        speed
    }

    /// Samples every period and publishes the measures until cancelled.
    pub fn spawn(mut self, cancel: CancellationToken) -> watch::Receiver<Measures> {
        let (tx, rx) = watch::channel(self.measures.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period.max(MIN_PERIOD));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let measures = self.sample().clone();
                        if tx.send(measures).is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Monitor stopped");
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_percpu_ignores_trailing_newline() {
        assert_eq!(parse_percpu("100 200 300 \n"), vec![100, 200, 300]);
        assert!(parse_percpu("\n").is_empty());
    }

    #[test]
    fn test_cgroup_cpu_busy() {
        let busy = cgroup_cpu_busy(&[0, 0], &[500_000_000, 250_000_000], Duration::from_secs(1));
        assert!((busy - 0.75).abs() < 1e-9);
        assert_eq!(cgroup_cpu_busy(&[10], &[20], Duration::ZERO), 0.0);
    }

    #[test]
    fn test_free_bandwidth_never_negative() {
        // 1 Mbit in 1s on a 10 Mbit/s link
        assert!((free_bandwidth(10.0, 125_000, Duration::from_secs(1)) - 9.0).abs() < 1e-9);
        assert_eq!(free_bandwidth(1.0, 10_000_000, Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_cgroup_reader() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("cpu")).unwrap();
        fs::create_dir_all(root.path().join("memory")).unwrap();
        fs::write(root.path().join("cpu/cpuacct.usage_percpu"), "10 20 \n").unwrap();
        fs::write(root.path().join("memory/memory.limit_in_bytes"), "2147483648\n").unwrap();
        fs::write(root.path().join("memory/memory.usage_in_bytes"), "1073741824\n").unwrap();

        let reader = CgroupReader::new(root.path());
        assert_eq!(reader.cpu_usage_percpu().unwrap(), vec![10, 20]);
        assert_eq!(reader.memory_limit().unwrap(), 2147483648.0);
        assert_eq!(reader.memory_usage().unwrap(), 1073741824.0);
    }

    #[test]
    fn test_container_monitor_uses_cgroup_counts() {
        let root = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("cpu")).unwrap();
        fs::create_dir_all(root.path().join("memory")).unwrap();
        fs::write(root.path().join("cpu/cpuacct.usage_percpu"), "0 0 0\n").unwrap();
        fs::write(root.path().join("memory/memory.limit_in_bytes"), "1048576").unwrap();
        fs::write(root.path().join("memory/memory.usage_in_bytes"), "524288").unwrap();

        let mut monitor = Monitor::with_sources(
            Duration::from_millis(10),
            data.path(),
            Some(CgroupReader::new(root.path())),
            data.path().join("no-sys"),
        );
        assert_eq!(monitor.measures().cpu_count, 3);
        assert_eq!(monitor.measures().memory_total, 1.0);

        let measures = monitor.sample();
        assert_eq!(measures.cpu_free, 3.0);
        assert_eq!(measures.memory_free, 0.5);
        assert!(!measures.interfaces.contains_key(LOOPBACK_IFACE));
    }

    #[test]
    fn test_capacity_is_cached_in_caps_dir() {
        let data = TempDir::new().unwrap();
        let sys_net = TempDir::new().unwrap();
        fs::create_dir_all(sys_net.path().join("eth9")).unwrap();
        fs::write(sys_net.path().join("eth9/speed"), "1000\n").unwrap();

        let monitor = Monitor::with_sources(Duration::from_secs(1), data.path(), None, sys_net.path());
        assert_eq!(monitor.read_capacity("eth9"), 1000.0);
        let cached = fs::read_to_string(data.path().join("caps/eth9")).unwrap();
        assert_eq!(cached, "1000");

        fs::write(data.path().join("caps/eth9"), "42.5").unwrap();
        assert_eq!(monitor.read_capacity("eth9"), 42.5);
        assert_eq!(monitor.read_capacity("missing0"), 0.0);
    }
}
