//! Bookkeeping of the resources this node offers to others.
//!
//! Free resources are either the simulated capacities (when the simulator is
//! active) or the measured free resources, minus what is currently reserved
//! for hosted requests.

use crate::config::remote::RemoteSettings;
use crate::domain::model::CoS;
use crate::utils::error::{FogError, Result};
use crate::utils::monitor::Measures;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

pub const RESULT: &[u8] = b"result";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Capacity {
    pub cpu: f64,
    /// MB
    pub ram: f64,
    /// GB
    pub disk: f64,
}

impl Capacity {
    pub fn new(cpu: f64, ram: f64, disk: f64) -> Self {
        Self { cpu, ram, disk }
    }

    fn of(cos: &CoS) -> Self {
        Self::new(cos.specs.min_cpu, cos.specs.min_ram, cos.specs.min_disk)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub is_resource: bool,
    /// Capacities declared on the command line, used when the simulator is on.
    pub simulated: Option<Capacity>,
    /// Max usage in percent.
    pub limit: f64,
    pub exec_min: f64,
    pub exec_max: f64,
}

/// Capacities declared on the command line for resource nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeclaredCapacity {
    pub cpu: Option<f64>,
    pub ram: Option<f64>,
    pub disk: Option<f64>,
}

impl SimulatorSettings {
    /// Resource nodes running the simulator must declare every capacity.
    pub fn from_remote(
        remote: &RemoteSettings,
        is_resource: bool,
        declared: DeclaredCapacity,
    ) -> Result<Self> {
        let simulated = if remote.simulator_active {
            let require = |value: Option<f64>, field: &str| -> Result<f64> {
                match value {
                    Some(v) if v >= 0.0 => Ok(v),
                    Some(v) => Err(FogError::InvalidConfigValueError {
                        field: field.to_string(),
                        value: v.to_string(),
                        reason: "must not be negative".to_string(),
                    }),
                    None if is_resource => Err(FogError::MissingConfigError {
                        field: field.to_string(),
                    }),
                    None => Ok(0.0),
                }
            };
            Some(Capacity::new(
                require(declared.cpu, "cpu")?,
                require(declared.ram, "ram")?,
                require(declared.disk, "disk")?,
            ))
        } else {
            None
        };

        Ok(Self {
            is_resource,
            simulated,
            limit: remote.resource_limit,
            exec_min: remote.exec_min,
            exec_max: remote.exec_max,
        })
    }
}

pub struct ResourceManager {
    settings: SimulatorSettings,
    measures: watch::Receiver<Measures>,
    totals: Capacity,
    thresholds: Capacity,
    reserved: Mutex<Capacity>,
}

impl ResourceManager {
    pub fn new(settings: SimulatorSettings, measures: watch::Receiver<Measures>) -> Result<Self> {
        let totals = if !settings.is_resource {
            Capacity::default()
        } else if let Some(simulated) = settings.simulated {
            simulated
        } else {
            let m = measures.borrow();
            Capacity::new(m.cpu_count as f64, m.memory_total, m.disk_total)
        };

        if settings.is_resource && !(0.0..=100.0).contains(&settings.limit) {
            return Err(FogError::InvalidConfigValueError {
                field: "RESOURCE_LIMIT".to_string(),
                value: settings.limit.to_string(),
                reason: "must be a percentage".to_string(),
            });
        }

        let threshold = 1.0 - settings.limit / 100.0;
        let thresholds = Capacity::new(
            totals.cpu * threshold,
            totals.ram * threshold,
            totals.disk * threshold,
        );

        Ok(Self {
            settings,
            measures,
            totals,
            thresholds,
            reserved: Mutex::new(Capacity::default()),
        })
    }

    pub fn is_resource(&self) -> bool {
        self.settings.is_resource
    }

    pub fn is_simulated(&self) -> bool {
        self.settings.simulated.is_some()
    }

    /// Capacities announced to the orchestrator.
    pub fn totals(&self) -> Capacity {
        self.totals
    }

    /// Fraction of capacity that can never be reserved.
    pub fn threshold(&self) -> f64 {
        1.0 - self.settings.limit / 100.0
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, Capacity> {
        // 毒化的鎖仍可使用，數值只是累加值
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn free_with(&self, reserved: &Capacity) -> Capacity {
        if !self.settings.is_resource {
            return Capacity::default();
        }
        match self.settings.simulated {
            Some(simulated) => Capacity::new(
                simulated.cpu - reserved.cpu,
                simulated.ram - reserved.ram,
                simulated.disk - reserved.disk,
            ),
            None => {
                let m = self.measures.borrow();
                Capacity::new(
                    m.cpu_free - reserved.cpu,
                    m.memory_free - reserved.ram,
                    m.disk_free - reserved.disk,
                )
            }
        }
    }

    fn fits(&self, free: &Capacity, need: &Capacity) -> bool {
        free.cpu - need.cpu >= self.thresholds.cpu
            && free.ram - need.ram >= self.thresholds.ram
            && free.disk - need.disk >= self.thresholds.disk
    }

    /// Free CPU, RAM (MB) and disk (GB).
    pub fn get_resources(&self) -> Capacity {
        let reserved = self.reserved();
        self.free_with(&reserved)
    }

    pub fn check_resources(&self, cos: &CoS, quiet: bool) -> bool {
        let need = Capacity::of(cos);
        let reserved = self.reserved();
        let free = self.free_with(&reserved);
        if !quiet {
            tracing::info!(
                "required(cpu={}, ram={:.2}MB, disk={:.2}GB)",
                need.cpu,
                need.ram,
                need.disk
            );
            tracing::info!(
                "current(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
                free.cpu,
                free.ram,
                free.disk
            );
        }
        self.fits(&free, &need)
    }

    /// Checks and reserves atomically. Returns false when it would exceed
    /// the limit.
    pub fn reserve_resources(&self, cos: &CoS) -> bool {
        let need = Capacity::of(cos);
        let mut reserved = self.reserved();
        let free = self.free_with(&reserved);
        tracing::info!(
            "required(cpu={}, ram={:.2}MB, disk={:.2}GB)",
            need.cpu,
            need.ram,
            need.disk
        );
        if !self.fits(&free, &need) {
            return false;
        }
        reserved.cpu += need.cpu;
        reserved.ram += need.ram;
        reserved.disk += need.disk;
        let free = self.free_with(&reserved);
        tracing::info!(
            "current(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
            free.cpu,
            free.ram,
            free.disk
        );
        true
    }

    pub fn free_resources(&self, cos: &CoS) {
        let need = Capacity::of(cos);
        let mut reserved = self.reserved();
        reserved.cpu = (reserved.cpu - need.cpu).max(0.0);
        reserved.ram = (reserved.ram - need.ram).max(0.0);
        reserved.disk = (reserved.disk - need.disk).max(0.0);
        let free = self.free_with(&reserved);
        tracing::info!(
            "current(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
            free.cpu,
            free.ram,
            free.disk
        );
    }

    /// Simulated execution: sleeps a random time in [exec_min, exec_max].
    pub async fn execute(&self, _data: &[u8]) -> Vec<u8> {
        let (min, max) = (self.settings.exec_min, self.settings.exec_max);
        let secs = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(Duration::try_from_secs_f64(secs).unwrap_or_default()).await;
        RESULT.to_vec()
    }

    /// Capacities summary printed when the interactive sender starts.
    pub fn report(&self) -> String {
        let mut out = String::from("\nHost's real capacities\n");
        if self.is_simulated() {
            out.push_str("Simulation is active, so real monitoring is unavailable\n");
        } else {
            let m = self.measures.borrow();
            out.push_str(&format!(
                "    CPU COUNT  = {} ({:.2}%)\n    CPU FREE   = {:.2} ({:.2}%)\n    \
                 RAM TOTAL  = {:.2} MB\n    RAM FREE   = {:.2} MB\n    \
                 DISK TOTAL = {:.2} GB\n    DISK FREE  = {:.2} GB\n",
                m.cpu_count,
                m.cpu_count as f64 * 100.0,
                m.cpu_free,
                m.cpu_free * 100.0,
                m.memory_total,
                m.memory_free,
                m.disk_total,
                m.disk_free
            ));
        }
        out.push('\n');
        if self.is_resource() {
            let free = self.get_resources();
            out.push_str(&format!(
                "Available for reservation\n    CPU  = {:.2} ({:.2}%)\n    RAM  = {:.2} MB\n    \
                 DISK = {:.2} GB\n(with an overall usage limit of {:.2}%)\n",
                free.cpu,
                free.cpu * 100.0,
                free.ram,
                free.disk,
                self.settings.limit
            ));
        } else {
            out.push_str("No resources to offer in this mode\n");
        }
        out
    }
}
