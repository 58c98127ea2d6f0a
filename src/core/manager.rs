//! Joining and leaving the orchestrated topology.
//!
//! The manager fetches the remote configuration, builds the node model,
//! registers it and keeps it alive with a UDP heartbeat and periodic spec
//! updates until [`Manager::disconnect`].

use crate::adapters::net::{self, Ipv4Cidr};
use crate::config::remote::RemoteSettings;
use crate::core::simulator::{DeclaredCapacity, ResourceManager, SimulatorSettings};
use crate::domain::model::{Interface, Mode, Node, NodeType};
use crate::domain::ports::OrchestratorApi;
use crate::utils::error::{FogError, Result};
use crate::utils::monitor::{Measures, Monitor, MIN_PERIOD};
use crate::utils::validation::validate_hex;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// HTTP status the orchestrator answers when the node already exists.
pub const HTTP_EXISTS: u16 = 303;

#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub id: Option<String>,
    pub label: Option<String>,
    pub dpid: Option<String>,
}

/// What a connected node runs with.
pub struct Session {
    pub settings: RemoteSettings,
    pub resources: Arc<ResourceManager>,
    pub measures: watch::Receiver<Measures>,
    /// IP and MAC of the main interface.
    pub my_ip: IpAddr,
    pub my_mac: String,
}

pub struct Manager {
    api: Arc<dyn OrchestratorApi>,
    server: SocketAddr,
    mode: Mode,
    data_dir: PathBuf,
    retry_interval: Duration,
    node: Option<Node>,
    connected: bool,
    tasks_started: bool,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Manager {
    pub fn new(
        api: Arc<dyn OrchestratorApi>,
        server: SocketAddr,
        mode: Mode,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            server,
            mode,
            data_dir: data_dir.into(),
            retry_interval: Duration::from_secs(1),
            node: None,
            connected: false,
            tasks_started: false,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// 輪詢間隔 (測試用)
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the monitor and the background tasks are still running.
    pub fn is_running(&self) -> bool {
        self.tasks_started && !self.cancel.is_cancelled()
    }

    /// Polls `GET /config` until the orchestrator answers with settings.
    pub async fn fetch_config(&self) -> RemoteSettings {
        loop {
            tracing::debug!("Getting configuration");
            let reply = self.api.get_config().await;
            if let Some(config) = reply.config {
                tracing::debug!("Configuration received ({} parameters)", config.len());
                return RemoteSettings::from_map(&config);
            }
            tracing::debug!(
                "Configuration not available ({:?}): {}",
                reply.code,
                reply.message
            );
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Joins the topology. Loops until the node is added; an orchestrator
    /// that already knows the node is an error.
    ///
    /// On error every task started so far is stopped.
    pub async fn connect(&mut self, options: &NodeOptions, declared: DeclaredCapacity) -> Result<Session> {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let settings = self.fetch_config().await;

        self.tasks_started = true;
        let measures = Monitor::new(settings.monitor_period, &self.data_dir).spawn(self.cancel.clone());
        match self.join(options, declared, settings, measures).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.cancel.cancel();
                for task in self.tasks.drain(..) {
                    let _ = task.await;
                }
                Err(e)
            }
        }
    }

    async fn join(
        &mut self,
        options: &NodeOptions,
        declared: DeclaredCapacity,
        settings: RemoteSettings,
        measures: watch::Receiver<Measures>,
    ) -> Result<Session> {
        let simulator = SimulatorSettings::from_remote(&settings, self.mode == Mode::Resource, declared)?;
        let resources = Arc::new(ResourceManager::new(simulator, measures.clone())?);

        let interfaces = net::discover_interfaces();
        let main_iface = net::main_interface(&interfaces, settings.network, net::primary_ip());
        let node = build_node(
            self.mode,
            options,
            interfaces,
            main_iface,
            settings.threshold(),
        )?;
        tracing::debug!("Node built: {} ({:?})", node.id, node.node_type);

        let (my_ip, my_mac) = main_address(&node);

        if self.mode != Mode::Switch {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let reply = self.api.add_node(&node).await;
                if reply.code == Some(HTTP_EXISTS) {
                    return Err(FogError::AlreadyConnected { id: node.id.clone() });
                }
                if reply.ok {
                    break;
                }
                tracing::debug!("Connecting ({:?}), attempt {}", reply.code, attempt);
                tokio::time::sleep(self.retry_interval).await;
            }
            tracing::info!("Node added successfully");
            self.tasks.push(spawn_heartbeat(
                node.id.clone(),
                SocketAddr::new(self.server.ip(), settings.udp_port),
                settings.udp_timeout / 2,
                self.cancel.clone(),
            ));
        }

        self.tasks.push(spawn_spec_updater(
            self.api.clone(),
            self.mode,
            node.clone(),
            resources.clone(),
            measures.clone(),
            settings.monitor_period,
            self.cancel.clone(),
        ));

        self.node = Some(node);
        self.connected = true;

        Ok(Session {
            settings,
            resources,
            measures,
            my_ip,
            my_mac,
        })
    }

    /// Leaves the topology. Returns true when the orchestrator deleted the
    /// node (switches are never deleted).
    pub async fn disconnect(&mut self) -> bool {
        tracing::debug!("Disconnecting");
        self.connected = false;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        if self.mode == Mode::Switch {
            return true;
        }
        let Some(node) = &self.node else {
            return false;
        };
        let reply = self.api.delete_node(node).await;
        if reply.ok {
            tracing::info!("Node deleted successfully");
        } else {
            tracing::warn!("Node not deleted ({:?}): {}", reply.code, reply.message);
        }
        reply.ok
    }
}

/// Builds the node model from the discovered interfaces.
pub fn build_node(
    mode: Mode,
    options: &NodeOptions,
    interfaces: Vec<(Interface, Option<Ipv4Cidr>)>,
    main_iface: Option<String>,
    threshold: f64,
) -> Result<Node> {
    let mut node = match mode {
        Mode::Switch => {
            let dpid = options.dpid.as_deref().ok_or_else(|| FogError::MissingConfigError {
                field: "dpid".to_string(),
            })?;
            validate_hex("dpid", dpid)?;
            Node::new(dpid, NodeType::Switch, "")
        }
        Mode::Client | Mode::Resource => {
            let id = match options.id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => id.to_string(),
                None => default_id(&interfaces, main_iface.as_deref())
                    .ok_or_else(|| FogError::config("Unable to find a MAC address to use as node ID"))?,
            };
            let label = match options.label.as_deref().filter(|label| !label.is_empty()) {
                Some(label) => label.to_string(),
                None => net::hostname(),
            };
            Node::new(id, NodeType::Server, label)
        }
    };

    node.main_interface = main_iface;
    if mode == Mode::Resource {
        node.threshold = threshold;
    }
    for (iface, _) in interfaces {
        node.interfaces.insert(iface.name.clone(), iface);
    }
    Ok(node)
}

/// MAC of the main interface, else the first one found.
fn default_id(interfaces: &[(Interface, Option<Ipv4Cidr>)], main_iface: Option<&str>) -> Option<String> {
    let main = main_iface.and_then(|name| {
        interfaces
            .iter()
            .find(|(iface, _)| iface.name == name)
            .and_then(|(iface, _)| iface.mac.clone())
    });
    main.or_else(|| interfaces.iter().find_map(|(iface, _)| iface.mac.clone()))
}

fn main_address(node: &Node) -> (IpAddr, String) {
    let main = node
        .main_interface
        .as_ref()
        .and_then(|name| node.interfaces.get(name));
    let ip = main
        .and_then(|iface| iface.ipv4.as_deref())
        .and_then(|ip| ip.parse().ok())
        .unwrap_or_else(net::primary_ip);
    let mac = main
        .and_then(|iface| iface.mac.clone())
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    (ip, mac)
}

/// Sends the node id to the orchestrator's UDP port every `period`.
fn spawn_heartbeat(
    id: String,
    target: SocketAddr,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("Unable to open heartbeat socket: {}", e);
                return;
            }
        };
        let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(id.as_bytes(), target).await {
                        tracing::debug!("Heartbeat to {} failed: {}", target, e);
                    }
                }
            }
        }
        tracing::debug!("Heartbeat stopped");
    })
}

/// Pushes node and interface specs every `period`. A failed push re-adds
/// client and resource nodes in case the orchestrator lost them.
fn spawn_spec_updater(
    api: Arc<dyn OrchestratorApi>,
    mode: Mode,
    mut node: Node,
    resources: Arc<ResourceManager>,
    measures: watch::Receiver<Measures>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    if mode == Mode::Resource {
        let totals = resources.totals();
        node.set_totals(totals.cpu as u32, totals.ram, totals.disk);
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if mode == Mode::Resource {
                let free = resources.get_resources();
                node.set_free(free.cpu, free.ram, free.disk);
            }
            {
                let current = measures.borrow();
                for (name, iface) in node.interfaces.iter_mut() {
                    let m = current.interfaces.get(name).cloned().unwrap_or_default();
                    iface.update_specs(
                        m.capacity,
                        m.bandwidth_up,
                        m.bandwidth_down,
                        m.tx_packets,
                        m.rx_packets,
                    );
                }
            }

            let reply = api.update_node_specs(&node).await;
            if reply.ok {
                if mode == Mode::Resource {
                    tracing::trace!("Node specs are being sent");
                } else {
                    tracing::trace!("Network specs are being sent");
                }
            } else {
                tracing::debug!("Specs are not being sent ({:?})", reply.code);
                if mode != Mode::Switch {
                    api.add_node(&node).await;
                }
            }
        }
        tracing::debug!("Spec updater stopped");
    })
}
