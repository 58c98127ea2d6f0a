//! Host selection protocol between fog nodes.
//!
//! A [`ProtocolNode`] owns the UDP socket. One receive loop decodes every
//! datagram, hands it to the waiters of in-flight exchanges and to the
//! responder of the active flavor, which may answer right away or spawn a
//! longer exchange.

pub mod broadcast;
pub mod orchestrator;
pub mod packet;

pub use packet::{Flavor, Packet};

use crate::config::remote::{DecoyController, RemoteSettings, SendTo};
use crate::core::simulator::ResourceManager;
use crate::domain::cos::CosCatalog;
use crate::domain::model::{CoS, Request, State};
use crate::domain::ports::RequestRecorder;
use crate::utils::error::{FogError, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub flavor: Flavor,
    pub timeout: Duration,
    pub retries: u32,
    pub verbose: bool,
    /// Where host requests go in BROADCAST mode.
    pub broadcast: SocketAddr,
    /// Port hosts named only by IP are reached at.
    pub protocol_port: u16,
    pub decoy: Option<DecoyController>,
    pub my_ip: IpAddr,
    pub my_mac: String,
}

impl ProtocolSettings {
    pub fn from_remote(remote: &RemoteSettings, my_ip: IpAddr, my_mac: impl Into<String>) -> Result<Self> {
        let flavor = match remote.send_to {
            SendTo::Broadcast => Flavor::Broadcast,
            SendTo::Orchestrator => Flavor::Orchestrator,
            SendTo::None => return Err(FogError::ProtocolDisabled),
        };
        if flavor == Flavor::Orchestrator {
            remote.decoy()?;
        }
        Ok(Self {
            flavor,
            timeout: remote.protocol_timeout,
            retries: remote.protocol_retries,
            verbose: remote.protocol_verbose,
            broadcast: remote.broadcast_addr(),
            protocol_port: remote.protocol_port,
            decoy: remote.decoy.clone(),
            my_ip,
            my_mac: my_mac.into(),
        })
    }

    fn decoy_addr(&self) -> Option<SocketAddr> {
        self.decoy.as_ref().map(|decoy| decoy.addr)
    }
}

/// Everything a node needs besides its socket.
pub struct ProtocolContext {
    pub settings: ProtocolSettings,
    pub catalog: CosCatalog,
    pub resources: Arc<ResourceManager>,
    pub recorder: Option<Arc<dyn RequestRecorder>>,
    /// IDs already used by earlier runs.
    pub known_ids: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct Incoming {
    pub packet: Packet,
    pub src: SocketAddr,
}

struct Waiter {
    filter: Box<dyn Fn(&Incoming) -> bool + Send>,
    tx: Option<oneshot::Sender<Incoming>>,
}

/// Provider side record of a request from another node.
#[derive(Debug, Clone)]
pub(crate) struct Hosted {
    pub cos: CoS,
    pub state: State,
    pub result: Option<Vec<u8>>,
    pub executing: bool,
    pub freed: bool,
}

impl Hosted {
    fn new(cos: CoS, state: State) -> Self {
        Self {
            cos,
            state,
            result: None,
            executing: false,
            freed: true,
        }
    }
}

pub(crate) type HostedKey = (IpAddr, String);

/// One-shot flags a task can wait on; arming replaces any previous flag.
struct Events<K> {
    inner: std::sync::Mutex<HashMap<K, Arc<Notify>>>,
}

impl<K: Eq + Hash> Events<K> {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn arm(&self, key: K) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, notify.clone());
        notify
    }

    fn set(&self, key: &K) {
        if let Some(notify) = self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            notify.notify_one();
        }
    }
}

async fn wait_event(notify: &Notify, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, notify.notified()).await.is_ok()
}

pub struct ProtocolNode {
    socket: UdpSocket,
    local: SocketAddr,
    settings: ProtocolSettings,
    catalog: CosCatalog,
    resources: Arc<ResourceManager>,
    recorder: Option<Arc<dyn RequestRecorder>>,
    known_ids: HashSet<String>,
    waiters: std::sync::Mutex<Vec<Waiter>>,
    requests: Mutex<HashMap<String, Request>>,
    hosted: Mutex<HashMap<HostedKey, Hosted>>,
    consumer_events: Events<String>,
    provider_events: Events<HostedKey>,
    cancel: CancellationToken,
}

impl ProtocolNode {
    /// Binds the socket and starts the receive loop.
    pub async fn start(bind: SocketAddr, ctx: ProtocolContext) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;

        let node = Arc::new(Self {
            socket,
            local,
            settings: ctx.settings,
            catalog: ctx.catalog,
            resources: ctx.resources,
            recorder: ctx.recorder,
            known_ids: ctx.known_ids,
            waiters: std::sync::Mutex::new(Vec::new()),
            requests: Mutex::new(HashMap::new()),
            hosted: Mutex::new(HashMap::new()),
            consumer_events: Events::new(),
            provider_events: Events::new(),
            cancel: CancellationToken::new(),
        });

        tracing::info!(
            "Protocol ({:?}) listening on {}",
            node.settings.flavor,
            node.local
        );
        tokio::spawn(node.clone().run());
        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn flavor(&self) -> Flavor {
        self.settings.flavor
    }

    pub fn catalog(&self) -> &CosCatalog {
        &self.catalog
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Requests hosting of an application of CoS `cos_id` with `data` as
    /// input. Returns the result, or None when no host delivered one.
    pub async fn send_request(self: &Arc<Self>, cos_id: u32, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let cos = self.catalog.get(cos_id)?.clone();
        let req_id = {
            let mut requests = self.requests.lock().await;
            let req_id = self.generate_request_id(&requests);
            requests.insert(req_id.clone(), Request::new(req_id.clone(), cos.clone(), data.clone()));
            req_id
        };

        let result = match self.settings.flavor {
            Flavor::Broadcast => broadcast::send_request(self, &req_id, &cos, data).await,
            Flavor::Orchestrator => orchestrator::send_request(self, &req_id, &cos, data).await,
        };
        Ok(result)
    }

    /// Snapshot of a request sent by this node.
    pub async fn request(&self, req_id: &str) -> Option<Request> {
        self.requests.lock().await.get(req_id).cloned()
    }

    pub async fn requests(&self) -> Vec<Request> {
        self.requests.lock().await.values().cloned().collect()
    }

    /// State of a request this node hosts for `src`.
    pub async fn hosted_state(&self, src: IpAddr, req_id: &str) -> Option<State> {
        self.hosted
            .lock()
            .await
            .get(&(src, req_id.to_string()))
            .map(|hosted| hosted.state)
    }

    fn generate_request_id(&self, requests: &HashMap<String, Request>) -> String {
        let mut rng = rand::rng();
        loop {
            let id: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(packet::REQ_ID_LEN)
                .map(char::from)
                .collect();
            if !requests.contains_key(&id) && !self.known_ids.contains(&id) {
                return id;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Receive failed: {}", e);
                    continue;
                }
            };
            let packet = match Packet::decode(&buf[..len], self.settings.flavor) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!("Ignoring datagram from {}: {}", src, e);
                    continue;
                }
            };
            if self.ignores(src, &packet) {
                continue;
            }

            let incoming = Incoming { packet, src };
            self.deliver(&incoming);
            let reply = match self.settings.flavor {
                Flavor::Broadcast => broadcast::respond(&self, &incoming).await,
                Flavor::Orchestrator => orchestrator::respond(&self, &incoming).await,
            };
            if let Some((reply, dst)) = reply {
                self.send(&reply, dst).await;
            }
        }
        tracing::debug!("Protocol receive loop stopped");
    }

    /// 自己送出的、來源不明的或沒有 ID 的封包
    fn ignores(&self, src: SocketAddr, packet: &Packet) -> bool {
        src == self.local
            || (src.ip() == self.settings.my_ip && src.port() == self.local.port())
            || src.ip().is_unspecified()
            || packet.req_id.is_empty()
    }

    /// Every waiter whose filter matches gets a copy.
    fn deliver(&self, incoming: &Incoming) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        for waiter in waiters.iter_mut() {
            if (waiter.filter)(incoming) {
                if let Some(tx) = waiter.tx.take() {
                    let _ = tx.send(incoming.clone());
                }
            }
        }
        waiters.retain(|waiter| waiter.tx.as_ref().is_some_and(|tx| !tx.is_closed()));
    }

    fn register(&self, filter: impl Fn(&Incoming) -> bool + Send + 'static) -> oneshot::Receiver<Incoming> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Waiter {
                filter: Box::new(filter),
                tx: Some(tx),
            });
        rx
    }

    async fn wait(rx: oneshot::Receiver<Incoming>, timeout: Duration) -> Option<Incoming> {
        tokio::time::timeout(timeout, rx).await.ok()?.ok()
    }

    pub(crate) async fn send(&self, packet: &Packet, dst: SocketAddr) {
        let raw = packet.encode(self.settings.flavor);
        if let Err(e) = self.socket.send_to(&raw, dst).await {
            tracing::warn!("Sending {} to {} failed: {}", packet.state.describe(), dst, e);
        }
    }

    /// Sends `packet` and waits for the first packet answering it.
    pub(crate) async fn send_and_wait(
        &self,
        packet: &Packet,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Option<Incoming> {
        let sent = packet.clone();
        let flavor = self.settings.flavor;
        let rx = self.register(move |incoming| incoming.packet.answers(&sent, flavor));
        self.send(packet, dst).await;
        Self::wait(rx, timeout).await
    }

    /// Waits for the first received packet matching `filter`.
    pub(crate) async fn wait_for(
        &self,
        timeout: Duration,
        filter: impl Fn(&Incoming) -> bool + Send + 'static,
    ) -> Option<Incoming> {
        let rx = self.register(filter);
        Self::wait(rx, timeout).await
    }

    pub(crate) fn show(&self, incoming: &Incoming) {
        if self.settings.verbose {
            tracing::info!("{} from {}: {:?}", incoming.packet.state.describe(), incoming.src, incoming.packet);
        }
    }

    /// Runs `f` on a request sent by this node (default when unknown).
    pub(crate) async fn with_request<R: Default>(&self, req_id: &str, f: impl FnOnce(&mut Request) -> R) -> R {
        self.requests
            .lock()
            .await
            .get_mut(req_id)
            .map(f)
            .unwrap_or_default()
    }

    pub(crate) async fn is_done(&self, req_id: &str) -> bool {
        self.with_request(req_id, |req| req.is_done()).await
    }

    pub(crate) async fn log_request(&self, req_id: &str) {
        if let Some(req) = self.request(req_id).await {
            tracing::info!("{}", req);
        }
    }

    pub(crate) async fn with_hosted<R: Default>(&self, key: &HostedKey, f: impl FnOnce(&mut Hosted) -> R) -> R {
        self.hosted.lock().await.get_mut(key).map(f).unwrap_or_default()
    }

    pub(crate) async fn hosted_state_of(&self, key: &HostedKey) -> Option<State> {
        self.with_hosted(key, |hosted| Some(hosted.state)).await
    }

    /// Frees the resources of a hosted request unless already freed.
    pub(crate) async fn release(&self, key: &HostedKey) {
        let mut hosted = self.hosted.lock().await;
        if let Some(entry) = hosted.get_mut(key) {
            if !entry.freed {
                tracing::info!("Freeing resources");
                self.resources.free_resources(&entry.cos);
                entry.freed = true;
            }
        }
    }

    /// Finishes the request: FAIL when no result arrived, then saves it in
    /// the background.
    pub(crate) async fn conclude(&self, req_id: &str) -> Option<Vec<u8>> {
        let req = {
            let mut requests = self.requests.lock().await;
            let req = requests.get_mut(req_id)?;
            if !req.is_done() {
                req.state = Some(State::Fail);
            }
            req.clone()
        };
        tracing::info!("{}", req);
        let result = if req.is_done() { req.result.clone() } else { None };
        self.save(req);
        result
    }

    fn save(&self, req: Request) {
        if let Some(recorder) = self.recorder.clone() {
            tokio::spawn(async move {
                if let Err(e) = recorder.save(&req).await {
                    tracing::error!("Saving {} failed: {}", req.id, e);
                }
            });
        }
    }
}
