//! Cancellation, wait and late-response branches of the protocol, driven by
//! scripted peers on raw sockets.

use fog_client::config::remote::DecoyController;
use fog_client::core::protocol::{Flavor, Packet, ProtocolContext, ProtocolNode, ProtocolSettings};
use fog_client::core::simulator::{Capacity, ResourceManager, SimulatorSettings};
use fog_client::domain::model::State;
use fog_client::utils::monitor::Measures;
use fog_client::CosCatalog;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CONSUMER_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const PROVIDER_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
const CONTROLLER_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 3);
const TIMEOUT: Duration = Duration::from_millis(200);
const NOW: Duration = Duration::ZERO;

fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind((PROVIDER_IP, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

fn resources(is_resource: bool) -> Arc<ResourceManager> {
    let (_tx, rx) = watch::channel(Measures::default());
    Arc::new(
        ResourceManager::new(
            SimulatorSettings {
                is_resource,
                simulated: Some(Capacity::new(4.0, 4096.0, 100.0)),
                limit: 100.0,
                exec_min: 0.0,
                exec_max: 0.0,
            },
            rx,
        )
        .unwrap(),
    )
}

fn settings(flavor: Flavor, my_ip: Ipv4Addr, port: u16) -> ProtocolSettings {
    ProtocolSettings {
        flavor,
        timeout: TIMEOUT,
        retries: 3,
        verbose: false,
        broadcast: SocketAddr::from((PROVIDER_IP, port)),
        protocol_port: port,
        decoy: match flavor {
            Flavor::Orchestrator => Some(DecoyController {
                mac: "00:00:00:00:00:fe".to_string(),
                addr: SocketAddr::from((CONTROLLER_IP, port)),
            }),
            Flavor::Broadcast => None,
        },
        my_ip: IpAddr::V4(my_ip),
        my_mac: format!("00:00:00:00:00:0{}", my_ip.octets()[3]),
    }
}

async fn start(settings: ProtocolSettings, bind: SocketAddr, resources: Arc<ResourceManager>) -> Arc<ProtocolNode> {
    ProtocolNode::start(
        bind,
        ProtocolContext {
            settings,
            catalog: CosCatalog::builtin(),
            resources,
            recorder: None,
            known_ids: HashSet::new(),
        },
    )
    .await
    .unwrap()
}

async fn consumer(flavor: Flavor, port: u16) -> Arc<ProtocolNode> {
    start(
        settings(flavor, CONSUMER_IP, port),
        SocketAddr::from((CONSUMER_IP, 0)),
        resources(false),
    )
    .await
}

type Log = Arc<Mutex<Vec<Packet>>>;

/// Answers each datagram with what `script` returns, every reply sent to
/// the sender after its own delay. Keeps everything it received.
async fn scripted_peer<F>(bind: SocketAddr, flavor: Flavor, mut script: F) -> (Log, JoinHandle<()>)
where
    F: FnMut(&Packet) -> Vec<(Duration, Packet)> + Send + 'static,
{
    let socket = Arc::new(UdpSocket::bind(bind).await.unwrap());
    let log: Log = Arc::default();
    let seen = log.clone();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(packet) = Packet::decode(&buf[..len], flavor) else {
                continue;
            };
            seen.lock().unwrap().push(packet.clone());
            for (delay, reply) in script(&packet) {
                let socket = socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&reply.encode(flavor), src).await;
                });
            }
        }
    });
    (log, task)
}

fn count(log: &Log, state: State) -> usize {
    log.lock().unwrap().iter().filter(|p| p.state == state).count()
}

fn hres(p: &Packet) -> Packet {
    p.reply(State::Hres).with_offer(4.0, 4096.0, 100.0)
}

fn dres(p: &Packet, data: &str) -> Packet {
    p.reply(State::Dres).with_data(data.as_bytes().to_vec())
}

async fn recv(socket: &UdpSocket, req_id: &str, state: State) -> Packet {
    let mut buf = vec![0u8; 65_535];
    loop {
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = Packet::decode(&buf[..len], Flavor::Broadcast).unwrap();
        if packet.req_id == req_id && packet.state == state {
            return packet;
        }
    }
}

async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_broadcast_rcan_starts_a_new_host_request() {
    let port = free_port();
    let mut rreqs = 0;
    let (log, peer) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Broadcast, move |p| {
        match p.state {
            State::Hreq => vec![(NOW, hres(p))],
            State::Rreq => {
                rreqs += 1;
                let state = if rreqs == 1 { State::Rcan } else { State::Rres };
                vec![(NOW, p.reply(state))]
            }
            State::Dreq => vec![(NOW, dres(p, "result"))],
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Broadcast, port).await;

    let result = consumer.send_request(2, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"result".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert_eq!(req.state, Some(State::Dres));
    assert_eq!(req.attempts.len(), 2);
    assert_eq!(req.attempts[&1].state, Some(State::Rcan));
    assert_eq!(req.attempts[&2].state, Some(State::Dres));
    assert!(!req.late);
    assert_eq!(count(&log, State::Hreq), 2);
    assert!(eventually(|| count(&log, State::Dack) >= 1).await);

    consumer.shutdown();
    peer.abort();
}

#[tokio::test]
async fn test_broadcast_dcan_starts_a_new_host_request() {
    let port = free_port();
    let (log, peer) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Broadcast, |p| {
        match p.state {
            State::Hreq => vec![(NOW, hres(p))],
            State::Rreq => vec![(NOW, p.reply(State::Rres))],
            State::Dreq if p.attempt_no == 1 => vec![(NOW, p.reply(State::Dcan))],
            State::Dreq => vec![(NOW, dres(p, "second try"))],
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Broadcast, port).await;

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"second try".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert_eq!(req.attempts.len(), 2);
    assert_eq!(req.attempts[&1].state, Some(State::Dcan));
    assert_eq!(req.attempts[&2].state, Some(State::Dres));
    // DCAN 時仍有重試次數，不算逾時
    assert!(!req.late);
    assert_eq!(count(&log, State::Dreq), 2);

    consumer.shutdown();
    peer.abort();
}

#[tokio::test]
async fn test_broadcast_dcan_on_last_retry_still_accepts_late_result() {
    let port = free_port();
    let mut dreqs = 0;
    let (log, peer) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Broadcast, move |p| {
        match p.state {
            State::Hreq if p.attempt_no == 1 => vec![(NOW, hres(p))],
            State::Rreq => vec![(NOW, p.reply(State::Rres))],
            State::Dreq => {
                dreqs += 1;
                if dreqs < 3 {
                    return vec![];
                }
                // cancels, then the result shows up anyway
                vec![
                    (NOW, p.reply(State::Dcan)),
                    (Duration::from_millis(100), dres(p, "late result")),
                ]
            }
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Broadcast, port).await;
    let provider = SocketAddr::from((PROVIDER_IP, port));

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"late result".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert!(req.late);
    assert_eq!(req.state, Some(State::Dres));
    assert_eq!(req.host, Some(provider));
    assert_eq!(req.attempts.len(), 2);
    assert_eq!(req.attempts[&1].state, Some(State::Dres));
    assert_eq!(req.attempts[&2].state, Some(State::Hreq));
    assert_eq!(count(&log, State::Dreq), 3);
    assert!(eventually(|| count(&log, State::Dack) >= 1).await);

    consumer.shutdown();
    peer.abort();
}

#[tokio::test]
async fn test_broadcast_dwait_renews_data_retries() {
    let port = free_port();
    let mut dreqs = 0;
    let (log, peer) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Broadcast, move |p| {
        match p.state {
            State::Hreq => vec![(NOW, hres(p))],
            State::Rreq => vec![(NOW, p.reply(State::Rres))],
            State::Dreq => {
                dreqs += 1;
                // more DWAITs than retries
                if dreqs <= 4 {
                    vec![(NOW, p.reply(State::Dwait))]
                } else {
                    vec![(NOW, dres(p, "done"))]
                }
            }
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Broadcast, port).await;

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"done".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert_eq!(req.attempts.len(), 1);
    assert!(!req.late);
    assert_eq!(count(&log, State::Hreq), 1);
    assert_eq!(count(&log, State::Dreq), 5);

    consumer.shutdown();
    peer.abort();
}

#[tokio::test]
async fn test_broadcast_answers_stale_responses_after_completion() {
    let port = free_port();
    let mut dacks = 0;
    let (log, peer) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Broadcast, move |p| {
        match p.state {
            State::Hreq => vec![(NOW, hres(p))],
            State::Rreq => vec![(NOW, p.reply(State::Rres))],
            State::Dreq => vec![(NOW, dres(p, "result"))],
            // the host repeats its DRES once after the first DACK
            State::Dack => {
                dacks += 1;
                if dacks == 1 {
                    vec![(NOW, dres(p, "result"))]
                } else {
                    vec![]
                }
            }
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Broadcast, port).await;

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"result".to_vec()));
    let req_id = consumer.requests().await.remove(0).id;

    // same host: acknowledged again
    assert!(eventually(|| count(&log, State::Dack) >= 2).await);

    let other = UdpSocket::bind((CONTROLLER_IP, 0)).await.unwrap();
    let to = consumer.local_addr();

    let rres = Packet::new(State::Rres, req_id.clone(), 1);
    other.send_to(&rres.encode(Flavor::Broadcast), to).await.unwrap();
    let answer = recv(&other, &req_id, State::Rcan).await;
    assert_eq!(answer.attempt_no, 1);

    let late = Packet::new(State::Dres, req_id.clone(), 1).with_data(b"other".to_vec());
    other.send_to(&late.encode(Flavor::Broadcast), to).await.unwrap();
    recv(&other, &req_id, State::Dcan).await;

    // the first result is kept
    let req = consumer.request(&req_id).await.unwrap();
    assert_eq!(req.result, Some(b"result".to_vec()));
    assert_eq!(req.host, Some(SocketAddr::from((PROVIDER_IP, port))));

    consumer.shutdown();
    peer.abort();
}

#[tokio::test]
async fn test_provider_frees_once_when_dcan_and_dack_race() {
    let port = free_port();
    let provider_addr = SocketAddr::from((PROVIDER_IP, port));
    let rm = resources(true);
    let mut provider_settings = settings(Flavor::Broadcast, PROVIDER_IP, port);
    // 讓第二個保留在測試期間不會逾時
    provider_settings.timeout = Duration::from_secs(1);
    let provider = start(provider_settings, provider_addr, rm.clone()).await;

    let peer = UdpSocket::bind((CONSUMER_IP, 0)).await.unwrap();
    let send = |packet: Packet| {
        let peer = &peer;
        async move {
            peer.send_to(&packet.encode(Flavor::Broadcast), provider_addr).await.unwrap();
        }
    };

    // two cpu-bound requests, 2 cpu each, fill the 4 simulated cpus
    for id in ["race000001", "race000002"] {
        send(Packet::new(State::Hreq, id, 1).with_cos(2)).await;
        recv(&peer, id, State::Hres).await;
        send(Packet::new(State::Rreq, id, 1)).await;
        recv(&peer, id, State::Rres).await;
    }
    assert_eq!(rm.get_resources().cpu, 0.0);

    send(Packet::new(State::Dreq, "race000001", 1).with_data(b"data".to_vec())).await;
    let result = recv(&peer, "race000001", State::Dres).await;
    assert_eq!(&result.data[..], b"result");

    send(Packet::new(State::Dcan, "race000001", 1)).await;
    assert!(eventually(|| rm.get_resources().cpu == 2.0).await);

    // duplicates of the end of the exchange must not free the other reservation
    send(Packet::new(State::Dack, "race000001", 1)).await;
    send(Packet::new(State::Dcan, "race000001", 1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rm.get_resources(), Capacity::new(2.0, 4096.0 - 512.0, 99.0));
    assert_eq!(
        provider.hosted_state(IpAddr::V4(CONSUMER_IP), "race000001").await,
        Some(State::Dres)
    );
    assert_eq!(
        provider.hosted_state(IpAddr::V4(CONSUMER_IP), "race000002").await,
        Some(State::Rres)
    );

    provider.shutdown();
}

/// Controller that always points the consumer at the provider.
fn controller_script() -> impl FnMut(&Packet) -> Vec<(Duration, Packet)> + Send + 'static {
    |p: &Packet| match p.state {
        State::Hreq => vec![(
            NOW,
            p.reply(State::Hres)
                .with_host("00:00:00:00:00:02", PROVIDER_IP.to_string()),
        )],
        _ => vec![],
    }
}

#[tokio::test]
async fn test_orchestrator_dwait_waits_for_the_result() {
    let port = free_port();
    let (controller_log, controller) = scripted_peer(
        SocketAddr::from((CONTROLLER_IP, port)),
        Flavor::Orchestrator,
        controller_script(),
    )
    .await;
    let (provider_log, provider) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Orchestrator, |p| {
        match p.state {
            State::Dreq => vec![
                (NOW, p.reply(State::Dwait)),
                (Duration::from_millis(100), dres(p, "waited")),
            ],
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Orchestrator, port).await;

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"waited".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert_eq!(req.attempts.len(), 1);
    assert_eq!(req.host, Some(SocketAddr::from((PROVIDER_IP, port))));
    assert_eq!(count(&provider_log, State::Dreq), 1);

    // DACK goes to the controller with both endpoints filled in
    assert!(eventually(|| count(&controller_log, State::Dack) >= 1).await);
    let dack = controller_log
        .lock()
        .unwrap()
        .iter()
        .find(|p| p.state == State::Dack)
        .cloned()
        .unwrap();
    assert_eq!(dack.src_ip, CONSUMER_IP.to_string());
    assert_eq!(dack.host_ip, PROVIDER_IP.to_string());

    consumer.shutdown();
    controller.abort();
    provider.abort();
}

#[tokio::test]
async fn test_orchestrator_dcan_starts_a_new_host_request() {
    let port = free_port();
    let (controller_log, controller) = scripted_peer(
        SocketAddr::from((CONTROLLER_IP, port)),
        Flavor::Orchestrator,
        controller_script(),
    )
    .await;
    let (_provider_log, provider) = scripted_peer(SocketAddr::from((PROVIDER_IP, port)), Flavor::Orchestrator, |p| {
        match p.state {
            State::Dreq if p.attempt_no == 1 => vec![(NOW, p.reply(State::Dcan))],
            State::Dreq => vec![(NOW, dres(p, "second try"))],
            _ => vec![],
        }
    })
    .await;
    let consumer = consumer(Flavor::Orchestrator, port).await;

    let result = consumer.send_request(1, b"data".to_vec()).await.unwrap();
    assert_eq!(result, Some(b"second try".to_vec()));

    let req = consumer.requests().await.remove(0);
    assert_eq!(req.attempts.len(), 2);
    assert_eq!(req.attempts[&1].state, Some(State::Dcan));
    assert_eq!(req.attempts[&2].state, Some(State::Dres));
    assert!(!req.late);
    assert_eq!(count(&controller_log, State::Hreq), 2);

    consumer.shutdown();
    controller.abort();
    provider.abort();
}
