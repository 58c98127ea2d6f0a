//! ORCHESTRATOR mode: the controller (reached through its decoy address)
//! picks the host and relays reservations between nodes.

use super::{wait_event, HostedKey, Hosted, Incoming, Packet, ProtocolNode};
use crate::domain::model::{now_ts, CoS, State};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub(super) async fn send_request(
    node: &Arc<ProtocolNode>,
    req_id: &str,
    cos: &CoS,
    data: Vec<u8>,
) -> Option<Vec<u8>> {
    let Some(decoy) = node.settings.decoy_addr() else {
        tracing::error!("No decoy controller configured");
        return node.conclude(req_id).await;
    };
    let retries = node.settings.retries;
    let timeout = node.settings.timeout;
    let mut hreq_rt = retries;

    'hosts: while hreq_rt > 0 && !node.is_done(req_id).await {
        let attempt_no = node
            .with_request(req_id, |req| {
                req.host = None;
                req.state = Some(State::Hreq);
                let attempt_no = req.new_attempt();
                let now = now_ts();
                if let Some(attempt) = req.attempt_mut(attempt_no) {
                    attempt.state = Some(State::Hreq);
                    attempt.hreq_at = Some(now);
                }
                req.hreq_at.get_or_insert(now);
                attempt_no
            })
            .await;
        tracing::info!("Send host request to orchestrator");
        node.log_request(req_id).await;
        hreq_rt -= 1;

        let hreq = Packet::new(State::Hreq, req_id, attempt_no).with_cos(cos.id);
        let Some(hres) = node.send_and_wait(&hreq, decoy, timeout.saturating_mul(retries)).await else {
            if !node.is_done(req_id).await {
                tracing::info!("No hosts");
            }
            continue;
        };
        if node.is_done(req_id).await {
            break;
        }

        let host_ip = match hres.packet.host_ip.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::warn!("Host response carries an invalid host IP '{}'", hres.packet.host_ip);
                continue;
            }
        };
        let host = SocketAddr::new(host_ip, node.settings.protocol_port);
        let host_mac = hres.packet.host_mac.clone();
        node.with_request(req_id, |req| {
            req.state = Some(State::Dreq);
            req.host = Some(host);
            if let Some(attempt) = req.attempt_mut(attempt_no) {
                attempt.hres_at = Some(now_ts());
                attempt.state = Some(State::Dreq);
                attempt.host = Some(host);
            }
        })
        .await;
        tracing::info!("Recv host response from orchestrator");
        node.show(&hres);

        hreq_rt = retries;
        let mut dreq_rt = retries;
        while dreq_rt > 0 && !node.is_done(req_id).await {
            tracing::info!("Send data exchange request to {}", host);
            node.log_request(req_id).await;
            dreq_rt -= 1;

            let dreq = Packet::new(State::Dreq, req_id, attempt_no).with_data(data.clone());
            let Some(dres) = node.send_and_wait(&dreq, host, timeout).await else {
                if !node.is_done(req_id).await {
                    tracing::info!("No data");
                }
                continue;
            };
            if node.is_done(req_id).await {
                break;
            }

            if dres.packet.state == State::Dwait {
                dreq_rt = retries;
                tracing::info!("{} still executing", req_id);
                // 回應器收到 DRES 時會通知
                let notify = node.consumer_events.arm(req_id.to_string());
                if !wait_event(&notify, timeout).await {
                    continue;
                }
            }
            if dres.packet.state == State::Dcan {
                tracing::info!("Recv data exchange cancellation from {}", host);
                node.show(&dres);
                node.with_request(req_id, |req| {
                    if let Some(attempt) = req.attempt_mut(attempt_no) {
                        attempt.state = Some(State::Dcan);
                    }
                })
                .await;
                continue 'hosts;
            }

            let accepted = node
                .with_request(req_id, |req| {
                    if req.is_done() {
                        return false;
                    }
                    req.finish(attempt_no, host, dres.packet.data.to_vec());
                    true
                })
                .await;
            if accepted {
                tracing::info!("Recv data exchange response from {}", host);
                node.show(&dres);
                tracing::info!("Send data exchange acknowledgement to orchestrator");
                node.log_request(req_id).await;
                let dack = Packet::new(State::Dack, req_id, attempt_no)
                    .with_src(node.settings.my_mac.clone(), node.settings.my_ip.to_string())
                    .with_host(host_mac.clone(), host_ip.to_string());
                node.send(&dack, decoy).await;
            }
            return node.conclude(req_id).await;
        }

        if dreq_rt == 0 {
            node.with_request(req_id, |req| req.late = true).await;
        }
    }

    node.conclude(req_id).await
}

fn from_controller(node: &ProtocolNode, src: SocketAddr) -> bool {
    node.settings.decoy_addr() == Some(src)
}

/// Hosted requests relayed by the controller are keyed by the consumer's IP
/// carried in `src_ip`.
fn relayed_key(packet: &Packet) -> Option<HostedKey> {
    match packet.src_ip.parse::<IpAddr>() {
        Ok(ip) => Some((ip, packet.req_id.clone())),
        Err(_) => {
            tracing::warn!("Ignoring {} with invalid src_ip '{}'", packet.state.describe(), packet.src_ip);
            None
        }
    }
}

pub(super) async fn respond(node: &Arc<ProtocolNode>, incoming: &Incoming) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;

    match packet.state {
        State::Rreq if from_controller(node, src) => {
            on_reservation_request(node, incoming, relayed_key(packet)?).await
        }
        State::Dreq => on_data_request(node, incoming, (src.ip(), packet.req_id.clone())).await,
        State::Dres => on_data_response(node, incoming).await,
        State::Dack | State::Dcan if from_controller(node, src) => {
            let key = relayed_key(packet)?;
            if node.hosted_state_of(&key).await == Some(State::Dres) {
                if packet.state == State::Dack {
                    tracing::info!("Recv data exchange acknowledgement from orchestrator");
                } else {
                    tracing::info!("Recv data exchange cancellation from orchestrator");
                }
                node.show(incoming);
                node.provider_events.set(&key);
                node.release(&key).await;
            }
            None
        }
        _ => None,
    }
}

async fn on_reservation_request(
    node: &Arc<ProtocolNode>,
    incoming: &Incoming,
    key: HostedKey,
) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let controller = incoming.src;
    let state = {
        let mut hosted = node.hosted.lock().await;
        if !hosted.contains_key(&key) {
            let cos = match node.catalog.get(packet.cos_id) {
                Ok(cos) => cos.clone(),
                Err(e) => {
                    tracing::warn!("Reservation request ignored: {}", e);
                    return None;
                }
            };
            hosted.insert(key.clone(), Hosted::new(cos, State::Rreq));
        }
        let entry = hosted.get_mut(&key)?;
        if matches!(entry.state, State::Rreq | State::Rcan) {
            tracing::info!("Recv resource reservation request from orchestrator");
            node.show(incoming);
            tracing::info!("Reserving resources");
            if node.resources.reserve_resources(&entry.cos) {
                entry.state = State::Rres;
                entry.freed = false;
            } else {
                tracing::info!("Resources are not sufficient");
                tracing::info!("Send resource reservation cancellation to orchestrator");
                entry.state = State::Rreq;
                return Some((packet.reply(State::Rcan), controller));
            }
        }
        entry.state
    };
    if state == State::Rres {
        tokio::spawn(respond_resources(node.clone(), packet.clone(), controller, key));
    }
    None
}

/// Resends RRES until RACK or RCAN, then waits for the consumer's DREQ.
async fn respond_resources(node: Arc<ProtocolNode>, packet: Packet, controller: SocketAddr, key: HostedKey) {
    let rres = packet.reply(State::Rres);
    let timeout = node.settings.timeout;
    let retries = node.settings.retries;
    // DREQ 可能比 RACK 先到
    let dreq_seen = node.provider_events.arm(key.clone());

    let mut left = retries;
    let mut answer = None;
    while answer.is_none() && left > 0 && node.hosted_state_of(&key).await == Some(State::Rres) {
        tracing::info!("Send resource reservation response to orchestrator");
        left -= 1;
        answer = node.send_and_wait(&rres, controller, timeout).await;
    }

    match answer {
        Some(rcan) if rcan.packet.state == State::Rcan => {
            tracing::info!("Recv resource reservation cancellation from orchestrator");
            node.show(&rcan);
            if node.hosted_state_of(&key).await == Some(State::Rres) {
                node.with_hosted(&key, |hosted| hosted.state = State::Rcan).await;
                node.release(&key).await;
            }
        }
        Some(rack) => {
            tracing::info!("Recv resource reservation acknowledgement from orchestrator");
            node.show(&rack);
            if !wait_event(&dreq_seen, timeout.saturating_mul(retries)).await
                && node.hosted_state_of(&key).await == Some(State::Rres)
            {
                tracing::info!("Waiting for data exchange request timed out");
                node.release(&key).await;
                node.with_hosted(&key, |hosted| hosted.state = State::Rcan).await;
            }
        }
        None => {
            if node.hosted_state_of(&key).await == Some(State::Rres) {
                node.with_hosted(&key, |hosted| hosted.state = State::Rcan).await;
                tracing::info!("Waiting for resource reservation acknowledgement timed out");
                node.release(&key).await;
                tracing::info!("Send resource reservation cancellation to orchestrator");
                node.send(&packet.reply(State::Rcan), controller).await;
            }
        }
    }
}

async fn on_data_request(
    node: &Arc<ProtocolNode>,
    incoming: &Incoming,
    key: HostedKey,
) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;
    {
        let mut hosted = node.hosted.lock().await;
        let entry = hosted.get_mut(&key)?;
        node.provider_events.set(&key);
        if entry.state == State::Dres {
            let result = entry.result.clone().unwrap_or_default();
            return Some((packet.reply(State::Dres).with_data(result), src));
        }
        if entry.state == State::Dreq && entry.executing {
            return Some((packet.reply(State::Dwait), src));
        }
        tracing::info!("Recv data exchange request from {}", src);
        node.show(incoming);
        if entry.state == State::Rcan {
            tracing::info!("This request arrived late");
            if node.resources.reserve_resources(&entry.cos) {
                tracing::info!("but resources are still available");
                entry.state = State::Rres;
                entry.freed = false;
            } else {
                tracing::info!("and resources are no longer sufficient");
                tracing::info!("Send data exchange cancellation to {}", src);
                entry.state = State::Dcan;
                let dcan = packet
                    .reply(State::Dcan)
                    .with_src(String::new(), src.ip().to_string())
                    .with_host(node.settings.my_mac.clone(), node.settings.my_ip.to_string());
                return Some((dcan, src));
            }
        }
        if entry.state != State::Rres {
            return None;
        }
        entry.state = State::Dreq;
        entry.executing = true;
    }
    tokio::spawn(respond_data(node.clone(), packet.clone(), src, key));
    None
}

/// Executes, then sends DRES until the controller confirms (DACK/DCAN) or
/// the consumer asks again.
async fn respond_data(node: Arc<ProtocolNode>, packet: Packet, src: SocketAddr, key: HostedKey) {
    tracing::info!("Executing");
    let result = node.resources.execute(&packet.data).await;
    node.with_hosted(&key, |hosted| {
        hosted.result = Some(result.clone());
        hosted.state = State::Dres;
        hosted.executing = false;
    })
    .await;

    let done = node.provider_events.arm(key.clone());
    let dres = packet.reply(State::Dres).with_data(result);
    for _ in 0..node.settings.retries {
        tracing::info!("Send data exchange response to {}", src);
        node.send(&dres, src).await;
        if wait_event(&done, node.settings.timeout).await {
            return;
        }
    }
    tracing::info!("Waiting for data exchange acknowledgement timed out");
    node.release(&key).await;
}

/// Consumer side: any DRES not yet accepted is acknowledged to the
/// controller, duplicates from other hosts are cancelled.
async fn on_data_response(node: &Arc<ProtocolNode>, incoming: &Incoming) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;
    let decoy = node.settings.decoy_addr()?;
    let mut requests = node.requests.lock().await;
    let req = requests.get_mut(&packet.req_id)?;

    let reply = |state: State| {
        packet
            .reply(state)
            .with_src(node.settings.my_mac.clone(), node.settings.my_ip.to_string())
            .with_host(String::new(), src.ip().to_string())
    };

    if !req.is_done() {
        req.finish(packet.attempt_no, src, packet.data.to_vec());
        tracing::info!("Recv data exchange response from {}", src);
        node.show(incoming);
        node.consumer_events.set(&packet.req_id);
        tracing::info!("Send data exchange acknowledgement to orchestrator");
        return Some((reply(State::Dack), decoy));
    }

    tracing::info!("Recv late data exchange response from {}", src);
    node.show(incoming);
    tracing::info!("but result already received");
    if req.host != Some(src) {
        tracing::info!("Send data exchange cancellation to orchestrator");
        Some((reply(State::Dcan), decoy))
    } else {
        tracing::info!("Send data exchange acknowledgement to orchestrator");
        Some((reply(State::Dack), decoy))
    }
}
