//! BROADCAST mode: nodes find a host among themselves.
//!
//! The consumer broadcasts a host request and picks the first host that
//! answers, reserves resources on it, then exchanges data with it.

use super::{HostedKey, Hosted, Incoming, Packet, ProtocolNode};
use crate::domain::model::{now_ts, CoS, Response, State};
use std::net::SocketAddr;
use std::sync::Arc;

pub(super) async fn send_request(
    node: &Arc<ProtocolNode>,
    req_id: &str,
    cos: &CoS,
    data: Vec<u8>,
) -> Option<Vec<u8>> {
    let retries = node.settings.retries;
    let timeout = node.settings.timeout;
    let mut hreq_rt = retries;

    // dres_at 隨時可能被回應器設定 (較晚抵達的 DRES)
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
        tracing::info!("Broadcasting host request");
        node.log_request(req_id).await;
        hreq_rt -= 1;

        let hreq = Packet::new(State::Hreq, req_id, attempt_no).with_cos(cos.id);
        let Some(hres) = node.send_and_wait(&hreq, node.settings.broadcast, timeout).await else {
            if !node.is_done(req_id).await {
                tracing::info!("No hosts");
            }
            continue;
        };
        if node.is_done(req_id).await {
            break;
        }

        let host = hres.src;
        node.with_request(req_id, |req| {
            req.state = Some(State::Rreq);
            req.host = Some(host);
            if let Some(attempt) = req.attempt_mut(attempt_no) {
                attempt.hres_at = Some(now_ts());
                attempt.state = Some(State::Rreq);
                attempt.host = Some(host);
            }
        })
        .await;
        tracing::info!("Recv first host response from {}", host);
        node.show(&hres);

        hreq_rt = retries;
        let mut rreq_rt = retries;
        while rreq_rt > 0 && !node.is_done(req_id).await {
            tracing::info!("Send resource reservation request to {}", host);
            node.log_request(req_id).await;
            rreq_rt -= 1;

            let rreq = Packet::new(State::Rreq, req_id, attempt_no);
            let Some(mut rres) = node.send_and_wait(&rreq, host, timeout).await else {
                if !node.is_done(req_id).await {
                    tracing::info!("No resources");
                }
                continue;
            };
            if node.is_done(req_id).await {
                break;
            }
            // 舊主機的 RRES 交給回應器取消，繼續等目前主機
            if rres.src != host {
                let id = req_id.to_string();
                match node
                    .wait_for(timeout, move |i| {
                        i.src == host
                            && i.packet.req_id == id
                            && matches!(i.packet.state, State::Rres | State::Rcan)
                    })
                    .await
                {
                    Some(answer) => rres = answer,
                    None => continue,
                }
            }
            if rres.packet.state == State::Rcan {
                tracing::info!("Recv resource reservation cancellation from {}", host);
                node.show(&rres);
                set_attempt_state(node, req_id, attempt_no, State::Rcan).await;
                continue 'hosts;
            }

            node.with_request(req_id, |req| {
                req.state = Some(State::Dreq);
                if let Some(attempt) = req.attempt_mut(attempt_no) {
                    attempt.rres_at = Some(now_ts());
                    attempt.state = Some(State::Dreq);
                }
            })
            .await;
            tracing::info!("Recv resource reservation response from {}", host);
            node.show(&rres);

            let mut dreq_rt = retries;
            while dreq_rt > 0 && !node.is_done(req_id).await {
                tracing::info!("Send data exchange request to {}", host);
                node.log_request(req_id).await;
                dreq_rt -= 1;

                let dreq = Packet::new(State::Dreq, req_id, attempt_no).with_data(data.clone());
                let Some(mut dres) = node.send_and_wait(&dreq, host, timeout).await else {
                    if !node.is_done(req_id).await {
                        tracing::info!("No data");
                    }
                    continue;
                };
                if node.is_done(req_id).await {
                    break;
                }

                let waiting = dres.src == host && dres.packet.state == State::Dwait;
                if waiting {
                    dreq_rt = retries;
                    tracing::info!("{} still executing", req_id);
                }
                if dres.src != host {
                    dreq_rt += 1;
                }
                if dres.src != host || waiting {
                    let id = req_id.to_string();
                    match node
                        .wait_for(timeout, move |i| {
                            i.src == host && i.packet.req_id == id && i.packet.state == State::Dres
                        })
                        .await
                    {
                        Some(answer) => dres = answer,
                        None => continue,
                    }
                }
                if dres.packet.state == State::Dcan {
                    tracing::info!("Recv data exchange cancellation from {}", host);
                    node.show(&dres);
                    set_attempt_state(node, req_id, attempt_no, State::Dcan).await;
                    if dreq_rt == 0 {
                        node.with_request(req_id, |req| req.late = true).await;
                    }
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
                    tracing::info!("Send data exchange acknowledgement to {}", host);
                    node.log_request(req_id).await;
                    node.send(&Packet::new(State::Dack, req_id, attempt_no), host).await;
                }
                return node.conclude(req_id).await;
            }

            if dreq_rt == 0 {
                // DRES 之後仍可能抵達
                node.with_request(req_id, |req| req.late = true).await;
            }
            continue 'hosts;
        }
    }

    node.conclude(req_id).await
}

async fn set_attempt_state(node: &ProtocolNode, req_id: &str, attempt_no: u32, state: State) {
    node.with_request(req_id, |req| {
        if let Some(attempt) = req.attempt_mut(attempt_no) {
            attempt.state = Some(state);
        }
    })
    .await;
}

pub(super) async fn respond(node: &Arc<ProtocolNode>, incoming: &Incoming) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;
    let key: HostedKey = (src.ip(), packet.req_id.clone());

    match packet.state {
        State::Hreq if node.resources.is_resource() => on_host_request(node, incoming, key).await,
        State::Hres => {
            node.with_request(&packet.req_id, |req| {
                if matches!(req.state, Some(State::Dres | State::Fail)) {
                    return;
                }
                if let Some(attempt) = req.attempt_mut(packet.attempt_no) {
                    attempt.responses.insert(
                        src,
                        Response {
                            req_id: packet.req_id.clone(),
                            attempt_no: packet.attempt_no,
                            host: src,
                            cpu: packet.cpu_offer,
                            ram: packet.ram_offer,
                            disk: packet.disk_offer,
                            timestamp: now_ts(),
                        },
                    );
                }
            })
            .await;
            None
        }
        State::Rreq => on_reservation_request(node, incoming, key).await,
        State::Rres => {
            let late = node
                .with_request(&packet.req_id, |req| req.host != Some(src))
                .await;
            if !late {
                return None;
            }
            tracing::info!("Recv late resource reservation response from {}", src);
            node.show(incoming);
            tracing::info!("Send resource reservation cancellation to {}", src);
            Some((packet.reply(State::Rcan), src))
        }
        State::Dreq => on_data_request(node, incoming, key).await,
        State::Dres => on_late_data_response(node, incoming).await,
        State::Dack => {
            if node.hosted_state_of(&key).await == Some(State::Dres) {
                tracing::info!("Recv data exchange acknowledgement from {}", src);
                node.show(incoming);
                node.release(&key).await;
            }
            None
        }
        _ => None,
    }
}

async fn on_host_request(
    node: &Arc<ProtocolNode>,
    incoming: &Incoming,
    key: HostedKey,
) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;
    let cos = match node.catalog.get(packet.cos_id) {
        Ok(cos) => cos.clone(),
        Err(e) => {
            tracing::warn!("Host request from {} ignored: {}", src, e);
            return None;
        }
    };

    let mut hosted = node.hosted.lock().await;
    let entry = hosted
        .entry(key)
        .or_insert_with(|| Hosted::new(cos.clone(), State::Hreq));
    // 已取消的舊請求不再回應
    if !matches!(entry.state, State::Hreq | State::Hres) {
        return None;
    }
    tracing::info!("Recv host request from {}", src);
    node.show(incoming);
    entry.cos = cos;
    tracing::info!("Checking resources");
    let free = node.resources.get_resources();
    if node.resources.check_resources(&entry.cos, false) {
        tracing::info!("Send host response to {}", src);
        entry.state = State::Hres;
        Some((packet.reply(State::Hres).with_offer(free.cpu, free.ram, free.disk), src))
    } else {
        tracing::info!("Insufficient (will exceed limit)");
        entry.state = State::Hreq;
        None
    }
}

async fn on_reservation_request(
    node: &Arc<ProtocolNode>,
    incoming: &Incoming,
    key: HostedKey,
) -> Option<(Packet, SocketAddr)> {
    let src = incoming.src;
    let state = {
        let mut hosted = node.hosted.lock().await;
        let entry = hosted.get_mut(&key)?;
        if entry.state == State::Hres {
            tracing::info!("Recv resource reservation request from {}", src);
            node.show(incoming);
            tracing::info!("Reserving resources");
            if node.resources.reserve_resources(&entry.cos) {
                entry.state = State::Rres;
                entry.freed = false;
            } else {
                tracing::info!(
                    "Resources are no longer sufficient (will exceed limit)\n\
                     Send resource reservation cancellation to {}",
                    src
                );
                entry.state = State::Hreq;
                return Some((incoming.packet.reply(State::Rcan), src));
            }
        }
        entry.state
    };
    if state == State::Rres {
        tokio::spawn(respond_resources(node.clone(), incoming.packet.clone(), src, key));
    }
    None
}

/// Resends RRES until the consumer sends DREQ or RCAN.
async fn respond_resources(node: Arc<ProtocolNode>, packet: Packet, src: SocketAddr, key: HostedKey) {
    let rres = packet.reply(State::Rres);
    let mut retries = node.settings.retries;
    let mut answer = None;
    while answer.is_none() && retries > 0 && node.hosted_state_of(&key).await == Some(State::Rres) {
        tracing::info!("Send resource reservation response to {}", src);
        retries -= 1;
        answer = node.send_and_wait(&rres, src, node.settings.timeout).await;
        if let Some(rcan) = answer.as_ref().filter(|a| a.packet.state == State::Rcan) {
            tracing::info!("Recv resource reservation cancellation from {}", src);
            node.show(rcan);
            node.with_hosted(&key, |hosted| hosted.state = State::Hreq).await;
            node.release(&key).await;
            return;
        }
    }
    if answer.is_none() && node.hosted_state_of(&key).await == Some(State::Rres) {
        tracing::info!("Waiting for data exchange request timed out");
        node.release(&key).await;
        node.with_hosted(&key, |hosted| hosted.state = State::Hreq).await;
        node.send(&packet.reply(State::Rcan), src).await;
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
        if entry.state == State::Dres {
            let result = entry.result.clone().unwrap_or_default();
            return Some((packet.reply(State::Dres).with_data(result), src));
        }
        if entry.state == State::Rres && entry.executing {
            return Some((packet.reply(State::Dwait), src));
        }
        tracing::info!("Recv data exchange request from {}", src);
        node.show(incoming);
        if entry.state == State::Hreq {
            tracing::info!("This request arrived late");
            if node.resources.reserve_resources(&entry.cos) {
                tracing::info!("but resources are still available");
                entry.state = State::Rres;
                entry.freed = false;
            } else {
                tracing::info!(
                    "and resources are no longer sufficient (will exceed limit)\n\
                     Send data exchange cancellation to {}",
                    src
                );
                entry.state = State::Hreq;
                return Some((packet.reply(State::Dcan), src));
            }
        }
        if entry.state != State::Rres {
            return None;
        }
        entry.executing = true;
    }
    tokio::spawn(respond_data(node.clone(), packet.clone(), src, key));
    None
}

/// Executes, then resends DRES until DACK or DCAN.
async fn respond_data(node: Arc<ProtocolNode>, packet: Packet, src: SocketAddr, key: HostedKey) {
    tracing::info!("Executing");
    let result = node.resources.execute(&packet.data).await;
    node.with_hosted(&key, |hosted| {
        hosted.result = Some(result.clone());
        hosted.state = State::Dres;
        hosted.executing = false;
    })
    .await;

    let dres = packet.reply(State::Dres).with_data(result);
    let mut retries = node.settings.retries;
    let mut answer = None;
    while answer.is_none() && retries > 0 {
        tracing::info!("Send data exchange response to {}", src);
        retries -= 1;
        answer = node.send_and_wait(&dres, src, node.settings.timeout).await;
        if answer.as_ref().is_some_and(|a| a.packet.state == State::Dcan) {
            tracing::info!("Recv data exchange cancellation from {}", src);
            node.release(&key).await;
            return;
        }
    }
    if answer.is_none() {
        tracing::info!("Waiting for data exchange acknowledgement timed out");
        node.release(&key).await;
    }
}

/// Consumer side: a DRES the exchange loop did not take.
async fn on_late_data_response(node: &Arc<ProtocolNode>, incoming: &Incoming) -> Option<(Packet, SocketAddr)> {
    let packet = &incoming.packet;
    let src = incoming.src;
    let mut requests = node.requests.lock().await;
    let req = requests.get_mut(&packet.req_id)?;

    if !req.is_done() {
        // 只接受先前主機 (已標記 late) 的回應
        if req.host != Some(src) && req.late {
            req.finish(packet.attempt_no, src, packet.data.to_vec());
            tracing::info!("Recv late data exchange response from {}", src);
            node.show(incoming);
            tracing::info!("Send data exchange acknowledgement to {}", src);
            return Some((packet.reply(State::Dack), src));
        }
        return None;
    }

    tracing::info!("Recv late data exchange response from {}", src);
    node.show(incoming);
    tracing::info!("but result already received");
    if req.host != Some(src) {
        tracing::info!("Send data exchange cancellation to {}", src);
        Some((packet.reply(State::Dcan), src))
    } else {
        tracing::info!("Send data exchange acknowledgement to {}", src);
        Some((packet.reply(State::Dack), src))
    }
}
