//! Models for nodes, interfaces, Classes of Service (CoS) and application
//! hosting requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// 目前時間 (epoch 秒)
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn format_ts(ts: Option<f64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp_micros((t * 1_000_000.0) as i64))
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S%.6f").to_string())
        .unwrap_or_else(|| "None".to_string())
}

/// Protocol states. Requests and attempts reuse the same codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum State {
    Fail = 0,
    Hreq = 1,
    Hres = 2,
    Rreq = 3,
    Rres = 4,
    Rack = 5,
    Rcan = 6,
    Dreq = 7,
    Dres = 8,
    Dack = 9,
    Dcan = 10,
    Dwait = 11,
}

impl State {
    pub fn describe(&self) -> &'static str {
        match self {
            State::Fail => "failure (FAIL)",
            State::Hreq => "host request (HREQ)",
            State::Hres => "host response (HRES)",
            State::Rreq => "resource reservation request (RREQ)",
            State::Rres => "resource reservation response (RRES)",
            State::Rack => "resource reservation acknowledgement (RACK)",
            State::Rcan => "resource reservation cancellation (RCAN)",
            State::Dreq => "data exchange request (DREQ)",
            State::Dres => "data exchange response (DRES)",
            State::Dack => "data exchange acknowledgement (DACK)",
            State::Dcan => "data exchange cancellation (DCAN)",
            State::Dwait => "data exchange wait (DWAIT)",
        }
    }

    /// Request-level meaning (only the states a request can rest in).
    pub fn request_label(&self) -> Option<&'static str> {
        match self {
            State::Hreq => Some("waiting for host"),
            State::Rreq => Some("waiting for resources"),
            State::Dreq => Some("waiting for data"),
            State::Dres => Some("finished"),
            State::Fail => Some("failed"),
            _ => None,
        }
    }
}

impl From<State> for u8 {
    fn from(state: State) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for State {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => State::Fail,
            1 => State::Hreq,
            2 => State::Hres,
            3 => State::Rreq,
            4 => State::Rres,
            5 => State::Rack,
            6 => State::Rcan,
            7 => State::Dreq,
            8 => State::Dres,
            9 => State::Dack,
            10 => State::Dcan,
            11 => State::Dwait,
            other => return Err(format!("unknown protocol state {}", other)),
        })
    }
}

/// How a node joins the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only requests hosting.
    Client,
    /// Requests hosting and offers its own resources.
    Resource,
    /// Announces a switch the controller cannot discover.
    Switch,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Client => "client",
            Mode::Resource => "resource",
            Mode::Switch => "switch",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Server,
    Vm,
    IotObject,
    Gateway,
    Switch,
    Router,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpecs {
    pub capacity: f64,
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub timestamp: f64,
}

impl Default for InterfaceSpecs {
    fn default() -> Self {
        Self {
            capacity: 0.0,
            bandwidth_up: 0.0,
            bandwidth_down: 0.0,
            tx_packets: 0,
            rx_packets: 0,
            timestamp: now_ts(),
        }
    }
}

/// Network interface (port).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub num: Option<u32>,
    pub mac: Option<String>,
    pub ipv4: Option<String>,
    pub specs: InterfaceSpecs,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num: None,
            mac: None,
            ipv4: None,
            specs: InterfaceSpecs::default(),
        }
    }

    /// 一次更新所有量測值並刷新時間戳
    pub fn update_specs(
        &mut self,
        capacity: f64,
        bandwidth_up: f64,
        bandwidth_down: f64,
        tx_packets: u64,
        rx_packets: u64,
    ) {
        self.specs = InterfaceSpecs {
            capacity,
            bandwidth_up,
            bandwidth_down,
            tx_packets,
            rx_packets,
            timestamp: now_ts(),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpecs {
    pub cpu_count: u32,
    pub cpu_free: f64,
    /// MB
    pub memory_total: f64,
    pub memory_free: f64,
    /// GB
    pub disk_total: f64,
    pub disk_free: f64,
    pub timestamp: f64,
}

impl Default for NodeSpecs {
    fn default() -> Self {
        Self {
            cpu_count: 0,
            cpu_free: 0.0,
            memory_total: 0.0,
            memory_free: 0.0,
            disk_total: 0.0,
            disk_free: 0.0,
            timestamp: now_ts(),
        }
    }
}

/// Network node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// MAC address by default, datapath ID for switches.
    pub id: String,
    pub state: bool,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub main_interface: Option<String>,
    pub threshold: f64,
    pub interfaces: BTreeMap<String, Interface>,
    pub specs: NodeSpecs,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: true,
            node_type,
            label: label.into(),
            main_interface: None,
            threshold: 0.0,
            interfaces: BTreeMap::new(),
            specs: NodeSpecs::default(),
        }
    }

    pub fn set_totals(&mut self, cpu_count: u32, memory_total: f64, disk_total: f64) {
        self.specs.cpu_count = cpu_count;
        self.specs.memory_total = memory_total;
        self.specs.disk_total = disk_total;
        self.specs.timestamp = now_ts();
    }

    pub fn set_free(&mut self, cpu_free: f64, memory_free: f64, disk_free: f64) {
        self.specs.cpu_free = cpu_free;
        self.specs.memory_free = memory_free;
        self.specs.disk_free = disk_free;
        self.specs.timestamp = now_ts();
    }
}

fn infinity() -> f64 {
    f64::INFINITY
}

fn one() -> f64 {
    1.0
}

/// Minimum specs required to host applications of a Class of Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoSSpecs {
    #[serde(default = "infinity")]
    pub max_response_time: f64,
    #[serde(default)]
    pub min_concurrent_users: f64,
    #[serde(default)]
    pub min_requests_per_second: f64,
    #[serde(default)]
    pub min_bandwidth: f64,
    #[serde(default = "infinity")]
    pub max_delay: f64,
    #[serde(default = "infinity")]
    pub max_jitter: f64,
    #[serde(default = "one")]
    pub max_loss_rate: f64,
    #[serde(default)]
    pub min_cpu: f64,
    /// MB
    #[serde(default)]
    pub min_ram: f64,
    /// GB
    #[serde(default)]
    pub min_disk: f64,
}

impl Default for CoSSpecs {
    fn default() -> Self {
        Self {
            max_response_time: f64::INFINITY,
            min_concurrent_users: 0.0,
            min_requests_per_second: 0.0,
            min_bandwidth: 0.0,
            max_delay: f64::INFINITY,
            max_jitter: f64::INFINITY,
            max_loss_rate: 1.0,
            min_cpu: 0.0,
            min_ram: 0.0,
            min_disk: 0.0,
        }
    }
}

/// Class of Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoS {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub specs: CoSSpecs,
}

impl CoS {
    pub fn new(id: u32, name: impl Into<String>, specs: CoSSpecs) -> Self {
        Self {
            id,
            name: name.into(),
            specs,
        }
    }
}

/// Offer received from a potential host in answer to a host request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub req_id: String,
    pub attempt_no: u32,
    pub host: SocketAddr,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub req_id: String,
    pub attempt_no: u32,
    pub host: Option<SocketAddr>,
    pub state: Option<State>,
    pub hreq_at: Option<f64>,
    pub hres_at: Option<f64>,
    pub rres_at: Option<f64>,
    pub dres_at: Option<f64>,
    pub responses: BTreeMap<SocketAddr, Response>,
}

impl Attempt {
    pub fn new(req_id: impl Into<String>, attempt_no: u32) -> Self {
        Self {
            req_id: req_id.into(),
            attempt_no,
            host: None,
            state: None,
            hreq_at: None,
            hres_at: None,
            rres_at: None,
            dres_at: None,
            responses: BTreeMap::new(),
        }
    }
}

/// Network application hosting request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub cos: CoS,
    pub data: Vec<u8>,
    pub result: Option<Vec<u8>>,
    pub host: Option<SocketAddr>,
    pub state: Option<State>,
    pub hreq_at: Option<f64>,
    pub dres_at: Option<f64>,
    pub attempts: BTreeMap<u32, Attempt>,
    /// Set once data exchange retries ran out; a DRES may still arrive.
    pub late: bool,
    attempt_no: u32,
}

impl Request {
    pub fn new(id: impl Into<String>, cos: CoS, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            cos,
            data,
            result: None,
            host: None,
            state: None,
            hreq_at: None,
            dres_at: None,
            attempts: BTreeMap::new(),
            late: false,
            attempt_no: 0,
        }
    }

    /// Opens the next attempt (numbered from 1) and returns its number.
    pub fn new_attempt(&mut self) -> u32 {
        self.attempt_no += 1;
        self.attempts
            .insert(self.attempt_no, Attempt::new(self.id.clone(), self.attempt_no));
        self.attempt_no
    }

    pub fn attempt_mut(&mut self, attempt_no: u32) -> Option<&mut Attempt> {
        self.attempts.get_mut(&attempt_no)
    }

    pub fn is_done(&self) -> bool {
        self.dres_at.is_some()
    }

    /// 記錄資料交換結果 (請求與對應嘗試)
    pub fn finish(&mut self, attempt_no: u32, host: SocketAddr, result: Vec<u8>) {
        let dres_at = now_ts();
        self.dres_at = Some(dres_at);
        self.state = Some(State::Dres);
        self.host = Some(host);
        self.result = Some(result);
        if let Some(attempt) = self.attempts.get_mut(&attempt_no) {
            attempt.state = Some(State::Dres);
            attempt.dres_at = Some(dres_at);
        }
    }

    /// Elapsed milliseconds between host request and data response.
    pub fn elapsed_ms(&self) -> Option<f64> {
        match (self.hreq_at, self.dres_at) {
            (Some(start), Some(end)) => Some(((end - start) * 1000.0 * 100.0).round() / 100.0),
            _ => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            Some(state) => state
                .request_label()
                .map(str::to_string)
                .unwrap_or_else(|| (state as u8).to_string()),
            None => "None".to_string(),
        };
        write!(
            f,
            "request(id={}, state=({}), cos={}, host={}, hreq_at={}, dres_at={})",
            self.id,
            state,
            self.cos.name,
            self.host.map(|h| h.to_string()).unwrap_or_else(|| "None".to_string()),
            format_ts(self.hreq_at),
            format_ts(self.dres_at),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn best_effort() -> CoS {
        CoS::new(1, "best-effort", CoSSpecs::default())
    }

    #[test]
    fn test_attempts_are_numbered_from_one() {
        let mut req = Request::new("abcdefghij", best_effort(), b"data".to_vec());
        assert_eq!(req.new_attempt(), 1);
        assert_eq!(req.new_attempt(), 2);
        assert_eq!(req.attempts.len(), 2);
        assert_eq!(req.attempts[&2].req_id, "abcdefghij");
    }

    #[test]
    fn test_finish_marks_request_and_attempt() {
        let mut req = Request::new("abcdefghij", best_effort(), b"data".to_vec());
        req.hreq_at = Some(now_ts());
        let no = req.new_attempt();
        let host: SocketAddr = "10.0.0.2:7071".parse().unwrap();
        req.finish(no, host, b"result".to_vec());

        assert!(req.is_done());
        assert_eq!(req.state, Some(State::Dres));
        assert_eq!(req.attempts[&no].state, Some(State::Dres));
        assert_eq!(req.attempts[&no].dres_at, req.dres_at);
        assert!(req.elapsed_ms().is_some());
        assert!(req.to_string().contains("finished"));
    }

    #[test]
    fn test_state_codes_round_trip_through_u8() {
        assert_eq!(State::try_from(11u8).unwrap(), State::Dwait);
        assert!(State::try_from(12u8).is_err());
        assert_eq!(u8::from(State::Rack), 5);
    }

    #[test]
    fn test_node_type_serializes_like_orchestrator_expects() {
        assert_eq!(serde_json::to_string(&NodeType::IotObject).unwrap(), "\"IOT_OBJECT\"");
        assert_eq!(serde_json::to_string(&NodeType::Vm).unwrap(), "\"VM\"");
    }
}
