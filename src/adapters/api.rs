//! REST client of the orchestrator (Ryu application).

use crate::domain::model::{Node, Request, State};
use crate::domain::ports::{ApiReply, ConfigReply, OrchestratorApi};
use crate::utils::error::Result;
use crate::utils::validation::validate_url;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"<[^>]*>").unwrap()
});

/// Plain text of an HTML (or plain) body.
pub fn strip_html(body: &str) -> String {
    HTML_TAG.replace_all(body, "").trim().to_string()
}

fn is_success(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::SEE_OTHER
}

fn error_kind(e: &reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "Timeout"
    } else if e.is_connect() {
        "ConnectionError"
    } else if e.is_decode() {
        "DecodeError"
    } else if e.is_builder() {
        "InvalidURL"
    } else {
        "RequestException"
    };
    kind.to_string()
}

#[derive(Serialize)]
struct InterfacePayload<'a> {
    name: &'a str,
    num: Option<u32>,
    mac: Option<&'a str>,
    ipv4: Option<&'a str>,
}

#[derive(Serialize)]
struct NodePayload<'a> {
    id: &'a str,
    state: bool,
    #[serde(rename = "type")]
    node_type: crate::domain::model::NodeType,
    label: &'a str,
    main_interface: Option<&'a str>,
    threshold: f64,
    interfaces: Vec<InterfacePayload<'a>>,
}

impl<'a> NodePayload<'a> {
    fn from_node(node: &'a Node) -> Self {
        Self {
            id: &node.id,
            state: node.state,
            node_type: node.node_type,
            label: &node.label,
            main_interface: node.main_interface.as_deref(),
            threshold: node.threshold,
            interfaces: node
                .interfaces
                .values()
                .map(|iface| InterfacePayload {
                    name: &iface.name,
                    num: iface.num,
                    mac: iface.mac.as_deref(),
                    ipv4: iface.ipv4.as_deref(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct InterfaceSpecsPayload<'a> {
    name: &'a str,
    capacity: f64,
    bandwidth_up: f64,
    bandwidth_down: f64,
    tx_packets: u64,
    rx_packets: u64,
    timestamp: f64,
}

#[derive(Serialize)]
struct NodeSpecsPayload<'a> {
    cpu_count: u32,
    cpu_free: f64,
    memory_total: f64,
    memory_free: f64,
    disk_total: f64,
    disk_free: f64,
    timestamp: f64,
    interfaces: Vec<InterfaceSpecsPayload<'a>>,
}

impl<'a> NodeSpecsPayload<'a> {
    fn from_node(node: &'a Node) -> Self {
        let specs = &node.specs;
        Self {
            cpu_count: specs.cpu_count,
            cpu_free: specs.cpu_free,
            memory_total: specs.memory_total,
            memory_free: specs.memory_free,
            disk_total: specs.disk_total,
            disk_free: specs.disk_free,
            timestamp: specs.timestamp,
            interfaces: node
                .interfaces
                .values()
                .map(|iface| InterfaceSpecsPayload {
                    name: &iface.name,
                    capacity: iface.specs.capacity,
                    bandwidth_up: iface.specs.bandwidth_up,
                    bandwidth_down: iface.specs.bandwidth_down,
                    tx_packets: iface.specs.tx_packets,
                    rx_packets: iface.specs.rx_packets,
                    timestamp: iface.specs.timestamp,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ResponsePayload {
    host: IpAddr,
    cpu: f64,
    ram: f64,
    disk: f64,
    timestamp: f64,
}

#[derive(Serialize)]
struct AttemptPayload {
    attempt_no: u32,
    host: Option<IpAddr>,
    state: Option<State>,
    hreq_at: Option<f64>,
    hres_at: Option<f64>,
    rres_at: Option<f64>,
    dres_at: Option<f64>,
    responses: Vec<ResponsePayload>,
}

#[derive(Serialize)]
struct RequestPayload<'a> {
    id: &'a str,
    src: IpAddr,
    cos_id: u32,
    data: String,
    result: Option<String>,
    host: Option<IpAddr>,
    state: Option<State>,
    hreq_at: Option<f64>,
    dres_at: Option<f64>,
    attempts: Vec<AttemptPayload>,
}

impl<'a> RequestPayload<'a> {
    fn from_request(req: &'a Request, src: IpAddr) -> Self {
        Self {
            id: &req.id,
            src,
            cos_id: req.cos.id,
            data: String::from_utf8_lossy(&req.data).into_owned(),
            result: req
                .result
                .as_ref()
                .map(|r| String::from_utf8_lossy(r).into_owned()),
            host: req.host.map(|h| h.ip()),
            state: req.state,
            hreq_at: req.hreq_at,
            dres_at: req.dres_at,
            attempts: req
                .attempts
                .values()
                .map(|attempt| AttemptPayload {
                    attempt_no: attempt.attempt_no,
                    host: attempt.host.map(|h| h.ip()),
                    state: attempt.state,
                    hreq_at: attempt.hreq_at,
                    hres_at: attempt.hres_at,
                    rres_at: attempt.rres_at,
                    dres_at: attempt.dres_at,
                    responses: attempt
                        .responses
                        .values()
                        .map(|response| ResponsePayload {
                            host: response.host.ip(),
                            cpu: response.cpu,
                            ram: response.ram,
                            disk: response.disk,
                            timestamp: response.timestamp,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    client: Client,
    base: Url,
}

impl OrchestratorClient {
    pub fn new(server: SocketAddr) -> Result<Self> {
        let base = validate_url("server", &format!("http://{}", server))?;
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> std::result::Result<(StatusCode, String), reqwest::Error> {
        let url = format!("{}{}", self.base.as_str().trim_end_matches('/'), path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("{} {} -> {}", method, path, status);
        let text = response.text().await?;
        Ok((status, text))
    }

    async fn reply<T: Serialize + ?Sized>(&self, method: Method, path: &str, body: Option<&T>) -> ApiReply {
        match self.call(method, path, body).await {
            Ok((status, text)) => ApiReply {
                ok: is_success(status),
                code: Some(status.as_u16()),
                message: strip_html(&text),
            },
            Err(e) => {
                tracing::debug!("{} failed: {}", path, e);
                ApiReply {
                    ok: false,
                    code: None,
                    message: error_kind(&e),
                }
            }
        }
    }
}

#[async_trait]
impl OrchestratorApi for OrchestratorClient {
    async fn get_config(&self) -> ConfigReply {
        match self.call::<Value>(Method::GET, "/config", None).await {
            Ok((status, text)) => {
                let config = if status == StatusCode::OK {
                    serde_json::from_str::<Map<String, Value>>(&text)
                        .map_err(|e| tracing::warn!("Invalid configuration received: {}", e))
                        .ok()
                } else {
                    None
                };
                ConfigReply {
                    config,
                    code: Some(status.as_u16()),
                    message: strip_html(&text),
                }
            }
            Err(e) => {
                tracing::debug!("/config failed: {}", e);
                ConfigReply {
                    config: None,
                    code: None,
                    message: error_kind(&e),
                }
            }
        }
    }

    async fn add_node(&self, node: &Node) -> ApiReply {
        self.reply(Method::POST, "/node", Some(&NodePayload::from_node(node)))
            .await
    }

    async fn delete_node(&self, node: &Node) -> ApiReply {
        self.reply::<Value>(Method::DELETE, &format!("/node/{}", node.id), None)
            .await
    }

    async fn update_node_specs(&self, node: &Node) -> ApiReply {
        self.reply(
            Method::PUT,
            &format!("/node_specs/{}", node.id),
            Some(&NodeSpecsPayload::from_node(node)),
        )
        .await
    }

    async fn add_request(&self, req: &Request, src: IpAddr) -> ApiReply {
        self.reply(
            Method::POST,
            "/request",
            Some(&RequestPayload::from_request(req, src)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CoS, CoSSpecs, Interface, NodeType};

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<html><body><h1>303 See Other</h1>exists</body></html>\n"),
            "303 See Otherexists"
        );
        assert_eq!(strip_html("plain"), "plain");
    }

    #[test]
    fn test_node_payload_shape() {
        let mut node = Node::new("00:00:00:00:10:10", NodeType::Server, "h1");
        node.main_interface = Some("eth0".to_string());
        let mut eth0 = Interface::new("eth0");
        eth0.ipv4 = Some("10.0.0.1".to_string());
        node.interfaces.insert("eth0".to_string(), eth0);

        let json = serde_json::to_value(NodePayload::from_node(&node)).unwrap();
        assert_eq!(json["type"], "SERVER");
        assert_eq!(json["main_interface"], "eth0");
        assert_eq!(json["interfaces"][0]["ipv4"], "10.0.0.1");
        assert!(json["interfaces"][0]["mac"].is_null());
    }

    #[test]
    fn test_request_payload_uses_ips_and_state_codes() {
        let mut req = Request::new("abcdefghij", CoS::new(1, "best-effort", CoSSpecs::default()), b"data".to_vec());
        let no = req.new_attempt();
        req.finish(no, "10.0.0.2:7071".parse().unwrap(), b"result".to_vec());

        let json = serde_json::to_value(RequestPayload::from_request(&req, "10.0.0.1".parse().unwrap())).unwrap();
        assert_eq!(json["src"], "10.0.0.1");
        assert_eq!(json["host"], "10.0.0.2");
        assert_eq!(json["state"], 8);
        assert_eq!(json["result"], "result");
        assert_eq!(json["attempts"][0]["attempt_no"], 1);
    }
}
