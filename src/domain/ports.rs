use crate::domain::model::{Node, Request};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::net::IpAddr;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Outcome of an orchestrator call: success flag, HTTP status (None when
/// the request never got an answer) and the plain-text body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub ok: bool,
    pub code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigReply {
    pub config: Option<Map<String, Value>>,
    pub code: Option<u16>,
    pub message: String,
}

#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    async fn get_config(&self) -> ConfigReply;
    async fn add_node(&self, node: &Node) -> ApiReply;
    async fn delete_node(&self, node: &Node) -> ApiReply;
    async fn update_node_specs(&self, node: &Node) -> ApiReply;
    async fn add_request(&self, req: &Request, src: IpAddr) -> ApiReply;
}

#[async_trait]
pub trait RequestRecorder: Send + Sync {
    async fn save(&self, req: &Request) -> Result<()>;
}
