use crate::domain::model::Request;
use crate::domain::ports::{OrchestratorApi, RequestRecorder, Storage};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.base_path.join(path);
        let data = fs::read(full_path)?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.base_path.join(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(full_path, data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: String,
    pub cos_id: u32,
    pub data: String,
    pub result: Option<String>,
    pub host: Option<IpAddr>,
    pub state: Option<u8>,
    pub hreq_at: Option<f64>,
    pub dres_at: Option<f64>,
}

impl From<&Request> for RequestRow {
    fn from(req: &Request) -> Self {
        Self {
            id: req.id.clone(),
            cos_id: req.cos.id,
            data: String::from_utf8_lossy(&req.data).into_owned(),
            result: req
                .result
                .as_ref()
                .map(|r| String::from_utf8_lossy(r).into_owned()),
            host: req.host.map(|h| h.ip()),
            state: req.state.map(u8::from),
            hreq_at: req.hreq_at,
            dres_at: req.dres_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRow {
    pub req_id: String,
    pub attempt_no: u32,
    pub host: Option<IpAddr>,
    pub state: Option<u8>,
    pub hreq_at: Option<f64>,
    pub hres_at: Option<f64>,
    pub rres_at: Option<f64>,
    pub dres_at: Option<f64>,
}

#[derive(Default)]
struct Rows {
    requests: BTreeMap<String, RequestRow>,
    attempts: BTreeMap<(String, u32), AttemptRow>,
}

/// CSV records of finished requests, one pair of files per node IP.
///
/// Every save rewrites both files and forwards the request to the
/// orchestrator when an API client is attached.
pub struct CsvRequestStore {
    storage: LocalStorage,
    src: IpAddr,
    api: Option<Arc<dyn OrchestratorApi>>,
    rows: Mutex<Rows>,
}

impl CsvRequestStore {
    pub fn open(
        storage: LocalStorage,
        src: IpAddr,
        api: Option<Arc<dyn OrchestratorApi>>,
    ) -> Result<Self> {
        let mut rows = Rows::default();

        let requests_path = storage.base_path().join(requests_file(src));
        if requests_path.exists() {
            let mut reader = csv::Reader::from_path(&requests_path)?;
            for row in reader.deserialize::<RequestRow>() {
                let row = row?;
                rows.requests.insert(row.id.clone(), row);
            }
        }

        let attempts_path = storage.base_path().join(attempts_file(src));
        if attempts_path.exists() {
            let mut reader = csv::Reader::from_path(&attempts_path)?;
            for row in reader.deserialize::<AttemptRow>() {
                let row = row?;
                rows.attempts.insert((row.req_id.clone(), row.attempt_no), row);
            }
        }

        tracing::debug!(
            "Loaded {} request records from {}",
            rows.requests.len(),
            requests_path.display()
        );

        Ok(Self {
            storage,
            src,
            api,
            rows: Mutex::new(rows),
        })
    }

    /// Ids already used by this node, so new requests never collide.
    pub async fn known_ids(&self) -> HashSet<String> {
        self.rows.lock().await.requests.keys().cloned().collect()
    }

    pub async fn requests(&self) -> Vec<RequestRow> {
        self.rows.lock().await.requests.values().cloned().collect()
    }

    pub async fn attempts(&self) -> Vec<AttemptRow> {
        self.rows.lock().await.attempts.values().cloned().collect()
    }

    async fn write(&self, rows: &Rows) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows.requests.values() {
            writer.serialize(row)?;
        }
        let data = writer.into_inner().map_err(|e| e.into_error())?;
        self.storage.write_file(&requests_file(self.src), &data).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows.attempts.values() {
            writer.serialize(row)?;
        }
        let data = writer.into_inner().map_err(|e| e.into_error())?;
        self.storage.write_file(&attempts_file(self.src), &data).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestRecorder for CsvRequestStore {
    async fn save(&self, req: &Request) -> Result<()> {
        {
            let mut rows = self.rows.lock().await;
            rows.requests.insert(req.id.clone(), RequestRow::from(req));
            for attempt in req.attempts.values() {
                rows.attempts.insert(
                    (attempt.req_id.clone(), attempt.attempt_no),
                    AttemptRow {
                        req_id: attempt.req_id.clone(),
                        attempt_no: attempt.attempt_no,
                        host: attempt.host.map(|h| h.ip()),
                        state: attempt.state.map(u8::from),
                        hreq_at: attempt.hreq_at,
                        hres_at: attempt.hres_at,
                        rres_at: attempt.rres_at,
                        dres_at: attempt.dres_at,
                    },
                );
            }
            self.write(&rows).await?;
        }

        if let Some(api) = &self.api {
            let reply = api.add_request(req, self.src).await;
            if reply.ok {
                tracing::debug!("Request {} sent to the orchestrator", req.id);
            } else {
                tracing::warn!(
                    "Could not send request {} to the orchestrator ({:?}): {}",
                    req.id,
                    reply.code,
                    reply.message
                );
            }
        }
        Ok(())
    }
}

pub fn requests_file(src: IpAddr) -> String {
    format!("requests.{}.csv", src)
}

pub fn attempts_file(src: IpAddr) -> String {
    format!("attempts.{}.csv", src)
}
