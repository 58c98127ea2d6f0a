// Adapters layer: concrete implementations for external systems (orchestrator http, storage, OS network)

pub mod api;
pub mod net;
pub mod storage;

pub use api::OrchestratorClient;
pub use storage::{CsvRequestStore, LocalStorage};
