pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::{CsvRequestStore, LocalStorage, OrchestratorClient};
pub use config::{RemoteSettings, ScriptConfig};
pub use core::manager::{Manager, NodeOptions, Session};
pub use core::protocol::{ProtocolContext, ProtocolNode, ProtocolSettings};
pub use domain::cos::CosCatalog;
pub use utils::error::{FogError, Result};
