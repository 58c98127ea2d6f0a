pub mod manager;
pub mod protocol;
pub mod simulator;

pub use crate::domain::model::{Mode, Request, State};
pub use crate::domain::ports::{OrchestratorApi, RequestRecorder, Storage};
pub use crate::utils::error::Result;
