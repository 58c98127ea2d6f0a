use thiserror::Error;

#[derive(Error, Debug)]
pub enum FogError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Malformed packet: {message}")]
    PacketError { message: String },

    #[error("Unknown Class of Service: {0}")]
    UnknownCos(u32),

    #[error("Node {id} is already connected")]
    AlreadyConnected { id: String },

    #[error("Protocol is disabled (PROTOCOL_SEND_TO is NONE)")]
    ProtocolDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Configuration,
    Protocol,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FogError {
    pub fn config(message: impl Into<String>) -> Self {
        FogError::ConfigError {
            message: message.into(),
        }
    }

    pub fn packet(message: impl Into<String>) -> Self {
        FogError::PacketError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FogError::ApiError(_) => ErrorCategory::Network,
            FogError::CsvError(_) | FogError::IoError(_) | FogError::SerializationError(_) => {
                ErrorCategory::Storage
            }
            FogError::ConfigError { .. }
            | FogError::MissingConfigError { .. }
            | FogError::InvalidConfigValueError { .. }
            | FogError::UnknownCos(_) => ErrorCategory::Configuration,
            FogError::PacketError { .. }
            | FogError::AlreadyConnected { .. }
            | FogError::ProtocolDisabled => ErrorCategory::Protocol,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FogError::PacketError { .. } => ErrorSeverity::Low,
            FogError::ApiError(_) | FogError::CsvError(_) | FogError::SerializationError(_) => {
                ErrorSeverity::Medium
            }
            FogError::ConfigError { .. }
            | FogError::MissingConfigError { .. }
            | FogError::InvalidConfigValueError { .. }
            | FogError::UnknownCos(_)
            | FogError::ProtocolDisabled => ErrorSeverity::High,
            FogError::IoError(_) | FogError::AlreadyConnected { .. } => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "Check that the orchestrator is reachable at --server",
            ErrorCategory::Configuration => {
                "Check the command line arguments and the orchestrator configuration"
            }
            ErrorCategory::Protocol => match self {
                FogError::AlreadyConnected { .. } => {
                    "Disconnect the other instance or use a different --id"
                }
                FogError::ProtocolDisabled => {
                    "Set PROTOCOL:SEND_TO to BROADCAST or ORCHESTRATOR on the orchestrator"
                }
                _ => "Packets from incompatible peers are ignored",
            },
            ErrorCategory::Storage => "Check permissions of the data directory",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            FogError::ApiError(_) => "Could not talk to the orchestrator".to_string(),
            FogError::AlreadyConnected { id } => format!("Node {} is already connected", id),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FogError>;
