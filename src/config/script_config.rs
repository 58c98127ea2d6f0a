use crate::core::simulator::DeclaredCapacity;
use crate::domain::cos::{CosCatalog, DEFAULT_COS_ID};
use crate::domain::model::Mode;
use crate::utils::error::{FogError, Result};
use crate::utils::validation::{validate_positive_number, validate_server, Validate};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load generator settings of the `request-script` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Orchestrator IP:PORT
    pub server: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    pub id: Option<String>,
    pub label: Option<String>,
    #[serde(default = "default_cos_id")]
    pub cos_id: u32,
    /// Seconds between two requests of a thread.
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Requests per thread, -1 is infinite.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Wait for the previous response before sending the next request.
    #[serde(default)]
    pub sequential: bool,
    #[serde(default = "default_data")]
    pub data: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub cos_file: Option<PathBuf>,
    pub resource: Option<ResourceSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSection {
    pub cpu: Option<f64>,
    pub ram: Option<f64>,
    pub disk: Option<f64>,
}

fn default_mode() -> Mode {
    Mode::Client
}

fn default_cos_id() -> u32 {
    DEFAULT_COS_ID
}

fn default_interval() -> f64 {
    0.1
}

fn default_threads() -> usize {
    1
}

fn default_limit() -> i64 {
    100
}

fn default_data() -> String {
    "data + program".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl ScriptConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(FogError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| FogError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SERVER})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| FogError::config(e.to_string()))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn server(&self) -> Result<SocketAddr> {
        validate_server("server", &self.server)
    }

    pub fn catalog(&self) -> Result<CosCatalog> {
        match &self.cos_file {
            Some(path) => CosCatalog::from_file(path),
            None => Ok(CosCatalog::builtin()),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.limit < 0
    }

    /// Pause between two requests of a thread.
    pub fn request_interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.interval).map_err(|e| FogError::InvalidConfigValueError {
            field: "interval".to_string(),
            value: self.interval.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn declared_capacity(&self) -> DeclaredCapacity {
        let resource = self.resource.clone().unwrap_or_default();
        DeclaredCapacity {
            cpu: resource.cpu,
            ram: resource.ram,
            disk: resource.disk,
        }
    }
}

impl Validate for ScriptConfig {
    fn validate(&self) -> Result<()> {
        self.server()?;

        if self.mode == Mode::Switch {
            return Err(FogError::InvalidConfigValueError {
                field: "mode".to_string(),
                value: self.mode.to_string(),
                reason: "switches cannot send requests".to_string(),
            });
        }

        let catalog = self.catalog()?;
        catalog.get(self.cos_id)?;

        self.request_interval()?;
        validate_positive_number("threads", self.threads, 1)?;

        if self.limit == 0 || self.limit < -1 {
            return Err(FogError::InvalidConfigValueError {
                field: "limit".to_string(),
                value: self.limit.to_string(),
                reason: "must be positive, or -1 for no limit".to_string(),
            });
        }

        Ok(())
    }
}
