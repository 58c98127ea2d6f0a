use crate::domain::model::{CoS, CoSSpecs};
use crate::utils::error::{FogError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_COS_ID: u32 = 1;

/// Class of Service catalog, keyed by CoS ID.
#[derive(Debug, Clone, PartialEq)]
pub struct CosCatalog {
    classes: BTreeMap<u32, CoS>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    cos: Vec<CoS>,
}

impl CosCatalog {
    pub fn new(classes: impl IntoIterator<Item = CoS>) -> Self {
        Self {
            classes: classes.into_iter().map(|cos| (cos.id, cos)).collect(),
        }
    }

    /// 內建的 7 種服務等級
    pub fn builtin() -> Self {
        let spec = |min_cpu: f64, min_ram: f64, min_disk: f64| CoSSpecs {
            min_cpu,
            min_ram,
            min_disk,
            ..CoSSpecs::default()
        };

        Self::new([
            CoS::new(1, "best-effort", CoSSpecs::default()),
            CoS::new(2, "cpu-bound", spec(2.0, 512.0, 1.0)),
            CoS::new(
                3,
                "streaming",
                CoSSpecs {
                    min_bandwidth: 10.0,
                    ..spec(1.0, 256.0, 2.0)
                },
            ),
            CoS::new(
                4,
                "conversational",
                CoSSpecs {
                    max_delay: 0.15,
                    ..spec(1.0, 128.0, 0.5)
                },
            ),
            CoS::new(
                5,
                "interactive",
                CoSSpecs {
                    max_response_time: 0.5,
                    ..spec(1.0, 256.0, 0.5)
                },
            ),
            CoS::new(
                6,
                "real-time",
                CoSSpecs {
                    max_delay: 0.05,
                    max_jitter: 0.01,
                    ..spec(1.0, 128.0, 0.1)
                },
            ),
            CoS::new(
                7,
                "mission-critical",
                CoSSpecs {
                    max_loss_rate: 0.001,
                    ..spec(2.0, 1024.0, 2.0)
                },
            ),
        ])
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 解析 [[cos]] 陣列
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content).map_err(|e| FogError::ConfigError {
            message: format!("CoS catalog parsing error: {}", e),
        })?;
        if file.cos.is_empty() {
            return Err(FogError::config("CoS catalog is empty"));
        }
        Ok(Self::new(file.cos))
    }

    pub fn get(&self, id: u32) -> Result<&CoS> {
        self.classes.get(&id).ok_or(FogError::UnknownCos(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.classes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoS> {
        self.classes.values()
    }

    /// Menu shown by the interactive sender.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for cos in self.iter() {
            out.push_str(&format!("  {} - {}", cos.id, cos.name));
            if cos.id == DEFAULT_COS_ID {
                out.push_str(" (default)");
            }
            out.push('\n');
        }
        out
    }
}

impl Default for CosCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
