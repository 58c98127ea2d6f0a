//! Settings received from the orchestrator after connecting (`GET /config`).
//!
//! Every key absent from the received object falls back to the environment
//! variable of the same name. Invalid or missing values log a warning and use
//! the default.

use crate::adapters::net::Ipv4Cidr;
use crate::utils::error::{FogError, Result};
use serde_json::{Map, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PROTOCOL_PORT: u16 = 7071;
pub const DEFAULT_UDP_PORT: u16 = 7070;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTo {
    Broadcast,
    Orchestrator,
    None,
}

impl SendTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendTo::Broadcast => "BROADCAST",
            SendTo::Orchestrator => "ORCHESTRATOR",
            SendTo::None => "NONE",
        }
    }
}

impl std::fmt::Display for SendTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoy controller the ORCHESTRATOR protocol talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoyController {
    pub mac: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub stp_enabled: bool,
    pub network: Option<Ipv4Cidr>,
    pub broadcast_ip: Ipv4Addr,
    pub send_to: SendTo,
    pub protocol_timeout: Duration,
    pub protocol_retries: u32,
    pub protocol_verbose: bool,
    pub protocol_port: u16,
    pub udp_port: u16,
    pub udp_timeout: Duration,
    pub monitor_period: Duration,
    pub simulator_active: bool,
    pub exec_min: f64,
    pub exec_max: f64,
    /// Max usage in percent (0..=100).
    pub resource_limit: f64,
    pub decoy: Option<DecoyController>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_bool(key: &str, raw: Option<String>, warn: bool) -> bool {
    match raw.as_deref().map(str::to_uppercase).as_deref() {
        Some("TRUE") => true,
        Some("FALSE") => false,
        _ => {
            if warn {
                tracing::warn!(
                    "{} parameter invalid or missing from received configuration. Defaulting to False",
                    key
                );
            }
            false
        }
    }
}

fn parse_num<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: Option<String>, default: T) -> T {
    match raw.as_deref().map(str::trim).map(str::parse::<T>) {
        Some(Ok(value)) => value,
        _ => {
            tracing::warn!(
                "{} parameter invalid or missing from received configuration. Defaulting to {}",
                key,
                default
            );
            default
        }
    }
}

fn parse_secs(key: &str, raw: Option<String>, default: Duration) -> Duration {
    let secs = parse_num(key, raw, default.as_secs_f64());
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => duration,
        Err(e) => {
            tracing::warn!(
                "{} parameter ({}) invalid ({}). Defaulting to {}s",
                key,
                secs,
                e,
                default.as_secs_f64()
            );
            default
        }
    }
}

/// 秒數必須能轉成 Duration
fn valid_secs(secs: f64) -> bool {
    Duration::try_from_secs_f64(secs).is_ok()
}

impl RemoteSettings {
    /// 從 orchestrator 回傳的設定物件建立 (缺少的鍵改讀環境變數)
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self::from_lookup(|key| {
            map.get(key)
                .and_then(value_to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let stp_enabled = parse_bool("NETWORK:STP_ENABLED", lookup("NETWORK_STP_ENABLED"), true);

        let network = lookup("NETWORK_ADDRESS").and_then(|raw| match raw.parse::<Ipv4Cidr>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("{}. Defaulting to broadcast IP 255.255.255.255", e);
                None
            }
        });
        let broadcast_ip = network
            .map(|net| net.broadcast())
            .unwrap_or(Ipv4Addr::BROADCAST);

        let send_to = match lookup("PROTOCOL_SEND_TO").as_deref() {
            Some("BROADCAST") if stp_enabled => SendTo::Broadcast,
            Some("ORCHESTRATOR") => SendTo::Orchestrator,
            Some("NONE") => SendTo::None,
            _ => {
                tracing::warn!(
                    "PROTOCOL:SEND_TO parameter invalid or missing from received configuration. \
                     Defaulting to NONE (protocol will not be used)"
                );
                SendTo::None
            }
        };

        let protocol_timeout = parse_secs("PROTOCOL:TIMEOUT", lookup("PROTOCOL_TIMEOUT"), Duration::from_secs(1));
        let retries: f64 = parse_num("PROTOCOL:RETRIES", lookup("PROTOCOL_RETRIES"), 3.0);
        let protocol_retries = if retries.is_finite() && retries >= 0.0 {
            retries as u32
        } else {
            3
        };
        let protocol_verbose = parse_bool("PROTOCOL:VERBOSE", lookup("PROTOCOL_VERBOSE"), false);
        let protocol_port = parse_num("PROTOCOL:PORT", lookup("PROTOCOL_PORT"), DEFAULT_PROTOCOL_PORT);

        let udp_port = parse_num(
            "ORCHESTRATOR:UDP_PORT",
            lookup("ORCHESTRATOR_UDP_PORT"),
            DEFAULT_UDP_PORT,
        );
        let udp_timeout = parse_secs(
            "ORCHESTRATOR:UDP_TIMEOUT",
            lookup("ORCHESTRATOR_UDP_TIMEOUT"),
            Duration::from_secs(1),
        );
        let monitor_period = parse_secs("MONITOR_PERIOD", lookup("MONITOR_PERIOD"), Duration::from_secs(1));

        let simulator_active = parse_bool("SIMULATOR:ACTIVE", lookup("SIMULATOR_ACTIVE"), true);
        let (exec_min, exec_max) = Self::exec_range(&lookup);

        let mut resource_limit: f64 = parse_num("RESOURCE_LIMIT", lookup("RESOURCE_LIMIT"), 0.0);
        if !(0.0..=100.0).contains(&resource_limit) {
            tracing::warn!(
                "Resource limit argument ({}) invalid (must be %). Defaulting to 0%",
                resource_limit
            );
            resource_limit = 0.0;
        }

        let decoy = match (lookup("CONTROLLER_DECOY_MAC"), lookup("CONTROLLER_DECOY_IP")) {
            (Some(mac), Some(ip)) => match ip.trim().parse::<Ipv4Addr>() {
                Ok(ip) => Some(DecoyController {
                    mac,
                    addr: SocketAddr::from((ip, protocol_port)),
                }),
                Err(_) => {
                    tracing::warn!("CONTROLLER:DECOY_IP parameter ({}) invalid", ip);
                    None
                }
            },
            _ => None,
        };

        Self {
            stp_enabled,
            network,
            broadcast_ip,
            send_to,
            protocol_timeout,
            protocol_retries,
            protocol_verbose,
            protocol_port,
            udp_port,
            udp_timeout,
            monitor_period,
            simulator_active,
            exec_min,
            exec_max,
            resource_limit,
            decoy,
        }
    }

    fn exec_range(lookup: &impl Fn(&str) -> Option<String>) -> (f64, f64) {
        let min = lookup("SIMULATOR_EXEC_MIN").and_then(|v| v.trim().parse::<f64>().ok());
        let max = lookup("SIMULATOR_EXEC_MAX").and_then(|v| v.trim().parse::<f64>().ok());
        match (min, max) {
            (Some(min), Some(max)) if valid_secs(min) && valid_secs(max) && max >= min => (min, max),
            (Some(min), Some(max)) => {
                tracing::warn!(
                    "SIMULATOR:EXEC_MIN and SIMULATOR:EXEC_MAX parameters ({} and {}) invalid \
                     in received configuration. Defaulting to [0s, 1s]",
                    min,
                    max
                );
                (0.0, 1.0)
            }
            _ => {
                tracing::warn!(
                    "SIMULATOR:EXEC_MIN/EXEC_MAX parameters invalid or missing from received \
                     configuration. Defaulting to [0s, 1s]"
                );
                (0.0, 1.0)
            }
        }
    }

    /// Fraction of the capacity that must stay free (1 - limit).
    pub fn threshold(&self) -> f64 {
        1.0 - self.resource_limit / 100.0
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::from((self.broadcast_ip, self.protocol_port))
    }

    pub fn decoy(&self) -> Result<&DecoyController> {
        self.decoy.as_ref().ok_or_else(|| FogError::MissingConfigError {
            field: "CONTROLLER:DECOY_MAC/CONTROLLER:DECOY_IP".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> RemoteSettings {
        let map = value.as_object().cloned().unwrap();
        RemoteSettings::from_lookup(|key| map.get(key).and_then(value_to_string))
    }

    #[test]
    fn test_defaults_when_nothing_received() {
        let s = settings(json!({}));
        assert_eq!(s.send_to, SendTo::None);
        assert_eq!(s.protocol_timeout, Duration::from_secs(1));
        assert_eq!(s.protocol_retries, 3);
        assert_eq!(s.udp_port, 7070);
        assert_eq!(s.protocol_port, 7071);
        assert_eq!(s.broadcast_ip, Ipv4Addr::BROADCAST);
        assert_eq!((s.exec_min, s.exec_max), (0.0, 1.0));
        assert_eq!(s.threshold(), 1.0);
        assert!(s.decoy.is_none());
    }

    #[test]
    fn test_broadcast_requires_stp() {
        let s = settings(json!({"PROTOCOL_SEND_TO": "BROADCAST"}));
        assert_eq!(s.send_to, SendTo::None);

        let s = settings(json!({"PROTOCOL_SEND_TO": "BROADCAST", "NETWORK_STP_ENABLED": true}));
        assert_eq!(s.send_to, SendTo::Broadcast);
        assert_eq!(s.send_to.to_string(), "BROADCAST");
    }

    #[test]
    fn test_values_of_any_json_type_are_accepted() {
        let s = settings(json!({
            "PROTOCOL_TIMEOUT": 0.5,
            "PROTOCOL_RETRIES": "5",
            "RESOURCE_LIMIT": 80,
            "SIMULATOR_ACTIVE": "True",
            "NETWORK_ADDRESS": "10.0.0.0/8",
        }));
        assert_eq!(s.protocol_timeout, Duration::from_millis(500));
        assert_eq!(s.protocol_retries, 5);
        assert!(s.simulator_active);
        assert!((s.threshold() - 0.2).abs() < 1e-9);
        assert_eq!(s.broadcast_ip, Ipv4Addr::new(10, 255, 255, 255));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let s = settings(json!({
            "RESOURCE_LIMIT": 150,
            "SIMULATOR_EXEC_MIN": 2,
            "SIMULATOR_EXEC_MAX": 1,
            "PROTOCOL_TIMEOUT": "soon",
            "NETWORK_ADDRESS": "bogus",
        }));
        assert_eq!(s.resource_limit, 0.0);
        assert_eq!((s.exec_min, s.exec_max), (0.0, 1.0));
        assert_eq!(s.protocol_timeout, Duration::from_secs(1));
        assert_eq!(s.broadcast_ip, Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_out_of_range_durations_fall_back() {
        let s = RemoteSettings::from_lookup(|key| match key {
            "PROTOCOL_TIMEOUT" => Some("1e20".to_string()),
            "MONITOR_PERIOD" => Some("-2".to_string()),
            "ORCHESTRATOR_UDP_TIMEOUT" => Some("inf".to_string()),
            "SIMULATOR_EXEC_MIN" => Some("0".to_string()),
            "SIMULATOR_EXEC_MAX" => Some("1e30".to_string()),
            _ => None,
        });
        assert_eq!(s.protocol_timeout, Duration::from_secs(1));
        assert_eq!(s.monitor_period, Duration::from_secs(1));
        assert_eq!(s.udp_timeout, Duration::from_secs(1));
        assert_eq!((s.exec_min, s.exec_max), (0.0, 1.0));
    }

    #[test]
    fn test_decoy_controller_uses_protocol_port() {
        let s = settings(json!({
            "PROTOCOL_SEND_TO": "ORCHESTRATOR",
            "PROTOCOL_PORT": 9000,
            "CONTROLLER_DECOY_MAC": "aa:bb:cc:dd:ee:ff",
            "CONTROLLER_DECOY_IP": "10.0.0.254",
        }));
        assert_eq!(s.send_to, SendTo::Orchestrator);
        let decoy = s.decoy().unwrap();
        assert_eq!(decoy.addr, "10.0.0.254:9000".parse().unwrap());
        assert_eq!(decoy.mac, "aa:bb:cc:dd:ee:ff");
    }
}
