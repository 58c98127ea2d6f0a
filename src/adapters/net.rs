use crate::domain::model::Interface;
use crate::utils::error::{FogError, Result};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::str::FromStr;
use sysinfo::Networks;

pub const LOOPBACK_IFACE: &str = "lo";

/// IPv4 network in CIDR notation (e.g. 10.0.0.0/8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(FogError::InvalidConfigValueError {
                field: "NETWORK:ADDRESS".to_string(),
                value: format!("{}/{}", addr, prefix),
                reason: "prefix must be between 0 and 32".to_string(),
            });
        }
        Ok(Self { addr, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }
}

impl FromStr for Ipv4Cidr {
    type Err = FogError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FogError::InvalidConfigValueError {
            field: "NETWORK:ADDRESS".to_string(),
            value: s.to_string(),
            reason: "must be an IPv4 network like 10.0.0.0/8".to_string(),
        };

        // 沒有前綴長度時視為單一主機 (/32)
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().map_err(|_| invalid())?),
            None => (s.trim(), 32),
        };
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

/// "Primary" IP of the node (the one with a default route).
pub fn primary_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            // 不需要真的可達
            socket.connect("10.254.254.254:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// OS interfaces except loopback, with their MAC and IPv4 addresses.
pub fn discover_interfaces() -> Vec<(Interface, Option<Ipv4Cidr>)> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<(Interface, Option<Ipv4Cidr>)> = networks
        .list()
        .iter()
        .filter(|(name, _)| name.as_str() != LOOPBACK_IFACE)
        .map(|(name, data)| {
            let mut iface = Interface::new(name.clone());
            let mac = data.mac_address().to_string();
            if mac != "00:00:00:00:00:00" {
                iface.mac = Some(mac);
            }
            let cidr = data.ip_networks().iter().find_map(|net| match net.addr {
                IpAddr::V4(v4) => Ipv4Cidr::new(v4, net.prefix).ok(),
                IpAddr::V6(_) => None,
            });
            iface.ipv4 = cidr.map(|c| c.addr.to_string());
            (iface, cidr)
        })
        .collect();
    interfaces.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    interfaces
}

/// Picks the interface attached to the configured network, falling back to
/// the one holding the primary IP.
pub fn main_interface(
    interfaces: &[(Interface, Option<Ipv4Cidr>)],
    network: Option<Ipv4Cidr>,
    primary: IpAddr,
) -> Option<String> {
    let on_network = network.and_then(|network| {
        interfaces.iter().find(|(_, cidr)| {
            cidr.map(|c| network.contains(c.addr) && c.broadcast() == network.broadcast())
                .unwrap_or(false)
        })
    });

    on_network
        .or_else(|| {
            interfaces
                .iter()
                .find(|(_, cidr)| cidr.map(|c| IpAddr::V4(c.addr) == primary).unwrap_or(false))
        })
        .map(|(iface, _)| iface.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_broadcast() {
        let net: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(net.broadcast(), Ipv4Addr::new(10, 255, 255, 255));
        assert!(net.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 0, 1)));

        let host: Ipv4Cidr = "192.168.1.7".parse().unwrap();
        assert_eq!(host.broadcast(), Ipv4Addr::new(192, 168, 1, 7));

        let all: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.broadcast(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("not-an-ip".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_main_interface_prefers_configured_network() {
        let eth0 = Interface::new("eth0");
        let eth1 = Interface::new("eth1");
        let interfaces = vec![
            (eth0, Some(Ipv4Cidr::new(Ipv4Addr::new(172, 17, 0, 2), 16).unwrap())),
            (eth1, Some(Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 5), 8).unwrap())),
        ];
        let network = Some("10.0.0.0/8".parse().unwrap());
        let primary = IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2));

        assert_eq!(main_interface(&interfaces, network, primary).as_deref(), Some("eth1"));
        assert_eq!(main_interface(&interfaces, None, primary).as_deref(), Some("eth0"));
    }
}
