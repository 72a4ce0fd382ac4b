//! In-memory network settings served by `/network/config/*`.
//!
//! Updates are validated as a whole: one bad field rejects the request and
//! leaves the stored settings untouched.

use std::{
    net::Ipv4Addr,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Longest hostname the settings block can hold.
pub const MAX_HOSTNAME_LEN: usize = 31;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetworkSettings {
    pub dhcp_enabled: bool,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns1: Ipv4Addr,
    pub dns2: Ipv4Addr,
    pub hostname: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            dhcp_enabled: false,
            ip: Ipv4Addr::new(192, 168, 178, 65),
            gateway: Ipv4Addr::new(192, 168, 178, 1),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            dns1: Ipv4Addr::new(8, 8, 8, 8),
            dns2: Ipv4Addr::new(8, 8, 4, 4),
            hostname: "esp32-ethernet".to_string(),
        }
    }
}

/// Query parameters of `/network/config/set`. Absent fields keep their value.
#[derive(Debug, Default, Deserialize)]
pub struct NetworkUpdate {
    pub dhcp: Option<String>,
    pub ip: Option<String>,
    pub gateway: Option<String>,
    pub subnet: Option<String>,
    pub dns1: Option<String>,
    pub dns2: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid {field} address")]
    InvalidAddress { field: &'static str },
    #[error("Hostname must be 1 to 31 characters")]
    InvalidHostname,
    #[error("Invalid dhcp value (use 1/0 or true/false)")]
    InvalidFlag,
}

/// Four dot-separated decimal octets, each at most 255. Leading zeros are
/// accepted.
pub fn parse_dotted_quad(text: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for octet in &mut octets {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse::<u16>().ok().and_then(|v| u8::try_from(v).ok())?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

fn parse_flag(text: &str) -> Result<bool, NetworkError> {
    match text {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(NetworkError::InvalidFlag),
    }
}

#[derive(Debug, Default)]
pub struct NetworkStore {
    settings: RwLock<NetworkSettings>,
}

impl NetworkStore {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> NetworkSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate `update` against the current settings and store the result.
    pub fn apply(&self, update: &NetworkUpdate) -> Result<NetworkSettings, NetworkError> {
        let mut guard = self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();

        if let Some(flag) = &update.dhcp {
            next.dhcp_enabled = parse_flag(flag)?;
        }
        for (field, value, slot) in [
            ("ip", &update.ip, &mut next.ip),
            ("gateway", &update.gateway, &mut next.gateway),
            ("subnet", &update.subnet, &mut next.subnet),
            ("dns1", &update.dns1, &mut next.dns1),
            ("dns2", &update.dns2, &mut next.dns2),
        ] {
            if let Some(text) = value {
                *slot = parse_dotted_quad(text).ok_or(NetworkError::InvalidAddress { field })?;
            }
        }
        if let Some(hostname) = &update.hostname {
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return Err(NetworkError::InvalidHostname);
            }
            next.hostname = hostname.clone();
        }

        *guard = next.clone();
        info!(
            dhcp = next.dhcp_enabled,
            ip = %next.ip,
            hostname = %next.hostname,
            "network settings updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_quad_rules() {
        assert_eq!(
            parse_dotted_quad("10.0.0.1"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            parse_dotted_quad("010.000.0.255"),
            Some(Ipv4Addr::new(10, 0, 0, 255))
        );
        for bad in ["", "1.2.3", "1.2.3.4.5", "1.2.3.256", "1..2.3", "a.b.c.d", "1.2.3.-4", "1.2.3.0004"] {
            assert_eq!(parse_dotted_quad(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let store = NetworkStore::default();
        let update = NetworkUpdate {
            ip: Some("192.168.1.50".into()),
            dhcp: Some("1".into()),
            ..NetworkUpdate::default()
        };
        let next = store.apply(&update).unwrap();
        assert_eq!(next.ip, Ipv4Addr::new(192, 168, 1, 50));
        assert!(next.dhcp_enabled);
        assert_eq!(next.gateway, NetworkSettings::default().gateway);
        assert_eq!(store.get(), next);
    }

    #[test]
    fn one_bad_field_rejects_everything() {
        let store = NetworkStore::default();
        let update = NetworkUpdate {
            ip: Some("192.168.1.50".into()),
            dns2: Some("8.8.4".into()),
            ..NetworkUpdate::default()
        };
        assert_eq!(
            store.apply(&update),
            Err(NetworkError::InvalidAddress { field: "dns2" })
        );
        assert_eq!(store.get(), NetworkSettings::default());
    }

    #[test]
    fn hostname_length_is_bounded() {
        let store = NetworkStore::default();
        let long = NetworkUpdate {
            hostname: Some("x".repeat(MAX_HOSTNAME_LEN + 1)),
            ..NetworkUpdate::default()
        };
        assert_eq!(store.apply(&long), Err(NetworkError::InvalidHostname));
        let fits = NetworkUpdate {
            hostname: Some("x".repeat(MAX_HOSTNAME_LEN)),
            ..NetworkUpdate::default()
        };
        assert!(store.apply(&fits).is_ok());
    }

    #[test]
    fn serializes_addresses_as_strings() {
        let json = serde_json::to_value(NetworkSettings::default()).unwrap();
        assert_eq!(json["ip"], "192.168.178.65");
        assert_eq!(json["dhcp_enabled"], false);
        assert_eq!(json["hostname"], "esp32-ethernet");
    }
}
