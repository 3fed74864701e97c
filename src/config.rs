//! Configuration for `[routing]` sections.
//!
//! The relay reads an INI-style configuration file; each `[routing]`
//! section (optionally keyed, `[routing:ro]`) describes one routing
//! service. Option validation mirrors the section/option error wording the
//! host process reports, so a misconfigured file fails fast at startup
//! with a message naming the offending option.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::proxy::{split_addr_port, AbacConfig, AccessMode, TcpEndpoint};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_CONNECT_TIMEOUT: u16 = 1;
const DEFAULT_MAX_CONNECTIONS: u16 = 512;
const DEFAULT_MAX_CONNECT_ERRORS: u32 = 100;
const DEFAULT_CLIENT_CONNECT_TIMEOUT: u32 = 9;
const DEFAULT_NET_BUFFER_LENGTH: u32 = 16384;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("in [{section}]: {message}")]
    Section { section: String, message: String },

    #[error("option {option} in [{section}] is required")]
    Required { option: String, section: String },

    #[error(
        "option {option} in [{section}] needs value between {min} and {max} inclusive, was '{value}'"
    )]
    Range {
        option: String,
        section: String,
        min: u64,
        max: u64,
        value: String,
    },

    #[error("option {option} in [{section}] is incorrect ({reason})")]
    Incorrect {
        option: String,
        section: String,
        reason: String,
    },

    #[error("option {option} in [{section}] is invalid; {message}")]
    Invalid {
        option: String,
        section: String,
        message: String,
    },

    #[error("invalid configuration line {line}: '{text}'")]
    Syntax { line: usize, text: String },
}

/// One `[name]` or `[name:key]` section with its `option = value` pairs.
#[derive(Debug, Clone)]
pub struct ConfigSection {
    pub name: String,
    pub key: Option<String>,
    options: BTreeMap<String, String>,
}

impl ConfigSection {
    pub fn new(name: impl Into<String>, key: Option<String>) -> Self {
        Self {
            name: name.into(),
            key,
            options: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, option: impl Into<String>, value: impl Into<String>) {
        self.options.insert(option.into(), value.into());
    }

    pub fn get(&self, option: &str) -> Option<&str> {
        self.options.get(option).map(String::as_str)
    }

    /// Section label as it appears in error messages: `routing` or
    /// `routing:key`.
    pub fn label(&self) -> String {
        match &self.key {
            Some(key) => format!("{}:{}", self.name, key),
            None => self.name.clone(),
        }
    }
}

/// Parse an INI-style configuration text into sections.
///
/// Lines are `[section]`, `[section:key]`, `option = value`, comments
/// (`#` or `;`), or blank.
pub fn parse_config(text: &str) -> Result<Vec<ConfigSection>, ConfigError> {
    let mut sections: Vec<ConfigSection> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let (name, key) = match header.split_once(':') {
                Some((name, key)) => (name.trim(), Some(key.trim().to_string())),
                None => (header.trim(), None),
            };
            sections.push(ConfigSection::new(name, key));
            continue;
        }

        let Some((option, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: index + 1,
                text: raw.to_string(),
            });
        };
        let Some(section) = sections.last_mut() else {
            return Err(ConfigError::Syntax {
                line: index + 1,
                text: raw.to_string(),
            });
        };
        section.set(option.trim(), value.trim());
    }
    Ok(sections)
}

/// Validated settings of one routing service.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Section label, used as the route name in logs.
    pub name: String,
    pub destinations: String,
    pub bind_address: TcpEndpoint,
    pub mode: AccessMode,
    /// Backend connect timeout, seconds.
    pub connect_timeout: u16,
    pub max_connections: u16,
    pub max_connect_errors: u32,
    /// Handshake readiness timeout, seconds.
    pub client_connect_timeout: u32,
    /// Splice buffer size, bytes.
    pub net_buffer_length: u32,
    pub abac: AbacConfig,
}

impl RoutingConfig {
    pub fn from_section(section: &ConfigSection) -> Result<Self, ConfigError> {
        let label = section.label();

        let destinations = required_string(section, &label, "destinations")?;
        let mode_text = required_string(section, &label, "mode")?;
        let mode = match mode_text.as_str() {
            "read-only" => AccessMode::ReadOnly,
            "read-write" => AccessMode::ReadWrite,
            other => {
                return Err(ConfigError::Invalid {
                    option: "mode".to_string(),
                    section: label,
                    message: format!("valid are read-write and read-only (was '{other}')"),
                })
            }
        };

        let bind_port = match section.get("bind_port") {
            Some(value) => Some(get_uint(&label, "bind_port", value, 1, 65535)? as u16),
            None => None,
        };
        let bind_address_option = section.get("bind_address");
        if bind_port.is_none() && bind_address_option.is_none() {
            return Err(ConfigError::Section {
                section: label,
                message: "either bind_port or bind_address is required".to_string(),
            });
        }
        let (bind_host, address_port) = match bind_address_option {
            Some(value) => {
                let (host, port) =
                    split_addr_port(value).map_err(|e| ConfigError::Incorrect {
                        option: "bind_address".to_string(),
                        section: label.clone(),
                        reason: e.to_string(),
                    })?;
                (host, (port != 0).then_some(port))
            }
            None => (DEFAULT_BIND_ADDRESS.to_string(), None),
        };
        let Some(port) = address_port.or(bind_port) else {
            return Err(ConfigError::Section {
                section: label,
                message: "no bind_port, and TCP port in bind_address is not valid".to_string(),
            });
        };
        let bind_address = TcpEndpoint::new(bind_host, port);

        let connect_timeout = get_uint_or(
            section,
            &label,
            "connect_timeout",
            1,
            65535,
            u64::from(DEFAULT_CONNECT_TIMEOUT),
        )? as u16;
        let max_connections = get_uint_or(
            section,
            &label,
            "max_connections",
            1,
            65535,
            u64::from(DEFAULT_MAX_CONNECTIONS),
        )? as u16;
        let max_connect_errors = get_uint_or(
            section,
            &label,
            "max_connect_errors",
            1,
            u64::from(u32::MAX),
            u64::from(DEFAULT_MAX_CONNECT_ERRORS),
        )? as u32;
        let client_connect_timeout = get_uint_or(
            section,
            &label,
            "client_connect_timeout",
            2,
            31_536_000,
            u64::from(DEFAULT_CLIENT_CONNECT_TIMEOUT),
        )? as u32;
        let net_buffer_length = get_uint_or(
            section,
            &label,
            "net_buffer_length",
            1024,
            1_048_576,
            u64::from(DEFAULT_NET_BUFFER_LENGTH),
        )? as u32;

        let abac = AbacConfig {
            enabled: get_uint_or(section, &label, "abac_enabled", 0, 2, 0)? != 0,
            host: optional_string(section, "abac_host"),
            port: get_uint_or(section, &label, "abac_port", 0, 65535, 0)? as u16,
            id: optional_string(section, "abac_id"),
            principal_id: optional_string(section, "abac_principal_id"),
            test_ip: optional_string(section, "abac_test_ip"),
            test_port: get_uint_or(section, &label, "abac_test_port", 1, 65535, 1)? as u16,
        };

        Ok(Self {
            name: section.label(),
            destinations,
            bind_address,
            mode,
            connect_timeout,
            max_connections,
            max_connect_errors,
            client_connect_timeout,
            net_buffer_length,
            abac,
        })
    }
}

fn required_string(
    section: &ConfigSection,
    label: &str,
    option: &str,
) -> Result<String, ConfigError> {
    match section.get(option) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConfigError::Required {
            option: option.to_string(),
            section: label.to_string(),
        }),
    }
}

fn optional_string(section: &ConfigSection, option: &str) -> String {
    section.get(option).unwrap_or_default().to_string()
}

fn get_uint(label: &str, option: &str, value: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(parsed) if (min..=max).contains(&parsed) => Ok(parsed),
        _ => Err(ConfigError::Range {
            option: option.to_string(),
            section: label.to_string(),
            min,
            max,
            value: value.to_string(),
        }),
    }
}

fn get_uint_or(
    section: &ConfigSection,
    label: &str,
    option: &str,
    min: u64,
    max: u64,
    default: u64,
) -> Result<u64, ConfigError> {
    match section.get(option) {
        Some(value) => get_uint(label, option, value, min, max),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_section(extra: &[(&str, &str)]) -> ConfigSection {
        let mut section = ConfigSection::new("routing", None);
        section.set("destinations", "127.0.0.1:3306");
        section.set("mode", "read-only");
        for (option, value) in extra {
            section.set(*option, *value);
        }
        section
    }

    #[test]
    fn missing_bind_address_and_port() {
        let err = RoutingConfig::from_section(&routing_section(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routing]: either bind_port or bind_address is required"
        );
    }

    #[test]
    fn missing_port_in_bind_address() {
        let section = routing_section(&[("bind_address", "127.0.0.1")]);
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routing]: no bind_port, and TCP port in bind_address is not valid"
        );
    }

    #[test]
    fn invalid_port_in_bind_address() {
        let section = routing_section(&[("bind_address", "127.0.0.1:999292")]);
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option bind_address in [routing] is incorrect (invalid TCP port: invalid characters or too long)"
        );
    }

    #[test]
    fn invalid_bind_port() {
        let section = routing_section(&[("bind_port", "23123124123123")]);
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option bind_port in [routing] needs value between 1 and 65535 inclusive, was '23123124123123'"
        );
    }

    #[test]
    fn bind_port_with_default_address() {
        let section = routing_section(&[("bind_port", "7001")]);
        let config = RoutingConfig::from_section(&section).unwrap();
        assert_eq!(config.bind_address, TcpEndpoint::new("0.0.0.0", 7001));
        assert_eq!(config.mode, AccessMode::ReadOnly);
        assert_eq!(config.connect_timeout, 1);
        assert_eq!(config.max_connections, 512);
        assert_eq!(config.max_connect_errors, 100);
        assert_eq!(config.client_connect_timeout, 9);
        assert_eq!(config.net_buffer_length, 16384);
        assert!(!config.abac.enabled);
        assert_eq!(config.abac.test_port, 1);
    }

    #[test]
    fn bind_address_port_wins_over_bind_port() {
        let section = routing_section(&[
            ("bind_port", "7001"),
            ("bind_address", "192.168.1.10:7002"),
        ]);
        let config = RoutingConfig::from_section(&section).unwrap();
        assert_eq!(config.bind_address, TcpEndpoint::new("192.168.1.10", 7002));
    }

    #[test]
    fn missing_mode() {
        let mut section = ConfigSection::new("routing", None);
        section.set("destinations", "127.0.0.1:3306");
        section.set("bind_port", "7001");
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(err.to_string(), "option mode in [routing] is required");
    }

    #[test]
    fn invalid_mode() {
        let section = routing_section(&[("bind_port", "7001"), ("mode", "read-mostly")]);
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option mode in [routing] is invalid; valid are read-write and read-only (was 'read-mostly')"
        );
    }

    #[test]
    fn keyed_section_label_in_errors() {
        let mut section = ConfigSection::new("routing", Some("ro".to_string()));
        section.set("destinations", "127.0.0.1:3306");
        section.set("mode", "read-only");
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in [routing:ro]: either bind_port or bind_address is required"
        );
    }

    #[test]
    fn range_violation_reports_bounds() {
        let section = routing_section(&[("bind_port", "7001"), ("client_connect_timeout", "1")]);
        let err = RoutingConfig::from_section(&section).unwrap_err();
        assert_eq!(
            err.to_string(),
            "option client_connect_timeout in [routing] needs value between 2 and 31536000 inclusive, was '1'"
        );
    }

    #[test]
    fn abac_options() {
        let section = routing_section(&[
            ("bind_port", "7001"),
            ("abac_enabled", "1"),
            ("abac_host", "10.0.0.9"),
            ("abac_port", "8080"),
            ("abac_id", "object-7"),
            ("abac_principal_id", "relay-1"),
        ]);
        let config = RoutingConfig::from_section(&section).unwrap();
        assert!(config.abac.enabled);
        assert_eq!(config.abac.host, "10.0.0.9");
        assert_eq!(config.abac.port, 8080);
        assert_eq!(config.abac.id, "object-7");
        assert_eq!(config.abac.principal_id, "relay-1");
    }

    #[test]
    fn parses_sections_and_comments() {
        let text = "\
# relay configuration
[routing:ro]
destinations = 10.0.10.5,10.0.11.6:3307
mode = read-only
bind_port = 7001

[routing:rw]
destinations = 10.0.10.5
mode = read-write
bind_address = 127.0.0.1:7002
";
        let sections = parse_config(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].label(), "routing:ro");
        assert_eq!(sections[0].get("bind_port"), Some("7001"));
        assert_eq!(sections[1].get("bind_address"), Some("127.0.0.1:7002"));
    }

    #[test]
    fn rejects_option_outside_section() {
        let err = parse_config("mode = read-only\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }
}
