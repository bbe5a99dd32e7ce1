//! Daemon configuration.
//!
//! Loaded from a TOML file. Module-specific keys live alongside the core
//! keys; each module validates its own keys through `verify_config` before
//! its load commits.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigValidationError};

/// A parsed listen endpoint descriptor.
///
/// Descriptors are strings of the form `tcp:6667` or
/// `ssl:6697:cert=/path/to.pem`, with `\:` escaping a literal colon inside
/// a segment. TLS termination itself is external; `ssl` endpoints only mark
/// accepted connections as secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub port: u16,
    pub options: HashMap<String, String>,
}

impl Endpoint {
    pub fn parse(desc: &str) -> Result<Endpoint, ConfigValidationError> {
        let segments = split_unescape(desc);
        let mut it = segments.into_iter();
        let scheme = it
            .next()
            .ok_or_else(|| ConfigValidationError::new("bind", "empty endpoint descriptor"))?;
        let secure = match scheme.as_str() {
            "tcp" => false,
            "ssl" | "tls" => true,
            other => {
                return Err(ConfigValidationError::new(
                    "bind",
                    format!("unknown endpoint scheme '{other}'"),
                ));
            }
        };
        let port = it
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                ConfigValidationError::new("bind", format!("missing or invalid port in '{desc}'"))
            })?;
        let mut options = HashMap::new();
        for segment in it {
            match segment.split_once('=') {
                Some((k, v)) => {
                    options.insert(k.to_string(), v.to_string());
                }
                None => {
                    options.insert(segment, String::new());
                }
            }
        }
        Ok(Endpoint {
            secure,
            port,
            options,
        })
    }
}

/// Split an endpoint descriptor on `:`, honoring `\:` escapes.
fn split_unescape(desc: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = desc.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => {
                segments.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

/// An operator credential block.
#[derive(Debug, Clone, Deserialize)]
pub struct OperBlock {
    pub name: String,
    pub password: String,
}

/// A server link credential block: inbound peers authenticate against this.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: String,
    pub server_id: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub bind_client: Vec<String>,
    #[serde(default)]
    pub bind_server: Vec<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default = "default_motd_line_length")]
    pub motd_line_length: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default)]
    pub oper_hosts: Vec<String>,
    #[serde(default)]
    pub opers: Vec<OperBlock>,
    #[serde(default)]
    pub links: Vec<LinkBlock>,
    #[serde(default)]
    pub vhosts: HashMap<String, String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_max_data")]
    pub max_data: u64,
    #[serde(default = "default_max_connections_per_peer")]
    pub max_connections_per_peer: u32,
    #[serde(default)]
    pub max_connection_exempt: HashMap<String, u32>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_timeout_delay")]
    pub timeout_delay: u64,
    #[serde(default = "default_kick_length")]
    pub kick_length: usize,
    #[serde(default = "default_ident_length")]
    pub ident_length: usize,
    #[serde(default = "default_gecos_length")]
    pub gecos_length: usize,
    #[serde(default = "default_part_message_length")]
    pub part_message_length: usize,
    #[serde(default = "default_connlimit_globmax")]
    pub connlimit_globmax: u32,
    #[serde(default)]
    pub connlimit_whitelist: Vec<String>,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

fn default_hostname() -> String {
    "localhost".to_string()
}
fn default_motd_line_length() -> usize {
    80
}
fn default_client_timeout() -> u64 {
    180
}
fn default_max_data() -> u64 {
    5000
}
fn default_max_connections_per_peer() -> u32 {
    3
}
fn default_ping_interval() -> u64 {
    30
}
fn default_timeout_delay() -> u64 {
    90
}
fn default_kick_length() -> usize {
    255
}
fn default_ident_length() -> usize {
    12
}
fn default_gecos_length() -> usize {
    128
}
fn default_part_message_length() -> usize {
    300
}
fn default_connlimit_globmax() -> u32 {
    3
}
fn default_storage_path() -> String {
    "data.json".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the core keys. Module keys are validated by the modules
    /// themselves at load time.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.is_empty() {
            return Err(ConfigValidationError::new("name", "must not be empty"));
        }
        if self.server_id.is_empty() {
            return Err(ConfigValidationError::new("server_id", "must not be empty"));
        }
        for desc in self.bind_client.iter().chain(self.bind_server.iter()) {
            Endpoint::parse(desc)?;
        }
        for ip in self.max_connection_exempt.keys() {
            ip.parse::<IpAddr>().map_err(|_| {
                ConfigValidationError::new("max_connection_exempt", "keys must be IP addresses")
            })?;
        }
        if self.kick_length > 255 {
            return Err(ConfigValidationError::new(
                "kick_length",
                "must not exceed 255",
            ));
        }
        if self.ping_interval == 0 || self.timeout_delay == 0 {
            return Err(ConfigValidationError::new(
                "ping_interval",
                "intervals must be positive",
            ));
        }
        Ok(())
    }

    /// Per-IP accept limit, honoring exemption overrides.
    pub fn connection_limit_for(&self, ip: &IpAddr) -> u32 {
        self.max_connection_exempt
            .get(&ip.to_string())
            .copied()
            .unwrap_or(self.max_connections_per_peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            name = "irc.example.com"
            server_id = "001"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_applied() {
        let config = minimal();
        assert_eq!(config.ping_interval, 30);
        assert_eq!(config.timeout_delay, 90);
        assert_eq!(config.ident_length, 12);
        assert_eq!(config.gecos_length, 128);
        assert_eq!(config.kick_length, 255);
        assert_eq!(config.connlimit_globmax, 3);
        config.validate().unwrap();
    }

    #[test]
    fn endpoint_parse_plain() {
        let ep = Endpoint::parse("tcp:6667").unwrap();
        assert!(!ep.secure);
        assert_eq!(ep.port, 6667);
    }

    #[test]
    fn endpoint_parse_ssl_with_options() {
        let ep = Endpoint::parse("ssl:6697:cert=/etc/irc/cert.pem").unwrap();
        assert!(ep.secure);
        assert_eq!(ep.port, 6697);
        assert_eq!(
            ep.options.get("cert").map(String::as_str),
            Some("/etc/irc/cert.pem")
        );
    }

    #[test]
    fn endpoint_parse_escaped_colon() {
        let ep = Endpoint::parse(r"ssl:6697:cert=C\:\irc\cert.pem").unwrap();
        assert_eq!(
            ep.options.get("cert").map(String::as_str),
            Some(r"C:\irc\cert.pem")
        );
    }

    #[test]
    fn endpoint_rejects_bad_scheme_and_port() {
        assert!(Endpoint::parse("udp:6667").is_err());
        assert!(Endpoint::parse("tcp:notaport").is_err());
        assert!(Endpoint::parse("tcp").is_err());
    }

    #[test]
    fn validate_rejects_oversized_kick_length() {
        let mut config = minimal();
        config.kick_length = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn exempt_overrides_apply() {
        let mut config = minimal();
        config
            .max_connection_exempt
            .insert("10.0.0.1".to_string(), 100);
        let exempt: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(config.connection_limit_for(&exempt), 100);
        assert_eq!(config.connection_limit_for(&other), 3);
    }
}
