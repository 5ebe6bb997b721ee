//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Protocol-standard SMTP port. Usually needs privileges to bind.
pub const STANDARD_SMTP_PORT: u16 = 25;

/// Default unprivileged listen port.
pub const DEFAULT_SMTP_PORT: u16 = 2525;

/// SMTP listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind (all interfaces by default).
    pub bind: String,
    /// Port to bind.
    pub port: u16,
    /// Port tried when `port` is refused for lack of privilege. `None` disables.
    pub fallback_port: Option<u16>,
    /// Name announced in the 220 greeting and EHLO reply.
    pub hostname: String,
    /// Maximum number of concurrently open connections.
    pub max_connections: usize,
    /// Maximum accepted message size in bytes.
    pub max_message_bytes: usize,
    /// Per-read idle timeout.
    pub idle_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_SMTP_PORT,
            fallback_port: Some(DEFAULT_SMTP_PORT),
            hostname: "localhost".to_string(),
            max_connections: 128,
            max_message_bytes: 10 * 1024 * 1024,
            idle_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Full service configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub listener: ListenerConfig,
    /// Local-part marker preceding `-<tenant>` in recipient addresses.
    pub address_marker: String,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Capacity of the diagnostic ring buffer. 0 disables it.
    pub diagnostics_capacity: usize,
    /// Optional directory for a daily-rotated log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            address_marker: crate::routing::DEFAULT_MARKER.to_string(),
            db_path: PathBuf::from("./data/mailbox.db"),
            diagnostics_capacity: 100,
            log_dir: None,
        }
    }
}

impl IngestConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let fallback_port = match lookup("MAILBOX_SMTP_FALLBACK_PORT") {
            Some(raw) => match parse_value::<u16>("MAILBOX_SMTP_FALLBACK_PORT", &raw)? {
                0 => None,
                port => Some(port),
            },
            None => defaults.listener.fallback_port,
        };

        let idle_secs: u64 = parse_or(
            &lookup,
            "MAILBOX_IDLE_TIMEOUT_SECS",
            defaults.listener.idle_timeout.as_secs(),
        )?;
        if idle_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILBOX_IDLE_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let max_connections: usize = parse_or(
            &lookup,
            "MAILBOX_MAX_CONNECTIONS",
            defaults.listener.max_connections,
        )?;
        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILBOX_MAX_CONNECTIONS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidValue {
                key: "MAILBOX_MAX_CONNECTIONS".into(),
                message: format!("must not exceed {}", Semaphore::MAX_PERMITS),
            });
        }

        let listener = ListenerConfig {
            bind: lookup("MAILBOX_SMTP_BIND").unwrap_or(defaults.listener.bind),
            port: parse_or(&lookup, "MAILBOX_SMTP_PORT", defaults.listener.port)?,
            fallback_port,
            hostname: lookup("MAILBOX_SMTP_HOSTNAME").unwrap_or(defaults.listener.hostname),
            max_connections,
            max_message_bytes: parse_or(
                &lookup,
                "MAILBOX_MAX_MESSAGE_BYTES",
                defaults.listener.max_message_bytes,
            )?,
            idle_timeout: Duration::from_secs(idle_secs),
        };

        let address_marker = lookup("MAILBOX_ADDRESS_MARKER").unwrap_or(defaults.address_marker);
        if address_marker.contains('@') || address_marker.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                key: "MAILBOX_ADDRESS_MARKER".into(),
                message: format!("{address_marker:?} cannot appear in a local-part"),
            });
        }

        Ok(Self {
            listener,
            address_marker,
            db_path: lookup("MAILBOX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            diagnostics_capacity: parse_or(
                &lookup,
                "MAILBOX_DIAGNOSTICS_CAPACITY",
                defaults.diagnostics_capacity,
            )?,
            log_dir: lookup("MAILBOX_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<IngestConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IngestConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listener.bind, "0.0.0.0");
        assert_eq!(config.listener.port, 2525);
        assert_eq!(config.listener.fallback_port, Some(2525));
        assert_eq!(config.listener.max_connections, 128);
        assert_eq!(config.listener.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.address_marker, "mail");
        assert_eq!(config.diagnostics_capacity, 100);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("MAILBOX_SMTP_PORT", "25"),
            ("MAILBOX_SMTP_HOSTNAME", "mx.example.com"),
            ("MAILBOX_MAX_CONNECTIONS", "4"),
            ("MAILBOX_ADDRESS_MARKER", "user"),
            ("MAILBOX_DB_PATH", "/tmp/box.db"),
            ("MAILBOX_LOG_DIR", "/var/log/mailbox"),
        ])
        .unwrap();
        assert_eq!(config.listener.port, 25);
        assert_eq!(config.listener.hostname, "mx.example.com");
        assert_eq!(config.listener.max_connections, 4);
        assert_eq!(config.address_marker, "user");
        assert_eq!(config.db_path, PathBuf::from("/tmp/box.db"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/mailbox")));
    }

    #[test]
    fn zero_fallback_port_disables_fallback() {
        let config = config_from(&[("MAILBOX_SMTP_FALLBACK_PORT", "0")]).unwrap();
        assert_eq!(config.listener.fallback_port, None);
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = config_from(&[("MAILBOX_SMTP_PORT", "  ")]).unwrap();
        assert_eq!(config.listener.port, 2525);
    }

    #[test]
    fn invalid_port_is_reported() {
        let err = config_from(&[("MAILBOX_SMTP_PORT", "smtp")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "MAILBOX_SMTP_PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_connection_cap_is_rejected() {
        assert!(config_from(&[("MAILBOX_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn connection_cap_beyond_semaphore_limit_is_rejected() {
        let err = config_from(&[("MAILBOX_MAX_CONNECTIONS", "18446744073709551615")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "MAILBOX_MAX_CONNECTIONS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn huge_diagnostics_capacity_is_accepted() {
        let config = config_from(&[("MAILBOX_DIAGNOSTICS_CAPACITY", "18446744073709551615")]).unwrap();
        assert_eq!(config.diagnostics_capacity, usize::MAX);
    }

    #[test]
    fn marker_with_at_sign_is_rejected() {
        assert!(config_from(&[("MAILBOX_ADDRESS_MARKER", "mail@")]).is_err());
    }
}
