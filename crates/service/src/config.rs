//! Service configuration.

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::errors::ServiceError;

/// Default busy-poll timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2000;

/// Default service name used in logs and by platform integrations.
const DEFAULT_SERVICE_NAME: &str = "warden";

/// Static configuration for one service process.
///
/// Only the busy-poll timeout feeds the core loop; everything else is
/// consumed by startup plumbing and platform integrations.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, for logs and service-manager registration.
    pub service_name: String,

    /// Timeout in milliseconds to wait on asynchronous worker operations
    /// before giving feedback to the user or control plane again.
    pub busy_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ServiceError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ServiceError::ConfigParse {
            path: path.to_owned(),
            source,
        })
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// The busy-poll timeout as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Wait hint handed to the control plane with each notification.
    ///
    /// Twice the busy timeout, so a watchdog tolerates one full poll plus
    /// the report that follows it.
    pub fn wait_hint(&self) -> Duration {
        self.busy_timeout() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.service_name, "warden");
        assert_eq!(cfg.busy_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.wait_hint(), Duration::from_millis(4000));
    }

    #[test]
    fn test_parse_full() {
        let cfg = ServiceConfig::from_toml_str(
            r#"
            service_name = "calc-bridge"
            busy_timeout_ms = 250
            "#,
        )
        .expect("test: parse config");

        assert_eq!(cfg.service_name, "calc-bridge");
        assert_eq!(cfg.busy_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.wait_hint(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_partial_falls_back() {
        let cfg =
            ServiceConfig::from_toml_str("busy_timeout_ms = 50").expect("test: parse config");
        assert_eq!(cfg.service_name, "warden");
        assert_eq!(cfg.busy_timeout_ms, 50);
    }

    #[test]
    fn test_missing_file_errors() {
        let res = ServiceConfig::from_toml_file("/nonexistent/warden.toml");
        assert!(matches!(res, Err(ServiceError::ConfigRead { .. })));
    }
}
