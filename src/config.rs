use std::{path::PathBuf, time::Duration};

use config::Config;
use serde::Deserialize;

use crate::utils::error::HealthCheckError;

/// Legacy variable that sizes the admission gate, honoured for existing deployments.
const LEGACY_PARALLELISM_VAR: &str = "MAX_PARALLEL_CHECKS";

/// Configuration settings for the health-check server.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// The address the server binds to.
    pub host: String,
    /// The port on which the server will listen.
    pub port: u16,
    /// Maximum number of external checks running at once across all clients.
    pub max_parallel_checks: usize,
    /// Length of the per-client rate limit window, in seconds.
    pub rate_limit_window_secs: u64,
    /// Checks a single client may start within one window.
    pub rate_limit_max_requests: usize,
    /// Time budget for one run of the check routine, in seconds.
    pub check_timeout_secs: u64,
    /// Executable invoked for every check.
    pub check_script: PathBuf,
    /// Landing page served verbatim on `/`.
    pub index_path: PathBuf,
    /// The maximum number of simultaneous WebSocket sessions allowed.
    pub max_connections: usize,
    /// WebSocket upgrades a single client may perform per second. Zero disables the throttle.
    pub connection_rate_limit: u32,
    /// Largest inbound text frame accepted as a check request, in bytes.
    pub max_message_size: usize,
    /// Path to the TLS certificate file.
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub tls_key_path: PathBuf,
    /// Whether TLS is enabled for secure communication.
    pub enable_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_parallel_checks: 10,
            rate_limit_window_secs: 900,
            rate_limit_max_requests: 3,
            check_timeout_secs: 30,
            check_script: PathBuf::from("/app/scripts/check.sh"),
            index_path: PathBuf::from("/app/frontend/index.html"),
            max_connections: 10_000,
            connection_rate_limit: 10,
            max_message_size: 4096,
            tls_cert_path: PathBuf::from("certs/cert.pem"),
            tls_key_path: PathBuf::from("certs/key.pem"),
            enable_tls: false,
        }
    }
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `MAILCHECK_`, e.g.
    /// `MAILCHECK_CHECK_TIMEOUT_SECS=45`. Unset keys keep their defaults.
    /// `MAX_PARALLEL_CHECKS` overrides `max_parallel_checks` when present.
    ///
    /// # Errors
    /// Returns a `HealthCheckError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, HealthCheckError> {
        Config::builder()
            .add_source(config::Environment::with_prefix("MAILCHECK").try_parsing(true))
            .set_override_option(
                "max_parallel_checks",
                std::env::var(LEGACY_PARALLELISM_VAR).ok(),
            )?
            .build()?
            .try_deserialize()
            .map_err(HealthCheckError::from)
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `HealthCheckError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), HealthCheckError> {
        let invalid = |msg: &str| Err(HealthCheckError::ConfigurationError(msg.into()));

        if self.max_parallel_checks == 0 {
            return invalid("max_parallel_checks must be greater than 0");
        }
        if self.rate_limit_max_requests == 0 {
            return invalid("rate_limit_max_requests must be greater than 0");
        }
        if self.rate_limit_window_secs == 0 {
            return invalid("rate_limit_window_secs must be greater than 0");
        }
        if self.check_timeout_secs == 0 {
            return invalid("check_timeout_secs must be greater than 0");
        }
        if self.max_message_size == 0 {
            return invalid("max_message_size must be greater than 0");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be greater than 0");
        }
        if self.max_connections > 10_000 {
            return invalid("max_connections cannot exceed 10,000");
        }

        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(HealthCheckError::ConfigurationError(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(HealthCheckError::ConfigurationError(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        Ok(())
    }

    /// The `host:port` pair the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_parallel_checks, 10);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(900));
        assert_eq!(config.rate_limit_max_requests, 3);
        assert_eq!(config.check_timeout(), Duration::from_secs(30));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cases: [fn(&mut ServerConfig); 4] = [
            |c| c.max_parallel_checks = 0,
            |c| c.rate_limit_max_requests = 0,
            |c| c.rate_limit_window_secs = 0,
            |c| c.check_timeout_secs = 0,
        ];

        for mutate in cases {
            let mut config = ServerConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(HealthCheckError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn connection_bounds_are_enforced() {
        let config = ServerConfig {
            max_connections: 10_001,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_requires_existing_files() {
        let config = ServerConfig {
            enable_tls: true,
            tls_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Certificate file not found"));
    }
}
