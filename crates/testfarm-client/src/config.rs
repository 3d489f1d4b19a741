//! Client settings, loadable from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::retry::RetryConfig;
use crate::tcp::TcpTransportConfig;

/// Host name advertised when none is configured.
pub const DEFAULT_ADVERTISED_HOST: &str = "localhost";

/// Settings of a [`FarmClient`](crate::client::FarmClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interface the inbound listener binds to.
    pub bind_host: String,
    /// First port tried for the inbound listener; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Further ports tried when the listen port is taken.
    pub port_probe_limit: u16,
    /// Host name peers use to reach this client.
    pub advertised_host: Option<String>,
    /// Delivery attempts per message.
    pub retry_attempts: u32,
    /// Pause between delivery attempts.
    pub retry_backoff_ms: u64,
    /// Bound on establishing an outbound connection.
    pub connect_timeout_ms: u64,
    /// Bound on each read of an inbound connection.
    pub read_timeout_ms: u64,
    /// Quiet period after which a service channel checks its tests.
    pub idle_check_ms: u64,
    /// Read buffer size for file reception.
    pub chunk_size: usize,
    /// Re-GETs per file before the test is stopped.
    pub max_file_regets: u32,
    /// Shut down once the last test leaves.
    pub shutdown_when_idle: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_host: String::from("0.0.0.0"),
            listen_port: 5451,
            port_probe_limit: 100,
            advertised_host: None,
            retry_attempts: 3,
            retry_backoff_ms: 30_000,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 60_000,
            idle_check_ms: 900_000,
            chunk_size: 8192,
            max_file_regets: 3,
            shutdown_when_idle: true,
        }
    }
}

impl ClientConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ClientConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ClientConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Host name put in the sender field of outgoing messages.
    pub fn advertised_host(&self) -> &str {
        self.advertised_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(DEFAULT_ADVERTISED_HOST)
    }

    /// Retry policy for every channel.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Settings for outbound connections.
    pub fn transport(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            nodelay: true,
        }
    }

    /// Channel settings for a channel called `name`.
    pub fn channel(&self, name: impl Into<String>) -> ChannelConfig {
        ChannelConfig {
            name: name.into(),
            retry: self.retry(),
            idle_after: self.idle_check(),
        }
    }

    /// Inbound read bound.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Service channel idle period.
    pub fn idle_check(&self) -> Duration {
        Duration::from_millis(self.idle_check_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.listen_port, 5451);
        assert_eq!(config.port_probe_limit, 100);
        assert_eq!(config.advertised_host(), "localhost");
        assert_eq!(config.retry().max_attempts, 3);
        assert_eq!(config.retry().backoff, Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.idle_check(), Duration::from_secs(900));
        assert_eq!(config.chunk_size, 8192);
        assert!(config.shutdown_when_idle);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
listen_port = 6000
advertised_host = "builder-7"
retry_attempts = 5
shutdown_when_idle = false
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.advertised_host(), "builder-7");
        assert_eq!(config.retry_attempts, 5);
        assert!(!config.shutdown_when_idle);
        assert_eq!(config.chunk_size, 8192);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"listen_port": 7000, "read_timeout_ms": 1500}}"#).unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.read_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_blank_advertised_host_falls_back() {
        let config = ClientConfig {
            advertised_host: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.advertised_host(), "localhost");
    }
}
