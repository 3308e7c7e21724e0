//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use std::time::Duration;

use prlens_core::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 5000 },
///   "upstream": { "baseUrl": "http://127.0.0.1:4096" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrlensSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Agent runtime connection.
    pub upstream: UpstreamSettings,
    /// Session router.
    pub router: RouterSettings,
    /// Session client behavior.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl PrlensSettings {
    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&mut self) -> crate::Result<()> {
        if self.router.queue_capacity == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "router.queueCapacity must be at least 1".into(),
            ));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(crate::SettingsError::InvalidValue(
                "upstream.baseUrl must not be empty".into(),
            ));
        }
        for (name, backoff) in [
            ("upstream.backoff", &mut self.upstream.backoff),
            ("client.reconnect", &mut self.client.reconnect),
        ] {
            if !(0.0..=1.0).contains(&backoff.jitter_factor) {
                let clamped = backoff.jitter_factor.clamp(0.0, 1.0);
                tracing::warn!(
                    "{name}.jitterFactor out of range ({}), clamped to {clamped}",
                    backoff.jitter_factor
                );
                backoff.jitter_factor = clamped;
            }
            if backoff.max_delay_ms < backoff.base_delay_ms {
                tracing::warn!(
                    "{name}.maxDelayMs ({}) < baseDelayMs ({}), correcting",
                    backoff.max_delay_ms,
                    backoff.base_delay_ms
                );
                backoff.max_delay_ms = backoff.base_delay_ms;
            }
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4317,
            keep_alive_secs: 15,
        }
    }
}

impl ServerSettings {
    /// `host:port` for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// SSE keep-alive interval as a [`Duration`].
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Agent runtime connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Runtime base URL.
    pub base_url: String,
    /// Project directory the runtime should scope events to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Timeout for opening the event feed.
    pub connect_timeout_ms: u64,
    /// Reconnect policy for the event feed.
    pub backoff: BackoffSettings,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            directory: None,
            connect_timeout_ms: 10_000,
            backoff: BackoffSettings::default(),
        }
    }
}

impl UpstreamSettings {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffSettings {
    /// First retry delay.
    pub base_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Random spread as a fraction of the delay.
    pub jitter_factor: f64,
    /// Consecutive failures before giving up. Absent retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

impl BackoffSettings {
    /// Runtime policy for these settings.
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_factor: self.jitter_factor,
            max_attempts: self.max_attempts,
        }
    }
}

/// Session router settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Per-subscription queue bound.
    pub queue_capacity: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
        }
    }
}

/// Session client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// How long `send_message` waits for the subscription to connect.
    pub send_wait_timeout_ms: u64,
    /// Reconnect policy for a dropped event stream.
    pub reconnect: BackoffSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            send_wait_timeout_ms: 5_000,
            reconnect: BackoffSettings {
                max_attempts: Some(10),
                ..BackoffSettings::default()
            },
        }
    }
}

impl ClientSettings {
    /// Send wait as a [`Duration`].
    #[must_use]
    pub fn send_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.send_wait_timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
