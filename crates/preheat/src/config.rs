//! Settings for the preheat control plane.
//!
//! Every section has defaults so an empty or missing YAML file yields a
//! working configuration. The library never reads the environment; the
//! `preheatd` binary decides which file to load.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::Instance;

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportConfig,
    pub monitor: MonitorConfig,
    pub job: JobConfig,
    pub registry: RegistryConfig,
    /// Instances seeded into the in-process store at startup
    pub instances: Vec<Instance>,
}

impl Settings {
    /// Load settings from a YAML file.
    ///
    /// A missing or blank file yields [`Settings::default`].
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Settings file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid settings file {}: {e}", path.display()))?;
        debug!(
            path = %path.display(),
            instances = settings.instances.len(),
            "Loaded settings"
        );
        Ok(settings)
    }
}

/// Shared HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    /// Whole-request timeout (covers TLS handshake, write and read)
    pub request_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
            pool_max_idle_per_host: 10,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Background monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub health_interval_secs: u64,
    /// Delay before a still-live task is polled again, in milliseconds
    pub requeue_delay_ms: u64,
    pub queue_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            requeue_delay_ms: 5_000,
            queue_depth: 1024,
        }
    }
}

impl MonitorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    /// A zero delay falls back to one second.
    pub fn requeue_delay(&self) -> Duration {
        match self.requeue_delay_ms {
            0 => Duration::from_secs(1),
            ms => Duration::from_millis(ms),
        }
    }
}

/// Single preheat job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            timeout_secs: 30 * 60,
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Registry the preheated manifests are served from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// External base URL providers use to fetch manifests
    pub external_endpoint: String,
    /// Token endpoint (`realm`) issuing registry bearer tokens
    pub token_realm: Option<String>,
    /// `service` parameter sent to the token endpoint
    pub token_service: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Skip TLS verification towards the registry
    pub insecure: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            external_endpoint: "http://localhost:5000".to_string(),
            token_realm: None,
            token_service: "harbor-registry".to_string(),
            username: None,
            password: None,
            insecure: false,
        }
    }
}
