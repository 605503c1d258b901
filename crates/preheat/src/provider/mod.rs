//! Driver abstraction over remote preheat providers.
//!
//! # Architecture
//!
//! - [`Driver`] is the uniform contract every provider implements
//! - [`registry::DriverRegistry`] maps vendor names to driver factories
//! - [`dragonfly::DragonflyDriver`] and [`kraken::KrakenDriver`] are the
//!   built-in drivers
//! - [`client::HttpClient`] and [`auth`] are the transport they share
//!
//! Drivers hold nothing beyond the instance they were built for and the
//! shared [`DriverContext`]. Concurrency is the caller's concern.

pub mod auth;
pub mod client;
pub mod dragonfly;
pub mod kraken;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PreheatResult;
use crate::models::{AuthMode, HealthStatus, PreheatImage, PreheatingStatus};
use crate::store::{HistoryStore, RegistryClient};

pub use client::HttpClient;
pub use registry::DriverRegistry;

/// Static self-description of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Vendor name instances refer to
    pub id: String,
    pub name: String,
    pub version: String,
    /// Project homepage
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Auth mode the provider expects, when it mandates one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<AuthMode>,
}

/// Health probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverHealth {
    pub status: HealthStatus,
}

impl DriverHealth {
    pub const fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
        }
    }
}

/// Uniform contract over a remote preheat provider.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Static self-description; never performs I/O.
    fn metadata(&self) -> Metadata;

    /// Healthy iff the provider answers its health endpoint with a 2xx
    /// in time. Anything else is an error.
    async fn get_health(&self) -> PreheatResult<DriverHealth>;

    /// Submit one image. Work the provider already has must still come
    /// back as a usable status rather than an error.
    async fn preheat(&self, image: &PreheatImage) -> PreheatResult<PreheatingStatus>;

    /// Poll one task previously returned by [`Driver::preheat`].
    async fn check_progress(&self, task_id: &str) -> PreheatResult<PreheatingStatus>;
}

/// Shared collaborators handed to every driver factory.
#[derive(Clone)]
pub struct DriverContext {
    pub http: HttpClient,
    /// Manifest lookups (Kraken resolves digests before notifying)
    pub registry: Arc<dyn RegistryClient>,
    /// History lookups (Kraken has no progress endpoint)
    pub history: Arc<dyn HistoryStore>,
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("http", &self.http)
            .finish_non_exhaustive()
    }
}
