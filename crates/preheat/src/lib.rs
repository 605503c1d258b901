//! Image preheating control plane.
//!
//! Pushes registry image manifests to P2P distribution providers
//! (Dragonfly, Kraken) ahead of demand and tracks every submitted task to a
//! terminal state.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use preheat::config::Settings;
//! use preheat::provider::{DriverContext, DriverRegistry, HttpClient};
//! use preheat::store::{HttpRegistryClient, MemoryHistoryStore, MemoryInstanceStore, TokenEndpointService};
//! use preheat::{reconcile, Controller, Monitor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::load("preheat.yaml").await?;
//! let instances = Arc::new(MemoryInstanceStore::new());
//! let history = Arc::new(MemoryHistoryStore::new());
//! let tokens = Arc::new(
//!     TokenEndpointService::from_config(&settings.registry, &settings.transport)?
//!         .ok_or_else(|| anyhow::anyhow!("no token realm"))?,
//! );
//!
//! let context = DriverContext {
//!     http: HttpClient::new(&settings.transport)?,
//!     registry: Arc::new(HttpRegistryClient::new(
//!         &settings.registry,
//!         &settings.transport,
//!         Some(tokens.clone()),
//!     )?),
//!     history: history.clone(),
//! };
//! let registry = Arc::new(DriverRegistry::builtin(context));
//!
//! let monitor = Arc::new(Monitor::new(
//!     instances.clone(),
//!     history.clone(),
//!     registry.clone(),
//!     settings.monitor.clone(),
//! ));
//! let controller = Controller::new(
//!     instances,
//!     history.clone(),
//!     registry,
//!     tokens,
//!     monitor.clone(),
//!     settings.registry.external_endpoint.clone(),
//! );
//!
//! let cancel = CancellationToken::new();
//! let handle = monitor.start(cancel.clone())?;
//! reconcile(history.as_ref(), monitor.as_ref()).await?;
//!
//! let results = controller
//!     .preheat_images(&["library/alpine:latest".to_string()])
//!     .await?;
//! println!("{results:?}");
//!
//! cancel.cancel();
//! handle.join().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`provider`] holds the [`provider::Driver`] contract, the registry,
//!   the built-in drivers and the shared HTTP transport
//! - [`store`] defines the persistence and registry collaborators
//! - [`controller::Controller`] dispatches preheat requests
//! - [`monitor::Monitor`] refreshes health and tracks task progress
//! - [`reconcile::reconcile`] resumes tracking after a restart
//! - [`job::PreheatJob`] runs a single preheat synchronously

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod models;
pub mod monitor;
pub mod provider;
pub mod reconcile;
pub mod store;

#[cfg(test)]
mod testing;

pub use controller::Controller;
pub use error::{PreheatError, PreheatResult};
pub use job::{Job, JobContext, PreheatJob};
pub use monitor::{Monitor, ProgressWatcher};
pub use reconcile::reconcile;
