//! Driver registry - maps vendor names to driver factories.
//!
//! The registry is assembled once at startup and only read afterwards, so
//! it needs no locking; share it behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{PreheatError, PreheatResult};
use crate::models::Instance;

use super::dragonfly::DragonflyDriver;
use super::kraken::KrakenDriver;
use super::{Driver, DriverContext, Metadata};

/// Builds a driver bound to one instance.
pub type FactoryFn =
    Arc<dyn Fn(&Instance, &DriverContext) -> PreheatResult<Arc<dyn Driver>> + Send + Sync>;

struct Registration {
    metadata: Metadata,
    factory: FactoryFn,
}

/// Immutable vendor name to factory mapping.
pub struct DriverRegistry {
    drivers: BTreeMap<String, Registration>,
    context: DriverContext,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new(context: DriverContext) -> Self {
        Self {
            drivers: BTreeMap::new(),
            context,
        }
    }

    /// Create a registry with the built-in Dragonfly and Kraken drivers.
    pub fn builtin(context: DriverContext) -> Self {
        let registry = Self::new(context)
            .with_driver(DragonflyDriver::describe(), |instance, ctx| {
                Ok(Arc::new(DragonflyDriver::new(instance.clone(), ctx.http.clone())) as Arc<dyn Driver>)
            })
            .with_driver(KrakenDriver::describe(), |instance, ctx| {
                Ok(Arc::new(KrakenDriver::new(instance.clone(), ctx.clone())) as Arc<dyn Driver>)
            });

        info!(
            drivers = registry.drivers.len(),
            "Driver registry initialized"
        );
        registry
    }

    /// Register a factory under `metadata.id`, replacing any previous one.
    #[must_use]
    pub fn with_driver<F>(mut self, metadata: Metadata, factory: F) -> Self
    where
        F: Fn(&Instance, &DriverContext) -> PreheatResult<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        debug!(vendor = %metadata.id, "Registering preheat driver");
        self.drivers.insert(
            metadata.id.clone(),
            Registration {
                metadata,
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// Metadata of every registered driver, sorted by id.
    pub fn list_providers(&self) -> Vec<Metadata> {
        self.drivers
            .values()
            .map(|r| r.metadata.clone())
            .collect()
    }

    /// Factory registered for `vendor`, if any.
    pub fn get_provider(&self, vendor: &str) -> Option<Factory<'_>> {
        self.drivers.get(vendor).map(|registration| Factory {
            registration,
            context: &self.context,
        })
    }

    /// Resolve the factory for the instance vendor and build its driver.
    pub fn create(&self, instance: &Instance) -> PreheatResult<Arc<dyn Driver>> {
        self.get_provider(&instance.vendor)
            .ok_or_else(|| PreheatError::UnknownVendor(instance.vendor.clone()))?
            .create(instance)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Factory bound to the registry's shared context.
pub struct Factory<'a> {
    registration: &'a Registration,
    context: &'a DriverContext,
}

impl Factory<'_> {
    pub fn metadata(&self) -> &Metadata {
        &self.registration.metadata
    }

    /// Construct a driver bound to `instance`.
    pub fn create(&self, instance: &Instance) -> PreheatResult<Arc<dyn Driver>> {
        (self.registration.factory)(instance, self.context)
    }
}
