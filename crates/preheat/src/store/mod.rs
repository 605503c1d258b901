//! Collaborator contracts the core consumes.
//!
//! Persistence, registry access and token minting live outside the core.
//! [`memory`] provides in-process stores and [`registry`] HTTP-backed
//! registry and token collaborators for the `preheatd` binary.

pub mod memory;
pub mod registry;

use async_trait::async_trait;

use crate::error::PreheatResult;
use crate::models::{HistoryRecord, Instance, Query, TaskStatus};

pub use memory::{MemoryHistoryStore, MemoryInstanceStore};
pub use registry::{HttpRegistryClient, TokenEndpointService};

/// Persistence of provider instances.
///
/// Implementations keep `name` unique and at most one instance flagged
/// default, atomically with the write that would break either rule.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persist a new instance and return its id.
    async fn save(&self, instance: Instance) -> PreheatResult<i64>;

    async fn get(&self, id: i64) -> PreheatResult<Instance>;

    async fn get_by_name(&self, name: &str) -> PreheatResult<Instance>;

    /// Overwrite the stored row with the same id.
    async fn update(&self, instance: &Instance) -> PreheatResult<()>;

    async fn delete(&self, id: i64) -> PreheatResult<()>;

    /// Matching rows, ignoring pagination.
    async fn count(&self, query: &Query) -> PreheatResult<u64>;

    /// Matching rows ordered by id.
    async fn list(&self, query: &Query) -> PreheatResult<Vec<Instance>>;
}

/// Persistence of preheat history rows.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a new row and return its id.
    async fn append(&self, record: HistoryRecord) -> PreheatResult<i64>;

    /// Move every row of `task_id` to `status`, filling the times when given.
    ///
    /// Rows already in a terminal state keep it; returns `false` when no
    /// row changed for that reason.
    async fn update_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
        start_time: Option<&str>,
        finish_time: Option<&str>,
    ) -> PreheatResult<bool>;

    async fn get_by_task_id(&self, task_id: &str) -> PreheatResult<HistoryRecord>;

    /// Matching rows, ignoring pagination.
    async fn count(&self, query: &Query) -> PreheatResult<u64>;

    async fn list(&self, query: &Query) -> PreheatResult<Vec<HistoryRecord>>;
}

/// Registry lookups used by drivers that need manifest details.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Whether `repository:tag` has a manifest, with its digest when it does.
    async fn manifest_exists(&self, repository: &str, tag: &str) -> PreheatResult<(bool, String)>;
}

/// Mints short-lived registry bearer tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Token granting `actions` on `repository`.
    async fn mint(&self, repository: &str, actions: &[String]) -> PreheatResult<String>;
}
