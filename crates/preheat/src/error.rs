//! Error types for the preheat control plane.

use thiserror::Error;

/// Errors raised by drivers, the dispatch controller, the monitor and jobs.
#[derive(Debug, Error)]
pub enum PreheatError {
    /// Input rejected before any remote call was made
    #[error("validation failed: {0}")]
    Validation(String),

    /// No driver registered under the instance vendor
    #[error("no driver registered for vendor '{0}'")]
    UnknownVendor(String),

    /// Resource already exists (duplicate instance endpoint)
    #[error("resource conflict: {0}")]
    Conflict(String),

    /// Instance, task or manifest is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream answered with a status the transport does not accept
    #[error("{method} {url} returned {status}: {body}")]
    Http {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    /// HTTP request could not be completed
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider instance did not pass its health probe
    #[error("provider unhealthy: {0}")]
    Unhealthy(String),

    /// Provider reported a task status outside PENDING/RUNNING/SUCCESS/FAIL
    #[error("unknown preheating status '{0}'")]
    UnknownStatus(String),

    /// Provider reported the preheat task as failed
    #[error("preheat task failed: {0}")]
    TaskFailed(String),

    /// Progress polling exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Store collaborator failure, propagated verbatim
    #[error("storage error: {0}")]
    Storage(String),
}

impl PreheatError {
    /// Upstream HTTP status carried by the error, if any.
    ///
    /// Dragonfly signals an idempotent submit with `208 Already Reported`,
    /// which the transport surfaces as an [`PreheatError::Http`] error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_already_reported(&self) -> bool {
        self.status_code() == Some(208)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias used throughout the crate.
pub type PreheatResult<T> = Result<T, PreheatError>;
