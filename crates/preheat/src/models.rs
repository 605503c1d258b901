//! Data model shared by drivers, stores, the controller and the monitor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{PreheatError, PreheatResult};

/// The only `PreheatImage.type` value providers accept.
pub const PREHEAT_IMAGE_TYPE: &str = "image";

/// Placeholder written into history times until the monitor fills them.
pub const TIME_PLACEHOLDER: &str = "-";

/// Key of the bearer token inside `auth_data`.
pub const BEARER_TOKEN_KEY: &str = "token";

/// Mode-dependent credential material of an instance.
pub type AuthData = BTreeMap<String, String>;

/// How requests to a provider instance are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No credential attached
    #[default]
    None,
    /// `Authorization: Basic ...` built from a single `username: password` entry
    Basic,
    /// `Authorization: Bearer ...` built from the `token` entry
    Bearer,
    /// A single verbatim `header-name: value` entry
    Custom,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Bearer => "bearer",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known health of a provider instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// A configured remote provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Store-assigned identity (0 until saved)
    #[serde(default)]
    pub id: i64,
    /// Unique display name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Registered driver name
    pub vendor: String,
    /// Base URL of the provider API
    pub endpoint: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub auth_data: AuthData,
    /// Skip TLS verification when talking to the endpoint
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "default")]
    pub is_default: bool,
    #[serde(default)]
    pub status: HealthStatus,
    /// Unix seconds at creation
    #[serde(default)]
    pub setup_timestamp: i64,
}

impl Instance {
    /// Create an enabled instance with no credentials.
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            auth_mode: AuthMode::None,
            auth_data: AuthData::new(),
            insecure: false,
            enabled: true,
            is_default: false,
            status: HealthStatus::Unknown,
            setup_timestamp: 0,
        }
    }

    /// Set credentials.
    #[must_use]
    pub fn with_auth(mut self, mode: AuthMode, data: AuthData) -> Self {
        self.auth_mode = mode;
        self.auth_data = data;
        self
    }

    /// Check the fields a driver needs before it can talk to the provider.
    pub fn validate(&self) -> PreheatResult<()> {
        if self.vendor.trim().is_empty() {
            return Err(PreheatError::Validation(format!(
                "instance '{}' has no vendor",
                self.name
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(PreheatError::Validation(format!(
                "instance '{}' has no endpoint",
                self.name
            )));
        }
        if self.auth_mode != AuthMode::None && self.auth_data.is_empty() {
            return Err(PreheatError::Validation(format!(
                "instance '{}' uses {} auth but has no credentials",
                self.name, self.auth_mode
            )));
        }
        match self.auth_mode {
            AuthMode::None => {}
            AuthMode::Basic | AuthMode::Custom if self.auth_data.len() != 1 => {
                return Err(PreheatError::Validation(format!(
                    "instance '{}' uses {} auth and expects exactly one credential entry, got {}",
                    self.name,
                    self.auth_mode,
                    self.auth_data.len()
                )));
            }
            AuthMode::Bearer if !self.auth_data.contains_key(BEARER_TOKEN_KEY) => {
                return Err(PreheatError::Validation(format!(
                    "instance '{}' uses bearer auth but has no '{BEARER_TOKEN_KEY}' entry",
                    self.name
                )));
            }
            AuthMode::Basic | AuthMode::Custom | AuthMode::Bearer => {}
        }
        Ok(())
    }

    /// Enabled and not known to be unhealthy.
    pub fn is_dispatch_target(&self) -> bool {
        self.enabled && self.status != HealthStatus::Unhealthy
    }
}

/// Typed partial update of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstancePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<AuthMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_data: Option<AuthData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InstancePatch {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.enabled.is_none()
            && self.auth_mode.is_none()
            && self.auth_data.is_none()
            && self.description.is_none()
    }

    /// Merge the patch into `instance`, validating each field.
    ///
    /// The instance is left untouched when any field is rejected.
    pub fn apply(&self, instance: &mut Instance) -> PreheatResult<()> {
        if self.is_empty() {
            return Err(PreheatError::Validation(
                "no properties provided to update".to_string(),
            ));
        }

        let mut next = instance.clone();

        if let Some(endpoint) = &self.endpoint {
            let endpoint = endpoint.trim();
            if endpoint.is_empty() {
                return Err(PreheatError::Validation("endpoint cannot be empty".into()));
            }
            Url::parse(endpoint)
                .map_err(|e| PreheatError::Validation(format!("invalid endpoint '{endpoint}': {e}")))?;
            next.endpoint = endpoint.to_string();
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(mode) = self.auth_mode {
            next.auth_mode = mode;
            if mode == AuthMode::None {
                next.auth_data.clear();
            }
        }
        if let Some(data) = &self.auth_data {
            next.auth_data.clone_from(data);
        }
        if let Some(description) = &self.description {
            next.description.clone_from(description);
        }

        next.validate()?;
        *instance = next;
        Ok(())
    }
}

/// Provider-side state of a preheat task.
///
/// Strings the provider sends outside the four known states are kept
/// verbatim in [`TaskStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Fail,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Other(s) => s,
        }
    }

    /// SUCCESS or FAIL.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    /// PENDING or RUNNING.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// A terminal status only ever "transitions" to itself.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        !self.is_terminal() || self == next
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCESS" => Self::Success,
            "FAIL" => Self::Fail,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload submitted to a provider for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreheatImage {
    /// Always [`PREHEAT_IMAGE_TYPE`]
    #[serde(rename = "type")]
    pub image_type: String,
    /// Full manifest URL
    pub url: String,
    /// Headers the provider must send when fetching `url`
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "image")]
    pub image_name: String,
    pub tag: String,
    #[serde(default)]
    pub digest: String,
}

impl PreheatImage {
    pub fn validate(&self) -> PreheatResult<()> {
        if self.image_type != PREHEAT_IMAGE_TYPE {
            return Err(PreheatError::Validation(format!(
                "unsupported preheat type '{}'",
                self.image_type
            )));
        }
        if self.image_name.is_empty() || self.tag.is_empty() {
            return Err(PreheatError::Validation(
                "missing image repository or tag".to_string(),
            ));
        }
        if self.headers.is_empty() {
            return Err(PreheatError::Validation(
                "missing required headers".to_string(),
            ));
        }
        Url::parse(&self.url)
            .map_err(|e| PreheatError::Validation(format!("malformed url '{}': {e}", self.url)))?;
        Ok(())
    }
}

/// Status a driver reports for a submitted or polled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreheatingStatus {
    pub task_id: String,
    pub status: TaskStatus,
    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreheatingStatus {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            start_time: None,
            finish_time: None,
            error: None,
        }
    }

    /// Synthetic FAIL entry recorded by dispatch for a target or image that
    /// never reached the provider.
    pub fn failed(task_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(task_id, TaskStatus::Fail)
        }
    }
}

/// Tracking row for one submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    /// Canonical `namespace/name:tag`
    pub image: String,
    pub start_time: String,
    pub finish_time: String,
    pub status: TaskStatus,
    /// Vendor name
    pub provider: String,
    /// Instance id
    pub instance: i64,
}

impl HistoryRecord {
    /// Required fields: image, provider, instance and a known status.
    /// The task id may only be blank when the task finished on submit.
    pub fn validate(&self) -> PreheatResult<()> {
        let mut missing = Vec::new();
        if self.image.is_empty() {
            missing.push("image");
        }
        if self.provider.is_empty() {
            missing.push("provider");
        }
        if self.instance <= 0 {
            missing.push("instance");
        }
        if self.task_id.is_empty() && !self.status.is_terminal() {
            missing.push("task_id");
        }
        if !missing.is_empty() {
            return Err(PreheatError::Validation(format!(
                "history record missing {}",
                missing.join(", ")
            )));
        }
        if let TaskStatus::Other(s) = &self.status {
            return Err(PreheatError::UnknownStatus(s.clone()));
        }
        Ok(())
    }
}

/// Canonical `namespace/name:tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRepository {
    repository: String,
    tag: String,
}

impl ImageRepository {
    /// `namespace/name`
    pub fn name(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl FromStr for ImageRepository {
    type Err = PreheatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PreheatError::Validation(format!("{s} is not a valid image repository"));

        let (repository, tag) = s.rsplit_once(':').ok_or_else(invalid)?;
        if tag.is_empty() || tag.contains('/') {
            return Err(invalid());
        }
        let (namespace, name) = repository.split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || name.is_empty() || name.ends_with('/') {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Pagination and keyword filter for store listings.
///
/// `page` is 1-based; a zero `page_size` disables pagination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub keywords: BTreeMap<String, String>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_keyword(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keywords.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: u64, page_size: u64) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Cut the requested page out of an already filtered listing.
    pub fn paginate<T>(&self, rows: Vec<T>) -> Vec<T> {
        if self.page_size == 0 {
            return rows;
        }
        let skip = self.page.saturating_sub(1).saturating_mul(self.page_size);
        rows.into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(self.page_size).unwrap_or(usize::MAX))
            .collect()
    }
}
