//! Kraken preheat driver.
//!
//! Kraken has no preheat API. It learns about new images from registry
//! push notifications, so a preheat is a single synthetic push event and an
//! accepted notification is already terminal. Progress is read back from
//! the history store.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PreheatError, PreheatResult};
use crate::models::{Instance, PreheatImage, PreheatingStatus, TaskStatus, TIME_PLACEHOLDER};
use crate::provider::auth::Credential;
use crate::provider::client::join_url;
use crate::provider::{Driver, DriverContext, DriverHealth, Metadata};

pub const KRAKEN_VENDOR: &str = "kraken";

const HEALTH_PATH: &str = "health";
const NOTIFICATION_PATH: &str = "registry/notifications";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const PUSH_ACTION: &str = "push";

#[derive(Debug, Serialize)]
struct Notification {
    events: Vec<Event>,
}

#[derive(Debug, Serialize)]
struct Event {
    id: String,
    timestamp: String,
    action: &'static str,
    target: Target,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    media_type: &'static str,
    digest: String,
    repository: String,
    url: String,
    tag: String,
}

fn from_history(value: String) -> Option<String> {
    (!value.is_empty() && value != TIME_PLACEHOLDER).then_some(value)
}

/// Driver pushing registry notifications to a Kraken proxy.
#[derive(Debug, Clone)]
pub struct KrakenDriver {
    instance: Instance,
    context: DriverContext,
}

impl KrakenDriver {
    pub fn new(instance: Instance, context: DriverContext) -> Self {
        Self { instance, context }
    }

    pub fn describe() -> Metadata {
        Metadata {
            id: KRAKEN_VENDOR.to_string(),
            name: "Kraken".to_string(),
            version: "0.1.3".to_string(),
            source: "https://github.com/uber/kraken".to_string(),
            maintainers: Vec::new(),
            icon: Some(
                "https://github.com/uber/kraken/blob/master/assets/kraken-logo-color.svg".to_string(),
            ),
            auth_mode: None,
        }
    }

    fn credential(&self) -> Option<Credential> {
        Credential::from_instance(&self.instance)
    }
}

#[async_trait]
impl Driver for KrakenDriver {
    fn metadata(&self) -> Metadata {
        Self::describe()
    }

    async fn get_health(&self) -> PreheatResult<DriverHealth> {
        let url = join_url(&self.instance.endpoint, HEALTH_PATH)?;
        self.context
            .http
            .get(&url, self.credential().as_ref(), self.instance.insecure)
            .await?;
        Ok(DriverHealth::healthy())
    }

    async fn preheat(&self, image: &PreheatImage) -> PreheatResult<PreheatingStatus> {
        let (exists, digest) = self
            .context
            .registry
            .manifest_exists(&image.image_name, &image.tag)
            .await?;
        if !exists {
            return Err(PreheatError::NotFound(format!(
                "image {}:{}",
                image.image_name, image.tag
            )));
        }

        let event_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let notification = Notification {
            events: vec![Event {
                id: event_id.clone(),
                timestamp: now.clone(),
                action: PUSH_ACTION,
                target: Target {
                    media_type: MANIFEST_MEDIA_TYPE,
                    digest,
                    repository: image.image_name.clone(),
                    url: image.url.clone(),
                    tag: image.tag.clone(),
                },
            }],
        };

        let url = join_url(&self.instance.endpoint, NOTIFICATION_PATH)?;
        self.context
            .http
            .post(&url, self.credential().as_ref(), &notification, self.instance.insecure)
            .await?;
        debug!(event_id = %event_id, image = %image.image_name, "Kraken accepted notification");

        Ok(PreheatingStatus {
            start_time: Some(now.clone()),
            finish_time: Some(now),
            ..PreheatingStatus::new(event_id, TaskStatus::Success)
        })
    }

    async fn check_progress(&self, task_id: &str) -> PreheatResult<PreheatingStatus> {
        if task_id.is_empty() {
            return Err(PreheatError::Validation("empty task id".to_string()));
        }

        let record = self.context.history.get_by_task_id(task_id).await?;
        Ok(PreheatingStatus {
            start_time: from_history(record.start_time),
            finish_time: from_history(record.finish_time),
            ..PreheatingStatus::new(record.task_id, record.status)
        })
    }
}
