//! Dragonfly preheat driver.
//!
//! Wire contract:
//! - `GET /_ping` health probe
//! - `POST /preheats` submit, answering `{ID}` or `208 Already Reported`
//! - `GET /preheats/{id}` progress, answering
//!   `{ID, startTime, finishTime, errorMsg, Status}`

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PreheatError, PreheatResult};
use crate::models::{Instance, PreheatImage, PreheatingStatus, TaskStatus};
use crate::provider::auth::Credential;
use crate::provider::client::{join_url, HttpClient};
use crate::provider::{Driver, DriverHealth, Metadata};

pub const DRAGONFLY_VENDOR: &str = "dragonfly";

const HEALTH_PATH: &str = "_ping";
const PREHEAT_PATH: &str = "preheats";

/// Marker Dragonfly puts in `errorMsg` when the image is already being
/// preheated under another task.
const TASK_EXISTS_MARKER: &str = "preheat task already exists, id:";
/// Closing delimiter of the id embedded after [`TASK_EXISTS_MARKER`].
const TASK_EXISTS_TERMINATOR: &str = "\"}";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "startTime", default)]
    start_time: String,
    #[serde(rename = "finishTime", default)]
    finish_time: String,
    #[serde(rename = "errorMsg", default)]
    error_msg: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// Map Dragonfly task states onto [`TaskStatus`].
fn map_status(raw: &str) -> TaskStatus {
    match raw {
        "WAITING" => TaskStatus::Pending,
        "FAILED" => TaskStatus::Fail,
        other => TaskStatus::from(other),
    }
}

/// Id of the already-running task named in a Dragonfly error message.
///
/// `preheat task already exists, id:<id>"}` yields `<id>`; a missing
/// terminator takes the rest of the message.
pub(crate) fn existing_task_id(error_msg: &str) -> Option<&str> {
    let (_, rest) = error_msg.split_once(TASK_EXISTS_MARKER)?;
    let id = rest
        .split_once(TASK_EXISTS_TERMINATOR)
        .map_or(rest, |(id, _)| id)
        .trim();
    (!id.is_empty()).then_some(id)
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Driver speaking the Dragonfly supernode preheat API.
#[derive(Debug, Clone)]
pub struct DragonflyDriver {
    instance: Instance,
    http: HttpClient,
}

impl DragonflyDriver {
    pub fn new(instance: Instance, http: HttpClient) -> Self {
        Self { instance, http }
    }

    pub fn describe() -> Metadata {
        Metadata {
            id: DRAGONFLY_VENDOR.to_string(),
            name: "Dragonfly".to_string(),
            version: "0.10.1".to_string(),
            source: "https://github.com/dragonflyoss/Dragonfly".to_string(),
            maintainers: Vec::new(),
            icon: Some(
                "https://raw.githubusercontent.com/dragonflyoss/Dragonfly/master/docs/images/logo.png"
                    .to_string(),
            ),
            auth_mode: None,
        }
    }

    fn credential(&self) -> Option<Credential> {
        Credential::from_instance(&self.instance)
    }

    async fn poll(&self, task_id: &str) -> PreheatResult<ProgressResponse> {
        let url = join_url(&self.instance.endpoint, &format!("{PREHEAT_PATH}/{task_id}"))?;
        let body = self
            .http
            .get(&url, self.credential().as_ref(), self.instance.insecure)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Driver for DragonflyDriver {
    fn metadata(&self) -> Metadata {
        Self::describe()
    }

    async fn get_health(&self) -> PreheatResult<DriverHealth> {
        let url = join_url(&self.instance.endpoint, HEALTH_PATH)?;
        self.http
            .get(&url, self.credential().as_ref(), self.instance.insecure)
            .await?;
        Ok(DriverHealth::healthy())
    }

    async fn preheat(&self, image: &PreheatImage) -> PreheatResult<PreheatingStatus> {
        let url = join_url(&self.instance.endpoint, PREHEAT_PATH)?;
        match self
            .http
            .post(&url, self.credential().as_ref(), image, self.instance.insecure)
            .await
        {
            Ok(body) => {
                let response: SubmitResponse = serde_json::from_slice(&body)?;
                if response.id.is_empty() {
                    return Err(PreheatError::Validation(format!(
                        "dragonfly instance '{}' accepted preheat without a task id",
                        self.instance.name
                    )));
                }
                debug!(task_id = %response.id, image = %image.image_name, "Dragonfly accepted preheat");
                Ok(PreheatingStatus::new(response.id, TaskStatus::Pending))
            }
            Err(e) if e.is_already_reported() => {
                info!(
                    instance = %self.instance.name,
                    image = %image.image_name,
                    tag = %image.tag,
                    "Image already preheated"
                );
                Ok(PreheatingStatus::new(String::new(), TaskStatus::Success))
            }
            Err(e) => Err(e),
        }
    }

    async fn check_progress(&self, task_id: &str) -> PreheatResult<PreheatingStatus> {
        if task_id.is_empty() {
            return Err(PreheatError::Validation("empty task id".to_string()));
        }

        let mut response = self.poll(task_id).await?;
        if let Some(existing) = existing_task_id(&response.error_msg).map(str::to_string) {
            debug!(task_id, existing = %existing, "Following existing Dragonfly task");
            response = self.poll(&existing).await?;
        }

        let task_id = if response.id.is_empty() {
            task_id.to_string()
        } else {
            response.id
        };
        Ok(PreheatingStatus {
            task_id,
            status: map_status(&response.status),
            start_time: non_empty(response.start_time),
            finish_time: non_empty(response.finish_time),
            error: non_empty(response.error_msg),
        })
    }
}
