//! Single-image preheat job.
//!
//! A job drives one `(instance, image)` pair from submission to a terminal
//! state and blocks its caller while doing so. The job runner above it owns
//! scheduling and retries; the job itself makes exactly one attempt.
//!
//! # Parameters
//!
//! Both parameters are JSON documents carried as strings:
//!
//! | Key        | Content                      |
//! |------------|------------------------------|
//! | `provider` | serialized [`Instance`]      |
//! | `image`    | serialized [`PreheatImage`]  |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::error::{PreheatError, PreheatResult};
use crate::models::{HealthStatus, Instance, PreheatImage, PreheatingStatus, TaskStatus};
use crate::provider::DriverRegistry;

pub const PARAM_PROVIDER: &str = "provider";
pub const PARAM_IMAGE: &str = "image";

/// Job parameters as handed over by the job runner.
pub type JobParams = Map<String, Value>;

/// Runtime context a job observes while running.
pub trait JobContext: Send + Sync {
    /// Whether the runner asked the job to stop.
    fn stop_requested(&self) -> bool;
}

impl JobContext for CancellationToken {
    fn stop_requested(&self) -> bool {
        self.is_cancelled()
    }
}

/// A unit of work the job runner can schedule.
#[async_trait]
pub trait Job: Send + Sync {
    /// Job kind name.
    fn name(&self) -> &'static str;

    /// Failures tolerated before the runner gives up.
    fn max_fails(&self) -> u32;

    fn should_retry(&self) -> bool;

    /// Concurrent runs allowed; `0` means unbounded.
    fn max_concurrency(&self) -> u32;

    /// Reject malformed parameters before scheduling.
    fn validate(&self, params: &JobParams) -> PreheatResult<()>;

    /// Run to completion. A stop request ends the run without error.
    async fn run(&self, ctx: &dyn JobContext, params: &JobParams) -> PreheatResult<()>;
}

fn string_param<'a>(params: &'a JobParams, key: &str) -> PreheatResult<&'a str> {
    match params.get(key) {
        None => Err(PreheatError::Validation(format!("missing parameter '{key}'"))),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(PreheatError::Validation(format!(
            "parameter '{key}' is empty"
        ))),
        Some(_) => Err(PreheatError::Validation(format!(
            "parameter '{key}' must be a JSON string"
        ))),
    }
}

fn parse_params(params: &JobParams) -> PreheatResult<(Instance, PreheatImage)> {
    let instance: Instance = serde_json::from_str(string_param(params, PARAM_PROVIDER)?)
        .map_err(|e| PreheatError::Validation(format!("malformed '{PARAM_PROVIDER}': {e}")))?;
    let image: PreheatImage = serde_json::from_str(string_param(params, PARAM_IMAGE)?)
        .map_err(|e| PreheatError::Validation(format!("malformed '{PARAM_IMAGE}': {e}")))?;
    instance.validate()?;
    image.validate()?;
    Ok((instance, image))
}

/// Build job parameters for `instance` and `image`.
pub fn preheat_params(instance: &Instance, image: &PreheatImage) -> PreheatResult<JobParams> {
    let mut params = JobParams::new();
    params.insert(
        PARAM_PROVIDER.to_string(),
        Value::String(serde_json::to_string(instance)?),
    );
    params.insert(
        PARAM_IMAGE.to_string(),
        Value::String(serde_json::to_string(image)?),
    );
    Ok(params)
}

fn task_failed(status: &PreheatingStatus) -> PreheatError {
    PreheatError::TaskFailed(match &status.error {
        Some(error) => format!("task {}: {error}", status.task_id),
        None => format!("task {}", status.task_id),
    })
}

/// Preheat one image on one provider instance.
pub struct PreheatJob {
    registry: Arc<DriverRegistry>,
    config: JobConfig,
}

impl PreheatJob {
    pub const NAME: &'static str = "preheat";

    pub fn new(registry: Arc<DriverRegistry>, config: JobConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl Job for PreheatJob {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn max_fails(&self) -> u32 {
        1
    }

    fn should_retry(&self) -> bool {
        false
    }

    fn max_concurrency(&self) -> u32 {
        0
    }

    fn validate(&self, params: &JobParams) -> PreheatResult<()> {
        parse_params(params).map(|_| ())
    }

    async fn run(&self, ctx: &dyn JobContext, params: &JobParams) -> PreheatResult<()> {
        let (instance, image) = parse_params(params)?;
        let driver = self.registry.create(&instance)?;

        let health = driver.get_health().await.map_err(|e| {
            PreheatError::Unhealthy(format!("{}: {e}", instance.name))
        })?;
        if health.status != HealthStatus::Healthy {
            return Err(PreheatError::Unhealthy(instance.name.clone()));
        }

        let submitted = driver.preheat(&image).await?;
        info!(
            instance = %instance.name,
            image = %image.image_name,
            tag = %image.tag,
            task_id = %submitted.task_id,
            status = %submitted.status,
            "Preheat submitted"
        );
        match &submitted.status {
            TaskStatus::Success => return Ok(()),
            TaskStatus::Fail => return Err(task_failed(&submitted)),
            TaskStatus::Pending | TaskStatus::Running => {}
            TaskStatus::Other(s) => return Err(PreheatError::UnknownStatus(s.clone())),
        }

        let task_id = submitted.task_id;
        let deadline = sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = &mut deadline => {
                    warn!(task_id = %task_id, instance = %instance.name, "Preheat polling timed out");
                    return Err(PreheatError::Timeout(format!(
                        "task {task_id} on instance {} did not finish in {:?}",
                        instance.name,
                        self.config.timeout()
                    )));
                }
                _ = ticker.tick() => {
                    if ctx.stop_requested() {
                        info!(task_id = %task_id, "Preheat job stopped");
                        return Ok(());
                    }

                    let progress = driver.check_progress(&task_id).await?;
                    debug!(task_id = %task_id, status = %progress.status, "Preheat progress");
                    match progress.status {
                        TaskStatus::Success => {
                            info!(task_id = %task_id, "Preheat finished");
                            return Ok(());
                        }
                        TaskStatus::Fail => return Err(task_failed(&progress)),
                        status if status.is_live() => {}
                        status => return Err(PreheatError::UnknownStatus(status.to_string())),
                    }
                }
            }
        }
    }
}
