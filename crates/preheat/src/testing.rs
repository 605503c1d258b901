//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::error::{PreheatError, PreheatResult};
use crate::models::{HealthStatus, PreheatImage, PreheatingStatus, TaskStatus};
use crate::provider::{Driver, DriverContext, DriverHealth, DriverRegistry, HttpClient, Metadata};
use crate::store::{HistoryStore, MemoryHistoryStore, RegistryClient};

/// Registry collaborator that knows every image under one digest.
pub(crate) struct FixedRegistry(pub &'static str);

#[async_trait]
impl RegistryClient for FixedRegistry {
    async fn manifest_exists(&self, _repository: &str, _tag: &str) -> PreheatResult<(bool, String)> {
        Ok((true, self.0.to_string()))
    }
}

pub(crate) fn driver_context() -> DriverContext {
    driver_context_with(Arc::new(MemoryHistoryStore::new()))
}

pub(crate) fn driver_context_with(history: Arc<dyn HistoryStore>) -> DriverContext {
    DriverContext {
        http: HttpClient::new(&TransportConfig::default()).unwrap(),
        registry: Arc::new(FixedRegistry("sha256:fake")),
        history,
    }
}

/// Registry whose only vendor always resolves to `driver`.
pub(crate) fn registry_with(driver: Arc<StaticDriver>, context: DriverContext) -> DriverRegistry {
    DriverRegistry::new(context).with_driver(driver.metadata(), move |_, _| {
        Ok(Arc::clone(&driver) as Arc<dyn Driver>)
    })
}

/// Scripted driver.
///
/// Progress replies are consumed in order and the last one repeats.
pub(crate) struct StaticDriver {
    id: String,
    health: HealthStatus,
    health_delay: Duration,
    submit: Mutex<Result<PreheatingStatus, String>>,
    progress: Mutex<VecDeque<TaskStatus>>,
    pub preheat_calls: AtomicUsize,
    pub progress_calls: AtomicUsize,
}

impl StaticDriver {
    pub fn describe(id: &str) -> Metadata {
        Metadata {
            id: id.to_string(),
            name: id.to_uppercase(),
            version: "test".to_string(),
            source: format!("https://{id}.invalid"),
            maintainers: Vec::new(),
            icon: None,
            auth_mode: None,
        }
    }

    /// Healthy driver accepting work as `task-1` and finishing on first poll.
    pub fn healthy(id: &str) -> Self {
        Self {
            id: id.to_string(),
            health: HealthStatus::Healthy,
            health_delay: Duration::ZERO,
            submit: Mutex::new(Ok(PreheatingStatus::new("task-1", TaskStatus::Pending))),
            progress: Mutex::new(VecDeque::from([TaskStatus::Success])),
            preheat_calls: AtomicUsize::new(0),
            progress_calls: AtomicUsize::new(0),
        }
    }

    pub fn unhealthy(id: &str) -> Self {
        Self {
            health: HealthStatus::Unhealthy,
            ..Self::healthy(id)
        }
    }

    /// Health replies arrive only after `delay`.
    pub fn slow_health(self, delay: Duration) -> Self {
        Self {
            health_delay: delay,
            ..self
        }
    }

    pub fn with_submit(self, status: PreheatingStatus) -> Self {
        *self.submit.lock().unwrap() = Ok(status);
        self
    }

    pub fn failing_submit(self, message: &str) -> Self {
        *self.submit.lock().unwrap() = Err(message.to_string());
        self
    }

    pub fn with_progress(self, replies: impl IntoIterator<Item = TaskStatus>) -> Self {
        *self.progress.lock().unwrap() = replies.into_iter().collect();
        self
    }

    pub fn preheats(&self) -> usize {
        self.preheat_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for StaticDriver {
    fn metadata(&self) -> Metadata {
        Self::describe(&self.id)
    }

    async fn get_health(&self) -> PreheatResult<DriverHealth> {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        match self.health {
            HealthStatus::Healthy => Ok(DriverHealth::healthy()),
            _ => Err(PreheatError::Unhealthy(self.id.clone())),
        }
    }

    async fn preheat(&self, _image: &PreheatImage) -> PreheatResult<PreheatingStatus> {
        self.preheat_calls.fetch_add(1, Ordering::SeqCst);
        self.submit
            .lock()
            .unwrap()
            .clone()
            .map_err(|body| PreheatError::Http {
                method: "POST",
                url: format!("https://{}.invalid/preheats", self.id),
                status: 500,
                body,
            })
    }

    async fn check_progress(&self, task_id: &str) -> PreheatResult<PreheatingStatus> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.progress.lock().unwrap();
        let status = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
        .unwrap_or(TaskStatus::Running);
        Ok(PreheatingStatus::new(task_id, status))
    }
}
