//! Background health and progress tracking.
//!
//! [`Monitor::start`] spawns two loops bound to one cancellation token:
//!
//! - the **health loop** probes every instance on a fixed interval and
//!   writes `healthy`/`unhealthy` back through the instance store
//! - the **progress loop** drains the tracking queue, polling each task
//!   once per dequeue and re-enqueueing live tasks after a short delay
//!
//! Errors inside either loop are logged and swallowed. Only cancellation
//! stops them.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{PreheatError, PreheatResult};
use crate::models::{HealthStatus, Instance, Query, TaskStatus};
use crate::provider::DriverRegistry;
use crate::store::{HistoryStore, InstanceStore};

/// Non-blocking sink for tasks that need progress tracking.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressWatcher: Send + Sync {
    /// Queue `task_id` on `instance_id` for tracking. Never blocks.
    fn watch_progress(&self, instance_id: i64, task_id: &str);
}

/// One tracked task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorItem {
    pub instance_id: i64,
    pub task_id: String,
}

/// What to do with an item after polling it.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Requeue,
    Drop,
}

/// Join handles of the two monitor loops.
#[derive(Debug)]
pub struct MonitorHandle {
    health: JoinHandle<()>,
    progress: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        let (health, progress) = tokio::join!(self.health, self.progress);
        for (name, result) in [("health", health), ("progress", progress)] {
            if let Err(e) = result {
                error!(task = name, error = %e, "Monitor loop panicked");
            }
        }
    }
}

/// Health and progress monitor.
pub struct Monitor {
    instances: Arc<dyn InstanceStore>,
    history: Arc<dyn HistoryStore>,
    registry: Arc<DriverRegistry>,
    config: MonitorConfig,
    tx: mpsc::Sender<MonitorItem>,
    rx: Mutex<Option<mpsc::Receiver<MonitorItem>>>,
}

impl Monitor {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        history: Arc<dyn HistoryStore>,
        registry: Arc<DriverRegistry>,
        config: MonitorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        Self {
            instances,
            history,
            registry,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Spawn both loops. A monitor can be started once.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> PreheatResult<MonitorHandle> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PreheatError::Validation("monitor already started".to_string()))?;

        info!(
            health_interval = ?self.config.health_interval(),
            requeue_delay = ?self.config.requeue_delay(),
            queue_depth = self.config.queue_depth,
            "Starting preheat monitor"
        );

        let health = tokio::spawn(Arc::clone(self).health_loop(cancel.clone()));
        let progress = tokio::spawn(Arc::clone(self).progress_loop(rx, cancel));
        Ok(MonitorHandle { health, progress })
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.refresh_health() => {}
                    }
                }
            }
        }
        debug!("Health loop stopped");
    }

    /// Probe every instance once, concurrently.
    pub async fn refresh_health(&self) {
        let instances = match self.instances.list(&Query::all()).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "Failed to list instances for health check");
                return;
            }
        };

        join_all(instances.into_iter().map(|instance| self.probe(instance))).await;
    }

    async fn probe(&self, instance: Instance) {
        let status = match self.registry.create(&instance) {
            Ok(driver) => match driver.get_health().await {
                Ok(health) if health.status == HealthStatus::Healthy => HealthStatus::Healthy,
                Ok(_) => HealthStatus::Unhealthy,
                Err(e) => {
                    debug!(instance = %instance.name, error = %e, "Health probe failed");
                    HealthStatus::Unhealthy
                }
            },
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "Cannot build driver for health probe");
                HealthStatus::Unhealthy
            }
        };

        if status == instance.status {
            return;
        }

        // Re-read so a concurrent edit of other fields is not overwritten.
        let result = match self.instances.get(instance.id).await {
            Ok(mut fresh) => {
                fresh.status = status;
                self.instances.update(&fresh).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(
                instance = %instance.name,
                from = %instance.status,
                to = %status,
                "Instance health changed"
            ),
            Err(e) => warn!(instance = %instance.name, error = %e, "Failed to record instance health"),
        }
    }

    async fn progress_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<MonitorItem>,
        cancel: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.track(item, cancel).await });
        }
        debug!("Progress loop stopped");
    }

    async fn track(&self, item: MonitorItem, cancel: CancellationToken) {
        let next = match self.poll(&item).await {
            Ok(next) => next,
            Err(e @ (PreheatError::NotFound(_) | PreheatError::UnknownVendor(_))) => {
                warn!(
                    instance_id = item.instance_id,
                    task_id = %item.task_id,
                    error = %e,
                    "Dropping untrackable task"
                );
                Next::Drop
            }
            Err(e) => {
                error!(
                    instance_id = item.instance_id,
                    task_id = %item.task_id,
                    error = %e,
                    "Progress check failed"
                );
                Next::Requeue
            }
        };

        if next == Next::Drop {
            return;
        }

        tokio::select! {
            () = cancel.cancelled() => {}
            () = sleep(self.config.requeue_delay()) => {
                self.watch_progress(item.instance_id, &item.task_id);
            }
        }
    }

    /// Poll one task and record the result.
    async fn poll(&self, item: &MonitorItem) -> PreheatResult<Next> {
        let instance = self.instances.get(item.instance_id).await?;
        let driver = self.registry.create(&instance)?;
        let progress = driver.check_progress(&item.task_id).await?;

        if let TaskStatus::Other(raw) = &progress.status {
            return Err(PreheatError::UnknownStatus(raw.clone()));
        }

        let changed = self
            .history
            .update_status(
                &item.task_id,
                &progress.status,
                progress.start_time.as_deref(),
                progress.finish_time.as_deref(),
            )
            .await?;
        if !changed {
            warn!(
                task_id = %item.task_id,
                status = %progress.status,
                "Ignoring status that would demote a finished task"
            );
            return Ok(Next::Drop);
        }

        debug!(task_id = %item.task_id, status = %progress.status, "Task progress recorded");
        if progress.status.is_terminal() {
            info!(
                instance = %instance.name,
                task_id = %item.task_id,
                status = %progress.status,
                "Preheat task finished"
            );
            Ok(Next::Drop)
        } else {
            Ok(Next::Requeue)
        }
    }
}

impl ProgressWatcher for Monitor {
    fn watch_progress(&self, instance_id: i64, task_id: &str) {
        let item = MonitorItem {
            instance_id,
            task_id: task_id.to_string(),
        };
        match self.tx.try_send(item) {
            Ok(()) => debug!(instance_id, task_id, "Queued task for progress tracking"),
            Err(TrySendError::Full(item)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(item).await.is_err() {
                        warn!("Progress queue closed before enqueue");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                warn!(instance_id, task_id, "Progress queue closed, task not tracked");
            }
        }
    }
}
