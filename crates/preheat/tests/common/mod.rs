//! Shared fixtures for the preheat integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use preheat::config::{MonitorConfig, TransportConfig};
use preheat::models::TaskStatus;
use preheat::provider::{DriverContext, DriverRegistry, HttpClient};
use preheat::store::{
    HistoryStore, MemoryHistoryStore, MemoryInstanceStore, RegistryClient, TokenService,
};
use preheat::{Controller, Monitor, PreheatResult, ProgressWatcher};

pub const REGISTRY_ENDPOINT: &str = "https://harbor.test";
pub const FAKE_DIGEST: &str = "sha256:fake";

// =============================================================================
// Collaborator doubles
// =============================================================================

/// Token collaborator returning a fixed token.
pub struct StaticTokens;

#[async_trait]
impl TokenService for StaticTokens {
    async fn mint(&self, _repository: &str, _actions: &[String]) -> PreheatResult<String> {
        Ok("test-token".to_string())
    }
}

/// Registry collaborator resolving every image to [`FAKE_DIGEST`].
pub struct FakeRegistry;

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn manifest_exists(&self, _repository: &str, _tag: &str) -> PreheatResult<(bool, String)> {
        Ok((true, FAKE_DIGEST.to_string()))
    }
}

/// Watcher recording every enqueue.
#[derive(Default)]
pub struct RecordingWatcher {
    pub items: Mutex<Vec<(i64, String)>>,
}

impl RecordingWatcher {
    pub fn items(&self) -> Vec<(i64, String)> {
        self.items.lock().unwrap().clone()
    }
}

impl ProgressWatcher for RecordingWatcher {
    fn watch_progress(&self, instance_id: i64, task_id: &str) {
        self.items
            .lock()
            .unwrap()
            .push((instance_id, task_id.to_string()));
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub controller: Controller,
    pub monitor: Arc<Monitor>,
    pub registry: Arc<DriverRegistry>,
    pub instances: Arc<MemoryInstanceStore>,
    pub history: Arc<MemoryHistoryStore>,
}

pub fn driver_context(history: Arc<MemoryHistoryStore>) -> DriverContext {
    DriverContext {
        http: HttpClient::new(&TransportConfig::default()).unwrap(),
        registry: Arc::new(FakeRegistry),
        history,
    }
}

/// Full stack over in-memory stores with the built-in drivers and a fast
/// requeue delay.
pub fn harness() -> Harness {
    let instances = Arc::new(MemoryInstanceStore::new());
    let history = Arc::new(MemoryHistoryStore::new());
    let registry = Arc::new(DriverRegistry::builtin(driver_context(history.clone())));

    let monitor = Arc::new(Monitor::new(
        instances.clone(),
        history.clone(),
        registry.clone(),
        MonitorConfig {
            health_interval_secs: 30,
            requeue_delay_ms: 50,
            queue_depth: 64,
        },
    ));
    let controller = Controller::new(
        instances.clone(),
        history.clone(),
        registry.clone(),
        Arc::new(StaticTokens),
        monitor.clone(),
        REGISTRY_ENDPOINT,
    );

    Harness {
        controller,
        monitor,
        registry,
        instances,
        history,
    }
}

/// Poll the history until `task_id` reaches `want`, for up to five seconds.
pub async fn wait_for_status(history: &MemoryHistoryStore, task_id: &str, want: &TaskStatus) {
    for _ in 0..100 {
        if let Ok(row) = history.get_by_task_id(task_id).await {
            if row.status == *want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached {want}");
}
