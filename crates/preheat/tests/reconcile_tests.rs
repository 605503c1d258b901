//! Startup reconciliation against a pre-populated history.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{harness, wait_for_status, RecordingWatcher};
use preheat::models::{HealthStatus, HistoryRecord, Instance, TaskStatus, TIME_PLACEHOLDER};
use preheat::reconcile;
use preheat::store::{HistoryStore, InstanceStore, MemoryHistoryStore};

fn row(task_id: &str, instance: i64, status: TaskStatus) -> HistoryRecord {
    HistoryRecord {
        id: 0,
        task_id: task_id.to_string(),
        image: "library/alpine:latest".to_string(),
        start_time: TIME_PLACEHOLDER.to_string(),
        finish_time: TIME_PLACEHOLDER.to_string(),
        status,
        provider: "dragonfly".to_string(),
        instance,
    }
}

#[tokio::test]
async fn test_only_running_row_is_enqueued() {
    let history = MemoryHistoryStore::new();
    history.append(row("done", 1, TaskStatus::Success)).await.unwrap();
    history.append(row("failed", 1, TaskStatus::Fail)).await.unwrap();
    history.append(row("busy", 3, TaskStatus::Running)).await.unwrap();

    let watcher = RecordingWatcher::default();
    let queued = reconcile(&history, &watcher).await.unwrap();

    assert_eq!(queued, 1);
    assert_eq!(watcher.items(), vec![(3, "busy".to_string())]);
}

#[tokio::test]
async fn test_reconciled_task_is_tracked_to_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/preheats/busy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ID": "busy",
            "Status": "SUCCESS"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness();
    let mut instance = Instance::new("df", "dragonfly", server.uri());
    instance.status = HealthStatus::Healthy;
    let id = h.instances.save(instance).await.unwrap();
    h.history.append(row("busy", id, TaskStatus::Running)).await.unwrap();
    h.history.append(row("done", id, TaskStatus::Success)).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = h.monitor.start(cancel.clone()).unwrap();
    let watcher: Arc<dyn preheat::ProgressWatcher> = h.monitor.clone();
    assert_eq!(reconcile(h.history.as_ref(), watcher.as_ref()).await.unwrap(), 1);

    wait_for_status(&h.history, "busy", &TaskStatus::Success).await;

    cancel.cancel();
    handle.join().await;
}
