//! Startup reconciliation of in-flight preheat tasks.
//!
//! The progress queue lives in memory only. On boot every history row that
//! has not reached a terminal state is handed back to the monitor once.

use tracing::{debug, info};

use crate::error::PreheatResult;
use crate::models::Query;
use crate::monitor::ProgressWatcher;
use crate::store::HistoryStore;

/// Re-enqueue every non-terminal history task. Returns how many were queued.
pub async fn reconcile(
    history: &dyn HistoryStore,
    watcher: &dyn ProgressWatcher,
) -> PreheatResult<usize> {
    let rows = history.list(&Query::all()).await?;
    let total = rows.len();

    let mut queued = 0;
    for row in rows
        .into_iter()
        .filter(|r| !r.status.is_terminal() && !r.task_id.is_empty())
    {
        debug!(
            task_id = %row.task_id,
            instance_id = row.instance,
            status = %row.status,
            "Resuming task tracking"
        );
        watcher.watch_progress(row.instance, &row.task_id);
        queued += 1;
    }

    info!(rows = total, queued, "Reconciled preheat history");
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoryRecord, TaskStatus, TIME_PLACEHOLDER};
    use crate::monitor::MockProgressWatcher;
    use crate::store::MemoryHistoryStore;

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
    async fn test_only_live_rows_are_requeued() {
        let history = MemoryHistoryStore::new();
        history.append(row("done", 1, TaskStatus::Success)).await.unwrap();
        history.append(row("broken", 1, TaskStatus::Fail)).await.unwrap();
        history.append(row("busy", 2, TaskStatus::Running)).await.unwrap();
        history.append(row("queued", 2, TaskStatus::Pending)).await.unwrap();

        let mut watcher = MockProgressWatcher::new();
        watcher
            .expect_watch_progress()
            .withf(|id, task| *id == 2 && task == "busy")
            .times(1)
            .return_const(());
        watcher
            .expect_watch_progress()
            .withf(|id, task| *id == 2 && task == "queued")
            .times(1)
            .return_const(());

        assert_eq!(reconcile(&history, &watcher).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_history() {
        let history = MemoryHistoryStore::new();
        let mut watcher = MockProgressWatcher::new();
        watcher.expect_watch_progress().never();
        assert_eq!(reconcile(&history, &watcher).await.unwrap(), 0);
    }
}
