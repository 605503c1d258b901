//! In-process stores.
//!
//! Each store keeps its rows behind one `RwLock`, so every write is atomic
//! and the uniqueness rules are checked under the same lock that applies
//! the change.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PreheatError, PreheatResult};
use crate::models::{HistoryRecord, Instance, Query, TaskStatus};

use super::{HistoryStore, InstanceStore};

#[derive(Debug)]
struct Table<T> {
    next_id: i64,
    rows: BTreeMap<i64, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            rows: BTreeMap::new(),
        }
    }
}

impl<T> Table<T> {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

fn instance_matches(instance: &Instance, query: &Query) -> PreheatResult<bool> {
    for (key, value) in &query.keywords {
        let matched = match key.as_str() {
            "name" => instance.name == *value,
            "vendor" => instance.vendor == *value,
            "endpoint" => instance.endpoint == *value,
            "status" => instance.status.to_string() == *value,
            "enabled" => instance.enabled.to_string() == *value,
            other => {
                return Err(PreheatError::Validation(format!(
                    "unsupported instance query keyword '{other}'"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn history_matches(record: &HistoryRecord, query: &Query) -> PreheatResult<bool> {
    for (key, value) in &query.keywords {
        let matched = match key.as_str() {
            "task_id" => record.task_id == *value,
            "image" => record.image.contains(value.as_str()),
            "status" => record.status.as_str() == value.as_str(),
            "provider" => record.provider == *value,
            "instance" => record.instance.to_string() == *value,
            other => {
                return Err(PreheatError::Validation(format!(
                    "unsupported history query keyword '{other}'"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// In-memory [`InstanceStore`].
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    table: RwLock<Table<Instance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unique(table: &Table<Instance>, instance: &Instance) -> PreheatResult<()> {
        if table
            .rows
            .values()
            .any(|other| other.id != instance.id && other.name == instance.name)
        {
            return Err(PreheatError::Conflict(format!(
                "instance name '{}' already in use",
                instance.name
            )));
        }
        Ok(())
    }

    fn clear_other_defaults(table: &mut Table<Instance>, keep: i64) {
        for other in table.rows.values_mut() {
            if other.id != keep {
                other.is_default = false;
            }
        }
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn save(&self, mut instance: Instance) -> PreheatResult<i64> {
        let mut table = self.table.write().await;
        instance.id = 0;
        Self::check_unique(&table, &instance)?;

        let id = table.allocate();
        instance.id = id;
        if instance.is_default {
            Self::clear_other_defaults(&mut table, id);
        }
        table.rows.insert(id, instance);
        debug!(instance_id = id, "Saved instance");
        Ok(id)
    }

    async fn get(&self, id: i64) -> PreheatResult<Instance> {
        self.table
            .read()
            .await
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| PreheatError::NotFound(format!("instance {id}")))
    }

    async fn get_by_name(&self, name: &str) -> PreheatResult<Instance> {
        self.table
            .read()
            .await
            .rows
            .values()
            .find(|i| i.name == name)
            .cloned()
            .ok_or_else(|| PreheatError::NotFound(format!("instance '{name}'")))
    }

    async fn update(&self, instance: &Instance) -> PreheatResult<()> {
        let mut table = self.table.write().await;
        if !table.rows.contains_key(&instance.id) {
            return Err(PreheatError::NotFound(format!("instance {}", instance.id)));
        }
        Self::check_unique(&table, instance)?;
        if instance.is_default {
            Self::clear_other_defaults(&mut table, instance.id);
        }
        table.rows.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> PreheatResult<()> {
        self.table
            .write()
            .await
            .rows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| PreheatError::NotFound(format!("instance {id}")))
    }

    async fn count(&self, query: &Query) -> PreheatResult<u64> {
        let table = self.table.read().await;
        let mut total = 0;
        for instance in table.rows.values() {
            if instance_matches(instance, query)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn list(&self, query: &Query) -> PreheatResult<Vec<Instance>> {
        let table = self.table.read().await;
        let mut rows = Vec::new();
        for instance in table.rows.values() {
            if instance_matches(instance, query)? {
                rows.push(instance.clone());
            }
        }
        Ok(query.paginate(rows))
    }
}

/// In-memory [`HistoryStore`].
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    table: RwLock<Table<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, mut record: HistoryRecord) -> PreheatResult<i64> {
        record.validate()?;
        let mut table = self.table.write().await;
        let id = table.allocate();
        record.id = id;
        table.rows.insert(id, record);
        Ok(id)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
        start_time: Option<&str>,
        finish_time: Option<&str>,
    ) -> PreheatResult<bool> {
        let mut table = self.table.write().await;
        let mut found = false;
        let mut changed = false;

        for record in table.rows.values_mut().filter(|r| r.task_id == task_id) {
            found = true;
            if !record.status.can_transition_to(status) {
                continue;
            }
            record.status = status.clone();
            if let Some(start) = start_time.filter(|s| !s.is_empty()) {
                record.start_time = start.to_string();
            }
            if let Some(finish) = finish_time.filter(|s| !s.is_empty()) {
                record.finish_time = finish.to_string();
            }
            changed = true;
        }

        if !found {
            return Err(PreheatError::NotFound(format!("history of task {task_id}")));
        }
        Ok(changed)
    }

    async fn get_by_task_id(&self, task_id: &str) -> PreheatResult<HistoryRecord> {
        self.table
            .read()
            .await
            .rows
            .values()
            .find(|r| r.task_id == task_id)
            .cloned()
            .ok_or_else(|| PreheatError::NotFound(format!("history of task {task_id}")))
    }

    async fn count(&self, query: &Query) -> PreheatResult<u64> {
        let table = self.table.read().await;
        let mut total = 0;
        for record in table.rows.values() {
            if history_matches(record, query)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn list(&self, query: &Query) -> PreheatResult<Vec<HistoryRecord>> {
        let table = self.table.read().await;
        let mut rows = Vec::new();
        for record in table.rows.values() {
            if history_matches(record, query)? {
                rows.push(record.clone());
            }
        }
        Ok(query.paginate(rows))
    }
}
