//! Task Store (C3, spec §2, §4.8): concurrent id -> handle map, with
//! snapshot iteration for reconciliation.

use std::sync::Arc;

use dashmap::DashMap;

use crate::task::handle::TaskHandle;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),
}

/// Owned exclusively by the Driver Core (spec §3 "Ownership").
#[derive(Default)]
pub struct TaskStore {
    tasks: DashMap<String, Arc<TaskHandle>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn insert(&self, task_id: String, handle: Arc<TaskHandle>) {
        self.tasks.insert(task_id, handle);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.get(task_id).map(|r| r.clone())
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.remove(task_id).map(|(_, v)| v)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Snapshot of tracked container ids, for the Reconciler (§4.7 step 1).
    /// Copies under the map's internal sharded locks, not a single
    /// global read lock, matching dashmap's iteration contract.
    pub fn tracked_container_ids(&self) -> std::collections::HashSet<String> {
        self.tasks
            .iter()
            .map(|entry| entry.value().container_id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }
}
