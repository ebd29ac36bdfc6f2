use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Background tasks keyed by the request that started them.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` under `id`.  Finished handles are reaped first.
    pub fn spawn<F>(&self, id: Uuid, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(id, tokio::spawn(task));
        debug!(%id, active = tasks.len(), "background task registered");
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.tasks()
            .get(id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.tasks()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn abort(&self, id: &Uuid) -> bool {
        match self.tasks().remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        let drained: Vec<_> = self.tasks().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "aborting background tasks");
        }
        for (_, handle) in drained {
            handle.abort();
        }
    }
}
