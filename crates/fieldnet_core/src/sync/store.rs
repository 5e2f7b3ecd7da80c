//! Persistence seam for pending sync tasks.

use crate::error::NetResult;
use crate::types::{SyncTask, TaskId};
use parking_lot::Mutex;

/// Durable storage for tasks that have not reached the server yet.
///
/// Calls are synchronous and short; the scheduler makes them while holding
/// no async locks.
pub trait SyncTaskStore: Send + Sync {
    /// Inserts or replaces a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task could not be made durable.
    fn persist(&self, task: &SyncTask) -> NetResult<()>;

    /// Forgets a task. Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be recorded.
    fn remove(&self, id: TaskId) -> NetResult<()>;

    /// Returns every pending task in first-persisted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load_pending(&self) -> NetResult<Vec<SyncTask>>;
}

/// Non-durable store for tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<SyncTask>>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no task is stored.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl SyncTaskStore for MemoryTaskStore {
    fn persist(&self, task: &SyncTask) -> NetResult<()> {
        let mut tasks = self.tasks.lock();
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        Ok(())
    }

    fn remove(&self, id: TaskId) -> NetResult<()> {
        self.tasks.lock().retain(|t| t.id != id);
        Ok(())
    }

    fn load_pending(&self) -> NetResult<Vec<SyncTask>> {
        Ok(self.tasks.lock().clone())
    }
}
