use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::tasks::model::TaskRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for task records.
///
/// `update` applies a mutation atomically: readers see the record either before or after it.
pub trait TaskStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    fn put(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Returns the removed record, if it existed.
    fn delete(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    fn list(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Runs `apply` on the stored record and returns the record as left afterwards.
    fn update(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<Option<TaskRecord>, StoreError>;
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, TaskRecord>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, TaskRecord>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    fn put(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.write().insert(record.id, record);
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.write().remove(&id))
    }

    fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.read().values().cloned().collect())
    }

    fn update(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut tasks = self.write();
        Ok(tasks.get_mut(&id).map(|record| {
            apply(record);
            record.clone()
        }))
    }
}
