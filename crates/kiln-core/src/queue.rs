//! In-memory pending-task queue.
//!
//! The queue mirrors the store's `New` rows, oldest first by id, and adds
//! the two behaviors the store cannot give us cheaply: de-duplication of
//! structurally equal work and runner-criteria matching. Every mutation
//! goes through the store first, so the mirror can always be rebuilt with
//! [`TaskQueue::restore`].
//!
//! Dispatched tasks are kept in memory with status `Running` until their
//! result arrives; only terminal transitions remove them.

use std::sync::Arc;

use serde_json::Value;

use kiln_kernel::runner::RunnerId;
use kiln_kernel::store::{StoreError, TaskStore};
use kiln_kernel::task::{Task, TaskStatus};

use crate::project::ProjectRegistry;

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    tasks: Vec<Task>,
}

impl TaskQueue {
    /// Rebuild the queue from the store's pending rows.
    pub async fn restore(store: Arc<dyn TaskStore>) -> Result<Self, StoreError> {
        let tasks = store.load_new().await?;
        for task in &tasks {
            tracing::info!(id = task.id(), task = %task.serialize(), "restored task");
        }
        Ok(Self { store, tasks })
    }

    /// Enqueue a freshly derived task.
    ///
    /// When a structurally equal pending task already exists the new
    /// instance is dropped silently and `Ok(false)` is returned; otherwise
    /// the task is persisted (acquiring its id) and appended in id order.
    pub async fn add(&mut self, mut task: Task) -> Result<bool, StoreError> {
        let duplicate = self
            .tasks
            .iter()
            .any(|queued| queued.status() == TaskStatus::New && queued.same_as(&task));
        if duplicate {
            tracing::debug!(task = %task.serialize(), "task not added");
            return Ok(false);
        }

        self.store.insert(&mut task).await?;
        tracing::info!(id = task.id(), task = %task.serialize(), "added task");

        let position = self.tasks.partition_point(|queued| queued.id() < task.id());
        self.tasks.insert(position, task);
        Ok(true)
    }

    /// The oldest pending task whose project accepts `runner`.
    pub fn pick(&self, runner: &RunnerId, registry: &ProjectRegistry) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.status() == TaskStatus::New)
            .find(|task| {
                task.project_name()
                    .and_then(|name| registry.get(name))
                    .is_some_and(|project| runner.matches(project.runner_criteria()))
            })
    }

    /// A queued or dispatched task with a structurally equal descriptor.
    pub fn find_same(&self, descriptor: &Value) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| kiln_kernel::json::structural_eq(task.descriptor(), descriptor))
    }

    /// Resolve a runner-reported descriptor to a live task, falling back to
    /// the store for tasks dispatched before the last restart.
    pub async fn resolve(&self, descriptor: &Value) -> Result<Option<Task>, StoreError> {
        if let Some(task) = self.find_same(descriptor) {
            return Ok(Some(task.clone()));
        }
        self.store.find_active(descriptor).await
    }

    /// Transition a picked task to `Running`, keeping it in memory.
    pub async fn mark_dispatched(&mut self, id: u64) -> Result<(), StoreError> {
        self.store.update_status(id, TaskStatus::Running).await?;
        if let Some(task) = self.tasks.iter_mut().find(|task| task.id() == id) {
            task.set_status(TaskStatus::Running);
        }
        Ok(())
    }

    /// Terminal success: update the store and forget the task.
    pub async fn mark_done(&mut self, id: u64) -> Result<(), StoreError> {
        self.store.update_status(id, TaskStatus::Done).await?;
        self.tasks.retain(|task| task.id() != id);
        Ok(())
    }

    /// Terminal failure (or cancel before dispatch): update the store and
    /// forget the task.
    pub async fn mark_aborted(&mut self, id: u64) -> Result<(), StoreError> {
        self.store.update_status(id, TaskStatus::Aborted).await?;
        self.tasks.retain(|task| task.id() != id);
        Ok(())
    }

    /// Number of pending (not yet dispatched) tasks.
    pub fn pending(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status() == TaskStatus::New)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}
