//! In-place update of a running task.
//!
//! The first tick commits the running instance to a new artifact and parks the task in
//! `CreatingImage` with a deadline. Later ticks poll for the artifact and, once it exists,
//! swap the old instance for one created from it. Every failure leaves the old instance
//! running and marks the task `UpdateError`.

use api_types::TaskStatus;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::scheduler::TaskScheduler;
use super::traits::ExecutionBackend;
use super::traits::TaskReporter;
use super::traits::TaskStore;
use super::traits::TimeSource;
use super::types::InstanceConfig;
use crate::domain::resource::join_ids;
use crate::domain::resource::DeviceSet;
use crate::domain::task::ServerSpecification;
use crate::domain::task::Task;
use crate::domain::task::TaskOperation;

/// Artifact name for a commit of `task_id`; lowercase and limited to `[a-z0-9._-]`.
pub fn update_artifact_name(task_id: &str, now_ms: i64) -> String {
    let repo: String = task_id
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{repo}-update:{now_ms}")
}

impl<B, S, R, T> TaskScheduler<B, S, R, T>
where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    pub(super) fn exec_update(&mut self, task: Task, spec: &ServerSpecification) {
        if task.status == TaskStatus::CreatingImage {
            self.finish_update(task, spec);
        } else {
            self.begin_update(task, spec);
        }
    }

    /// Devices that would serve `spec` once the task's current devices are released.
    fn select_after_release(
        &mut self,
        task_id: &str,
        spec: &ServerSpecification,
    ) -> (DeviceSet, Option<DeviceSet>) {
        let held = self.pool.held_by(task_id);
        self.pool.free(&held);
        let selected = self.pool.select(&spec.gpus);
        self.pool.bind(&held, task_id);
        (held, selected)
    }

    fn begin_update(&mut self, mut task: Task, spec: &ServerSpecification) {
        let task_id = task.task_id.clone();

        if !self.locate_instance(&mut task) {
            info!(task_id = %task_id, "No instance to update, starting fresh");
            self.exec_start(task, spec);
            return;
        }

        let (_, selected) = self.select_after_release(&task_id, spec);
        if selected.is_none() {
            warn!(
                task_id = %task_id,
                request = %spec.gpus,
                pool = %self.pool,
                "Update does not fit the pool"
            );
            self.mark_update_error(task);
            return;
        }

        let now = self.clock.now_millis();
        let artifact = update_artifact_name(&task_id, now);
        if let Err(e) = self.backend.commit(&task.handle, &artifact) {
            warn!(task_id = %task_id, error = %e, "Commit of running instance failed");
            self.mark_update_error(task);
            return;
        }

        let budget = spec
            .sleep_time
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.config.update_budget);
        info!(
            task_id = %task_id,
            artifact = %artifact,
            budget_secs = budget.as_secs(),
            "Committing instance for update"
        );
        task.update_artifact = Some(artifact);
        task.status = TaskStatus::CreatingImage;
        task.deadline = Some(now + budget.as_millis() as i64);
        self.commit(task);
    }

    fn finish_update(&mut self, mut task: Task, spec: &ServerSpecification) {
        let task_id = task.task_id.clone();
        let now = self.clock.now_millis();

        let Some(artifact) = task.update_artifact.clone() else {
            warn!(task_id = %task_id, "Update lost its artifact");
            self.mark_update_error(task);
            return;
        };
        if task.deadline.is_some_and(|deadline| now > deadline) {
            warn!(task_id = %task_id, artifact = %artifact, "Update artifact not ready before deadline");
            self.mark_update_error(task);
            return;
        }

        match self
            .backend
            .artifact_exists(&artifact, self.config.artifact_check_timeout)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task_id, artifact = %artifact, "Update artifact not ready yet");
                return;
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Update artifact check failed, retrying");
                return;
            }
        }

        let (old_gpus, selected) = self.select_after_release(&task_id, spec);
        let Some(new_gpus) = selected else {
            warn!(task_id = %task_id, pool = %self.pool, "Update no longer fits the pool");
            self.mark_update_error(task);
            return;
        };

        let old_handle = task.handle.clone();
        if let Err(e) = self.backend.stop(&old_handle, self.config.stop_timeout) {
            warn!(task_id = %task_id, error = %e, "Stopping old instance failed");
            self.mark_update_error(task);
            return;
        }

        let mut config = InstanceConfig::for_task(&task, spec, &artifact, new_gpus.clone());
        config.name = format!("{task_id}-{now}");
        let new_handle = match self.backend.create(&config) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Creating updated instance failed, rolling back");
                self.rollback_update(task);
                return;
            }
        };
        if let Err(e) = self.backend.start(&new_handle) {
            warn!(task_id = %task_id, error = %e, "Starting updated instance failed, rolling back");
            if let Err(e) = self.backend.remove(&new_handle) {
                debug!(task_id = %task_id, error = %e, "Removing failed instance failed");
            }
            self.rollback_update(task);
            return;
        }

        if let Err(e) = self.backend.remove(&old_handle) {
            warn!(task_id = %task_id, handle = %old_handle, error = %e, "Removing old instance failed");
        }

        self.pool.free(&old_gpus);
        if !self.pool.bind(&new_gpus, &task_id) {
            warn!(task_id = %task_id, "Updated devices could not be bound");
        }

        info!(
            task_id = %task_id,
            handle = %new_handle,
            gpus = %join_ids(&new_gpus),
            "Task updated"
        );
        task.handle = new_handle;
        task.engine = artifact;
        task.update_artifact = None;
        task.gpus = new_gpus;
        task.status = TaskStatus::Running;
        task.operation = TaskOperation::None;
        task.deadline = None;
        task.error_times = 0;
        task.start_time = now;
        self.queue.retain(|id| id != &task_id);
        self.running.insert(task_id);
        self.commit(task);
    }

    /// Restart the old instance after a failed swap.
    fn rollback_update(&mut self, task: Task) {
        if let Err(e) = self.backend.start(&task.handle) {
            warn!(task_id = %task.task_id, error = %e, "Rollback could not restart old instance");
        }
        self.mark_update_error(task);
    }

    /// Park the task back in the running set on its last good instance.
    fn mark_update_error(&mut self, mut task: Task) {
        let task_id = task.task_id.clone();
        if let Some(artifact) = task.update_artifact.take() {
            if let Err(e) = self.backend.remove_artifact(&artifact) {
                debug!(task_id = %task_id, error = %e, "Removing update artifact failed");
            }
        }
        task.status = TaskStatus::UpdateError;
        task.operation = TaskOperation::None;
        task.deadline = None;
        self.queue.retain(|id| id != &task_id);
        self.running.insert(task_id.clone());
        warn!(task_id = %task_id, "Task update failed");
        self.commit(task);
    }
}
