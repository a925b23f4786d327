//! Task scheduler state and its externally visible operations.
//!
//! [`TaskScheduler`] owns the queue, the running set, the GPU pool and the pull manager. It
//! is driven by [`TaskScheduler::tick`] and never shared across threads; callers reach it
//! through the command channel in [`super::service`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::time::Duration;

use api_types::CreateTaskRequest;
use api_types::GpuPoolInfo;
use api_types::GpuState;
use api_types::TaskStatus;
use api_types::TaskStatusInfo;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::idle::IdleTaskFiller;
use super::pull::PullManager;
use super::traits::ExecutionBackend;
use super::traits::TaskReporter;
use super::traits::TaskStore;
use super::traits::TimeSource;
use super::types::BackendError;
use super::types::ReportAck;
use super::types::Result;
use super::types::SchedulerError;
use super::types::TaskEvent;
use crate::domain::resource::GpuPool;
use crate::domain::task::ServerSpecification;
use crate::domain::task::Task;
use crate::domain::task::TaskOperation;

/// Tunables of the scheduling engine
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Backend failures tolerated before a task is closed abnormally
    pub retry_ceiling: u32,
    /// Upper bound for a task sitting in `PullingImage`
    pub pull_timeout: Duration,
    /// Admission cap on known tasks
    pub max_task_count: usize,
    /// Terminal tasks allowed to survive a prune pass before it halves its interval
    pub max_prune_count: usize,
    pub stop_timeout: Duration,
    pub artifact_check_timeout: Duration,
    /// Default spacing of running reports when the reporter does not suggest one
    pub report_interval: Duration,
    /// Update commit budget when the specification carries no `sleep_time`
    pub update_budget: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 1,
            pull_timeout: Duration::from_secs(5 * 60 * 60),
            max_task_count: 200_000,
            max_prune_count: 160_000,
            stop_timeout: Duration::from_secs(30),
            artifact_check_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(5 * 60),
            update_budget: Duration::from_secs(30 * 60),
        }
    }
}

/// Counts gathered while reloading the task store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub queued: usize,
    pub running: usize,
    pub terminal: usize,
    pub demoted: usize,
}

pub struct TaskScheduler<B, S, R, T>
where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    pub(super) config: SchedulerConfig,
    pub(super) backend: B,
    pub(super) store: S,
    pub(super) reporter: R,
    pub(super) clock: T,
    pub(super) pool: GpuPool,
    pub(super) pulls: PullManager,
    pub(super) idle: IdleTaskFiller<S>,
    pub(super) tasks: BTreeMap<String, Task>,
    pub(super) queue: VecDeque<String>,
    pub(super) running: BTreeSet<String>,
    /// Tasks whose persisted stop or delete was interrupted, re-driven on the next tick
    pub(super) pending_ops: BTreeSet<String>,
}

impl<B, S, R, T> TaskScheduler<B, S, R, T>
where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    pub fn new(
        config: SchedulerConfig,
        backend: B,
        store: S,
        reporter: R,
        clock: T,
        pool: GpuPool,
        idle: IdleTaskFiller<S>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            reporter,
            clock,
            pool,
            pulls: PullManager::new(),
            idle,
            tasks: BTreeMap::new(),
            queue: VecDeque::new(),
            running: BTreeSet::new(),
            pending_ops: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &GpuPool {
        &self.pool
    }

    pub fn find(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// All known tasks, oldest first
    pub fn list_all(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            a.received_time
                .cmp(&b.received_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().cloned().collect()
    }

    pub fn is_queued(&self, task_id: &str) -> bool {
        self.queue.iter().any(|id| id == task_id)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains(task_id)
    }

    pub fn idle_filler(&self) -> &IdleTaskFiller<S> {
        &self.idle
    }

    /// Replace or clear the idle task definition.
    pub fn set_idle_task(&mut self, request: Option<CreateTaskRequest>) -> Result<()> {
        let now = self.clock.now_millis();
        self.idle.set_task(
            request,
            &self.backend,
            &mut self.pulls,
            self.config.stop_timeout,
            now,
        )?;
        Ok(())
    }

    pub fn pool_info(&self) -> GpuPoolInfo {
        GpuPoolInfo {
            total: self.pool.total(),
            free: self.pool.free_count(),
            gpus: self
                .pool
                .devices()
                .into_iter()
                .map(|d| GpuState {
                    id: d.id,
                    model: d.model,
                    task_id: d.owner,
                })
                .collect(),
        }
    }

    /// Reconcile a re-probed device inventory
    pub fn merge_gpus(&mut self, probed: &GpuPool) {
        self.pool.merge(probed);
        debug!(pool = %self.pool, "GPU pool reconciled");
    }

    /// Admit a new task.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::DuplicateTask`] if the id is already known
    /// - [`SchedulerError::CapacityExceeded`] once the task cap is reached
    /// - [`SchedulerError::Spec`] if the server specification does not parse
    pub fn enqueue(&mut self, request: CreateTaskRequest) -> Result<Task> {
        if self.tasks.contains_key(&request.task_id) {
            return Err(SchedulerError::DuplicateTask(request.task_id));
        }
        if self.tasks.len() >= self.config.max_task_count {
            return Err(SchedulerError::CapacityExceeded {
                limit: self.config.max_task_count,
            });
        }
        ServerSpecification::parse(&request.server_specification)?;

        let task = Task::from_request(request, self.clock.now_millis());
        self.store.put(&task)?;
        info!(task_id = %task.task_id, engine = %task.engine, "Task enqueued");
        self.queue.push_back(task.task_id.clone());
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    /// Rebuild in-memory state from the store. Must run before the first tick.
    pub fn load(&mut self) -> Result<LoadSummary> {
        let mut loaded = self.store.get_all()?;
        loaded.sort_by(|a, b| {
            a.received_time
                .cmp(&b.received_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let mut summary = LoadSummary::default();
        for mut task in loaded {
            let id = task.task_id.clone();
            if matches!(
                task.operation,
                TaskOperation::Stop { .. } | TaskOperation::Delete
            ) {
                self.pending_ops.insert(id.clone());
            }

            match task.status {
                TaskStatus::Unknown | TaskStatus::Queueing | TaskStatus::PullingImage => {
                    // A task queued for update or restart still owns its devices.
                    if !task.gpus.is_empty() && !self.pool.bind(&task.gpus, &id) {
                        warn!(task_id = %id, "Queued task lost its previous allocation");
                    }
                    if task.status != TaskStatus::Queueing {
                        task.status = TaskStatus::Queueing;
                        self.commit(task);
                    } else {
                        self.tasks.insert(id.clone(), task);
                    }
                    self.queue.push_back(id);
                    summary.queued += 1;
                }
                TaskStatus::Running | TaskStatus::UpdateError | TaskStatus::CreatingImage => {
                    if !self.pool.bind(&task.gpus, &id) {
                        warn!(
                            task_id = %id,
                            gpus = %crate::domain::resource::join_ids(&task.gpus),
                            "Recovered allocation no longer fits the pool"
                        );
                        self.tasks.insert(id.clone(), task);
                        self.running.insert(id.clone());
                        if let Err(e) = self.stop(&id, TaskStatus::OutOfGpuResource) {
                            warn!(task_id = %id, error = %e, "Failed to stop demoted task");
                        }
                        summary.demoted += 1;
                        continue;
                    }
                    if task.status == TaskStatus::CreatingImage {
                        warn!(task_id = %id, "Update interrupted by restart");
                        task.status = TaskStatus::UpdateError;
                        task.deadline = None;
                        self.commit(task);
                    } else {
                        self.tasks.insert(id.clone(), task);
                    }
                    self.running.insert(id);
                    summary.running += 1;
                }
                _ => {
                    self.tasks.insert(id, task);
                    summary.terminal += 1;
                }
            }
        }

        info!(
            queued = summary.queued,
            running = summary.running,
            terminal = summary.terminal,
            demoted = summary.demoted,
            pool = %self.pool,
            "Task store loaded"
        );
        Ok(summary)
    }

    /// One scheduling step.
    pub fn tick(&mut self) {
        self.redrive_pending_operations();

        if !self.queue.is_empty() {
            self.advance_head();
        }

        self.sweep_running();

        if self.queue.is_empty() && self.running.is_empty() {
            let now = self.clock.now_millis();
            self.idle.exec(&self.backend, &mut self.pulls, now);
        } else {
            self.idle.touch();
        }
    }

    fn redrive_pending_operations(&mut self) {
        let pending = std::mem::take(&mut self.pending_ops);
        for id in pending {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            let result = match task.operation {
                TaskOperation::Stop { end_status } if !task.is_terminal() => {
                    info!(task_id = %id, "Re-driving interrupted stop");
                    self.stop(&id, end_status)
                }
                TaskOperation::Delete => {
                    info!(task_id = %id, "Re-driving interrupted delete");
                    self.delete(&id)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(task_id = %id, error = %e, "Pending operation failed, will retry");
                self.pending_ops.insert(id);
            }
        }
    }

    /// Stop a task and record `end_status`.
    ///
    /// A running or mid-operation task has its instance stopped and its GPUs released. A
    /// queued task leaves the queue and loses any pull it owns; it is only reported
    /// upstream when it was the head of the queue. Stopping a terminal task is a no-op.
    pub fn stop(&mut self, task_id: &str, end_status: TaskStatus) -> Result<()> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if task.is_terminal() {
            debug!(task_id, status = %task.status, "Task already terminal");
            return Ok(());
        }

        let was_head = self.queue.front().is_some_and(|id| id == task_id);
        let queued = self.is_queued(task_id);

        task.operation = TaskOperation::Stop { end_status };
        self.store.put(&task)?;

        if queued {
            self.queue.retain(|id| id != task_id);
            if task.status == TaskStatus::PullingImage && self.pulls.is_pulling(&task.engine) {
                self.pulls.terminate();
            }
            if task.has_instance() {
                if let Err(e) = self.backend.stop(&task.handle, self.config.stop_timeout) {
                    debug!(task_id, error = %e, "Best-effort stop of queued task failed");
                }
            }
        } else if task.has_instance() {
            match self.backend.stop(&task.handle, self.config.stop_timeout) {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    task.error_times += 1;
                    self.commit(task);
                    self.pending_ops.insert(task_id.to_string());
                    return Err(e.into());
                }
            }
        }

        let held = self.pool.held_by(task_id);
        self.pool.free(&held);
        self.running.remove(task_id);

        task.close(end_status, self.clock.now_millis());
        task.operation = TaskOperation::None;
        info!(task_id, status = %end_status, "Task stopped");

        let persisted = self.commit(task);
        if persisted && (!queued || was_head) {
            self.report(task_id);
        }
        Ok(())
    }

    /// Re-queue a task to stop and start its existing instance.
    pub fn restart(&mut self, task_id: &str) -> Result<()> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if self.is_queued(task_id) || !self.locate_instance(&mut task) {
            return Err(SchedulerError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        task.operation = TaskOperation::Restart;
        task.status = TaskStatus::Queueing;
        task.error_times = 0;
        self.store.put(&task)?;
        self.running.remove(task_id);
        self.queue.push_back(task_id.to_string());
        self.tasks.insert(task_id.to_string(), task);
        info!(task_id, "Task queued for restart");
        Ok(())
    }

    /// Re-queue a running task with a new server specification carrying an update directive.
    pub fn update(&mut self, task_id: &str, server_specification: String) -> Result<()> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if !self.is_running(task_id) || !task.has_instance() {
            return Err(SchedulerError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        ServerSpecification::parse(&server_specification)?;

        task.server_specification = server_specification;
        task.status = TaskStatus::Queueing;
        task.operation = TaskOperation::None;
        task.error_times = 0;
        self.store.put(&task)?;
        self.running.remove(task_id);
        self.queue.push_back(task_id.to_string());
        self.tasks.insert(task_id.to_string(), task);
        info!(task_id, "Task queued for update");
        Ok(())
    }

    /// Hard reset of a running instance
    pub fn reset(&mut self, task_id: &str) -> Result<()> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if !self.is_running(task_id) || !task.has_instance() {
            return Err(SchedulerError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        task.operation = TaskOperation::Reset;
        self.store.put(&task)?;

        let result = self.backend.reset(&task.handle);
        task.operation = TaskOperation::None;
        match result {
            Ok(()) => {
                info!(task_id, "Task instance reset");
                task.status = TaskStatus::Running;
                task.error_times = 0;
                self.commit(task);
                Ok(())
            }
            Err(e) => {
                warn!(task_id, error = %e, "Task instance reset failed");
                task.error_times += 1;
                self.commit(task);
                Err(e.into())
            }
        }
    }

    /// Stop if needed, remove the instance and forget the task.
    pub fn delete(&mut self, task_id: &str) -> Result<()> {
        if !self.tasks.contains_key(task_id) {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        }
        if self
            .tasks
            .get(task_id)
            .is_some_and(|task| !task.is_terminal())
        {
            self.stop(task_id, TaskStatus::Stopped)?;
        }

        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.operation = TaskOperation::Delete;
        self.store.put(&task)?;
        self.tasks.insert(task_id.to_string(), task.clone());

        if task.has_instance() {
            match self.backend.remove(&task.handle) {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    self.pending_ops.insert(task_id.to_string());
                    return Err(e.into());
                }
            }
        }

        self.forget(task_id)?;
        info!(task_id, "Task deleted");
        Ok(())
    }

    /// Live status, re-populating a lost handle by looking the instance up by task id
    pub fn get_status(&mut self, task_id: &str) -> Result<TaskStatusInfo> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;

        let had_handle = task.has_instance();
        let instance_running = if self.locate_instance(&mut task) {
            match self.backend.inspect(&task.handle) {
                Ok(state) => state.running,
                Err(e) => {
                    debug!(task_id, error = %e, "Inspect failed");
                    false
                }
            }
        } else {
            false
        };

        let info = TaskStatusInfo {
            task_id: task.task_id.clone(),
            status: task.status,
            instance_running,
            handle: task.handle.clone(),
        };
        if !had_handle && task.has_instance() {
            self.commit(task);
        }
        Ok(info)
    }

    /// Make sure `task.handle` names an existing instance, recovering it by task id when
    /// the local record lost it. Returns whether an instance is known.
    pub(super) fn locate_instance(&self, task: &mut Task) -> bool {
        if task.has_instance() {
            return true;
        }
        match self.backend.inspect(&task.task_id) {
            Ok(state) => {
                info!(task_id = %task.task_id, handle = %state.handle, "Recovered instance handle");
                task.handle = state.handle;
                true
            }
            Err(_) => false,
        }
    }

    /// Persist and store a task; returns whether the write reached the store.
    pub(super) fn commit(&mut self, task: Task) -> bool {
        let persisted = match self.store.put(&task) {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Failed to persist task");
                false
            }
        };
        self.tasks.insert(task.task_id.clone(), task);
        persisted
    }

    pub(super) fn report(&self, task_id: &str) -> Option<ReportAck> {
        let task = self.tasks.get(task_id)?;
        match self.reporter.report(&TaskEvent::from(task)) {
            Ok(ack) => Some(ack),
            Err(e) => {
                warn!(task_id, error = %e, "Failed to report task event");
                None
            }
        }
    }

    /// Drop a task from the store and every in-memory structure.
    pub(super) fn forget(&mut self, task_id: &str) -> Result<()> {
        self.store.delete(task_id)?;
        self.tasks.remove(task_id);
        self.queue.retain(|id| id != task_id);
        self.running.remove(task_id);
        self.pending_ops.remove(task_id);
        Ok(())
    }

    pub(super) fn stop_idle_filler(&mut self) {
        self.idle
            .stop(&self.backend, &mut self.pulls, self.config.stop_timeout);
    }

    /// True when no task is both queued and running and every tracked id is known.
    #[cfg(test)]
    pub(super) fn membership_is_consistent(&self) -> bool {
        self.queue.iter().all(|id| !self.running.contains(id))
            && self.queue.iter().all(|id| self.tasks.contains_key(id))
            && self.running.iter().all(|id| self.tasks.contains_key(id))
    }
}
