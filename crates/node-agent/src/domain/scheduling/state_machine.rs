//! Per-task lifecycle transitions driven from the scheduler tick

use api_types::TaskStatus;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::pull::PullState;
use super::scheduler::TaskScheduler;
use super::traits::ExecutionBackend;
use super::traits::TaskReporter;
use super::traits::TaskStore;
use super::traits::TimeSource;
use super::types::BackendError;
use super::types::InstanceConfig;
use super::types::PullError;
use super::types::TaskEvent;
use crate::domain::resource::join_ids;
use crate::domain::resource::DeviceSet;
use crate::domain::resource::GpuRequest;
use crate::domain::task::Directive;
use crate::domain::task::ServerSpecification;
use crate::domain::task::Task;
use crate::domain::task::TaskOperation;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Exit codes of a workload that ended on its own terms: success, or SIGKILL from a stop.
fn is_clean_exit(exit_code: i32) -> bool {
    matches!(exit_code, 0 | 137)
}

impl<B, S, R, T> TaskScheduler<B, S, R, T>
where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    /// Advance the task at the head of the queue by one step.
    pub fn advance_head(&mut self) {
        let Some(task_id) = self.queue.front().cloned() else {
            return;
        };
        let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
            warn!(task_id = %task_id, "Queued task has no record, dropping");
            self.queue.pop_front();
            return;
        };

        match status {
            TaskStatus::Queueing | TaskStatus::CreatingImage => self.exec(&task_id),
            TaskStatus::PullingImage => self.check_pull(&task_id),
            other => {
                error!(task_id = %task_id, status = %other, "Unexpected status at queue head, dropping");
                self.queue.pop_front();
            }
        }
    }

    /// Try to get the head task running.
    pub(super) fn exec(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id).cloned() else {
            return;
        };

        if task.error_times > self.config.retry_ceiling {
            warn!(
                task_id,
                error_times = task.error_times,
                "Retry ceiling exceeded, closing task"
            );
            self.close_head(task_id, TaskStatus::AbnormallyClosed);
            return;
        }

        let spec = match task.spec() {
            Ok(spec) => spec,
            Err(e) => {
                error!(task_id, error = %e, "Server specification rejected");
                self.close_head(task_id, TaskStatus::AbnormallyClosed);
                return;
            }
        };

        let directive = if task.operation == TaskOperation::Restart {
            Directive::Restart
        } else {
            spec.directive
        };

        match directive {
            Directive::Restart => self.exec_restart(task, &spec),
            Directive::Update => self.exec_update(task, &spec),
            Directive::Start => self.exec_start(task, &spec),
        }
    }

    pub(super) fn exec_start(&mut self, mut task: Task, spec: &ServerSpecification) {
        let task_id = task.task_id.clone();

        let Some(gpus) = self.pool.select_for(&spec.gpus, &task_id) else {
            warn!(
                task_id = %task_id,
                request = %spec.gpus,
                pool = %self.pool,
                "GPU request does not fit the pool"
            );
            self.close_head(&task_id, TaskStatus::OutOfGpuResource);
            return;
        };

        self.stop_idle_filler();

        if self.locate_instance(&mut task) {
            match self.backend.inspect(&task.handle) {
                Ok(state) if state.running => {
                    info!(task_id = %task_id, handle = %task.handle, "Instance already running, adopting");
                    self.mark_started(task, gpus);
                    return;
                }
                Ok(_) => {}
                Err(BackendError::NotFound(_)) => {
                    warn!(task_id = %task_id, handle = %task.handle, "Recorded instance is gone, recreating");
                    task.handle.clear();
                }
                Err(e) => {
                    self.record_failure(task, e);
                    return;
                }
            }
        }

        if !task.has_instance() {
            match self
                .backend
                .artifact_exists(&task.engine, self.config.artifact_check_timeout)
            {
                Ok(true) => {}
                Ok(false) => {
                    self.begin_pull(task);
                    return;
                }
                Err(e) => {
                    self.record_failure(task, e);
                    return;
                }
            }

            let config = InstanceConfig::for_task(&task, spec, &task.engine, gpus.clone());
            match self.backend.create(&config) {
                Ok(handle) => {
                    info!(task_id = %task_id, handle = %handle, "Instance created");
                    task.handle = handle;
                    self.commit(task.clone());
                }
                Err(e) => {
                    self.record_failure(task, e);
                    return;
                }
            }
        }

        match self.backend.start(&task.handle) {
            Ok(()) => self.mark_started(task, gpus),
            Err(e) => self.record_failure(task, e),
        }
    }

    fn exec_restart(&mut self, mut task: Task, spec: &ServerSpecification) {
        let task_id = task.task_id.clone();

        if !self.locate_instance(&mut task) {
            info!(task_id = %task_id, "No instance to restart, starting fresh");
            task.operation = TaskOperation::None;
            self.commit(task.clone());
            self.exec_start(task, spec);
            return;
        }

        // The instance keeps the devices it was created with.
        let gpus = if task.gpus.is_empty() {
            self.pool.select_for(&spec.gpus, &task_id)
        } else {
            self.pool
                .select_for(&GpuRequest::Devices(task.gpus.clone()), &task_id)
        };
        let Some(gpus) = gpus else {
            warn!(task_id = %task_id, pool = %self.pool, "Restart does not fit the pool");
            self.close_head(&task_id, TaskStatus::OutOfGpuResource);
            return;
        };

        self.stop_idle_filler();

        let stopped = match self.backend.stop(&task.handle, self.config.stop_timeout) {
            Err(e @ BackendError::NotFound(_)) => Err(e),
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Stop before restart failed, starting anyway");
                Ok(())
            }
            Ok(()) => Ok(()),
        };
        match stopped.and_then(|()| self.backend.start(&task.handle)) {
            Ok(()) => {
                info!(task_id = %task_id, "Instance restarted");
                self.mark_started(task, gpus);
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Restart failed");
                task.operation = TaskOperation::None;
                self.commit(task);
                self.close_head(&task_id, TaskStatus::Stopped);
            }
        }
    }

    /// Bind devices, move the task to the running set and persist.
    pub(super) fn mark_started(&mut self, mut task: Task, gpus: DeviceSet) {
        let now = self.clock.now_millis();
        let task_id = task.task_id.clone();

        if !self.pool.bind(&gpus, &task_id) {
            // Single owner of the pool, so a selection made this tick always binds.
            error!(task_id = %task_id, gpus = %join_ids(&gpus), "Selected devices could not be bound");
        }
        task.gpus = gpus;
        task.status = TaskStatus::Running;
        task.operation = TaskOperation::None;
        task.error_times = 0;
        task.start_time = now;
        task.end_time = 0;
        task.deadline = None;
        task.next_report_at = Some(now + self.config.report_interval.as_millis() as i64);

        self.queue.retain(|id| id != &task_id);
        self.running.insert(task_id.clone());
        info!(task_id = %task_id, gpus = %join_ids(&task.gpus), handle = %task.handle, "Task running");
        self.commit(task);
    }

    /// Count a backend failure and classify it.
    pub(super) fn record_failure(&mut self, mut task: Task, err: BackendError) {
        let task_id = task.task_id.clone();
        task.error_times += 1;
        warn!(
            task_id = %task_id,
            error_times = task.error_times,
            error = %err,
            "Backend operation failed"
        );
        self.commit(task);

        match err {
            BackendError::NoDiskSpace(_) => self.close_head(&task_id, TaskStatus::NoSpaceClosed),
            BackendError::ImageNotFound(_) => self.close_head(&task_id, TaskStatus::NoImageClosed),
            _ => {}
        }
    }

    fn begin_pull(&mut self, mut task: Task) {
        let now = self.clock.now_millis();
        if let Some((current, _)) = self.pulls.current_pull() {
            if current != task.engine {
                info!(artifact = current, task_id = %task.task_id, "Preempting artifact pull");
                self.pulls.terminate();
            }
        }

        match self.pulls.start_pull(&self.backend, &task.engine, now) {
            Ok(()) => {
                info!(task_id = %task.task_id, artifact = %task.engine, "Waiting for artifact pull");
                task.status = TaskStatus::PullingImage;
                self.commit(task);
            }
            Err(PullError::Backend(e)) => self.record_failure(task, e),
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Could not start artifact pull");
            }
        }
    }

    /// Follow the pull a head task is waiting on.
    pub(super) fn check_pull(&mut self, task_id: &str) {
        let Some(mut task) = self.tasks.get(task_id).cloned() else {
            return;
        };
        let now = self.clock.now_millis();

        let started_at = match self.pulls.current_pull() {
            Some((name, started_at)) if name == task.engine => started_at,
            _ => {
                // Nothing in flight for this task, e.g. after a restart; exec re-evaluates.
                info!(task_id, artifact = %task.engine, "No pull in flight, re-queueing");
                task.status = TaskStatus::Queueing;
                self.commit(task);
                return;
            }
        };

        if now - started_at > self.config.pull_timeout.as_millis() as i64 {
            warn!(task_id, artifact = %task.engine, "Artifact pull timed out");
            self.pulls.terminate();
            self.close_head(task_id, TaskStatus::NoImageClosed);
            return;
        }

        match self.pulls.check_state() {
            PullState::Pulling { .. } => {
                debug!(task_id, artifact = %task.engine, "Artifact still pulling");
            }
            PullState::Success { .. } | PullState::Idle => {
                match self
                    .backend
                    .artifact_exists(&task.engine, self.config.artifact_check_timeout)
                {
                    Ok(true) => {
                        info!(task_id, artifact = %task.engine, "Artifact ready");
                        task.status = TaskStatus::Queueing;
                        self.commit(task);
                    }
                    Ok(false) => {
                        warn!(task_id, artifact = %task.engine, "Artifact missing after pull");
                        self.close_head(task_id, TaskStatus::NoImageClosed);
                    }
                    Err(e) => {
                        warn!(task_id, error = %e, "Artifact check failed after pull");
                        self.close_head(task_id, TaskStatus::NoImageClosed);
                    }
                }
            }
            PullState::Error { .. } => {
                self.close_head(task_id, TaskStatus::NoImageClosed);
            }
        }
    }

    /// Terminal exit for the head task.
    pub(super) fn close_head(&mut self, task_id: &str, end_status: TaskStatus) {
        if let Err(e) = self.stop(task_id, end_status) {
            error!(task_id, status = %end_status, error = %e, "Failed to close task");
        }
    }

    /// Check every running task against its instance.
    pub fn sweep_running(&mut self) {
        let now = self.clock.now_millis();
        for task_id in self.running_ids() {
            let Some(mut task) = self.tasks.get(&task_id).cloned() else {
                continue;
            };
            let target = if task.has_instance() {
                task.handle.clone()
            } else {
                task.task_id.clone()
            };

            let state = match self.backend.inspect(&target) {
                Ok(state) => state,
                Err(BackendError::NotFound(_)) => {
                    warn!(task_id = %task_id, handle = %target, "Running task has no instance");
                    continue;
                }
                Err(e) => {
                    task.error_times += 1;
                    warn!(task_id = %task_id, error_times = task.error_times, error = %e, "Inspect failed");
                    let exceeded = task.error_times > self.config.retry_ceiling;
                    self.commit(task);
                    if exceeded {
                        self.close_running(&task_id, TaskStatus::AbnormallyClosed);
                    }
                    continue;
                }
            };

            let mut dirty = false;
            if task.handle != state.handle {
                task.handle = state.handle.clone();
                dirty = true;
            }
            if task.error_times != 0 {
                task.error_times = 0;
                dirty = true;
            }

            if state.running {
                if task.next_report_at.map_or(true, |at| now >= at) {
                    match self.reporter.report(&TaskEvent::from(&task)) {
                        Ok(ack) if !ack.accepted => {
                            warn!(task_id = %task_id, "Report rejected upstream");
                            self.commit(task);
                            self.close_running(&task_id, TaskStatus::OverdueClosed);
                            continue;
                        }
                        Ok(ack) => {
                            let interval = ack
                                .next_report_interval
                                .unwrap_or(self.config.report_interval);
                            task.next_report_at = Some(now + interval.as_millis() as i64);
                            dirty = true;
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Periodic report failed");
                        }
                    }
                }
            } else if task.status == TaskStatus::Running {
                if is_clean_exit(state.exit_code) {
                    info!(task_id = %task_id, exit_code = state.exit_code, "Workload finished");
                    self.commit(task);
                    self.close_running(&task_id, TaskStatus::SuccessfullyClosed);
                    continue;
                }
                info!(
                    task_id = %task_id,
                    exit_code = state.exit_code,
                    "Instance not running, restarting in place"
                );
                if let Err(e) = self.backend.restart(&task.handle) {
                    warn!(task_id = %task_id, error = %e, "In-place restart failed");
                    task.error_times += 1;
                }
                dirty = true;
            }

            if dirty {
                self.commit(task);
            }
        }
    }

    fn close_running(&mut self, task_id: &str, end_status: TaskStatus) {
        if let Err(e) = self.stop(task_id, end_status) {
            error!(task_id, status = %end_status, error = %e, "Failed to stop running task");
        }
    }

    /// Delete terminal tasks older than `interval_hours` or that never got an instance.
    ///
    /// Halves the interval while more than the configured ceiling of terminal tasks
    /// survive. Returns the number of tasks removed.
    pub fn prune(&mut self, interval_hours: u64) -> usize {
        let now = self.clock.now_millis();
        let max_age = interval_hours as i64 * HOUR_MS;

        let expired: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_terminal() && t.operation == TaskOperation::None)
            .filter(|t| {
                let closed_at = if t.end_time > 0 {
                    t.end_time
                } else {
                    t.received_time
                };
                !t.has_instance() || now - closed_at > max_age
            })
            .map(|t| t.task_id.clone())
            .collect();

        let mut removed = 0;
        for task_id in expired {
            let handle = self
                .tasks
                .get(&task_id)
                .map(|t| t.handle.clone())
                .unwrap_or_default();
            if !handle.is_empty() {
                if let Err(e) = self.backend.remove(&handle) {
                    debug!(task_id = %task_id, error = %e, "Best-effort instance removal failed");
                }
            }
            match self.forget(&task_id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to prune task"),
            }
        }

        let remaining = self.tasks.values().filter(|t| t.is_terminal()).count();
        info!(interval_hours, removed, remaining, "Pruned terminal tasks");

        if remaining > self.config.max_prune_count && interval_hours > 0 {
            removed += self.prune(interval_hours / 2);
        }
        removed
    }
}
