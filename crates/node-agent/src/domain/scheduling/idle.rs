//! Low-priority workload that fills the node while no user task exists.

use std::time::Duration;

use api_types::CreateTaskRequest;
use api_types::TaskStatus;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::pull::PullManager;
use super::pull::PullState;
use super::traits::ExecutionBackend;
use super::traits::TaskStore;
use super::types::InstanceConfig;
use super::types::StoreError;
use crate::domain::resource::DeviceSet;
use crate::domain::resource::GpuRequest;
use crate::domain::task::Task;

pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(3 * 60);

/// Holds at most one idle task definition in its own store.
///
/// The filler never touches the GPU pool. User tasks evict it through [`IdleTaskFiller::stop`]
/// before they claim backend capacity.
pub struct IdleTaskFiller<S: TaskStore> {
    store: S,
    task: Option<Task>,
    threshold: Duration,
    idle_since: Option<i64>,
}

impl<S: TaskStore> IdleTaskFiller<S> {
    pub fn new(store: S, threshold: Duration) -> Self {
        Self {
            store,
            task: None,
            threshold,
            idle_since: None,
        }
    }

    /// Restore the persisted definition; the newest record wins.
    pub fn load(&mut self) -> Result<Option<&Task>, StoreError> {
        let mut records = self.store.get_all()?;
        records.sort_by_key(|t| t.received_time);
        let newest = records.pop();
        for stale in records {
            self.store.delete(&stale.task_id)?;
        }
        let Some(mut task) = newest else {
            self.task = None;
            return Ok(None);
        };
        info!(task_id = %task.task_id, engine = %task.engine, "Idle task loaded");
        // A filler that was up before a restart is relaunched after the next idle window.
        if matches!(task.status, TaskStatus::Running | TaskStatus::PullingImage) {
            task.status = TaskStatus::Stopped;
            self.store.put(&task)?;
        }
        self.task = Some(task);
        Ok(self.task.as_ref())
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|t| t.status == TaskStatus::Running)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Reset the idle timer; called on every tick that sees user work.
    pub fn touch(&mut self) {
        self.idle_since = None;
    }

    /// Replace or clear the idle task definition, evicting the current filler first.
    pub fn set_task<B>(
        &mut self,
        request: Option<CreateTaskRequest>,
        backend: &B,
        pulls: &mut PullManager,
        stop_timeout: Duration,
        now_ms: i64,
    ) -> Result<(), StoreError>
    where
        B: ExecutionBackend + ?Sized,
    {
        self.stop(backend, pulls, stop_timeout);
        if let Some(old) = self.task.take() {
            if old.has_instance() {
                if let Err(e) = backend.remove(&old.handle) {
                    debug!(task_id = %old.task_id, error = %e, "Removing idle instance failed");
                }
            }
            self.store.delete(&old.task_id)?;
            info!(task_id = %old.task_id, "Idle task cleared");
        }

        if let Some(request) = request {
            let task = Task::from_request(request, now_ms);
            self.store.put(&task)?;
            info!(task_id = %task.task_id, engine = %task.engine, "Idle task set");
            self.task = Some(task);
        }
        Ok(())
    }

    /// Tick while the node has no user task.
    pub fn exec<B>(&mut self, backend: &B, pulls: &mut PullManager, now_ms: i64)
    where
        B: ExecutionBackend + ?Sized,
    {
        let Some(task) = self.task.as_ref() else {
            return;
        };
        if task.status == TaskStatus::Running {
            return;
        }
        let Some(since) = self.idle_since else {
            debug!("Node idle, starting idle timer");
            self.idle_since = Some(now_ms);
            return;
        };
        if now_ms - since <= self.threshold.as_millis() as i64 {
            return;
        }

        if let Err(e) = self.launch(backend, pulls, now_ms) {
            warn!(error = %e, "Idle task launch failed, backing off");
            self.idle_since = Some(now_ms);
        }
    }

    fn launch<B>(
        &mut self,
        backend: &B,
        pulls: &mut PullManager,
        now_ms: i64,
    ) -> Result<(), LaunchError>
    where
        B: ExecutionBackend + ?Sized,
    {
        let Some(mut task) = self.task.clone() else {
            return Ok(());
        };

        if !task.has_instance() {
            if pulls.is_pulling(&task.engine) {
                match pulls.check_state() {
                    PullState::Pulling { .. } => return Ok(()),
                    PullState::Error { name } => return Err(LaunchError::Pull(name)),
                    PullState::Success { .. } | PullState::Idle => {}
                }
            }

            if !backend.artifact_exists(&task.engine, Duration::from_secs(30))? {
                if pulls.current_pull().is_none() {
                    pulls
                        .start_pull(backend, &task.engine, now_ms)
                        .map_err(|e| LaunchError::Pull(e.to_string()))?;
                    task.status = TaskStatus::PullingImage;
                    self.persist(task)?;
                }
                return Ok(());
            }

            let spec = task.spec().map_err(|e| LaunchError::Spec(e.to_string()))?;
            let gpus = match &spec.gpus {
                GpuRequest::Devices(ids) => ids.clone(),
                _ => DeviceSet::new(),
            };
            let config = InstanceConfig::for_task(&task, &spec, &task.engine, gpus);
            task.handle = backend.create(&config)?;
            task.gpus = config.gpus;
        }

        backend.start(&task.handle)?;
        info!(task_id = %task.task_id, handle = %task.handle, "Idle task started");
        task.status = TaskStatus::Running;
        task.start_time = now_ms;
        self.persist(task)?;
        Ok(())
    }

    /// Evict the filler: reset the timer, stop its instance and cancel its pull.
    pub fn stop<B>(&mut self, backend: &B, pulls: &mut PullManager, timeout: Duration)
    where
        B: ExecutionBackend + ?Sized,
    {
        self.idle_since = None;
        let Some(mut task) = self.task.clone() else {
            return;
        };

        let mut changed = false;
        if pulls.is_pulling(&task.engine) {
            pulls.terminate();
            task.status = TaskStatus::Queueing;
            changed = true;
        }
        if task.status == TaskStatus::Running {
            if task.has_instance() {
                if let Err(e) = backend.stop(&task.handle, timeout) {
                    warn!(task_id = %task.task_id, error = %e, "Stopping idle task failed");
                }
            }
            info!(task_id = %task.task_id, "Idle task evicted");
            task.status = TaskStatus::Stopped;
            changed = true;
        }

        if changed {
            if let Err(e) = self.persist(task) {
                warn!(error = %e, "Failed to persist idle task");
            }
        }
    }

    fn persist(&mut self, task: Task) -> Result<(), StoreError> {
        let result = self.store.put(&task);
        self.task = Some(task);
        result
    }
}

#[derive(Debug, thiserror::Error)]
enum LaunchError {
    #[error(transparent)]
    Backend(#[from] super::types::BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pull of {0} failed")]
    Pull(String),
    #[error("invalid server specification: {0}")]
    Spec(String),
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::scheduling::mock::MemoryTaskStore;
    use crate::domain::scheduling::mock::MockBackend;

    const T0: i64 = 1_700_000_000_000;
    const MINUTE: i64 = 60_000;

    fn request(engine: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            task_id: "idle-miner".to_string(),
            engine: engine.to_string(),
            ..Default::default()
        }
    }

    fn filler_with(
        backend: &MockBackend,
        pulls: &mut PullManager,
        engine: &str,
    ) -> (IdleTaskFiller<MemoryTaskStore>, MemoryTaskStore) {
        let store = MemoryTaskStore::new();
        let mut filler = IdleTaskFiller::new(store.clone(), DEFAULT_IDLE_THRESHOLD);
        filler
            .set_task(Some(request(engine)), backend, pulls, Duration::from_secs(1), T0)
            .unwrap();
        (filler, store)
    }

    #[test]
    fn starts_only_after_threshold() {
        let backend = MockBackend::with_artifacts(&["miner:1"]);
        let mut pulls = PullManager::new();
        let (mut filler, store) = filler_with(&backend, &mut pulls, "miner:1");

        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 2 * MINUTE);
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE);
        assert!(!filler.is_running());
        assert_eq!(backend.instance_count(), 0);

        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 1);
        assert!(filler.is_running());
        assert_eq!(backend.instance_count(), 1);
        assert_eq!(
            store.get("idle-miner").map(|t| t.status),
            Some(TaskStatus::Running)
        );
    }

    #[test]
    fn touch_restarts_the_timer() {
        let backend = MockBackend::with_artifacts(&["miner:1"]);
        let mut pulls = PullManager::new();
        let (mut filler, _) = filler_with(&backend, &mut pulls, "miner:1");

        filler.exec(&backend, &mut pulls, T0);
        filler.touch();
        filler.exec(&backend, &mut pulls, T0 + 4 * MINUTE);
        assert!(!filler.is_running());
        filler.exec(&backend, &mut pulls, T0 + 6 * MINUTE);
        assert!(!filler.is_running());
        filler.exec(&backend, &mut pulls, T0 + 7 * MINUTE + 1);
        assert!(filler.is_running());
    }

    #[test]
    fn pulls_missing_artifact_before_starting() {
        let backend = MockBackend::new();
        backend.set_pull_polls("miner:2", 1, true);
        let mut pulls = PullManager::new();
        let (mut filler, _) = filler_with(&backend, &mut pulls, "miner:2");

        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 1);
        assert_eq!(backend.pull_requests(), vec!["miner:2".to_string()]);
        assert_eq!(
            filler.task().map(|t| t.status),
            Some(TaskStatus::PullingImage)
        );

        // first poll still running, second finishes
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 2);
        assert!(!filler.is_running());
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 3);
        assert!(filler.is_running());
        assert_eq!(backend.pull_requests().len(), 1);
    }

    #[test]
    fn stop_evicts_running_filler_and_resets_timer() {
        let backend = MockBackend::with_artifacts(&["miner:1"]);
        let mut pulls = PullManager::new();
        let (mut filler, _) = filler_with(&backend, &mut pulls, "miner:1");

        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 1);
        let handle = filler.task().map(|t| t.handle.clone()).unwrap();
        assert!(backend.instance(&handle).unwrap().running);

        filler.stop(&backend, &mut pulls, Duration::from_secs(1));
        assert!(!filler.is_running());
        assert!(!backend.instance(&handle).unwrap().running);

        // timer starts over, then the existing instance is reused
        filler.exec(&backend, &mut pulls, T0 + 4 * MINUTE);
        assert!(!filler.is_running());
        filler.exec(&backend, &mut pulls, T0 + 7 * MINUTE + 1);
        assert!(filler.is_running());
        assert_eq!(backend.instance_count(), 1);
    }

    #[test]
    fn stop_cancels_filler_pull() {
        let backend = MockBackend::new();
        backend.set_pull_polls("miner:3", 10, true);
        let mut pulls = PullManager::new();
        let (mut filler, _) = filler_with(&backend, &mut pulls, "miner:3");

        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 1);
        assert!(pulls.is_pulling("miner:3"));

        filler.stop(&backend, &mut pulls, Duration::from_secs(1));
        assert!(pulls.current_pull().is_none());
        assert_eq!(backend.terminated_pulls(), vec!["miner:3".to_string()]);
    }

    #[test]
    fn clearing_removes_definition_and_instance() {
        let backend = MockBackend::with_artifacts(&["miner:1"]);
        let mut pulls = PullManager::new();
        let (mut filler, store) = filler_with(&backend, &mut pulls, "miner:1");
        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 3 * MINUTE + 1);

        filler
            .set_task(None, &backend, &mut pulls, Duration::from_secs(1), T0)
            .unwrap();
        assert!(filler.task().is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(backend.instance_count(), 0);
    }

    #[test]
    fn load_keeps_newest_record() {
        let store = MemoryTaskStore::new();
        let mut older = Task::from_request(request("miner:1"), T0);
        older.task_id = "old".to_string();
        let newer = Task::from_request(request("miner:2"), T0 + 1);
        store.put(&older).unwrap();
        store.put(&newer).unwrap();

        let mut filler = IdleTaskFiller::new(store.clone(), DEFAULT_IDLE_THRESHOLD);
        let loaded = filler.load().unwrap().map(|t| t.engine.clone());
        assert_eq!(loaded.as_deref(), Some("miner:2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn filler_running_before_restart_is_relaunched() {
        let backend = MockBackend::with_artifacts(&["miner:1"]);
        let handle = backend.insert_instance("idle-miner", "miner:1", false);
        let store = MemoryTaskStore::new();
        let mut task = Task::from_request(request("miner:1"), T0);
        task.status = TaskStatus::Running;
        task.handle = handle.clone();
        store.put(&task).unwrap();

        let mut filler = IdleTaskFiller::new(store.clone(), DEFAULT_IDLE_THRESHOLD);
        filler.load().unwrap();
        assert!(!filler.is_running());
        assert_eq!(
            store.get("idle-miner").map(|t| t.status),
            Some(TaskStatus::Stopped)
        );

        let mut pulls = PullManager::new();
        filler.exec(&backend, &mut pulls, T0);
        filler.exec(&backend, &mut pulls, T0 + 10 * MINUTE);
        assert!(filler.is_running());
        assert!(backend.instance(&handle).unwrap().running);
        assert_eq!(backend.instance_count(), 1);
    }
}
