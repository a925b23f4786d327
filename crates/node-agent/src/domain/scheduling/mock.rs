//! Test adapters implementing the scheduling capability traits
//!
//! Every adapter is a cheap `Clone` over shared state so a test can keep one handle while
//! the scheduler owns another.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use super::traits::ExecutionBackend;
use super::traits::PullHandle;
use super::traits::TaskReporter;
use super::traits::TaskStore;
use super::traits::TimeSource;
use super::types::BackendError;
use super::types::InstanceConfig;
use super::types::InstanceState;
use super::types::PullProgress;
use super::types::ReportAck;
use super::types::ReportError;
use super::types::StoreError;
use super::types::TaskEvent;
use crate::domain::task::Task;

/// Mock time source for testing
#[derive(Clone)]
pub struct MockTime {
    current_time: Arc<Mutex<i64>>,
}

impl MockTime {
    pub fn new(initial_millis: i64) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(initial_millis)),
        }
    }

    /// Advance time by the given duration
    pub fn advance(&self, by: Duration) {
        let mut time = self.current_time.lock().unwrap();
        *time += by.as_millis() as i64;
    }

    pub fn set_millis(&self, millis: i64) {
        *self.current_time.lock().unwrap() = millis;
    }
}

impl Default for MockTime {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl TimeSource for MockTime {
    fn now_millis(&self) -> i64 {
        *self.current_time.lock().unwrap()
    }
}

/// Failure flavours a test can inject into [`MockBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    NoDiskSpace,
    ImageNotFound,
    Timeout,
    Command,
}

impl Failure {
    fn to_error(self, op: &str, target: &str) -> BackendError {
        match self {
            Failure::NotFound => BackendError::NotFound(target.to_string()),
            Failure::NoDiskSpace => BackendError::NoDiskSpace(target.to_string()),
            Failure::ImageNotFound => BackendError::ImageNotFound(target.to_string()),
            Failure::Timeout => BackendError::Timeout(format!("{op} {target}")),
            Failure::Command => BackendError::CommandFailed {
                command: op.to_string(),
                message: "injected failure".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockInstance {
    pub name: String,
    pub image: String,
    pub gpus: BTreeSet<u32>,
    pub running: bool,
    pub exit_code: i32,
}

#[derive(Default)]
struct BackendState {
    instances: BTreeMap<String, MockInstance>,
    artifacts: HashSet<String>,
    next_handle: u32,
    always_fail: HashMap<String, Failure>,
    fail_times: HashMap<String, (u32, Failure)>,
    pull_plans: HashMap<String, (u32, bool)>,
    pull_requests: Vec<String>,
    terminated_pulls: Vec<String>,
    commit_delay: u32,
    pending_artifacts: HashMap<String, u32>,
    calls: Vec<String>,
}

impl BackendState {
    fn injected(&mut self, op: &str, target: &str) -> Result<(), BackendError> {
        self.calls.push(format!("{op}:{target}"));
        if let Some(failure) = self.always_fail.get(op) {
            return Err(failure.to_error(op, target));
        }
        if let Some((remaining, failure)) = self.fail_times.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(failure.to_error(op, target));
            }
        }
        Ok(())
    }

    fn instance_mut(&mut self, handle: &str) -> Result<&mut MockInstance, BackendError> {
        self.instances
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))
    }
}

/// In-memory execution backend
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifacts(names: &[&str]) -> Self {
        let backend = Self::new();
        for name in names {
            backend.add_artifact(name);
        }
        backend
    }

    pub fn add_artifact(&self, name: &str) {
        self.state.lock().unwrap().artifacts.insert(name.to_string());
    }

    pub fn artifact_present(&self, name: &str) -> bool {
        self.state.lock().unwrap().artifacts.contains(name)
    }

    /// Make every call of `op` fail
    pub fn fail_always(&self, op: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .always_fail
            .insert(op.to_string(), failure);
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_times(&self, op: &str, times: u32, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .fail_times
            .insert(op.to_string(), (times, failure));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.always_fail.clear();
        state.fail_times.clear();
    }

    /// A pull of `name` reports running for `polls` polls, then finishes
    pub fn set_pull_polls(&self, name: &str, polls: u32, success: bool) {
        self.state
            .lock()
            .unwrap()
            .pull_plans
            .insert(name.to_string(), (polls, success));
    }

    /// Committed artifacts stay invisible for this many existence checks
    pub fn set_commit_delay(&self, checks: u32) {
        self.state.lock().unwrap().commit_delay = checks;
    }

    pub fn pull_requests(&self) -> Vec<String> {
        self.state.lock().unwrap().pull_requests.clone()
    }

    pub fn terminated_pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().terminated_pulls.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn instance(&self, handle: &str) -> Option<MockInstance> {
        self.state.lock().unwrap().instances.get(handle).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    /// Places an instance as if it had been created earlier; returns its handle
    pub fn insert_instance(&self, name: &str, image: &str, running: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = format!("h{}", state.next_handle);
        state.instances.insert(
            handle.clone(),
            MockInstance {
                name: name.to_string(),
                image: image.to_string(),
                gpus: BTreeSet::new(),
                running,
                exit_code: 0,
            },
        );
        handle
    }

    /// Simulates the workload exiting on its own
    pub fn exit_instance(&self, handle: &str, exit_code: i32) {
        if let Some(instance) = self.state.lock().unwrap().instances.get_mut(handle) {
            instance.running = false;
            instance.exit_code = exit_code;
        }
    }

    /// Simulates the instance vanishing behind the agent's back
    pub fn drop_instance(&self, handle: &str) {
        self.state.lock().unwrap().instances.remove(handle);
    }
}

impl ExecutionBackend for MockBackend {
    fn create(&self, config: &InstanceConfig) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("create", &config.name)?;
        if !state.artifacts.contains(&config.image) {
            return Err(BackendError::ImageNotFound(config.image.clone()));
        }
        state.next_handle += 1;
        let handle = format!("h{}", state.next_handle);
        state.instances.insert(
            handle.clone(),
            MockInstance {
                name: config.name.clone(),
                image: config.image.clone(),
                gpus: config.gpus.clone(),
                running: false,
                exit_code: 0,
            },
        );
        Ok(handle)
    }

    fn start(&self, handle: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("start", handle)?;
        state.instance_mut(handle)?.running = true;
        Ok(())
    }

    fn stop(&self, handle: &str, _timeout: Duration) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("stop", handle)?;
        state.instance_mut(handle)?.running = false;
        Ok(())
    }

    fn restart(&self, handle: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("restart", handle)?;
        let instance = state.instance_mut(handle)?;
        instance.running = true;
        instance.exit_code = 0;
        Ok(())
    }

    fn reset(&self, handle: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("reset", handle)?;
        state.instance_mut(handle)?.running = true;
        Ok(())
    }

    fn remove(&self, handle: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("remove", handle)?;
        state
            .instances
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))
    }

    fn inspect(&self, handle_or_name: &str) -> Result<InstanceState, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("inspect", handle_or_name)?;
        state
            .instances
            .iter()
            .find(|(handle, instance)| {
                handle.as_str() == handle_or_name || instance.name == handle_or_name
            })
            .map(|(handle, instance)| InstanceState {
                running: instance.running,
                exit_code: instance.exit_code,
                handle: handle.clone(),
            })
            .ok_or_else(|| BackendError::NotFound(handle_or_name.to_string()))
    }

    fn artifact_exists(&self, name: &str, _timeout: Duration) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("artifact_exists", name)?;
        if let Some(remaining) = state.pending_artifacts.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
            state.pending_artifacts.remove(name);
            state.artifacts.insert(name.to_string());
        }
        Ok(state.artifacts.contains(name))
    }

    fn pull(&self, name: &str) -> Result<Box<dyn PullHandle>, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("pull", name)?;
        state.pull_requests.push(name.to_string());
        let (polls, success) = state.pull_plans.get(name).copied().unwrap_or((0, true));
        Ok(Box::new(MockPull {
            state: self.state.clone(),
            name: name.to_string(),
            remaining: polls,
            success,
        }))
    }

    fn commit(&self, handle: &str, artifact: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("commit", handle)?;
        state.instance_mut(handle)?;
        let delay = state.commit_delay;
        if delay == 0 {
            state.artifacts.insert(artifact.to_string());
        } else {
            state.pending_artifacts.insert(artifact.to_string(), delay);
        }
        Ok(())
    }

    fn remove_artifact(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.injected("remove_artifact", name)?;
        state.artifacts.remove(name);
        Ok(())
    }
}

struct MockPull {
    state: Arc<Mutex<BackendState>>,
    name: String,
    remaining: u32,
    success: bool,
}

impl PullHandle for MockPull {
    fn poll(&mut self) -> PullProgress {
        if self.remaining > 0 {
            self.remaining -= 1;
            return PullProgress::Running;
        }
        if self.success {
            self.state
                .lock()
                .unwrap()
                .artifacts
                .insert(self.name.clone());
        }
        PullProgress::Finished {
            success: self.success,
        }
    }

    fn terminate(&mut self) {
        self.state
            .lock()
            .unwrap()
            .terminated_pulls
            .push(self.name.clone());
    }
}

/// In-memory task store
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<BTreeMap<String, Task>>>,
    writes: Arc<Mutex<u64>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn writes(&self) -> u64 {
        *self.writes.lock().unwrap()
    }
}

impl TaskStore for MemoryTaskStore {
    fn put(&self, task: &Task) -> Result<(), StoreError> {
        *self.writes.lock().unwrap() += 1;
        self.tasks
            .lock()
            .unwrap()
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }

    fn delete(&self, task_id: &str) -> Result<(), StoreError> {
        self.tasks.lock().unwrap().remove(task_id);
        Ok(())
    }
}

/// Reporter that records every event and rejects chosen tasks
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<TaskEvent>>>,
    rejected: Arc<Mutex<HashSet<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect()
    }

    pub fn reject(&self, task_id: &str) {
        self.rejected.lock().unwrap().insert(task_id.to_string());
    }
}

impl TaskReporter for RecordingReporter {
    fn report(&self, event: &TaskEvent) -> Result<ReportAck, ReportError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(ReportAck {
            accepted: !self.rejected.lock().unwrap().contains(&event.task_id),
            next_report_interval: None,
        })
    }
}
