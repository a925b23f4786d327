//! Capability traits the scheduling engine depends on

use std::time::Duration;

use super::types::BackendError;
use super::types::InstanceConfig;
use super::types::InstanceState;
use super::types::PullProgress;
use super::types::ReportAck;
use super::types::ReportError;
use super::types::StoreError;
use super::types::TaskEvent;
use crate::domain::task::Task;

/// Trait for getting current time
pub trait TimeSource: Send + Sync {
    /// Get current Unix timestamp in milliseconds
    fn now_millis(&self) -> i64;
}

/// Durable task records keyed by task id
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the record for `task.task_id`
    fn put(&self, task: &Task) -> Result<(), StoreError>;

    /// Load every readable record
    fn get_all(&self) -> Result<Vec<Task>, StoreError>;

    /// Remove a record; removing a missing one succeeds
    fn delete(&self, task_id: &str) -> Result<(), StoreError>;
}

/// Handle to an artifact pull running in the background
pub trait PullHandle: Send {
    /// Non-blocking check of the pull
    fn poll(&mut self) -> PullProgress;

    /// Best-effort cancellation
    fn terminate(&mut self);
}

/// Container or VM runtime that hosts task instances.
///
/// Every call is synchronous; the scheduler invokes them from its own tick.
pub trait ExecutionBackend: Send + Sync {
    /// Create an instance and return its handle
    fn create(&self, config: &InstanceConfig) -> Result<String, BackendError>;

    fn start(&self, handle: &str) -> Result<(), BackendError>;

    fn stop(&self, handle: &str, timeout: Duration) -> Result<(), BackendError>;

    fn restart(&self, handle: &str) -> Result<(), BackendError>;

    /// Hard reset without a graceful shutdown
    fn reset(&self, handle: &str) -> Result<(), BackendError>;

    fn remove(&self, handle: &str) -> Result<(), BackendError>;

    /// Query run state by handle or by instance name
    fn inspect(&self, handle_or_name: &str) -> Result<InstanceState, BackendError>;

    fn artifact_exists(&self, name: &str, timeout: Duration) -> Result<bool, BackendError>;

    /// Launch a background pull of `name`
    fn pull(&self, name: &str) -> Result<Box<dyn PullHandle>, BackendError>;

    /// Snapshot a running instance into a new artifact
    fn commit(&self, handle: &str, artifact: &str) -> Result<(), BackendError>;

    fn remove_artifact(&self, name: &str) -> Result<(), BackendError>;
}

/// Upstream billing/status reporter
pub trait TaskReporter: Send + Sync {
    fn report(&self, event: &TaskEvent) -> Result<ReportAck, ReportError>;
}

impl<B: ExecutionBackend + ?Sized> ExecutionBackend for Box<B> {
    fn create(&self, config: &InstanceConfig) -> Result<String, BackendError> {
        (**self).create(config)
    }

    fn start(&self, handle: &str) -> Result<(), BackendError> {
        (**self).start(handle)
    }

    fn stop(&self, handle: &str, timeout: Duration) -> Result<(), BackendError> {
        (**self).stop(handle, timeout)
    }

    fn restart(&self, handle: &str) -> Result<(), BackendError> {
        (**self).restart(handle)
    }

    fn reset(&self, handle: &str) -> Result<(), BackendError> {
        (**self).reset(handle)
    }

    fn remove(&self, handle: &str) -> Result<(), BackendError> {
        (**self).remove(handle)
    }

    fn inspect(&self, handle_or_name: &str) -> Result<InstanceState, BackendError> {
        (**self).inspect(handle_or_name)
    }

    fn artifact_exists(&self, name: &str, timeout: Duration) -> Result<bool, BackendError> {
        (**self).artifact_exists(name, timeout)
    }

    fn pull(&self, name: &str) -> Result<Box<dyn PullHandle>, BackendError> {
        (**self).pull(name)
    }

    fn commit(&self, handle: &str, artifact: &str) -> Result<(), BackendError> {
        (**self).commit(handle, artifact)
    }

    fn remove_artifact(&self, name: &str) -> Result<(), BackendError> {
        (**self).remove_artifact(name)
    }
}
