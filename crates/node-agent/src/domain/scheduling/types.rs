//! Error and value types shared by the scheduling engine

use std::collections::BTreeMap;
use std::time::Duration;

use api_types::TaskStatus;

use crate::domain::resource::DeviceSet;
use crate::domain::task::ServerSpecification;
use crate::domain::task::SpecError;
use crate::domain::task::Task;

/// Failures reported by an execution backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("instance `{0}` not found")]
    NotFound(String),
    #[error("no space left on device: {0}")]
    NoDiskSpace(String),
    #[error("artifact `{0}` not found")]
    ImageNotFound(String),
    #[error("backend call timed out: {0}")]
    Timeout(String),
    #[error("operation `{0}` is not supported by this backend")]
    Unsupported(&'static str),
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("already pulling `{current}`, cannot start `{requested}`")]
    AlreadyPulling { current: String, requested: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, thiserror::Error)]
#[error("reporter unavailable: {0}")]
pub struct ReportError(pub String);

/// Errors surfaced by scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    #[error("task capacity of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("task `{task_id}` is {status}, operation not allowed")]
    InvalidState { task_id: String, status: TaskStatus },
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error("scheduler is not running")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Run state reported by the backend for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub running: bool,
    pub exit_code: i32,
    pub handle: String,
}

/// Non-blocking view of a background pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullProgress {
    Running,
    Finished { success: bool },
}

/// Everything a backend needs to create an instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    /// Instance name, always the task id
    pub name: String,
    pub image: String,
    pub gpus: DeviceSet,
    pub env: BTreeMap<String, String>,
    pub ports: BTreeMap<String, String>,
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub cpu_shares: Option<u64>,
    pub entry_file: String,
    pub code_dir: String,
    pub data_dir: String,
    pub hyper_parameters: String,
}

impl InstanceConfig {
    pub fn for_task(
        task: &Task,
        spec: &ServerSpecification,
        image: &str,
        gpus: DeviceSet,
    ) -> Self {
        Self {
            name: task.task_id.clone(),
            image: image.to_string(),
            gpus,
            env: spec.env.clone(),
            ports: spec.ports.clone(),
            memory: spec.memory.clone(),
            memory_swap: spec.memory_swap.clone(),
            cpu_shares: spec.cpu_shares,
            entry_file: task.entry_file.clone(),
            code_dir: task.code_dir.clone(),
            data_dir: task.data_dir.clone(),
            hyper_parameters: task.hyper_parameters.clone(),
        }
    }
}

/// Event sent upstream on terminal transitions and periodic running reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_time: i64,
    pub end_time: i64,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            start_time: task.start_time,
            end_time: task.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportAck {
    pub accepted: bool,
    pub next_report_interval: Option<Duration>,
}
