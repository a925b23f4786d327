//! Shared API type definitions
//!
//! This crate contains the request and response shapes exchanged between the node agent's
//! HTTP surface and its clients, together with the task status vocabulary both sides use.

use serde::Deserialize;
use serde::Serialize;

/// Lifecycle status of a task.
///
/// The numeric codes are the persisted representation; every status from
/// [`TaskStatus::Stopped`] upward is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Unknown,
    Queueing,
    PullingImage,
    Running,
    UpdateError,
    CreatingImage,
    Stopped,
    SuccessfullyClosed,
    AbnormallyClosed,
    OverdueClosed,
    NoImageClosed,
    NoSpaceClosed,
    OutOfGpuResource,
}

impl TaskStatus {
    pub const fn code(self) -> u32 {
        match self {
            TaskStatus::Unknown => 1,
            TaskStatus::Queueing => 2,
            TaskStatus::PullingImage => 3,
            TaskStatus::Running => 4,
            TaskStatus::UpdateError => 5,
            TaskStatus::CreatingImage => 6,
            TaskStatus::Stopped => 8,
            TaskStatus::SuccessfullyClosed => 16,
            TaskStatus::AbnormallyClosed => 32,
            TaskStatus::OverdueClosed => 64,
            TaskStatus::NoImageClosed => 65,
            TaskStatus::NoSpaceClosed => 66,
            TaskStatus::OutOfGpuResource => 67,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => TaskStatus::Unknown,
            2 => TaskStatus::Queueing,
            3 => TaskStatus::PullingImage,
            4 => TaskStatus::Running,
            5 => TaskStatus::UpdateError,
            6 => TaskStatus::CreatingImage,
            8 => TaskStatus::Stopped,
            16 => TaskStatus::SuccessfullyClosed,
            32 => TaskStatus::AbnormallyClosed,
            64 => TaskStatus::OverdueClosed,
            65 => TaskStatus::NoImageClosed,
            66 => TaskStatus::NoSpaceClosed,
            67 => TaskStatus::OutOfGpuResource,
            _ => return None,
        })
    }

    /// No automatic transition leaves a terminal status.
    pub const fn is_terminal(self) -> bool {
        self.code() >= TaskStatus::Stopped.code()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Unknown => "unknown",
            TaskStatus::Queueing => "queueing",
            TaskStatus::PullingImage => "pulling_image",
            TaskStatus::Running => "running",
            TaskStatus::UpdateError => "update_error",
            TaskStatus::CreatingImage => "creating_image",
            TaskStatus::Stopped => "stopped",
            TaskStatus::SuccessfullyClosed => "successfully_closed",
            TaskStatus::AbnormallyClosed => "abnormally_closed",
            TaskStatus::OverdueClosed => "overdue_closed",
            TaskStatus::NoImageClosed => "noimage_closed",
            TaskStatus::NoSpaceClosed => "nospace_closed",
            TaskStatus::OutOfGpuResource => "out_of_gpu_resource",
        };
        f.write_str(name)
    }
}

/// Request body for admitting a new task
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CreateTaskRequest {
    /// Caller-assigned unique identifier
    pub task_id: String,
    /// Image or engine artifact reference
    pub engine: String,
    #[serde(default)]
    pub entry_file: String,
    #[serde(default)]
    pub code_dir: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub hyper_parameters: String,
    /// Free-form JSON carrying GPU, memory, port and update directives
    #[serde(default)]
    pub server_specification: String,
}

/// Request body for stopping a task
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StopTaskRequest {
    /// Terminal status to record; defaults to `stopped`
    #[serde(default)]
    pub end_status: Option<TaskStatus>,
}

/// Request body for updating a running task in place
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateTaskRequest {
    /// Replacement specification carrying the `operation` directive
    pub server_specification: String,
}

/// Task record as exposed over the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub engine: String,
    pub status: TaskStatus,
    /// Container id or VM domain name, empty until created
    pub handle: String,
    /// GPU ids bound to the task
    pub gpus: Vec<u32>,
    pub error_times: u32,
    /// Unix milliseconds
    pub received_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

/// Live status of a single task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusInfo {
    pub task_id: String,
    pub status: TaskStatus,
    /// Whether the backend instance is running right now
    pub instance_running: bool,
    pub handle: String,
}

/// State of one GPU in the pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuState {
    pub id: u32,
    pub model: String,
    /// Owning task, `None` when free
    pub task_id: Option<String>,
}

/// Snapshot of the GPU pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuPoolInfo {
    pub total: usize,
    pub free: usize,
    pub gpus: Vec<GpuState>,
}

/// Generic response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}
