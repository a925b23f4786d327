use api_types::CreateTaskRequest;
use api_types::TaskInfo;
use api_types::TaskStatus;
use serde::Deserialize;
use serde::Serialize;

use super::spec::ServerSpecification;
use super::spec::SpecError;
use crate::domain::resource::DeviceSet;

/// Pending imperative recorded before the scheduler acts on it, so a crash mid-action can
/// be re-driven after reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOperation {
    #[default]
    None,
    Create,
    Start,
    Stop {
        end_status: TaskStatus,
    },
    Restart,
    Reset,
    Delete,
}

/// One schedulable unit of work, persisted verbatim in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Image or artifact the workload runs from
    pub engine: String,
    #[serde(default)]
    pub entry_file: String,
    #[serde(default)]
    pub code_dir: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub hyper_parameters: String,
    #[serde(default)]
    pub server_specification: String,
    /// Container id or VM domain name; empty until the instance exists
    #[serde(default)]
    pub handle: String,
    #[serde(with = "status_code")]
    pub status: TaskStatus,
    #[serde(default)]
    pub operation: TaskOperation,
    #[serde(default)]
    pub error_times: u32,
    /// Unix milliseconds
    pub received_time: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    /// Devices actually bound, as opposed to what the specification asks for
    #[serde(default)]
    pub gpus: DeviceSet,
    /// Wall-clock bound for a tick-resumable step such as an update commit
    #[serde(default)]
    pub deadline: Option<i64>,
    /// Artifact committed from the running instance during an update
    #[serde(default)]
    pub update_artifact: Option<String>,
    #[serde(default)]
    pub next_report_at: Option<i64>,
}

impl Task {
    pub fn from_request(request: CreateTaskRequest, now_ms: i64) -> Self {
        Self {
            task_id: request.task_id,
            engine: request.engine,
            entry_file: request.entry_file,
            code_dir: request.code_dir,
            data_dir: request.data_dir,
            hyper_parameters: request.hyper_parameters,
            server_specification: request.server_specification,
            handle: String::new(),
            status: TaskStatus::Queueing,
            operation: TaskOperation::Create,
            error_times: 0,
            received_time: now_ms,
            start_time: 0,
            end_time: 0,
            gpus: DeviceSet::new(),
            deadline: None,
            update_artifact: None,
            next_report_at: None,
        }
    }

    pub fn spec(&self) -> Result<ServerSpecification, SpecError> {
        ServerSpecification::parse(&self.server_specification)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_instance(&self) -> bool {
        !self.handle.is_empty()
    }

    /// Records a terminal status together with its end time.
    pub fn close(&mut self, end_status: TaskStatus, now_ms: i64) {
        self.status = end_status;
        self.end_time = now_ms;
        self.deadline = None;
        self.next_report_at = None;
    }

    pub fn to_info(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.task_id.clone(),
            engine: self.engine.clone(),
            status: self.status,
            handle: self.handle.clone(),
            gpus: self.gpus.iter().copied().collect(),
            error_times: self.error_times,
            received_time: self.received_time,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Statuses are persisted by their numeric code.
mod status_code {
    use api_types::TaskStatus;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(status: &TaskStatus, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(status.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TaskStatus, D::Error> {
        let code = u32::deserialize(deserializer)?;
        TaskStatus::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown task status code {code}")))
    }
}
