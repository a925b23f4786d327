use api_types::ApiResponse;
use api_types::CreateTaskRequest;
use api_types::GpuPoolInfo;
use api_types::StopTaskRequest;
use api_types::TaskInfo;
use api_types::TaskStatus;
use api_types::TaskStatusInfo;
use api_types::UpdateTaskRequest;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use tracing::info;
use tracing::warn;

use crate::domain::scheduling::SchedulerError;
use crate::domain::scheduling::SchedulerHandle;

type Reply<T> = poem::Result<Json<ApiResponse<T>>>;

/// Turns a scheduler result into the response envelope.
///
/// Domain failures are reported in-band with `success: false`; only a scheduler that is
/// gone surfaces as an HTTP error.
fn respond<T>(result: Result<T, SchedulerError>, message: impl Into<String>) -> Reply<T> {
    match result {
        Ok(data) => Ok(Json(ApiResponse::ok(data, message))),
        Err(SchedulerError::Unavailable) => Err(poem::Error::from_string(
            "scheduler is not running",
            StatusCode::SERVICE_UNAVAILABLE,
        )),
        Err(e) => {
            warn!(error = %e, "Request rejected");
            Ok(Json(ApiResponse::failed(e.to_string())))
        }
    }
}

#[handler]
pub async fn create_task(
    Json(request): Json<CreateTaskRequest>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<TaskInfo> {
    let task_id = request.task_id.clone();
    info!(task_id = %task_id, engine = %request.engine, "Task submitted");
    respond(
        scheduler.enqueue(request).await,
        format!("Task {task_id} queued"),
    )
}

#[handler]
pub async fn list_tasks(scheduler: Data<&SchedulerHandle>) -> Reply<Vec<TaskInfo>> {
    let result = scheduler.list_all().await;
    let message = match &result {
        Ok(tasks) => format!("{} tasks", tasks.len()),
        Err(_) => String::new(),
    };
    respond(result, message)
}

#[handler]
pub async fn get_task(
    Path(task_id): Path<String>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<TaskInfo> {
    match scheduler.find(&task_id).await {
        Ok(Some(task)) => respond(Ok(task), format!("Task {task_id} found")),
        Ok(None) => respond(Err(SchedulerError::TaskNotFound(task_id)), ""),
        Err(e) => respond(Err(e), ""),
    }
}

#[handler]
pub async fn get_task_status(
    Path(task_id): Path<String>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<TaskStatusInfo> {
    respond(
        scheduler.get_status(&task_id).await,
        format!("Status of task {task_id}"),
    )
}

#[handler]
pub async fn stop_task(
    Path(task_id): Path<String>,
    body: Option<Json<StopTaskRequest>>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    let end_status = body
        .and_then(|Json(body)| body.end_status)
        .unwrap_or(TaskStatus::Stopped);
    if !end_status.is_terminal() {
        return Ok(Json(ApiResponse::failed(format!(
            "{end_status} is not a terminal status"
        ))));
    }
    respond(
        scheduler.stop(&task_id, end_status).await,
        format!("Task {task_id} stopped"),
    )
}

#[handler]
pub async fn restart_task(
    Path(task_id): Path<String>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    respond(
        scheduler.restart(&task_id).await,
        format!("Task {task_id} restarting"),
    )
}

#[handler]
pub async fn reset_task(
    Path(task_id): Path<String>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    respond(
        scheduler.reset(&task_id).await,
        format!("Task {task_id} reset"),
    )
}

#[handler]
pub async fn update_task(
    Path(task_id): Path<String>,
    Json(request): Json<UpdateTaskRequest>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    respond(
        scheduler
            .update(&task_id, request.server_specification)
            .await,
        format!("Task {task_id} update queued"),
    )
}

#[handler]
pub async fn delete_task(
    Path(task_id): Path<String>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    respond(
        scheduler.delete(&task_id).await,
        format!("Task {task_id} deleted"),
    )
}

#[handler]
pub async fn get_gpus(scheduler: Data<&SchedulerHandle>) -> Reply<GpuPoolInfo> {
    respond(scheduler.pool_state().await, "GPU pool")
}

#[handler]
pub async fn get_idle_task(scheduler: Data<&SchedulerHandle>) -> Reply<Option<TaskInfo>> {
    respond(scheduler.idle_task().await, "Idle task")
}

#[handler]
pub async fn put_idle_task(
    Json(request): Json<CreateTaskRequest>,
    scheduler: Data<&SchedulerHandle>,
) -> Reply<()> {
    let task_id = request.task_id.clone();
    respond(
        scheduler.set_idle_task(Some(request)).await,
        format!("Idle task set to {task_id}"),
    )
}

#[handler]
pub async fn delete_idle_task(scheduler: Data<&SchedulerHandle>) -> Reply<()> {
    respond(scheduler.set_idle_task(None).await, "Idle task cleared")
}
