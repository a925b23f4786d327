use error_stack::Report;
use poem::get;
use poem::listener::Acceptor;
use poem::listener::Listener;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::create_task;
use super::handlers::delete_idle_task;
use super::handlers::delete_task;
use super::handlers::get_gpus;
use super::handlers::get_idle_task;
use super::handlers::get_task;
use super::handlers::get_task_status;
use super::handlers::list_tasks;
use super::handlers::put_idle_task;
use super::handlers::reset_task;
use super::handlers::restart_task;
use super::handlers::stop_task;
use super::handlers::update_task;
use crate::domain::scheduling::SchedulerHandle;

/// Route table of the task API
pub fn routes(scheduler: SchedulerHandle) -> impl Endpoint {
    Route::new()
        .nest(
            "/api/v1",
            Route::new()
                .at("/tasks", post(create_task).get(list_tasks))
                .at("/tasks/:id", get(get_task).delete(delete_task))
                .at("/tasks/:id/status", get(get_task_status))
                .at("/tasks/:id/stop", post(stop_task))
                .at("/tasks/:id/restart", post(restart_task))
                .at("/tasks/:id/reset", post(reset_task))
                .at("/tasks/:id/update", post(update_task))
                .at("/gpus", get(get_gpus))
                .at(
                    "/idle-task",
                    get(get_idle_task).put(put_idle_task).delete(delete_idle_task),
                ),
        )
        .data(scheduler)
        .with(Tracing)
}

/// HTTP API server in front of the scheduler task
pub struct ApiServer {
    scheduler: SchedulerHandle,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(scheduler: SchedulerHandle, listen_addr: String) -> Self {
        Self {
            scheduler,
            listen_addr,
        }
    }

    /// Serve until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::BindFailed`] if the listen address cannot be bound
    /// - [`ApiError::ServerError`] if the server fails while running
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let acceptor = TcpListener::bind(&self.listen_addr)
            .into_acceptor()
            .await
            .map_err(|e| {
                Report::new(ApiError::BindFailed {
                    addr: self.listen_addr.clone(),
                    message: e.to_string(),
                })
            })?;
        if let Some(addr) = acceptor.local_addr().first() {
            info!("API server listening on {:?}", addr);
        }

        let app = routes(self.scheduler);
        let server = Server::new_with_acceptor(acceptor);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::TaskStatus;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use serde_json::json;
    use serde_json::Value;
    use test_log::test;

    use super::*;
    use crate::domain::resource::GpuPool;
    use crate::domain::scheduling::mock::MemoryTaskStore;
    use crate::domain::scheduling::mock::MockBackend;
    use crate::domain::scheduling::mock::MockTime;
    use crate::domain::scheduling::mock::RecordingReporter;
    use crate::domain::scheduling::service::run;
    use crate::domain::scheduling::IdleTaskFiller;
    use crate::domain::scheduling::LoopConfig;
    use crate::domain::scheduling::SchedulerConfig;
    use crate::domain::scheduling::TaskScheduler;
    use crate::domain::scheduling::DEFAULT_IDLE_THRESHOLD;

    fn spawn_scheduler() -> (SchedulerHandle, CancellationToken) {
        let scheduler = TaskScheduler::new(
            SchedulerConfig::default(),
            MockBackend::with_artifacts(&["trainer:1"]),
            MemoryTaskStore::new(),
            RecordingReporter::new(),
            MockTime::default(),
            GpuPool::from_devices([(0, "RTX 4090"), (1, "RTX 4090")]),
            IdleTaskFiller::new(MemoryTaskStore::new(), DEFAULT_IDLE_THRESHOLD),
        );
        let (handle, commands) = SchedulerHandle::channel(16);
        let token = CancellationToken::new();
        let config = LoopConfig {
            tick_interval: Duration::from_millis(5),
            prune_tick: Duration::from_secs(3600),
            prune_interval_hours: 24,
        };
        tokio::spawn(run(scheduler, commands, config, token.clone()));
        (handle, token)
    }

    async fn body(resp: poem::test::TestResponse) -> Value {
        resp.0.into_body().into_json::<Value>().await.unwrap()
    }

    async fn wait_for_status(cli: &TestClient<impl Endpoint>, task_id: &str, status: &str) {
        for _ in 0..200 {
            let value = body(cli.get(format!("/api/v1/tasks/{task_id}")).send().await).await;
            if value["data"]["status"] == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn task_lifecycle_over_http() {
        let (handle, token) = spawn_scheduler();
        let cli = TestClient::new(routes(handle));

        let resp = cli
            .post("/api/v1/tasks")
            .body_json(&json!({
                "task_id": "job-1",
                "engine": "trainer:1",
                "server_specification": "{\"gpu_count\": 1}"
            }))
            .send()
            .await;
        resp.assert_status_is_ok();
        let created = body(resp).await;
        assert_eq!(created["success"], true);
        assert_eq!(created["data"]["status"], "queueing");

        wait_for_status(&cli, "job-1", "running").await;

        let gpus = body(cli.get("/api/v1/gpus").send().await).await;
        assert_eq!(gpus["data"]["total"], 2);
        assert_eq!(gpus["data"]["free"], 1);

        let stopped = body(
            cli.post("/api/v1/tasks/job-1/stop")
                .body_json(&json!({"end_status": "successfully_closed"}))
                .send()
                .await,
        )
        .await;
        assert_eq!(stopped["success"], true);
        wait_for_status(&cli, "job-1", "successfully_closed").await;

        let listed = body(cli.get("/api/v1/tasks").send().await).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));

        token.cancel();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn domain_errors_are_reported_in_band() {
        let (handle, token) = spawn_scheduler();
        let cli = TestClient::new(routes(handle));

        let missing = body(cli.get("/api/v1/tasks/nope").send().await).await;
        assert_eq!(missing["success"], false);
        assert_eq!(missing["message"], "task `nope` not found");

        let bad_status = body(
            cli.post("/api/v1/tasks/nope/stop")
                .body_json(&json!({"end_status": "running"}))
                .send()
                .await,
        )
        .await;
        assert_eq!(bad_status["success"], false);

        for _ in 0..2 {
            cli.post("/api/v1/tasks")
                .body_json(&json!({"task_id": "dup", "engine": "trainer:1"}))
                .send()
                .await
                .assert_status_is_ok();
        }
        let listed = body(cli.get("/api/v1/tasks").send().await).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));

        token.cancel();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn stopped_scheduler_is_service_unavailable() {
        let (handle, token) = spawn_scheduler();
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cli = TestClient::new(routes(handle));
        cli.get("/api/v1/tasks")
            .send()
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn idle_task_can_be_set_and_cleared() {
        let (handle, token) = spawn_scheduler();
        let cli = TestClient::new(routes(handle));

        let empty = body(cli.get("/api/v1/idle-task").send().await).await;
        assert_eq!(empty["data"], Value::Null);

        cli.put("/api/v1/idle-task")
            .body_json(&json!({"task_id": "filler", "engine": "miner:1"}))
            .send()
            .await
            .assert_status_is_ok();
        let set = body(cli.get("/api/v1/idle-task").send().await).await;
        assert_eq!(set["data"]["task_id"], "filler");
        assert_eq!(set["data"]["status"], TaskStatus::Queueing.to_string());

        cli.delete("/api/v1/idle-task")
            .send()
            .await
            .assert_status_is_ok();
        let cleared = body(cli.get("/api/v1/idle-task").send().await).await;
        assert_eq!(cleared["data"], Value::Null);

        token.cancel();
    }
}
