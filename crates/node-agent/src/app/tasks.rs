use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::domain::scheduling::service;
use crate::domain::scheduling::SchedulerHandle;
use crate::infrastructure::gpu_probe;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let scheduler_task = self.spawn_scheduler_task(app)?;
        self.tasks.push(scheduler_task);

        let gpu_probe_task = self.spawn_gpu_probe_task(app);
        self.tasks.push(gpu_probe_task);

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();

                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            // Wait for any task to complete unexpectedly
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_scheduler_task(&self, app: &Application) -> Result<JoinHandle<()>> {
        let runtime = app
            .services()
            .take_scheduler_runtime()
            .ok_or_else(|| anyhow::anyhow!("scheduler task already started"))?;
        let loop_config = app.daemon_args().loop_config();
        let token = self.cancellation_token.clone();

        Ok(tokio::spawn(async move {
            tracing::info!("Starting scheduler task");
            service::run(runtime.scheduler, runtime.commands, loop_config, token).await;
            tracing::info!("Scheduler task completed");
        }))
    }

    fn spawn_gpu_probe_task(&self, app: &Application) -> JoinHandle<()> {
        let handle = app.services().scheduler_handle.clone();
        let interval = Duration::from_secs(app.daemon_args().gpu_probe_interval_secs.max(1));
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting GPU probe task");
            run_gpu_probe(handle, interval, token).await;
            tracing::info!("GPU probe task completed");
        })
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let listen_addr = app.daemon_args().api_listen_addr.clone();
        let handle = app.services().scheduler_handle.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(handle, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {:?}", e);
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}

/// Periodically re-probe local GPUs and hand the result to the scheduler.
async fn run_gpu_probe(handle: SchedulerHandle, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately and the builder has just probed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let probed = match tokio::task::spawn_blocking(gpu_probe::probe).await {
                    Ok(gpus) => gpus,
                    Err(e) => {
                        tracing::warn!("GPU probe panicked: {e}");
                        continue;
                    }
                };
                if probed.is_empty() {
                    tracing::debug!("GPU probe found no devices, keeping current pool");
                    continue;
                }
                if handle.merge_gpus(gpu_probe::to_pool(&probed)).await.is_err() {
                    tracing::info!("Scheduler gone, stopping GPU probe");
                    break;
                }
            }
        }
    }
}
