use std::time::Duration;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

const SCHEDULER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();

        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        // Wait for tasks to complete or receive shutdown signal
        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Gracefully shutdown application, waiting for the scheduler task to leave its loop
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        let drained = tokio::time::timeout(
            SCHEDULER_DRAIN_TIMEOUT,
            self.services.scheduler_handle.closed(),
        )
        .await;
        match drained {
            Ok(()) => tracing::info!("Scheduler loop drained"),
            Err(_) => tracing::warn!(
                "Scheduler loop still running after {:?}",
                SCHEDULER_DRAIN_TIMEOUT
            ),
        }

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
