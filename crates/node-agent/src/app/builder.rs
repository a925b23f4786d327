use anyhow::Context;
use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::services::NodeScheduler;
use crate::app::Application;
use crate::config::BackendKind;
use crate::config::DaemonArgs;
use crate::domain::scheduling::ExecutionBackend;
use crate::domain::scheduling::IdleTaskFiller;
use crate::domain::scheduling::TaskScheduler;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::docker::DockerBackend;
use crate::infrastructure::gpu_probe;
use crate::infrastructure::gpu_probe::ProbedGpu;
use crate::infrastructure::reporter::LogReporter;
use crate::infrastructure::task_store::FileTaskStore;
use crate::infrastructure::virsh::VirshBackend;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let gpus = tokio::task::spawn_blocking(gpu_probe::probe)
            .await
            .context("GPU probe task failed")?;
        tracing::info!(count = gpus.len(), "GPUs probed");

        let args = self.daemon_args.clone();
        let scheduler = tokio::task::spawn_blocking(move || create_scheduler(&args, &gpus))
            .await
            .context("Scheduler setup task failed")??;

        let services = ApplicationServices::new(scheduler, COMMAND_CHANNEL_CAPACITY);
        Ok(Application::new(services, self.daemon_args))
    }
}

fn create_backend(args: &DaemonArgs, gpus: &[ProbedGpu]) -> Box<dyn ExecutionBackend> {
    match args.backend {
        BackendKind::Container => Box::new(DockerBackend::new(
            args.docker_binary.clone(),
            args.command_timeout(),
        )),
        BackendKind::Vm => Box::new(VirshBackend::new(
            args.vm_image_dir.clone(),
            args.artifact_base_url.clone(),
            args.command_timeout(),
            gpu_probe::pci_map(gpus),
        )),
    }
}

/// Open the stores, recover persisted tasks and apply a configured idle task.
fn create_scheduler(args: &DaemonArgs, gpus: &[ProbedGpu]) -> Result<NodeScheduler> {
    let store = FileTaskStore::open(args.task_store_dir()).with_context(|| {
        format!(
            "Failed to open task store at {}",
            args.task_store_dir().display()
        )
    })?;
    let idle_store = FileTaskStore::open(args.idle_store_dir()).with_context(|| {
        format!(
            "Failed to open idle task store at {}",
            args.idle_store_dir().display()
        )
    })?;

    let mut idle = IdleTaskFiller::new(idle_store, args.idle_threshold());
    if let Some(task) = idle.load().context("Failed to load idle task")? {
        tracing::info!(task_id = %task.task_id, engine = %task.engine, "Idle task loaded");
    }

    let mut scheduler = TaskScheduler::new(
        args.scheduler_config(),
        create_backend(args, gpus),
        store,
        LogReporter,
        SystemClock,
        gpu_probe::to_pool(gpus),
        idle,
    );
    scheduler.load().context("Failed to load persisted tasks")?;

    if let Some(request) = &args.idle_task {
        let unchanged = scheduler
            .idle_filler()
            .task()
            .is_some_and(|t| t.task_id == request.task_id && t.engine == request.engine);
        if !unchanged {
            scheduler
                .set_idle_task(Some(request.clone()))
                .context("Failed to apply configured idle task")?;
        }
    }

    tracing::info!(pool = %scheduler.pool(), "Scheduler ready");
    Ok(scheduler)
}
