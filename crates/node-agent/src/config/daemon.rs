use std::path::PathBuf;
use std::time::Duration;

use api_types::CreateTaskRequest;
use clap::Parser;
use clap::ValueEnum;

use crate::domain::scheduling::LoopConfig;
use crate::domain::scheduling::SchedulerConfig;

/// Which execution backend hosts the workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Docker containers
    Container,
    /// libvirt virtual machines
    Vm,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_AGENT_DATA_DIR",
        default_value = "/var/lib/node-agent",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the task store and idle task definition"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        env = "NODE_AGENT_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily-rotated log files; stderr only when unset"
    )]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "NODE_AGENT_BACKEND",
        value_enum,
        default_value = "container",
        help = "Execution backend, either 'container' or 'vm'"
    )]
    pub backend: BackendKind,

    #[arg(
        long,
        env = "DOCKER_BINARY",
        default_value = "docker",
        help = "Docker CLI used by the container backend"
    )]
    pub docker_binary: String,

    #[arg(
        long,
        env = "BACKEND_COMMAND_TIMEOUT_SECS",
        default_value = "60",
        help = "Upper bound for a single backend command"
    )]
    pub command_timeout_secs: u64,

    #[arg(
        long,
        env = "TICK_INTERVAL_MS",
        default_value = "1000",
        help = "Scheduler tick interval in milliseconds"
    )]
    pub tick_interval_ms: u64,

    #[arg(
        long,
        env = "PRUNE_TICK_SECS",
        default_value = "3600",
        help = "How often the prune pass is considered, in seconds"
    )]
    pub prune_tick_secs: u64,

    #[arg(
        long,
        env = "PRUNE_INTERVAL_HOURS",
        default_value = "240",
        value_parser = clap::value_parser!(u64).range(1..=8760),
        help = "Age in hours after which terminal tasks are pruned"
    )]
    pub prune_interval_hours: u64,

    #[arg(
        long,
        env = "RETRY_CEILING",
        default_value = "1",
        help = "Backend failures tolerated before a task is closed abnormally"
    )]
    pub retry_ceiling: u32,

    #[arg(
        long,
        env = "PULL_TIMEOUT_SECS",
        default_value = "18000",
        help = "Upper bound for pulling a task's artifact, in seconds"
    )]
    pub pull_timeout_secs: u64,

    #[arg(
        long,
        env = "MAX_TASK_COUNT",
        default_value = "200000",
        help = "Admission cap on tasks known to the node"
    )]
    pub max_task_count: usize,

    #[arg(
        long,
        env = "MAX_PRUNE_COUNT",
        default_value = "160000",
        help = "Terminal tasks kept before the prune interval is halved"
    )]
    pub max_prune_count: usize,

    #[arg(
        long,
        env = "IDLE_THRESHOLD_SECS",
        default_value = "180",
        help = "Idle time before the idle task is launched, in seconds"
    )]
    pub idle_threshold_secs: u64,

    #[arg(
        long,
        env = "STOP_TIMEOUT_SECS",
        default_value = "30",
        help = "Grace period when stopping an instance, in seconds"
    )]
    pub stop_timeout_secs: u64,

    #[arg(
        long,
        env = "REPORT_INTERVAL_SECS",
        default_value = "300",
        help = "Default spacing of running-task reports, in seconds"
    )]
    pub report_interval_secs: u64,

    #[arg(
        long,
        env = "GPU_PROBE_INTERVAL_SECS",
        default_value = "60",
        help = "How often local GPUs are re-probed and merged into the pool"
    )]
    pub gpu_probe_interval_secs: u64,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "127.0.0.1:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "VM_IMAGE_DIR",
        default_value = "/data/images",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory of base images and instance overlays for the vm backend"
    )]
    pub vm_image_dir: PathBuf,

    #[arg(
        long,
        env = "ARTIFACT_BASE_URL",
        help = "Base URL the vm backend downloads missing images from"
    )]
    pub artifact_base_url: Option<String>,

    #[arg(
        long,
        env = "IDLE_TASK",
        help = "Idle task definition as a JSON task request, replacing any stored one",
        value_parser = parse_idle_task
    )]
    pub idle_task: Option<CreateTaskRequest>,
}

/// Parse JSON string into an idle task request
fn parse_idle_task(s: &str) -> Result<CreateTaskRequest, String> {
    let request: CreateTaskRequest =
        serde_json::from_str(s).map_err(|e| format!("Failed to parse idle task JSON: {e}"))?;
    if request.task_id.is_empty() || request.engine.is_empty() {
        return Err("idle task needs both task_id and engine".to_string());
    }
    Ok(request)
}

impl DaemonArgs {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            retry_ceiling: self.retry_ceiling,
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
            max_task_count: self.max_task_count,
            max_prune_count: self.max_prune_count,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            report_interval: Duration::from_secs(self.report_interval_secs),
            ..SchedulerConfig::default()
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            prune_tick: Duration::from_secs(self.prune_tick_secs.max(1)),
            prune_interval_hours: self.prune_interval_hours,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn task_store_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn idle_store_dir(&self) -> PathBuf {
        self.data_dir.join("idle")
    }
}
