//! Async front of the scheduler.
//!
//! The scheduler lives inside one tokio task. Ticks, prune passes and external commands are
//! multiplexed onto that task, so scheduler state is only ever touched from one place.

use std::time::Duration;

use api_types::CreateTaskRequest;
use api_types::GpuPoolInfo;
use api_types::TaskInfo;
use api_types::TaskStatus;
use api_types::TaskStatusInfo;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::scheduler::TaskScheduler;
use super::traits::ExecutionBackend;
use super::traits::TaskReporter;
use super::traits::TaskStore;
use super::traits::TimeSource;
use super::types::Result;
use super::types::SchedulerError;
use crate::domain::resource::GpuPool;

type Reply<T> = oneshot::Sender<T>;

/// Requests funnelled into the scheduler task
#[derive(Debug)]
pub enum SchedulerCommand {
    Enqueue {
        request: CreateTaskRequest,
        reply: Reply<Result<TaskInfo>>,
    },
    Stop {
        task_id: String,
        end_status: TaskStatus,
        reply: Reply<Result<()>>,
    },
    Restart {
        task_id: String,
        reply: Reply<Result<()>>,
    },
    Reset {
        task_id: String,
        reply: Reply<Result<()>>,
    },
    Update {
        task_id: String,
        server_specification: String,
        reply: Reply<Result<()>>,
    },
    Delete {
        task_id: String,
        reply: Reply<Result<()>>,
    },
    Find {
        task_id: String,
        reply: Reply<Option<TaskInfo>>,
    },
    ListAll {
        reply: Reply<Vec<TaskInfo>>,
    },
    GetStatus {
        task_id: String,
        reply: Reply<Result<TaskStatusInfo>>,
    },
    PoolState {
        reply: Reply<GpuPoolInfo>,
    },
    MergeGpus {
        probed: GpuPool,
    },
    SetIdleTask {
        request: Option<CreateTaskRequest>,
        reply: Reply<Result<()>>,
    },
    IdleTask {
        reply: Reply<Option<TaskInfo>>,
    },
}

/// Cloneable client of the scheduler task
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn new(sender: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { sender }
    }

    /// Channel pair for a scheduler task and its handle
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SchedulerCommand>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }

    /// Resolves once the scheduler task has exited and dropped its command receiver.
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> SchedulerCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        response.await.map_err(|_| SchedulerError::Unavailable)
    }

    pub async fn enqueue(&self, request: CreateTaskRequest) -> Result<TaskInfo> {
        self.call(|reply| SchedulerCommand::Enqueue { request, reply })
            .await?
    }

    pub async fn stop(&self, task_id: &str, end_status: TaskStatus) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Stop {
            task_id,
            end_status,
            reply,
        })
        .await?
    }

    pub async fn restart(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Restart { task_id, reply })
            .await?
    }

    pub async fn reset(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Reset { task_id, reply })
            .await?
    }

    pub async fn update(&self, task_id: &str, server_specification: String) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Update {
            task_id,
            server_specification,
            reply,
        })
        .await?
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Delete { task_id, reply })
            .await?
    }

    pub async fn find(&self, task_id: &str) -> Result<Option<TaskInfo>> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::Find { task_id, reply })
            .await
    }

    pub async fn list_all(&self) -> Result<Vec<TaskInfo>> {
        self.call(|reply| SchedulerCommand::ListAll { reply }).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusInfo> {
        let task_id = task_id.to_string();
        self.call(|reply| SchedulerCommand::GetStatus { task_id, reply })
            .await?
    }

    pub async fn pool_state(&self) -> Result<GpuPoolInfo> {
        self.call(|reply| SchedulerCommand::PoolState { reply })
            .await
    }

    /// Fire-and-forget reconciliation of a re-probed inventory
    pub async fn merge_gpus(&self, probed: GpuPool) -> Result<()> {
        self.sender
            .send(SchedulerCommand::MergeGpus { probed })
            .await
            .map_err(|_| SchedulerError::Unavailable)
    }

    pub async fn set_idle_task(&self, request: Option<CreateTaskRequest>) -> Result<()> {
        self.call(|reply| SchedulerCommand::SetIdleTask { request, reply })
            .await?
    }

    pub async fn idle_task(&self) -> Result<Option<TaskInfo>> {
        self.call(|reply| SchedulerCommand::IdleTask { reply })
            .await
    }
}

/// Timing of the scheduler task
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tick_interval: Duration,
    pub prune_tick: Duration,
    pub prune_interval_hours: u64,
}

/// Drive `scheduler` until cancelled or every handle is dropped.
///
/// Backend and store calls are blocking, so each unit of work runs under
/// [`tokio::task::block_in_place`]; this requires the multi-threaded runtime.
pub async fn run<B, S, R, T>(
    mut scheduler: TaskScheduler<B, S, R, T>,
    mut commands: mpsc::Receiver<SchedulerCommand>,
    config: LoopConfig,
    token: CancellationToken,
) where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut prune = interval(config.prune_tick);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        tick_ms = config.tick_interval.as_millis() as u64,
        prune_secs = config.prune_tick.as_secs(),
        "Scheduler loop started"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Scheduler loop cancelled");
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        tokio::task::block_in_place(|| dispatch(&mut scheduler, command));
                    }
                    None => {
                        info!("Scheduler command channel closed");
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                tokio::task::block_in_place(|| scheduler.tick());
            }
            _ = prune.tick() => {
                let hours = config.prune_interval_hours;
                let removed = tokio::task::block_in_place(|| scheduler.prune(hours));
                debug!(removed, "Prune pass finished");
            }
        }
    }
}

fn dispatch<B, S, R, T>(scheduler: &mut TaskScheduler<B, S, R, T>, command: SchedulerCommand)
where
    B: ExecutionBackend,
    S: TaskStore,
    R: TaskReporter,
    T: TimeSource,
{
    // A dropped receiver only means the caller gave up waiting.
    match command {
        SchedulerCommand::Enqueue { request, reply } => {
            let _ = reply.send(scheduler.enqueue(request).map(|t| t.to_info()));
        }
        SchedulerCommand::Stop {
            task_id,
            end_status,
            reply,
        } => {
            let _ = reply.send(scheduler.stop(&task_id, end_status));
        }
        SchedulerCommand::Restart { task_id, reply } => {
            let _ = reply.send(scheduler.restart(&task_id));
        }
        SchedulerCommand::Reset { task_id, reply } => {
            let _ = reply.send(scheduler.reset(&task_id));
        }
        SchedulerCommand::Update {
            task_id,
            server_specification,
            reply,
        } => {
            let _ = reply.send(scheduler.update(&task_id, server_specification));
        }
        SchedulerCommand::Delete { task_id, reply } => {
            let _ = reply.send(scheduler.delete(&task_id));
        }
        SchedulerCommand::Find { task_id, reply } => {
            let _ = reply.send(scheduler.find(&task_id).map(|t| t.to_info()));
        }
        SchedulerCommand::ListAll { reply } => {
            let _ = reply.send(scheduler.list_all().into_iter().map(|t| t.to_info()).collect());
        }
        SchedulerCommand::GetStatus { task_id, reply } => {
            let _ = reply.send(scheduler.get_status(&task_id));
        }
        SchedulerCommand::PoolState { reply } => {
            let _ = reply.send(scheduler.pool_info());
        }
        SchedulerCommand::MergeGpus { probed } => scheduler.merge_gpus(&probed),
        SchedulerCommand::SetIdleTask { request, reply } => {
            let _ = reply.send(scheduler.set_idle_task(request));
        }
        SchedulerCommand::IdleTask { reply } => {
            let _ = reply.send(scheduler.idle_filler().task().map(|t| t.to_info()));
        }
    }
}
