use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::domain::scheduling::service::SchedulerCommand;
use crate::domain::scheduling::ExecutionBackend;
use crate::domain::scheduling::SchedulerHandle;
use crate::domain::scheduling::TaskScheduler;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::reporter::LogReporter;
use crate::infrastructure::task_store::FileTaskStore;

/// Scheduler wired to the node's real adapters
pub type NodeScheduler =
    TaskScheduler<Box<dyn ExecutionBackend>, FileTaskStore, LogReporter, SystemClock>;

/// Scheduler and the receiving end of its command channel, moved into the scheduler task
pub struct SchedulerRuntime {
    pub scheduler: NodeScheduler,
    pub commands: mpsc::Receiver<SchedulerCommand>,
}

/// Application dependencies
pub struct ApplicationServices {
    pub scheduler_handle: SchedulerHandle,
    /// Taken exactly once when the scheduler task is spawned
    pub scheduler_runtime: Mutex<Option<SchedulerRuntime>>,
}

impl ApplicationServices {
    pub fn new(scheduler: NodeScheduler, channel_capacity: usize) -> Self {
        let (scheduler_handle, commands) = SchedulerHandle::channel(channel_capacity);
        Self {
            scheduler_handle,
            scheduler_runtime: Mutex::new(Some(SchedulerRuntime {
                scheduler,
                commands,
            })),
        }
    }

    pub fn take_scheduler_runtime(&self) -> Option<SchedulerRuntime> {
        self.scheduler_runtime
            .lock()
            .ok()
            .and_then(|mut runtime| runtime.take())
    }
}
