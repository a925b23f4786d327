//! Task scheduling engine: queue, running set, state machine and its collaborators.

mod idle;
#[cfg(test)]
pub(crate) mod mock;
mod pull;
mod scheduler;
pub mod service;
mod state_machine;
pub mod traits;
pub mod types;
mod update;


pub use idle::IdleTaskFiller;
pub use idle::DEFAULT_IDLE_THRESHOLD;
pub use pull::PullManager;
pub use pull::PullState;
pub use scheduler::LoadSummary;
pub use scheduler::SchedulerConfig;
pub use scheduler::TaskScheduler;
pub use service::LoopConfig;
pub use service::SchedulerHandle;
pub use traits::ExecutionBackend;
pub use traits::PullHandle;
pub use traits::TaskReporter;
pub use traits::TaskStore;
pub use traits::TimeSource;
pub use types::BackendError;
pub use types::InstanceConfig;
pub use types::InstanceState;
pub use types::PullProgress;
pub use types::PullError;
pub use types::ReportAck;
pub use types::ReportError;
pub use types::SchedulerError;
pub use types::StoreError;
pub use types::TaskEvent;
pub use update::update_artifact_name;
