pub mod clock;
pub mod command;
pub mod docker;
pub mod gpu_probe;
pub mod logging;
pub mod reporter;
pub mod task_store;
pub mod virsh;
