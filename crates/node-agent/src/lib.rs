//! Compute-node agent: admits tasks, allocates local GPUs to them and drives their
//! container or virtual machine instances through a persistent scheduling loop.

mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::resource;
pub use domain::scheduling;
pub use domain::task;
