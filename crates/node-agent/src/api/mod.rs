//! HTTP API over the task scheduler
//!
//! Every endpoint answers with the `{success, data, message}` envelope. Requests are
//! forwarded to the scheduler task through a [`SchedulerHandle`](crate::domain::scheduling::SchedulerHandle).
//!
//! # API Endpoints
//!
//! - `POST /api/v1/tasks` - Admit a task
//! - `GET /api/v1/tasks` - List every known task
//! - `GET /api/v1/tasks/:id` - Get one task record
//! - `GET /api/v1/tasks/:id/status` - Live status, inspecting the backend
//! - `POST /api/v1/tasks/:id/stop` - Stop with an optional `end_status`
//! - `POST /api/v1/tasks/:id/restart`
//! - `POST /api/v1/tasks/:id/reset`
//! - `POST /api/v1/tasks/:id/update` - Replace the specification and run its operation
//! - `DELETE /api/v1/tasks/:id`
//! - `GET /api/v1/gpus` - GPU pool snapshot
//! - `GET|PUT|DELETE /api/v1/idle-task` - Idle task definition

pub mod errors;
pub mod handlers;
pub mod server;

pub use server::ApiServer;
