pub mod resource;
pub mod scheduling;
pub mod task;
