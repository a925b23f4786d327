//! Task entity and its server specification

pub mod spec;
pub mod types;

pub use spec::Directive;
pub use spec::ServerSpecification;
pub use spec::SpecError;
pub use types::Task;
pub use types::TaskOperation;
