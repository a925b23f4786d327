//! Device resource accounting

pub mod gpu_pool;

pub use gpu_pool::join_ids;
pub use gpu_pool::DeviceSet;
pub use gpu_pool::DeviceView;
pub use gpu_pool::GpuPool;
pub use gpu_pool::GpuRequest;
pub use gpu_pool::PoolError;
