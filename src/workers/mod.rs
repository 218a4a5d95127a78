//! Task-queue workers, pools, and the flow-wide worker registry.

pub mod pool;
pub mod registry;
pub mod worker;

pub use pool::{KeyMatcher, PoolError, PoolTask, PostStrategy, WorkerPool};
pub use registry::{AUTO_WORKER_BASE, USER_WORKER_RANGE_END, WorkerRegistry};
pub use worker::{SchedPolicy, Task, ThreadPriority, Worker, WorkerError};
