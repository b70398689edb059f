//! Task hand-off between the networking reactors and the worker pool.

pub mod pool;
pub mod queue;

pub use pool::{Fence, WorkerPool};
pub use queue::{Consumer, TaskQueue, NODE_SLOTS};
