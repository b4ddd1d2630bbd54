//! Partitioned request dispatch.

mod pool;
mod queue;

pub use pool::{DispatcherConfig, Dispatcher, PartitionRouter, RequestHandler};
pub use queue::{BoundedQueue, PushResult};
