pub mod queue;
pub mod worker;

pub use queue::{JobQueue, OperationJob, RetentionPolicy, RetryPolicy};
pub use worker::{MaintenanceWorker, KEY_PATTERN};
