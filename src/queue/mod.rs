//! 传输调度模块

pub mod batch;
pub mod manager;
pub mod task;

pub use batch::{BatchCollector, IncomingFile};
pub use manager::{with_retry_once, QueueSnapshot, QueueStats, TaskFn, TaskResult, TransferQueue};
pub use task::{TaskStatus, TransferTask};
