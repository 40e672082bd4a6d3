//! 状态上报模块

pub mod reporter;
pub mod throttle;

pub use reporter::{LogStatusChannel, StatusChannel, StatusError, StatusReporter};
pub use throttle::ProgressThrottler;
