// SaveBox Rust
// 多后端文件收纳核心库

// 配置管理模块
pub mod config;

// 错误分类
pub mod error;

// 日志系统
pub mod logging;

// 持久化模块
pub mod persistence;

// 存储后端模块
pub mod storage;

// 分片接收模块
pub mod ingest;

// 传输调度模块
pub mod queue;

// 状态上报模块
pub mod status;

// Web 服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use error::StorageError;
pub use ingest::{AssembledFile, ChunkProgress, IngestManager};
pub use persistence::Database;
pub use queue::{BatchCollector, IncomingFile, TaskStatus, TransferQueue, TransferTask};
pub use server::AppState;
pub use status::{ProgressThrottler, StatusChannel, StatusReporter};
pub use storage::{ProviderRegistry, ShareCapable, StorageKind, StorageProvider};
