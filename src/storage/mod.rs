//! 存储模块
//!
//! 后端实现 + 账号注册表

pub mod local;
pub mod oauth_drive;
pub mod object_store;
pub mod provider;
pub mod registry;
pub mod types;
pub mod webdav;

pub use provider::{ByteStream, ShareCapable, StorageProvider};
pub use registry::ProviderRegistry;
pub use types::{FileRecord, StorageAccount, StorageKind};
