//! 存储后端统一契约
//!
//! 所有后端实现 `StorageProvider`，让上层传输逻辑与具体后端解耦。
//! 分享链接是可选能力：实现了 `ShareCapable` 的后端通过 `share()` 暴露，
//! 调用方按能力查询而不是依赖可空方法。

use async_trait::async_trait;
use futures::TryStreamExt;
use std::path::Path;
use tokio::io::AsyncRead;

use crate::error::StorageError;
use crate::storage::types::{ShareLink, StorageKind};

/// 读取文件内容的字节流
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// 存储后端统一契约
///
/// 约定：
/// - `save_file` 对调用方而言是原子的：失败后 `target_name` 下不可见任何残留对象
/// - `delete_file` 幂等：删除不存在的对象不算错误
/// - `get_preview_url` 在后端无法生成直链时返回空字符串，由调用方回落到流式读取
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// 后端类型
    fn kind(&self) -> StorageKind;

    /// 实例显示名称
    fn display_name(&self) -> String;

    /// 保存本地文件到后端，返回存储路径或对象 ID
    async fn save_file(
        &self,
        source: &Path,
        target_name: &str,
        mime_type: &str,
    ) -> Result<String, StorageError>;

    /// 获取文件内容的字节流，对象不存在时返回 NotFound
    async fn get_file_stream(&self, stored_path: &str) -> Result<ByteStream, StorageError>;

    /// 获取预览直链，后端不支持时返回空字符串
    async fn get_preview_url(&self, stored_path: &str) -> Result<String, StorageError>;

    /// 删除文件（幂等）
    async fn delete_file(&self, stored_path: &str) -> Result<(), StorageError>;

    /// 获取文件大小
    async fn get_file_size(&self, stored_path: &str) -> Result<u64, StorageError>;

    /// 确保目标目录存在（批量上传前调用一次），默认无动作
    async fn ensure_folder(&self, _folder: &str) -> Result<(), StorageError> {
        Ok(())
    }

    /// 分享能力查询，不支持分享的后端返回 None
    fn share(&self) -> Option<&dyn ShareCapable> {
        None
    }
}

/// 分享链接能力（可选）
#[async_trait]
pub trait ShareCapable: Send + Sync {
    /// 创建分享链接
    async fn create_share_link(
        &self,
        stored_path: &str,
        password: Option<&str>,
        expires_secs: Option<u64>,
    ) -> Result<ShareLink, StorageError>;
}

/// 把 reqwest 响应体包装为 ByteStream
pub(crate) fn response_stream(response: reqwest::Response) -> ByteStream {
    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    Box::new(tokio_util::io::StreamReader::new(Box::pin(stream)))
}

/// 读取响应体文本用于错误诊断（失败时返回空串）
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    response.text().await.unwrap_or_default()
}
