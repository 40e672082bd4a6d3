//! 存储与传输的错误分类
//!
//! 约定：
//! - NotFound 在删除路径上被容忍，在读取路径上是硬错误
//! - RefreshExhausted 带上身份端点的原始诊断信息，而不是笼统的超时
//! - RateLimited 本身不算任务失败，由状态上报层转成全局冷却

use thiserror::Error;

/// 错误响应体截断上限（写日志和错误信息时避免整页 HTML 刷屏）
const BODY_TRUNCATE_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum StorageError {
    /// 对象不存在
    #[error("对象不存在: {0}")]
    NotFound(String),

    /// 访问令牌过期（单次 401，可通过刷新恢复）
    #[error("访问令牌已过期")]
    AuthExpired,

    /// 令牌刷新重试耗尽
    #[error("令牌刷新失败 (status={status}): {provider_error} - {description}")]
    RefreshExhausted {
        status: u16,
        provider_error: String,
        description: String,
    },

    /// 对端限流
    #[error("触发限流，建议等待 {retry_after_secs:?} 秒")]
    RateLimited { retry_after_secs: Option<u64> },

    /// 分片会话缺片
    #[error("分片不完整: 已收 {received}/{total}")]
    Incomplete { received: u32, total: u32 },

    /// 远端协议错误（非 2xx 响应）
    #[error("远端请求失败 (status={status}): {message}")]
    RemoteProtocol { status: u16, message: String },

    /// 后端不支持的操作
    #[error("后端不支持该操作: {0}")]
    Unsupported(&'static str),

    /// 配置不合法
    #[error("配置错误: {0}")]
    InvalidConfig(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("网络错误: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// 把非 2xx 的 HTTP 响应映射成分类错误
    pub fn from_status(status: reqwest::StatusCode, body: String, context: &str) -> Self {
        match status.as_u16() {
            404 => StorageError::NotFound(context.to_string()),
            401 => StorageError::AuthExpired,
            429 => StorageError::RateLimited {
                retry_after_secs: None,
            },
            code => StorageError::RemoteProtocol {
                status: code,
                message: format!("{}: {}", context, truncate_body(&body)),
            },
        }
    }

    /// 是否值得在传输层重试一次
    pub fn is_retriable(&self) -> bool {
        match self {
            // 服务端错误和网络抖动值得重试；4xx 重试也还是 4xx
            StorageError::RemoteProtocol { status, .. } => *status >= 500,
            StorageError::Network(_) | StorageError::Io(_) => true,
            StorageError::RateLimited { .. } => true,
            StorageError::AuthExpired => true,
            StorageError::NotFound(_)
            | StorageError::RefreshExhausted { .. }
            | StorageError::Incomplete { .. }
            | StorageError::Unsupported(_)
            | StorageError::InvalidConfig(_)
            | StorageError::Other(_) => false,
        }
    }
}

/// 截断到 512 字节以内（对齐字符边界）
fn truncate_body(body: &str) -> &str {
    if body.len() <= BODY_TRUNCATE_BYTES {
        return body;
    }
    let mut end = BODY_TRUNCATE_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        let status = reqwest::StatusCode::NOT_FOUND;
        assert!(matches!(
            StorageError::from_status(status, String::new(), "x.jpg"),
            StorageError::NotFound(_)
        ));

        let status = reqwest::StatusCode::UNAUTHORIZED;
        assert!(matches!(
            StorageError::from_status(status, String::new(), "ctx"),
            StorageError::AuthExpired
        ));

        let status = reqwest::StatusCode::TOO_MANY_REQUESTS;
        assert!(matches!(
            StorageError::from_status(status, String::new(), "ctx"),
            StorageError::RateLimited { .. }
        ));

        let status = reqwest::StatusCode::BAD_GATEWAY;
        match StorageError::from_status(status, "upstream down".to_string(), "上传") {
            StorageError::RemoteProtocol { status, message } => {
                assert_eq!(status, 502);
                assert!(message.contains("upstream down"));
            }
            other => panic!("预期 RemoteProtocol，实际: {:?}", other),
        }
    }

    #[test]
    fn test_retriable_classification() {
        assert!(StorageError::RemoteProtocol {
            status: 503,
            message: String::new()
        }
        .is_retriable());
        assert!(!StorageError::RemoteProtocol {
            status: 400,
            message: String::new()
        }
        .is_retriable());
        assert!(!StorageError::Incomplete {
            received: 1,
            total: 3
        }
        .is_retriable());
        assert!(!StorageError::NotFound("x".to_string()).is_retriable());
        assert!(StorageError::RateLimited {
            retry_after_secs: Some(5)
        }
        .is_retriable());
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        // 多字节字符横跨截断点时回退到字符边界
        let body = "错".repeat(300);
        let truncated = truncate_body(&body);
        assert!(truncated.len() <= BODY_TRUNCATE_BYTES);
        assert!(truncated.chars().all(|c| c == '错'));
    }
}
