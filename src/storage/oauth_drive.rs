//! OAuth 网盘后端（OneDrive / Graph 系）
//!
//! 两块核心逻辑：
//! - 令牌生命周期：提前 5 分钟视为过期，最多 3 次线性退避刷新，
//!   轮换出的新 refresh_token 在刷新调用内同步写回数据库
//! - 大文件上传：≤4MB 单次 PUT；更大的文件走上传会话，
//!   按 3.2MB 窗口（320KB 对齐的整数倍）带 Content-Range 逐段 PUT，
//!   任何分片失败都先尽力 DELETE 会话再抛错，避免远端堆积孤儿会话

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::persistence::Database;
use crate::storage::provider::{error_body, response_stream, ByteStream, StorageProvider};
use crate::storage::types::{OauthDriveConfig, StorageKind};

/// 令牌提前视为过期的安全边际（对抗时钟偏差与请求在途时间）
const TOKEN_STALE_MARGIN_SECS: i64 = 300;

/// 刷新最大尝试次数
const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// 单次 PUT 的大小上限: 4MB
const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// 上传会话要求的分片对齐: 320KB
const UPLOAD_ALIGNMENT: u64 = 320 * 1024;

/// 上传窗口大小: 3.2MB（320KB 的 10 倍）
const UPLOAD_WINDOW: u64 = 10 * UPLOAD_ALIGNMENT;

/// 访问令牌缓存
#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    /// 过期时间 (Unix timestamp)
    expires_at: i64,
}

/// 令牌端点响应
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// 令牌端点错误响应
#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// 网盘对象
#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

/// 上传会话响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

/// OAuth 网盘后端
pub struct OauthDriveProvider {
    /// 所属账号 ID（令牌轮换时写回该账号的配置包）
    account_id: String,
    display_name: String,
    /// 配置包（refresh_token 会轮换，因此放在锁里）
    config: Mutex<OauthDriveConfig>,
    /// 令牌缓存；锁跨越整个刷新调用，并发调用方串行等待而不是各刷各的
    token: Mutex<Option<AccessToken>>,
    client: Client,
    db: Arc<Database>,
}

impl OauthDriveProvider {
    pub fn new(
        account_id: String,
        display_name: String,
        config: OauthDriveConfig,
        db: Arc<Database>,
    ) -> Result<Self, StorageError> {
        if config.client_id.is_empty() || config.refresh_token.is_empty() {
            return Err(StorageError::InvalidConfig(
                "OAuth 网盘配置缺少 client_id 或 refresh_token".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            account_id,
            display_name,
            config: Mutex::new(config),
            token: Mutex::new(None),
            client,
            db,
        })
    }

    // =====================================================
    // 令牌生命周期
    // =====================================================

    /// 取有效的访问令牌，必要时刷新
    async fn ensure_token(&self) -> Result<String, StorageError> {
        let mut guard = self.token.lock().await;
        let now = chrono::Utc::now().timestamp();
        if let Some(token) = guard.as_ref() {
            if !is_stale(token.expires_at, now) {
                return Ok(token.value.clone());
            }
        }

        let refreshed = self.refresh_with_retry().await?;
        let value = refreshed.value.clone();
        *guard = Some(refreshed);
        Ok(value)
    }

    /// 带线性退避的令牌刷新（attempt * 1s）
    async fn refresh_with_retry(&self) -> Result<AccessToken, StorageError> {
        let mut last_status = 0u16;
        let mut last_error = TokenErrorResponse::default();

        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            match self.refresh_once().await {
                Ok(token) => {
                    info!("访问令牌刷新成功 (第 {} 次尝试)", attempt);
                    return Ok(token);
                }
                Err((status, err)) => {
                    warn!(
                        "刷新令牌失败 (第 {}/{} 次): status={}, error={}",
                        attempt, MAX_REFRESH_ATTEMPTS, status, err.error
                    );
                    last_status = status;
                    last_error = err;
                    if attempt < MAX_REFRESH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        Err(StorageError::RefreshExhausted {
            status: last_status,
            provider_error: last_error.error,
            description: last_error.error_description,
        })
    }

    /// 单次刷新调用；轮换出的新 refresh_token 在返回前同步落库
    async fn refresh_once(&self) -> Result<AccessToken, (u16, TokenErrorResponse)> {
        let mut config = self.config.lock().await;
        let params = [
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("refresh_token", config.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&config.token_endpoint)
            .form(&params)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                (
                    0,
                    TokenErrorResponse {
                        error: "network".to_string(),
                        error_description: e.to_string(),
                    },
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let err: TokenErrorResponse = response.json().await.unwrap_or_default();
            return Err((status.as_u16(), err));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            (
                status.as_u16(),
                TokenErrorResponse {
                    error: "invalid_response".to_string(),
                    error_description: e.to_string(),
                },
            )
        })?;

        // 轮换检测：丢失轮换后的 refresh_token 会让后续所有刷新失效，
        // 所以必须在这里同步写库，不能推迟
        if let Some(new_refresh) = &body.refresh_token {
            if *new_refresh != config.refresh_token {
                config.refresh_token = new_refresh.clone();
                let config_json = serde_json::to_string(&*config).map_err(|e| {
                    (
                        0,
                        TokenErrorResponse {
                            error: "serialize".to_string(),
                            error_description: e.to_string(),
                        },
                    )
                })?;
                self.db
                    .update_account_config(&self.account_id, &config_json)
                    .map_err(|e| {
                        (
                            0,
                            TokenErrorResponse {
                                error: "persist".to_string(),
                                error_description: e.to_string(),
                            },
                        )
                    })?;
                info!("refresh_token 已轮换并落库: account={}", self.account_id);
            }
        }

        Ok(AccessToken {
            value: body.access_token,
            expires_at: chrono::Utc::now().timestamp() + body.expires_in,
        })
    }

    // =====================================================
    // Graph API 辅助
    // =====================================================

    async fn drive_base(&self) -> String {
        self.config.lock().await.drive_base.trim_end_matches('/').to_string()
    }

    async fn base_folder(&self) -> String {
        self.config.lock().await.folder.trim_matches('/').to_string()
    }

    /// 按路径寻址的 API URL: {base}/root:/{path} 或 {base}/root:/{path}:/{suffix}
    fn path_url(drive_base: &str, path: &str, suffix: &str) -> String {
        let encoded: String = path
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if suffix.is_empty() {
            format!("{}/root:/{}", drive_base, encoded)
        } else {
            format!("{}/root:/{}:/{}", drive_base, encoded, suffix)
        }
    }

    /// 确保网盘目录存在：逐级探测，404 时以 conflictBehavior=fail 创建
    ///
    /// 两个进程并发建同一目录时宁可失败也不静默重复
    async fn ensure_folder_path(&self, folder: &str) -> Result<(), StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;

        let mut current = String::new();
        for segment in folder.split('/').filter(|s| !s.is_empty()) {
            let parent = current.clone();
            if current.is_empty() {
                current = segment.to_string();
            } else {
                current = format!("{}/{}", current, segment);
            }

            let probe = self
                .client
                .get(Self::path_url(&drive_base, &current, ""))
                .bearer_auth(&token)
                .timeout(Duration::from_secs(10))
                .send()
                .await?;

            match probe.status().as_u16() {
                200 => continue,
                404 => {
                    let create_url = if parent.is_empty() {
                        format!("{}/root/children", drive_base)
                    } else {
                        Self::path_url(&drive_base, &parent, "children")
                    };
                    let body = serde_json::json!({
                        "name": segment,
                        "folder": {},
                        "@microsoft.graph.conflictBehavior": "fail"
                    });
                    let response = self
                        .client
                        .post(&create_url)
                        .bearer_auth(&token)
                        .json(&body)
                        .timeout(Duration::from_secs(15))
                        .send()
                        .await?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(StorageError::from_status(
                            status,
                            error_body(response).await,
                            "创建网盘目录失败",
                        ));
                    }
                    info!("网盘目录已创建: {}", current);
                }
                _ => {
                    let status = probe.status();
                    return Err(StorageError::from_status(
                        status,
                        error_body(probe).await,
                        "探测网盘目录失败",
                    ));
                }
            }
        }
        Ok(())
    }

    // =====================================================
    // 上传
    // =====================================================

    /// 小文件：单次 PUT 全量内容
    async fn simple_upload(
        &self,
        source: &Path,
        remote_path: &str,
        mime_type: &str,
    ) -> Result<String, StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;
        let bytes = tokio::fs::read(source).await?;

        let response = self
            .client
            .put(Self::path_url(&drive_base, remote_path, "content"))
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                "上传文件失败",
            ));
        }

        let item: DriveItem = response.json().await.map_err(StorageError::Network)?;
        Ok(item.id)
    }

    /// 大文件：上传会话 + Content-Range 分段 PUT
    async fn session_upload(
        &self,
        source: &Path,
        remote_path: &str,
        total_size: u64,
    ) -> Result<String, StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;

        // 1. 开会话
        let body = serde_json::json!({
            "item": { "@microsoft.graph.conflictBehavior": "rename" }
        });
        let response = self
            .client
            .post(Self::path_url(&drive_base, remote_path, "createUploadSession"))
            .bearer_auth(&token)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                "创建上传会话失败",
            ));
        }
        let session: UploadSession = response.json().await.map_err(StorageError::Network)?;
        debug!("上传会话已创建: {} ({} bytes)", remote_path, total_size);

        // 2. 逐窗口上传；任何一段失败都先取消会话再抛错
        match self
            .upload_windows(source, &session.upload_url, total_size)
            .await
        {
            Ok(Some(item_id)) => Ok(item_id),
            Ok(None) => {
                // 末段响应没带对象信息，按路径兜底查询
                self.fetch_item_id(remote_path).await
            }
            Err(e) => {
                self.cancel_session(&session.upload_url).await;
                Err(e)
            }
        }
    }

    /// 按固定窗口读文件并逐段 PUT，返回末段响应中的对象 ID（若有）
    async fn upload_windows(
        &self,
        source: &Path,
        upload_url: &str,
        total_size: u64,
    ) -> Result<Option<String>, StorageError> {
        let mut file = tokio::fs::File::open(source).await?;
        let ranges = chunk_ranges(total_size);
        let total_chunks = ranges.len();

        for (index, range) in ranges.into_iter().enumerate() {
            let size = (range.end - range.start) as usize;
            file.seek(std::io::SeekFrom::Start(range.start)).await?;
            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer).await?;

            let content_range = format!("bytes {}-{}/{}", range.start, range.end - 1, total_size);
            // 会话 URL 自带鉴权，不能再附 Authorization 头
            let response = self
                .client
                .put(upload_url)
                .header(reqwest::header::CONTENT_RANGE, &content_range)
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(buffer)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StorageError::from_status(
                    status,
                    error_body(response).await,
                    &format!("分片 #{} PUT 失败", index),
                ));
            }

            debug!(
                "分片 #{}/{} 上传完成 ({})",
                index + 1,
                total_chunks,
                content_range
            );

            // 末段响应带最终对象时以它为准
            if index + 1 == total_chunks {
                if let Ok(item) = response.json::<DriveItem>().await {
                    return Ok(Some(item.id));
                }
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// 尽力取消上传会话；会话可能已过期，取消失败只记日志不上抛
    async fn cancel_session(&self, upload_url: &str) {
        match self
            .client
            .delete(upload_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("上传会话已取消");
            }
            Ok(response) => {
                warn!("取消上传会话返回 {}（忽略）", response.status());
            }
            Err(e) => {
                warn!("取消上传会话失败（忽略）: {}", e);
            }
        }
    }

    /// 按路径查对象 ID
    async fn fetch_item_id(&self, remote_path: &str) -> Result<String, StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;
        let response = self
            .client
            .get(Self::path_url(&drive_base, remote_path, ""))
            .bearer_auth(&token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                remote_path,
            ));
        }
        let item: DriveItem = response.json().await.map_err(StorageError::Network)?;
        Ok(item.id)
    }

    /// 按对象 ID 查元数据
    async fn fetch_item(&self, item_id: &str) -> Result<DriveItem, StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;
        let response = self
            .client
            .get(format!("{}/items/{}", drive_base, item_id))
            .bearer_auth(&token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                item_id,
            ));
        }
        response.json().await.map_err(StorageError::Network)
    }
}

#[async_trait]
impl StorageProvider for OauthDriveProvider {
    fn kind(&self) -> StorageKind {
        StorageKind::OauthDrive
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    async fn save_file(
        &self,
        source: &Path,
        target_name: &str,
        mime_type: &str,
    ) -> Result<String, StorageError> {
        let base = self.base_folder().await;
        let remote_path = if base.is_empty() {
            target_name.to_string()
        } else {
            format!("{}/{}", base, target_name)
        };

        // 保存前确保目录链存在（目标名自身不算目录）
        if let Some(parent) = std::path::Path::new(&remote_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            self.ensure_folder_path(&parent.to_string_lossy()).await?;
        }

        let total_size = tokio::fs::metadata(source).await?.len();
        if total_size <= SIMPLE_UPLOAD_LIMIT {
            self.simple_upload(source, &remote_path, mime_type).await
        } else {
            self.session_upload(source, &remote_path, total_size).await
        }
    }

    async fn get_file_stream(&self, stored_path: &str) -> Result<ByteStream, StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;
        let response = self
            .client
            .get(format!("{}/items/{}/content", drive_base, stored_path))
            .bearer_auth(&token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                stored_path,
            ));
        }
        Ok(response_stream(response))
    }

    async fn get_preview_url(&self, stored_path: &str) -> Result<String, StorageError> {
        let item = self.fetch_item(stored_path).await?;
        Ok(item.download_url.unwrap_or_default())
    }

    async fn delete_file(&self, stored_path: &str) -> Result<(), StorageError> {
        let token = self.ensure_token().await?;
        let drive_base = self.drive_base().await;
        let response = self
            .client
            .delete(format!("{}/items/{}", drive_base, stored_path))
            .bearer_auth(&token)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(StorageError::from_status(
                status,
                error_body(response).await,
                "删除网盘对象失败",
            ))
        }
    }

    async fn get_file_size(&self, stored_path: &str) -> Result<u64, StorageError> {
        let item = self.fetch_item(stored_path).await?;
        Ok(item.size)
    }

    async fn ensure_folder(&self, folder: &str) -> Result<(), StorageError> {
        let base = self.base_folder().await;
        let full = if base.is_empty() {
            folder.to_string()
        } else {
            format!("{}/{}", base, folder)
        };
        self.ensure_folder_path(&full).await
    }
}

/// 令牌是否应当视为过期（提前 5 分钟）
fn is_stale(expires_at: i64, now: i64) -> bool {
    expires_at - now <= TOKEN_STALE_MARGIN_SECS
}

/// 计算上传会话的窗口划分
///
/// 除末段外每段都是 3.2MB（320KB 对齐的整数倍，Graph 的硬性要求）
fn chunk_ranges(total_size: u64) -> Vec<std::ops::Range<u64>> {
    let mut ranges = Vec::new();
    let mut offset = 0u64;
    while offset < total_size {
        let end = std::cmp::min(offset + UPLOAD_WINDOW, total_size);
        ranges.push(offset..end);
        offset = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 构造已持有新鲜令牌的后端，跳过刷新流程直接测上传/删除路径
    async fn provider_with_token(drive_base: String) -> OauthDriveProvider {
        let db = Arc::new(crate::persistence::Database::in_memory().unwrap());
        let config = OauthDriveConfig {
            client_id: "cid".to_string(),
            client_secret: "sec".to_string(),
            refresh_token: "rt".to_string(),
            token_endpoint: format!("{}/token", drive_base),
            drive_base,
            folder: String::new(),
        };
        let provider =
            OauthDriveProvider::new("acc-1".to_string(), "测试网盘".to_string(), config, db)
                .unwrap();
        *provider.token.lock().await = Some(AccessToken {
            value: "token-1".to_string(),
            expires_at: chrono::Utc::now().timestamp() + 3600,
        });
        provider
    }

    #[test]
    fn test_staleness_margin() {
        let now = 1_700_000_000i64;
        // 4 分钟后过期：应触发刷新
        assert!(is_stale(now + 240, now));
        // 10 分钟后过期：无需刷新
        assert!(!is_stale(now + 600, now));
        // 恰好 5 分钟：按过期处理
        assert!(is_stale(now + 300, now));
    }

    #[test]
    fn test_chunk_ranges_alignment() {
        let total = 10 * 1024 * 1024u64; // 10MB
        let ranges = chunk_ranges(total);
        assert_eq!(ranges.len(), 4); // 3.2 + 3.2 + 3.2 + 0.4

        for range in &ranges[..ranges.len() - 1] {
            let size = range.end - range.start;
            assert_eq!(size, UPLOAD_WINDOW);
            assert_eq!(size % UPLOAD_ALIGNMENT, 0);
        }
        // 覆盖完整、无空洞
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().unwrap().end, total);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_chunk_ranges_small_file() {
        let ranges = chunk_ranges(1024);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], 0..1024);
    }

    #[tokio::test]
    async fn test_chunk_failure_cancels_session_exactly_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let deletes = Arc::new(AtomicUsize::new(0));
        let app = {
            let base = base.clone();
            let deletes = deletes.clone();
            axum::Router::new().fallback(move |method: Method, uri: Uri| {
                let base = base.clone();
                let deletes = deletes.clone();
                async move {
                    if method == Method::POST && uri.path().ends_with(":/createUploadSession") {
                        return (
                            StatusCode::OK,
                            format!(r#"{{"uploadUrl":"{}/upload/s1"}}"#, base),
                        )
                            .into_response();
                    }
                    if method == Method::PUT && uri.path() == "/upload/s1" {
                        return (StatusCode::SERVICE_UNAVAILABLE, "存储暂不可用").into_response();
                    }
                    if method == Method::DELETE && uri.path() == "/upload/s1" {
                        deletes.fetch_add(1, Ordering::SeqCst);
                        // 取消本身也失败，该失败必须被吞掉
                        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                    }
                    StatusCode::NOT_FOUND.into_response()
                }
            })
        };
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = provider_with_token(base).await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        tokio::fs::write(&source, vec![7u8; 2048]).await.unwrap();

        // 上抛的是分片 PUT 的错误，而不是取消会话的错误
        let err = provider
            .session_upload(&source, "big.bin", 2048)
            .await
            .unwrap_err();
        match err {
            StorageError::RemoteProtocol { status, .. } => assert_eq!(status, 503),
            other => panic!("预期 RemoteProtocol，实际: {:?}", other),
        }
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_item_is_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = provider_with_token(base).await;
        provider.delete_file("missing-item").await.unwrap();
        provider.delete_file("missing-item").await.unwrap();
    }

    #[test]
    fn test_path_url_encoding() {
        let url = OauthDriveProvider::path_url(
            "https://graph.microsoft.com/v1.0/me/drive",
            "savebox/照片.jpg",
            "content",
        );
        assert_eq!(
            url,
            "https://graph.microsoft.com/v1.0/me/drive/root:/savebox/%E7%85%A7%E7%89%87.jpg:/content"
        );
    }
}
