// API 处理器

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::StorageError;
use crate::ingest::ChunkProgress;
use crate::queue::{IncomingFile, QueueSnapshot, QueueStats};
use crate::server::AppState;
use crate::storage::types::{StorageAccount, StorageKind};

/// API 响应结构
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// 业务响应码
pub mod error_codes {
    /// 会话不存在
    pub const SESSION_NOT_FOUND: i32 = 2001;
    /// 分片不完整
    pub const INCOMPLETE: i32 = 2002;
    /// 账号不存在
    pub const ACCOUNT_NOT_FOUND: i32 = 2003;
    /// 配置不合法
    pub const INVALID_CONFIG: i32 = 2004;
    /// 内部错误
    pub const INTERNAL: i32 = 2100;
}

fn storage_error_response<T: Serialize>(e: StorageError) -> (StatusCode, Json<ApiResponse<T>>) {
    match &e {
        StorageError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(error_codes::SESSION_NOT_FOUND, e.to_string())),
        ),
        StorageError::Incomplete { .. } => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(error_codes::INCOMPLETE, e.to_string())),
        ),
        StorageError::InvalidConfig(_) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(error_codes::INVALID_CONFIG, e.to_string())),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

// ============================================
// 分片接收 API
// ============================================

/// 初始化接收会话请求
#[derive(Debug, Deserialize)]
pub struct InitIngestRequest {
    pub file_name: String,
    pub total_chunks: u32,
    pub mime_type: String,
    pub total_size: u64,
}

/// 初始化接收会话响应
#[derive(Debug, Serialize)]
pub struct InitIngestResponse {
    pub session_id: String,
}

/// POST /api/v1/ingest/init
pub async fn init_ingest(
    State(state): State<AppState>,
    Json(request): Json<InitIngestRequest>,
) -> (StatusCode, Json<ApiResponse<InitIngestResponse>>) {
    match state
        .ingest
        .init(
            request.file_name,
            request.total_chunks,
            request.mime_type,
            request.total_size,
        )
        .await
    {
        Ok(session_id) => (
            StatusCode::OK,
            Json(ApiResponse::success(InitIngestResponse { session_id })),
        ),
        Err(e) => storage_error_response(e),
    }
}

/// PUT /api/v1/ingest/:session_id/chunks/:index
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse<ChunkProgress>>) {
    match state.ingest.put_chunk(&session_id, index, &body).await {
        Ok(progress) => (StatusCode::OK, Json(ApiResponse::success(progress))),
        Err(e) => storage_error_response(e),
    }
}

/// 完成接收请求
#[derive(Debug, Default, Deserialize)]
pub struct CompleteIngestRequest {
    /// 批次说明（作为目录名来源）
    #[serde(default)]
    pub caption: Option<String>,
}

/// 完成接收响应
#[derive(Debug, Serialize)]
pub struct CompleteIngestResponse {
    pub file_name: String,
    pub total_size: u64,
}

/// POST /api/v1/ingest/:session_id/complete
///
/// 合并分片并把产物交给批量归集器，保存动作经传输队列异步执行
pub async fn complete_ingest(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    request: Option<Json<CompleteIngestRequest>>,
) -> (StatusCode, Json<ApiResponse<CompleteIngestResponse>>) {
    let caption = request.and_then(|Json(r)| r.caption);
    match state.ingest.complete(&session_id).await {
        Ok(assembled) => {
            let response = CompleteIngestResponse {
                file_name: assembled.file_name.clone(),
                total_size: assembled.total_size,
            };
            state.batch.submit(
                IncomingFile {
                    path: assembled.path,
                    file_name: assembled.file_name,
                    mime_type: assembled.mime_type,
                },
                caption,
            );
            (StatusCode::OK, Json(ApiResponse::success(response)))
        }
        Err(e) => storage_error_response(e),
    }
}

/// DELETE /api/v1/ingest/:session_id
pub async fn delete_ingest(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    state.ingest.delete_session(&session_id).await;
    (StatusCode::OK, Json(ApiResponse::success(())))
}

// ============================================
// 存储账号 API
// ============================================

/// 账号视图（配置密钥包不回传）
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: String,
    pub kind: StorageKind,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: i64,
    /// 名下已保存的文件数
    pub files_count: u64,
}

impl AccountView {
    fn from_account(account: StorageAccount, files_count: u64) -> Self {
        Self {
            id: account.id,
            kind: account.kind,
            display_name: account.display_name,
            is_active: account.is_active,
            created_at: account.created_at,
            files_count,
        }
    }
}

/// GET /api/v1/storage/accounts
pub async fn list_accounts(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<Vec<AccountView>>>) {
    match state.registry.list_accounts() {
        Ok(accounts) => {
            let mut views = Vec::with_capacity(accounts.len());
            for account in accounts {
                let files_count = state.db.count_files_for_account(&account.id).unwrap_or(0);
                views.push(AccountView::from_account(account, files_count));
            }
            (StatusCode::OK, Json(ApiResponse::success(views)))
        }
        Err(e) => {
            error!("查询账号列表失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
            )
        }
    }
}

/// 新增账号请求
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    /// 后端类型: object_store / webdav / oauth_drive
    pub kind: String,
    pub display_name: String,
    /// 后端配置（不透明 JSON）
    pub config: serde_json::Value,
}

/// POST /api/v1/storage/accounts
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> (StatusCode, Json<ApiResponse<AccountView>>) {
    let kind = match StorageKind::parse(&request.kind) {
        Ok(kind) => kind,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(error_codes::INVALID_CONFIG, e.to_string())),
            )
        }
    };

    match state
        .registry
        .add_account(kind, request.display_name, request.config.to_string())
    {
        Ok(account) => {
            info!("账号创建成功: {}", account.id);
            (
                StatusCode::OK,
                Json(ApiResponse::success(AccountView::from_account(account, 0))),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(error_codes::INVALID_CONFIG, e.to_string())),
        ),
    }
}

/// 重命名请求
#[derive(Debug, Deserialize)]
pub struct RenameAccountRequest {
    pub display_name: String,
}

/// PUT /api/v1/storage/accounts/:id
pub async fn rename_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameAccountRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.registry.rename_account(&id, &request.display_name) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(error_codes::ACCOUNT_NOT_FOUND, e.to_string())),
        ),
    }
}

/// DELETE /api/v1/storage/accounts/:id
pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.registry.delete_account(&id) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

/// POST /api/v1/storage/accounts/:id/activate
pub async fn activate_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.registry.activate(Some(&id)) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(error_codes::ACCOUNT_NOT_FOUND, e.to_string())),
        ),
    }
}

/// POST /api/v1/storage/activate-local
///
/// 切回内置的本地存储
pub async fn activate_local(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.registry.activate(None) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

/// 待定账号暂存键（前端分步填写时的草稿）
const PENDING_ACCOUNT_KEY: &str = "pending_account";

/// GET /api/v1/storage/pending
pub async fn get_pending_account(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<Option<serde_json::Value>>>) {
    match state.db.get_setting(PENDING_ACCOUNT_KEY) {
        Ok(value) => {
            let parsed = value.and_then(|v| serde_json::from_str(&v).ok());
            (StatusCode::OK, Json(ApiResponse::success(parsed)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

/// PUT /api/v1/storage/pending
pub async fn stage_pending_account(
    State(state): State<AppState>,
    Json(value): Json<serde_json::Value>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.db.set_setting(PENDING_ACCOUNT_KEY, &value.to_string()) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

/// DELETE /api/v1/storage/pending
pub async fn discard_pending_account(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.db.delete_setting(PENDING_ACCOUNT_KEY) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
        ),
    }
}

// ============================================
// 分享链接 API
// ============================================

/// 创建分享链接请求
#[derive(Debug, Deserialize)]
pub struct CreateShareRequest {
    pub stored_path: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_secs: Option<u64>,
}

/// POST /api/v1/storage/share
///
/// 用当前写入后端生成分享直链，后端不支持时报 400
pub async fn create_share_link(
    State(state): State<AppState>,
    Json(request): Json<CreateShareRequest>,
) -> (StatusCode, Json<ApiResponse<crate::storage::types::ShareLink>>) {
    let provider = state.registry.active();
    let Some(share) = provider.share() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(
                error_codes::INVALID_CONFIG,
                format!("后端 {} 不支持分享链接", provider.kind()),
            )),
        );
    };

    match share
        .create_share_link(
            &request.stored_path,
            request.password.as_deref(),
            request.expires_secs,
        )
        .await
    {
        Ok(link) => (StatusCode::OK, Json(ApiResponse::success(link))),
        Err(e) => storage_error_response(e),
    }
}

// ============================================
// 传输队列 API
// ============================================

/// GET /api/v1/transfers/stats
pub async fn transfer_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<QueueStats>> {
    Json(ApiResponse::success(state.queue.stats()))
}

/// GET /api/v1/transfers/status
pub async fn transfer_status(
    State(state): State<AppState>,
) -> Json<ApiResponse<QueueSnapshot>> {
    Json(ApiResponse::success(state.queue.snapshot()))
}

// ============================================
// 健康检查
// ============================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "savebox-rust".to_string(),
    })
}
