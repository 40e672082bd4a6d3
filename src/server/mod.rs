//! Web 服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

/// 组装 API 路由
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // 分片接收 API
        .route("/ingest/init", post(handlers::init_ingest))
        .route(
            "/ingest/:session_id/chunks/:index",
            put(handlers::put_chunk),
        )
        .route(
            "/ingest/:session_id/complete",
            post(handlers::complete_ingest),
        )
        .route("/ingest/:session_id", delete(handlers::delete_ingest))
        // 存储账号 API
        .route("/storage/accounts", get(handlers::list_accounts))
        .route("/storage/accounts", post(handlers::create_account))
        .route("/storage/accounts/:id", put(handlers::rename_account))
        .route("/storage/accounts/:id", delete(handlers::delete_account))
        .route(
            "/storage/accounts/:id/activate",
            post(handlers::activate_account),
        )
        .route("/storage/activate-local", post(handlers::activate_local))
        .route("/storage/pending", get(handlers::get_pending_account))
        .route("/storage/pending", put(handlers::stage_pending_account))
        .route("/storage/pending", delete(handlers::discard_pending_account))
        .route("/storage/share", post(handlers::create_share_link))
        // 传输队列 API
        .route("/transfers/stats", get(handlers::transfer_stats))
        .route("/transfers/status", get(handlers::transfer_status))
        // 分片可达数 MB，默认 2MB 的请求体上限不够用
        .layer(axum::extract::DefaultBodyLimit::max(16 * 1024 * 1024))
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_routes)
}
