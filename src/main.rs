use savebox_rust::{config::LogConfig, logging, server, AppConfig, AppState};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config() -> LogConfig {
    let config_path = savebox_rust::config::CONFIG_PATH;
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 先初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    info!("SaveBox Rust v0.9.2 启动中...");

    // 加载配置并装配应用状态
    let config = AppConfig::load().await?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config).await?;

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let app = server::build_router(app_state.clone()).layer(middleware);

    info!("服务器启动: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("服务器异常退出: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 排空进行中的传输再退出
    info!("等待传输队列排空...");
    app_state.queue.wait_idle().await;
    info!("应用已安全退出");

    Ok(())
}
