//! 应用状态
//!
//! 启动时装配好的共享组件，handler 通过 State 提取

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::config::AppConfig;
use crate::ingest::IngestManager;
use crate::persistence::Database;
use crate::queue::{BatchCollector, TransferQueue};
use crate::status::{LogStatusChannel, StatusReporter};
use crate::storage::ProviderRegistry;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
    /// 数据库
    pub db: Arc<Database>,
    /// 存储账号注册表
    pub registry: Arc<ProviderRegistry>,
    /// 分片接收管理器
    pub ingest: Arc<IngestManager>,
    /// 传输队列
    pub queue: Arc<TransferQueue>,
    /// 批量归集器
    pub batch: Arc<BatchCollector>,
    /// 进度上报器
    pub reporter: Arc<StatusReporter>,
}

impl AppState {
    /// 按配置装配全部组件
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage.data_dir).await?;
        tokio::fs::create_dir_all(&config.storage.scratch_dir).await?;

        let db = Arc::new(Database::new(&config.storage.data_dir.join("savebox.db"))?);
        let registry = Arc::new(ProviderRegistry::new(
            db.clone(),
            config.storage.data_dir.join("files"),
        )?);
        let ingest = Arc::new(IngestManager::with_ttl_hours(
            config.storage.scratch_dir.clone(),
            config.storage.session_ttl_hours,
        ));
        let queue = TransferQueue::new(
            config.transfer.max_concurrent,
            config.transfer.history_limit,
        );
        // 未接入消息机器人时状态消息落在日志里
        let reporter = StatusReporter::new(
            LogStatusChannel::new(),
            config.status.silent_threshold as u32,
            Duration::from_secs(config.status.silent_cooldown_secs),
        );
        let batch = BatchCollector::with_reporter(
            registry.clone(),
            db.clone(),
            queue.clone(),
            Duration::from_millis(config.transfer.batch_window_ms),
            Some(reporter.clone()),
            Duration::from_secs(config.status.edit_interval_secs),
        );

        // 过期分片会话的后台清扫
        IngestManager::spawn_sweeper(ingest.clone());

        info!("应用状态初始化完成");
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            db,
            registry,
            ingest,
            queue,
            batch,
            reporter,
        })
    }
}
