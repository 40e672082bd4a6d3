// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 传输队列配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 状态通知配置
    #[serde(default)]
    pub status: StatusConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8520
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据目录（SQLite 数据库、本地存储根目录）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 分片接收的临时目录
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// 分片会话的存活时长（小时），超时后被清扫
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("data/scratch")
}

fn default_session_ttl_hours() -> u64 {
    24
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scratch_dir: default_scratch_dir(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

/// 传输队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 最大并发传输任务数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 历史记录保留条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 批量收集的去抖窗口（毫秒）
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_history_limit() -> usize {
    50
}

fn default_batch_window_ms() -> u64 {
    1500
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            history_limit: default_history_limit(),
            batch_window_ms: default_batch_window_ms(),
        }
    }
}

/// 状态通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// 积压超过该阈值进入静默模式
    #[serde(default = "default_silent_threshold")]
    pub silent_threshold: usize,
    /// 静默模式下汇总通知的冷却时间（秒）
    #[serde(default = "default_silent_cooldown_secs")]
    pub silent_cooldown_secs: u64,
    /// 单任务进度编辑的最小间隔（秒）
    #[serde(default = "default_edit_interval_secs")]
    pub edit_interval_secs: u64,
}

fn default_silent_threshold() -> usize {
    9
}

fn default_silent_cooldown_secs() -> u64 {
    30
}

fn default_edit_interval_secs() -> u64 {
    3
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            silent_threshold: default_silent_threshold(),
            silent_cooldown_secs: default_silent_cooldown_secs(),
            edit_interval_secs: default_edit_interval_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            status: StatusConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// 默认配置文件路径
pub const CONFIG_PATH: &str = "config/app.toml";

impl AppConfig {
    /// 从默认路径加载，文件不存在时写出默认配置
    pub async fn load() -> Result<Self> {
        Self::load_from(CONFIG_PATH).await
    }

    /// 从指定路径加载配置
    pub async fn load_from(path: &str) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                config.save_to(path).await?;
                tracing::info!("配置文件不存在，已写出默认配置: {}", path);
                Ok(config)
            }
            Err(e) => Err(e).context("读取配置文件失败"),
        }
    }

    /// 保存配置到指定路径
    pub async fn save_to(&self, path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content).await.context("写出配置文件失败")?;
        Ok(())
    }
}
