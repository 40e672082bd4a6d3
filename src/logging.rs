//! 日志系统配置
//!
//! 控制台输出 + 按天滚动的文件输出，启动时自动清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "savebox-rust";

/// 日志系统守卫
/// 必须保持存活，否则文件写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}, 回退到仅控制台输出", config.log_dir, e);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    // 按天滚动，文件名格式: savebox-rust.YYYY-MM-DD.log
    let file_appender = tracing_appender::rolling::daily(
        &config.log_dir,
        format!("{}.log", LOG_FILE_PREFIX),
    );
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件
///
/// 文件格式: savebox-rust.log.YYYY-MM-DD（tracing-appender 的按天滚动命名）
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let retention = chrono::Duration::days(retention_days as i64);
    let now = Local::now().date_naive();

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let filename = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if !filename.starts_with(LOG_FILE_PREFIX) {
            continue;
        }

        let expired = match extract_date_suffix(filename) {
            Some(date_str) => {
                match chrono::NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") {
                    Ok(file_date) => now.signed_duration_since(file_date) > retention,
                    Err(_) => false,
                }
            }
            // 无日期后缀的是当前文件，不清理
            None => false,
        };

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
}

/// 从文件名中提取日期后缀
///
/// savebox-rust.log.2025-01-31 -> 2025-01-31
fn extract_date_suffix(filename: &str) -> Option<String> {
    let suffix = filename.rsplit('.').next()?;
    // 粗略校验 YYYY-MM-DD 形状
    if suffix.len() == 10 && suffix.chars().filter(|c| *c == '-').count() == 2 {
        Some(suffix.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_date_suffix() {
        assert_eq!(
            extract_date_suffix("savebox-rust.log.2025-01-31"),
            Some("2025-01-31".to_string())
        );
        // 当前文件没有日期后缀
        assert_eq!(extract_date_suffix("savebox-rust.log"), None);
    }

    #[test]
    fn test_cleanup_skips_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("savebox-rust.log");
        std::fs::write(&current, b"log line\n").unwrap();

        cleanup_old_logs(dir.path(), 7);
        assert!(current.exists());
    }

    #[test]
    fn test_cleanup_removes_expired_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("savebox-rust.log.2000-01-01");
        let fresh = dir
            .path()
            .join(format!("savebox-rust.log.{}", Local::now().format("%Y-%m-%d")));
        std::fs::write(&old, b"old\n").unwrap();
        std::fs::write(&fresh, b"fresh\n").unwrap();

        cleanup_old_logs(dir.path(), 7);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
