//! 批量归集
//!
//! 同一波到达的多个文件（相册、成组消息）在去抖窗口内归集为一个批次：
//! 批次名取说明文字，没有就用时间戳；目标目录只创建一次，
//! 然后每个文件独立入队，各自适用单次重试策略。
//! 所有成员任务进入终态，批次才算完成。

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::persistence::Database;
use crate::queue::manager::{with_retry_once, TaskFn, TransferQueue};
use crate::status::{ProgressThrottler, StatusReporter};
use crate::storage::types::FileRecord;
use crate::storage::ProviderRegistry;

/// HTTP 入口没有会话概念，状态统一挂在 0 号会话
const HTTP_CONVERSATION: i64 = 0;

/// 批次名最大长度（取自说明文字时截断）
const FOLDER_NAME_MAX_CHARS: usize = 50;

/// 等待保存的本地文件
#[derive(Debug)]
pub struct IncomingFile {
    /// 本地临时路径（保存成功后删除）
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
}

/// 文件落地后的元信息探测（缩略图、尺寸等）
///
/// 尽力而为：探测失败只记日志，绝不中断传输
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn inspect(&self, path: &std::path::Path, mime_type: &str) -> anyhow::Result<()>;
}

/// 默认探测器：只记录基础信息
pub struct LoggingProbe;

#[async_trait]
impl MetadataProbe for LoggingProbe {
    async fn inspect(&self, path: &std::path::Path, mime_type: &str) -> anyhow::Result<()> {
        let size = tokio::fs::metadata(path).await?.len();
        debug!("文件探测: {:?}, 类型={}, 大小={} bytes", path, mime_type, size);
        Ok(())
    }
}

struct PendingBatch {
    files: Vec<IncomingFile>,
    caption: Option<String>,
}

/// 批量归集器
pub struct BatchCollector {
    registry: Arc<ProviderRegistry>,
    db: Arc<Database>,
    queue: Arc<TransferQueue>,
    probe: Arc<dyn MetadataProbe>,
    reporter: Option<Arc<StatusReporter>>,
    /// 单任务进度编辑的最小间隔
    edit_interval: Duration,
    /// 去抖窗口（首个文件到达后开始计时）
    window: Duration,
    pending: Mutex<Option<PendingBatch>>,
}

impl BatchCollector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        db: Arc<Database>,
        queue: Arc<TransferQueue>,
        window: Duration,
    ) -> Arc<Self> {
        Self::with_reporter(registry, db, queue, window, None, Duration::from_secs(3))
    }

    pub fn with_reporter(
        registry: Arc<ProviderRegistry>,
        db: Arc<Database>,
        queue: Arc<TransferQueue>,
        window: Duration,
        reporter: Option<Arc<StatusReporter>>,
        edit_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            db,
            queue,
            probe: Arc::new(LoggingProbe),
            reporter,
            edit_interval,
            window,
            pending: Mutex::new(None),
        })
    }

    /// 提交一个文件；窗口内的后续文件并入同一批次
    pub fn submit(self: &Arc<Self>, file: IncomingFile, caption: Option<String>) {
        let mut guard = self.pending.lock();
        match guard.as_mut() {
            Some(batch) => {
                batch.files.push(file);
                if batch.caption.is_none() {
                    batch.caption = caption;
                }
            }
            None => {
                *guard = Some(PendingBatch {
                    files: vec![file],
                    caption,
                });
                let collector = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(collector.window).await;
                    collector.flush().await;
                });
            }
        }
    }

    /// 窗口到期：把归集到的文件作为一个批次下发
    async fn flush(self: Arc<Self>) {
        let Some(batch) = self.pending.lock().take() else {
            return;
        };

        let file_count = batch.files.len();
        // 单文件不建目录，成组的才归入批次目录
        let folder = if file_count > 1 {
            Some(folder_name(batch.caption.as_deref()))
        } else {
            None
        };

        let provider = self.registry.active();
        if let Some(folder) = &folder {
            if let Err(e) = provider.ensure_folder(folder).await {
                // 目录创建失败不拦截批次，交由每个文件的保存自行暴露问题
                warn!("批次目录创建失败: {}, 错误: {}", folder, e);
            }
            info!("批次开始: {} ({} 个文件)", folder, file_count);
        }

        let remaining = Arc::new(AtomicUsize::new(file_count));
        let batch_label = folder.clone().unwrap_or_else(|| "单文件".to_string());
        let account_id = self.registry.active_id();

        for file in batch.files {
            // 探测尽力而为
            if let Err(e) = self.probe.inspect(&file.path, &file.mime_type).await {
                debug!("文件探测失败（忽略）: {:?}, 错误: {}", file.path, e);
            }

            let label = file.file_name.clone();
            let work = self.build_task(file, folder.clone(), account_id.clone());
            let remaining = remaining.clone();
            let batch_label = batch_label.clone();
            let reporter = self.reporter.clone();
            let edit_interval = self.edit_interval;

            if let Some(reporter) = &reporter {
                reporter.task_enqueued(HTTP_CONVERSATION).await;
            }

            // 外层再包一层：进度上报 + 批次完成判定
            let progress_label = label.clone();
            let wrapped: TaskFn = Box::new(move || {
                Box::pin(async move {
                    let throttler = ProgressThrottler::new(edit_interval);
                    if let Some(reporter) = &reporter {
                        reporter
                            .task_progress(
                                HTTP_CONVERSATION,
                                &throttler,
                                &format!("正在保存: {}", progress_label),
                            )
                            .await;
                    }
                    let result = work().await;
                    if let Some(reporter) = &reporter {
                        reporter
                            .task_finished(HTTP_CONVERSATION, result.is_ok())
                            .await;
                    }
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        info!("批次完成: {}", batch_label);
                    }
                    result
                })
            });
            self.queue.add(label, wrapped);
        }
    }

    /// 组装单个文件的工作单元（保存 + 元数据落库，整体作为重试单元）
    fn build_task(
        &self,
        file: IncomingFile,
        folder: Option<String>,
        account_id: Option<String>,
    ) -> TaskFn {
        let provider = self.registry.active();
        let db = self.db.clone();
        let path = file.path.clone();
        let file_name = file.file_name.clone();
        let mime_type = file.mime_type.clone();
        let target = match &folder {
            Some(folder) => format!("{}/{}", folder, file.file_name),
            None => file.file_name.clone(),
        };

        let attempt = {
            let provider = provider.clone();
            let db = db.clone();
            let path = path.clone();
            let file_name = file_name.clone();
            let mime_type = mime_type.clone();
            let folder = folder.clone();
            let account_id = account_id.clone();
            let target = target.clone();
            move || {
                let provider = provider.clone();
                let db = db.clone();
                let path = path.clone();
                let file_name = file_name.clone();
                let mime_type = mime_type.clone();
                let folder = folder.clone();
                let account_id = account_id.clone();
                let target = target.clone();
                async move {
                    let size = tokio::fs::metadata(&path).await?.len();
                    let stored = provider.save_file(&path, &target, &mime_type).await?;
                    let record = FileRecord::new(
                        file_name,
                        stored,
                        Some(mime_type),
                        size,
                        folder,
                        account_id,
                    );
                    db.insert_file_record(&record)
                        .map_err(|e| StorageError::Other(e.to_string()))?;
                    Ok(())
                }
            }
        };

        // 重试之间没有本地半成品要清理（远端半成品由后端自身的原子语义兜底）
        let retried = with_retry_once(attempt, || async {});

        // 终态后移除本地源文件；本地后端是移动语义，文件可能已不在，忽略 NotFound
        Box::new(move || {
            Box::pin(async move {
                let result = retried().await;
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("清理本地源文件失败: {:?}, 错误: {}", path, e);
                    }
                }
                result
            })
        })
    }
}

/// 计算批次目录名：说明文字优先，否则时间戳
fn folder_name(caption: Option<&str>) -> String {
    match caption.map(str::trim).filter(|s| !s.is_empty()) {
        Some(caption) => caption
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .take(FOLDER_NAME_MAX_CHARS)
            .collect(),
        None => format!("batch_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, Arc<BatchCollector>, Arc<TransferQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let registry =
            Arc::new(ProviderRegistry::new(db.clone(), dir.path().join("managed")).unwrap());
        let queue = TransferQueue::new(2, 50);
        let collector = BatchCollector::new(
            registry,
            db,
            queue.clone(),
            Duration::from_millis(50),
        );
        (dir, collector, queue)
    }

    async fn incoming(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> IncomingFile {
        let path = dir.path().join(format!("in_{}", name));
        tokio::fs::write(&path, content).await.unwrap();
        IncomingFile {
            path,
            file_name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
        }
    }

    #[tokio::test]
    async fn test_grouped_files_share_folder() {
        let (dir, collector, queue) = setup().await;

        let a = incoming(&dir, "a.bin", b"aa").await;
        let b = incoming(&dir, "b.bin", b"bb").await;
        let c = incoming(&dir, "c.bin", b"cc").await;
        collector.submit(a, Some("旅行照片".to_string()));
        collector.submit(b, None);
        collector.submit(c, None);

        // 等窗口关闭 + 队列排空
        tokio::time::sleep(Duration::from_millis(120)).await;
        queue.wait_idle().await;

        let managed = dir.path().join("managed").join("旅行照片");
        assert!(managed.join("a.bin").exists());
        assert!(managed.join("b.bin").exists());
        assert!(managed.join("c.bin").exists());
        assert_eq!(queue.stats().total_success, 3);
    }

    #[tokio::test]
    async fn test_single_file_skips_folder() {
        let (dir, collector, queue) = setup().await;

        let file = incoming(&dir, "solo.bin", b"x").await;
        let source = file.path.clone();
        collector.submit(file, None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        queue.wait_idle().await;

        assert!(dir.path().join("managed").join("solo.bin").exists());
        // 源文件已被消费
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_windows_split_batches() {
        let (dir, collector, queue) = setup().await;

        let a = incoming(&dir, "a.bin", b"1").await;
        collector.submit(a, None);
        // 超过窗口后再提交，应各自成批
        tokio::time::sleep(Duration::from_millis(120)).await;
        let b = incoming(&dir, "b.bin", b"2").await;
        collector.submit(b, None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        queue.wait_idle().await;

        // 都是单文件批次，直接落在根目录
        assert!(dir.path().join("managed").join("a.bin").exists());
        assert!(dir.path().join("managed").join("b.bin").exists());
    }

    #[test]
    fn test_folder_name_sanitizing() {
        assert_eq!(folder_name(Some("a/b:c")), "a_b_c");
        assert_eq!(folder_name(Some("  旅行  ")), "旅行");
        assert!(folder_name(None).starts_with("batch_"));
        assert!(folder_name(Some("   ")).starts_with("batch_"));
    }
}
