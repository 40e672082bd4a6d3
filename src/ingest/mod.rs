//! 分片接收模块
//!
//! 客户端把大文件切片逐个上传，服务端落盘到 scratch 目录并在收齐后
//! 按索引升序合并成完整文件。合并产物交给上层保存到当前存储后端，
//! 本层不做重试（传输层的单次重试才是重试点）。
//!
//! 接收分片与远端分片上传是两套独立的切片：任何后端拿到的都是
//! 合并好的本地文件，OAuth 网盘后端再按自己的对齐要求重新切片。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// 默认的废弃会话保留时长: 24 小时
const DEFAULT_TTL_HOURS: u64 = 24;

/// 过期清扫间隔: 1 小时
const SWEEP_INTERVAL_SECS: u64 = 3600;

/// 单个接收会话的簿记
struct SessionState {
    file_name: String,
    mime_type: String,
    total_chunks: u32,
    total_size: u64,
    /// 已收到的分片索引（集合语义，重发同一索引是无操作）
    received: Mutex<HashSet<u32>>,
    created_at: i64,
}

/// put_chunk 的进度回执
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub received_count: u32,
    pub total_chunks: u32,
    pub progress_percent: u8,
}

/// 合并完成的本地产物，等待交给存储后端
#[derive(Debug)]
pub struct AssembledFile {
    /// 合并后文件的本地路径
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
}

/// 分片接收管理器
pub struct IngestManager {
    scratch_root: PathBuf,
    sessions: DashMap<String, Arc<SessionState>>,
    ttl_secs: i64,
}

impl IngestManager {
    pub fn new(scratch_root: PathBuf) -> Self {
        Self::with_ttl_hours(scratch_root, DEFAULT_TTL_HOURS)
    }

    pub fn with_ttl_hours(scratch_root: PathBuf, ttl_hours: u64) -> Self {
        Self {
            scratch_root,
            sessions: DashMap::new(),
            ttl_secs: (ttl_hours * 3600) as i64,
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.scratch_root.join(session_id)
    }

    /// 开始一个接收会话，分配 scratch 目录
    pub async fn init(
        &self,
        file_name: String,
        total_chunks: u32,
        mime_type: String,
        total_size: u64,
    ) -> Result<String, StorageError> {
        if total_chunks == 0 {
            return Err(StorageError::InvalidConfig(
                "total_chunks 必须大于 0".to_string(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.session_dir(&session_id)).await?;

        self.sessions.insert(
            session_id.clone(),
            Arc::new(SessionState {
                file_name,
                mime_type,
                total_chunks,
                total_size,
                received: Mutex::new(HashSet::new()),
                created_at: chrono::Utc::now().timestamp(),
            }),
        );
        debug!("接收会话已创建: {} ({} 分片)", session_id, total_chunks);
        Ok(session_id)
    }

    /// 写入一个分片；重发同一索引不报错也不重复计数
    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
    ) -> Result<ChunkProgress, StorageError> {
        let state = self
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StorageError::NotFound(format!("接收会话 {}", session_id)))?;

        if chunk_index >= state.total_chunks {
            return Err(StorageError::InvalidConfig(format!(
                "分片索引越界: {} >= {}",
                chunk_index, state.total_chunks
            )));
        }

        // 先落盘再记账，落盘失败时索引不会被记为已收
        let chunk_path = self.session_dir(session_id).join(format!("chunk_{}", chunk_index));
        tokio::fs::write(&chunk_path, bytes).await?;

        let received_count = {
            let mut received = state.received.lock();
            received.insert(chunk_index);
            received.len() as u32
        };

        Ok(ChunkProgress {
            received_count,
            total_chunks: state.total_chunks,
            progress_percent: progress_percent(received_count, state.total_chunks),
        })
    }

    /// 收齐后按索引升序合并，返回本地产物
    ///
    /// 缺片时报 Incomplete，已收到的分片保留，等客户端补发缺失索引
    pub async fn complete(&self, session_id: &str) -> Result<AssembledFile, StorageError> {
        let state = self
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StorageError::NotFound(format!("接收会话 {}", session_id)))?;

        let received_count = state.received.lock().len() as u32;
        if received_count != state.total_chunks {
            return Err(StorageError::Incomplete {
                received: received_count,
                total: state.total_chunks,
            });
        }

        // 合并产物放在会话目录外，删目录时不会把它一起带走
        let assembled_path = self.scratch_root.join(format!("{}.assembled", session_id));
        let dir = self.session_dir(session_id);
        {
            let mut out = tokio::fs::File::create(&assembled_path).await?;
            for index in 0..state.total_chunks {
                let chunk_path = dir.join(format!("chunk_{}", index));
                let mut chunk = tokio::fs::File::open(&chunk_path).await?;
                tokio::io::copy(&mut chunk, &mut out).await?;
            }
            out.flush().await?;
        }

        self.sessions.remove(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!("清理会话目录失败: {:?}, 错误: {}", dir, e);
        }

        info!(
            "分片合并完成: {} -> {:?} ({} bytes)",
            session_id, assembled_path, state.total_size
        );
        Ok(AssembledFile {
            path: assembled_path,
            file_name: state.file_name.clone(),
            mime_type: state.mime_type.clone(),
            total_size: state.total_size,
        })
    }

    /// 删除未完成的会话（幂等），释放 scratch 空间
    pub async fn delete_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        let dir = self.session_dir(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("删除会话目录失败: {:?}, 错误: {}", dir, e);
            }
        }
    }

    /// 清扫超过 TTL 的会话（不论是否收齐）
    ///
    /// 同时扫描 scratch 根目录：进程重启后簿记丢失，
    /// 落在磁盘上的孤儿目录靠修改时间判断过期
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(chrono::Utc::now().timestamp()).await
    }

    async fn sweep_expired_at(&self, now: i64) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now - entry.value().created_at > self.ttl_secs)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &expired {
            self.delete_session(session_id).await;
        }

        let orphans = self.sweep_orphan_dirs(now).await;
        let total = expired.len() + orphans;
        if total > 0 {
            info!("清扫过期接收会话 {} 个（含孤儿目录 {} 个）", total, orphans);
        }
        total
    }

    /// 清理簿记中不存在、且修改时间早于 TTL 的磁盘残留
    async fn sweep_orphan_dirs(&self, now: i64) -> usize {
        let mut removed = 0usize;
        let Ok(mut entries) = tokio::fs::read_dir(&self.scratch_root).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.sessions.contains_key(name.trim_end_matches(".assembled")) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(now);
            if now - modified <= self.ttl_secs {
                continue;
            }
            let result = if meta.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await
            } else {
                tokio::fs::remove_file(entry.path()).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("清理孤儿残留失败: {:?}, 错误: {}", entry.path(), e),
            }
        }
        removed
    }

    /// 启动后台清扫任务
    pub fn spawn_sweeper(manager: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.tick().await; // 首个 tick 立即返回，跳过
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });
    }
}

/// 百分比在 u64 里算，分片数巨大时 u32 的乘法会溢出
fn progress_percent(received: u32, total: u32) -> u8 {
    (received as u64 * 100 / total as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, IngestManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = IngestManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[tokio::test]
    async fn test_out_of_order_merge() {
        let (_dir, manager) = setup();

        // 4 个分片按 [2,0,3,1] 乱序提交，合并结果必须与顺序提交逐字节一致
        let chunks: Vec<Vec<u8>> = vec![
            vec![b'a'; 300],
            vec![b'b'; 300],
            vec![b'c'; 300],
            vec![b'd'; 100],
        ];
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();

        let session = manager
            .init("big.bin".to_string(), 4, "application/octet-stream".to_string(), total)
            .await
            .unwrap();

        for index in [2u32, 0, 3, 1] {
            manager
                .put_chunk(&session, index, &chunks[index as usize])
                .await
                .unwrap();
        }

        let assembled = manager.complete(&session).await.unwrap();
        let bytes = tokio::fs::read(&assembled.path).await.unwrap();
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(bytes, expected);
        assert_eq!(assembled.file_name, "big.bin");

        // 会话目录已清理
        assert!(manager.complete(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_idempotent_resend() {
        let (_dir, manager) = setup();
        let session = manager
            .init("a.bin".to_string(), 2, "application/octet-stream".to_string(), 6)
            .await
            .unwrap();

        let progress = manager.put_chunk(&session, 0, b"abc").await.unwrap();
        assert_eq!(progress.received_count, 1);
        assert_eq!(progress.progress_percent, 50);

        // 重发同一索引：计数不变
        let progress = manager.put_chunk(&session, 0, b"abc").await.unwrap();
        assert_eq!(progress.received_count, 1);

        let progress = manager.put_chunk(&session, 1, b"def").await.unwrap();
        assert_eq!(progress.received_count, 2);
        assert_eq!(progress.progress_percent, 100);
    }

    #[tokio::test]
    async fn test_incomplete_rejected() {
        let (_dir, manager) = setup();
        let session = manager
            .init("a.bin".to_string(), 3, "text/plain".to_string(), 9)
            .await
            .unwrap();
        manager.put_chunk(&session, 0, b"aaa").await.unwrap();
        manager.put_chunk(&session, 2, b"ccc").await.unwrap();

        match manager.complete(&session).await {
            Err(StorageError::Incomplete { received, total }) => {
                assert_eq!(received, 2);
                assert_eq!(total, 3);
            }
            other => panic!("预期 Incomplete，实际: {:?}", other.map(|a| a.file_name)),
        }

        // 补发缺失分片后可以完成
        manager.put_chunk(&session, 1, b"bbb").await.unwrap();
        let assembled = manager.complete(&session).await.unwrap();
        assert_eq!(tokio::fs::read(&assembled.path).await.unwrap(), b"aaabbbccc");
    }

    #[test]
    fn test_progress_percent_huge_chunk_counts() {
        // 接近 u32 上限的分片数也不能在乘 100 时溢出
        assert_eq!(progress_percent(50_000_000, 100_000_000), 50);
        assert_eq!(progress_percent(u32::MAX, u32::MAX), 100);
        assert_eq!(progress_percent(0, u32::MAX), 0);
        assert_eq!(progress_percent(1, 3), 33);
    }

    #[tokio::test]
    async fn test_chunk_index_bounds() {
        let (_dir, manager) = setup();
        let session = manager
            .init("a.bin".to_string(), 2, "text/plain".to_string(), 4)
            .await
            .unwrap();
        assert!(manager.put_chunk(&session, 2, b"xx").await.is_err());
        assert!(manager.put_chunk("不存在的会话", 0, b"xx").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_session_idempotent() {
        let (_dir, manager) = setup();
        let session = manager
            .init("a.bin".to_string(), 1, "text/plain".to_string(), 1)
            .await
            .unwrap();
        manager.delete_session(&session).await;
        manager.delete_session(&session).await;
        assert!(manager.put_chunk(&session, 0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (_dir, manager) = setup();
        let session = manager
            .init("a.bin".to_string(), 1, "text/plain".to_string(), 1)
            .await
            .unwrap();

        // 未到 TTL：不清扫
        assert_eq!(manager.sweep_expired().await, 0);

        // 把时钟拨到 TTL 之后
        let future = chrono::Utc::now().timestamp() + (DEFAULT_TTL_HOURS * 3600) as i64 + 60;
        assert_eq!(manager.sweep_expired_at(future).await, 1);
        assert!(manager.put_chunk(&session, 0, b"x").await.is_err());
    }
}
