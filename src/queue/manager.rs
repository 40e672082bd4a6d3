//! 有界并发的传输调度器
//!
//! 单级 FIFO：add 入队后立即尝试准入，active 数量低于上限时弹出队头执行；
//! 任何任务终结（成功或失败）都再触发一次准入，保证调度不空转也不饿死。
//! 队列本身不重试，单次重试是调用方包在工作单元外面的策略（with_retry_once）。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::queue::task::TransferTask;

/// 工作单元的执行结果
pub type TaskResult = Result<(), StorageError>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// 入队的工作单元（惰性构造 future，准入时才开始执行）
pub type TaskFn = Box<dyn FnOnce() -> TaskFuture + Send>;

struct PendingEntry {
    task: TransferTask,
    work: TaskFn,
}

struct Inner {
    pending: VecDeque<PendingEntry>,
    active: HashMap<String, TransferTask>,
    /// 最近的终态任务，新的在前
    history: VecDeque<TransferTask>,
    total_success: u64,
    total_failed: u64,
}

/// 队列统计
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub total_success: u64,
    pub total_failed: u64,
    pub max_concurrent: usize,
}

/// 队列明细快照
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<TransferTask>,
    pub active: Vec<TransferTask>,
    pub history: Vec<TransferTask>,
}

/// 传输队列
pub struct TransferQueue {
    inner: Mutex<Inner>,
    max_concurrent: usize,
    history_limit: usize,
    /// 任务终结时唤醒 wait_idle 的等待方
    drained: Notify,
}

impl TransferQueue {
    pub fn new(max_concurrent: usize, history_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                active: HashMap::new(),
                history: VecDeque::new(),
                total_success: 0,
                total_failed: 0,
            }),
            max_concurrent: max_concurrent.max(1),
            history_limit,
            drained: Notify::new(),
        })
    }

    /// 入队并立即尝试准入，返回任务 ID
    pub fn add(self: &Arc<Self>, label: String, work: TaskFn) -> String {
        let task = TransferTask::new(label);
        let id = task.id.clone();
        debug!("任务入队: {} ({})", task.label, id);

        self.inner.lock().pending.push_back(PendingEntry { task, work });
        self.try_admit();
        id
    }

    /// 准入循环：有空位且有待处理任务时弹出队头执行
    fn try_admit(self: &Arc<Self>) {
        loop {
            let job = {
                let mut inner = self.inner.lock();
                if inner.active.len() >= self.max_concurrent {
                    None
                } else if let Some(mut entry) = inner.pending.pop_front() {
                    entry.task.mark_active();
                    inner.active.insert(entry.task.id.clone(), entry.task.clone());
                    Some((entry.task, entry.work))
                } else {
                    None
                }
            };

            let Some((task, work)) = job else { break };
            let queue = self.clone();
            tokio::spawn(async move {
                debug!("任务开始: {} ({})", task.label, task.id);
                let result = work().await;
                queue.finish(&task.id, result);
                // 终结后补一次准入，空位不留
                queue.try_admit();
            });
        }
    }

    /// 把任务从 active 挪进历史环
    fn finish(&self, task_id: &str, result: TaskResult) {
        let mut inner = self.inner.lock();
        let Some(mut task) = inner.active.remove(task_id) else {
            return;
        };

        match result {
            Ok(()) => {
                task.mark_success();
                inner.total_success += 1;
                info!("任务完成: {} ({})", task.label, task.id);
            }
            Err(e) => {
                task.mark_failed(e.to_string());
                inner.total_failed += 1;
                warn!("任务失败: {} ({}): {}", task.label, task.id, e);
            }
        }

        inner.history.push_front(task);
        inner.history.truncate(self.history_limit);
        drop(inner);
        self.drained.notify_waiters();
    }

    /// 汇总统计
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            active: inner.active.len(),
            total_success: inner.total_success,
            total_failed: inner.total_failed,
            max_concurrent: self.max_concurrent,
        }
    }

    /// 待处理 + 执行中的任务总量
    pub fn backlog(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.active.len()
    }

    /// 明细快照（pending 按队列顺序，history 新的在前）
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock();
        QueueSnapshot {
            pending: inner.pending.iter().map(|e| e.task.clone()).collect(),
            active: inner.active.values().cloned().collect(),
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// 等待队列完全排空（测试与优雅停机用）
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.backlog() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 给工作单元包上"最多重试一次"的策略
///
/// 首次失败且错误可重试时：先清理残留产物，再完整重跑一次；
/// 第二次仍失败（或错误不可重试）则清理后原样上抛。
/// 注意 cleanup 只负责清理半成品，不能动重跑还需要的源文件。
pub fn with_retry_once<F, Fut, C, CFut>(attempt: F, cleanup: C) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
    C: Fn() -> CFut + Send + Sync + 'static,
    CFut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || {
        Box::pin(async move {
            match attempt().await {
                Ok(()) => Ok(()),
                Err(first) if first.is_retriable() => {
                    warn!("首次尝试失败，清理后重试一次: {}", first);
                    cleanup().await;
                    match attempt().await {
                        Ok(()) => Ok(()),
                        Err(second) => {
                            cleanup().await;
                            Err(second)
                        }
                    }
                }
                Err(e) => {
                    cleanup().await;
                    Err(e)
                }
            }
        })
    })
}
