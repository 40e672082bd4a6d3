//! 进度上报
//!
//! 多个任务并发推进，但同一会话只有一条对外可见的状态消息。
//! 同会话的编辑经过一把会话级异步锁串行化，提交顺序即生效顺序；
//! 不同会话完全并行。
//!
//! 积压感知：同会话的未完结任务数越过阈值后进入静默模式，
//! 不再逐条编辑，改为一条"后台处理中"汇总通知（30 秒内最多刷新一次）；
//! 积压清零时把这条通知原地改写成最终结果。
//!
//! 通道自身限流时记录一个全局冷却期，期间所有状态操作静默跳过。
//! 这是刻意粗粒度的熔断：被限流是连接级故障，不分会话。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::status::throttle::ProgressThrottler;

/// 限流时兜底的冷却时长
const DEFAULT_COOLDOWN_SECS: u64 = 30;

/// 状态通道错误
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("状态通道限流，建议等待 {retry_after_secs} 秒")]
    RateLimited { retry_after_secs: u64 },

    #[error("状态通道错误: {0}")]
    Channel(String),
}

/// 对外状态消息通道（消息机器人、WebSocket 推送等）
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// 发送新消息，返回消息 ID
    async fn send(&self, conversation: i64, text: &str) -> Result<i64, StatusError>;

    /// 编辑既有消息
    async fn edit(&self, conversation: i64, message: i64, text: &str) -> Result<(), StatusError>;
}

/// 把状态消息写进日志的通道（没有接消息机器人时的默认实现）
pub struct LogStatusChannel {
    next_id: AtomicI64,
}

impl LogStatusChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
        })
    }
}

#[async_trait]
impl StatusChannel for LogStatusChannel {
    async fn send(&self, conversation: i64, text: &str) -> Result<i64, StatusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!("状态 [会话 {}] #{}: {}", conversation, id, text);
        Ok(id)
    }

    async fn edit(&self, conversation: i64, message: i64, text: &str) -> Result<(), StatusError> {
        tracing::info!("状态 [会话 {}] #{} 更新: {}", conversation, message, text);
        Ok(())
    }
}

/// 会话状态
#[derive(Default)]
struct ConvState {
    /// 未完结任务数 (pending + active)
    backlog: u32,
    /// 当前在役的状态消息
    message_id: Option<i64>,
    silent: bool,
    /// 静默通知上次刷新时间 (ms)
    last_silent_refresh: u64,
    success: u32,
    failed: u32,
}

/// 进度上报器
pub struct StatusReporter {
    channel: Arc<dyn StatusChannel>,
    /// 会话级串行化锁
    lanes: DashMap<i64, Arc<Mutex<()>>>,
    states: DashMap<i64, ConvState>,
    /// 全局冷却截止时间 (ms)，0 表示未触发
    cooldown_until: AtomicI64,
    silent_threshold: u32,
    silent_cooldown: Duration,
}

impl StatusReporter {
    pub fn new(
        channel: Arc<dyn StatusChannel>,
        silent_threshold: u32,
        silent_cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            lanes: DashMap::new(),
            states: DashMap::new(),
            cooldown_until: AtomicI64::new(0),
            silent_threshold,
            silent_cooldown,
        })
    }

    fn lane(&self, conversation: i64) -> Arc<Mutex<()>> {
        self.lanes
            .entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn now_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// 全局熔断检查
    fn in_cooldown(&self) -> bool {
        (Self::now_millis() as i64) < self.cooldown_until.load(Ordering::Acquire)
    }

    /// 任务入队登记；越过阈值时切入静默模式
    pub async fn task_enqueued(&self, conversation: i64) {
        let enter_silent = {
            let mut state = self.states.entry(conversation).or_default();
            state.backlog += 1;
            if state.backlog >= self.silent_threshold && !state.silent {
                state.silent = true;
                true
            } else {
                false
            }
        };
        if enter_silent {
            debug!("会话 {} 进入静默模式", conversation);
            self.refresh_silent_notice(conversation).await;
        }
    }

    /// 单任务进度上报；静默模式下折叠为汇总通知
    pub async fn task_progress(
        &self,
        conversation: i64,
        throttler: &ProgressThrottler,
        text: &str,
    ) {
        let silent = self
            .states
            .get(&conversation)
            .map(|s| s.silent)
            .unwrap_or(false);
        if silent {
            self.refresh_silent_notice(conversation).await;
            return;
        }
        if !throttler.try_acquire() {
            return;
        }
        self.apply(conversation, text).await;
    }

    /// 任务终结登记；积压清零时原地改写为最终结果
    pub async fn task_finished(&self, conversation: i64, success: bool) {
        let summary = {
            let mut state = self.states.entry(conversation).or_default();
            if success {
                state.success += 1;
            } else {
                state.failed += 1;
            }
            state.backlog = state.backlog.saturating_sub(1);
            if state.backlog == 0 {
                let text = if state.failed == 0 {
                    format!("✓ 处理完成: 成功 {} 个", state.success)
                } else {
                    format!(
                        "处理完成: 成功 {} 个, 失败 {} 个",
                        state.success, state.failed
                    )
                };
                Some(text)
            } else {
                None
            }
        };

        if let Some(text) = summary {
            self.apply(conversation, &text).await;
            // 本轮结束，下一批重新起一条消息
            if let Some(mut state) = self.states.get_mut(&conversation) {
                *state = ConvState::default();
            }
        }
    }

    /// 刷新静默通知（30 秒内最多一次）
    async fn refresh_silent_notice(&self, conversation: i64) {
        let text = {
            let Some(mut state) = self.states.get_mut(&conversation) else {
                return;
            };
            let now = Self::now_millis();
            if now.saturating_sub(state.last_silent_refresh)
                < self.silent_cooldown.as_millis() as u64
                && state.last_silent_refresh != 0
            {
                return;
            }
            state.last_silent_refresh = now;
            format!("文件较多，后台处理中… (剩余 {} 个)", state.backlog)
        };
        self.apply(conversation, &text).await;
    }

    /// 在会话锁内执行一次发送或编辑
    ///
    /// 状态上报永不让传输失败：通道错误记日志吞掉，限流转成全局冷却
    async fn apply(&self, conversation: i64, text: &str) {
        if self.in_cooldown() {
            return;
        }
        let lane = self.lane(conversation);
        let _guard = lane.lock().await;
        if self.in_cooldown() {
            return;
        }

        let message_id = self
            .states
            .get(&conversation)
            .and_then(|s| s.message_id);

        let result = match message_id {
            Some(id) => self.channel.edit(conversation, id, text).await,
            None => match self.channel.send(conversation, text).await {
                Ok(id) => {
                    self.states
                        .entry(conversation)
                        .or_default()
                        .message_id = Some(id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {}
            Err(StatusError::RateLimited { retry_after_secs }) => {
                let wait = if retry_after_secs == 0 {
                    DEFAULT_COOLDOWN_SECS
                } else {
                    retry_after_secs
                };
                let deadline = Self::now_millis() as i64 + (wait * 1000) as i64;
                self.cooldown_until.store(deadline, Ordering::Release);
                warn!("状态通道限流，全局静默 {} 秒", wait);
            }
            Err(StatusError::Channel(e)) => {
                warn!("状态上报失败（忽略）: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Send(i64, String),
        Edit(i64, i64, String),
    }

    struct MockChannel {
        ops: SyncMutex<Vec<Op>>,
        failures: SyncMutex<VecDeque<StatusError>>,
        next_id: SyncMutex<i64>,
    }

    impl MockChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ops: SyncMutex::new(Vec::new()),
                failures: SyncMutex::new(VecDeque::new()),
                next_id: SyncMutex::new(100),
            })
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().clone()
        }
    }

    #[async_trait]
    impl StatusChannel for MockChannel {
        async fn send(&self, conversation: i64, text: &str) -> Result<i64, StatusError> {
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            let mut next = self.next_id.lock();
            *next += 1;
            self.ops.lock().push(Op::Send(conversation, text.to_string()));
            Ok(*next)
        }

        async fn edit(
            &self,
            conversation: i64,
            message: i64,
            text: &str,
        ) -> Result<(), StatusError> {
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.ops
                .lock()
                .push(Op::Edit(conversation, message, text.to_string()));
            Ok(())
        }
    }

    fn reporter(channel: Arc<MockChannel>, threshold: u32) -> Arc<StatusReporter> {
        StatusReporter::new(channel, threshold, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_progress_send_then_edit() {
        let channel = MockChannel::new();
        let reporter = reporter(channel.clone(), 9);
        let throttler = ProgressThrottler::new(Duration::from_millis(0));

        reporter.task_enqueued(7).await;
        reporter.task_progress(7, &throttler, "上传中 10%").await;
        reporter.task_progress(7, &throttler, "上传中 60%").await;
        reporter.task_finished(7, true).await;

        let ops = channel.ops();
        // 第一次发新消息，之后都是对同一条消息的编辑，顺序即提交顺序
        assert!(matches!(&ops[0], Op::Send(7, text) if text.contains("10%")));
        assert!(matches!(&ops[1], Op::Edit(7, _, text) if text.contains("60%")));
        assert!(matches!(&ops[2], Op::Edit(7, _, text) if text.contains("成功 1 个")));
        assert_eq!(ops.len(), 3);
    }

    #[tokio::test]
    async fn test_per_task_throttle() {
        let channel = MockChannel::new();
        let reporter = reporter(channel.clone(), 9);
        let throttler = ProgressThrottler::new(Duration::from_secs(3));

        reporter.task_enqueued(1).await;
        reporter.task_progress(1, &throttler, "10%").await;
        // 3 秒间隔内的第二次被节流
        reporter.task_progress(1, &throttler, "20%").await;
        assert_eq!(channel.ops().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_mode_coalesces() {
        let channel = MockChannel::new();
        let reporter = reporter(channel.clone(), 3);
        let throttler = ProgressThrottler::new(Duration::from_millis(0));

        for _ in 0..3 {
            reporter.task_enqueued(5).await;
        }
        // 静默通知只发了一条
        let ops = channel.ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Send(5, text) if text.contains("后台处理中")));

        // 静默模式下的逐条进度被折叠（30 秒冷却内不刷新）
        reporter.task_progress(5, &throttler, "10%").await;
        reporter.task_progress(5, &throttler, "20%").await;
        assert_eq!(channel.ops().len(), 1);

        // 全部完结：静默通知被原地改写成最终结果
        reporter.task_finished(5, true).await;
        reporter.task_finished(5, true).await;
        reporter.task_finished(5, false).await;
        let ops = channel.ops();
        assert_eq!(ops.len(), 2);
        assert!(
            matches!(&ops[1], Op::Edit(5, _, text) if text.contains("成功 2 个") && text.contains("失败 1 个"))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_circuit_breaker() {
        let channel = MockChannel::new();
        channel
            .failures
            .lock()
            .push_back(StatusError::RateLimited {
                retry_after_secs: 60,
            });
        let reporter = reporter(channel.clone(), 9);
        let throttler = ProgressThrottler::new(Duration::from_millis(0));

        reporter.task_enqueued(2).await;
        // 第一次操作触发限流，进入全局冷却
        reporter.task_progress(2, &throttler, "10%").await;
        assert!(channel.ops().is_empty());

        // 冷却期内一切状态操作静默跳过，不再触达通道
        reporter.task_progress(2, &throttler, "20%").await;
        reporter.task_finished(2, true).await;
        assert!(channel.ops().is_empty());
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let channel = MockChannel::new();
        let reporter = reporter(channel.clone(), 9);
        let t1 = ProgressThrottler::new(Duration::from_millis(0));
        let t2 = ProgressThrottler::new(Duration::from_millis(0));

        reporter.task_enqueued(1).await;
        reporter.task_enqueued(2).await;
        reporter.task_progress(1, &t1, "a").await;
        reporter.task_progress(2, &t2, "b").await;

        let ops = channel.ops();
        assert!(matches!(ops[0], Op::Send(1, _)));
        assert!(matches!(ops[1], Op::Send(2, _)));
    }
}
