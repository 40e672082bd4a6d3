//! 传输任务的状态机
//!
//! pending -(准入)-> active -(成功)-> success / -(失败)-> failed
//! 状态只向前推进，时间戳单调

use serde::Serialize;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Success,
    Failed,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// 传输任务的可观测快照
#[derive(Debug, Clone, Serialize)]
pub struct TransferTask {
    /// 任务 ID
    pub id: String,
    /// 展示标签（一般是文件名）
    pub label: String,
    pub status: TaskStatus,
    /// 入队时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始执行时间
    pub started_at: Option<i64>,
    /// 终态时间
    pub ended_at: Option<i64>,
    /// 失败原因
    pub error: Option<String>,
}

impl TransferTask {
    pub fn new(label: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// 标记开始执行
    pub fn mark_active(&mut self) {
        self.status = TaskStatus::Active;
        self.started_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记成功
    pub fn mark_success(&mut self) {
        self.status = TaskStatus::Success;
        self.ended_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(chrono::Utc::now().timestamp());
    }
}
