//! 连接器运行时统计

use chrono::{DateTime, Utc};
use hl7_core::{ConnectorRef, Direction};
use serde::Serialize;
use tokio::sync::RwLock;

/// 连接器统计信息快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub connector: ConnectorRef,
    pub direction: Direction,
    /// 待发送消息数（仅发送方）
    pub queued: u64,
    /// 发送失败消息数（仅发送方）
    pub errors: u64,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub suspended: bool,
}

impl Statistics {
    /// 队列中的消息数
    pub fn size(&self) -> u64 {
        self.queued
    }

    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// 最近一次成功处理消息的时间
    pub fn processed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    /// 最近一次错误的时间，成功处理后清除
    pub fn error_timestamp(&self) -> Option<DateTime<Utc>> {
        self.error_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

#[derive(Debug, Default, Clone)]
struct State {
    processed_at: Option<DateTime<Utc>>,
    error_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

/// 工作任务和监听器共享的运行时状态
#[derive(Debug, Default)]
pub(crate) struct RuntimeStats {
    state: RwLock<State>,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录成功处理，清除上一次错误
    pub async fn processed(&self, timestamp: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.processed_at = Some(timestamp);
        state.error_at = None;
        state.error_message = None;
    }

    pub async fn error(&self, timestamp: DateTime<Utc>, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state.error_at = Some(timestamp);
        state.error_message = Some(message.into());
    }

    /// 生成快照
    pub async fn snapshot(&self, connector: &ConnectorRef, direction: Direction, suspended: bool) -> Statistics {
        let state = self.state.read().await.clone();
        Statistics {
            connector: connector.clone(),
            direction,
            queued: 0,
            errors: 0,
            processed_at: state.processed_at,
            error_at: state.error_at,
            error_message: state.error_message,
            suspended,
        }
    }
}
