//! 外部协作者接口
//!
//! 引擎只向外调用这些接口，不实现其策略：
//! - `EventStore`：保存每个处理器调用的记录；
//! - `ErrorSink`：重试耗尽或不可重试的失败（死信队列、告警）；
//! - `NoHandlersObserver`：事件无人订阅时的通知；
//! - `Plugin`：仅通过公开的订阅接口安装/卸载。
//!
//! 协作者的失败均由引擎捕获并记录日志，不会影响派发结果。
//!
use crate::context::EventContext;
use crate::engine::EventEngine;
use crate::error::EventError;
use crate::task::TaskState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 单个处理器调用的审计记录（借用派发期间的数据）
#[derive(Debug)]
pub struct EventRecord<'a, T, R> {
    pub event_name: &'a str,
    pub handler_index: usize,
    pub context: &'a EventContext<T>,
    pub result: Option<&'a R>,
    pub error: Option<&'a EventError>,
    pub state: TaskState,
    pub trace_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// 事件记录存储
#[async_trait]
pub trait EventStore<T, R>: Send + Sync {
    async fn save(&self, record: &EventRecord<'_, T, R>) -> anyhow::Result<()>;
}

/// 错误分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// 可重试但已达到最大重试次数
    RetriesExhausted,
    /// 重试判定拒绝
    NonRetryable,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::NonRetryable => "non_retryable",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败接收端
#[async_trait]
pub trait ErrorSink<T>: Send + Sync {
    async fn handle(
        &self,
        error: &EventError,
        context: &EventContext<T>,
        error_type: ErrorType,
    ) -> anyhow::Result<()>;
}

/// “无处理器”通知
pub trait NoHandlersObserver: Send + Sync {
    fn no_handlers(&self, event_name: &str, trace_id: &str);
}

/// 插件：通过引擎公开接口安装，不获得特权访问
pub trait Plugin<T, R>: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, engine: &EventEngine<T, R>) -> anyhow::Result<()>;

    fn uninstall(&self, _engine: &EventEngine<T, R>) -> anyhow::Result<()> {
        Ok(())
    }
}
