//! 事件上下文（EventContext）与单次派发的执行信息（ExecutionInfo）
//!
//! 上下文在每次 `emit` 时创建并由该次调用持有，沿中间件链按值传递，
//! 中间件可在调用 `next` 之前修改 `data` / `meta`。
//!
use crate::task::{EmitResult, TaskState};
use bon::Builder;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// 扩展元数据（字符串键 → 任意 JSON 值）
pub type Meta = HashMap<String, Value>;

/// 引擎写入的事件名键
pub const META_EVENT_NAME: &str = "eventName";
/// 引擎写入的追踪 ID 键
pub const META_TRACE_ID: &str = "traceId";

/// 事件上下文
#[derive(Builder, Clone, Debug)]
pub struct EventContext<T> {
    /// 事件负载
    pub data: T,
    /// 应用级共享上下文（可选）
    pub global: Option<Value>,
    /// 扩展元数据
    #[builder(default)]
    pub meta: Meta,
    /// 协作式取消信号；执行期间为当前尝试的子令牌
    pub signal: Option<CancellationToken>,
    /// 本次派发的执行信息（由引擎注入）
    #[builder(skip)]
    pub execution: Option<Arc<ExecutionInfo>>,
}

impl<T> EventContext<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            global: None,
            meta: Meta::new(),
            signal: None,
            execution: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn event_name(&self) -> Option<&str> {
        self.meta.get(META_EVENT_NAME).and_then(Value::as_str)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.meta.get(META_TRACE_ID).and_then(Value::as_str)
    }

    pub fn execution(&self) -> Option<&ExecutionInfo> {
        self.execution.as_deref()
    }

    /// 处理器可轮询该方法以协作式响应取消/超时
    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// 单个处理器结果摘要（供中间件观察进度）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultSummary {
    pub index: usize,
    pub state: TaskState,
    pub error_code: Option<String>,
}

/// 单次派发的聚合执行信息，对中间件只读可见
#[derive(Debug)]
pub struct ExecutionInfo {
    event_name: String,
    trace_id: String,
    handler_count: usize,
    middleware_count: usize,
    in_progress: AtomicBool,
    results: Mutex<Vec<ResultSummary>>,
}

impl ExecutionInfo {
    pub(crate) fn new(
        event_name: &str,
        trace_id: &str,
        handler_count: usize,
        middleware_count: usize,
    ) -> Self {
        Self {
            event_name: event_name.to_string(),
            trace_id: trace_id.to_string(),
            handler_count,
            middleware_count,
            in_progress: AtomicBool::new(true),
            results: Mutex::new(Vec::with_capacity(handler_count)),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn handler_count(&self) -> usize {
        self.handler_count
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware_count
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// 已完成处理器的结果摘要（按完成顺序）
    pub fn results(&self) -> Vec<ResultSummary> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record<R>(&self, index: usize, result: &EmitResult<R>) {
        let summary = ResultSummary {
            index,
            state: result.state,
            error_code: result.error.as_ref().map(|e| e.code().to_string()),
        };
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary);
    }

    pub(crate) fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }
}
