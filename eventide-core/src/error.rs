//! 统一错误定义
//!
//! - `EventError`：单个处理器调用的归一化错误（code / message / stack / cause），
//!   通过稳定的 `code` 区分取消、超时等情形，调用方无需匹配消息文本；
//! - `EmitError`：`emit` 自身的失败，仅在派发开始前的参数校验阶段
//!   （或显式开启 `rethrow` 时的编排级失败）返回。
//!
use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 约定的错误码
pub mod codes {
    pub const UNKNOWN: &str = "UNKNOWN";
    pub const CANCELLED: &str = "CANCELLED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const VALIDATION: &str = "VALIDATION";
    pub const NEXT_CALLED_MULTIPLE_TIMES: &str = "NEXT_CALLED_MULTIPLE_TIMES";
    pub const PANIC: &str = "PANIC";
}

/// 归一化后的事件错误
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct EventError {
    code: Cow<'static, str>,
    message: String,
    stack: Option<String>,
    cause: Option<Arc<anyhow::Error>>,
}

impl EventError {
    pub fn new(code: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(codes::UNKNOWN, message)
    }

    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "task was cancelled")
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(codes::TIMEOUT, format!("timed out after {after:?}"))
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION, reason)
    }

    pub fn next_called_multiple_times() -> Self {
        Self::new(
            codes::NEXT_CALLED_MULTIPLE_TIMES,
            "next() called multiple times in one middleware frame",
        )
    }

    /// 将 panic 负载（通常是 `&str` / `String`）归一化
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };

        Self::new(codes::PANIC, message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// 原始错误（若由 `anyhow::Error` 归一化而来）
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == codes::CANCELLED
    }

    pub fn is_timeout(&self) -> bool {
        self.code == codes::TIMEOUT
    }
}

/// 归一化规则：
/// - 错误本身是 `EventError`：原样保留；
/// - 错误链中包含 `EventError`（例如被 `.context(..)` 包装）：沿用其 code，消息取最外层；
/// - 其他错误：code 为 `UNKNOWN`。
impl From<anyhow::Error> for EventError {
    fn from(err: anyhow::Error) -> Self {
        // 只看最外层：`downcast_ref` 会穿透 context 包装
        let outermost = err.chain().next().and_then(|e| e.downcast_ref::<EventError>());
        if let Some(inner) = outermost {
            return inner.clone();
        }

        let code = err
            .chain()
            .find_map(|e| e.downcast_ref::<EventError>())
            .map(|e| e.code.clone())
            .unwrap_or(Cow::Borrowed(codes::UNKNOWN));

        Self {
            code,
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
            cause: Some(Arc::new(err)),
        }
    }
}

/// `emit` 调用级错误
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("validation error: {reason}")]
    Validation { reason: String },
    #[error("emission aborted: {0}")]
    Aborted(EventError),
}

impl EmitError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

pub type EmitOutcome<R> = Result<Vec<crate::task::EmitResult<R>>, EmitError>;
