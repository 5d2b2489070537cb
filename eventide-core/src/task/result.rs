use super::TaskState;
use crate::error::EventError;

/// 单个处理器的派发结果
#[derive(Clone, Debug)]
pub struct EmitResult<R> {
    pub state: TaskState,
    /// 成功时的返回值
    pub result: Option<R>,
    /// 非成功时的归一化错误
    pub error: Option<EventError>,
    pub trace_id: String,
    /// 实际调用次数（含首次）
    pub attempts: u32,
}

impl<R> EmitResult<R> {
    pub fn succeeded(value: R, trace_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            state: TaskState::Succeeded,
            result: Some(value),
            error: None,
            trace_id: trace_id.into(),
            attempts,
        }
    }

    pub fn failed(error: EventError, trace_id: impl Into<String>, attempts: u32) -> Self {
        Self::with_error(TaskState::Failed, error, trace_id, attempts)
    }

    pub fn cancelled(error: EventError, trace_id: impl Into<String>, attempts: u32) -> Self {
        Self::with_error(TaskState::Cancelled, error, trace_id, attempts)
    }

    pub(crate) fn with_error(
        state: TaskState,
        error: EventError,
        trace_id: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            state,
            result: None,
            error: Some(error),
            trace_id: trace_id.into(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TaskState::Cancelled
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(EventError::code)
    }

    pub fn into_result(self) -> Result<R, EventError> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(EventError::unknown(format!(
                "no result recorded (state={})",
                self.state
            ))),
        }
    }
}
