use super::{EmitResult, TaskOptions, TaskState};
use crate::error::EventError;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// 单次处理器调用的执行器，每次调用新建，不复用
///
/// 每次尝试都会与内部超时计时器、外部取消信号竞争；两者同时触发时外部取消优先。
/// 所有计时器与监听在任何退出路径上都会随 `select!` 分支一同释放。
pub struct TaskExecutor {
    options: TaskOptions,
    trace_id: String,
    state: TaskState,
}

enum Attempt<R> {
    Done(R),
    Failed(EventError),
}

impl TaskExecutor {
    pub fn new(options: TaskOptions, trace_id: impl Into<String>) -> Self {
        Self {
            options,
            trace_id: trace_id.into(),
            state: TaskState::Pending,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// 驱动 `invocable` 直至终态
    ///
    /// `invocable` 每次尝试被调用一次，参数为该次尝试的子取消令牌：
    /// 超时或外部取消时该令牌会被取消，处理器可据此协作式退出。
    pub async fn execute<R, F, Fut>(mut self, mut invocable: F) -> EmitResult<R>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let external = self.options.signal.clone().unwrap_or_default();
        let timeout = self.options.timeout();
        let mut retries: u32 = 0;

        loop {
            self.transition(TaskState::Running);

            if external.is_cancelled() {
                self.transition(TaskState::Cancelled);
                return EmitResult::cancelled(EventError::cancelled(), &self.trace_id, retries);
            }

            let attempt_token = external.child_token();
            let call = AssertUnwindSafe(invocable(attempt_token.clone())).catch_unwind();

            let attempt = tokio::select! {
                biased;
                _ = external.cancelled() => Attempt::Failed(EventError::cancelled()),
                res = call => match res {
                    Ok(Ok(value)) => Attempt::Done(value),
                    Ok(Err(err)) => Attempt::Failed(EventError::from(err)),
                    Err(payload) => Attempt::Failed(EventError::from_panic(payload)),
                },
                _ = time::sleep(timeout.unwrap_or_default()), if timeout.is_some() => {
                    if external.is_cancelled() {
                        Attempt::Failed(EventError::cancelled())
                    } else {
                        Attempt::Failed(EventError::timeout(timeout.unwrap_or_default()))
                    }
                }
            };

            let attempts = retries + 1;
            let error = match attempt {
                Attempt::Done(value) => {
                    self.transition(TaskState::Succeeded);
                    return EmitResult::succeeded(value, &self.trace_id, attempts);
                }
                Attempt::Failed(error) => {
                    attempt_token.cancel();
                    error
                }
            };

            if error.is_cancelled() {
                self.transition(TaskState::Cancelled);
                return EmitResult::cancelled(error, &self.trace_id, attempts);
            }

            if error.is_timeout() {
                self.transition(TaskState::Timeout);
                if let Some(cb) = &self.options.on_timeout {
                    best_effort("on_timeout", || cb(&error));
                }
            }

            let eligible = retries < self.options.max_retries && self.options.retryable(&error);
            if !eligible {
                tracing::debug!(trace_id = %self.trace_id, attempts, code = error.code(), "task failed");
                self.transition(TaskState::Failed);
                return EmitResult::failed(error, &self.trace_id, attempts);
            }

            self.transition(TaskState::Retrying);
            if let Some(cb) = &self.options.on_retry {
                best_effort("on_retry", || cb(retries + 1, &error));
            }

            let delay = self.options.retry_delay.delay_for(retries);
            tracing::warn!(
                trace_id = %self.trace_id,
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                code = error.code(),
                "retrying task"
            );
            retries += 1;

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = external.cancelled() => {
                        self.transition(TaskState::Cancelled);
                        return EmitResult::cancelled(EventError::cancelled(), &self.trace_id, retries);
                    }
                    _ = time::sleep(delay) => {}
                }
            }
        }
    }

    fn transition(&mut self, next: TaskState) {
        if self.state == next {
            return;
        }
        tracing::trace!(trace_id = %self.trace_id, from = %self.state, to = %next, "task state");
        self.state = next;
        if let Some(cb) = &self.options.on_state_change {
            best_effort("on_state_change", || cb(next));
        }
    }
}

/// 回调中的 panic 被吞掉，避免破坏状态机
fn best_effort(name: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(callback = name, "task callback panicked; ignored");
    }
}
