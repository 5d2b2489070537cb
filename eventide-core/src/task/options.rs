use super::TaskState;
use crate::error::EventError;
use bon::Builder;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type RetryPredicate = Arc<dyn Fn(&EventError) -> bool + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(TaskState) + Send + Sync>;
/// 参数：即将开始的重试序号（从 1 开始）与上一次的错误
pub type RetryCallback = Arc<dyn Fn(u32, &EventError) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(&EventError) + Send + Sync>;

/// 重试间隔：固定值或按已重试次数计算
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// 指数退避：`base * 2^attempt`，上限 `max`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Backoff(Arc::new(move |attempt| {
            let factor = 2_u32.saturating_pow(attempt);
            base.saturating_mul(factor).min(max)
        }))
    }

    /// `attempt` 为已完成的重试次数（首次失败后为 0）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff(f) => f(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Fixed(Duration::ZERO)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Backoff(_) => f.write_str("Backoff(..)"),
        }
    }
}

/// 单次调用的执行选项
///
/// 注意：取消是协作式的。执行器会停止等待当前尝试并取消其子令牌，
/// 但无法强行中止不观察 `EventContext::signal` 的处理器所派生的后台工作。
#[derive(Builder, Clone, Default)]
pub struct TaskOptions {
    /// 单次尝试超时；`None` 或零表示不设定时器
    pub(crate) timeout: Option<Duration>,
    /// 外部取消信号
    pub(crate) signal: Option<CancellationToken>,
    /// 首次失败后最多重试的次数
    #[builder(default)]
    pub(crate) max_retries: u32,
    #[builder(default)]
    pub(crate) retry_delay: RetryDelay,
    /// 重试判定，缺省时总是重试
    pub(crate) is_retryable: Option<RetryPredicate>,
    pub(crate) on_state_change: Option<StateCallback>,
    pub(crate) on_retry: Option<RetryCallback>,
    pub(crate) on_timeout: Option<TimeoutCallback>,
}

impl TaskOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|d| !d.is_zero())
    }

    pub fn signal(&self) -> Option<&CancellationToken> {
        self.signal.as_ref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retryable(&self, error: &EventError) -> bool {
        match &self.is_retryable {
            Some(predicate) => predicate(error),
            None => true,
        }
    }

    pub(crate) fn set_signal(&mut self, signal: Option<CancellationToken>) {
        self.signal = signal;
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("timeout", &self.timeout)
            .field("signal", &self.signal)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("is_retryable", &self.is_retryable.is_some())
            .finish_non_exhaustive()
    }
}
