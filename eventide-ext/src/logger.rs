//! 日志插件（LoggerPlugin）
//!
//! 安装一个最外层的全局中间件，以 `tracing` 记录每次派发的开始、结束、
//! 耗时与各状态计数；卸载时移除该中间件。
//!
use async_trait::async_trait;
use eventide_core::{
    EmitResult, EventContext, EventEngine, Middleware, MiddlewareOptions, Next, Plugin,
    Subscription, TaskState,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// 全局中间件优先级：数值最小者位于最外层
pub const LOGGER_PRIORITY: i32 = i32::MIN;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn tally<R>(results: &[EmitResult<R>]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            match r.state {
                TaskState::Succeeded => acc.succeeded += 1,
                TaskState::Cancelled => acc.cancelled += 1,
                _ => acc.failed += 1,
            }
            acc
        })
    }
}

/// 记录派发过程的全局中间件
pub struct LoggingMiddleware;

#[async_trait]
impl<T, R> Middleware<T, Vec<EmitResult<R>>> for LoggingMiddleware
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    fn name(&self) -> &str {
        "logger"
    }

    async fn handle(
        &self,
        ctx: EventContext<T>,
        next: Next<T, Vec<EmitResult<R>>>,
    ) -> anyhow::Result<Vec<EmitResult<R>>> {
        let event = ctx.event_name().unwrap_or_default().to_string();
        let trace_id = ctx.trace_id().unwrap_or_default().to_string();
        let handlers = ctx.execution().map_or(0, |info| info.handler_count());
        tracing::info!(event = %event, trace_id = %trace_id, handlers, "emission started");

        let started = Instant::now();
        let outcome = next.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(results) => {
                let counts = StateCounts::tally(results);
                tracing::info!(
                    event = %event,
                    trace_id = %trace_id,
                    duration_ms,
                    succeeded = counts.succeeded,
                    failed = counts.failed,
                    cancelled = counts.cancelled,
                    "emission finished"
                );
                for (index, result) in results.iter().enumerate().filter(|(_, r)| !r.is_success()) {
                    tracing::warn!(
                        event = %event,
                        trace_id = %trace_id,
                        handler_index = index,
                        state = %result.state,
                        code = result.error_code().unwrap_or_default(),
                        "handler did not succeed"
                    );
                }
            }
            Err(err) => {
                tracing::error!(event = %event, trace_id = %trace_id, duration_ms, error = %err, "emission failed");
            }
        }
        outcome
    }
}

/// 日志插件
#[derive(Default)]
pub struct LoggerPlugin {
    subscription: Mutex<Option<Subscription>>,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T, R> Plugin<T, R> for LoggerPlugin
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "logger"
    }

    fn install(&self, engine: &EventEngine<T, R>) -> anyhow::Result<()> {
        let mut slot = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            anyhow::bail!("logger plugin is already installed");
        }
        let options = MiddlewareOptions::builder().priority(LOGGER_PRIORITY).build();
        *slot = Some(engine.use_global(Arc::new(LoggingMiddleware), options));
        Ok(())
    }

    fn uninstall(&self, _engine: &EventEngine<T, R>) -> anyhow::Result<()> {
        let taken = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = taken {
            subscription.unsubscribe();
        }
        Ok(())
    }
}
