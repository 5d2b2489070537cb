//! 性能监控插件（PerformanceMonitor）
//!
//! 以全局中间件统计每个事件名的派发次数、处理器调用次数、失败数与延迟。
//!
use eventide_core::{
    EmitResult, EventContext, EventEngine, MiddlewareOptions, Next, Plugin,
    SharedGlobalMiddleware, Subscription, middleware_fn,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// 紧贴日志中间件之内
pub const MONITOR_PRIORITY: i32 = i32::MIN + 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub emissions: u64,
    pub handler_runs: u64,
    /// 非成功的处理器结果，以及整次派发失败
    pub failures: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl EventStats {
    pub fn average_latency(&self) -> Duration {
        if self.emissions == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_latency.as_nanos() / u128::from(self.emissions);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn observe<R>(&mut self, elapsed: Duration, outcome: &anyhow::Result<Vec<EmitResult<R>>>) {
        self.emissions += 1;
        self.total_latency += elapsed;
        self.max_latency = self.max_latency.max(elapsed);
        match outcome {
            Ok(results) => {
                self.handler_runs += results.len() as u64;
                self.failures += results.iter().filter(|r| !r.is_success()).count() as u64;
            }
            Err(_) => self.failures += 1,
        }
    }
}

type StatsTable = Arc<Mutex<HashMap<String, EventStats>>>;

#[derive(Default)]
pub struct PerformanceMonitor {
    stats: StatsTable,
    subscription: Mutex<Option<Subscription>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, EventStats> {
        lock(&self.stats).clone()
    }

    pub fn stats_for(&self, event_name: &str) -> Option<EventStats> {
        lock(&self.stats).get(event_name).cloned()
    }

    pub fn reset(&self) {
        lock(&self.stats).clear();
    }

    fn middleware<T, R>(&self) -> SharedGlobalMiddleware<T, R>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let stats = self.stats.clone();
        middleware_fn(move |ctx: EventContext<T>, next: Next<T, Vec<EmitResult<R>>>| {
            let stats = stats.clone();
            async move {
                let event = ctx.event_name().unwrap_or_default().to_string();
                let started = Instant::now();
                let outcome = next.run(ctx).await;
                lock(&stats)
                    .entry(event)
                    .or_default()
                    .observe(started.elapsed(), &outcome);
                outcome
            }
        })
    }
}

fn lock(stats: &StatsTable) -> MutexGuard<'_, HashMap<String, EventStats>> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, R> Plugin<T, R> for PerformanceMonitor
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "performance-monitor"
    }

    fn install(&self, engine: &EventEngine<T, R>) -> anyhow::Result<()> {
        let mut slot = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            anyhow::bail!("performance monitor is already installed");
        }
        let options = MiddlewareOptions::builder().priority(MONITOR_PRIORITY).build();
        *slot = Some(engine.use_global(self.middleware(), options));
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
