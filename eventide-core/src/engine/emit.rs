//! 单次派发（Emission）
//!
//! 一次 `emit` 解析出的不可变快照：处理器列表、事件级中间件、执行选项与协作者。
//! 每个处理器被事件级中间件链包裹后交给独立的 `TaskExecutor`；
//! 串行或有界并发执行，结果按解析顺序（而非完成顺序）聚合。
//!
use super::EmitOptions;
use crate::collaborator::{ErrorSink, ErrorType, EventRecord, EventStore};
use crate::context::{EventContext, ExecutionInfo};
use crate::error::EventError;
use crate::handler::EventHandler;
use crate::middleware::{Chain, SharedMiddleware};
use crate::registry::{EntryRef, Registration};
use crate::task::{EmitResult, TaskExecutor, TaskOptions, TaskState};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

pub(crate) struct Emission<T, R> {
    pub(crate) event_name: String,
    pub(crate) trace_id: String,
    pub(crate) handlers: Vec<Registration<dyn EventHandler<T, R>, T>>,
    pub(crate) middleware: Vec<SharedMiddleware<T, R>>,
    pub(crate) task: TaskOptions,
    pub(crate) options: EmitOptions,
    pub(crate) info: Arc<ExecutionInfo>,
    pub(crate) store: Option<Arc<dyn EventStore<T, R>>>,
    pub(crate) error_sink: Option<Arc<dyn ErrorSink<T>>>,
    pub(crate) invoked: Mutex<Vec<EntryRef>>,
}

impl<T, R> Emission<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// 全局中间件链的终端
    pub(crate) fn terminal(
        self: Arc<Self>,
    ) -> impl Fn(EventContext<T>) -> BoxFuture<'static, anyhow::Result<Vec<EmitResult<R>>>>
    + Send
    + Sync
    + 'static {
        let emission = self;
        move |ctx: EventContext<T>| -> BoxFuture<'static, anyhow::Result<Vec<EmitResult<R>>>> {
            Box::pin(emission.clone().dispatch(ctx))
        }
    }

    /// 被调用过的注册（用于 once 清理）
    pub(crate) fn take_invoked(&self) -> Vec<EntryRef> {
        std::mem::take(&mut *self.invoked.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn dispatch(self: Arc<Self>, ctx: EventContext<T>) -> anyhow::Result<Vec<EmitResult<R>>> {
        let total = self.handlers.len();
        tracing::debug!(
            event = %self.event_name,
            trace_id = %self.trace_id,
            handlers = total,
            parallel = !self.options.sequential(),
            "dispatching"
        );

        if self.options.sequential() {
            let mut results = Vec::with_capacity(total);
            for index in 0..total {
                let result = self.clone().run_handler(index, ctx.clone()).await;
                let stop = self.options.stop_on_error && !result.is_success();
                results.push(result);
                if stop {
                    tracing::debug!(
                        event = %self.event_name,
                        trace_id = %self.trace_id,
                        handler_index = index,
                        "stopping on first error"
                    );
                    break;
                }
            }
            return Ok(results);
        }

        let limit = self.options.max_concurrency.unwrap_or(total).max(1);
        let this = self.clone();
        let mut indexed: Vec<(usize, EmitResult<R>)> = stream::iter(0..total)
            .map(move |index| {
                let emission = this.clone();
                let ctx = ctx.clone();
                async move { (index, emission.run_handler(index, ctx).await) }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        Ok(indexed.into_iter().map(|(_, result)| result).collect())
    }

    async fn run_handler(self: Arc<Self>, index: usize, ctx: EventContext<T>) -> EmitResult<R> {
        let entry = &self.handlers[index];
        self.invoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.entry_ref());

        let handler = entry.item().clone();
        let chain = Chain::compose(
            self.middleware.clone(),
            move |ctx: EventContext<T>| -> BoxFuture<'static, anyhow::Result<R>> {
                let handler = handler.clone();
                Box::pin(async move { handler.handle(&ctx).await })
            },
        );

        let executor = TaskExecutor::new(self.task.clone(), self.trace_id.as_str());
        let result = executor
            .execute(|token| {
                let mut attempt = ctx.clone();
                attempt.signal = Some(token);
                chain.run(attempt)
            })
            .await;

        tracing::debug!(
            event = %self.event_name,
            trace_id = %self.trace_id,
            handler_index = index,
            state = %result.state,
            attempts = result.attempts,
            "handler settled"
        );
        self.info.record(index, &result);

        if result.state == TaskState::Failed {
            self.report_failure(&result, &ctx).await;
        }
        self.persist(index, &result, &ctx).await;

        result
    }

    async fn report_failure(&self, result: &EmitResult<R>, ctx: &EventContext<T>) {
        let (Some(sink), Some(error)) = (&self.error_sink, &result.error) else {
            return;
        };
        let error_type = if result.attempts > self.task.max_retries() && self.task.retryable(error) {
            ErrorType::RetriesExhausted
        } else {
            ErrorType::NonRetryable
        };
        guarded("error_sink", &self.trace_id, sink.handle(error, ctx, error_type)).await;
    }

    async fn persist(&self, index: usize, result: &EmitResult<R>, ctx: &EventContext<T>) {
        let Some(store) = &self.store else {
            return;
        };
        let record = EventRecord {
            event_name: &self.event_name,
            handler_index: index,
            context: ctx,
            result: result.result.as_ref(),
            error: result.error.as_ref(),
            state: result.state,
            trace_id: &self.trace_id,
            timestamp: Utc::now(),
        };
        guarded("event_store", &self.trace_id, store.save(&record)).await;
    }
}

/// 协作者调用：错误与 panic 只记录日志
async fn guarded(collaborator: &'static str, trace_id: &str, fut: impl Future<Output = anyhow::Result<()>>) {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(collaborator, trace_id, error = %err, "collaborator failed; ignored");
        }
        Err(payload) => {
            let err = EventError::from_panic(payload);
            tracing::warn!(collaborator, trace_id, error = %err, "collaborator panicked; ignored");
        }
    }
}

/// 把链的运行结果（含 panic）归一化为编排级结果
pub(crate) fn settle<O>(outcome: Result<anyhow::Result<O>, Box<dyn Any + Send>>) -> Result<O, EventError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(EventError::from(err)),
        Err(payload) => Err(EventError::from_panic(payload)),
    }
}
