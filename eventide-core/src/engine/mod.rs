//! 事件引擎（EventEngine）
//!
//! 由独立构造的注册表、模式缓存与中间件链组合而成：
//! - 订阅：`on` / `once` / `on_with`，键中含通配段时按模式注册；
//! - 中间件：事件级（包裹单个处理器）与全局（包裹整次派发）；
//! - 派发：`emit` / `emit_with`，返回每个处理器的 `EmitResult`；
//! - 协作者：可选的事件存储、失败接收端、无处理器观察者与插件。
//!
//! 只有参数校验失败（以及显式开启 `rethrow` 时的编排级失败）会让 `emit` 返回错误，
//! 处理器级失败都编码在各自的结果里。
//!
mod config;
mod emit;

pub use config::{EmitOptions, EngineConfig};

use self::config::validate_event_name;
use self::emit::{Emission, settle};
use crate::collaborator::{ErrorSink, EventStore, NoHandlersObserver, Plugin};
use crate::context::{EventContext, ExecutionInfo, META_EVENT_NAME, META_TRACE_ID};
use crate::error::{EmitError, EmitOutcome, EventError};
use crate::handler::SharedHandler;
use crate::middleware::{Chain, SharedGlobalMiddleware, SharedMiddleware};
use crate::registry::{HandlerOptions, Key, MiddlewareOptions, Registry, Subscription};
use crate::task::{EmitResult, TaskOptions};
use bon::Builder;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::time;
use uuid::Uuid;

/// 事件引擎
///
/// ```rust
/// use eventide_core::{EventContext, EventEngine, handler_fn};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let engine: EventEngine<String, usize> = EventEngine::builder().build();
/// let _sub = engine.on("user.*", handler_fn(|ctx: EventContext<String>| async move {
///     Ok(ctx.data.len())
/// }));
///
/// let results = engine.emit("user.created", EventContext::new("ada".into())).await?;
/// assert_eq!(results[0].result, Some(3));
/// # Ok(())
/// # }
/// ```
#[derive(Builder)]
pub struct EventEngine<T, R> {
    #[builder(default)]
    config: EngineConfig,
    store: Option<Arc<dyn EventStore<T, R>>>,
    error_sink: Option<Arc<dyn ErrorSink<T>>>,
    observer: Option<Arc<dyn NoHandlersObserver>>,
    #[builder(skip)]
    registry: Arc<Registry<T, R>>,
}

impl<T, R> EventEngine<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn key(&self, raw: &str) -> Key {
        self.registry.key_for(raw, self.config.pattern_options())
    }

    // ---- handlers ----

    pub fn on(&self, key: &str, handler: SharedHandler<T, R>) -> Subscription {
        self.on_with(key, handler, HandlerOptions::default())
    }

    /// 首次被调用并成功完成派发后自动移除
    pub fn once(&self, key: &str, handler: SharedHandler<T, R>) -> Subscription {
        self.on_with(key, handler, HandlerOptions::builder().once(true).build())
    }

    pub fn on_with(
        &self,
        key: &str,
        handler: SharedHandler<T, R>,
        options: HandlerOptions,
    ) -> Subscription {
        let key = self.key(key);
        tracing::debug!(
            key = key.as_str(),
            pattern = key.is_pattern(),
            priority = options.priority,
            once = options.once,
            handler = handler.name(),
            "handler registered"
        );
        self.registry.add_handler(key, handler, options)
    }

    /// `handler` 为 `None` 时移除该键下的全部处理器，返回移除数量
    pub fn off(&self, key: &str, handler: Option<&SharedHandler<T, R>>) -> usize {
        self.registry.remove_handlers(&self.key(key), handler)
    }

    // ---- middleware ----

    pub fn use_middleware(
        &self,
        key: &str,
        middleware: SharedMiddleware<T, R>,
        options: MiddlewareOptions<T>,
    ) -> Subscription {
        self.registry.add_middleware(self.key(key), middleware, options)
    }

    pub fn off_middleware(&self, key: &str, middleware: Option<&SharedMiddleware<T, R>>) -> usize {
        self.registry.remove_middleware(&self.key(key), middleware)
    }

    pub fn use_global(
        &self,
        middleware: SharedGlobalMiddleware<T, R>,
        options: MiddlewareOptions<T>,
    ) -> Subscription {
        self.registry.add_global(middleware, options)
    }

    pub fn off_global(&self, middleware: Option<&SharedGlobalMiddleware<T, R>>) -> usize {
        self.registry.remove_global(middleware)
    }

    // ---- introspection ----

    /// 会被 `event_name` 触发的（去重后）处理器数量
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.registry.resolve_handlers(event_name).len()
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.listener_count(event_name) > 0
    }

    /// 已注册处理器的精确键与模式键
    pub fn event_names(&self) -> Vec<String> {
        self.registry.keys()
    }

    // ---- plugins ----

    pub fn install(&self, plugin: &dyn Plugin<T, R>) -> anyhow::Result<()> {
        plugin.install(self)?;
        tracing::info!(plugin = plugin.name(), "plugin installed");
        Ok(())
    }

    pub fn uninstall(&self, plugin: &dyn Plugin<T, R>) -> anyhow::Result<()> {
        plugin.uninstall(self)?;
        tracing::info!(plugin = plugin.name(), "plugin uninstalled");
        Ok(())
    }

    /// 清空全部注册；可重复调用
    pub fn destroy(&self) {
        self.registry.clear();
        self.registry.pattern_cache().clear();
        tracing::debug!("engine destroyed");
    }

    // ---- emit ----

    /// 使用默认执行选项与引擎配置中的 `default_emit` 派发
    pub async fn emit(&self, event_name: &str, ctx: EventContext<T>) -> EmitOutcome<R> {
        self.emit_with(
            event_name,
            ctx,
            TaskOptions::default(),
            self.config.default_emit.clone(),
        )
        .await
    }

    pub async fn emit_with(
        &self,
        event_name: &str,
        mut ctx: EventContext<T>,
        mut task: TaskOptions,
        options: EmitOptions,
    ) -> EmitOutcome<R> {
        validate_event_name(event_name)?;
        options.validate()?;

        let trace_id = options
            .trace_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        ctx.meta
            .entry(META_EVENT_NAME.to_string())
            .or_insert_with(|| Value::from(event_name));
        ctx.meta
            .entry(META_TRACE_ID.to_string())
            .or_insert_with(|| Value::from(trace_id.as_str()));

        // 显式传入的任务信号优先；否则沿用上下文中的信号
        match (task.signal().cloned(), ctx.signal.clone()) {
            (Some(signal), _) => ctx.signal = Some(signal),
            (None, Some(signal)) => task.set_signal(Some(signal)),
            (None, None) => {}
        }

        let handlers = self.registry.resolve_handlers(event_name);
        if handlers.is_empty() {
            let quiet = options
                .ignore_no_handlers_warning
                .unwrap_or(self.config.ignore_no_handlers_warning);
            if !quiet {
                tracing::warn!(event = event_name, trace_id = %trace_id, "no handlers for event");
                if let Some(observer) = &self.observer {
                    let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                        observer.no_handlers(event_name, &trace_id)
                    }));
                    if let Err(payload) = notified {
                        let err = EventError::from_panic(payload);
                        tracing::warn!(
                            event = event_name,
                            trace_id = %trace_id,
                            error = %err,
                            "no-handlers observer panicked; ignored"
                        );
                    }
                }
            }
            return Ok(Vec::new());
        }

        let middleware = self.registry.resolve_middleware(event_name, &ctx);
        let global = self.registry.resolve_global(&ctx);
        let info = Arc::new(ExecutionInfo::new(
            event_name,
            &trace_id,
            handlers.len(),
            middleware.len() + global.len(),
        ));
        ctx.execution = Some(info.clone());

        let emission = Arc::new(Emission {
            event_name: event_name.to_string(),
            trace_id: trace_id.clone(),
            handlers,
            middleware,
            task,
            options: options.clone(),
            info: info.clone(),
            store: self.store.clone(),
            error_sink: self.error_sink.clone(),
            invoked: Mutex::new(Vec::new()),
        });

        let chain = Chain::compose(global, emission.clone().terminal());
        let run = AssertUnwindSafe(chain.run(ctx)).catch_unwind();

        let outcome = match options.global_timeout() {
            None => settle(run.await),
            Some(limit) => {
                // 到期后放弃等待：派发任务继续运行，其结果被丢弃
                match time::timeout(limit, tokio::spawn(run)).await {
                    Ok(Ok(joined)) => settle(joined),
                    Ok(Err(join_err)) => Err(EventError::unknown(format!(
                        "emission task failed: {join_err}"
                    ))),
                    Err(_) => {
                        tracing::warn!(
                            event = event_name,
                            trace_id = %trace_id,
                            timeout_ms = limit.as_millis() as u64,
                            "emission timed out; late results are discarded"
                        );
                        Err(EventError::timeout(limit))
                    }
                }
            }
        };
        info.finish();

        match outcome {
            Ok(results) => {
                let removed = self.registry.cleanup_once(&emission.take_invoked());
                tracing::debug!(
                    event = event_name,
                    trace_id = %trace_id,
                    results = results.len(),
                    once_removed = removed,
                    "emission finished"
                );
                Ok(results)
            }
            Err(error) => {
                tracing::error!(
                    event = event_name,
                    trace_id = %trace_id,
                    code = error.code(),
                    error = %error,
                    "emission aborted"
                );
                if options.rethrow {
                    Err(EmitError::Aborted(error))
                } else {
                    Ok(vec![EmitResult::failed(error, trace_id, 0)])
                }
            }
        }
    }
}

impl<T, R> Default for EventEngine<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::builder().build()
    }
}
