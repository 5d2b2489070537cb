//! 中间件（Middleware）与中间件链（Chain）
//!
//! 链由中间件列表自右向左折叠而成：每一帧得到一个 `Next`，调用 `next.run(ctx)`
//! 进入下一帧，最内层是终端调用（处理器或整次派发）。
//!
//! 同一帧的 `Next`（包括其克隆）只能运行一次，再次运行返回
//! `NEXT_CALLED_MULTIPLE_TIMES` 错误，不会被静默忽略。
//!
//! - 事件级中间件：`Middleware<T, R>`，包裹单个处理器调用；
//! - 全局中间件：`Middleware<T, Vec<EmitResult<R>>>`，包裹整次派发，可通过不调用
//!   `next` 阻止全部处理器执行。
//!
use crate::context::EventContext;
use crate::error::EventError;
use crate::task::EmitResult;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 中间件
#[async_trait]
pub trait Middleware<T, O>: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, ctx: EventContext<T>, next: Next<T, O>) -> anyhow::Result<O>;
}

pub type SharedMiddleware<T, R> = Arc<dyn Middleware<T, R>>;
pub type SharedGlobalMiddleware<T, R> = Arc<dyn Middleware<T, Vec<EmitResult<R>>>>;

type Continuation<T, O> =
    Arc<dyn Fn(EventContext<T>) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// 指向链中下一帧的续体
pub struct Next<T, O> {
    continuation: Continuation<T, O>,
    called: Arc<AtomicBool>,
}

impl<T, O> Clone for Next<T, O> {
    fn clone(&self) -> Self {
        Self {
            continuation: self.continuation.clone(),
            called: self.called.clone(),
        }
    }
}

impl<T, O> Next<T, O> {
    fn new(continuation: Continuation<T, O>) -> Self {
        Self {
            continuation,
            called: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 本帧是否已调用过 `run`
    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }

    pub async fn run(self, ctx: EventContext<T>) -> anyhow::Result<O> {
        if self.called.swap(true, Ordering::AcqRel) {
            tracing::error!(
                event = ctx.event_name().unwrap_or_default(),
                "next() called more than once in a middleware frame"
            );
            return Err(EventError::next_called_multiple_times().into());
        }
        (self.continuation)(ctx).await
    }
}

/// 组合完成的中间件链，可重复运行（每次运行都使用新的帧守卫）
pub struct Chain<T, O> {
    entry: Continuation<T, O>,
    depth: usize,
}

impl<T, O> Clone for Chain<T, O> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            depth: self.depth,
        }
    }
}

impl<T, O> Chain<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    /// `middleware[0]` 为最外层
    pub fn compose<F>(middleware: Vec<Arc<dyn Middleware<T, O>>>, terminal: F) -> Self
    where
        F: Fn(EventContext<T>) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync + 'static,
    {
        let depth = middleware.len();
        let entry = middleware
            .into_iter()
            .rev()
            .fold(Arc::new(terminal) as Continuation<T, O>, |inner, mw| {
                Arc::new(
                    move |ctx: EventContext<T>| -> BoxFuture<'static, anyhow::Result<O>> {
                        let mw = mw.clone();
                        let next = Next::new(inner.clone());
                        Box::pin(async move { mw.handle(ctx, next).await })
                    },
                )
            });

        Self { entry, depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn run(&self, ctx: EventContext<T>) -> BoxFuture<'static, anyhow::Result<O>> {
        (self.entry)(ctx)
    }
}

/// 闭包适配的中间件
pub struct FnMiddleware<F> {
    f: F,
}

/// 以闭包构造中间件
pub fn middleware_fn<T, O, F, Fut>(f: F) -> Arc<FnMiddleware<F>>
where
    F: Fn(EventContext<T>, Next<T, O>) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    Arc::new(FnMiddleware { f })
}

#[async_trait]
impl<T, O, F, Fut> Middleware<T, O> for FnMiddleware<F>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(EventContext<T>, Next<T, O>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    fn name(&self) -> &str {
        "fn_middleware"
    }

    async fn handle(&self, ctx: EventContext<T>, next: Next<T, O>) -> anyhow::Result<O> {
        (self.f)(ctx, next).await
    }
}

pub(crate) fn same_middleware<T, O>(
    a: &Arc<dyn Middleware<T, O>>,
    b: &Arc<dyn Middleware<T, O>>,
) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
