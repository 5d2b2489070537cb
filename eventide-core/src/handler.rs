//! 事件处理器（EventHandler）
//!
//! 处理器以 `Arc` 形式注册，`Arc` 的指针身份即去重与注销的依据。
//!
use crate::context::EventContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 事件处理器
#[async_trait]
pub trait EventHandler<T, R>: Send + Sync {
    /// 处理器名称（用于日志与审计）
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, ctx: &EventContext<T>) -> anyhow::Result<R>;
}

pub type SharedHandler<T, R> = Arc<dyn EventHandler<T, R>>;

/// 闭包适配的处理器，闭包接收上下文的克隆
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// 以闭包构造处理器
///
/// ```rust
/// use eventide_core::{EventContext, handler_fn};
///
/// let double = handler_fn(|ctx: EventContext<u32>| async move { Ok(ctx.data * 2) });
/// ```
pub fn handler_fn<T, R, F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(EventContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    Arc::new(FnHandler {
        name: "fn_handler".to_string(),
        f,
    })
}

/// 以闭包构造具名处理器
pub fn named_handler_fn<T, R, F, Fut>(name: impl Into<String>, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(EventContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<T, R, F, Fut> EventHandler<T, R> for FnHandler<F>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(EventContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &EventContext<T>) -> anyhow::Result<R> {
        (self.f)(ctx.clone()).await
    }
}

pub(crate) fn same_handler<T, R>(a: &SharedHandler<T, R>, b: &SharedHandler<T, R>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
