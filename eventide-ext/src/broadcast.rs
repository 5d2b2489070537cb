//! 本地广播（BroadcastHub / BroadcastBridge）
//!
//! `BroadcastHub` 是基于 `tokio::sync::broadcast` 的进程内广播通道，必须显式创建并注入，
//! 只有连接到同一个 hub 的引擎之间才会互相转发事件。
//!
//! `BroadcastBridge` 把一个引擎接入 hub：
//! - 转发：安装全局中间件，把本地派发的事件（带节点 ID）发布到 hub；
//! - 接收：后台任务订阅 hub，把其他节点的事件在本地重新派发；
//! - 重新派发的事件带有 `broadcastOrigin` 元数据，不会被再次转发。
//!
//! 注意：转发发生在全局中间件中，因此只有本地存在匹配处理器的事件才会被转发。
//!
use eventide_core::{
    EmitResult, EventContext, EventEngine, META_TRACE_ID, Meta, MiddlewareOptions, Next,
    SharedGlobalMiddleware, Subscription, TaskOptions, middleware_fn,
};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

/// 标记事件来自 hub 的元数据键（值为来源节点 ID）
pub const META_BROADCAST_ORIGIN: &str = "broadcastOrigin";

/// 在 hub 上传递的消息
#[derive(Clone, Debug)]
pub struct BroadcastMessage<T> {
    pub origin: String,
    pub event_name: String,
    pub trace_id: String,
    pub data: T,
    pub meta: Meta,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("subscriber lagged behind and skipped {0} messages")]
    Lagged(u64),
}

/// 进程内广播 hub
#[derive(Clone)]
pub struct BroadcastHub<T> {
    tx: broadcast::Sender<BroadcastMessage<T>>,
}

impl<T> BroadcastHub<T>
where
    T: Clone + Send + 'static,
{
    /// `capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 返回收到消息的订阅者数量；无订阅者时消息被丢弃
    pub fn publish(&self, message: BroadcastMessage<T>) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    /// 同步建立订阅，返回 'static 生命周期的消息流
    pub fn subscribe(&self) -> BoxStream<'static, Result<BroadcastMessage<T>, HubError>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).map(|r| {
            r.map_err(|e| match e {
                BroadcastStreamRecvError::Lagged(n) => HubError::Lagged(n),
            })
        });
        Box::pin(stream)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 把引擎接入 hub 的桥
pub struct BroadcastBridge;

impl BroadcastBridge {
    pub fn attach<T, R>(
        engine: Arc<EventEngine<T, R>>,
        hub: BroadcastHub<T>,
        node_id: impl Into<String>,
    ) -> BridgeHandle
    where
        T: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let node_id: String = node_id.into();
        let token = CancellationToken::new();

        let forwarder = engine.use_global(
            forwarding_middleware(hub.clone(), node_id.clone()),
            MiddlewareOptions::default(),
        );

        let inbound = hub.subscribe();
        let listener = tokio::spawn(listen(engine, inbound, node_id.clone(), token.clone()));
        tracing::info!(node = %node_id, "broadcast bridge attached");

        BridgeHandle {
            node_id,
            token,
            tasks: vec![listener],
            forwarder: Mutex::new(Some(forwarder)),
        }
    }
}

fn forwarding_middleware<T, R>(hub: BroadcastHub<T>, node_id: String) -> SharedGlobalMiddleware<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    middleware_fn(move |ctx: EventContext<T>, next: Next<T, Vec<EmitResult<R>>>| {
        let hub = hub.clone();
        let node_id = node_id.clone();
        async move {
            if !ctx.meta.contains_key(META_BROADCAST_ORIGIN) {
                let message = BroadcastMessage {
                    origin: node_id,
                    event_name: ctx.event_name().unwrap_or_default().to_string(),
                    trace_id: ctx.trace_id().unwrap_or_default().to_string(),
                    data: ctx.data.clone(),
                    meta: ctx.meta.clone(),
                };
                let receivers = hub.publish(message);
                tracing::debug!(event = ctx.event_name().unwrap_or_default(), receivers, "event forwarded to hub");
            }
            next.run(ctx).await
        }
    })
}

async fn listen<T, R>(
    engine: Arc<EventEngine<T, R>>,
    mut inbound: BoxStream<'static, Result<BroadcastMessage<T>, HubError>>,
    node_id: String,
    token: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = inbound.next() => match next {
                Some(Ok(message)) if message.origin == node_id => {}
                Some(Ok(message)) => redeliver(&engine, message).await,
                Some(Err(err)) => {
                    tracing::warn!(node = %node_id, error = %err, "broadcast receiver lagged");
                }
                None => break,
            },
        }
    }
    tracing::debug!(node = %node_id, "broadcast listener stopped");
}

async fn redeliver<T, R>(engine: &EventEngine<T, R>, message: BroadcastMessage<T>)
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    let mut meta = message.meta;
    meta.insert(META_BROADCAST_ORIGIN.to_string(), Value::from(message.origin.as_str()));
    // 沿用来源节点的 trace id
    meta.remove(META_TRACE_ID);
    let ctx = EventContext {
        meta,
        ..EventContext::new(message.data)
    };

    let mut options = engine.config().default_emit.clone();
    options.trace_id = Some(message.trace_id);
    options.ignore_no_handlers_warning = Some(true);

    let outcome = engine
        .emit_with(&message.event_name, ctx, TaskOptions::default(), options)
        .await;
    if let Err(err) = outcome {
        tracing::warn!(
            event = %message.event_name,
            origin = %message.origin,
            error = %err,
            "failed to redeliver broadcast event"
        );
    }
}

/// 桥的运行句柄：关闭时移除转发中间件并停止接收任务
pub struct BridgeHandle {
    node_id: String,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    forwarder: Mutex<Option<Subscription>>,
}

impl BridgeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = forwarder {
            subscription.unsubscribe();
        }
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
