use anyhow::Context as _;
use eventide_core::{
    EmitOptions, EngineConfig, EventContext, EventEngine, HandlerOptions, MiddlewareOptions, Next,
    RetryDelay, SharedHandler, TaskOptions, handler_fn, middleware_fn,
};
use eventide_ext::{
    BroadcastBridge, BroadcastHub, DeadLetterQueue, InMemoryEventStore, LoggerPlugin,
    PerformanceMonitor,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    amount: i64,
}

type Engine = EventEngine<Order, String>;

const CONFIG: &str = r#"{
    "separator": ".",
    "wildcard_enabled": true,
    "default_emit": { "parallel": true, "max_concurrency": 4 }
}"#;

/// 重新派发时会再次被调用，按订单号保证只预留一次
fn reserve_stock() -> SharedHandler<Order, String> {
    let reserved = Arc::new(Mutex::new(HashSet::new()));
    handler_fn(move |ctx: EventContext<Order>| {
        let reserved = reserved.clone();
        async move {
            let fresh = reserved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(ctx.data.id.clone());
            if !fresh {
                return Ok(format!("stock already reserved for {}", ctx.data.id));
            }
            Ok(format!("stock reserved for {}", ctx.data.id))
        }
    })
}

/// 前两次调用失败，模拟不稳定的支付网关
fn charge_payment() -> SharedHandler<Order, String> {
    let calls = Arc::new(AtomicU32::new(0));
    handler_fn(move |ctx: EventContext<Order>| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("payment gateway unavailable");
            }
            Ok(format!("charged {}", ctx.data.amount))
        }
    })
}

fn audit() -> SharedHandler<Order, String> {
    handler_fn(|ctx: EventContext<Order>| async move {
        let event = ctx.event_name().unwrap_or_default().to_string();
        Ok(format!("audited {event}"))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config: EngineConfig = serde_json::from_str(CONFIG).context("invalid engine config")?;
    let store = Arc::new(InMemoryEventStore::<Order, String>::new());
    let dlq = Arc::new(DeadLetterQueue::<Order>::new(32));
    let engine = Arc::new(
        Engine::builder()
            .config(config)
            .store(store.clone())
            .error_sink(dlq.clone())
            .build(),
    );

    let logger = LoggerPlugin::new();
    let monitor = PerformanceMonitor::new();
    engine.install(&logger)?;
    engine.install(&monitor)?;

    let _stock = engine.on_with(
        "order.placed",
        reserve_stock(),
        HandlerOptions::builder().priority(10).build(),
    );
    let _payment = engine.on("order.placed", charge_payment());
    let _audit = engine.on("order.**", audit());
    let _welcome = engine.once(
        "order.placed",
        handler_fn(|_ctx: EventContext<Order>| async move { Ok("first order bonus".to_string()) }),
    );
    let _validate = engine.use_middleware(
        "order.placed",
        middleware_fn(|ctx: EventContext<Order>, next: Next<Order, String>| async move {
            tracing::info!(order = %ctx.data.id, "validating order");
            if ctx.data.amount <= 0 {
                anyhow::bail!("order amount must be positive");
            }
            next.run(ctx).await
        }),
        MiddlewareOptions::default(),
    );

    // 第二个节点通过同一个 hub 接收订单事件
    let hub = BroadcastHub::new(64);
    let replica = Arc::new(Engine::default());
    let _mirror = replica.on(
        "order.*",
        handler_fn(|ctx: EventContext<Order>| async move {
            tracing::info!(order = %ctx.data.id, "replica received order");
            Ok(ctx.data.id)
        }),
    );
    let primary_bridge = BroadcastBridge::attach(engine.clone(), hub.clone(), "primary");
    let replica_bridge = BroadcastBridge::attach(replica.clone(), hub, "replica");

    let order = Order {
        id: "A-1001".into(),
        amount: 250,
    };
    let task = TaskOptions::builder()
        .max_retries(1)
        .retry_delay(RetryDelay::Fixed(Duration::from_millis(20)))
        .timeout(Duration::from_secs(1))
        .build();
    let results = engine
        .emit_with(
            "order.placed",
            EventContext::new(order.clone()),
            task,
            engine.config().default_emit.clone(),
        )
        .await?;
    for result in &results {
        tracing::info!(state = %result.state, attempts = result.attempts, result = ?result.result, "handler result");
    }

    // 支付重试已耗尽，网关恢复后把失败的派发重新派发一次
    tracing::info!(dead_letters = dlq.len(), "dead letter queue");
    for outcome in dlq.redrive(&engine).await {
        let results = outcome?;
        tracing::info!(succeeded = results.iter().filter(|r| r.is_success()).count(), "redriven");
    }

    let options = EmitOptions::builder()
        .stop_on_error(true)
        .global_timeout(Duration::from_millis(500))
        .build();
    let rejected = Order {
        id: "A-1002".into(),
        amount: -5,
    };
    let results = engine
        .emit_with("order.placed", EventContext::new(rejected), TaskOptions::default(), options)
        .await?;
    tracing::info!(code = ?results.first().and_then(|r| r.error_code()), "rejected order");

    engine.emit("order.shipped.express", EventContext::new(order)).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    for (event, stats) in monitor.snapshot() {
        tracing::info!(
            event = %event,
            emissions = stats.emissions,
            failures = stats.failures,
            avg_ms = stats.average_latency().as_millis() as u64,
            "event stats"
        );
    }
    tracing::info!(records = store.len(), "event store");

    primary_bridge.shutdown();
    replica_bridge.shutdown();
    primary_bridge.join().await;
    replica_bridge.join().await;
    engine.uninstall(&monitor)?;
    engine.uninstall(&logger)?;
    engine.destroy();
    Ok(())
}
