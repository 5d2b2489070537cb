use anyhow::Result as AnyResult;
use async_trait::async_trait;
use eventide_core::{
    EmitError, EmitOptions, EmitResult, ErrorSink, ErrorType, EventContext, EventEngine,
    EventError, EventRecord, EventStore, HandlerOptions, MiddlewareOptions, Next,
    NoHandlersObserver, RetryDelay, SharedGlobalMiddleware, SharedHandler, SharedMiddleware,
    Subscription, TaskOptions, TaskState, codes, handler_fn, middleware_fn,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Engine = EventEngine<u32, String>;
type Log = Arc<Mutex<Vec<&'static str>>>;

fn recording(log: &Log, tag: &'static str) -> SharedHandler<u32, String> {
    let log = log.clone();
    handler_fn(move |_ctx: EventContext<u32>| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(tag);
            Ok(tag.to_string())
        }
    })
}

fn failing(calls: Arc<AtomicUsize>) -> SharedHandler<u32, String> {
    handler_fn(move |_ctx: EventContext<u32>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow::anyhow!("always broken"))
        }
    })
}

fn priority(p: i32) -> HandlerOptions {
    HandlerOptions::builder().priority(p).build()
}

fn parallel() -> EmitOptions {
    EmitOptions::builder().parallel(true).build()
}

#[tokio::test]
async fn handlers_run_in_descending_priority() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _a = engine.on_with("e", recording(&log, "p5"), priority(5));
    let _b = engine.on_with("e", recording(&log, "p20"), priority(20));
    let _c = engine.on_with("e", recording(&log, "p10"), priority(10));

    let results = engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(*log.lock().unwrap(), vec!["p20", "p10", "p5"]);
    let values: Vec<_> = results.into_iter().filter_map(|r| r.result).collect();
    assert_eq!(values, vec!["p20", "p10", "p5"]);
    Ok(())
}

#[tokio::test]
async fn once_handler_runs_once_while_sibling_runs_every_time() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _once = engine.once("e", recording(&log, "once"));
    let _always = engine.on("e", recording(&log, "always"));

    engine.emit("e", EventContext::new(0)).await?;
    engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(*log.lock().unwrap(), vec!["once", "always", "always"]);
    assert_eq!(engine.listener_count("e"), 1);
    Ok(())
}

#[tokio::test]
async fn once_removes_only_the_invoked_registration() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let shared = recording(&log, "shared");
    let _exact = engine.once("order.created", shared.clone());
    let _pattern = engine.on("order.*", shared.clone());

    engine.emit("order.created", EventContext::new(0)).await?;
    engine.emit("order.created", EventContext::new(0)).await?;

    // 同一引用只调用一次；once 只移除精确键下那条注册
    assert_eq!(*log.lock().unwrap(), vec!["shared", "shared"]);
    assert_eq!(engine.event_names(), vec!["order.*".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bounded_concurrency_never_exceeds_limit() -> AnyResult<()> {
    let engine = Engine::default();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut subs = Vec::new();
    for _ in 0..5 {
        let active = active.clone();
        let peak = peak.clone();
        subs.push(engine.on(
            "work",
            handler_fn(move |_ctx: EventContext<u32>| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok("done".to_string())
                }
            }),
        ));
    }

    let options = EmitOptions::builder().parallel(true).max_concurrency(2).build();
    let results = engine
        .emit_with("work", EventContext::new(0), TaskOptions::default(), options)
        .await?;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(EmitResult::is_success));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn parallel_results_keep_resolution_order() -> AnyResult<()> {
    let engine = Engine::default();
    let mut subs = Vec::new();
    for (p, delay_ms, tag) in [(3, 30_u64, "first"), (2, 20, "second"), (1, 10, "third")] {
        subs.push(engine.on_with(
            "race",
            handler_fn(move |_ctx: EventContext<u32>| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(tag.to_string())
            }),
            priority(p),
        ));
    }

    let results = engine
        .emit_with("race", EventContext::new(0), TaskOptions::default(), parallel())
        .await?;

    let values: Vec<_> = results.into_iter().filter_map(|r| r.result).collect();
    assert_eq!(values, vec!["first", "second", "third"]);
    Ok(())
}

#[tokio::test]
async fn stop_on_error_forces_sequential_and_stops() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let _bad = engine.on_with("e", failing(calls.clone()), priority(10));
    let _good = engine.on_with("e", recording(&log, "low"), priority(1));

    let options = EmitOptions::builder().parallel(true).stop_on_error(true).build();
    let results = engine
        .emit_with("e", EventContext::new(0), TaskOptions::default(), options)
        .await?;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, TaskState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_handler_does_not_affect_siblings() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _bad = engine.on_with("e", failing(Arc::default()), priority(10));
    let _good = engine.on_with("e", recording(&log, "ok"), priority(1));

    let results = engine
        .emit_with("e", EventContext::new(0), TaskOptions::default(), parallel())
        .await?;

    assert_eq!(results[0].error_code(), Some(codes::UNKNOWN));
    assert!(results[1].is_success());
    Ok(())
}

#[tokio::test]
async fn retries_until_third_attempt_succeeds() -> AnyResult<()> {
    let engine = Engine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _flaky = engine.on(
        "flaky",
        handler_fn(move |_ctx: EventContext<u32>| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("attempt {n} failed");
                }
                Ok(format!("ok after {n}"))
            }
        }),
    );

    let task = TaskOptions::builder()
        .max_retries(3)
        .is_retryable(Arc::new(|_: &EventError| true))
        .build();
    let results = engine
        .emit_with("flaky", EventContext::new(0), task, EmitOptions::default())
        .await?;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(results[0].state, TaskState::Succeeded);
    assert_eq!(results[0].attempts, 3);
    assert_eq!(results[0].result.as_deref(), Some("ok after 3"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_retry_wait_yields_cancelled() -> AnyResult<()> {
    let engine = Engine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let _h = engine.on("job", failing(calls.clone()));

    let token = CancellationToken::new();
    let task = TaskOptions::builder()
        .max_retries(5)
        .retry_delay(RetryDelay::Fixed(Duration::from_secs(1)))
        .signal(token.clone())
        .build();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let results = engine
        .emit_with("job", EventContext::new(0), task, EmitOptions::default())
        .await?;

    assert_eq!(results[0].state, TaskState::Cancelled);
    assert_eq!(results[0].error_code(), Some(codes::CANCELLED));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn context_signal_is_threaded_into_executor() -> AnyResult<()> {
    let engine = Engine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let _h = engine.on("job", failing(calls.clone()));

    let token = CancellationToken::new();
    token.cancel();
    let results = engine
        .emit("job", EventContext::new(0).with_signal(token))
        .await?;

    assert!(results[0].is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn multi_wildcard_subscription_matches_nested_names() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _h = engine.on("user.**.action", recording(&log, "hit"));

    assert!(engine.has_listeners("user.profile.action"));
    assert!(engine.has_listeners("user.settings.preferences.action"));
    assert!(!engine.has_listeners("user.action"));
    assert!(!engine.has_listeners("order.profile.action"));

    engine.emit("user.settings.preferences.action", EventContext::new(0)).await?;
    assert_eq!(*log.lock().unwrap(), vec!["hit"]);
    Ok(())
}

#[tokio::test]
async fn single_wildcard_does_not_absorb_literal_glyph() {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _h = engine.on("order.*", recording(&log, "hit"));

    assert!(engine.has_listeners("order.paid"));
    assert!(!engine.has_listeners("order.*"));
    assert!(!engine.has_listeners("order.**"));
}

#[derive(Default)]
struct CountingObserver {
    hits: AtomicUsize,
}

impl NoHandlersObserver for CountingObserver {
    fn no_handlers(&self, _event_name: &str, _trace_id: &str) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn no_handlers_returns_empty_and_notifies_once() -> AnyResult<()> {
    let observer = Arc::new(CountingObserver::default());
    let engine = Engine::builder().observer(observer.clone()).build();

    let results = engine.emit("nobody.home", EventContext::new(0)).await?;
    assert!(results.is_empty());
    assert_eq!(observer.hits.load(Ordering::SeqCst), 1);

    let quiet = EmitOptions::builder().ignore_no_handlers_warning(true).build();
    let results = engine
        .emit_with("nobody.home", EventContext::new(0), TaskOptions::default(), quiet)
        .await?;
    assert!(results.is_empty());
    assert_eq!(observer.hits.load(Ordering::SeqCst), 1);
    Ok(())
}

struct PanickingObserver;

impl NoHandlersObserver for PanickingObserver {
    fn no_handlers(&self, event_name: &str, _trace_id: &str) {
        panic!("observer bug on {event_name}");
    }
}

#[tokio::test]
async fn panicking_observer_does_not_escape_emit() -> AnyResult<()> {
    let engine = Engine::builder().observer(Arc::new(PanickingObserver)).build();

    let results = engine.emit("nobody.home", EventContext::new(0)).await?;
    assert!(results.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_input_is_rejected_before_dispatch() {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "never"));

    let err = engine.emit(" ", EventContext::new(0)).await.unwrap_err();
    assert!(matches!(err, EmitError::Validation { .. }));

    let bad = EmitOptions::builder().max_concurrency(0).build();
    let err = engine
        .emit_with("e", EventContext::new(0), TaskOptions::default(), bad)
        .await
        .unwrap_err();
    assert!(matches!(err, EmitError::Validation { .. }));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unregistering_mid_dispatch_does_not_change_current_emission() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let pending: Arc<Mutex<Option<Subscription>>> = Arc::default();

    let slot = pending.clone();
    let _first = engine.on_with(
        "e",
        handler_fn(move |_ctx: EventContext<u32>| {
            let slot = slot.clone();
            async move {
                let sub = slot.lock().unwrap().take();
                if let Some(sub) = sub {
                    sub.unsubscribe();
                }
                Ok("first".to_string())
            }
        }),
        priority(10),
    );
    let second = engine.on_with("e", recording(&log, "second"), priority(1));
    *pending.lock().unwrap() = Some(second);

    let first_run = engine.emit("e", EventContext::new(0)).await?;
    let second_run = engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(first_run.len(), 2);
    assert_eq!(second_run.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["second"]);
    Ok(())
}

#[tokio::test]
async fn event_middleware_wraps_each_handler() -> AnyResult<()> {
    let engine = Engine::default();
    let doubler: SharedMiddleware<u32, String> = middleware_fn(
        |mut ctx: EventContext<u32>, next: Next<u32, String>| async move {
            ctx.data *= 2;
            next.run(ctx).await
        },
    );
    let suffix: SharedMiddleware<u32, String> = middleware_fn(
        |ctx: EventContext<u32>, next: Next<u32, String>| async move {
            let out = next.run(ctx).await?;
            Ok(format!("{out}!"))
        },
    );
    let _m1 = engine.use_middleware("order.*", doubler, MiddlewareOptions::default());
    let _m2 = engine.use_middleware(
        "order.placed",
        suffix,
        MiddlewareOptions::builder().priority(5).build(),
    );
    let _h = engine.on(
        "order.placed",
        handler_fn(|ctx: EventContext<u32>| async move {
            Ok(format!("{}:{}", ctx.event_name().unwrap_or_default(), ctx.data))
        }),
    );

    let results = engine.emit("order.placed", EventContext::new(21)).await?;
    assert_eq!(results[0].result.as_deref(), Some("order.placed:42!"));
    Ok(())
}

#[tokio::test]
async fn middleware_filter_skips_non_matching_contexts() -> AnyResult<()> {
    let engine = Engine::default();
    let rejecter: SharedMiddleware<u32, String> = middleware_fn(
        |_ctx: EventContext<u32>, _next: Next<u32, String>| async move {
            Err::<String, _>(anyhow::anyhow!("blocked"))
        },
    );
    let _m = engine.use_middleware(
        "e",
        rejecter,
        MiddlewareOptions::<u32>::builder()
            .filter(Arc::new(|ctx: &EventContext<u32>| ctx.data > 100))
            .build(),
    );
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "ran"));

    let small = engine.emit("e", EventContext::new(1)).await?;
    let large = engine.emit("e", EventContext::new(500)).await?;

    assert!(small[0].is_success());
    assert_eq!(large[0].state, TaskState::Failed);
    assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    Ok(())
}

#[tokio::test]
async fn middleware_rejected_under_one_key_still_runs_via_unfiltered_key() -> AnyResult<()> {
    let engine = Engine::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let counting: SharedMiddleware<u32, String> = middleware_fn(
        move |ctx: EventContext<u32>, next: Next<u32, String>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                next.run(ctx).await
            }
        },
    );
    let _exact = engine.use_middleware(
        "e",
        counting.clone(),
        MiddlewareOptions::<u32>::builder()
            .priority(10)
            .filter(Arc::new(|_: &EventContext<u32>| false))
            .build(),
    );
    let _any = engine.use_middleware("*", counting, MiddlewareOptions::default());
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "ran"));

    let results = engine.emit("e", EventContext::new(0)).await?;
    assert!(results[0].is_success());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn panicking_filter_skips_middleware_instead_of_unwinding() -> AnyResult<()> {
    let engine = Engine::default();
    let rejecter: SharedMiddleware<u32, String> = middleware_fn(
        |_ctx: EventContext<u32>, _next: Next<u32, String>| async move {
            Err::<String, _>(anyhow::anyhow!("blocked"))
        },
    );
    let _m = engine.use_middleware(
        "e",
        rejecter,
        MiddlewareOptions::<u32>::builder()
            .filter(Arc::new(|_: &EventContext<u32>| -> bool { panic!("filter bug") }))
            .build(),
    );
    let global: SharedGlobalMiddleware<u32, String> = middleware_fn(
        |_ctx: EventContext<u32>, _next: Next<u32, Vec<EmitResult<String>>>| async move {
            Ok(Vec::new())
        },
    );
    let _g = engine.use_global(
        global,
        MiddlewareOptions::<u32>::builder()
            .filter(Arc::new(|_: &EventContext<u32>| -> bool { panic!("global filter bug") }))
            .build(),
    );
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "ran"));

    let results = engine.emit("e", EventContext::new(0)).await?;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    Ok(())
}

#[tokio::test]
async fn calling_next_twice_fails_the_handler() -> AnyResult<()> {
    let engine = Engine::default();
    let twice: SharedMiddleware<u32, String> = middleware_fn(
        |ctx: EventContext<u32>, next: Next<u32, String>| async move {
            let again = next.clone();
            let _ = next.run(ctx.clone()).await;
            again.run(ctx).await
        },
    );
    let _m = engine.use_middleware("e", twice, MiddlewareOptions::default());
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "once"));

    let results = engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(results[0].state, TaskState::Failed);
    assert_eq!(results[0].error_code(), Some(codes::NEXT_CALLED_MULTIPLE_TIMES));
    assert_eq!(*log.lock().unwrap(), vec!["once"]);
    Ok(())
}

type GlobalNext = Next<u32, Vec<EmitResult<String>>>;

#[tokio::test]
async fn global_middleware_can_short_circuit_emission() -> AnyResult<()> {
    let engine = Engine::default();
    let gate: SharedGlobalMiddleware<u32, String> =
        middleware_fn(|_ctx: EventContext<u32>, _next: GlobalNext| async move { Ok(Vec::new()) });
    let _g = engine.use_global(gate, MiddlewareOptions::default());
    let log: Log = Arc::default();
    let _h = engine.on("e", recording(&log, "never"));

    let results = engine.emit("e", EventContext::new(0)).await?;

    assert!(results.is_empty());
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn global_middleware_failure_aborts_emission() -> AnyResult<()> {
    let engine = Engine::default();
    let deny: SharedGlobalMiddleware<u32, String> =
        middleware_fn(|_ctx: EventContext<u32>, _next: GlobalNext| async move {
            Err::<Vec<EmitResult<String>>, _>(EventError::new("DENIED", "not today").into())
        });
    let _g = engine.use_global(deny, MiddlewareOptions::default());
    let _h = engine.on("e", recording(&Log::default(), "never"));

    let results = engine.emit("e", EventContext::new(0)).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, TaskState::Failed);
    assert_eq!(results[0].error_code(), Some("DENIED"));

    let rethrow = EmitOptions::builder().rethrow(true).build();
    let err = engine
        .emit_with("e", EventContext::new(0), TaskOptions::default(), rethrow)
        .await
        .unwrap_err();
    match err {
        EmitError::Aborted(inner) => assert_eq!(inner.code(), "DENIED"),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn global_middleware_wraps_outermost_and_sees_execution_info() -> AnyResult<()> {
    let engine = Engine::default();
    let order: Log = Arc::default();
    let seen: Arc<Mutex<Option<(usize, usize, bool)>>> = Arc::default();

    let outer_order = order.clone();
    let outer: SharedGlobalMiddleware<u32, String> =
        middleware_fn(move |ctx: EventContext<u32>, next: GlobalNext| {
            let order = outer_order.clone();
            async move {
                order.lock().unwrap().push("outer");
                next.run(ctx).await
            }
        });
    let inner_order = order.clone();
    let inner_seen = seen.clone();
    let inner: SharedGlobalMiddleware<u32, String> =
        middleware_fn(move |ctx: EventContext<u32>, next: GlobalNext| {
            let order = inner_order.clone();
            let seen = inner_seen.clone();
            async move {
                order.lock().unwrap().push("inner");
                let out = next.run(ctx.clone()).await;
                if let Some(info) = ctx.execution() {
                    *seen.lock().unwrap() =
                        Some((info.handler_count(), info.results().len(), info.in_progress()));
                }
                out
            }
        });
    let _inner = engine.use_global(inner, MiddlewareOptions::builder().priority(10).build());
    let _outer = engine.use_global(outer, MiddlewareOptions::builder().priority(1).build());
    let _h1 = engine.on("e", recording(&order, "h1"));
    let _h2 = engine.on("e", recording(&order, "h2"));

    engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "h1", "h2"]);
    assert_eq!(*seen.lock().unwrap(), Some((2, 2, true)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn global_timeout_abandons_emission_and_discards_late_results() -> AnyResult<()> {
    let engine = Engine::default();
    let finished = Arc::new(AtomicUsize::new(0));
    let done = finished.clone();
    let _slow = engine.on(
        "slow",
        handler_fn(move |_ctx: EventContext<u32>| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok("late".to_string())
            }
        }),
    );

    let options = EmitOptions::builder()
        .global_timeout(Duration::from_millis(100))
        .build();
    let results = engine
        .emit_with("slow", EventContext::new(0), TaskOptions::default(), options.clone())
        .await?;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, TaskState::Failed);
    assert_eq!(results[0].error_code(), Some(codes::TIMEOUT));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // 被放弃的派发继续运行，但其结果不会回到调用方
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    let rethrow = EmitOptions { rethrow: true, ..options };
    let err = engine
        .emit_with("slow", EventContext::new(0), TaskOptions::default(), rethrow)
        .await
        .unwrap_err();
    assert!(matches!(err, EmitError::Aborted(ref e) if e.is_timeout()));
    Ok(())
}

async fn explode(_ctx: EventContext<u32>) -> anyhow::Result<String> {
    panic!("handler exploded")
}

#[tokio::test]
async fn handler_panic_is_isolated() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let _bad = engine.on_with("e", handler_fn(explode), priority(5));
    let _good = engine.on("e", recording(&log, "survivor"));

    let results = engine.emit("e", EventContext::new(0)).await?;

    assert_eq!(results[0].error_code(), Some(codes::PANIC));
    assert!(results[1].is_success());
    Ok(())
}

#[derive(Default)]
struct BrokenStore {
    saves: AtomicUsize,
}

#[async_trait]
impl EventStore<u32, String> for BrokenStore {
    async fn save(&self, record: &EventRecord<'_, u32, String>) -> anyhow::Result<()> {
        assert!(!record.trace_id.is_empty());
        self.saves.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("disk full")
    }
}

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<(String, ErrorType)>>,
}

#[async_trait]
impl ErrorSink<u32> for RecordingSink {
    async fn handle(
        &self,
        _error: &EventError,
        context: &EventContext<u32>,
        error_type: ErrorType,
    ) -> anyhow::Result<()> {
        let name = context.event_name().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push((name, error_type));
        anyhow::bail!("alerting is down")
    }
}

#[tokio::test]
async fn collaborator_failures_never_leak_into_results() -> AnyResult<()> {
    let store = Arc::new(BrokenStore::default());
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::builder()
        .store(store.clone())
        .error_sink(sink.clone())
        .build();
    let log: Log = Arc::default();
    let _ok = engine.on("ok", recording(&log, "ok"));
    let _bad = engine.on("bad", failing(Arc::default()));

    let ok = engine.emit("ok", EventContext::new(0)).await?;
    assert!(ok[0].is_success());

    let retrying = TaskOptions::builder().max_retries(1).build();
    let bad = engine
        .emit_with("bad", EventContext::new(0), retrying, EmitOptions::default())
        .await?;
    assert_eq!(bad[0].attempts, 2);

    let fatal = TaskOptions::builder()
        .max_retries(3)
        .is_retryable(Arc::new(|_: &EventError| false))
        .build();
    engine
        .emit_with("bad", EventContext::new(0), fatal, EmitOptions::default())
        .await?;

    assert_eq!(store.saves.load(Ordering::SeqCst), 3);
    assert_eq!(
        *sink.seen.lock().unwrap(),
        vec![
            ("bad".to_string(), ErrorType::RetriesExhausted),
            ("bad".to_string(), ErrorType::NonRetryable),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn meta_is_enriched_without_overwriting_caller_values() -> AnyResult<()> {
    let engine = Engine::default();
    let _h = engine.on(
        "e",
        handler_fn(|ctx: EventContext<u32>| async move {
            Ok(format!(
                "{}|{}",
                ctx.event_name().unwrap_or_default(),
                ctx.trace_id().unwrap_or_default()
            ))
        }),
    );

    let options = EmitOptions::builder().trace_id("trace-42".to_string()).build();
    let results = engine
        .emit_with(
            "e",
            EventContext::new(0).with_meta("eventName", "custom"),
            TaskOptions::default(),
            options,
        )
        .await?;

    assert_eq!(results[0].result.as_deref(), Some("custom|trace-42"));
    assert_eq!(results[0].trace_id, "trace-42");
    Ok(())
}

#[tokio::test]
async fn destroy_clears_everything_and_is_idempotent() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let sub = engine.on("e", recording(&log, "h"));
    let _p = engine.on("e.*", recording(&log, "p"));

    engine.destroy();
    engine.destroy();

    assert!(engine.event_names().is_empty());
    assert!(engine.emit("e", EventContext::new(0)).await?.is_empty());
    assert!(!sub.unsubscribe());
    Ok(())
}

#[tokio::test]
async fn off_removes_by_reference_or_entirely() -> AnyResult<()> {
    let engine = Engine::default();
    let log: Log = Arc::default();
    let a = recording(&log, "a");
    let b = recording(&log, "b");
    let _a = engine.on("e", a.clone());
    let _a_again = engine.on("e", a.clone());
    let _b = engine.on("e", b.clone());

    assert_eq!(engine.listener_count("e"), 2);
    assert_eq!(engine.off("e", Some(&a)), 1);
    engine.emit("e", EventContext::new(0)).await?;
    assert_eq!(engine.off("e", None), 1);
    assert!(!engine.has_listeners("e"));
    assert_eq!(*log.lock().unwrap(), vec!["b"]);
    Ok(())
}
