//! 进程内事件派发引擎（eventide-core）
//!
//! 发布/订阅内核：生产者按名称派发事件，零个或多个订阅者被调用，
//! 并提供顺序、重试、超时、取消与有界并发保证。
//!
//! - 模式匹配（`pattern`）：`*` 单层通配、`**` 多层通配，编译结果按配置缓存；
//! - 注册表（`registry`）：优先级排序、按引用去重、once 语义与快照解析；
//! - 任务执行（`task`）：单次处理器调用的重试/超时/取消状态机；
//! - 中间件（`middleware`）：事件级与全局中间件链；
//! - 引擎（`engine`）：解析、组合与串行/有界并发执行，按解析顺序聚合结果；
//! - 协作者（`collaborator`）：事件存储、失败接收端、插件等外部接口。
//!
//! 投递仅限本进程；跨重试不保证恰好一次（处理器可能被多次调用）。
//!
pub mod collaborator;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod pattern;
pub mod registry;
pub mod task;

pub use collaborator::{ErrorSink, ErrorType, EventRecord, EventStore, NoHandlersObserver, Plugin};
pub use context::{EventContext, ExecutionInfo, META_EVENT_NAME, META_TRACE_ID, Meta, ResultSummary};
pub use engine::{EmitOptions, EngineConfig, EventEngine};
pub use error::{EmitError, EmitOutcome, EventError, codes};
pub use handler::{EventHandler, FnHandler, SharedHandler, handler_fn, named_handler_fn};
pub use middleware::{
    Chain, FnMiddleware, Middleware, Next, SharedGlobalMiddleware, SharedMiddleware, middleware_fn,
};
pub use pattern::{CompiledPattern, PatternCache, PatternOptions};
pub use registry::{HandlerOptions, MiddlewareFilter, MiddlewareOptions, Subscription};
pub use task::{EmitResult, RetryDelay, TaskExecutor, TaskOptions, TaskState};
