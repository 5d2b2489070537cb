//! eventide-core 的协作者实现
//!
//! - `store`：内存事件存储；
//! - `dlq`：有界死信队列，可作为 `ErrorSink` 并支持重新派发；
//! - `logger` / `monitor`：以全局中间件实现的日志与性能统计插件；
//! - `broadcast`：显式注入的进程内广播 hub 与引擎桥接。
//!
pub mod broadcast;
pub mod dlq;
pub mod logger;
pub mod monitor;
pub mod store;

pub use broadcast::{
    BridgeHandle, BroadcastBridge, BroadcastHub, BroadcastMessage, HubError, META_BROADCAST_ORIGIN,
};
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use logger::{LOGGER_PRIORITY, LoggerPlugin, LoggingMiddleware, StateCounts};
pub use monitor::{EventStats, MONITOR_PRIORITY, PerformanceMonitor};
pub use store::{InMemoryEventStore, StoredRecord};
