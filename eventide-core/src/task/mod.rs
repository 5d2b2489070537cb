//! 单次处理器调用的执行（TaskExecutor）
//!
//! - `TaskState`：调用状态机；
//! - `TaskOptions`：超时、取消、重试与回调配置；
//! - `TaskExecutor`：在超时/取消竞争与重试退避下驱动一次调用；
//! - `EmitResult`：单个处理器的最终结果。
//!
mod executor;
mod options;
mod result;
mod state;

pub use executor::TaskExecutor;
pub use options::{
    RetryCallback, RetryDelay, RetryPredicate, StateCallback, TaskOptions, TimeoutCallback,
};
pub use result::EmitResult;
pub use state::TaskState;
