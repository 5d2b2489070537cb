use crate::error::EmitError;
use crate::pattern::PatternOptions;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 引擎配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 模式语法（分隔符、通配符号、多层通配策略）
    #[serde(flatten)]
    pub pattern: PatternOptions,
    /// 关闭后所有键都按精确键注册
    pub wildcard_enabled: bool,
    pub ignore_no_handlers_warning: bool,
    /// `emit` 未显式传入选项时使用
    pub default_emit: EmitOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pattern: PatternOptions::default(),
            wildcard_enabled: true,
            ignore_no_handlers_warning: false,
            default_emit: EmitOptions::default(),
        }
    }
}

impl EngineConfig {
    pub(crate) fn pattern_options(&self) -> Option<&PatternOptions> {
        self.wildcard_enabled.then_some(&self.pattern)
    }
}

/// 单次派发的编排选项
#[derive(Builder, Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitOptions {
    /// 并发执行处理器；`stop_on_error` 开启时强制串行
    #[builder(default)]
    pub parallel: bool,
    /// 同时在途的处理器上限；`None` 表示不限
    pub max_concurrency: Option<usize>,
    #[builder(default)]
    pub stop_on_error: bool,
    /// 整次派发的超时；到期后放弃等待，迟到结果被丢弃
    pub global_timeout: Option<Duration>,
    pub trace_id: Option<String>,
    /// 覆盖引擎级的同名配置
    pub ignore_no_handlers_warning: Option<bool>,
    /// 编排级失败时返回 `EmitError::Aborted`，而不是一条合成的失败结果
    #[builder(default)]
    pub rethrow: bool,
}

impl EmitOptions {
    pub fn validate(&self) -> Result<(), EmitError> {
        if self.max_concurrency == Some(0) {
            return Err(EmitError::validation("max_concurrency must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout.filter(|d| !d.is_zero())
    }

    pub(crate) fn sequential(&self) -> bool {
        self.stop_on_error || !self.parallel
    }
}

pub(crate) fn validate_event_name(name: &str) -> Result<(), EmitError> {
    if name.trim().is_empty() {
        return Err(EmitError::validation("event name must not be empty"));
    }
    Ok(())
}
