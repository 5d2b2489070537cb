//! 订阅模式匹配（PatternMatcher）
//!
//! 将订阅键按分隔符切分为段：
//! - 普通段按字面量比较；
//! - 单层通配段（默认 `*`）匹配恰好一个非空段，但不吸收字面量为通配符号本身的段；
//! - 多层通配段（默认 `**`，需开启 `multi_match`）匹配零或多个完整段，
//!   是否允许匹配零段由 `allow_empty_multi_match` 决定。
//!
//! 编译结果是纯函数产物，按 `(pattern, options)` 缓存，
//! 不同配置的引擎即使共享同一模式字符串也不会相互污染。
//!
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 模式语法配置
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternOptions {
    pub separator: String,
    pub wildcard: String,
    pub multi_wildcard: String,
    pub multi_match: bool,
    pub allow_empty_multi_match: bool,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
            wildcard: "*".to_string(),
            multi_wildcard: "**".to_string(),
            multi_match: true,
            allow_empty_multi_match: false,
        }
    }
}

impl PatternOptions {
    fn split<'a>(&self, s: &'a str) -> Vec<&'a str> {
        if self.separator.is_empty() {
            vec![s]
        } else {
            s.split(self.separator.as_str()).collect()
        }
    }

    fn is_reserved(&self, segment: &str) -> bool {
        segment == self.wildcard || segment == self.multi_wildcard
    }

    /// 键中是否含有通配段（决定注册到精确表还是模式表）
    pub fn is_pattern(&self, key: &str) -> bool {
        self.split(key).into_iter().any(|seg| {
            seg == self.wildcard || (self.multi_match && seg == self.multi_wildcard)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

/// 已编译的订阅模式
#[derive(Debug)]
pub struct CompiledPattern {
    source: String,
    segments: Vec<Segment>,
    has_multi: bool,
    options: PatternOptions,
}

impl CompiledPattern {
    pub fn compile(pattern: &str, options: &PatternOptions) -> Self {
        let segments: Vec<Segment> = options
            .split(pattern)
            .into_iter()
            .map(|seg| {
                if seg == options.wildcard {
                    Segment::Single
                } else if options.multi_match && seg == options.multi_wildcard {
                    Segment::Multi
                } else {
                    Segment::Literal(seg.to_string())
                }
            })
            .collect();
        let has_multi = segments.contains(&Segment::Multi);

        Self {
            source: pattern.to_string(),
            segments,
            has_multi,
            options: options.clone(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, event_name: &str) -> bool {
        let event = self.options.split(event_name);

        if !self.has_multi {
            return event.len() == self.segments.len()
                && self
                    .segments
                    .iter()
                    .zip(&event)
                    .all(|(seg, part)| self.accepts(seg, part));
        }

        self.match_from(&event, 0, 0)
    }

    fn accepts(&self, segment: &Segment, part: &str) -> bool {
        match segment {
            Segment::Literal(lit) => lit == part,
            Segment::Single => !part.is_empty() && !self.options.is_reserved(part),
            Segment::Multi => true,
        }
    }

    // i: 事件段下标，j: 模式段下标
    fn match_from(&self, event: &[&str], i: usize, j: usize) -> bool {
        let Some(segment) = self.segments.get(j) else {
            return i == event.len();
        };

        if *segment == Segment::Multi {
            if j + 1 == self.segments.len() {
                return true;
            }
            let start = if self.options.allow_empty_multi_match {
                i
            } else {
                i + 1
            };
            return (start..=event.len()).any(|split| self.match_from(event, split, j + 1));
        }

        i < event.len() && self.accepts(segment, event[i]) && self.match_from(event, i + 1, j + 1)
    }
}

/// 编译缓存；由引擎持有，可通过 `Arc` 在多个引擎之间显式共享
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: DashMap<(String, PatternOptions), Arc<CompiledPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, pattern: &str, options: &PatternOptions) -> Arc<CompiledPattern> {
        let key = (pattern.to_string(), options.clone());
        self.compiled
            .entry(key)
            .or_insert_with(|| Arc::new(CompiledPattern::compile(pattern, options)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn clear(&self) {
        self.compiled.clear();
    }
}
