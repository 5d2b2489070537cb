//! 处理器与中间件注册表（Registry）
//!
//! - 精确键与模式键分表存放，模式键持有编译后的匹配器；
//! - 同一引用在同一键下重复注册为幂等空操作；
//! - 解析结果为按优先级降序、同优先级按注册顺序的快照，并按引用去重；
//! - 全局中间件单独存放，不按事件名索引，按优先级升序排列。
//!
//! 所有修改只经由注册/注销完成；派发在解析得到的快照上进行，
//! 派发过程中的注销不会影响本次派发的匹配集合。
//!
use crate::context::EventContext;
use crate::error::EventError;
use crate::handler::{SharedHandler, same_handler};
use crate::middleware::{SharedGlobalMiddleware, SharedMiddleware, same_middleware};
use crate::pattern::{CompiledPattern, PatternCache, PatternOptions};
use bon::Builder;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// 中间件过滤条件；未设置时总是通过
pub type MiddlewareFilter<T> = Arc<dyn Fn(&EventContext<T>) -> bool + Send + Sync>;

/// 注册键
#[derive(Clone, Debug)]
pub enum Key {
    Exact(Arc<str>),
    Pattern(Arc<CompiledPattern>),
}

impl Key {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(name) => name,
            Self::Pattern(pattern) => pattern.source(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    fn origin(&self) -> Origin {
        match self {
            Self::Exact(name) => Origin::Exact(name.clone()),
            Self::Pattern(pattern) => Origin::Pattern(Arc::from(pattern.source())),
        }
    }
}

/// 注册条目所在位置（用于 once 清理与注销）
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Exact(Arc<str>),
    Pattern(Arc<str>),
    Global,
}

/// 处理器注册选项
#[derive(Builder, Clone, Copy, Debug, Default)]
pub struct HandlerOptions {
    #[builder(default)]
    pub once: bool,
    #[builder(default)]
    pub priority: i32,
}

/// 中间件注册选项
#[derive(Builder, Clone)]
pub struct MiddlewareOptions<T> {
    #[builder(default)]
    pub priority: i32,
    pub filter: Option<MiddlewareFilter<T>>,
}

impl<T> Default for MiddlewareOptions<T> {
    fn default() -> Self {
        Self {
            priority: 0,
            filter: None,
        }
    }
}

impl<T> fmt::Debug for MiddlewareOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareOptions")
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// 一条注册记录（解析快照中的元素）
pub struct Registration<X: ?Sized, T> {
    id: u64,
    item: Arc<X>,
    once: bool,
    priority: i32,
    filter: Option<MiddlewareFilter<T>>,
    origin: Origin,
}

impl<X: ?Sized, T> Clone for Registration<X, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            item: self.item.clone(),
            once: self.once,
            priority: self.priority,
            filter: self.filter.clone(),
            origin: self.origin.clone(),
        }
    }
}

impl<X: ?Sized, T> Registration<X, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn item(&self) -> &Arc<X> {
        &self.item
    }

    pub fn once(&self) -> bool {
        self.once
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn entry_ref(&self) -> EntryRef {
        EntryRef {
            origin: self.origin.clone(),
            id: self.id,
            once: self.once,
        }
    }

    /// 过滤器 panic 时视为未通过
    fn accepts(&self, ctx: &EventContext<T>) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| filter(ctx))) {
            Ok(pass) => pass,
            Err(payload) => {
                let err = EventError::from_panic(payload);
                tracing::warn!(
                    registration = self.id,
                    origin = ?self.origin,
                    error = %err,
                    "middleware filter panicked; entry skipped"
                );
                false
            }
        }
    }
}

impl<X: ?Sized, T> fmt::Debug for Registration<X, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("once", &self.once)
            .field("priority", &self.priority)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// 已调用条目的引用，用于派发完成后的 once 清理
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRef {
    pub origin: Origin,
    pub id: u64,
    pub once: bool,
}

struct PatternSlot<X: ?Sized, T> {
    matcher: Arc<CompiledPattern>,
    entries: Vec<Registration<X, T>>,
}

struct Table<X: ?Sized, T> {
    exact: HashMap<Arc<str>, Vec<Registration<X, T>>>,
    patterns: HashMap<Arc<str>, PatternSlot<X, T>>,
}

impl<X: ?Sized, T> Default for Table<X, T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: HashMap::new(),
        }
    }
}

impl<X: ?Sized, T> Table<X, T> {
    fn slot_mut(&mut self, key: &Key) -> &mut Vec<Registration<X, T>> {
        match key {
            Key::Exact(name) => self.exact.entry(name.clone()).or_default(),
            Key::Pattern(pattern) => {
                &mut self
                    .patterns
                    .entry(Arc::from(pattern.source()))
                    .or_insert_with(|| PatternSlot {
                        matcher: pattern.clone(),
                        entries: Vec::new(),
                    })
                    .entries
            }
        }
    }

    fn existing(&self, key: &Key) -> Option<&Vec<Registration<X, T>>> {
        match key {
            Key::Exact(name) => self.exact.get(name),
            Key::Pattern(pattern) => self.patterns.get(pattern.source()).map(|s| &s.entries),
        }
    }

    /// 同一键下已存在相同引用时返回已有条目 ID
    fn insert(
        &mut self,
        key: &Key,
        entry: Registration<X, T>,
        same: impl Fn(&Arc<X>, &Arc<X>) -> bool,
    ) -> (u64, bool) {
        let slot = self.slot_mut(key);
        if let Some(found) = slot.iter().find(|e| same(&e.item, &entry.item)) {
            return (found.id, false);
        }
        let id = entry.id;
        slot.push(entry);
        (id, true)
    }

    fn retain_in(&mut self, origin: &Origin, mut keep: impl FnMut(&Registration<X, T>) -> bool) -> usize {
        let removed = match origin {
            Origin::Exact(name) => self.exact.get_mut(name).map(|list| {
                let before = list.len();
                list.retain(|e| keep(e));
                before - list.len()
            }),
            Origin::Pattern(source) => self.patterns.get_mut(source).map(|slot| {
                let before = slot.entries.len();
                slot.entries.retain(|e| keep(e));
                before - slot.entries.len()
            }),
            Origin::Global => None,
        };
        self.prune();
        removed.unwrap_or(0)
    }

    fn prune(&mut self) {
        self.exact.retain(|_, list| !list.is_empty());
        self.patterns.retain(|_, slot| !slot.entries.is_empty());
    }

    /// 精确匹配与模式匹配的并集（未排序、未去重）
    fn collect(&self, event_name: &str) -> Vec<Registration<X, T>> {
        let mut out: Vec<Registration<X, T>> = self
            .exact
            .get(event_name)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for slot in self.patterns.values() {
            if slot.matcher.matches(event_name) {
                out.extend(slot.entries.iter().cloned());
            }
        }
        out
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        self.exact
            .keys()
            .chain(self.patterns.keys())
            .map(|k| k.as_ref())
    }

    fn clear(&mut self) {
        self.exact.clear();
        self.patterns.clear();
    }
}

/// 降序优先级，同优先级按注册顺序；随后按引用去重（保留首个）
fn order_and_dedup<X: ?Sized, T>(
    mut list: Vec<Registration<X, T>>,
    descending: bool,
) -> Vec<Registration<X, T>> {
    list.sort_by(|a, b| {
        let by_priority = if descending {
            b.priority.cmp(&a.priority)
        } else {
            a.priority.cmp(&b.priority)
        };
        by_priority.then(a.id.cmp(&b.id))
    });

    let mut seen: HashSet<*const ()> = HashSet::with_capacity(list.len());
    list.retain(|e| seen.insert(Arc::as_ptr(&e.item).cast::<()>()));
    list
}

struct RegistryState<T, R> {
    handlers: Table<dyn crate::handler::EventHandler<T, R>, T>,
    middleware: Table<dyn crate::middleware::Middleware<T, R>, T>,
    global: Vec<Registration<dyn crate::middleware::Middleware<T, Vec<crate::task::EmitResult<R>>>, T>>,
}

impl<T, R> Default for RegistryState<T, R> {
    fn default() -> Self {
        Self {
            handlers: Table::default(),
            middleware: Table::default(),
            global: Vec::new(),
        }
    }
}

/// 注册表
pub struct Registry<T, R> {
    state: RwLock<RegistryState<T, R>>,
    patterns: PatternCache,
    seq: AtomicU64,
}

impl<T, R> Default for Registry<T, R> {
    fn default() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            patterns: PatternCache::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T, R> fmt::Debug for Registry<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Registry")
            .field("handler_keys", &state.handlers.keys().count())
            .field("middleware_keys", &state.middleware.keys().count())
            .field("global_middleware", &state.global.len())
            .finish()
    }
}

/// 注销句柄：只移除其对应的那一条注册
#[must_use = "dropping a Subscription keeps the registration; call `unsubscribe` to remove it"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() -> bool + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// 返回是否确实移除了一条注册
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().is_some_and(|f| f())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

impl<T, R> Registry<T, R> {
    fn read(&self) -> RwLockReadGuard<'_, RegistryState<T, R>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState<T, R>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl<T, R> Registry<T, R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置把原始字符串解析为精确键或模式键；`options` 为 `None` 表示关闭通配
    pub fn key_for(&self, raw: &str, options: Option<&PatternOptions>) -> Key {
        match options {
            Some(opts) if opts.is_pattern(raw) => Key::Pattern(self.patterns.compile(raw, opts)),
            _ => Key::Exact(Arc::from(raw)),
        }
    }

    pub fn pattern_cache(&self) -> &PatternCache {
        &self.patterns
    }

    // ---- handlers ----

    pub fn add_handler(
        self: &Arc<Self>,
        key: Key,
        handler: SharedHandler<T, R>,
        options: HandlerOptions,
    ) -> Subscription {
        let entry = Registration {
            id: self.next_id(),
            item: handler,
            once: options.once,
            priority: options.priority,
            filter: None,
            origin: key.origin(),
        };
        let (id, inserted) = self.write().handlers.insert(&key, entry, same_handler);
        if !inserted {
            tracing::debug!(key = key.as_str(), "handler already registered under key");
        }

        let registry = Arc::downgrade(self);
        let origin = key.origin();
        Subscription::new(move || remove_by_id(&registry, |s| &mut s.handlers, &origin, id))
    }

    /// `handler` 为 `None` 时清空该键下全部处理器
    pub fn remove_handlers(&self, key: &Key, handler: Option<&SharedHandler<T, R>>) -> usize {
        let origin = key.origin();
        self.write()
            .handlers
            .retain_in(&origin, |e| handler.is_some_and(|h| !same_handler(&e.item, h)))
    }

    pub fn resolve_handlers(
        &self,
        event_name: &str,
    ) -> Vec<Registration<dyn crate::handler::EventHandler<T, R>, T>> {
        let collected = self.read().handlers.collect(event_name);
        order_and_dedup(collected, true)
    }

    pub fn handler_count(&self, key: &Key) -> usize {
        self.read().handlers.existing(key).map_or(0, Vec::len)
    }

    // ---- event-scoped middleware ----

    pub fn add_middleware(
        self: &Arc<Self>,
        key: Key,
        middleware: SharedMiddleware<T, R>,
        options: MiddlewareOptions<T>,
    ) -> Subscription {
        let entry = Registration {
            id: self.next_id(),
            item: middleware,
            once: false,
            priority: options.priority,
            filter: options.filter,
            origin: key.origin(),
        };
        let (id, _) = self.write().middleware.insert(&key, entry, same_middleware);

        let registry = Arc::downgrade(self);
        let origin = key.origin();
        Subscription::new(move || remove_by_id(&registry, |s| &mut s.middleware, &origin, id))
    }

    pub fn remove_middleware(&self, key: &Key, middleware: Option<&SharedMiddleware<T, R>>) -> usize {
        let origin = key.origin();
        self.write()
            .middleware
            .retain_in(&origin, |e| middleware.is_some_and(|m| !same_middleware(&e.item, m)))
    }

    /// 匹配且通过过滤的事件级中间件，降序优先级；先过滤再去重
    pub fn resolve_middleware(
        &self,
        event_name: &str,
        ctx: &EventContext<T>,
    ) -> Vec<SharedMiddleware<T, R>> {
        let collected = self.read().middleware.collect(event_name);
        let accepted = collected.into_iter().filter(|e| e.accepts(ctx)).collect();
        order_and_dedup(accepted, true)
            .into_iter()
            .map(|e| e.item)
            .collect()
    }

    // ---- global middleware ----

    pub fn add_global(
        self: &Arc<Self>,
        middleware: SharedGlobalMiddleware<T, R>,
        options: MiddlewareOptions<T>,
    ) -> Subscription {
        let id = {
            let mut state = self.write();
            let existing = state
                .global
                .iter()
                .find(|e| same_middleware(&e.item, &middleware))
                .map(|e| e.id);
            match existing {
                Some(id) => id,
                None => {
                    let id = self.next_id();
                    state.global.push(Registration {
                        id,
                        item: middleware,
                        once: false,
                        priority: options.priority,
                        filter: options.filter,
                        origin: Origin::Global,
                    });
                    id
                }
            }
        };

        let registry = Arc::downgrade(self);
        Subscription::new(move || {
            registry.upgrade().is_some_and(|r| {
                let mut state = r.write();
                let before = state.global.len();
                state.global.retain(|e| e.id != id);
                before != state.global.len()
            })
        })
    }

    pub fn remove_global(&self, middleware: Option<&SharedGlobalMiddleware<T, R>>) -> usize {
        let mut state = self.write();
        let before = state.global.len();
        state
            .global
            .retain(|e| middleware.is_some_and(|m| !same_middleware(&e.item, m)));
        before - state.global.len()
    }

    /// 通过过滤的全局中间件，升序优先级（首个为最外层）
    pub fn resolve_global(&self, ctx: &EventContext<T>) -> Vec<SharedGlobalMiddleware<T, R>> {
        let collected = self.read().global.clone();
        let accepted = collected.into_iter().filter(|e| e.accepts(ctx)).collect();
        order_and_dedup(accepted, false)
            .into_iter()
            .map(|e| e.item)
            .collect()
    }

    // ---- lifecycle ----

    /// 仅移除被调用且带 once 标记的那一条注册
    pub fn cleanup_once(&self, invoked: &[EntryRef]) -> usize {
        let targets: Vec<&EntryRef> = invoked.iter().filter(|e| e.once).collect();
        if targets.is_empty() {
            return 0;
        }
        let mut state = self.write();
        targets
            .into_iter()
            .map(|target| {
                state
                    .handlers
                    .retain_in(&target.origin, |e| e.id != target.id)
            })
            .sum()
    }

    /// 已注册的精确键与模式键
    pub fn keys(&self) -> Vec<String> {
        let state = self.read();
        let mut keys: Vec<String> = state.handlers.keys().map(str::to_string).collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.handlers.clear();
        state.middleware.clear();
        state.global.clear();
    }
}

fn remove_by_id<T, R, X: ?Sized>(
    registry: &Weak<Registry<T, R>>,
    table: impl FnOnce(&mut RegistryState<T, R>) -> &mut Table<X, T>,
    origin: &Origin,
    id: u64,
) -> bool {
    let Some(registry) = registry.upgrade() else {
        return false;
    };
    let mut state = registry.write();
    table(&mut *state).retain_in(origin, |e| e.id != id) > 0
}
