//! 死信队列（DeadLetterQueue）
//!
//! 作为引擎的 `ErrorSink` 接收重试耗尽或不可重试的失败：
//! - 容量有界，满时淘汰最旧条目；
//! - `drain` 取出全部条目，`redrive` 将每次失败的派发重新派发到引擎一次。
//!
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::{
    EmitOutcome, ErrorSink, ErrorType, EventContext, EventEngine, EventError, META_TRACE_ID, Meta,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 一条死信
#[derive(Clone, Debug)]
pub struct DeadLetter<T> {
    pub event_name: String,
    pub trace_id: String,
    pub data: T,
    pub meta: Meta,
    pub error: EventError,
    pub error_type: ErrorType,
    pub failed_at: DateTime<Utc>,
}

pub struct DeadLetterQueue<T> {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter<T>>>,
    evicted: AtomicU64,
}

impl<T: Clone> DeadLetterQueue<T> {
    /// `capacity` 至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> Vec<DeadLetter<T>> {
        self.lock().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 因容量不足被淘汰的条目数
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn push(&self, letter: DeadLetter<T>) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(letter);
    }

    /// 取出全部死信，每次原始派发（按 trace id 归并）只重新派发一次；再次失败的会重新进入队列
    ///
    /// 重新派发会再次调用该事件的全部处理器，处理器需自行保证幂等。
    pub async fn redrive<R>(&self, engine: &EventEngine<T, R>) -> Vec<EmitOutcome<R>>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let mut seen = HashSet::new();
        let letters: Vec<DeadLetter<T>> = self
            .drain()
            .into_iter()
            .filter(|letter| seen.insert(letter.trace_id.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(letters.len());
        for letter in letters {
            let mut meta = letter.meta;
            // 新的派发使用新的 trace id
            meta.remove(META_TRACE_ID);
            let ctx = EventContext {
                meta,
                ..EventContext::new(letter.data)
            };
            tracing::debug!(event = %letter.event_name, previous_trace_id = %letter.trace_id, "redriving dead letter");
            outcomes.push(engine.emit(&letter.event_name, ctx).await);
        }
        outcomes
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetter<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T> ErrorSink<T> for DeadLetterQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(
        &self,
        error: &EventError,
        context: &EventContext<T>,
        error_type: ErrorType,
    ) -> anyhow::Result<()> {
        let letter = DeadLetter {
            event_name: context.event_name().unwrap_or_default().to_string(),
            trace_id: context.trace_id().unwrap_or_default().to_string(),
            data: context.data.clone(),
            meta: context.meta.clone(),
            error: error.clone(),
            error_type,
            failed_at: Utc::now(),
        };
        tracing::warn!(
            event = %letter.event_name,
            trace_id = %letter.trace_id,
            error_type = %error_type,
            code = error.code(),
            "dead letter recorded"
        );
        self.push(letter);
        Ok(())
    }
}
