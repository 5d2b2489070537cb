//! 内存版事件存储（InMemoryEventStore）
//!
//! 保存每个处理器调用记录的自有副本，适用于测试、示例与本地审计。
//!
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::{EventError, EventRecord, EventStore, Meta, TaskState};
use std::sync::{Mutex, PoisonError};

/// 已保存的记录
#[derive(Clone, Debug)]
pub struct StoredRecord<T, R> {
    pub event_name: String,
    pub handler_index: usize,
    pub data: T,
    pub meta: Meta,
    pub result: Option<R>,
    pub error: Option<EventError>,
    pub state: TaskState,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

pub struct InMemoryEventStore<T, R> {
    records: Mutex<Vec<StoredRecord<T, R>>>,
}

impl<T, R> Default for InMemoryEventStore<T, R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone, R: Clone> InMemoryEventStore<T, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StoredRecord<T, R>> {
        self.lock().clone()
    }

    /// 同一次派发（trace id）的全部记录
    pub fn by_trace(&self, trace_id: &str) -> Vec<StoredRecord<T, R>> {
        self.lock()
            .iter()
            .filter(|r| r.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredRecord<T, R>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T, R> EventStore<T, R> for InMemoryEventStore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    async fn save(&self, record: &EventRecord<'_, T, R>) -> anyhow::Result<()> {
        let stored = StoredRecord {
            event_name: record.event_name.to_string(),
            handler_index: record.handler_index,
            data: record.context.data.clone(),
            meta: record.context.meta.clone(),
            result: record.result.cloned(),
            error: record.error.cloned(),
            state: record.state,
            trace_id: record.trace_id.to_string(),
            timestamp: record.timestamp,
        };
        self.lock().push(stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::{EmitOptions, EventContext, EventEngine, TaskOptions, handler_fn};
    use std::sync::Arc;

    #[tokio::test]
    async fn keeps_one_record_per_handler_call() {
        let store = Arc::new(InMemoryEventStore::<String, usize>::new());
        let engine = EventEngine::<String, usize>::builder().store(store.clone()).build();
        let _len = engine.on(
            "note.*",
            handler_fn(|ctx: EventContext<String>| async move { Ok(ctx.data.len()) }),
        );
        let _fail = engine.on(
            "note.saved",
            handler_fn(|_ctx: EventContext<String>| async move {
                Err::<usize, _>(anyhow::anyhow!("read only"))
            }),
        );

        let options = EmitOptions::builder().trace_id("t-1".to_string()).build();
        engine
            .emit_with("note.saved", EventContext::new("hello".into()), TaskOptions::default(), options)
            .await
            .unwrap();

        let records = store.by_trace("t-1");
        assert_eq!(records.len(), 2);
        let ok = records.iter().find(|r| r.state == TaskState::Succeeded).unwrap();
        assert_eq!(ok.result, Some(5));
        assert_eq!(ok.data, "hello");
        assert_eq!(ok.event_name, "note.saved");
        let failed = records.iter().find(|r| r.state == TaskState::Failed).unwrap();
        assert_eq!(failed.error.as_ref().map(EventError::message), Some("read only"));

        store.clear();
        assert!(store.is_empty());
    }
}
