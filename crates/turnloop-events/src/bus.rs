//! Single-process event bus (spec §4.1).
//!
//! Grounded on the source's `EventBus` for the publish/merge/flush
//! contract, and on `qbit-ai::event_coordinator`'s single-task dispatch
//! pattern for how subscribers are invoked without lock contention:
//! handlers here are plain synchronous closures, the idiomatic shape for
//! "push this into a channel" observers, matching `CoordinatorHandle`'s
//! use of `mpsc::UnboundedSender::send` (non-blocking, infallible from the
//! caller's perspective) as the dispatch primitive.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use turnloop_core::{new_id, now_ts_ms, Event, EventKind};

use crate::event_log::{EventLogError, EventLogStore};

pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if &event.session_id != session_id {
                return false;
            }
        }
        if let Some(request_id) = &self.request_id {
            if event.request_id.as_deref() != Some(request_id.as_str()) {
                return false;
            }
        }
        true
    }
}

type MergeKey = (String, &'static str, Option<String>, Option<String>, Option<String>);

#[derive(Debug, thiserror::Error)]
#[error("event log append failed for kind={kind} event_id={event_id}: {source}")]
pub struct EventLogAppendError {
    pub kind: &'static str,
    pub event_id: String,
    #[source]
    pub source: EventLogError,
}

struct Subscriptions {
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, (EventHandler, EventFilter)>>,
}

pub struct EventBus {
    event_log_store: Option<Arc<EventLogStore>>,
    subs: Subscriptions,
    pending_merge: Mutex<HashMap<MergeKey, Event>>,
}

impl EventBus {
    pub fn new(event_log_store: Option<Arc<EventLogStore>>) -> Self {
        Self {
            event_log_store,
            subs: Subscriptions {
                next_id: AtomicU64::new(1),
                subs: Mutex::new(HashMap::new()),
            },
            pending_merge: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, filter: EventFilter, handler: EventHandler) -> u64 {
        let id = self.subs.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.subs.lock().insert(id, (handler, filter));
        id
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subs.subs.lock().remove(&subscription_id);
    }

    fn dispatch(&self, event: &Event) {
        let subs = self.subs.subs.lock();
        for (handler, filter) in subs.values() {
            if filter.matches(event) {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
                if result.is_err() {
                    tracing::warn!(event_id = %event.event_id, "event subscriber panicked; swallowed");
                }
            }
        }
    }

    async fn append_and_dispatch(&self, event: Event) -> Result<(), EventLogAppendError> {
        if let Some(store) = &self.event_log_store {
            if let Err(source) = store.append(&event).await {
                let emergency = Event {
                    kind: EventKind::OperationFailed,
                    payload: serde_json::json!({
                        "error": format!("Failed to append event log: {source}"),
                        "error_code": "event_log_append_failed",
                        "failed_event": {"kind": event.kind.as_str(), "event_id": event.event_id},
                    }),
                    session_id: event.session_id.clone(),
                    event_id: new_id("evt"),
                    timestamp: now_ts_ms(),
                    request_id: event.request_id.clone(),
                    turn_id: event.turn_id.clone(),
                    step_id: event.step_id.clone(),
                    schema_version: event.schema_version.clone(),
                };
                self.dispatch(&emergency);
                return Err(EventLogAppendError {
                    kind: event.kind.as_str(),
                    event_id: event.event_id,
                    source,
                });
            }
        }
        self.dispatch(&event);
        Ok(())
    }

    /// Drains merged progress entries for `session_id` (or all sessions
    /// if `None`), appending and dispatching each in `(timestamp,
    /// event_id)` order.
    pub async fn flush(&self, session_id: Option<&str>) -> Result<(), EventLogAppendError> {
        let items: Vec<(MergeKey, Event)> = {
            let mut pending = self.pending_merge.lock();
            if pending.is_empty() {
                return Ok(());
            }
            let keys: Vec<MergeKey> = match session_id {
                Some(sid) => pending.keys().filter(|k| k.0 == sid).cloned().collect(),
                None => pending.keys().cloned().collect(),
            };
            keys.into_iter().filter_map(|k| pending.remove(&k).map(|e| (k, e))).collect()
        };

        let mut items = items;
        items.sort_by(|(_, a), (_, b)| a.timestamp.cmp(&b.timestamp).then(a.event_id.cmp(&b.event_id)));
        for (_, event) in items {
            self.append_and_dispatch(event).await?;
        }
        Ok(())
    }

    /// Publishes an event, classifying its kind per spec §4.1.
    pub async fn publish(&self, event: Event) -> Result<(), EventLogAppendError> {
        if event.kind.is_mergeable_progress() {
            let key = event.merge_key();
            self.pending_merge.lock().insert(key, event);
            return Ok(());
        }

        self.flush(Some(event.session_id.as_str())).await?;

        if event.kind.is_ephemeral() {
            self.dispatch(&event);
            return Ok(());
        }

        self.append_and_dispatch(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(session_id: &str, kind: EventKind) -> Event {
        Event {
            kind,
            payload: serde_json::json!({}),
            session_id: session_id.to_string(),
            event_id: new_id("evt"),
            timestamp: now_ts_ms(),
            request_id: None,
            turn_id: Some("turn_1".to_string()),
            step_id: None,
            schema_version: None,
        }
    }

    #[tokio::test]
    async fn ephemeral_events_are_dispatched_but_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLogStore::new(dir.path().to_path_buf()).await.unwrap());
        let bus = EventBus::new(Some(log.clone()));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe(EventFilter::default(), Box::new(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(event("sess_1", EventKind::LlmResponseDelta)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let persisted = log.read("sess_1", None).await.unwrap();
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn durable_events_are_appended_then_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLogStore::new(dir.path().to_path_buf()).await.unwrap());
        let bus = EventBus::new(Some(log.clone()));
        bus.publish(event("sess_1", EventKind::OperationStarted)).await.unwrap();

        let persisted = log.read("sess_1", None).await.unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn mergeable_progress_overwrites_pending_entry_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLogStore::new(dir.path().to_path_buf()).await.unwrap());
        let bus = EventBus::new(Some(log.clone()));

        let mut e1 = event("sess_1", EventKind::OperationProgress);
        e1.payload = serde_json::json!({"pct": 10});
        let mut e2 = e1.clone();
        e2.event_id = new_id("evt");
        e2.payload = serde_json::json!({"pct": 90});

        bus.publish(e1).await.unwrap();
        bus.publish(e2.clone()).await.unwrap();
        assert!(log.read("sess_1", None).await.unwrap().is_empty());

        bus.flush(Some("sess_1")).await.unwrap();
        let persisted = log.read("sess_1", None).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].event_id, e2.event_id);
    }

    #[tokio::test]
    async fn pending_progress_flushes_before_next_non_progress_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLogStore::new(dir.path().to_path_buf()).await.unwrap());
        let bus = EventBus::new(Some(log.clone()));

        bus.publish(event("sess_1", EventKind::ToolCallProgress)).await.unwrap();
        bus.publish(event("sess_1", EventKind::ToolCallEnd)).await.unwrap();

        let persisted = log.read("sess_1", None).await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].kind, EventKind::ToolCallProgress);
        assert_eq!(persisted[1].kind, EventKind::ToolCallEnd);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let id = bus.subscribe(EventFilter::default(), Box::new(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        bus.unsubscribe(id);
        bus.publish(event("sess_1", EventKind::OperationStarted)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
