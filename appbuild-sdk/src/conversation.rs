//! Conversation aggregation.
//!
//! Decoded events are filed into one ordered log per application, keyed by
//! the application id carried in each event's trace id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::{AgentEvent, MessageKind};
use crate::phase::{PhaseView, group_phases};
use crate::sse::StreamHandler;
use crate::trace::TraceId;

/// An event that cannot be attributed to any application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("cannot extract an application id from trace id `{0}`")]
    UnparseableTraceId(TraceId),
}

/// The ordered events of one application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationLog {
    events: Vec<AgentEvent>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    ///
    /// When the log already holds events of the same trace and the new event
    /// is not itself a platform notice, that trace's platform notices are
    /// moved after the new event. Nothing else is reordered.
    pub fn append(&mut self, event: AgentEvent) {
        let shares_trace = self.events.iter().any(|e| e.trace_id == event.trace_id);
        if !shares_trace || event.is_platform() {
            self.events.push(event);
            return;
        }

        let (notices, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.events)
            .into_iter()
            .partition(|e| e.trace_id == event.trace_id && e.is_platform());
        self.events = rest;
        self.events.push(event);
        self.events.extend(notices);
    }

    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn last(&self) -> Option<&AgentEvent> {
        self.events.last()
    }

    /// Whether the most recent event is still running.
    pub fn is_running(&self) -> bool {
        self.last().is_some_and(AgentEvent::is_running)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Application id and trace id of the most recently filed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub application_id: String,
    pub trace_id: TraceId,
}

/// What [`ConversationStore::ingest`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Filed under this application id.
    Filed(String),
    /// Keep-alive; nothing to file.
    Skipped,
}

#[derive(Debug, Default)]
struct StoreInner {
    logs: HashMap<String, ConversationLog>,
    last_thread: Option<Thread>,
}

/// Shared per-application conversation logs.
///
/// Clones share the same logs. One writer (the stream handler) appends while
/// any number of readers take snapshots; a reader never observes a partially
/// applied append.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// File one event under the application its trace id names.
    pub fn ingest(&self, event: AgentEvent) -> Result<Ingested, CorrelationError> {
        let Some(app_id) = event.application_id().map(str::to_string) else {
            return Err(CorrelationError::UnparseableTraceId(event.trace_id));
        };
        if event.kind() == MessageKind::KeepAlive {
            return Ok(Ingested::Skipped);
        }

        tracing::debug!(
            app_id = %app_id,
            trace_id = %event.trace_id,
            kind = %event.kind(),
            "filing event"
        );
        let thread = Thread {
            application_id: app_id.clone(),
            trace_id: event.trace_id.clone(),
        };
        let mut inner = self.inner.write();
        inner.logs.entry(app_id.clone()).or_default().append(event);
        inner.last_thread = Some(thread);
        Ok(Ingested::Filed(app_id))
    }

    /// Snapshot of an application's log. Empty if nothing was filed.
    pub fn log(&self, app_id: &str) -> Vec<AgentEvent> {
        self.inner
            .read()
            .logs
            .get(app_id)
            .map(|log| log.events().to_vec())
            .unwrap_or_default()
    }

    pub fn len(&self, app_id: &str) -> usize {
        self.inner.read().logs.get(app_id).map_or(0, ConversationLog::len)
    }

    /// Whether the application's most recent event is still running.
    pub fn is_running(&self, app_id: &str) -> bool {
        self.inner
            .read()
            .logs
            .get(app_id)
            .is_some_and(ConversationLog::is_running)
    }

    /// Phase grouping of an application's log.
    pub fn phase_view(&self, app_id: &str) -> PhaseView {
        let inner = self.inner.read();
        match inner.logs.get(app_id) {
            Some(log) => group_phases(log.events()),
            None => PhaseView::default(),
        }
    }

    /// Where the next message should continue, if anything was filed.
    pub fn last_thread(&self) -> Option<Thread> {
        self.inner.read().last_thread.clone()
    }

    /// Application ids with at least one filed event, sorted.
    pub fn application_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().logs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl StreamHandler for ConversationStore {
    fn on_message(&mut self, event: AgentEvent) -> Result<(), CorrelationError> {
        self.ingest(event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentStatus, PlatformMessageType};
    use serde_json::json;

    fn event(trace: &str, status: &str, kind: &str, text: &str) -> AgentEvent {
        AgentEvent::from_value(json!({
            "status": status,
            "traceId": trace,
            "message": {
                "kind": kind,
                "messages": [{"role": "assistant", "content": text}]
            }
        }))
        .unwrap()
    }

    fn notice(trace: &str, text: &str) -> AgentEvent {
        AgentEvent::platform(
            AgentStatus::Idle,
            TraceId::from(trace),
            text,
            Some(PlatformMessageType::RepoCreated),
        )
    }

    fn texts(events: &[AgentEvent]) -> Vec<String> {
        events.iter().map(AgentEvent::text).collect()
    }

    #[test]
    fn platform_notice_moves_after_same_trace_update() {
        let mut log = ConversationLog::new();
        log.append(notice("app-1.req-1", "A"));
        log.append(event("app-1.req-1", "running", "StageResult", "B"));
        assert_eq!(texts(log.events()), vec!["B", "A"]);
    }

    #[test]
    fn only_platform_notices_are_reordered() {
        let mut log = ConversationLog::new();
        log.append(event("app-1.req-1", "running", "StageResult", "s1"));
        log.append(notice("app-1.req-1", "p1"));
        log.append(event("app-1.req-2", "running", "StageResult", "other"));
        log.append(notice("app-1.req-2", "p2"));
        log.append(event("app-1.req-1", "idle", "RefinementRequest", "r1"));
        assert_eq!(texts(log.events()), vec!["s1", "other", "p2", "r1", "p1"]);
    }

    #[test]
    fn platform_after_platform_appends() {
        let mut log = ConversationLog::new();
        log.append(notice("app-1.req-1", "A"));
        log.append(notice("app-1.req-1", "B"));
        assert_eq!(texts(log.events()), vec!["A", "B"]);
    }

    #[test]
    fn distinct_traces_keep_arrival_order() {
        let mut log = ConversationLog::new();
        log.append(notice("app-1.req-1", "A"));
        log.append(event("app-1.req-2", "running", "StageResult", "B"));
        log.append(event("app-1.req-3", "running", "StageResult", "C"));
        assert_eq!(texts(log.events()), vec!["A", "B", "C"]);
    }

    #[test]
    fn files_by_application() {
        let store = ConversationStore::new();
        store.ingest(event("app-1.req-1", "running", "StageResult", "a")).unwrap();
        store.ingest(event("app-2.req-1", "running", "StageResult", "b")).unwrap();
        store.ingest(event("app-temp-1.req-2", "idle", "StageResult", "c")).unwrap();

        assert_eq!(store.application_ids(), vec!["1", "2"]);
        assert_eq!(texts(&store.log("1")), vec!["a", "c"]);
        assert!(!store.is_running("1"));
        assert!(store.is_running("2"));
        assert!(store.log("3").is_empty());
    }

    #[test]
    fn unparseable_trace_is_never_filed() {
        let store = ConversationStore::new();
        let err = store
            .ingest(event("malformed", "running", "StageResult", "x"))
            .unwrap_err();
        assert_eq!(err, CorrelationError::UnparseableTraceId(TraceId::from("malformed")));
        assert!(store.application_ids().is_empty());
        assert!(store.last_thread().is_none());
    }

    #[test]
    fn keep_alive_is_not_filed() {
        let store = ConversationStore::new();
        let outcome = store
            .ingest(event("app-1.req-1", "running", "KeepAlive", ""))
            .unwrap();
        assert_eq!(outcome, Ingested::Skipped);
        assert_eq!(store.len("1"), 0);
    }

    #[test]
    fn remembers_last_thread() {
        let store = ConversationStore::new();
        store.ingest(event("app-1.req-1", "running", "StageResult", "a")).unwrap();
        store.ingest(event("app-1.req-2", "idle", "StageResult", "b")).unwrap();
        let thread = store.last_thread().unwrap();
        assert_eq!(thread.application_id, "1");
        assert_eq!(thread.trace_id.as_str(), "app-1.req-2");

    }

    #[test]
    fn logs_outlive_later_threads() {
        let store = ConversationStore::new();
        store.ingest(event("app-1.req-1", "idle", "StageResult", "a")).unwrap();
        store.ingest(event("app-2.req-1", "idle", "StageResult", "b")).unwrap();
        store.ingest(event("app-2.req-2", "idle", "StageResult", "c")).unwrap();

        assert_eq!(texts(&store.log("1")), vec!["a"]);
        assert_eq!(store.len("2"), 2);
        assert_eq!(store.last_thread().unwrap().application_id, "2");
    }

    #[test]
    fn readers_never_see_torn_appends() {
        let store = ConversationStore::new();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let trace = format!("app-1.req-{}", i / 2);
                    if i % 2 == 0 {
                        store.ingest(notice(&trace, "notice")).unwrap();
                    } else {
                        store
                            .ingest(event(&trace, "running", "StageResult", "update"))
                            .unwrap();
                    }
                }
            })
        };

        let mut last_len = 0;
        while !writer.is_finished() {
            let log = store.log("1");
            assert!(log.len() >= last_len);
            last_len = log.len();
            // A completed pair always reads update-then-notice.
            for pair in log.chunks_exact(2) {
                assert_eq!(pair[0].kind(), MessageKind::StageResult);
                assert!(pair[1].is_platform());
            }
        }
        writer.join().unwrap();
        assert_eq!(store.len("1"), 200);
    }
}
