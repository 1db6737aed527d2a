//! Session registry shared by all backends.
//!
//! Maps orchestrator session ids to immutable [`SessionRecord`] snapshots.
//! Updates build a new snapshot and swap it in atomically; readers holding
//! an older `Arc` keep a consistent view.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_protocol::AgentMode;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendKind;

/// One session, plus the backend-specific runtime slot `S`.
#[derive(Debug, Clone)]
pub struct SessionRecord<S> {
    pub session_id: String,
    pub working_directory: PathBuf,
    pub mode: AgentMode,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub task_id: Option<String>,
    /// Backend-native conversation id used to resume.
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Scope of the current in-flight operation.
    pub cancel: CancellationToken,
    /// One permit: at most one start/send turn runs at a time. Shared by
    /// every snapshot of the session.
    pub gate: Arc<Semaphore>,
    pub slot: S,
}

impl<S: Clone> SessionRecord<S> {
    pub fn new(
        session_id: impl Into<String>,
        working_directory: PathBuf,
        mode: AgentMode,
        slot: S,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            working_directory,
            mode,
            model: None,
            system_prompt: None,
            task_id: None,
            conversation_id: None,
            created_at: now,
            last_activity: now,
            cancel: CancellationToken::new(),
            gate: Arc::new(Semaphore::new(1)),
            slot,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_task_id(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Copy with a fresh cancellation scope.
    pub fn with_fresh_scope(&self) -> Self {
        let mut next = self.clone();
        next.cancel = CancellationToken::new();
        next
    }

    /// Copy with `last_activity` set to now.
    pub fn touched(&self) -> Self {
        let mut next = self.clone();
        next.last_activity = Utc::now();
        next
    }

    /// Whether an operation currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }

    /// Wait for the session's single operation permit. `None` once the
    /// session has been stopped.
    pub async fn acquire_gate(&self) -> Option<OwnedSemaphorePermit> {
        self.gate.clone().acquire_owned().await.ok()
    }

    pub fn status(&self, backend: BackendKind) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            backend,
            mode: self.mode,
            model: self.model.clone(),
            working_directory: self.working_directory.clone(),
            task_id: self.task_id.clone(),
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            busy: self.is_busy(),
        }
    }
}

/// Read-only view of a session returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub backend: BackendKind,
    pub mode: AgentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub working_directory: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub busy: bool,
}

/// Thread-safe session id -> record map.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: DashMap<String, Arc<SessionRecord<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl<S: Clone> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: SessionRecord<S>) -> Arc<SessionRecord<S>> {
        let record = Arc::new(record);
        self.sessions
            .insert(record.session_id.clone(), Arc::clone(&record));
        record
    }

    /// Insert unless the id is taken. `None` means another record holds it.
    pub fn try_insert(&self, record: SessionRecord<S>) -> Option<Arc<SessionRecord<S>>> {
        match self.sessions.entry(record.session_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let record = Arc::new(record);
                slot.insert(Arc::clone(&record));
                Some(record)
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRecord<S>>> {
        self.sessions.get(session_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionRecord<S>>> {
        self.sessions.remove(session_id).map(|(_, r)| r)
    }

    /// Replace a record with `f(current)`, atomically with respect to other
    /// registry operations. Returns the new snapshot, or `None` if absent.
    pub fn update<F>(&self, session_id: &str, f: F) -> Option<Arc<SessionRecord<S>>>
    where
        F: FnOnce(&SessionRecord<S>) -> SessionRecord<S>,
    {
        let mut entry = self.sessions.get_mut(session_id)?;
        let next = Arc::new(f(entry.value()));
        *entry.value_mut() = Arc::clone(&next);
        Some(next)
    }

    pub fn list(&self) -> Vec<Arc<SessionRecord<S>>> {
        let mut records: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: &str) -> SessionRecord<u32> {
        SessionRecord::new(id, PathBuf::from("/tmp"), AgentMode::Build, 0)
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        registry.insert(record("a"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().session_id, "a");
        assert!(registry.get("missing").is_none());
        assert!(registry.remove("a").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_try_insert_keeps_existing() {
        let registry = SessionRegistry::new();
        let first = registry.try_insert(record("a")).unwrap();
        let second = record("a").with_conversation_id(Some("conv-2".to_string()));
        assert!(registry.try_insert(second).is_none());

        let stored = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &stored));
        assert!(stored.conversation_id.is_none());
    }

    #[test]
    fn test_update_is_copy_on_write() {
        let registry = SessionRegistry::new();
        registry.insert(record("a"));
        let before = registry.get("a").unwrap();

        let after = registry
            .update("a", |r| {
                r.clone()
                    .with_conversation_id(Some("conv-1".to_string()))
            })
            .unwrap();

        assert!(before.conversation_id.is_none());
        assert_eq!(after.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(
            registry.get("a").unwrap().conversation_id.as_deref(),
            Some("conv-1")
        );
        assert!(registry.update("missing", |r| r.clone()).is_none());
    }

    #[test]
    fn test_fresh_scope_keeps_conversation_and_gate() {
        let original = record("a").with_conversation_id(Some("conv".to_string()));
        let fresh = original.with_fresh_scope();

        original.cancel.cancel();
        assert!(!fresh.cancel.is_cancelled());
        assert_eq!(fresh.conversation_id.as_deref(), Some("conv"));
        assert!(Arc::ptr_eq(&original.gate, &fresh.gate));
    }

    #[tokio::test]
    async fn test_gate_serializes_operations() {
        let rec = record("a");
        let permit = rec.acquire_gate().await.unwrap();
        assert!(rec.is_busy());

        let waiter = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.acquire_gate().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects_waiters() {
        let rec = record("a");
        rec.gate.close();
        assert!(rec.acquire_gate().await.is_none());
    }

    #[test]
    fn test_list_sorted_by_creation() {
        let registry = SessionRegistry::new();
        let mut first = record("first");
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        registry.insert(record("second"));
        registry.insert(first);
        let ids: Vec<_> = registry.list().iter().map(|r| r.session_id.clone()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }
}
