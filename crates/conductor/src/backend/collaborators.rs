//! Seams to the host application.
//!
//! Backends call out to three collaborators they do not own: a workspace
//! provider, a message cache and a live-update sink. Each has a no-op
//! default so the orchestrator runs standalone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_protocol::Event;

/// Host directory a task's agent works in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub working_directory: PathBuf,
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Make sure the task's workspace exists. `Ok(None)` means the caller's
    /// working directory is used as is.
    async fn ensure_workspace(&self, task_id: &str) -> anyhow::Result<Option<Workspace>> {
        let _ = task_id;
        Ok(None)
    }
}

#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn initialize_session(
        &self,
        session_id: &str,
        working_directory: &Path,
        task_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let _ = (session_id, working_directory, task_id);
        Ok(())
    }

    async fn append_message(&self, session_id: &str, event: &Event) -> anyhow::Result<()> {
        let _ = (session_id, event);
        Ok(())
    }
}

#[async_trait]
pub trait LiveUpdateSink: Send + Sync {
    async fn notify(&self, session_id: &str, event: &Event) {
        let _ = (session_id, event);
    }
}

/// Does nothing for every collaborator role.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollaborator;

impl WorkspaceProvider for NoopCollaborator {}
impl MessageCache for NoopCollaborator {}
impl LiveUpdateSink for NoopCollaborator {}

/// Collaborators handed to a backend.
#[derive(Clone)]
pub struct Collaborators {
    pub workspaces: Arc<dyn WorkspaceProvider>,
    pub cache: Arc<dyn MessageCache>,
    pub live: Arc<dyn LiveUpdateSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            workspaces: Arc::new(NoopCollaborator),
            cache: Arc::new(NoopCollaborator),
            live: Arc::new(NoopCollaborator),
        }
    }
}

impl Collaborators {
    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_live_updates(mut self, live: Arc<dyn LiveUpdateSink>) -> Self {
        self.live = live;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
