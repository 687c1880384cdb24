//! Entry point for every tool operation: picks the session, scopes paths to
//! its workspace, and owns close/reset.

use crate::container::ContainerClient;
use crate::current::CurrentSessionTracker;
use crate::error::Result;
use crate::paths;
use crate::state::{Session, SessionKind, SessionStore};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SessionCoordinator {
    store: Arc<SessionStore>,
    tracker: Arc<CurrentSessionTracker>,
    client: Arc<dyn ContainerClient>,
}

/// A session held for the duration of one operation.
///
/// Releasing touches a persistent session and deletes an ephemeral one. If
/// the lease is dropped without being released (panic, cancelled future) an
/// ephemeral session is still deleted on a spawned task.
pub struct SessionLease {
    session: Session,
    store: Arc<SessionStore>,
    armed: bool,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// End the lease. `succeeded` controls whether a persistent session's
    /// `last_used_at` is refreshed.
    pub async fn release(mut self, succeeded: bool) {
        self.armed = false;
        match self.session.kind {
            SessionKind::Ephemeral => {
                self.store.delete(&self.session.id).await;
            }
            SessionKind::Persistent if succeeded => {
                self.store.touch(&self.session.id).await;
            }
            SessionKind::Persistent => {}
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.armed || self.session.kind != SessionKind::Ephemeral {
            return;
        }
        let store = self.store.clone();
        let id = self.session.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    store.delete(&id).await;
                });
            }
            Err(_) => warn!("Ephemeral session leaked, no runtime to clean it up: {}", id),
        }
    }
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        tracker: Arc<CurrentSessionTracker>,
        client: Arc<dyn ContainerClient>,
    ) -> Self {
        Self { store, tracker, client }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<dyn ContainerClient> {
        &self.client
    }

    /// Pick the session for an operation: a fresh ephemeral one, the named
    /// one, or the current one (created if needed). An empty id counts as none.
    pub async fn resolve_session(&self, explicit: Option<&str>, ephemeral: bool) -> Result<Session> {
        if ephemeral {
            return self.store.create(SessionKind::Ephemeral).await;
        }
        match explicit.filter(|id| !id.is_empty()) {
            Some(id) => self.store.get(id).await,
            None => self.tracker.get_or_create().await,
        }
    }

    /// Resolve a session, make sure the container and its workspace exist,
    /// and hand it out as a lease.
    pub async fn acquire(&self, explicit: Option<&str>, ephemeral: bool) -> Result<SessionLease> {
        self.client.ensure_container().await?;
        let session = self.resolve_session(explicit, ephemeral).await?;
        let mut lease = SessionLease {
            session,
            store: self.store.clone(),
            armed: true,
        };
        match self.workspace_root(&lease.session).await {
            Ok(_) => {
                lease.session.workspace_ready = true;
                Ok(lease)
            }
            Err(e) => {
                lease.release(false).await;
                Err(e)
            }
        }
    }

    /// Run `op` inside a session, releasing it on every exit path.
    pub async fn run_scoped<T, F, Fut>(&self, explicit: Option<&str>, ephemeral: bool, op: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(explicit, ephemeral).await?;
        let result = op(lease.session().clone()).await;
        lease.release(result.is_ok()).await;
        result
    }

    /// The session's workspace directory, created in the container on first use.
    pub async fn workspace_root(&self, session: &Session) -> Result<PathBuf> {
        if !session.workspace_ready {
            self.client.ensure_workspace(&session.workspace_path).await?;
            self.store.mark_workspace_ready(&session.id).await;
        }
        Ok(session.workspace_path.clone())
    }

    /// Map a container-side path into the session: relative paths are
    /// sandboxed under the workspace, absolute paths pass through.
    pub fn scope_path(&self, session: &Session, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        paths::resolve(&session.workspace_path, path)
    }

    /// Mint a new session and make it current.
    pub async fn new_current(&self) -> Result<Session> {
        self.client.ensure_container().await?;
        let session = self.tracker.new_current().await?;
        self.workspace_root(&session).await?;
        Ok(session)
    }

    pub async fn current_id(&self) -> Option<String> {
        self.tracker.current_id().await
    }

    /// Delete a session, clearing the current pointer if it named it.
    /// Closing an unknown id is not an error.
    pub async fn close(&self, id: &str) -> bool {
        self.tracker.clear_if_current(id).await;
        let existed = self.store.delete(id).await;
        if existed {
            info!("Closed session: {}", id);
        }
        existed
    }

    /// Close whatever session is current.
    pub async fn close_current(&self) -> Option<String> {
        let id = self.tracker.clear_current().await?;
        self.store.delete(&id).await;
        info!("Closed current session: {}", id);
        Some(id)
    }

    /// Drop every session and rebuild the container from its base image.
    pub async fn reset(&self) -> Result<String> {
        self.tracker.reset().await
    }
}
