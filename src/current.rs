//! The implicit "current session" used when a caller names none.

use crate::container::ContainerClient;
use crate::error::Result;
use crate::state::{Session, SessionKind, SessionStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Marker file name inside the sessions root.
pub const MARKER_FILE: &str = ".current";

/// What the in-container marker records about the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Marker {
    session_id: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Pointer {
    id: Option<String>,
    marker_written_at: Option<DateTime<Utc>>,
}

/// Holds the process-wide current-session pointer and mirrors it to a
/// marker inside the container so a restarted process can reattach.
pub struct CurrentSessionTracker {
    pointer: Mutex<Pointer>,
    store: Arc<SessionStore>,
    client: Arc<dyn ContainerClient>,
    marker_path: PathBuf,
}

impl CurrentSessionTracker {
    pub fn new(store: Arc<SessionStore>, client: Arc<dyn ContainerClient>) -> Self {
        let marker_path = store.config().sessions_root.join(MARKER_FILE);
        Self {
            pointer: Mutex::new(Pointer::default()),
            store,
            client,
            marker_path,
        }
    }

    pub fn marker_path(&self) -> &std::path::Path {
        &self.marker_path
    }

    /// Return the current session, touching it, or mint and install a new one.
    ///
    /// The whole check-then-create runs under the pointer lock, so concurrent
    /// callers all end up with the same session.
    pub async fn get_or_create(&self) -> Result<Session> {
        let mut pointer = self.pointer.lock().await;
        if let Some(id) = pointer.id.clone() {
            if let Some(session) = self.store.touch(&id).await {
                if self.marker_is_stale(&pointer) {
                    self.persist(&mut pointer, &session).await;
                }
                return Ok(session);
            }
            info!("Current session no longer live: {}", id);
        }
        self.install_new(&mut pointer).await
    }

    /// Always mint a fresh session and make it current.
    pub async fn new_current(&self) -> Result<Session> {
        let mut pointer = self.pointer.lock().await;
        self.install_new(&mut pointer).await
    }

    /// Point at an existing live session.
    pub async fn set_current(&self, id: &str) -> Result<Session> {
        let mut pointer = self.pointer.lock().await;
        let session = self.store.get(id).await?;
        pointer.id = Some(session.id.clone());
        self.persist(&mut pointer, &session).await;
        Ok(session)
    }

    /// Forget the current session. Returns the id that was current, if any.
    pub async fn clear_current(&self) -> Option<String> {
        let mut pointer = self.pointer.lock().await;
        let previous = pointer.id.take();
        self.unpersist(&mut pointer).await;
        previous
    }

    /// Drop every session, forget the pointer and rebuild the container.
    ///
    /// Holds the pointer lock throughout, so an implicit caller either sees
    /// the old current session or waits and mints one in the new container.
    pub async fn reset(&self) -> Result<String> {
        let mut pointer = self.pointer.lock().await;
        let cleared = self.store.clear().await;
        pointer.id = None;
        self.unpersist(&mut pointer).await;
        info!("Resetting container, cleared {} sessions", cleared);
        Ok(self.client.recreate_container().await?)
    }

    /// Clear the pointer only if it names `id`.
    pub async fn clear_if_current(&self, id: &str) -> bool {
        let mut pointer = self.pointer.lock().await;
        if pointer.id.as_deref() != Some(id) {
            return false;
        }
        pointer.id = None;
        self.unpersist(&mut pointer).await;
        true
    }

    /// The current session id, if it still names a live session. A dangling
    /// pointer is cleared here.
    pub async fn current_id(&self) -> Option<String> {
        let mut pointer = self.pointer.lock().await;
        let id = pointer.id.clone()?;
        if self.store.get(&id).await.is_ok() {
            return Some(id);
        }
        pointer.id = None;
        None
    }

    /// Reattach to the session named by the marker left by a previous process.
    ///
    /// The recorded `last_used_at` is kept, so a session that idled past its
    /// TTL while nothing was running is discarded instead of revived. Any
    /// failure here just leaves no current session.
    pub async fn restore(&self) -> Option<Session> {
        let mut pointer = self.pointer.lock().await;
        let body = match self.client.read_marker(&self.marker_path).await {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not read current-session marker: {:#}", e);
                return None;
            }
        };

        let marker: Marker = match serde_json::from_str(&body) {
            Ok(marker) => marker,
            Err(e) => {
                warn!("Ignoring unreadable current-session marker: {}", e);
                self.unpersist(&mut pointer).await;
                return None;
            }
        };

        let workspace_path = match self.store.workspace_for(&marker.session_id) {
            Ok(path) => path,
            Err(e) => {
                warn!("Ignoring current-session marker with bad id: {}", e);
                self.unpersist(&mut pointer).await;
                return None;
            }
        };

        let recovered = Session {
            id: marker.session_id.clone(),
            kind: SessionKind::Persistent,
            workspace_path: workspace_path.clone(),
            created_at: marker.created_at,
            last_used_at: marker.last_used_at,
            workspace_ready: false,
        };

        match self.store.adopt(recovered).await {
            Ok(session) => {
                info!("Reattached current session: {}", session.id);
                pointer.id = Some(session.id.clone());
                pointer.marker_written_at = Some(marker.last_used_at);
                Some(session)
            }
            Err(e) => {
                info!("Discarding previous current session {}: {}", marker.session_id, e);
                if let Err(e) = self.client.delete_path(&workspace_path).await {
                    warn!("Failed to delete stale session workspace: {:#}", e);
                }
                self.unpersist(&mut pointer).await;
                None
            }
        }
    }

    async fn install_new(&self, pointer: &mut Pointer) -> Result<Session> {
        let session = self.store.create(SessionKind::Persistent).await?;
        pointer.id = Some(session.id.clone());
        self.persist(pointer, &session).await;
        info!("New current session: {}", session.id);
        Ok(session)
    }

    // Rewritten at most once per quarter TTL, so after a restart the session
    // can look up to ttl/4 older than it really is.
    fn marker_is_stale(&self, pointer: &Pointer) -> bool {
        let refresh = self.store.config().ttl / 4;
        match pointer.marker_written_at {
            None => true,
            Some(at) => self
                .store
                .now()
                .signed_duration_since(at)
                .to_std()
                .map(|age| age >= refresh)
                .unwrap_or(false),
        }
    }

    async fn persist(&self, pointer: &mut Pointer, session: &Session) {
        let marker = Marker {
            session_id: session.id.clone(),
            created_at: session.created_at,
            last_used_at: session.last_used_at,
        };
        let body = match serde_json::to_string(&marker) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode current-session marker: {}", e);
                return;
            }
        };
        match self.client.write_marker(&self.marker_path, &body).await {
            Ok(()) => pointer.marker_written_at = Some(session.last_used_at),
            Err(e) => warn!("Failed to write current-session marker: {:#}", e),
        }
    }

    async fn unpersist(&self, pointer: &mut Pointer) {
        pointer.marker_written_at = None;
        if let Err(e) = self.client.delete_path(&self.marker_path).await {
            warn!("Failed to remove current-session marker: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeContainer;
    use crate::state::{Clock, ManualClock, StoreConfig};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        client: Arc<FakeContainer>,
        store: Arc<SessionStore>,
        tracker: CurrentSessionTracker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let client = Arc::new(FakeContainer::default());
        let store = Arc::new(SessionStore::new(StoreConfig::default(), clock.clone(), client.clone()));
        let tracker = CurrentSessionTracker::new(store.clone(), client.clone());
        Fixture {
            clock,
            client,
            store,
            tracker,
        }
    }

    /// A second tracker over an empty store sharing the same container, as
    /// after a process restart.
    fn restarted(f: &Fixture) -> (Arc<SessionStore>, CurrentSessionTracker) {
        let store = Arc::new(SessionStore::new(StoreConfig::default(), f.clock.clone(), f.client.clone()));
        let tracker = CurrentSessionTracker::new(store.clone(), f.client.clone());
        (store, tracker)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let f = fixture();
        let first = f.tracker.get_or_create().await.unwrap();
        f.clock.advance(Duration::from_secs(10));
        let second = f.tracker.get_or_create().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.last_used_at, f.clock.now());
        assert_eq!(f.store.len().await, 1);
        assert_eq!(f.tracker.current_id().await, Some(first.id));
    }

    #[tokio::test]
    async fn get_or_create_replaces_expired_current() {
        let f = fixture();
        let first = f.tracker.get_or_create().await.unwrap();
        f.clock.advance(Duration::from_secs(601));
        let second = f.tracker.get_or_create().await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn dangling_pointer_heals_silently() {
        let f = fixture();
        let first = f.tracker.get_or_create().await.unwrap();
        f.store.delete(&first.id).await;

        assert_eq!(f.tracker.current_id().await, None);
        let second = f.tracker.get_or_create().await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_current_session() {
        let f = fixture();
        let tracker = Arc::new(f.tracker);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move { tracker.get_or_create().await.unwrap().id }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn marker_is_written_and_cleared() {
        let f = fixture();
        let session = f.tracker.get_or_create().await.unwrap();
        let body = f.client.file(f.tracker.marker_path()).unwrap();
        assert!(body.contains(&session.id));

        assert_eq!(f.tracker.clear_current().await, Some(session.id));
        assert!(f.client.file(f.tracker.marker_path()).is_none());
        assert_eq!(f.tracker.current_id().await, None);
    }

    #[tokio::test]
    async fn marker_write_failure_is_not_an_error() {
        let f = fixture();
        f.client.state.lock().unwrap().fail_marker_write = true;
        let session = f.tracker.get_or_create().await.unwrap();
        assert_eq!(f.tracker.current_id().await, Some(session.id));
    }

    #[tokio::test]
    async fn restore_reattaches_live_session_after_restart() {
        let f = fixture();
        let session = f.tracker.get_or_create().await.unwrap();
        f.clock.advance(Duration::from_secs(120));

        let (store, tracker) = restarted(&f);
        let restored = tracker.restore().await.unwrap();
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.last_used_at, session.last_used_at);
        assert_eq!(store.len().await, 1);
        assert_eq!(tracker.get_or_create().await.unwrap().id, session.id);
    }

    #[tokio::test]
    async fn restore_discards_session_expired_while_down() {
        let f = fixture();
        let session = f.tracker.get_or_create().await.unwrap();
        f.client.ensure_workspace(&session.workspace_path).await.unwrap();
        f.clock.advance(Duration::from_secs(601));

        let (store, tracker) = restarted(&f);
        assert!(tracker.restore().await.is_none());
        assert!(store.is_empty().await);
        assert!(!f.client.has_dir(&session.workspace_path));
        assert!(f.client.file(tracker.marker_path()).is_none());

        let fresh = tracker.get_or_create().await.unwrap();
        assert_ne!(fresh.id, session.id);
    }

    #[tokio::test]
    async fn restore_ignores_garbage_and_hostile_markers() {
        let f = fixture();
        let path = f.tracker.marker_path().to_path_buf();

        f.client.write_file(&path, "not json").await.unwrap();
        assert!(f.tracker.restore().await.is_none());

        let hostile = r#"{"session_id":"../../etc","created_at":"2024-01-01T00:00:00Z","last_used_at":"2024-01-01T00:00:00Z"}"#;
        f.client.write_file(&path, hostile).await.unwrap();
        assert!(f.tracker.restore().await.is_none());
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn set_current_requires_live_session() {
        let f = fixture();
        let first = f.tracker.get_or_create().await.unwrap();
        let other = f.store.create(SessionKind::Persistent).await.unwrap();

        f.tracker.set_current(&other.id).await.unwrap();
        assert_eq!(f.tracker.get_or_create().await.unwrap().id, other.id);
        assert!(f.client.file(f.tracker.marker_path()).unwrap().contains(&other.id));

        assert!(f.tracker.set_current("missing").await.is_err());
        assert_ne!(f.tracker.current_id().await, Some(first.id));
    }

    #[tokio::test]
    async fn clear_if_current_only_matches_current() {
        let f = fixture();
        let current = f.tracker.get_or_create().await.unwrap();
        assert!(!f.tracker.clear_if_current("other").await);
        assert!(f.tracker.clear_if_current(&current.id).await);
        assert_eq!(f.tracker.current_id().await, None);
    }
}
