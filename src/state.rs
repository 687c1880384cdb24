//! Session records and the store that owns them.

use crate::container::ContainerClient;
use crate::error::{Error, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Idle time after which a session is reaped (10 minutes).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 600;

pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// How often the background reaper sweeps.
pub const REAP_INTERVAL_SECS: u64 = 60;

/// Source of wall-clock time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Persistent,
    /// Lives for a single operation; never reaped by TTL.
    Ephemeral,
}

/// A logical execution context bound to its own workspace directory.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub workspace_ready: bool,
}

/// The one expiry predicate shared by lookups, touches, admission and the reaper.
pub fn is_expired(session: &Session, now: DateTime<Utc>, ttl: Duration) -> bool {
    if session.kind == SessionKind::Ephemeral {
        return false;
    }
    now.signed_duration_since(session.last_used_at)
        .to_std()
        .map(|idle| idle > ttl)
        .unwrap_or(false)
}

/// Limits applied by [`SessionStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub ttl: Duration,
    pub max_sessions: usize,
    /// Container-side directory holding one subdirectory per session.
    pub sessions_root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            sessions_root: PathBuf::from("/workspace/sessions"),
        }
    }
}

/// Registry of live sessions.
///
/// Every mutation, including the reap sweep, runs under one mutex. Workspace
/// deletion goes through the container client after the lock is released.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    client: Arc<dyn ContainerClient>,
}

impl SessionStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>, client: Arc<dyn ContainerClient>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            clock,
            client,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn workspace_for(&self, id: &str) -> Result<PathBuf> {
        paths::resolve(&self.config.sessions_root, id)
    }

    /// Register a fresh session, reclaiming expired ones first when full.
    pub async fn create(&self, kind: SessionKind) -> Result<Session> {
        let (result, reclaimed) = {
            let mut sessions = self.sessions.lock().await;
            let now = self.clock.now();
            let reclaimed = if sessions.len() >= self.config.max_sessions {
                self.sweep(&mut sessions, now)
            } else {
                Vec::new()
            };

            let result = if sessions.len() >= self.config.max_sessions {
                Err(Error::CapacityExceeded {
                    max: self.config.max_sessions,
                })
            } else {
                let id = loop {
                    let candidate = new_session_id();
                    if !sessions.contains_key(&candidate) {
                        break candidate;
                    }
                };
                self.workspace_for(&id).map(|workspace_path| {
                    let session = Session {
                        id: id.clone(),
                        kind,
                        workspace_path,
                        created_at: now,
                        last_used_at: now,
                        workspace_ready: false,
                    };
                    sessions.insert(id, session.clone());
                    session
                })
            };
            (result, reclaimed)
        };

        self.release_workspaces(reclaimed, "expired").await;
        if let Ok(session) = &result {
            info!("Created {:?} session: {}", session.kind, session.id);
        }
        result
    }

    /// Look up a live session. An expired hit is removed on the spot.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let (found, expired) = {
            let mut sessions = self.sessions.lock().await;
            let now = self.clock.now();
            match sessions.get(id) {
                None => (None, None),
                Some(session) if is_expired(session, now, self.config.ttl) => (None, sessions.remove(id)),
                Some(session) => (Some(session.clone()), None),
            }
        };
        self.release_workspaces(expired.into_iter().collect(), "expired").await;
        found.ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Refresh `last_used_at`. Returns `None` if the session is gone or expired.
    pub async fn touch(&self, id: &str) -> Option<Session> {
        let (touched, expired) = {
            let mut sessions = self.sessions.lock().await;
            let now = self.clock.now();
            match sessions.get_mut(id) {
                None => (None, None),
                Some(session) if is_expired(session, now, self.config.ttl) => (None, sessions.remove(id)),
                Some(session) => {
                    session.last_used_at = now;
                    (Some(session.clone()), None)
                }
            }
        };
        self.release_workspaces(expired.into_iter().collect(), "expired").await;
        touched
    }

    pub async fn mark_workspace_ready(&self, id: &str) {
        if let Some(session) = self.sessions.lock().await.get_mut(id) {
            session.workspace_ready = true;
        }
    }

    /// Remove a session and its workspace. Removing an absent id is a no-op.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        let existed = removed.is_some();
        self.release_workspaces(removed.into_iter().collect(), "closed").await;
        existed
    }

    /// Drop every session idle for longer than the TTL.
    pub async fn reap(&self) -> usize {
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let now = self.clock.now();
            self.sweep(&mut sessions, now)
        };
        let count = expired.len();
        self.release_workspaces(expired, "expired").await;
        count
    }

    /// Drop every session regardless of age.
    pub async fn clear(&self) -> usize {
        let all: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let count = all.len();
        self.release_workspaces(all, "cleared").await;
        count
    }

    /// Re-register a session recovered from outside the store (e.g. after a
    /// restart). Its timestamps are kept as recorded, so a session that idled
    /// past its TTL while the process was down is not resurrected.
    pub async fn adopt(&self, session: Session) -> Result<Session> {
        let (result, reclaimed) = {
            let mut sessions = self.sessions.lock().await;
            let now = self.clock.now();
            if is_expired(&session, now, self.config.ttl) {
                (Err(Error::SessionNotFound(session.id.clone())), Vec::new())
            } else if let Some(existing) = sessions.get(&session.id) {
                (Ok(existing.clone()), Vec::new())
            } else {
                let reclaimed = if sessions.len() >= self.config.max_sessions {
                    self.sweep(&mut sessions, now)
                } else {
                    Vec::new()
                };
                if sessions.len() >= self.config.max_sessions {
                    let max = self.config.max_sessions;
                    (Err(Error::CapacityExceeded { max }), reclaimed)
                } else {
                    sessions.insert(session.id.clone(), session.clone());
                    (Ok(session), reclaimed)
                }
            }
        };
        self.release_workspaces(reclaimed, "expired").await;
        result
    }

    /// Live sessions, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        let now = self.clock.now();
        let mut live: Vec<Session> = sessions
            .values()
            .filter(|s| !is_expired(s, now, self.config.ttl))
            .cloned()
            .collect();
        live.sort_by_key(|s| s.created_at);
        live
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn sweep(&self, sessions: &mut HashMap<String, Session>, now: DateTime<Utc>) -> Vec<Session> {
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| is_expired(s, now, self.config.ttl))
            .map(|(id, _)| id.clone())
            .collect();
        expired.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    async fn release_workspaces(&self, removed: Vec<Session>, reason: &str) {
        for session in removed {
            info!("Removing {} session: {}", reason, session.id);
            if let Err(e) = self.client.delete_path(&session.workspace_path).await {
                warn!("Failed to delete workspace of session {}: {:#}", session.id, e);
            }
        }
    }
}

fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Spawn the periodic reaper. The task runs until aborted.
pub fn spawn_reaper(store: Arc<SessionStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        loop {
            interval.tick().await;
            let reaped = store.reap().await;
            if reaped > 0 {
                info!("Reaped {} expired sessions", reaped);
            }
        }
    })
}
