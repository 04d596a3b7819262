//! Session manager: the single entry point for socket and HTTP control.
//!
//! Sessions are keyed by `SessionId` in a `DashMap`. Live sessions own a pacer
//! task; terminal ones stay in the map (archived) so `stop` remains
//! idempotent and status stays queryable.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use framecast_core::{RelayConfig, RelayError, SessionId, SessionSnapshot, StartRequest};

use crate::machine::{Pacing, Session, SessionSink};
use crate::pacer::{Control, SessionHandle};
use crate::source::{SourceDescriptor, SourceResolver};

/// Archived (terminal) sessions kept before the oldest are pruned.
const ARCHIVE_LIMIT: usize = 256;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Maximum non-terminal sessions.
    pub max_sessions: usize,
    pub default_send_rate: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            default_send_rate: 5.0,
        }
    }
}

impl From<&RelayConfig> for ManagerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_sessions: config.server.max_sessions,
            default_send_rate: config.pacing.default_send_rate,
        }
    }
}

pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    resolver: Arc<dyn SourceResolver>,
    sink: Arc<dyn SessionSink>,
    config: ManagerConfig,
    /// Serializes starts so the capacity check and insert are atomic.
    start_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        resolver: Arc<dyn SourceResolver>,
        sink: Arc<dyn SessionSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            resolver,
            sink,
            config,
            start_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Start a new session under a caller-chosen id.
    ///
    /// Callers that want the `video_info` descriptor subscribe a connection to
    /// `id` before calling this.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn start(&self, id: SessionId, request: StartRequest) -> Result<SessionSnapshot, RelayError> {
        let _guard = self.start_lock.lock().await;

        if self.sessions.contains_key(&id) {
            return Err(RelayError::InvalidRequest(format!("session {id} already exists")));
        }
        let live = self.active_count();
        if live >= self.config.max_sessions {
            return Err(RelayError::CapacityExceeded {
                resource: "sessions",
                limit: self.config.max_sessions,
            });
        }

        let descriptor = SourceDescriptor {
            mode: request.mode.unwrap_or_default(),
            video_path: request.video_path.map(PathBuf::from),
            total_frames: request.total_frames,
        };
        let pacing = Pacing {
            requested_rate: request.fps,
            default_rate: self.config.default_send_rate,
        };

        let mut session = Session::new(id.clone(), Arc::clone(&self.sink));
        session.start(self.resolver.as_ref(), &descriptor, pacing).await?;

        let handle = SessionHandle::spawn(session, self.shutdown.child_token());
        let snapshot = handle.snapshot();
        self.sessions.insert(id, handle);
        self.prune_archive();
        Ok(snapshot)
    }

    pub async fn pause(&self, id: &SessionId) -> Result<SessionSnapshot, RelayError> {
        self.handle(id)?.send(Control::Pause).await
    }

    pub async fn resume(&self, id: &SessionId) -> Result<SessionSnapshot, RelayError> {
        self.handle(id)?.send(Control::Resume).await
    }

    pub async fn stop(&self, id: &SessionId) -> Result<SessionSnapshot, RelayError> {
        self.handle(id)?.send(Control::Stop).await
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionSnapshot, RelayError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// All known sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.session_id.as_str().cmp(b.session_id.as_str()));
        snapshots
    }

    /// Number of non-terminal sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().snapshot().state.is_terminal())
            .count()
    }

    /// Cancel every pacer and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();
        for handle in handles {
            handle.join().await;
        }
        info!(sessions = self.sessions.len(), "session manager shut down");
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>, RelayError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::UnknownSession(id.clone()))
    }

    fn prune_archive(&self) {
        let mut archived: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().snapshot().state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        if archived.len() <= ARCHIVE_LIMIT {
            return;
        }
        archived.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let excess = archived.len() - ARCHIVE_LIMIT;
        for id in archived.into_iter().take(excess) {
            self.sessions.remove(&id);
        }
    }
}
