//! Bridge sessions.
//!
//! A session pairs one peer connection with at most one RTSP session. It is
//! created when a signaling offer is accepted and torn down when the peer's
//! connectivity reaches a terminal state ([`lifecycle`]).
//!
//! ## Session lifecycle
//!
//! ```text
//! offer accepted          -> Negotiating
//! ICE connected           -> Connected
//! disconnected/failed     -> teardown (once)
//! closed                  -> teardown (once), event loop exits
//! ```

pub mod lifecycle;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::peer::{ConnectivityState, PeerConnection};
use crate::rtsp::StreamingSession;
use crate::track::{LocalTrack, SharedPublishSlot};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The RTSP session paired with a bridge session, once it exists.
///
/// Pipelines attach the session after connecting; the lifecycle coordinator
/// and the pipeline's own exit path both close through this handle, so the
/// underlying `close` runs exactly once whichever comes first.
#[derive(Default)]
pub struct StreamHandle {
    inner: tokio::sync::Mutex<Option<Arc<dyn StreamingSession>>>,
    closed: AtomicBool,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the RTSP session. If the handle was already closed, the
    /// session is closed right away.
    pub async fn attach(&self, session: Arc<dyn StreamingSession>) {
        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            drop(inner);
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "late streaming session close failed");
            }
            return;
        }
        *inner = Some(session);
    }

    /// Close the attached session. Only the first call has any effect.
    pub async fn close(&self) {
        let session = {
            let mut inner = self.inner.lock().await;
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            inner.take()
        };
        if let Some(session) = session
            && let Err(e) = session.close().await
        {
            tracing::warn!(error = %e, "streaming session close failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One peer connection and what the bridge runs on its behalf.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    state: RwLock<ConnectivityState>,
    peer: Arc<dyn PeerConnection>,
    /// Sink the bridge writes towards this peer, if any.
    outbound: Mutex<Option<Arc<LocalTrack>>>,
    stream: Arc<StreamHandle>,
    shared: Arc<SharedPublishSlot>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.read())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl Session {
    /// Create a session with a unique auto-incrementing ID.
    pub fn new(peer: Arc<dyn PeerConnection>, shared: Arc<SharedPublishSlot>) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Session {
            id: format!("{:016X}", id),
            state: RwLock::new(ConnectivityState::Negotiating),
            peer,
            outbound: Mutex::new(None),
            stream: Arc::new(StreamHandle::new()),
            shared,
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn stream(&self) -> &Arc<StreamHandle> {
        &self.stream
    }

    pub fn shared(&self) -> &Arc<SharedPublishSlot> {
        &self.shared
    }

    /// Fires when the session is torn down. Every task the session runs
    /// watches a child of this token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_outbound(&self, track: Arc<LocalTrack>) {
        *self.outbound.lock() = Some(track);
    }

    pub fn outbound(&self) -> Option<Arc<LocalTrack>> {
        self.outbound.lock().clone()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectivityState) -> ConnectivityState {
        let old = std::mem::replace(&mut *self.state.write(), state);
        tracing::debug!(session_id = %self.id, old_state = %old, new_state = %state, "state transition");
        old
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

/// Thread-safe registry of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id.clone();
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), session);
            sessions.len()
        };
        tracing::debug!(session_id = %id, total_sessions = total, "session registered");
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}
