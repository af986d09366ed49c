//! Mirrors peer connectivity onto the rest of a session.
//!
//! Peer engine events arrive on a channel and are consumed by
//! [`run_event_loop`]. When connectivity reaches a terminal state the
//! session is torn down exactly once:
//!
//! 1. the session token is cancelled (keyframe loop, RTCP drains, pipelines),
//! 2. the sink towards the peer is closed,
//! 3. the paired RTSP session is closed,
//! 4. the shared publish sink is released if this session owns it.
//!
//! A failed peer connection is also closed; the `Closed` notification that
//! follows is absorbed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use super::{Session, SessionRegistry};
use crate::peer::{ConnectivityState, PeerEvent, RemoteTrack};

impl Session {
    /// Record a connectivity change. Returns `true` if this call tore the
    /// session down.
    pub async fn observe(&self, state: ConnectivityState) -> bool {
        let old = self.set_state(state);
        if old != state {
            tracing::info!(session_id = %self.id, %state, "peer connectivity changed");
        }
        if !state.is_terminal() {
            return false;
        }

        let tore_down = self.teardown().await;
        if state == ConnectivityState::Failed
            && tore_down
            && let Err(e) = self.peer.close().await
        {
            tracing::warn!(session_id = %self.id, error = %e, "closing failed peer");
        }
        tore_down
    }

    /// Release everything the session holds. Idempotent.
    pub async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(session_id = %self.id, state = %self.state(), "session teardown");

        self.cancel.cancel();
        let outbound = self.outbound.lock().take();
        if let Some(track) = outbound {
            track.close();
        }
        self.stream.close().await;
        self.shared.release_if_owner(&self.id);
        true
    }
}

/// Consume peer events until the peer is closed or the channel ends.
///
/// `on_track` is called for every remote track the peer starts sending.
pub async fn run_event_loop<F>(
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    registry: SessionRegistry,
    mut on_track: F,
) where
    F: FnMut(Arc<dyn RemoteTrack>) + Send,
{
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::IceCandidate(Some(candidate)) => {
                tracing::debug!(session_id = %session.id, candidate, "local candidate");
            }
            PeerEvent::IceCandidate(None) => {
                tracing::debug!(session_id = %session.id, "candidate gathering finished");
            }
            PeerEvent::ConnectivityChange(state) => {
                if session.observe(state).await {
                    registry.remove(&session.id);
                }
                if state == ConnectivityState::Closed {
                    break;
                }
            }
            PeerEvent::Track(track) => {
                if session.is_torn_down() {
                    continue;
                }
                tracing::info!(
                    session_id = %session.id,
                    ssrc = track.ssrc(),
                    kind = track.kind().as_str(),
                    codec = %track.codec().capability.codec,
                    "remote track"
                );
                on_track(track);
            }
        }
    }

    // The engine went away without a terminal state.
    if session.teardown().await {
        registry.remove(&session.id);
    }
    tracing::debug!(session_id = %session.id, "event loop finished");
}
