//! Peer-session engine interface.
//!
//! The bridge does not implement offer/answer, ICE or SRTP itself. It
//! drives an engine through the traits below, and the engine reports
//! asynchronous happenings (candidates, connectivity changes, remote tracks)
//! as [`PeerEvent`]s on a channel. The session's event loop consumes that
//! channel; nothing in the bridge is invoked from engine callbacks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::rtcp::RtcpPacket;
use crate::media::{CodecParameters, MediaKind};
use crate::track::LocalTrack;

/// Session description type (`RTCSdpType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Pranswer => "pranswer",
            Self::Answer => "answer",
            Self::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// A signaling message, serialized as `{"type": "...", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// Whether reaching this state tears the session down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Direction of a transceiver added without a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
}

/// Something the peer engine observed.
pub enum PeerEvent {
    /// A local candidate was gathered; `None` marks the end of gathering.
    IceCandidate(Option<String>),
    ConnectivityChange(ConnectivityState),
    /// The remote side started sending a track.
    Track(Arc<dyn RemoteTrack>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::ConnectivityChange(s) => f.debug_tuple("ConnectivityChange").field(s).finish(),
            Self::Track(t) => f
                .debug_struct("Track")
                .field("ssrc", &t.ssrc())
                .field("kind", &t.kind())
                .finish(),
        }
    }
}

/// Settings for a new peer connection.
#[derive(Debug, Clone, Default)]
pub struct RtcConfiguration {
    /// STUN/TURN URLs.
    pub ice_servers: Vec<String>,
}

/// Factory for peer connections. Built once per process.
#[async_trait]
pub trait PeerApi: Send + Sync {
    async fn new_peer_connection(
        &self,
        config: RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// One peer session as driven by the bridge.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local sink; the engine subscribes to it and sends its packets.
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn RtpSender>>;

    async fn add_transceiver_from_kind(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Resolves once candidate gathering has finished.
    ///
    /// Must be obtained before [`set_local_description`](Self::set_local_description),
    /// which starts gathering.
    async fn gathering_complete_promise(&self) -> mpsc::Receiver<()>;

    /// Local description including every gathered candidate.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Hand out the event channel. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;
}

/// Sending half of a track attached with [`PeerConnection::add_track`].
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// Next RTCP compound packet the remote sent about this track.
    async fn read_rtcp(&self) -> Result<Bytes>;
}

/// A track the remote peer is sending.
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn ssrc(&self) -> u32;

    fn kind(&self) -> MediaKind;

    /// Negotiated codec and payload type.
    fn codec(&self) -> CodecParameters;

    /// Next RTP packet, as received.
    async fn read_rtp(&self) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_description_json_shape() {
        let json = serde_json::to_string(&SessionDescription::answer("v=0\r\n")).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0\r\n"}"#);

        let offer: SessionDescription =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
    }

    #[test]
    fn terminal_states() {
        use ConnectivityState::*;
        let terminal: Vec<_> = [Negotiating, Connected, Disconnected, Failed, Closed]
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![Disconnected, Failed, Closed]);
    }
}
