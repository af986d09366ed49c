//! Streaming-protocol (RTSP) side of the bridge.
//!
//! Pipelines talk to RTSP peers through the [`PullClient`] and
//! [`PushClient`] traits, created by a [`StreamingConnector`]. The concrete
//! implementation is [`RtspClient`], an RTSP/1.0 client (RFC 2326) that
//! carries media over UDP:
//!
//! | Method | RFC section | Used for |
//! |--------|-------------|----------|
//! | OPTIONS | §10.1 | Capability probe, keep-alive |
//! | DESCRIBE | §10.2 | Track discovery (pull) |
//! | ANNOUNCE | §10.3 | Track declaration (push) |
//! | SETUP | §10.4 | UDP port negotiation |
//! | PLAY | §10.5 | Start receiving (pull) |
//! | RECORD | §10.11 | Start sending (push) |
//! | TEARDOWN | §10.7 | Close |

pub mod client;
pub mod message;
pub mod sdp;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};
use crate::media::h264::ParameterSets;
use crate::media::rtp::RtpPacket;
use crate::media::{Codec, CodecCapability, MediaKind};

pub use client::{RtspClient, RtspConnector};

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_PORT: u16 = 554;

/// A parsed `rtsp://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    /// Path including the leading `/`, possibly empty.
    pub path: String,
}

impl RtspUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("rtsp://")
            .ok_or_else(|| BridgeError::InvalidUrl(url.to_string()))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        // Credentials are not supported; drop them from the authority.
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        let invalid = || BridgeError::InvalidUrl(url.to_string());
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None => (host, DEFAULT_PORT),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port`, suitable for connecting.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve a track `a=control` value against this URL (RFC 2326 §C.1.1).
    pub fn join(&self, control: &str) -> String {
        if control.starts_with("rtsp://") {
            return control.to_string();
        }
        let base = self.to_string();
        if control.is_empty() || control == "*" {
            return base;
        }
        format!("{}/{}", base.trim_end_matches('/'), control)
    }
}

impl fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtsp://{}{}", self.authority(), self.path)
    }
}

/// One media section of an RTSP presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescription {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub codec: Codec,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: Option<String>,
    /// `a=control` value, relative or absolute.
    pub control: String,
}

impl TrackDescription {
    pub fn capability(&self) -> CodecCapability {
        CodecCapability::new(self.codec.clone(), self.clock_rate)
            .with_channels(self.channels)
            .with_fmtp(self.fmtp.as_deref().unwrap_or_default())
    }

    /// Out-of-band H.264 parameter sets, if the SDP carried any.
    pub fn parameter_sets(&self) -> ParameterSets {
        match (&self.codec, &self.fmtp) {
            (Codec::H264, Some(fmtp)) => ParameterSets::from_fmtp(fmtp),
            _ => ParameterSets::default(),
        }
    }
}

/// A packet received on one of the set-up tracks.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Index into the track list passed to [`PullClient::setup_and_play`].
    pub track: usize,
    pub packet: RtpPacket,
}

/// Anything with an RTSP session behind it.
#[async_trait]
pub trait StreamingSession: Send + Sync {
    /// Tear the session down. Calling it again has no effect.
    async fn close(&self) -> Result<()>;
}

/// Reading side: DESCRIBE, SETUP and PLAY.
#[async_trait]
pub trait PullClient: StreamingSession {
    /// Returns the tracks and the base URL their controls resolve against.
    async fn describe(&self, url: &RtspUrl) -> Result<(Vec<TrackDescription>, RtspUrl)>;

    /// Set up `tracks` and start playback.
    ///
    /// The receiver yields packets until the session is closed.
    async fn setup_and_play(
        &self,
        tracks: &[TrackDescription],
        base: &RtspUrl,
    ) -> Result<mpsc::Receiver<InboundPacket>>;
}

/// Writing side: ANNOUNCE, SETUP and RECORD.
#[async_trait]
pub trait PushClient: StreamingSession {
    async fn start_publishing(&self, url: &RtspUrl, tracks: &[TrackDescription]) -> Result<()>;

    /// Send one packet on track `track`, in call order.
    async fn write_packet(&self, track: usize, packet: &RtpPacket) -> Result<()>;
}

/// Opens streaming sessions.
#[async_trait]
pub trait StreamingConnector: Send + Sync {
    async fn connect_pull(&self, url: &RtspUrl) -> Result<Arc<dyn PullClient>>;

    async fn connect_push(&self, url: &RtspUrl) -> Result<Arc<dyn PushClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_urls() {
        let u = RtspUrl::parse("rtsp://10.0.0.2:8554/live/cam").unwrap();
        assert_eq!(u.host, "10.0.0.2");
        assert_eq!(u.port, 8554);
        assert_eq!(u.path, "/live/cam");
        assert_eq!(u.to_string(), "rtsp://10.0.0.2:8554/live/cam");

        let u = RtspUrl::parse("rtsp://user:pw@camera").unwrap();
        assert_eq!(u.host, "camera");
        assert_eq!(u.port, DEFAULT_PORT);

        let u = RtspUrl::parse("rtsp://[::1]:9000/x").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.authority(), "[::1]:9000");

        assert!(RtspUrl::parse("http://host/").is_err());
        assert!(RtspUrl::parse("rtsp://host:port/").is_err());
        assert!(RtspUrl::parse("rtsp:///x").is_err());
    }

    #[test]
    fn control_resolution() {
        let base = RtspUrl::parse("rtsp://h:8554/live/").unwrap();
        assert_eq!(base.join("trackID=1"), "rtsp://h:8554/live/trackID=1");
        assert_eq!(base.join("*"), "rtsp://h:8554/live/");
        assert_eq!(base.join("rtsp://other/t"), "rtsp://other/t");
    }
}
