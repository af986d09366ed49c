//! Media codecs, RTP/RTCP packets and the per-packet processing stages.
//!
//! Packets move through the bridge in one of two shapes:
//!
//! - **Passthrough**: RTP packets are forwarded byte-for-byte (after
//!   [`reorder`]) to the outbound track.
//! - **Sample reconstruction**: RTP packets are reordered, depacketized into
//!   access units ([`h264::AccessUnitAssembler`]), rewritten as an Annex B
//!   byte-stream and emitted as a [`sample::Sample`] whose duration is the
//!   timestamp delta to the previous access unit.
//!
//! ## RTP overview (RFC 3550)
//!
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, 90 kHz for video.
//! - **SSRC** (32-bit): identifies the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod h264;
pub mod reorder;
pub mod rtcp;
pub mod rtp;
pub mod sample;

/// Kind of media carried by a track or transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// SDP media type (`m=<media>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn from_sdp(media: &str) -> Option<Self> {
        match media {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Codec identity, independent of payload type or clock parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    Vp8,
    Vp9,
    Av1,
    Opus,
    /// Any encoding name this crate does not special-case.
    Other(String),
}

impl Codec {
    /// Map an SDP `a=rtpmap` encoding name (case-insensitive).
    pub fn from_encoding_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "H264" => Self::H264,
            "VP8" => Self::Vp8,
            "VP9" => Self::Vp9,
            "AV1" | "AV1X" => Self::Av1,
            "OPUS" => Self::Opus,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Encoding name as written in `a=rtpmap`.
    pub fn encoding_name(&self) -> &str {
        match self {
            Self::H264 => "H264",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
            Self::Opus => "opus",
            Self::Other(name) => name,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    /// MIME type in the form WebRTC engines use (`video/H264`).
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.kind().as_str(), self.encoding_name())
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// Codec capability as negotiated on a peer session.
///
/// Mirrors what a WebRTC engine reports for a remote track; used verbatim
/// when the shared publish sink is created so subscribers negotiate exactly
/// what the publisher sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    pub codec: Codec,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

impl CodecCapability {
    pub fn new(codec: Codec, clock_rate: u32) -> Self {
        Self {
            codec,
            clock_rate,
            channels: 0,
            sdp_fmtp_line: String::new(),
        }
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.sdp_fmtp_line = fmtp.to_string();
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// H.264 at the 90 kHz video clock.
    pub fn h264() -> Self {
        Self::new(Codec::H264, 90_000)
    }
}

/// A codec capability bound to a payload type number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameters {
    pub capability: CodecCapability,
    pub payload_type: u8,
}

impl CodecParameters {
    pub fn new(capability: CodecCapability, payload_type: u8) -> Self {
        Self {
            capability,
            payload_type,
        }
    }
}

/// Codecs the peer engine registers for every session.
///
/// Video first, in preference order, then Opus audio. Peer-engine
/// adapters register this list once when the endpoint is built.
pub fn default_codecs() -> Vec<CodecParameters> {
    vec![
        CodecParameters::new(CodecCapability::new(Codec::Vp8, 90_000), 96),
        CodecParameters::new(
            CodecCapability::new(Codec::Vp9, 90_000).with_fmtp("profile-id=0"),
            98,
        ),
        CodecParameters::new(
            CodecCapability::new(Codec::Vp9, 90_000).with_fmtp("profile-id=1"),
            100,
        ),
        CodecParameters::new(
            CodecCapability::h264().with_fmtp(
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            ),
            125,
        ),
        CodecParameters::new(
            CodecCapability::h264().with_fmtp(
                "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
            ),
            108,
        ),
        CodecParameters::new(
            CodecCapability::h264().with_fmtp(
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032",
            ),
            123,
        ),
        CodecParameters::new(CodecCapability::new(Codec::Av1, 90_000), 35),
        CodecParameters::new(CodecCapability::new(Codec::Opus, 48_000), 111),
    ]
}

/// Codec-specific RTP packetizer.
///
/// Used by sample-mode sinks to turn one Annex B sample back into RTP
/// packets before fan-out. The generic RTP header is handled by
/// [`rtp::RtpHeader`]; packetizers compose it.
pub trait Packetizer: Send {
    /// Packetize raw encoded data (Annex B bitstream) into RTP packets.
    ///
    /// `timestamp_increment` is the distance from the previous frame in
    /// clock-rate ticks; the RTP timestamp advances by it before this frame
    /// is stamped.
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>>;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;
}
