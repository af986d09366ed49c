//! Error types for the bridge library.

use std::fmt;
use std::net::SocketAddr;

/// Errors that can occur while bridging RTSP and WebRTC sessions.
///
/// Variants group into the failure classes the bridge distinguishes:
///
/// - [`Negotiation`](Self::Negotiation): terminal for one signaling
///   request, no session is created.
/// - [`Connect`](Self::Connect), [`TrackNotFound`](Self::TrackNotFound) and
///   [`Status`](Self::Status): terminal for one pipeline.
/// - [`MalformedPacket`](Self::MalformedPacket): the packet is dropped and
///   the pipeline continues.
/// - [`SinkClosed`](Self::SinkClosed): graceful end of a pipeline, never
///   reported as a failure.
/// - [`Bind`](Self::Bind): fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared listening port (or a relay socket) could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The offer could not be turned into an answer.
    #[error("negotiation failed: {kind}")]
    Negotiation { kind: NegotiationErrorKind },

    /// The streaming source could not be reached.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The source exposes no track with the required codec.
    #[error("no {codec} track found")]
    TrackNotFound { codec: String },

    /// The RTSP peer answered with a non-success status.
    #[error("RTSP status {code} {reason}")]
    Status { code: u16, reason: String },

    /// A transport packet could not be decoded.
    #[error("malformed packet: {kind}")]
    MalformedPacket { kind: PacketErrorKind },

    /// The sink was closed; no further writes will ever succeed.
    #[error("sink closed")]
    SinkClosed,

    /// Another writer already owns this sink.
    #[error("sink {0} already has a writer")]
    WriterBusy(String),

    /// The sink cannot turn samples of this codec into packets.
    #[error("no sample packetizer for {0}")]
    UnsupportedCodec(String),

    /// The push sink refused a packet.
    #[error("push sink rejected packet: {0}")]
    PushRejected(String),

    /// The peer-session engine reported a failure.
    #[error("peer connection error: {0}")]
    Peer(String),

    /// Failed to parse RTSP or SDP text.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The URL is not a usable `rtsp://` URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl BridgeError {
    /// Whether this error means the downstream sink is permanently gone.
    ///
    /// Pipelines treat this as a normal end of stream.
    pub fn is_sink_closed(&self) -> bool {
        matches!(self, Self::SinkClosed)
    }

    pub(crate) fn negotiation(kind: NegotiationErrorKind) -> Self {
        Self::Negotiation { kind }
    }

    pub(crate) fn malformed(kind: PacketErrorKind) -> Self {
        Self::MalformedPacket { kind }
    }

    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Why an offer was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationErrorKind {
    /// The description is empty or is not SDP.
    MalformedOffer,
    /// The description is not of type `offer`.
    UnexpectedType(String),
    /// The offer does not list the codec the selected mode requires.
    CodecMismatch(String),
    /// Subscribe mode was requested before anything was published.
    NoPublisher,
}

impl fmt::Display for NegotiationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedOffer => write!(f, "malformed offer"),
            Self::UnexpectedType(t) => write!(f, "expected an offer, got {t}"),
            Self::CodecMismatch(codec) => write!(f, "offer does not accept {codec}"),
            Self::NoPublisher => write!(f, "no publisher is active"),
        }
    }
}

/// Specific kind of packet decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketErrorKind {
    /// Shorter than the fixed header or a declared length.
    Truncated,
    /// RTP/RTCP version field is not 2.
    BadVersion(u8),
    /// Padding length exceeds the payload.
    BadPadding,
    /// Payload is empty where content is required.
    EmptyPayload,
    /// H.264 NAL unit type that cannot be depacketized.
    UnsupportedNal(u8),
    /// FU-A continuation without a preceding start fragment.
    OrphanFragment,
    /// RTCP packet of a type this crate does not decode.
    UnsupportedRtcp(u8),
}

impl fmt::Display for PacketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated"),
            Self::BadVersion(v) => write!(f, "unsupported version {v}"),
            Self::BadPadding => write!(f, "invalid padding"),
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::UnsupportedNal(t) => write!(f, "unsupported NAL unit type {t}"),
            Self::OrphanFragment => write!(f, "fragment without start"),
            Self::UnsupportedRtcp(pt) => write!(f, "unsupported RTCP packet type {pt}"),
        }
    }
}

/// Specific kind of RTSP/SDP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no status line).
    EmptyResponse,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A required header was absent.
    MissingHeader(&'static str),
    /// An SDP line could not be interpreted.
    InvalidSdp,
    /// The `Transport` header could not be interpreted.
    InvalidTransport,
    /// The response head ran past the size limit.
    HeadTooLarge,
    /// `Content-Length` announced a body past the size limit.
    BodyTooLarge(usize),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyResponse => write!(f, "empty response"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MissingHeader(name) => write!(f, "missing {name} header"),
            Self::InvalidSdp => write!(f, "invalid SDP"),
            Self::InvalidTransport => write!(f, "invalid Transport header"),
            Self::HeadTooLarge => write!(f, "response head too large"),
            Self::BodyTooLarge(len) => write!(f, "response body of {len} bytes too large"),
        }
    }
}

/// Convenience alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
