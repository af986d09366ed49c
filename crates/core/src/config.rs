use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::media::reorder::ReorderConfig;
use crate::media::{Codec, CodecCapability, CodecParameters};
use crate::rtsp::{RtspUrl, TrackDescription};
use crate::track::DEFAULT_SUBSCRIBER_BUFFER;

/// Bridge-level configuration shared by every session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The one UDP port all peer sessions share.
    pub mux_addr: SocketAddr,
    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Pull source, and push target in publish mode.
    pub source_url: RtspUrl,
    /// Where the UDP passthrough relay listens.
    pub relay_addr: SocketAddr,
    pub reorder: ReorderConfig,
    /// Period of keyframe requests towards a publishing peer.
    pub keyframe_interval: Duration,
    /// Codec announced to the push sink.
    pub publish_codec: CodecParameters,
    pub track_id: String,
    pub stream_id: String,
    /// Queue depth of each sink subscriber, in packets.
    pub subscriber_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mux_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 2000)),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            source_url: RtspUrl {
                host: "127.0.0.1".to_string(),
                port: 8554,
                path: "/live".to_string(),
            },
            relay_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5004)),
            reorder: ReorderConfig::default(),
            keyframe_interval: Duration::from_secs(2),
            publish_codec: CodecParameters::new(CodecCapability::new(Codec::Vp8, 90_000), 96),
            track_id: "video".to_string(),
            stream_id: "bridge".to_string(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl BridgeConfig {
    /// The single track announced to the push sink.
    pub fn publish_track(&self) -> TrackDescription {
        let capability = &self.publish_codec.capability;
        TrackDescription {
            kind: capability.codec.kind(),
            payload_type: self.publish_codec.payload_type,
            codec: capability.codec.clone(),
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            fmtp: (!capability.sdp_fmtp_line.is_empty())
                .then(|| capability.sdp_fmtp_line.clone()),
            control: "trackID=0".to_string(),
        }
    }
}
