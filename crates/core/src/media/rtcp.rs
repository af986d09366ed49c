//! RTCP feedback messages the bridge originates.
//!
//! Only the Picture Loss Indication (RFC 4585 §6.3.1) is produced: the
//! outbound pipeline sends one on a fixed interval so the publishing peer
//! emits a fresh keyframe for late joiners and after loss.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, PacketErrorKind, Result};

/// Payload-specific feedback packet type (RFC 4585 §6.1).
const PT_PSFB: u8 = 206;
/// FMT value of a Picture Loss Indication.
const FMT_PLI: u8 = 1;

/// An RTCP packet the bridge writes towards a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Ask the sender of `media_ssrc` for a keyframe.
    PictureLossIndication { sender_ssrc: u32, media_ssrc: u32 },
}

impl RtcpPacket {
    /// Keyframe request for the stream identified by `media_ssrc`.
    pub fn keyframe_request(media_ssrc: u32) -> Self {
        Self::PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        }
    }

    /// Encode to wire bytes.
    ///
    /// ```text
    /// |V=2|P| FMT=1 |    PT=206     |          length=2             |
    /// |                  SSRC of packet sender                        |
    /// |                  SSRC of media source                         |
    /// ```
    pub fn marshal(&self) -> Bytes {
        match self {
            Self::PictureLossIndication {
                sender_ssrc,
                media_ssrc,
            } => {
                let mut buf = BytesMut::with_capacity(12);
                buf.put_u8((2 << 6) | FMT_PLI);
                buf.put_u8(PT_PSFB);
                buf.put_u16(2);
                buf.put_u32(*sender_ssrc);
                buf.put_u32(*media_ssrc);
                buf.freeze()
            }
        }
    }

    /// Decode a single feedback packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(BridgeError::malformed(PacketErrorKind::Truncated));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(BridgeError::malformed(PacketErrorKind::BadVersion(version)));
        }
        let fmt = data[0] & 0x1f;
        if data[1] != PT_PSFB || fmt != FMT_PLI {
            return Err(BridgeError::malformed(PacketErrorKind::UnsupportedRtcp(
                data[1],
            )));
        }
        Ok(Self::PictureLossIndication {
            sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// SSRC of the media stream the packet refers to.
    pub fn media_ssrc(&self) -> u32 {
        match self {
            Self::PictureLossIndication { media_ssrc, .. } => *media_ssrc,
        }
    }
}
