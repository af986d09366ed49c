use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, PacketErrorKind, Result};

const FIXED_HEADER_LEN: usize = 12;

/// A parsed RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                  CSRC list / header extension                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Padding is stripped on parse and never re-emitted. The header
/// extension, when present, is carried through untouched so passthrough
/// forwarding does not lose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// `(profile, data)` of the header extension.
    pub extension: Option<(u16, Bytes)>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Decode an RTP packet from wire bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(BridgeError::malformed(PacketErrorKind::Truncated));
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(BridgeError::malformed(PacketErrorKind::BadVersion(version)));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = FIXED_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(BridgeError::malformed(PacketErrorKind::Truncated));
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let at = offset + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();
        offset += csrc_count * 4;

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(BridgeError::malformed(PacketErrorKind::Truncated));
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if data.len() < offset + words * 4 {
                return Err(BridgeError::malformed(PacketErrorKind::Truncated));
            }
            let ext = Bytes::copy_from_slice(&data[offset..offset + words * 4]);
            offset += words * 4;
            Some((profile, ext))
        } else {
            None
        };

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(BridgeError::malformed(PacketErrorKind::BadPadding));
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }

    /// Encode back to wire bytes.
    pub fn marshal(&self) -> Bytes {
        let ext_len = self
            .extension
            .as_ref()
            .map(|(_, data)| 4 + data.len())
            .unwrap_or(0);
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_LEN + self.csrc.len() * 4 + ext_len + self.payload.len(),
        );

        let mut first = 2u8 << 6;
        if self.extension.is_some() {
            first |= 0x10;
        }
        first |= (self.csrc.len() as u8) & 0x0f;
        buf.put_u8(first);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
        if let Some((profile, data)) = &self.extension {
            buf.put_u16(*profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(data);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Generic RTP fixed header builder for outgoing packets.
///
/// Shared by the packetizers. It manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: stored as u64 internally; the lower 32 bits are written.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 unless given.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        let ssrc = rand::random::<u32>();
        Self::new(pt, ssrc)
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; 12] {
        let mut header = [0u8; 12];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | self.pt;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Advance the RTP timestamp by `increment` clock ticks.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}
