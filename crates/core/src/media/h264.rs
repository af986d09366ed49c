//! H.264 over RTP (RFC 6184).
//!
//! Both directions live here:
//!
//! - [`AccessUnitAssembler`] turns an ordered RTP packet stream into complete
//!   access units (Single NAL, STAP-A and FU-A payloads).
//! - [`H264Packetizer`] turns an Annex B access unit back into RTP packets
//!   (Single NAL and FU-A), used by sample-mode sinks.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use super::Packetizer;
use super::rtp::{RtpHeader, RtpPacket};
use crate::error::{BridgeError, PacketErrorKind, Result};

const DEFAULT_MTU: usize = 1200;

/// Annex B start code written before every NAL unit of a sample.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// One decodable frame: every NAL unit sharing an RTP timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub timestamp: u32,
    pub nal_units: Vec<Bytes>,
}

impl AccessUnit {
    pub fn is_keyframe(&self) -> bool {
        self.nal_units.iter().any(|n| nal_type(n) == NAL_IDR)
    }

    /// Write the byte-stream form: start code then NAL bytes, per unit.
    ///
    /// `buf` is cleared first so one buffer can be reused across access units.
    pub fn write_annex_b(&self, buf: &mut BytesMut) {
        buf.clear();
        for nal in &self.nal_units {
            buf.put_slice(&START_CODE);
            buf.put_slice(nal);
        }
    }

    /// Prepend SPS/PPS to a keyframe that does not carry them in-band.
    pub fn insert_parameter_sets(&mut self, params: &ParameterSets) {
        if !self.is_keyframe() {
            return;
        }
        let has_sps = self.nal_units.iter().any(|n| nal_type(n) == NAL_SPS);
        let has_pps = self.nal_units.iter().any(|n| nal_type(n) == NAL_PPS);
        if !has_pps && let Some(pps) = &params.pps {
            self.nal_units.insert(0, pps.clone());
        }
        if !has_sps && let Some(sps) = &params.sps {
            self.nal_units.insert(0, sps.clone());
        }
    }
}

/// Out-of-band SPS/PPS from an SDP `sprop-parameter-sets` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Decode `sprop-parameter-sets=<b64>,<b64>` (RFC 6184 §8.1).
    ///
    /// Entries that fail to decode are skipped.
    pub fn from_sprop(value: &str) -> Self {
        let mut sets = Self::default();
        for part in value.split(',') {
            let Ok(nal) = BASE64_STANDARD.decode(part.trim()) else {
                tracing::debug!(part, "undecodable sprop-parameter-sets entry");
                continue;
            };
            match nal_type(&nal) {
                NAL_SPS => sets.sps = Some(Bytes::from(nal)),
                NAL_PPS => sets.pps = Some(Bytes::from(nal)),
                _ => {}
            }
        }
        sets
    }

    /// Pull `sprop-parameter-sets` out of a full `a=fmtp` parameter list.
    pub fn from_fmtp(fmtp: &str) -> Self {
        fmtp.split(';')
            .filter_map(|p| p.trim().strip_prefix("sprop-parameter-sets="))
            .map(Self::from_sprop)
            .next()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.sps.is_none() && self.pps.is_none()
    }
}

/// Reassembles access units from an ordered H.264 RTP packet stream.
///
/// An access unit completes when the marker bit is seen (RFC 6184 §5.1) or
/// when a packet with a new timestamp arrives while NAL units are pending,
/// which covers senders that never set the marker.
///
/// A sequence gap in the middle of an FU-A drops the partial NAL unit; the
/// rest of the access unit is still delivered.
#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    timestamp: Option<u32>,
    nal_units: Vec<Bytes>,
    fragment: Option<BytesMut>,
    last_seq: Option<u16>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns access units completed by it.
    ///
    /// A malformed payload returns an error and leaves already-collected NAL
    /// units of the current access unit intact.
    pub fn push(&mut self, packet: &RtpPacket) -> Result<Vec<AccessUnit>> {
        let mut done = Vec::new();

        if let Some(last) = self.last_seq
            && packet.sequence_number != last.wrapping_add(1)
            && self.fragment.take().is_some()
        {
            tracing::debug!(
                expected = last.wrapping_add(1),
                got = packet.sequence_number,
                "gap inside FU-A, fragment discarded"
            );
        }
        self.last_seq = Some(packet.sequence_number);

        if self.timestamp.is_some_and(|ts| ts != packet.timestamp) {
            self.fragment = None;
            done.extend(self.take_access_unit());
        }
        self.timestamp = Some(packet.timestamp);

        self.depacketize(&packet.payload)?;

        if packet.marker {
            done.extend(self.take_access_unit());
        }
        Ok(done)
    }

    /// Hand out the buffered access unit, if any, at end of stream.
    ///
    /// An unfinished FU-A fragment is discarded.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        if self.fragment.take().is_some() {
            tracing::debug!("unfinished FU-A discarded at end of stream");
        }
        let unit = self.take_access_unit();
        self.timestamp = None;
        unit
    }

    /// Whether a partially received access unit is buffered.
    pub fn has_pending(&self) -> bool {
        !self.nal_units.is_empty() || self.fragment.is_some()
    }

    fn depacketize(&mut self, payload: &Bytes) -> Result<()> {
        let Some(&indicator) = payload.first() else {
            return Err(BridgeError::malformed(PacketErrorKind::EmptyPayload));
        };

        match indicator & 0x1f {
            1..=23 => {
                self.nal_units.push(payload.clone());
                Ok(())
            }
            NAL_STAP_A => self.depacketize_stap_a(payload),
            NAL_FU_A => self.depacketize_fu_a(payload),
            other => Err(BridgeError::malformed(PacketErrorKind::UnsupportedNal(
                other,
            ))),
        }
    }

    /// STAP-A (RFC 6184 §5.7.1): 16-bit size-prefixed NAL units.
    fn depacketize_stap_a(&mut self, payload: &Bytes) -> Result<()> {
        let mut offset = 1;
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err(BridgeError::malformed(PacketErrorKind::Truncated));
            }
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                return Err(BridgeError::malformed(PacketErrorKind::Truncated));
            }
            self.nal_units.push(payload.slice(offset..offset + size));
            offset += size;
        }
        Ok(())
    }

    /// FU-A (RFC 6184 §5.8): `[F|NRI|28] [S|E|R|type] data...`
    fn depacketize_fu_a(&mut self, payload: &Bytes) -> Result<()> {
        if payload.len() < 3 {
            return Err(BridgeError::malformed(PacketErrorKind::Truncated));
        }
        let indicator = payload[0];
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            let mut nal = BytesMut::with_capacity(payload.len() * 4);
            nal.put_u8((indicator & 0xe0) | (header & 0x1f));
            self.fragment = Some(nal);
        }

        let Some(fragment) = self.fragment.as_mut() else {
            return Err(BridgeError::malformed(PacketErrorKind::OrphanFragment));
        };
        fragment.put_slice(&payload[2..]);

        if end && let Some(nal) = self.fragment.take() {
            self.nal_units.push(nal.freeze());
        }
        Ok(())
    }

    fn take_access_unit(&mut self) -> Option<AccessUnit> {
        let timestamp = self.timestamp?;
        if self.nal_units.is_empty() {
            return None;
        }
        Some(AccessUnit {
            timestamp,
            nal_units: std::mem::take(&mut self.nal_units),
        })
    }
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts Annex B access units into RTP packets:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent as-is.
/// - **FU-A Fragmentation** (§5.8): larger NALs are split, each fragment
///   carrying a 2-byte FU header (`[F|NRI|28] [S|E|R|type]`).
///
/// The marker bit is set on the last packet of the access unit.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: DEFAULT_MTU,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            mtu: DEFAULT_MTU,
        }
    }

    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(12 + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return packets;
        }

        let nal_header = nal_unit[0];
        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let nal_type = nal_header & 0x1f;
        let max_fragment = self.mtu - 2;

        let chunks: Vec<&[u8]> = nal_unit[1..].chunks(max_fragment).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let first = i == 0;
            let last = i + 1 == count;
            let fu_header = ((first as u8) << 7) | ((last as u8) << 6) | nal_type;

            let hdr = self.header.write(is_last_nal && last);
            let mut packet = Vec::with_capacity(14 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
        packets
    }

    /// Split an Annex B bitstream into NAL units (3- or 4-byte start codes).
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut starts: Vec<(usize, usize)> = Vec::new();
        let mut i = 0usize;
        while i + 2 < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == START_CODE {
                starts.push((i + 4, 4));
                i += 4;
            } else if data[i..i + 3] == [0, 0, 1] {
                starts.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        starts
            .iter()
            .enumerate()
            .filter_map(|(idx, &(start, _))| {
                let end = starts
                    .get(idx + 1)
                    .map(|&(next, sc_len)| next - sc_len)
                    .unwrap_or(data.len());
                (start < end).then(|| &data[start..end])
            })
            .collect()
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = Self::extract_nal_units(encoded_data);
        self.header.advance_timestamp(timestamp_increment);
        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i + 1 == nal_units.len();
            packets.append(&mut self.packetize_nal(nal, is_last));
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "sample packetized"
        );
        packets
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }
}
