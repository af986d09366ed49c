//! Sequence-number reorder window.
//!
//! RTP over UDP may arrive out of order. Depacketization needs fragments in
//! order, so the inbound pipeline passes every packet through a
//! [`ReorderBuffer`] first.
//!
//! Sequence numbers are 16-bit and wrap; internally they are extended to
//! 64 bits relative to the highest number seen so far, which makes the
//! ordering total across wraps.
//!
//! Release rules:
//!
//! 1. A packet whose sequence number is the next expected one is released
//!    immediately, together with any contiguous run behind it.
//! 2. If the buffered span reaches `window` packets, the gap in front of the
//!    oldest buffered packet is declared lost and release resumes there.
//! 3. If the oldest buffered packet has waited `max_delay`, same as 2.
//!
//! Packets at or behind the release point (late or duplicate) are dropped.
//! Released sequence numbers are therefore strictly increasing and no
//! packet is delivered twice.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::rtp::RtpPacket;

/// Extended sequence numbers start one full 32-bit cycle in so that
/// backwards steps right after the first packet stay positive.
const INITIAL_CYCLE: u64 = 1 << 32;

/// Reorder window configuration.
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// Maximum span of sequence numbers held at once.
    pub window: u16,
    /// Maximum time a packet waits for a missing predecessor.
    pub max_delay: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            window: 64,
            max_delay: Duration::from_millis(150),
        }
    }
}

/// Counters kept by a [`ReorderBuffer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    pub received: u64,
    pub released: u64,
    pub reordered: u64,
    pub duplicates: u64,
    pub late: u64,
    /// Sequence numbers given up on as lost.
    pub lost: u64,
}

struct Pending {
    packet: RtpPacket,
    arrived: Instant,
}

/// Bounded look-ahead buffer keyed by extended sequence number.
pub struct ReorderBuffer {
    config: ReorderConfig,
    pending: BTreeMap<u64, Pending>,
    next: Option<u64>,
    highest: Option<u64>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config: ReorderConfig {
                window: config.window.max(1),
                ..config
            },
            pending: BTreeMap::new(),
            next: None,
            highest: None,
            stats: ReorderStats::default(),
        }
    }

    /// Insert a packet and return whatever became releasable, in order.
    pub fn push(&mut self, packet: RtpPacket, now: Instant) -> Vec<RtpPacket> {
        self.stats.received += 1;
        let ext = self.extend(packet.sequence_number);
        let next = *self.next.get_or_insert(ext);

        if ext < next {
            self.stats.late += 1;
            tracing::trace!(seq = packet.sequence_number, "late packet dropped");
            return Vec::new();
        }
        if self.pending.contains_key(&ext) {
            self.stats.duplicates += 1;
            tracing::trace!(seq = packet.sequence_number, "duplicate packet dropped");
            return Vec::new();
        }
        if self.pending.keys().next_back().is_some_and(|&last| ext < last) {
            self.stats.reordered += 1;
        }

        self.pending.insert(
            ext,
            Pending {
                packet,
                arrived: now,
            },
        );

        let mut out = Vec::new();
        self.release_contiguous(&mut out);
        self.enforce_window(&mut out);
        out
    }

    /// Release packets whose missing predecessors have waited too long.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<RtpPacket> {
        let mut out = Vec::new();
        while let Some(head) = self.pending.values().next() {
            if now.saturating_duration_since(head.arrived) < self.config.max_delay {
                break;
            }
            self.skip_to_head(&mut out);
        }
        out
    }

    /// Release everything still buffered, in order.
    pub fn flush(&mut self) -> Vec<RtpPacket> {
        let mut out = Vec::new();
        while !self.pending.is_empty() {
            self.skip_to_head(&mut out);
        }
        out
    }

    /// When the oldest buffered packet stops waiting, if anything is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .next()
            .map(|head| head.arrived + self.config.max_delay)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn extend(&mut self, seq: u16) -> u64 {
        let ext = match self.highest {
            None => INITIAL_CYCLE + seq as u64,
            Some(highest) => {
                let delta = seq.wrapping_sub(highest as u16) as i16 as i64;
                (highest as i64 + delta) as u64
            }
        };
        if self.highest.is_none_or(|h| ext > h) {
            self.highest = Some(ext);
        }
        ext
    }

    fn release_contiguous(&mut self, out: &mut Vec<RtpPacket>) {
        while let Some(next) = self.next {
            let Some(pending) = self.pending.remove(&next) else {
                break;
            };
            out.push(pending.packet);
            self.stats.released += 1;
            self.next = Some(next + 1);
        }
    }

    fn enforce_window(&mut self, out: &mut Vec<RtpPacket>) {
        let window = self.config.window as u64;
        while let (Some(next), Some(&last)) = (self.next, self.pending.keys().next_back()) {
            if last - next < window {
                break;
            }
            self.skip_to_head(out);
        }
    }

    /// Give up on the gap before the oldest buffered packet.
    fn skip_to_head(&mut self, out: &mut Vec<RtpPacket>) {
        let Some(&first) = self.pending.keys().next() else {
            return;
        };
        let next = self.next.unwrap_or(first);
        if first > next {
            let lost = first - next;
            self.stats.lost += lost;
            tracing::debug!(lost, resume_seq = first as u16, "reorder gap skipped");
        }
        self.next = Some(first);
        self.release_contiguous(out);
    }
}
