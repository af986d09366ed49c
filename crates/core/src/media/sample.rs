//! Reconstructed media samples and their durations.

use std::time::Duration;

use bytes::Bytes;

/// One access unit in byte-stream form, ready for a sample sink.
///
/// The duration is kept in clock ticks of the source so re-packetizing at
/// the same rate reproduces the source timestamps exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    pub ticks: u32,
    pub clock_rate: u32,
}

impl Sample {
    pub fn duration(&self) -> Duration {
        let rate = u128::from(self.clock_rate.max(1));
        let nanos = (u128::from(self.ticks) * 1_000_000_000 + rate / 2) / rate;
        Duration::from_nanos(nanos as u64)
    }

    /// Duration expressed in ticks of `clock_rate`, rounded to the nearest tick.
    pub fn duration_ticks(&self, clock_rate: u32) -> u32 {
        if clock_rate == self.clock_rate {
            return self.ticks;
        }
        let from = u64::from(self.clock_rate.max(1));
        ((u64::from(self.ticks) * u64::from(clock_rate) + from / 2) / from) as u32
    }
}

/// Derives sample durations from consecutive RTP timestamps.
///
/// The first sample has zero duration. After that the duration is the
/// wrapping 32-bit delta to the previous timestamp, clamped at zero when
/// timestamps step backwards.
#[derive(Debug)]
pub struct SampleClock {
    clock_rate: u32,
    previous: Option<u32>,
}

impl SampleClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            previous: None,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Ticks since the previous timestamp.
    pub fn advance(&mut self, timestamp: u32) -> u32 {
        match self.previous.replace(timestamp) {
            None => 0,
            Some(prev) => (timestamp.wrapping_sub(prev) as i32).max(0) as u32,
        }
    }

    /// Wrap `data` as the sample stamped `timestamp`.
    pub fn sample(&mut self, timestamp: u32, data: Bytes) -> Sample {
        Sample {
            data,
            ticks: self.advance(timestamp),
            clock_rate: self.clock_rate,
        }
    }
}
