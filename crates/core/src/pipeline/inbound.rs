//! Pull source → peer sink.
//!
//! ```text
//! Connecting -> Describing -> Playing -> Streaming -> Closed
//!      \             \            \           \
//!       +-------------+------------+-----------+--> Failed
//! ```
//!
//! Connect, describe and setup errors are fatal. Malformed payloads and
//! transient sink errors drop the packet. A closed sink ends the pipeline
//! normally.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ExitReason, PipelineMode, PipelineReport};
use crate::error::{BridgeError, Result};
use crate::media::Codec;
use crate::media::h264::{AccessUnit, AccessUnitAssembler, ParameterSets};
use crate::media::reorder::{ReorderBuffer, ReorderConfig};
use crate::media::rtp::RtpPacket;
use crate::media::sample::SampleClock;
use crate::rtsp::{RtspUrl, StreamingConnector, StreamingSession, TrackDescription};
use crate::session::StreamHandle;
use crate::track::TrackWriter;

/// Parked when nothing waits in the reorder buffer.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    Connecting,
    Describing,
    Playing,
    Streaming,
    Closed,
    Failed,
}

impl fmt::Display for InboundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Describing => "describing",
            Self::Playing => "playing",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pulls one track from an RTSP source into a local sink.
pub struct InboundPipeline {
    connector: Arc<dyn StreamingConnector>,
    url: RtspUrl,
    codec: Codec,
    mode: PipelineMode,
    reorder: ReorderConfig,
    writer: TrackWriter,
    stream: Arc<StreamHandle>,
    cancel: CancellationToken,
    state: Arc<RwLock<InboundState>>,
}

impl InboundPipeline {
    pub fn new(
        connector: Arc<dyn StreamingConnector>,
        url: RtspUrl,
        codec: Codec,
        mode: PipelineMode,
        writer: TrackWriter,
    ) -> Self {
        Self {
            connector,
            url,
            codec,
            mode,
            reorder: ReorderConfig::default(),
            writer,
            stream: Arc::new(StreamHandle::new()),
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(InboundState::Connecting)),
        }
    }

    pub fn with_reorder(mut self, reorder: ReorderConfig) -> Self {
        self.reorder = reorder;
        self
    }

    /// Share the RTSP session handle with whoever else may close it.
    pub fn with_stream_handle(mut self, stream: Arc<StreamHandle>) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Observe the pipeline's state from outside.
    pub fn state_handle(&self) -> Arc<RwLock<InboundState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: InboundState) {
        tracing::debug!(url = %self.url, %state, "inbound pipeline state");
        *self.state.write() = state;
    }

    /// Run to completion. The RTSP session is always closed on return.
    pub async fn run(self) -> Result<PipelineReport> {
        let result = self.stream_source().await;
        self.stream.close().await;

        match &result {
            Ok(report) => {
                self.set_state(InboundState::Closed);
                tracing::info!(
                    url = %self.url,
                    exit = %report.exit,
                    packets_in = report.packets_in,
                    written = report.written,
                    dropped = report.dropped,
                    lost = report.reorder.lost,
                    "inbound pipeline finished"
                );
            }
            Err(e) => {
                self.set_state(InboundState::Failed);
                tracing::warn!(url = %self.url, error = %e, "inbound pipeline failed");
            }
        }
        result
    }

    async fn stream_source(&self) -> Result<PipelineReport> {
        self.set_state(InboundState::Connecting);
        let client = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(PipelineReport::new(ExitReason::Cancelled)),
            client = self.connector.connect_pull(&self.url) => client?,
        };
        let session: Arc<dyn StreamingSession> = client.clone();
        self.stream.attach(session).await;

        self.set_state(InboundState::Describing);
        let (tracks, base) = client.describe(&self.url).await?;
        let track = tracks
            .into_iter()
            .find(|t| t.codec == self.codec)
            .ok_or_else(|| BridgeError::TrackNotFound {
                codec: self.codec.to_string(),
            })?;

        self.set_state(InboundState::Playing);
        let mut packets = client
            .setup_and_play(std::slice::from_ref(&track), &base)
            .await?;

        self.set_state(InboundState::Streaming);
        let mut stage = Stage::new(self.mode, &track, &self.writer);
        let mut reorder = ReorderBuffer::new(self.reorder.clone());

        let exit = loop {
            let deadline = reorder.next_deadline().map(Instant::from_std);
            let released = tokio::select! {
                _ = self.cancel.cancelled() => break ExitReason::Cancelled,
                next = packets.recv() => match next {
                    Some(inbound) => {
                        stage.report.packets_in += 1;
                        reorder.push(inbound.packet, Instant::now().into_std())
                    }
                    None => {
                        let rest = reorder.flush();
                        if stage.emit(rest) || stage.finish() {
                            break ExitReason::SinkClosed;
                        }
                        break ExitReason::SourceEnded;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT)),
                    if deadline.is_some() => reorder.drain_expired(Instant::now().into_std()),
            };
            if stage.emit(released) {
                break ExitReason::SinkClosed;
            }
        };

        stage.report.reorder = reorder.stats();
        stage.report.exit = exit;
        Ok(stage.report)
    }
}

/// The mode-dependent part of the pipeline: everything after reordering.
struct Stage<'a> {
    mode: PipelineMode,
    writer: &'a TrackWriter,
    assembler: AccessUnitAssembler,
    clock: SampleClock,
    parameter_sets: ParameterSets,
    buf: BytesMut,
    last_seq: u16,
    report: PipelineReport,
}

impl<'a> Stage<'a> {
    fn new(mode: PipelineMode, track: &TrackDescription, writer: &'a TrackWriter) -> Self {
        Self {
            mode,
            writer,
            assembler: AccessUnitAssembler::new(),
            clock: SampleClock::new(track.clock_rate),
            parameter_sets: track.parameter_sets(),
            buf: BytesMut::new(),
            last_seq: 0,
            report: PipelineReport::new(ExitReason::SourceEnded),
        }
    }

    /// Process released packets. Returns `true` once the sink is closed.
    fn emit(&mut self, packets: Vec<RtpPacket>) -> bool {
        for packet in packets {
            let closed = match self.mode {
                PipelineMode::Passthrough => self.write_packet(&packet),
                PipelineMode::SampleReconstruct => self.write_samples(&packet),
            };
            if closed {
                return true;
            }
        }
        false
    }

    fn write_packet(&mut self, packet: &RtpPacket) -> bool {
        let result = self.writer.write_rtp(packet.marshal());
        self.record(result, packet.sequence_number)
    }

    fn write_samples(&mut self, packet: &RtpPacket) -> bool {
        self.last_seq = packet.sequence_number;
        let units = match self.assembler.push(packet) {
            Ok(units) => units,
            Err(e) => {
                self.report.dropped += 1;
                tracing::debug!(seq = packet.sequence_number, error = %e, "packet dropped");
                return false;
            }
        };

        for unit in units {
            if self.write_unit(unit, packet.sequence_number) {
                return true;
            }
        }
        false
    }

    /// Write out whatever the assembler still holds once the source ends.
    fn finish(&mut self) -> bool {
        if self.mode != PipelineMode::SampleReconstruct {
            return false;
        }
        match self.assembler.flush() {
            Some(unit) => {
                tracing::debug!(ts = unit.timestamp, "flushing unterminated access unit");
                self.write_unit(unit, self.last_seq)
            }
            None => false,
        }
    }

    fn write_unit(&mut self, mut unit: AccessUnit, seq: u16) -> bool {
        unit.insert_parameter_sets(&self.parameter_sets);
        unit.write_annex_b(&mut self.buf);
        let sample = self.clock.sample(unit.timestamp, self.buf.split().freeze());
        tracing::trace!(
            ts = unit.timestamp,
            nal_units = unit.nal_units.len(),
            keyframe = unit.is_keyframe(),
            ticks = sample.ticks,
            "sample"
        );
        let result = self.writer.write_sample(&sample);
        self.record(result, seq)
    }

    fn record(&mut self, result: Result<usize>, seq: u16) -> bool {
        match result {
            Ok(_) => {
                self.report.written += 1;
                false
            }
            Err(e) if e.is_sink_closed() => {
                tracing::debug!(seq, "sink closed");
                true
            }
            Err(e) => {
                self.report.dropped += 1;
                tracing::warn!(seq, error = %e, "sink write failed, packet dropped");
                false
            }
        }
    }
}
