//! Publishing peer → push sink, with local fan-out.
//!
//! Every packet the peer sends is forwarded twice: unchanged to the shared
//! publish sink that subscriber sessions read, and re-tagged to the push
//! sink's payload type towards the RTSP server. The shared sink is created
//! from the peer's negotiated codec when the first packet arrives.
//!
//! Shared-sink writes are best effort. A push rejection ends the pipeline
//! with an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ExitReason, PipelineReport};
use crate::error::Result;
use crate::media::rtcp::RtcpPacket;
use crate::media::rtp::RtpPacket;
use crate::peer::{PeerConnection, RemoteTrack};
use crate::rtsp::PushClient;
use crate::track::{
    DEFAULT_SUBSCRIBER_BUFFER, LocalTrack, SharedPublishSlot, TrackPurpose, TrackWriter,
};

/// Forwards one remote peer track.
pub struct OutboundPipeline {
    session_id: String,
    remote: Arc<dyn RemoteTrack>,
    push: Arc<dyn PushClient>,
    push_payload_type: u8,
    shared: Arc<SharedPublishSlot>,
    track_id: String,
    stream_id: String,
    subscriber_buffer: usize,
    cancel: CancellationToken,
}

impl OutboundPipeline {
    pub fn new(
        session_id: &str,
        remote: Arc<dyn RemoteTrack>,
        push: Arc<dyn PushClient>,
        push_payload_type: u8,
        shared: Arc<SharedPublishSlot>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            remote,
            push,
            push_payload_type,
            shared,
            track_id: "video".to_string(),
            stream_id: "bridge".to_string(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            cancel: CancellationToken::new(),
        }
    }

    /// Labels of the shared sink this pipeline creates.
    pub fn with_labels(mut self, track_id: &str, stream_id: &str) -> Self {
        self.track_id = track_id.to_string();
        self.stream_id = stream_id.to_string();
        self
    }

    pub fn with_subscriber_buffer(mut self, subscriber_buffer: usize) -> Self {
        self.subscriber_buffer = subscriber_buffer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(self) -> Result<PipelineReport> {
        let mut report = PipelineReport::new(ExitReason::SourceEnded);
        let mut shared: Option<TrackWriter> = None;
        let mut first = true;

        let result = loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(ExitReason::Cancelled),
                read = self.remote.read_rtp() => match read {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::debug!(session_id = %self.session_id, error = %e, "remote track ended");
                        break Ok(ExitReason::SourceEnded);
                    }
                },
            };
            report.packets_in += 1;

            if first {
                first = false;
                shared = self.create_shared_sink();
            }
            let fanned_out = shared.as_ref().map(|writer| writer.write_rtp(raw.clone()));
            if let Some(Err(e)) = fanned_out {
                if e.is_sink_closed() {
                    tracing::info!(session_id = %self.session_id, "shared publish sink replaced, local fan-out stopped");
                    shared = None;
                } else {
                    tracing::trace!(error = %e, "shared sink write failed");
                }
            }

            let mut packet = match RtpPacket::parse(&raw) {
                Ok(packet) => packet,
                Err(e) => {
                    report.dropped += 1;
                    tracing::debug!(error = %e, "malformed packet from peer dropped");
                    continue;
                }
            };
            packet.payload_type = self.push_payload_type;
            if let Err(e) = self.push.write_packet(0, &packet).await {
                break Err(e);
            }
            report.written += 1;
        };

        match result {
            Ok(exit) => {
                report.exit = exit;
                tracing::info!(
                    session_id = %self.session_id,
                    exit = %exit,
                    packets_in = report.packets_in,
                    written = report.written,
                    dropped = report.dropped,
                    "outbound pipeline finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "push sink rejected packet");
                Err(e)
            }
        }
    }

    fn create_shared_sink(&self) -> Option<TrackWriter> {
        let capability = self.remote.codec().capability;
        let track = LocalTrack::with_buffer(
            capability,
            &self.track_id,
            &self.stream_id,
            TrackPurpose::SharedPublish,
            self.subscriber_buffer,
        );
        let writer = match track.writer() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!(error = %e, "cannot write shared publish sink");
                return None;
            }
        };
        self.shared.replace(&self.session_id, track);
        Some(writer)
    }
}

/// Asks the publishing peer for a keyframe on a fixed interval.
pub struct KeyframeRequester {
    peer: Arc<dyn PeerConnection>,
    media_ssrc: u32,
    interval: Duration,
    cancel: CancellationToken,
}

impl KeyframeRequester {
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        media_ssrc: u32,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer,
            media_ssrc,
            interval,
            cancel,
        }
    }

    /// Tick until cancelled. Returns how many requests were written.
    pub async fn run(self) -> u64 {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        let request = [RtcpPacket::keyframe_request(self.media_ssrc)];
        let mut sent = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.peer.write_rtcp(&request).await {
                        Ok(()) => sent += 1,
                        Err(e) => tracing::debug!(ssrc = self.media_ssrc, error = %e, "keyframe request failed"),
                    }
                }
            }
        }
        tracing::debug!(ssrc = self.media_ssrc, sent, "keyframe requests stopped");
        sent
    }
}
