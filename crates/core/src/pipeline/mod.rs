//! Packet pipelines between the RTSP side and the peer side.
//!
//! - [`inbound`]: pull source → reorder → (depacketize → sample) → peer sink.
//! - [`outbound`]: peer track → shared publish sink + push sink, plus the
//!   periodic keyframe request towards the publishing peer.
//!
//! Every pipeline ends with a [`PipelineReport`]. Errors that end a
//! pipeline early (unreachable source, missing track, rejected push) are
//! returned instead.

pub mod inbound;
pub mod outbound;

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::media::reorder::ReorderStats;
use crate::peer::RtpSender;

pub use inbound::{InboundPipeline, InboundState};
pub use outbound::{KeyframeRequester, OutboundPipeline};

/// What the inbound pipeline does between reordering and the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Forward reordered RTP packets unchanged.
    Passthrough,
    /// Rebuild access units and write them as Annex B samples.
    SampleReconstruct,
}

/// Why a pipeline stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The sink was closed for good.
    SinkClosed,
    /// The source stopped delivering packets.
    SourceEnded,
    /// The owning session was torn down.
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SinkClosed => "sink closed",
            Self::SourceEnded => "source ended",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Counters a pipeline reports when it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub packets_in: u64,
    /// Packets or samples the sink accepted.
    pub written: u64,
    /// Packets dropped as malformed or after a transient write failure.
    pub dropped: u64,
    pub reorder: ReorderStats,
    pub exit: ExitReason,
}

impl PipelineReport {
    pub(crate) fn new(exit: ExitReason) -> Self {
        Self {
            packets_in: 0,
            written: 0,
            dropped: 0,
            reorder: ReorderStats::default(),
            exit,
        }
    }
}

/// Read and discard RTCP for a track sent to a peer.
///
/// The engine only runs its feedback handling (NACK, reports) while
/// someone reads. Stops on `cancel` or when the sender is gone.
pub async fn drain_rtcp(sender: Arc<dyn RtpSender>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = sender.read_rtcp() => {
                if let Err(e) = read {
                    tracing::trace!(error = %e, "RTCP drain stopped");
                    break;
                }
            }
        }
    }
}
