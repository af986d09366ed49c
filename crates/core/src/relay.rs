//! UDP passthrough relay.
//!
//! Binds one socket and copies every datagram it receives into a local
//! track, byte for byte.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::pipeline::{ExitReason, PipelineReport};
use crate::track::TrackWriter;

/// Largest datagram the relay forwards. Anything above is truncated by the
/// socket, which only happens with a misconfigured sender.
const MAX_DATAGRAM: usize = 1600;

/// Raw UDP into a local sink.
///
/// Every datagram is forwarded unchanged: no RTP parsing, no sequence
/// checks, no reordering. The relay stops on a socket read error, on
/// cancellation, or at the first write after the sink was closed.
pub struct UdpRelay {
    socket: UdpSocket,
    writer: TrackWriter,
    cancel: CancellationToken,
}

impl UdpRelay {
    pub async fn bind(addr: SocketAddr, writer: TrackWriter) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        tracing::info!(addr = %socket.local_addr()?, track_id = writer.track().id(), "UDP relay bound");
        Ok(Self {
            socket,
            writer,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> PipelineReport {
        let mut report = PipelineReport::new(ExitReason::SourceEnded);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        report.exit = loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break ExitReason::Cancelled,
                read = self.socket.recv_from(&mut buf) => match read {
                    Ok((n, _)) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP relay read failed");
                        break ExitReason::SourceEnded;
                    }
                },
            };
            report.packets_in += 1;

            match self.writer.write_rtp(Bytes::copy_from_slice(&buf[..n])) {
                Ok(_) => report.written += 1,
                Err(e) if e.is_sink_closed() => break ExitReason::SinkClosed,
                Err(e) => {
                    report.dropped += 1;
                    tracing::warn!(error = %e, "UDP relay write failed, datagram dropped");
                }
            }
        };

        tracing::info!(
            exit = %report.exit,
            packets_in = report.packets_in,
            written = report.written,
            "UDP relay finished"
        );
        report
    }
}
