//! Local media sinks.
//!
//! A [`LocalTrack`] is a one-way media flow with exactly one writer and any
//! number of subscribers. Subscribers are bounded queues of whole RTP
//! packets; the peer engine holds one per attached peer connection.
//!
//! Every write delivers complete packets while holding the subscriber lock,
//! so two writers (or a writer racing a subscribe) can never interleave
//! partial packets. A sample write packetizes and delivers the whole sample
//! under the same lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{BridgeError, Result};
use crate::media::h264::H264Packetizer;
use crate::media::sample::Sample;
use crate::media::{Codec, CodecCapability, MediaKind, Packetizer};

/// Default queue depth of one subscriber, in packets.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 512;

/// What a sink is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPurpose {
    /// Fed from a pull source, read by one peer.
    InboundFromSource,
    /// Written by the bridge towards one peer.
    OutboundToPeer,
    /// Fed by a publishing peer, read by any number of peers.
    SharedPublish,
}

/// A sink with a single writer and many subscribers.
pub struct LocalTrack {
    id: String,
    stream_id: String,
    purpose: TrackPurpose,
    capability: CodecCapability,
    subscriber_buffer: usize,
    subscribers: Mutex<Vec<mpsc::Sender<Bytes>>>,
    packetizer: Mutex<Option<Box<dyn Packetizer>>>,
    writer_claimed: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("purpose", &self.purpose)
            .field("codec", &self.capability.codec)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(
        capability: CodecCapability,
        id: &str,
        stream_id: &str,
        purpose: TrackPurpose,
    ) -> Arc<Self> {
        Self::with_buffer(capability, id, stream_id, purpose, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(
        capability: CodecCapability,
        id: &str,
        stream_id: &str,
        purpose: TrackPurpose,
        subscriber_buffer: usize,
    ) -> Arc<Self> {
        let packetizer: Option<Box<dyn Packetizer>> = match capability.codec {
            Codec::H264 => Some(Box::new(H264Packetizer::with_random_ssrc(
                dynamic_payload_type(&capability),
            ))),
            _ => None,
        };
        tracing::debug!(
            track_id = id,
            stream_id,
            codec = %capability.codec,
            ?purpose,
            "local track created"
        );
        Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            purpose,
            capability,
            subscriber_buffer: subscriber_buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
            packetizer: Mutex::new(packetizer),
            writer_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn purpose(&self) -> TrackPurpose {
        self.purpose
    }

    pub fn capability(&self) -> &CodecCapability {
        &self.capability
    }

    pub fn kind(&self) -> MediaKind {
        self.capability.codec.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Claim the single writer slot.
    ///
    /// The claim is released when the returned [`TrackWriter`] is dropped.
    pub fn writer(self: &Arc<Self>) -> Result<TrackWriter> {
        if self.is_closed() {
            return Err(BridgeError::SinkClosed);
        }
        if self
            .writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::WriterBusy(self.id.clone()));
        }
        Ok(TrackWriter {
            track: Arc::clone(self),
        })
    }

    /// Register a new reader. Returns `None` once the track is closed.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<Bytes>> {
        let mut subscribers = self.subscribers.lock();
        if self.is_closed() {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        subscribers.push(tx);
        tracing::debug!(
            track_id = %self.id,
            subscribers = subscribers.len(),
            "subscriber attached"
        );
        Some(rx)
    }

    /// Close the track permanently. Subscribers see end of stream.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut subscribers = self.subscribers.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        subscribers.clear();
        tracing::debug!(track_id = %self.id, "local track closed");
        true
    }

    fn deliver(&self, subscribers: &mut Vec<mpsc::Sender<Bytes>>, packet: Bytes) -> usize {
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(packet.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::trace!(track_id = %self.id, "subscriber queue full, packet dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

/// Exclusive write access to a [`LocalTrack`].
#[derive(Debug)]
pub struct TrackWriter {
    track: Arc<LocalTrack>,
}

impl TrackWriter {
    pub fn track(&self) -> &Arc<LocalTrack> {
        &self.track
    }

    /// Forward one RTP packet unchanged.
    ///
    /// Returns how many subscribers accepted it; zero subscribers is not an
    /// error. Fails with [`BridgeError::SinkClosed`] once the track is closed.
    pub fn write_rtp(&self, packet: Bytes) -> Result<usize> {
        let mut subscribers = self.track.subscribers.lock();
        if self.track.is_closed() {
            return Err(BridgeError::SinkClosed);
        }
        Ok(self.track.deliver(&mut subscribers, packet))
    }

    /// Packetize a byte-stream sample and deliver every resulting packet.
    ///
    /// The RTP timestamp advances by the sample duration in this track's clock.
    pub fn write_sample(&self, sample: &Sample) -> Result<usize> {
        let mut packetizer = self.track.packetizer.lock();
        let Some(packetizer) = packetizer.as_mut() else {
            return Err(BridgeError::UnsupportedCodec(
                self.track.capability.codec.to_string(),
            ));
        };

        let mut subscribers = self.track.subscribers.lock();
        if self.track.is_closed() {
            return Err(BridgeError::SinkClosed);
        }
        let ticks = sample.duration_ticks(packetizer.clock_rate());
        let mut delivered = 0;
        for packet in packetizer.packetize(&sample.data, ticks) {
            delivered += self.track.deliver(&mut subscribers, Bytes::from(packet));
        }
        Ok(delivered)
    }
}

impl Drop for TrackWriter {
    fn drop(&mut self) {
        self.track.writer_claimed.store(false, Ordering::Release);
    }
}

/// Payload type sample sinks stamp on packets they build.
///
/// Peer engines rewrite it per binding, so any dynamic value works.
fn dynamic_payload_type(capability: &CodecCapability) -> u8 {
    crate::media::default_codecs()
        .into_iter()
        .find(|c| c.capability.codec == capability.codec)
        .map(|c| c.payload_type)
        .unwrap_or(96)
}

/// Holder of the one process-wide shared publish sink.
///
/// The track stays published until another publisher replaces it; the
/// owning session only gives up its ownership mark on teardown.
#[derive(Debug, Default)]
pub struct SharedPublishSlot {
    inner: Mutex<Option<Published>>,
}

#[derive(Debug)]
struct Published {
    owner: Option<String>,
    track: Arc<LocalTrack>,
}

impl SharedPublishSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `track` on behalf of session `owner`, closing any previous one.
    pub fn replace(&self, owner: &str, track: Arc<LocalTrack>) {
        let previous = self.inner.lock().replace(Published {
            owner: Some(owner.to_string()),
            track,
        });
        if let Some(previous) = previous {
            tracing::info!(
                track_id = previous.track.id(),
                previous_owner = ?previous.owner,
                new_owner = owner,
                "shared publish sink replaced"
            );
            previous.track.close();
        }
    }

    pub fn current(&self) -> Option<Arc<LocalTrack>> {
        self.inner
            .lock()
            .as_ref()
            .filter(|p| !p.track.is_closed())
            .map(|p| Arc::clone(&p.track))
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.lock().as_ref().and_then(|p| p.owner.clone())
    }

    /// Drop the ownership mark if `owner` holds it.
    pub fn release_if_owner(&self, owner: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.as_mut() {
            Some(published) if published.owner.as_deref() == Some(owner) => {
                published.owner = None;
                tracing::debug!(owner, "shared publish sink released");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::media::h264::START_CODE;
    use crate::media::rtp::RtpPacket;

    fn track(codec: Codec) -> Arc<LocalTrack> {
        LocalTrack::with_buffer(
            CodecCapability::new(codec, 90_000),
            "video",
            "bridge",
            TrackPurpose::OutboundToPeer,
            8,
        )
    }

    #[test]
    fn single_writer_claim() {
        let t = track(Codec::Vp8);
        let w = t.writer().unwrap();
        assert!(matches!(t.writer(), Err(BridgeError::WriterBusy(_))));
        drop(w);
        assert!(t.writer().is_ok());
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_packet() {
        let t = track(Codec::Vp8);
        let mut a = t.subscribe().unwrap();
        let mut b = t.subscribe().unwrap();
        let w = t.writer().unwrap();
        for i in 0..3u8 {
            assert_eq!(w.write_rtp(Bytes::from(vec![i; 4])).unwrap(), 2);
        }
        for i in 0..3u8 {
            assert_eq!(a.recv().await.unwrap(), Bytes::from(vec![i; 4]));
            assert_eq!(b.recv().await.unwrap(), Bytes::from(vec![i; 4]));
        }
    }

    #[test]
    fn no_subscribers_is_not_an_error() {
        let t = track(Codec::Vp8);
        let w = t.writer().unwrap();
        assert_eq!(w.write_rtp(Bytes::from_static(b"x")).unwrap(), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let t = track(Codec::Vp8);
        let rx = t.subscribe().unwrap();
        let w = t.writer().unwrap();
        drop(rx);
        assert_eq!(w.write_rtp(Bytes::from_static(b"x")).unwrap(), 0);
        assert_eq!(t.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_writers_and_subscribers() {
        let t = track(Codec::Vp8);
        let mut rx = t.subscribe().unwrap();
        let w = t.writer().unwrap();
        assert!(t.close());
        assert!(!t.close());
        assert!(w.write_rtp(Bytes::from_static(b"x")).unwrap_err().is_sink_closed());
        assert!(rx.recv().await.is_none());
        assert!(t.subscribe().is_none());
    }

    #[tokio::test]
    async fn sample_write_packetizes() {
        let t = track(Codec::H264);
        let mut rx = t.subscribe().unwrap();
        let w = t.writer().unwrap();
        let data = [&START_CODE[..], &[0x67, 1], &START_CODE[..], &[0x65, 2, 3]].concat();
        let sample = Sample {
            data: Bytes::from(data),
            ticks: 3600,
            clock_rate: 90_000,
        };
        assert_eq!(w.write_sample(&sample).unwrap(), 2);
        assert_eq!(w.write_sample(&sample).unwrap(), 2);

        let first = RtpPacket::parse(&rx.recv().await.unwrap()).unwrap();
        let second = RtpPacket::parse(&rx.recv().await.unwrap()).unwrap();
        let third = RtpPacket::parse(&rx.recv().await.unwrap()).unwrap();
        assert!(!first.marker);
        assert!(second.marker);
        assert_eq!(&second.payload[..], &[0x65, 2, 3]);
        assert_eq!(third.timestamp.wrapping_sub(first.timestamp), 3600);
        assert_eq!(second.sequence_number, first.sequence_number.wrapping_add(1));
    }

    #[test]
    fn sample_write_needs_a_packetizer() {
        let t = track(Codec::Vp8);
        let w = t.writer().unwrap();
        let sample = Sample {
            data: Bytes::new(),
            ticks: 0,
            clock_rate: 90_000,
        };
        assert!(matches!(
            w.write_sample(&sample),
            Err(BridgeError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn publish_slot_replacement_closes_previous() {
        let slot = SharedPublishSlot::new();
        let first = track(Codec::Vp8);
        slot.replace("a", Arc::clone(&first));
        assert_eq!(slot.owner().as_deref(), Some("a"));

        assert!(!slot.release_if_owner("b"));
        assert!(slot.release_if_owner("a"));
        assert!(slot.current().is_some(), "release keeps the sink published");

        let second = track(Codec::Vp8);
        slot.replace("b", Arc::clone(&second));
        assert!(first.is_closed());
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &second));
    }
}
