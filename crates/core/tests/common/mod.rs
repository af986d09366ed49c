//! In-process stand-ins for the peer engine and the RTSP side.
//!
//! Every fake records what the bridge did to it so tests can assert on
//! call order and close counts.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use bridge::endpoint::Endpoint;
use bridge::media::rtcp::RtcpPacket;
use bridge::media::rtp::RtpPacket;
use bridge::media::{Codec, CodecCapability, CodecParameters, MediaKind};
use bridge::peer::{
    ConnectivityState, PeerApi, PeerConnection, PeerEvent, RemoteTrack, RtcConfiguration,
    RtpSender, SessionDescription, TransceiverDirection,
};
use bridge::rtsp::{
    InboundPacket, PullClient, PushClient, RtspUrl, StreamingConnector, StreamingSession,
    TrackDescription,
};
use bridge::{BridgeError, LocalTrack, Result};

pub const H264_OFFER: &str = "v=0\r\n\
    o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=rtpmap:102 H264/90000\r\n\
    a=fmtp:102 packetization-mode=1;profile-level-id=42e01f\r\n";

pub const VP8_OFFER: &str = "v=0\r\n\
    o=- 4611731400430051337 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    a=rtpmap:96 VP8/90000\r\n";

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn rtp(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> RtpPacket {
    RtpPacket {
        marker,
        payload_type: 102,
        sequence_number: seq,
        timestamp: ts,
        ssrc: 0x1234_5678,
        csrc: Vec::new(),
        extension: None,
        payload: Bytes::copy_from_slice(payload),
    }
}

pub fn track_description(codec: Codec, payload_type: u8, control: &str) -> TrackDescription {
    TrackDescription {
        kind: codec.kind(),
        payload_type,
        codec,
        clock_rate: 90_000,
        channels: 0,
        fmtp: None,
        control: control.to_string(),
    }
}

// ---- peer engine ----

#[derive(Default)]
pub struct FakePeerApi {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub fail_remote_description: AtomicBool,
}

impl FakePeerApi {
    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock()[index])
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerApi for FakePeerApi {
    async fn new_peer_connection(
        &self,
        _config: RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer::new(
            self.fail_remote_description.load(Ordering::SeqCst),
        ));
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer as Arc<dyn PeerConnection>)
    }
}

pub struct FakePeer {
    events_tx: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    fail_remote_description: bool,
    gathering: Mutex<Option<mpsc::Sender<()>>>,
    local: Mutex<Option<SessionDescription>>,
    /// What the engine reads from each attached local track.
    pub subscriptions: Mutex<Vec<mpsc::Receiver<Bytes>>>,
    pub transceivers: Mutex<Vec<(MediaKind, TransceiverDirection)>>,
    pub rtcp: Mutex<Vec<RtcpPacket>>,
    pub closes: AtomicUsize,
}

impl FakePeer {
    pub fn new(fail_remote_description: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            fail_remote_description,
            gathering: Mutex::new(None),
            local: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            rtcp: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn take_subscription(&self) -> mpsc::Receiver<Bytes> {
        self.subscriptions.lock().remove(0)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn RtpSender>> {
        let rx = track
            .subscribe()
            .ok_or_else(|| BridgeError::Peer("track already closed".into()))?;
        self.subscriptions.lock().push(rx);
        Ok(Arc::new(FakeSender) as Arc<dyn RtpSender>)
    }

    async fn add_transceiver_from_kind(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<()> {
        self.transceivers.lock().push((kind, direction));
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        if self.fail_remote_description {
            return Err(BridgeError::Peer("remote description rejected".into()));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\ns=-\r\nt=0 0\r\n"))
    }

    async fn set_local_description(&self, mut desc: SessionDescription) -> Result<()> {
        desc.sdp
            .push_str("a=candidate:1 1 udp 2130706431 127.0.0.1 2000 typ host\r\n");
        *self.local.lock() = Some(desc);
        self.emit(PeerEvent::IceCandidate(Some(
            "candidate:1 1 udp 2130706431 127.0.0.1 2000 typ host".into(),
        )));
        self.emit(PeerEvent::IceCandidate(None));
        if let Some(done) = self.gathering.lock().take() {
            let _ = done.try_send(());
        }
        Ok(())
    }

    async fn gathering_complete_promise(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        *self.gathering.lock() = Some(tx);
        rx
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()> {
        self.rtcp.lock().extend_from_slice(packets);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.emit(PeerEvent::ConnectivityChange(ConnectivityState::Closed));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }
}

pub struct FakeSender;

#[async_trait]
impl RtpSender for FakeSender {
    async fn read_rtcp(&self) -> Result<Bytes> {
        std::future::pending().await
    }
}

pub struct FakeRemoteTrack {
    ssrc: u32,
    codec: CodecParameters,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl FakeRemoteTrack {
    /// A VP8 track and the handle that feeds it.
    pub fn vp8(ssrc: u32) -> (Arc<Self>, mpsc::UnboundedSender<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            ssrc,
            codec: CodecParameters::new(CodecCapability::new(Codec::Vp8, 90_000), 96),
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn kind(&self) -> MediaKind {
        self.codec.capability.codec.kind()
    }

    fn codec(&self) -> CodecParameters {
        self.codec.clone()
    }

    async fn read_rtp(&self) -> Result<Bytes> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BridgeError::Peer("remote track ended".into()))
    }
}

// ---- RTSP side ----

#[derive(Default)]
pub struct FakePullClient {
    pub tracks: Vec<TrackDescription>,
    pub packets: Vec<RtpPacket>,
    pub calls: Mutex<Vec<&'static str>>,
    pub set_up: Mutex<Vec<TrackDescription>>,
    pub closes: AtomicUsize,
    /// End the packet stream after the scripted packets instead of waiting
    /// for close.
    pub ends: bool,
    /// Keeps the packet channel open until the session is closed.
    feed: Mutex<Option<mpsc::Sender<InboundPacket>>>,
}

impl FakePullClient {
    pub fn new(tracks: Vec<TrackDescription>, packets: Vec<RtpPacket>) -> Arc<Self> {
        Arc::new(Self {
            tracks,
            packets,
            ..Default::default()
        })
    }

    /// A source that stops sending after `packets`.
    pub fn ending(tracks: Vec<TrackDescription>, packets: Vec<RtpPacket>) -> Arc<Self> {
        Arc::new(Self {
            tracks,
            packets,
            ends: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingSession for FakePullClient {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("close");
        self.feed.lock().take();
        Ok(())
    }
}

#[async_trait]
impl PullClient for FakePullClient {
    async fn describe(&self, url: &RtspUrl) -> Result<(Vec<TrackDescription>, RtspUrl)> {
        self.calls.lock().push("describe");
        Ok((self.tracks.clone(), url.clone()))
    }

    async fn setup_and_play(
        &self,
        tracks: &[TrackDescription],
        _base: &RtspUrl,
    ) -> Result<mpsc::Receiver<InboundPacket>> {
        self.calls.lock().push("setup_and_play");
        self.set_up.lock().extend_from_slice(tracks);

        let (tx, rx) = mpsc::channel(self.packets.len().max(1));
        for packet in &self.packets {
            let _ = tx.try_send(InboundPacket {
                track: 0,
                packet: packet.clone(),
            });
        }
        if !self.ends {
            *self.feed.lock() = Some(tx);
        }
        Ok(rx)
    }
}

#[derive(Default)]
pub struct FakePushClient {
    pub announced: Mutex<Vec<TrackDescription>>,
    pub written: Mutex<Vec<RtpPacket>>,
    pub closes: AtomicUsize,
    pub reject_announce: bool,
}

impl FakePushClient {
    pub fn written(&self) -> Vec<RtpPacket> {
        self.written.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingSession for FakePushClient {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PushClient for FakePushClient {
    async fn start_publishing(&self, _url: &RtspUrl, tracks: &[TrackDescription]) -> Result<()> {
        if self.reject_announce {
            return Err(BridgeError::Status {
                code: 403,
                reason: "Forbidden".into(),
            });
        }
        self.announced.lock().extend_from_slice(tracks);
        Ok(())
    }

    async fn write_packet(&self, _track: usize, packet: &RtpPacket) -> Result<()> {
        self.written.lock().push(packet.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub pull: Option<Arc<FakePullClient>>,
    pub push: Option<Arc<FakePushClient>>,
    pub pull_connects: AtomicUsize,
}

#[async_trait]
impl StreamingConnector for FakeConnector {
    async fn connect_pull(&self, url: &RtspUrl) -> Result<Arc<dyn PullClient>> {
        self.pull_connects.fetch_add(1, Ordering::SeqCst);
        match &self.pull {
            Some(pull) => Ok(Arc::clone(pull) as Arc<dyn PullClient>),
            None => Err(BridgeError::Connect(format!("{url}: connection refused"))),
        }
    }

    async fn connect_push(&self, url: &RtspUrl) -> Result<Arc<dyn PushClient>> {
        match &self.push {
            Some(push) => Ok(Arc::clone(push) as Arc<dyn PushClient>),
            None => Err(BridgeError::Connect(format!("{url}: connection refused"))),
        }
    }
}

/// An endpoint on an ephemeral loopback port backed by `api`.
pub async fn endpoint(api: Arc<FakePeerApi>) -> Arc<Endpoint> {
    let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap(), Vec::new(), move |_, _| {
        Ok(api as Arc<dyn PeerApi>)
    })
    .await
    .unwrap();
    Arc::new(endpoint)
}
