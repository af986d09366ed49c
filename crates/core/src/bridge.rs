//! Turns a signaling offer into an answer and a running session.
//!
//! ## Modes
//!
//! | Mode | Peer sees | Fed by |
//! |---|---|---|
//! | `PullSample` | H.264 track | RTSP pull, access units re-packetized |
//! | `PullPassthrough` | H.264 track | RTSP pull, RTP forwarded as is |
//! | `UdpPassthrough` | H.264 track | raw UDP datagrams |
//! | `Publish` | nothing (receive only) | the peer, pushed to RTSP and the shared sink |
//! | `Subscribe` | the shared publish sink | whoever publishes |
//!
//! Everything that can fail (sink setup, RTSP announce, relay bind,
//! negotiation) happens before the session exists. A failed offer leaves
//! nothing behind.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::endpoint::Endpoint;
use crate::error::{BridgeError, NegotiationErrorKind, Result};
use crate::media::{Codec, CodecCapability, MediaKind};
use crate::peer::{
    PeerConnection, PeerEvent, RemoteTrack, RtpSender, SessionDescription, TransceiverDirection,
};
use crate::pipeline::{
    InboundPipeline, KeyframeRequester, OutboundPipeline, PipelineMode, drain_rtcp,
};
use crate::relay::UdpRelay;
use crate::rtsp::{PushClient, StreamingConnector, StreamingSession};
use crate::session::lifecycle::run_event_loop;
use crate::session::{Session, SessionRegistry};
use crate::signaling::{negotiate, validate_offer};
use crate::track::{LocalTrack, SharedPublishSlot, TrackPurpose, TrackWriter};

/// Which way media flows for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    PullSample,
    PullPassthrough,
    UdpPassthrough,
    Publish,
    Subscribe,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PullSample => "pull-sample",
            Self::PullPassthrough => "pull-passthrough",
            Self::UdpPassthrough => "udp-passthrough",
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        };
        f.write_str(s)
    }
}

/// What feeds a session once it is negotiated.
enum Feed {
    Pull(TrackWriter, PipelineMode),
    Relay(UdpRelay),
    Push(Arc<dyn PushClient>),
    /// The shared publish sink is already being written.
    Shared,
}

struct Prepared {
    /// Sink created for this session alone.
    owned: Option<Arc<LocalTrack>>,
    sender: Option<Arc<dyn RtpSender>>,
    feed: Feed,
}

impl Prepared {
    /// Undo a preparation whose offer was not answered.
    async fn abandon(self) {
        if let Some(track) = self.owned {
            track.close();
        }
        if let Feed::Push(push) = self.feed
            && let Err(e) = push.close().await
        {
            tracing::debug!(error = %e, "closing unused push session");
        }
    }
}

/// Accepts offers and runs the resulting sessions.
pub struct Bridge {
    endpoint: Arc<Endpoint>,
    connector: Arc<dyn StreamingConnector>,
    config: Arc<BridgeConfig>,
    registry: SessionRegistry,
    shared: Arc<SharedPublishSlot>,
}

impl Bridge {
    pub fn new(
        endpoint: Arc<Endpoint>,
        connector: Arc<dyn StreamingConnector>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            endpoint,
            connector,
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            shared: Arc::new(SharedPublishSlot::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn shared(&self) -> &Arc<SharedPublishSlot> {
        &self.shared
    }

    /// Answer `offer` and start the session behind it.
    ///
    /// Returns the complete (non-trickle) answer. On error no session is
    /// created and the peer connection is closed.
    pub async fn handle_offer(
        &self,
        mode: BridgeMode,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let subscribed = match mode {
            BridgeMode::Subscribe => Some(
                self.shared
                    .current()
                    .ok_or_else(|| BridgeError::negotiation(NegotiationErrorKind::NoPublisher))?,
            ),
            _ => None,
        };
        let required = match (&subscribed, mode) {
            (Some(track), _) => Some(track.capability().codec.clone()),
            (None, BridgeMode::Publish) => None,
            (None, _) => Some(Codec::H264),
        };
        validate_offer(&offer, required.as_ref())?;

        let pc = self
            .endpoint
            .api()
            .new_peer_connection(self.endpoint.rtc_config())
            .await?;
        let events = match pc.take_events() {
            Some(events) => events,
            None => {
                close_peer(&pc).await;
                return Err(BridgeError::Peer("peer event channel already taken".into()));
            }
        };

        let prepared = match self.prepare(mode, &pc, subscribed).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(%mode, error = %e, "session setup failed");
                close_peer(&pc).await;
                return Err(e);
            }
        };
        let answer = match negotiate(pc.as_ref(), offer).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(%mode, error = %e, "negotiation failed");
                prepared.abandon().await;
                close_peer(&pc).await;
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(Arc::clone(&pc), Arc::clone(&self.shared)));
        tracing::info!(session_id = %session.id, %mode, "session created");
        self.registry.insert(Arc::clone(&session));
        self.start(mode, &session, prepared, events).await;
        Ok(answer)
    }

    /// Attach sinks and open whatever feeds them.
    async fn prepare(
        &self,
        mode: BridgeMode,
        pc: &Arc<dyn PeerConnection>,
        subscribed: Option<Arc<LocalTrack>>,
    ) -> Result<Prepared> {
        match mode {
            BridgeMode::PullSample | BridgeMode::PullPassthrough | BridgeMode::UdpPassthrough => {
                let track = LocalTrack::with_buffer(
                    self.h264_capability(),
                    &self.config.track_id,
                    &self.config.stream_id,
                    TrackPurpose::OutboundToPeer,
                    self.config.subscriber_buffer,
                );
                let writer = track.writer()?;
                let sender = pc.add_track(Arc::clone(&track)).await?;
                let feed = match mode {
                    BridgeMode::PullSample => Feed::Pull(writer, PipelineMode::SampleReconstruct),
                    BridgeMode::PullPassthrough => Feed::Pull(writer, PipelineMode::Passthrough),
                    _ => Feed::Relay(UdpRelay::bind(self.config.relay_addr, writer).await?),
                };
                Ok(Prepared {
                    owned: Some(track),
                    sender: Some(sender),
                    feed,
                })
            }
            BridgeMode::Subscribe => {
                let track = subscribed
                    .ok_or_else(|| BridgeError::negotiation(NegotiationErrorKind::NoPublisher))?;
                let sender = pc.add_track(track).await?;
                Ok(Prepared {
                    owned: None,
                    sender: Some(sender),
                    feed: Feed::Shared,
                })
            }
            BridgeMode::Publish => {
                pc.add_transceiver_from_kind(MediaKind::Video, TransceiverDirection::RecvOnly)
                    .await?;
                let url = &self.config.source_url;
                let push = self.connector.connect_push(url).await?;
                if let Err(e) = push
                    .start_publishing(url, &[self.config.publish_track()])
                    .await
                {
                    if let Err(close) = push.close().await {
                        tracing::debug!(error = %close, "closing rejected push session");
                    }
                    return Err(e);
                }
                Ok(Prepared {
                    owned: None,
                    sender: None,
                    feed: Feed::Push(push),
                })
            }
        }
    }

    /// Spawn every task of a negotiated session.
    async fn start(
        &self,
        mode: BridgeMode,
        session: &Arc<Session>,
        prepared: Prepared,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let Prepared {
            owned,
            sender,
            feed,
        } = prepared;
        if let Some(track) = owned {
            session.set_outbound(track);
        }
        if let Some(sender) = sender {
            tokio::spawn(drain_rtcp(sender, session.cancel_token().child_token()));
        }

        let mut push = None;
        match feed {
            Feed::Pull(writer, pipeline_mode) => {
                let pipeline = InboundPipeline::new(
                    Arc::clone(&self.connector),
                    self.config.source_url.clone(),
                    Codec::H264,
                    pipeline_mode,
                    writer,
                )
                .with_reorder(self.config.reorder.clone())
                .with_stream_handle(Arc::clone(session.stream()))
                .with_cancel(session.cancel_token().child_token());
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    if let Ok(report) = pipeline.run().await {
                        tracing::debug!(session_id = %session_id, exit = %report.exit, "inbound task done");
                    }
                });
            }
            Feed::Relay(relay) => {
                let relay = relay.with_cancel(session.cancel_token().child_token());
                tokio::spawn(relay.run());
            }
            Feed::Push(client) => {
                let streaming: Arc<dyn StreamingSession> = client.clone();
                session.stream().attach(streaming).await;
                push = Some(client);
            }
            Feed::Shared => {}
        }

        let on_track = self.track_handler(session, push);
        tokio::spawn(run_event_loop(
            Arc::clone(session),
            events,
            self.registry.clone(),
            on_track,
        ));
    }

    /// What to do with tracks the remote peer sends.
    ///
    /// Only a publishing session forwards one: its first video track goes to
    /// the push sink and the shared sink, with periodic keyframe requests.
    fn track_handler(
        &self,
        session: &Arc<Session>,
        push: Option<Arc<dyn PushClient>>,
    ) -> impl FnMut(Arc<dyn RemoteTrack>) + Send + 'static {
        let session_id = session.id.clone();
        let peer = Arc::clone(session.peer());
        let cancel = session.cancel_token().clone();
        let shared = Arc::clone(&self.shared);
        let config = Arc::clone(&self.config);
        let mut push = push;

        move |remote: Arc<dyn RemoteTrack>| {
            if remote.kind() != MediaKind::Video {
                tracing::debug!(session_id = %session_id, ssrc = remote.ssrc(), "non-video track ignored");
                return;
            }
            let Some(push) = push.take() else {
                tracing::debug!(session_id = %session_id, ssrc = remote.ssrc(), "remote track ignored");
                return;
            };

            let requester = KeyframeRequester::new(
                Arc::clone(&peer),
                remote.ssrc(),
                config.keyframe_interval,
                cancel.child_token(),
            );
            tokio::spawn(requester.run());

            let pipeline = OutboundPipeline::new(
                &session_id,
                remote,
                push,
                config.publish_codec.payload_type,
                Arc::clone(&shared),
            )
            .with_labels(&config.track_id, &config.stream_id)
            .with_subscriber_buffer(config.subscriber_buffer)
            .with_cancel(cancel.child_token());
            tokio::spawn(pipeline.run());
        }
    }

    fn h264_capability(&self) -> CodecCapability {
        self.endpoint
            .codecs()
            .iter()
            .find(|c| c.capability.codec == Codec::H264)
            .map(|c| c.capability.clone())
            .unwrap_or_else(CodecCapability::h264)
    }

    /// Tear down every live session and close its peer.
    pub async fn shutdown(&self) {
        for session in self.registry.sessions() {
            session.teardown().await;
            close_peer(session.peer()).await;
            self.registry.remove(&session.id);
        }
    }
}

async fn close_peer(pc: &Arc<dyn PeerConnection>) {
    if let Err(e) = pc.close().await {
        tracing::debug!(error = %e, "closing peer connection");
    }
}
