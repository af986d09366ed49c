//! End-to-end bridge scenarios against in-process fakes.
//!
//! Each test builds a [`Bridge`] on a loopback endpoint, feeds it an offer
//! and drives the fake peer and RTSP collaborators from outside.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use bridge::error::NegotiationErrorKind;
use bridge::media::rtp::RtpPacket;
use bridge::media::{Codec, CodecCapability};
use bridge::peer::{ConnectivityState, PeerEvent, SessionDescription, TransceiverDirection};
use bridge::pipeline::{InboundPipeline, InboundState, KeyframeRequester};
use bridge::relay::UdpRelay;
use bridge::rtsp::{RtspUrl, StreamingConnector};
use bridge::{
    Bridge, BridgeConfig, BridgeError, BridgeMode, ExitReason, LocalTrack, PipelineMode,
    TrackPurpose,
};

use common::*;

fn config() -> BridgeConfig {
    BridgeConfig {
        relay_addr: "127.0.0.1:0".parse().unwrap(),
        ..BridgeConfig::default()
    }
}

async fn bridge(api: &Arc<FakePeerApi>, connector: FakeConnector) -> Bridge {
    Bridge::new(
        endpoint(Arc::clone(api)).await,
        Arc::new(connector),
        config(),
    )
}

async fn next_packet(rx: &mut tokio::sync::mpsc::Receiver<Bytes>) -> RtpPacket {
    let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("packet in time")
        .expect("sink open");
    RtpPacket::parse(&raw).unwrap()
}

#[tokio::test]
async fn one_matching_track_streams_after_play() {
    let pull = FakePullClient::new(
        vec![
            track_description(Codec::Opus, 111, "trackID=0"),
            track_description(Codec::H264, 96, "trackID=1"),
        ],
        vec![
            rtp(10, 3000, true, &[0x65, 1]),
            rtp(12, 9000, true, &[0x41, 3]),
            rtp(11, 6000, true, &[0x41, 2]),
        ],
    );
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            pull: Some(Arc::clone(&pull)),
            ..Default::default()
        },
    )
    .await;

    let answer = bridge
        .handle_offer(BridgeMode::PullPassthrough, SessionDescription::offer(H264_OFFER))
        .await
        .unwrap();
    assert!(answer.sdp.contains("a=candidate"), "answer carries candidates");
    assert_eq!(bridge.registry().len(), 1);

    let peer = api.peer(0);
    let mut rx = peer.take_subscription();
    let mut seqs = Vec::new();
    for _ in 0..3 {
        seqs.push(next_packet(&mut rx).await.sequence_number);
    }
    assert_eq!(seqs, vec![10, 11, 12]);

    assert_eq!(pull.calls(), vec!["describe", "setup_and_play"]);
    let set_up = pull.set_up.lock().clone();
    assert_eq!(set_up.len(), 1);
    assert_eq!(set_up[0].codec, Codec::H264);
}

#[tokio::test]
async fn sample_mode_rebuilds_access_units() {
    let pull = FakePullClient::new(
        vec![track_description(Codec::H264, 96, "trackID=0")],
        vec![
            rtp(1, 3000, true, &[0x65, 0xAA, 0xBB]),
            rtp(2, 6000, true, &[0x41, 0xCC]),
        ],
    );
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            pull: Some(pull),
            ..Default::default()
        },
    )
    .await;
    bridge
        .handle_offer(BridgeMode::PullSample, SessionDescription::offer(H264_OFFER))
        .await
        .unwrap();

    let mut rx = api.peer(0).take_subscription();
    let first = next_packet(&mut rx).await;
    let second = next_packet(&mut rx).await;
    assert_eq!(&first.payload[..], &[0x65, 0xAA, 0xBB]);
    assert_eq!(&second.payload[..], &[0x41, 0xCC]);
    assert!(first.marker && second.marker);
    assert_eq!(second.timestamp.wrapping_sub(first.timestamp), 3000);
}

#[tokio::test]
async fn no_matching_track_is_not_found() {
    let pull = FakePullClient::new(
        vec![track_description(Codec::Vp8, 96, "trackID=0")],
        vec![rtp(1, 0, true, &[0x65])],
    );
    let connector: Arc<dyn StreamingConnector> = Arc::new(FakeConnector {
        pull: Some(Arc::clone(&pull)),
        ..Default::default()
    });
    let sink = LocalTrack::new(
        CodecCapability::h264(),
        "video",
        "bridge",
        TrackPurpose::OutboundToPeer,
    );
    let mut rx = sink.subscribe().unwrap();

    let pipeline = InboundPipeline::new(
        connector,
        RtspUrl::parse("rtsp://127.0.0.1:8554/live").unwrap(),
        Codec::H264,
        PipelineMode::SampleReconstruct,
        sink.writer().unwrap(),
    );
    let state = pipeline.state_handle();
    assert_eq!(*state.read(), InboundState::Connecting);
    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(err, BridgeError::TrackNotFound { ref codec } if codec == "H264"));
    assert_eq!(*state.read(), InboundState::Failed);
    assert!(rx.try_recv().is_err(), "nothing written");
    assert_eq!(pull.calls(), vec!["describe", "close"]);
}

#[tokio::test]
async fn source_end_flushes_the_last_access_unit_and_closes() {
    // The last frame never carries a marker.
    let pull = FakePullClient::ending(
        vec![track_description(Codec::H264, 96, "trackID=0")],
        vec![
            rtp(1, 3000, true, &[0x65, 0xAA]),
            rtp(2, 6000, false, &[0x41, 0xBB]),
        ],
    );
    let connector: Arc<dyn StreamingConnector> = Arc::new(FakeConnector {
        pull: Some(Arc::clone(&pull)),
        ..Default::default()
    });
    let sink = LocalTrack::new(
        CodecCapability::h264(),
        "video",
        "bridge",
        TrackPurpose::OutboundToPeer,
    );
    let mut rx = sink.subscribe().unwrap();

    let pipeline = InboundPipeline::new(
        connector,
        RtspUrl::parse("rtsp://127.0.0.1:8554/live").unwrap(),
        Codec::H264,
        PipelineMode::SampleReconstruct,
        sink.writer().unwrap(),
    );
    let state = pipeline.state_handle();
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.exit, ExitReason::SourceEnded);
    assert_eq!(report.packets_in, 2);
    assert_eq!(report.written, 2);
    assert_eq!(*state.read(), InboundState::Closed);
    assert_eq!(pull.closes(), 1);

    let first = next_packet(&mut rx).await;
    let last = next_packet(&mut rx).await;
    assert_eq!(&last.payload[..], &[0x41, 0xBB]);
    assert_eq!(last.timestamp.wrapping_sub(first.timestamp), 3000);
}

#[tokio::test]
async fn missing_track_leaves_session_signaled_but_silent() {
    let pull = FakePullClient::new(vec![track_description(Codec::Vp8, 96, "trackID=0")], vec![]);
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            pull: Some(Arc::clone(&pull)),
            ..Default::default()
        },
    )
    .await;
    bridge
        .handle_offer(BridgeMode::PullSample, SessionDescription::offer(H264_OFFER))
        .await
        .unwrap();

    assert!(eventually(|| pull.closes() == 1).await);
    assert_eq!(bridge.registry().len(), 1);
    let mut rx = api.peer(0).take_subscription();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn terminal_state_closes_the_rtsp_session_once() {
    let pull = FakePullClient::new(
        vec![track_description(Codec::H264, 96, "trackID=0")],
        vec![rtp(1, 0, true, &[0x65])],
    );
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            pull: Some(Arc::clone(&pull)),
            ..Default::default()
        },
    )
    .await;
    bridge
        .handle_offer(BridgeMode::PullPassthrough, SessionDescription::offer(H264_OFFER))
        .await
        .unwrap();
    let peer = api.peer(0);
    let mut rx = peer.take_subscription();
    next_packet(&mut rx).await;

    peer.emit(PeerEvent::ConnectivityChange(ConnectivityState::Connected));
    peer.emit(PeerEvent::ConnectivityChange(ConnectivityState::Failed));
    peer.emit(PeerEvent::ConnectivityChange(ConnectivityState::Disconnected));
    peer.emit(PeerEvent::ConnectivityChange(ConnectivityState::Failed));

    assert!(eventually(|| bridge.registry().is_empty()).await);
    assert!(eventually(|| pull.closes() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pull.closes(), 1);
    assert_eq!(peer.closes(), 1, "failed peer is closed once");

    // The sink towards the peer is closed with the session.
    assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn shutdown_tears_down_every_session() {
    let pull = FakePullClient::new(
        vec![track_description(Codec::H264, 96, "trackID=0")],
        vec![rtp(1, 0, true, &[0x65])],
    );
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            pull: Some(Arc::clone(&pull)),
            ..Default::default()
        },
    )
    .await;
    for _ in 0..2 {
        bridge
            .handle_offer(BridgeMode::PullPassthrough, SessionDescription::offer(H264_OFFER))
            .await
            .unwrap();
    }
    assert_eq!(bridge.registry().len(), 2);
    for i in 0..2 {
        let mut rx = api.peer(i).take_subscription();
        next_packet(&mut rx).await;
    }

    bridge.shutdown().await;

    assert!(bridge.registry().is_empty());
    assert!(eventually(|| pull.closes() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pull.closes(), 2, "each RTSP session closed once");
    assert_eq!(api.peer(0).closes(), 1);
    assert_eq!(api.peer(1).closes(), 1);
}

#[tokio::test]
async fn negotiation_failure_creates_no_session() {
    let pull = FakePullClient::new(vec![track_description(Codec::H264, 96, "trackID=0")], vec![]);
    let api = Arc::new(FakePeerApi::default());
    api.fail_remote_description.store(true, Ordering::SeqCst);
    let connector = FakeConnector {
        pull: Some(Arc::clone(&pull)),
        ..Default::default()
    };
    let bridge = bridge(&api, connector).await;

    let err = bridge
        .handle_offer(BridgeMode::PullSample, SessionDescription::offer(H264_OFFER))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Peer(_)));
    assert!(bridge.registry().is_empty());
    assert_eq!(api.peer(0).closes(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pull.calls().is_empty(), "source never contacted");
}

#[tokio::test]
async fn malformed_offers_are_rejected_up_front() {
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(&api, FakeConnector::default()).await;

    let err = bridge
        .handle_offer(
            BridgeMode::PullSample,
            SessionDescription::offer("not an sdp"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Negotiation {
            kind: NegotiationErrorKind::MalformedOffer
        }
    ));

    let err = bridge
        .handle_offer(BridgeMode::PullSample, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Negotiation {
            kind: NegotiationErrorKind::CodecMismatch(_)
        }
    ));

    let err = bridge
        .handle_offer(BridgeMode::PullSample, SessionDescription::answer(H264_OFFER))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Negotiation {
            kind: NegotiationErrorKind::UnexpectedType(_)
        }
    ));
    assert_eq!(api.created(), 0);
}

#[tokio::test]
async fn subscribe_without_publisher_fails() {
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(&api, FakeConnector::default()).await;
    let err = bridge
        .handle_offer(BridgeMode::Subscribe, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Negotiation {
            kind: NegotiationErrorKind::NoPublisher
        }
    ));
    assert_eq!(api.created(), 0);
}

#[tokio::test]
async fn publisher_fans_out_to_push_and_subscribers() {
    let push = Arc::new(FakePushClient::default());
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            push: Some(Arc::clone(&push)),
            ..Default::default()
        },
    )
    .await;

    bridge
        .handle_offer(BridgeMode::Publish, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap();
    let publisher = api.peer(0);
    assert_eq!(
        publisher.transceivers.lock()[0].1,
        TransceiverDirection::RecvOnly
    );
    assert_eq!(push.announced.lock()[0].codec, Codec::Vp8);

    let (remote, feed) = FakeRemoteTrack::vp8(0xCAFE);
    publisher.emit(PeerEvent::Track(remote));
    let mut packet = rtp(100, 0, true, &[1, 2, 3]);
    packet.payload_type = 120;
    feed.send(packet.marshal()).unwrap();
    assert!(eventually(|| bridge.shared().current().is_some()).await);

    bridge
        .handle_offer(BridgeMode::Subscribe, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap();
    bridge
        .handle_offer(BridgeMode::Subscribe, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap();
    let mut a = api.peer(1).take_subscription();
    let mut b = api.peer(2).take_subscription();

    let sent: Vec<Bytes> = (101..111u16)
        .map(|seq| {
            let mut p = rtp(seq, u32::from(seq) * 3000, true, &[seq as u8; 40]);
            p.payload_type = 120;
            p.marshal()
        })
        .collect();
    for raw in &sent {
        feed.send(raw.clone()).unwrap();
    }
    for raw in &sent {
        let got_a = tokio::time::timeout(Duration::from_secs(2), a.recv()).await.unwrap().unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(2), b.recv()).await.unwrap().unwrap();
        assert_eq!(&got_a, raw);
        assert_eq!(&got_b, raw);
    }

    assert!(eventually(|| push.written().len() == 11).await);
    assert!(push.written().iter().all(|p| p.payload_type == 96));

    // A publisher leaving keeps the shared sink for its subscribers.
    publisher.emit(PeerEvent::ConnectivityChange(ConnectivityState::Closed));
    assert!(eventually(|| push.closes() == 1).await);
    assert!(bridge.shared().current().is_some());
    assert!(bridge.shared().owner().is_none());
}

#[tokio::test]
async fn rejected_announce_creates_no_session() {
    let push = Arc::new(FakePushClient {
        reject_announce: true,
        ..Default::default()
    });
    let api = Arc::new(FakePeerApi::default());
    let bridge = bridge(
        &api,
        FakeConnector {
            push: Some(Arc::clone(&push)),
            ..Default::default()
        },
    )
    .await;
    let err = bridge
        .handle_offer(BridgeMode::Publish, SessionDescription::offer(VP8_OFFER))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Status { code: 403, .. }));
    assert!(bridge.registry().is_empty());
    assert_eq!(push.closes(), 1);
    assert_eq!(api.peer(0).closes(), 1);
}

#[tokio::test]
async fn udp_relay_stops_after_one_failed_write() {
    let sink = LocalTrack::with_buffer(
        CodecCapability::h264(),
        "video",
        "bridge",
        TrackPurpose::OutboundToPeer,
        256,
    );
    let mut rx = sink.subscribe().unwrap();
    let relay = UdpRelay::bind("127.0.0.1:0".parse().unwrap(), sink.writer().unwrap())
        .await
        .unwrap();
    let target = relay.local_addr().unwrap();
    let task = tokio::spawn(relay.run());

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..100u32 {
        sender.send_to(&i.to_be_bytes(), target).await.unwrap();
        if i % 20 == 19 {
            tokio::task::yield_now().await;
        }
    }
    for i in 0..100u32 {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &i.to_be_bytes());
    }

    sink.close();
    for _ in 0..5 {
        let _ = sender.send_to(b"late", target).await;
    }
    let report = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.exit, ExitReason::SinkClosed);
    assert_eq!(report.written, 100);
    assert_eq!(report.packets_in, 101);
}

#[tokio::test(start_paused = true)]
async fn keyframe_requests_stop_on_cancel() {
    let peer = Arc::new(FakePeer::new(false));
    let cancel = CancellationToken::new();
    let requester = KeyframeRequester::new(
        peer.clone(),
        0xCAFE,
        Duration::from_secs(2),
        cancel.clone(),
    );
    let task = tokio::spawn(requester.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    assert_eq!(task.await.unwrap(), 2);

    let rtcp = peer.rtcp.lock().clone();
    assert_eq!(rtcp.len(), 2);
    assert!(rtcp.iter().all(|p| p.media_ssrc() == 0xCAFE));
}
