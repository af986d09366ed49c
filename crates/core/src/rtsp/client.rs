//! RTSP/1.0 client with UDP media transport.
//!
//! One TCP connection carries the request/response exchange; requests are
//! serialized so responses always match the request that is waiting. Each
//! set-up track owns an even/odd UDP port pair (RFC 3550 §11). While
//! playing, one task per track reads RTP datagrams and forwards them on a
//! channel. A keep-alive task refreshes the session at half its timeout.
//!
//! All background tasks stop on the client's cancellation token, which
//! [`close`](StreamingSession::close) triggers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::message::{Method, RtspRequest, RtspResponse};
use super::transport::TransportHeader;
use super::{
    InboundPacket, PullClient, PushClient, RtspUrl, StreamingConnector, StreamingSession,
    TrackDescription, sdp,
};
use crate::error::{BridgeError, ParseErrorKind, Result};
use crate::media::rtp::RtpPacket;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Session timeout assumed when the server does not state one (RFC 2326 §12.37).
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;
const PACKET_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 1600;
const PORT_ATTEMPTS: usize = 32;
/// Upper bounds on what one response may occupy.
const MAX_HEAD_BYTES: u64 = 64 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct MediaChannel {
    rtp: Arc<UdpSocket>,
    /// Held so the RTCP port of the pair stays reserved.
    _rtcp: UdpSocket,
    /// Server RTP address, known for tracks set up for recording.
    destination: Option<SocketAddr>,
}

struct Inner {
    url: RtspUrl,
    peer_ip: IpAddr,
    local_ip: IpAddr,
    conn: tokio::sync::Mutex<Connection>,
    cseq: AtomicU32,
    session: Mutex<Option<String>>,
    session_timeout: AtomicU64,
    media: Mutex<Vec<MediaChannel>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// RTSP client for one presentation.
///
/// Cheap to clone; clones share the connection and session.
#[derive(Clone)]
pub struct RtspClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RtspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspClient")
            .field("url", &self.inner.url)
            .field("session", &*self.inner.session.lock())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RtspClient {
    /// Open the signaling connection to `url`'s host.
    pub async fn connect(url: &RtspUrl) -> Result<Self> {
        let stream = tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect(url.authority()))
            .await
            .map_err(|_| BridgeError::Connect(format!("{url}: connect timed out")))?
            .map_err(|e| BridgeError::Connect(format!("{url}: {e}")))?;
        let peer_addr = stream.peer_addr()?;
        let local_ip = stream.local_addr()?.ip();
        let (reader, writer) = stream.into_split();

        tracing::info!(%url, %peer_addr, "RTSP connected");

        Ok(Self {
            inner: Arc::new(Inner {
                url: url.clone(),
                peer_ip: peer_addr.ip(),
                local_ip,
                conn: tokio::sync::Mutex::new(Connection {
                    reader: BufReader::new(reader),
                    writer,
                }),
                cseq: AtomicU32::new(1),
                session: Mutex::new(None),
                session_timeout: AtomicU64::new(DEFAULT_SESSION_TIMEOUT_SECS),
                media: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn url(&self) -> &RtspUrl {
        &self.inner.url
    }

    /// Session id assigned by the server during SETUP.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().clone()
    }

    /// OPTIONS: the methods the server advertises in `Public`.
    pub async fn options(&self) -> Result<Vec<String>> {
        let response = self
            .send(self.build(Method::Options, &self.inner.url.to_string()))
            .await?;
        Ok(response
            .get_header("Public")
            .map(|p| p.split(',').map(|m| m.trim().to_string()).collect())
            .unwrap_or_default())
    }

    fn build(&self, method: Method, uri: &str) -> RtspRequest {
        let cseq = self.inner.cseq.fetch_add(1, Ordering::SeqCst);
        let request = RtspRequest::new(method, uri, cseq);
        match self.inner.session.lock().as_deref() {
            Some(session) => request.add_header("Session", session),
            None => request,
        }
    }

    /// Send one request and wait for its response. Non-2xx is an error.
    async fn send(&self, request: RtspRequest) -> Result<RtspResponse> {
        let method = request.method;
        tracing::debug!(%method, uri = %request.uri, "request");

        let exchange = async {
            let mut conn = self.inner.conn.lock().await;
            conn.writer
                .write_all(request.serialize().as_bytes())
                .await?;

            let mut head = String::new();
            let mut budget = MAX_HEAD_BYTES;
            loop {
                let mut line = String::new();
                let n = (&mut conn.reader).take(budget).read_line(&mut line).await?;
                budget -= n as u64;
                if !line.ends_with('\n') {
                    if budget == 0 {
                        return Err(BridgeError::parse(ParseErrorKind::HeadTooLarge));
                    }
                    return Err(BridgeError::Connect("connection closed by server".into()));
                }
                if head.is_empty() && line.trim().is_empty() {
                    continue;
                }
                head.push_str(&line);
                if line == "\r\n" || line == "\n" {
                    break;
                }
            }

            let mut response = RtspResponse::parse_head(&head)?;
            let len = response.content_length();
            if len > MAX_BODY_BYTES {
                return Err(BridgeError::parse(ParseErrorKind::BodyTooLarge(len)));
            }
            if len > 0 {
                let mut body = vec![0u8; len];
                conn.reader.read_exact(&mut body).await?;
                response.body = String::from_utf8_lossy(&body).into_owned();
            }
            Ok::<_, BridgeError>(response)
        };

        let response = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| BridgeError::Connect(format!("{method} timed out")))??;

        tracing::debug!(%method, status = response.status_code, "response");
        response.into_success()
    }

    /// SETUP one track on a fresh UDP port pair.
    async fn setup_track(&self, uri: &str, record: bool) -> Result<MediaChannel> {
        let (rtp, rtcp) = self.bind_port_pair().await?;
        let rtp_port = rtp.local_addr()?.port();
        let transport = TransportHeader::new(rtp_port, rtp_port + 1, record);

        let response = self
            .send(
                self.build(Method::Setup, uri)
                    .add_header("Transport", &transport.to_header_value()),
            )
            .await?;

        let reply = response
            .get_header("Transport")
            .ok_or(BridgeError::parse(ParseErrorKind::MissingHeader("Transport")))?;
        let reply = TransportHeader::parse(reply)
            .ok_or(BridgeError::parse(ParseErrorKind::InvalidTransport))?;

        if let Some((id, timeout)) = response.session() {
            let mut session = self.inner.session.lock();
            if session.is_none() {
                tracing::debug!(session_id = %id, ?timeout, "RTSP session established");
                *session = Some(id);
            }
            if let Some(timeout) = timeout {
                self.inner.session_timeout.store(timeout, Ordering::SeqCst);
            }
        }

        let destination = reply
            .server_ports
            .map(|(server_rtp, _)| SocketAddr::new(self.inner.peer_ip, server_rtp));
        tracing::debug!(uri, rtp_port, ?destination, record, "track set up");

        Ok(MediaChannel {
            rtp: Arc::new(rtp),
            _rtcp: rtcp,
            destination,
        })
    }

    /// Bind an even RTP port and the odd RTCP port above it.
    async fn bind_port_pair(&self) -> Result<(UdpSocket, UdpSocket)> {
        let unspecified = match self.inner.local_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let mut last_error = None;
        for _ in 0..PORT_ATTEMPTS {
            let rtp_port = rand::random_range(5_000..30_000u16) * 2;
            let rtp = match UdpSocket::bind(SocketAddr::new(unspecified, rtp_port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match UdpSocket::bind(SocketAddr::new(unspecified, rtp_port + 1)).await {
                Ok(rtcp) => return Ok((rtp, rtcp)),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(BridgeError::Io)
            .unwrap_or_else(|| BridgeError::Connect("no free UDP port pair".into())))
    }

    fn spawn_reader(&self, track: usize, socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) {
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let len = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, _)) => len,
                        Err(e) => {
                            tracing::warn!(track, error = %e, "RTP socket read failed");
                            break;
                        }
                    },
                };
                match RtpPacket::parse(&buf[..len]) {
                    Ok(packet) => {
                        if tx.send(InboundPacket { track, packet }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(track, error = %e, "non-RTP datagram dropped"),
                }
            }
            tracing::debug!(track, "RTP reader stopped");
        });
    }

    fn spawn_keepalive(&self) {
        let client = self.clone();
        let timeout = client.inner.session_timeout.load(Ordering::SeqCst);
        let period = Duration::from_secs((timeout / 2).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = client.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let request = client.build(Method::Options, &client.inner.url.to_string());
                        if let Err(e) = client.send(request).await {
                            tracing::warn!(error = %e, "RTSP keep-alive failed");
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl StreamingSession for RtspClient {
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let result = if self.session_id().is_some() {
            let request = self.build(Method::Teardown, &self.inner.url.to_string());
            self.send(request).await.map(|_| ())
        } else {
            Ok(())
        };
        self.inner.media.lock().clear();

        if let Err(e) = &result {
            tracing::debug!(error = %e, "TEARDOWN failed");
        }
        tracing::info!(url = %self.inner.url, "RTSP session closed");
        result
    }
}

#[async_trait]
impl PullClient for RtspClient {
    async fn describe(&self, url: &RtspUrl) -> Result<(Vec<TrackDescription>, RtspUrl)> {
        let response = self
            .send(
                self.build(Method::Describe, &url.to_string())
                    .add_header("Accept", "application/sdp"),
            )
            .await?;
        let tracks = sdp::parse_tracks(&response.body)?;

        let base = response
            .get_header("Content-Base")
            .or_else(|| response.get_header("Content-Location"))
            .and_then(|b| RtspUrl::parse(b).ok())
            .unwrap_or_else(|| url.clone());

        tracing::info!(%url, tracks = tracks.len(), %base, "described");
        Ok((tracks, base))
    }

    async fn setup_and_play(
        &self,
        tracks: &[TrackDescription],
        base: &RtspUrl,
    ) -> Result<mpsc::Receiver<InboundPacket>> {
        let mut sockets = Vec::with_capacity(tracks.len());
        for track in tracks {
            let channel = self.setup_track(&base.join(&track.control), false).await?;
            sockets.push(Arc::clone(&channel.rtp));
            self.inner.media.lock().push(channel);
        }

        self.send(
            self.build(Method::Play, &base.to_string())
                .add_header("Range", "npt=0.000-"),
        )
        .await?;
        tracing::info!(url = %base, tracks = tracks.len(), "playing");

        let (tx, rx) = mpsc::channel(PACKET_QUEUE);
        for (track, socket) in sockets.into_iter().enumerate() {
            self.spawn_reader(track, socket, tx.clone());
        }
        self.spawn_keepalive();
        Ok(rx)
    }
}

#[async_trait]
impl PushClient for RtspClient {
    async fn start_publishing(&self, url: &RtspUrl, tracks: &[TrackDescription]) -> Result<()> {
        let body = sdp::generate_announce(tracks, &self.inner.local_ip.to_string(), "Stream");
        self.send(
            self.build(Method::Announce, &url.to_string())
                .with_body("application/sdp", body),
        )
        .await?;

        for index in 0..tracks.len() {
            let channel = self
                .setup_track(&url.join(&format!("trackID={index}")), true)
                .await?;
            if channel.destination.is_none() {
                return Err(BridgeError::parse(ParseErrorKind::InvalidTransport));
            }
            self.inner.media.lock().push(channel);
        }

        self.send(self.build(Method::Record, &url.to_string()))
            .await?;
        tracing::info!(%url, tracks = tracks.len(), "recording");
        self.spawn_keepalive();
        Ok(())
    }

    async fn write_packet(&self, track: usize, packet: &RtpPacket) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::PushRejected("session closed".into()));
        }
        let (socket, destination) = {
            let media = self.inner.media.lock();
            let channel = media
                .get(track)
                .ok_or_else(|| BridgeError::PushRejected(format!("no track {track}")))?;
            let destination = channel
                .destination
                .ok_or_else(|| BridgeError::PushRejected(format!("track {track} not recording")))?;
            (Arc::clone(&channel.rtp), destination)
        };
        socket
            .send_to(&packet.marshal(), destination)
            .await
            .map_err(|e| BridgeError::PushRejected(e.to_string()))?;
        Ok(())
    }
}

/// Opens [`RtspClient`]s, probing each server with OPTIONS first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtspConnector;

impl RtspConnector {
    async fn open(url: &RtspUrl) -> Result<RtspClient> {
        let client = RtspClient::connect(url).await?;
        let public = client.options().await?;
        tracing::debug!(%url, methods = ?public, "server methods");
        Ok(client)
    }
}

#[async_trait]
impl StreamingConnector for RtspConnector {
    async fn connect_pull(&self, url: &RtspUrl) -> Result<Arc<dyn PullClient>> {
        Ok(Arc::new(Self::open(url).await?))
    }

    async fn connect_push(&self, url: &RtspUrl) -> Result<Arc<dyn PushClient>> {
        Ok(Arc::new(Self::open(url).await?))
    }
}
