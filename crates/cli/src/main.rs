use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bridge::media::reorder::ReorderConfig;
use bridge::media::{Codec, CodecCapability};
use bridge::pipeline::InboundPipeline;
use bridge::relay::UdpRelay;
use bridge::rtsp::{RtspConnector, RtspUrl};
use bridge::{BridgeConfig, LocalTrack, PipelineMode, TrackPurpose};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-bridge",
    about = "Drive the RTSP side of the media bridge against real sockets"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull H.264 from an RTSP source through the inbound pipeline.
    Probe {
        /// RTSP source URL
        #[arg(long, short)]
        url: Option<String>,
        #[arg(long, value_enum, default_value = "sample")]
        mode: Mode,
        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        seconds: Option<u64>,
        /// Reorder window in packets
        #[arg(long, default_value_t = 64)]
        window: u16,
        /// Longest wait for a missing packet, in milliseconds
        #[arg(long, default_value_t = 150)]
        max_delay_ms: u64,
    },
    /// Relay raw UDP datagrams into a local sink.
    Relay {
        /// Bind address (host:port)
        #[arg(long, short)]
        bind: Option<SocketAddr>,
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Sample,
    Passthrough,
}

impl From<Mode> for PipelineMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sample => PipelineMode::SampleReconstruct,
            Mode::Passthrough => PipelineMode::Passthrough,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::default();

    let outcome = match args.command {
        Command::Probe {
            url,
            mode,
            seconds,
            window,
            max_delay_ms,
        } => {
            let reorder = ReorderConfig {
                window,
                max_delay: Duration::from_millis(max_delay_ms),
            };
            probe(url, mode.into(), reorder, seconds, &config).await
        }
        Command::Relay { bind, seconds } => {
            relay(bind.unwrap_or(config.relay_addr), seconds, &config).await
        }
    };

    if let Err(e) = outcome {
        eprintln!("rtsp-bridge: {e}");
        std::process::exit(1);
    }
}

/// A sink like the one a peer would read, plus a task counting what it gets.
fn counting_sink(config: &BridgeConfig) -> (Arc<LocalTrack>, tokio::task::JoinHandle<(u64, u64)>) {
    let sink = LocalTrack::with_buffer(
        CodecCapability::h264(),
        &config.track_id,
        &config.stream_id,
        TrackPurpose::OutboundToPeer,
        config.subscriber_buffer,
    );
    let rx = sink.subscribe();
    let counter = tokio::spawn(async move {
        let Some(mut rx) = rx else {
            return (0, 0);
        };
        count(&mut rx).await
    });
    (sink, counter)
}

async fn count(rx: &mut mpsc::Receiver<bytes::Bytes>) -> (u64, u64) {
    let (mut packets, mut bytes) = (0u64, 0u64);
    while let Some(packet) = rx.recv().await {
        packets += 1;
        bytes += packet.len() as u64;
    }
    (packets, bytes)
}

/// Cancel `token` on Ctrl-C or after `seconds`.
fn stop_on(token: CancellationToken, seconds: Option<u64>) {
    tokio::spawn(async move {
        match seconds {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        token.cancel();
    });
}

async fn probe(
    url: Option<String>,
    mode: PipelineMode,
    reorder: ReorderConfig,
    seconds: Option<u64>,
    config: &BridgeConfig,
) -> bridge::Result<()> {
    let url = match url {
        Some(url) => RtspUrl::parse(&url)?,
        None => config.source_url.clone(),
    };
    let (sink, counter) = counting_sink(config);
    let cancel = CancellationToken::new();
    stop_on(cancel.clone(), seconds);

    let pipeline = InboundPipeline::new(
        Arc::new(RtspConnector),
        url,
        Codec::H264,
        mode,
        sink.writer()?,
    )
    .with_reorder(reorder)
    .with_cancel(cancel);

    let result = pipeline.run().await;
    sink.close();
    let (packets, bytes) = counter.await.unwrap_or_default();
    let report = result?;

    tracing::info!(
        exit = %report.exit,
        packets_in = report.packets_in,
        written = report.written,
        dropped = report.dropped,
        reordered = report.reorder.reordered,
        lost = report.reorder.lost,
        sink_packets = packets,
        sink_bytes = bytes,
        "probe finished"
    );
    Ok(())
}

async fn relay(bind: SocketAddr, seconds: Option<u64>, config: &BridgeConfig) -> bridge::Result<()> {
    let (sink, counter) = counting_sink(config);
    let cancel = CancellationToken::new();
    stop_on(cancel.clone(), seconds);

    let relay = UdpRelay::bind(bind, sink.writer()?).await?.with_cancel(cancel);
    let report = relay.run().await;
    sink.close();
    let (packets, bytes) = counter.await.unwrap_or_default();

    tracing::info!(
        exit = %report.exit,
        datagrams = report.packets_in,
        written = report.written,
        sink_packets = packets,
        sink_bytes = bytes,
        "relay finished"
    );
    Ok(())
}
