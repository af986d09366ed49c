pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod media;
pub mod peer;
pub mod pipeline;
pub mod relay;
pub mod rtsp;
pub mod session;
pub mod signaling;
pub mod track;

pub use bridge::{Bridge, BridgeMode};
pub use config::BridgeConfig;
pub use endpoint::{Endpoint, UdpMux};
pub use error::{BridgeError, Result};
pub use media::Packetizer;
pub use pipeline::{ExitReason, PipelineMode, PipelineReport};
pub use session::{Session, SessionRegistry};
pub use track::{LocalTrack, SharedPublishSlot, TrackPurpose, TrackWriter};
