//! Process-wide peer endpoint.
//!
//! Every peer session shares one UDP port for ICE/DTLS/SRTP. The port is
//! bound once at startup together with the peer API built on top of it,
//! and the resulting [`Endpoint`] is handed to every session by reference.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{BridgeError, Result};
use crate::media::{CodecParameters, default_codecs};
use crate::peer::{PeerApi, RtcConfiguration};

/// The shared, multiplexed UDP listening port.
#[derive(Debug)]
pub struct UdpMux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpMux {
    /// Bind the shared port. Failure here is fatal for the process.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        tracing::info!(%local_addr, "peer transport listening");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Socket for the peer engine to demultiplex on.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

/// Everything sessions share: the mux, the peer API and its codec table.
pub struct Endpoint {
    mux: Arc<UdpMux>,
    api: Arc<dyn PeerApi>,
    codecs: Vec<CodecParameters>,
    rtc_config: RtcConfiguration,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("mux", &self.mux.local_addr())
            .field("codecs", &self.codecs.len())
            .field("rtc_config", &self.rtc_config)
            .finish()
    }
}

impl Endpoint {
    /// Bind the shared port and build the peer API on it.
    ///
    /// `build_api` receives the mux and the default codec table so the
    /// engine can register both before any session exists.
    pub async fn bind<F>(addr: SocketAddr, ice_servers: Vec<String>, build_api: F) -> Result<Self>
    where
        F: FnOnce(Arc<UdpMux>, &[CodecParameters]) -> Result<Arc<dyn PeerApi>>,
    {
        let mux = Arc::new(UdpMux::bind(addr).await?);
        let codecs = default_codecs();
        let api = build_api(Arc::clone(&mux), &codecs)?;
        Ok(Self {
            mux,
            api,
            codecs,
            rtc_config: RtcConfiguration { ice_servers },
        })
    }

    pub fn mux(&self) -> &Arc<UdpMux> {
        &self.mux
    }

    pub fn api(&self) -> &Arc<dyn PeerApi> {
        &self.api
    }

    pub fn codecs(&self) -> &[CodecParameters] {
        &self.codecs
    }

    /// Configuration each new peer connection is created with.
    pub fn rtc_config(&self) -> RtcConfiguration {
        self.rtc_config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_bind_on_same_port_is_a_bind_error() {
        let first = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = UdpMux::bind(first.local_addr()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Bind { addr, .. } if addr == first.local_addr()));
    }
}
