//! Non-trickle offer/answer exchange.
//!
//! The answer is returned only after candidate gathering has finished, so
//! it already carries every candidate and exactly one message travels in
//! each direction.

use crate::error::{BridgeError, NegotiationErrorKind, Result};
use crate::media::Codec;
use crate::peer::{PeerConnection, SdpType, SessionDescription};

/// Check that `offer` is a usable offer, optionally one that accepts `codec`.
pub fn validate_offer(offer: &SessionDescription, codec: Option<&Codec>) -> Result<()> {
    if offer.sdp_type != SdpType::Offer {
        return Err(BridgeError::negotiation(
            NegotiationErrorKind::UnexpectedType(offer.sdp_type.to_string()),
        ));
    }

    let mut lines = offer.sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        return Err(BridgeError::negotiation(
            NegotiationErrorKind::MalformedOffer,
        ));
    }
    if !offer.sdp.lines().any(|l| l.starts_with("m=")) {
        return Err(BridgeError::negotiation(
            NegotiationErrorKind::MalformedOffer,
        ));
    }

    if let Some(codec) = codec
        && !offered_codecs(&offer.sdp).any(|c| &c == codec)
    {
        return Err(BridgeError::negotiation(
            NegotiationErrorKind::CodecMismatch(codec.to_string()),
        ));
    }
    Ok(())
}

/// Codecs listed in `a=rtpmap` lines.
fn offered_codecs(sdp: &str) -> impl Iterator<Item = Codec> + '_ {
    sdp.lines()
        .filter_map(|l| l.trim().strip_prefix("a=rtpmap:"))
        .filter_map(|rest| rest.split_whitespace().nth(1))
        .filter_map(|enc| enc.split('/').next())
        .map(Codec::from_encoding_name)
}

/// Apply `offer`, answer it and wait for candidate gathering.
///
/// Tracks and transceivers must already be attached to `pc`.
pub async fn negotiate(
    pc: &dyn PeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer().await?;

    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| BridgeError::Peer("no local description after gathering".into()))?;
    tracing::debug!(sdp_len = local.sdp.len(), "answer ready");
    Ok(local)
}
