//! SDP handling for RTSP presentations (RFC 4566 / RFC 8866).
//!
//! DESCRIBE responses are parsed into [`TrackDescription`]s; ANNOUNCE
//! bodies are generated from them. A generated description looks like:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> <sess-ver> IN IP4 <addr>       ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-webrtc-bridge                     ← software (§6)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 VP8/90000                         ← codec/clock rate
//! a=control:trackID=0                           ← track control URL
//! ```

use crate::error::{BridgeError, ParseErrorKind, Result};
use crate::media::{Codec, MediaKind};

use super::TrackDescription;

/// Clock rate and codec of static payload types (RFC 3551 §6).
fn static_payload(pt: u8) -> Option<(Codec, u32)> {
    match pt {
        0 => Some((Codec::Other("PCMU".into()), 8000)),
        8 => Some((Codec::Other("PCMA".into()), 8000)),
        26 => Some((Codec::Other("JPEG".into()), 90_000)),
        _ => None,
    }
}

/// Parse every audio/video media section of a session description.
///
/// Sections of other media types (`application`, ...) are skipped.
pub fn parse_tracks(sdp: &str) -> Result<Vec<TrackDescription>> {
    let mut tracks = Vec::new();
    let mut current: Option<TrackDescription> = None;
    let mut in_ignored_section = false;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            tracks.extend(current.take());
            let mut fields = media.split_whitespace();
            let kind = fields.next().and_then(MediaKind::from_sdp);
            let payload_type = fields
                .nth(2)
                .and_then(|pt| pt.parse::<u8>().ok())
                .ok_or(BridgeError::parse(ParseErrorKind::InvalidSdp))?;

            in_ignored_section = kind.is_none();
            current = kind.map(|kind| {
                let (codec, clock_rate) = static_payload(payload_type)
                    .unwrap_or((Codec::Other(format!("PT{payload_type}")), 90_000));
                TrackDescription {
                    kind,
                    payload_type,
                    codec,
                    clock_rate,
                    channels: 0,
                    fmtp: None,
                    control: String::new(),
                }
            });
            continue;
        }

        if in_ignored_section {
            continue;
        }
        let Some(track) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let (pt, encoding) = rest
                .split_once(' ')
                .ok_or(BridgeError::parse(ParseErrorKind::InvalidSdp))?;
            if pt.parse::<u8>().ok() != Some(track.payload_type) {
                continue;
            }
            let mut enc = encoding.trim().split('/');
            track.codec = Codec::from_encoding_name(enc.next().unwrap_or_default());
            track.clock_rate = enc
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or(BridgeError::parse(ParseErrorKind::InvalidSdp))?;
            track.channels = enc.next().and_then(|c| c.parse().ok()).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            if let Some((pt, params)) = rest.split_once(' ')
                && pt.parse::<u8>().ok() == Some(track.payload_type)
            {
                track.fmtp = Some(params.trim().to_string());
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            track.control = control.trim().to_string();
        }
    }
    tracks.extend(current);

    tracing::debug!(tracks = tracks.len(), "SDP parsed");
    Ok(tracks)
}

/// Generate the ANNOUNCE body for `tracks`.
///
/// Each track gets `a=control:trackID=<index>`, which is also the control
/// the client uses in its SETUP requests.
pub fn generate_announce(tracks: &[TrackDescription], ip: &str, session_name: &str) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN IP4 {}", ip));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-webrtc-bridge".to_string());

    for (i, track) in tracks.iter().enumerate() {
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            track.kind.as_str(),
            track.payload_type
        ));
        let mut rtpmap = format!(
            "a=rtpmap:{} {}/{}",
            track.payload_type,
            track.codec.encoding_name(),
            track.clock_rate
        );
        if track.channels > 0 {
            rtpmap.push_str(&format!("/{}", track.channels));
        }
        sdp.push(rtpmap);
        if let Some(fmtp) = track.fmtp.as_deref().filter(|f| !f.is_empty()) {
            sdp.push(format!("a=fmtp:{} {}", track.payload_type, fmtp));
        }
        sdp.push(format!("a=control:trackID={}", i));
    }

    tracing::debug!("ANNOUNCE SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
