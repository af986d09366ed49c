use std::fmt;

use crate::error::{BridgeError, ParseErrorKind, Result};

/// Client identification sent with every request (RFC 2326 §12.41).
pub const USER_AGENT: &str = "rtsp-webrtc-bridge/0.1";

/// RTSP methods the client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Record,
    Teardown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Announce => "ANNOUNCE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Record => "RECORD",
            Self::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing RTSP request (RFC 2326 §6).
///
/// Serializes to:
///
/// ```text
/// SETUP rtsp://host/stream/trackID=0 RTSP/1.0\r\n
/// CSeq: 3\r\n
/// User-Agent: rtsp-webrtc-bridge/0.1\r\n
/// Transport: RTP/AVP;unicast;client_port=8000-8001\r\n
/// \r\n
/// ```
///
/// Builder style: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then [`serialize`](Self::serialize).
/// `Content-Length` is computed when a body is present.
#[must_use]
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: &str, cseq: u32) -> Self {
        RtspRequest {
            method,
            uri: uri.to_string(),
            headers: vec![
                ("CSeq".to_string(), cseq.to_string()),
                ("User-Agent".to_string(), USER_AGENT.to_string()),
            ],
            body: None,
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: String) -> Self {
        self = self.add_header("Content-Type", content_type);
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);

        for (name, value) in &self.headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
            request.push_str("\r\n");
            request.push_str(body);
        } else {
            request.push_str("\r\n");
        }
        request
    }
}

/// A parsed RTSP response (RFC 2326 §7).
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub reason: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    /// Parse the status line and headers, up to the blank line.
    ///
    /// The body is attached separately once `Content-Length` bytes are read.
    pub fn parse_head(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(BridgeError::parse(ParseErrorKind::EmptyResponse))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status_code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|_| version.starts_with("RTSP/"))
            .ok_or(BridgeError::parse(ParseErrorKind::InvalidStatusLine))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "server sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line
                .find(':')
                .ok_or(BridgeError::parse(ParseErrorKind::InvalidHeader))?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        Ok(RtspResponse {
            status_code,
            reason,
            headers,
            body: String::new(),
        })
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq").and_then(|v| v.parse().ok())
    }

    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Session id and timeout from the `Session` header (RFC 2326 §12.37).
    ///
    /// `"12345678;timeout=60"` yields `("12345678", Some(60))`.
    pub fn session(&self) -> Option<(String, Option<u64>)> {
        let value = self.get_header("Session")?;
        let mut parts = value.split(';');
        let id = parts.next()?.trim();
        if id.is_empty() {
            return None;
        }
        let timeout = parts
            .filter_map(|p| p.trim().strip_prefix("timeout="))
            .find_map(|t| t.parse().ok());
        Some((id.to_string(), timeout))
    }

    /// Turn a non-2xx response into [`BridgeError::Status`].
    pub fn into_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BridgeError::Status {
                code: self.status_code,
                reason: self.reason,
            })
        }
    }
}
