/// RTP/RTCP transport parameters of one track (RFC 2326 §12.39).
///
/// The client sends its port pair in SETUP; the server echoes it and adds
/// its own.
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
///
/// Publishing clients append `;mode=record`. Interleaved TCP and multicast
/// are not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Client's RTP port.
    pub client_rtp_port: u16,
    /// Client's RTCP port (typically `client_rtp_port + 1`).
    pub client_rtcp_port: u16,
    /// Server's `(RTP, RTCP)` ports, when the server reported them.
    pub server_ports: Option<(u16, u16)>,
    pub record: bool,
}

impl TransportHeader {
    pub fn new(client_rtp_port: u16, client_rtcp_port: u16, record: bool) -> Self {
        Self {
            client_rtp_port,
            client_rtcp_port,
            server_ports: None,
            record,
        }
    }

    /// Header value for a SETUP request.
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            "RTP/AVP;unicast;client_port={}-{}",
            self.client_rtp_port, self.client_rtcp_port
        );
        if self.record {
            value.push_str(";mode=record");
        }
        value
    }

    /// Parse the `Transport` header value of a SETUP response.
    ///
    /// Looks for `client_port=RTP-RTCP` and `server_port=RTP-RTCP` among
    /// semicolon-separated parameters; `client_port` is required.
    ///
    /// ## Examples
    ///
    /// ```
    /// use bridge::rtsp::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001;server_port=9000-9001").unwrap();
    /// assert_eq!(th.client_rtp_port, 8000);
    /// assert_eq!(th.server_ports, Some((9000, 9001)));
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let mut client = None;
        let mut server = None;
        let mut record = false;

        for part in header.split(';') {
            let part = part.trim();
            if let Some(ports) = part.strip_prefix("client_port=") {
                client = parse_port_pair(ports);
            } else if let Some(ports) = part.strip_prefix("server_port=") {
                server = parse_port_pair(ports);
            } else if part.eq_ignore_ascii_case("mode=record") || part == "mode=\"RECORD\"" {
                record = true;
            }
        }

        let (client_rtp_port, client_rtcp_port) = client?;
        Some(TransportHeader {
            client_rtp_port,
            client_rtcp_port,
            server_ports: server,
            record,
        })
    }
}

/// `8000-8001` → `(8000, 8001)`; a single port implies `port + 1`.
fn parse_port_pair(ports: &str) -> Option<(u16, u16)> {
    match ports.split_once('-') {
        Some((rtp, rtcp)) => Some((rtp.parse().ok()?, rtcp.parse().ok()?)),
        None => {
            let rtp: u16 = ports.parse().ok()?;
            Some((rtp, rtp.checked_add(1)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.client_rtp_port, 5000);
        assert_eq!(th.client_rtcp_port, 5001);
        assert_eq!(th.server_ports, None);
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    }

    #[test]
    fn record_mode_round_trip() {
        let th = TransportHeader::new(6000, 6001, true);
        let value = th.to_header_value();
        assert_eq!(value, "RTP/AVP;unicast;client_port=6000-6001;mode=record");
        assert_eq!(TransportHeader::parse(&value), Some(th));
    }

    #[test]
    fn single_server_port() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001;server_port=7000")
            .unwrap();
        assert_eq!(th.server_ports, Some((7000, 7001)));
    }
}
