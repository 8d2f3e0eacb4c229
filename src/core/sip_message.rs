//! SIP message and SDP codec (§4.1).
//!
//! Parses and serializes RFC 3261 line-based SIP messages and RFC 4566 SDP
//! bodies. Header names are case-insensitive on lookup but preserved
//! verbatim on serialization; malformed input fails with `ParseError` and
//! never partially populates the output.

use std::fmt;

use crate::{Error, Result};

/// One SIP header line, preserving the original casing of the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// The parsed start line of a SIP message: either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status_code: u16,
        reason_phrase: String,
    },
}

/// A fully parsed SIP message: start line, ordered headers, opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status_code, .. } => Some(*status_code),
            StartLine::Request { .. } => None,
        }
    }

    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All headers matching `name`, in document order. Used for the `Via`
    /// stack, which may repeat.
    pub fn headers_named<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Parses the `CSeq` header into `(sequence_number, method)`.
    pub fn cseq(&self) -> Result<(u32, String)> {
        let raw = self
            .header("CSeq")
            .ok_or_else(|| Error::parse("missing CSeq header"))?;
        let mut parts = raw.trim().splitn(2, char::is_whitespace);
        let number = parts
            .next()
            .ok_or_else(|| Error::parse("malformed CSeq"))?
            .parse::<u32>()
            .map_err(|_| Error::parse("malformed CSeq number"))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::parse("malformed CSeq method"))?
            .trim()
            .to_string();
        Ok((number, method))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Parses a `From`/`To`/`Contact`-style URI header into its parts.
    pub fn from_uri(&self) -> Result<SipUri> {
        let raw = self
            .header("From")
            .ok_or_else(|| Error::parse("missing From header"))?;
        SipUri::parse(raw)
    }

    pub fn to_uri(&self) -> Result<SipUri> {
        let raw = self
            .header("To")
            .ok_or_else(|| Error::parse("missing To header"))?;
        SipUri::parse(raw)
    }
}

/// A parsed `From`/`To`/`Contact` value: `"Display Name" <sip:user@host:port;params>;tag=...`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SipUri {
    pub display_name: Option<String>,
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, String)>,
    pub tag: Option<String>,
}

impl SipUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();

        let (header_part, uri_part) = if let Some(start) = raw.find('<') {
            let end = raw
                .find('>')
                .ok_or_else(|| Error::parse("unterminated URI angle bracket"))?;
            (raw[..start].trim(), &raw[start + 1..end])
        } else {
            // No angle brackets: the whole thing up to the first `;` is the
            // URI, remaining `;key=value` pairs are header-level params.
            match raw.find(';') {
                Some(idx) => ("", &raw[..idx]),
                None => ("", raw),
            }
        };

        let display_name = if header_part.is_empty() {
            None
        } else {
            Some(header_part.trim_matches('"').trim().to_string())
        };

        // Header params (outside the URI, e.g. `;tag=abc`) follow the closing `>`.
        let trailer = if let Some(end) = raw.find('>') {
            &raw[end + 1..]
        } else if let Some(idx) = raw.find(';') {
            &raw[idx..]
        } else {
            ""
        };

        let sip_uri = uri_part
            .strip_prefix("sip:")
            .or_else(|| uri_part.strip_prefix("sips:"))
            .ok_or_else(|| Error::parse("URI missing sip: scheme"))?;

        let (userhost, uri_params_raw) = match sip_uri.find(';') {
            Some(idx) => (&sip_uri[..idx], &sip_uri[idx..]),
            None => (sip_uri, ""),
        };

        let (user, hostport) = match userhost.find('@') {
            Some(idx) => (userhost[..idx].to_string(), &userhost[idx + 1..]),
            None => (String::new(), userhost),
        };

        let (host, port) = match hostport.find(':') {
            Some(idx) => {
                let port = hostport[idx + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::parse("invalid port in URI"))?;
                (hostport[..idx].to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };

        if host.is_empty() {
            return Err(Error::parse("URI missing host"));
        }

        let mut params = parse_params(uri_params_raw);
        params.extend(parse_params(trailer));

        let tag = params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("tag"))
            .map(|(_, v)| v.clone());

        Ok(SipUri {
            display_name,
            user,
            host,
            port,
            params,
            tag,
        })
    }

    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.user, self.host)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dn) = &self.display_name {
            write!(f, "\"{}\" ", dn)?;
        }
        write!(f, "<sip:{}@{}", self.user, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, ">")?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

fn parse_params(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (kv.trim().to_string(), String::new()),
        })
        .collect()
}

/// Parses a complete textual SIP message. Never returns a partially
/// populated message: either the whole thing parses or `ParseError`.
pub fn parse_message(bytes: &[u8]) -> Result<SipMessage> {
    let text = std::str::from_utf8(bytes).map_err(|_| Error::parse("message is not valid UTF-8"))?;

    // RFC 3261 uses CRLF, but be lenient and accept bare LF too.
    let normalized = text.replace("\r\n", "\n");
    let mut sections = normalized.splitn(2, "\n\n");
    let header_block = sections.next().unwrap_or_default();
    let body = sections.next().unwrap_or("").as_bytes().to_vec();

    let mut lines = header_block.lines();
    let start = lines
        .next()
        .ok_or_else(|| Error::parse("empty SIP message"))?;
    let start_line = parse_start_line(start)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse("malformed header line"))?;
        headers.push(Header {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    Ok(SipMessage {
        start_line,
        headers,
        body,
    })
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() != 3 {
        return Err(Error::parse("malformed start line"));
    }

    if parts[0].starts_with("SIP/") {
        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| Error::parse("malformed status code"))?;
        Ok(StartLine::Response {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts[2].to_string(),
        })
    } else {
        Ok(StartLine::Request {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
        })
    }
}

/// Serializes a message back to wire bytes. Headers are emitted in the
/// order given; a `Content-Length` matching `body` is appended if absent.
pub fn build_message(start_line: StartLine, mut headers: Vec<Header>, body: Vec<u8>) -> Vec<u8> {
    if !headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("Content-Length"))
    {
        headers.push(Header {
            name: "Content-Length".to_string(),
            value: body.len().to_string(),
        });
    }

    let mut out = String::new();
    match start_line {
        StartLine::Request {
            method,
            uri,
            version,
        } => out.push_str(&format!("{} {} {}\r\n", method, uri, version)),
        StartLine::Response {
            version,
            status_code,
            reason_phrase,
        } => out.push_str(&format!("{} {} {}\r\n", version, status_code, reason_phrase)),
    }

    for header in &headers {
        out.push_str(&format!("{}: {}\r\n", header.name, header.value));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&body);
    bytes
}

/// Default audio codec list in preferred order, per §4.1.
pub fn default_codec_list(dtmf_payload_type: u8) -> Vec<(u8, &'static str, u32)> {
    vec![
        (0, "PCMU", 8000),
        (8, "PCMA", 8000),
        (9, "G722", 8000),
        (18, "G729", 8000),
        (2, "G726-32", 8000),
        (dtmf_payload_type, "telephone-event", 8000),
    ]
}

/// A parsed SDP session, limited to the audio-media fields the PBX cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub session_id: String,
    pub connection_ip: String,
    pub audio_port: u16,
    /// `(payload_type, encoding_name, clock_rate)` in the offered order.
    pub codecs: Vec<(u8, String, u32)>,
    pub dtmf_payload_type: Option<u8>,
}

/// Builds an audio SDP body offering `codecs` on `local_port`, with the
/// telephone-event payload type always present per §4.7.
pub fn build_audio_sdp(
    local_ip: &str,
    local_port: u16,
    codecs: &[(u8, &str, u32)],
    dtmf_payload_type: u8,
    session_id: &str,
) -> Vec<u8> {
    let pt_list: Vec<String> = codecs.iter().map(|(pt, _, _)| pt.to_string()).collect();

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- {} {} IN IP4 {}\r\n", session_id, session_id, local_ip));
    sdp.push_str("s=redfire-pbx\r\n");
    sdp.push_str(&format!("c=IN IP4 {}\r\n", local_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!(
        "m=audio {} RTP/AVP {}\r\n",
        local_port,
        pt_list.join(" ")
    ));

    for (pt, name, rate) in codecs {
        sdp.push_str(&format!("a=rtpmap:{} {}/{}\r\n", pt, name, rate));
        if *pt == dtmf_payload_type {
            sdp.push_str(&format!("a=fmtp:{} 0-16\r\n", pt));
        }
    }
    sdp.push_str("a=sendrecv\r\n");

    sdp.into_bytes()
}

/// Parses an SDP body into the fields the relay/codec-negotiation logic needs.
pub fn parse_sdp(bytes: &[u8]) -> Result<SdpSession> {
    let text = std::str::from_utf8(bytes).map_err(|_| Error::parse("SDP is not valid UTF-8"))?;

    let mut session_id = String::new();
    let mut connection_ip = String::new();
    let mut audio_port = None;
    let mut offered_pts: Vec<u8> = Vec::new();
    let mut rtpmaps: std::collections::HashMap<u8, (String, u32)> = std::collections::HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("o=") {
            if let Some(id) = rest.split_whitespace().nth(1) {
                session_id = id.to_string();
            }
        } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            connection_ip = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            let mut parts = rest.split_whitespace();
            let port = parts
                .next()
                .ok_or_else(|| Error::parse("malformed m=audio line"))?
                .parse::<u16>()
                .map_err(|_| Error::parse("malformed audio port"))?;
            audio_port = Some(port);
            // Skip "RTP/AVP", collect remaining payload types.
            for pt_str in parts.skip(1) {
                if let Ok(pt) = pt_str.parse::<u8>() {
                    offered_pts.push(pt);
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some((pt_str, desc)) = rest.split_once(' ') {
                if let Ok(pt) = pt_str.parse::<u8>() {
                    let mut desc_parts = desc.splitn(2, '/');
                    let name = desc_parts.next().unwrap_or_default().to_string();
                    let rate = desc_parts
                        .next()
                        .and_then(|r| r.split('/').next())
                        .and_then(|r| r.parse::<u32>().ok())
                        .unwrap_or(8000);
                    rtpmaps.insert(pt, (name, rate));
                }
            }
        }
    }

    let audio_port = audio_port.ok_or_else(|| Error::parse("SDP missing m=audio line"))?;
    if connection_ip.is_empty() {
        return Err(Error::parse("SDP missing c=IN IP4 line"));
    }

    let mut codecs = Vec::new();
    let mut dtmf_payload_type = None;
    for pt in offered_pts {
        let (name, rate) = rtpmaps
            .get(&pt)
            .cloned()
            .unwrap_or_else(|| (static_payload_name(pt).to_string(), 8000));
        if name.eq_ignore_ascii_case("telephone-event") {
            dtmf_payload_type = Some(pt);
        }
        codecs.push((pt, name, rate));
    }

    Ok(SdpSession {
        session_id,
        connection_ip,
        audio_port,
        codecs,
        dtmf_payload_type,
    })
}

fn static_payload_name(pt: u8) -> &'static str {
    match pt {
        0 => "PCMU",
        8 => "PCMA",
        9 => "G722",
        18 => "G729",
        2 => "G726-32",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> Vec<u8> {
        b"INVITE sip:1002@pbx.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.11:5060;branch=z9hG4bK776asdhds\r\n\
From: \"Alice\" <sip:1001@pbx.local>;tag=1928301774\r\n\
To: <sip:1002@pbx.local>\r\n\
Call-ID: a84b4c76e66710@10.0.0.11\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\r\n"
            .to_vec()
    }

    #[test]
    fn test_parse_request_start_line() {
        let msg = parse_message(&sample_invite()).unwrap();
        assert_eq!(msg.method(), Some("INVITE"));
        assert!(msg.is_request());
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let msg = parse_message(&sample_invite()).unwrap();
        assert_eq!(msg.header("call-id"), Some("a84b4c76e66710@10.0.0.11"));
        assert_eq!(msg.header("CALL-ID"), Some("a84b4c76e66710@10.0.0.11"));
    }

    #[test]
    fn test_cseq_parses() {
        let msg = parse_message(&sample_invite()).unwrap();
        let (num, method) = msg.cseq().unwrap();
        assert_eq!(num, 1);
        assert_eq!(method, "INVITE");
    }

    #[test]
    fn test_from_uri_with_tag() {
        let msg = parse_message(&sample_invite()).unwrap();
        let from = msg.from_uri().unwrap();
        assert_eq!(from.user, "1001");
        assert_eq!(from.host, "pbx.local");
        assert_eq!(from.tag.as_deref(), Some("1928301774"));
        assert_eq!(from.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_malformed_message_never_partial() {
        let result = parse_message(b"not a sip message at all");
        assert!(result.is_err());
    }

    #[test]
    fn test_build_message_roundtrip_preserves_headers() {
        let msg = parse_message(&sample_invite()).unwrap();
        let rebuilt = build_message(msg.start_line.clone(), msg.headers.clone(), msg.body.clone());
        let reparsed = parse_message(&rebuilt).unwrap();
        assert_eq!(reparsed.start_line, msg.start_line);
        assert_eq!(reparsed.headers, msg.headers);
    }

    #[test]
    fn test_build_and_parse_audio_sdp_roundtrip() {
        let codecs = default_codec_list(101);
        let sdp = build_audio_sdp("10.0.0.1", 16000, &codecs, 101, "12345");
        let parsed = parse_sdp(&sdp).unwrap();
        assert_eq!(parsed.connection_ip, "10.0.0.1");
        assert_eq!(parsed.audio_port, 16000);
        assert_eq!(parsed.dtmf_payload_type, Some(101));
        assert_eq!(parsed.codecs.len(), codecs.len());
    }

    #[test]
    fn test_filtered_codec_list_excludes_absent_payload_types() {
        // Only PCMU + telephone-event offered: fmtp/rtpmap must not leak an
        // entry for a payload type absent from m=audio.
        let codecs = [(0u8, "PCMU", 8000u32), (101, "telephone-event", 8000)];
        let sdp = build_audio_sdp("10.0.0.1", 16000, &codecs, 101, "1");
        let text = String::from_utf8(sdp).unwrap();
        assert!(!text.contains("rtpmap:9 ")); // G722 never offered
        assert!(text.contains("rtpmap:101 telephone-event/8000"));
    }

    #[test]
    fn test_sip_uri_without_angle_brackets() {
        let uri = SipUri::parse("sip:1002@pbx.local").unwrap();
        assert_eq!(uri.user, "1002");
        assert_eq!(uri.host, "pbx.local");
        assert!(uri.tag.is_none());
    }
}
