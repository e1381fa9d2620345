//! Minimal SDP handling for the offer/answer exchange.
//!
//! Only what the answer needs is parsed: the media sections with their
//! formats, mid, direction and codec attributes, plus the bundle group. The
//! media plane itself lives outside this service.

use rand::Rng;
use rand::distr::Alphanumeric;
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("session description is empty")]
    Empty,
    #[error("session description must start with v=0")]
    MissingVersion,
    #[error("malformed line {line}: '{content}'")]
    MalformedLine { line: usize, content: String },
    #[error("malformed media line: '{0}'")]
    MalformedMedia(String),
    #[error("session description has no media sections")]
    NoMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn parse(attribute: &str) -> Option<Self> {
        match attribute {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// The direction an answerer declares for an offered direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: String,
    pub port: String,
    pub protocol: String,
    pub formats: Vec<String>,
    pub mid: Option<String>,
    pub direction: Option<Direction>,
    pub rtcp_mux: bool,
    /// `rtpmap`, `fmtp` and `sctp-port` attributes, echoed in the answer.
    pub codec_attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub bundle: Option<String>,
    pub media: Vec<MediaSection>,
}

/// Parses a remote offer. Any line that is not `<letter>=<value>` rejects the
/// whole description.
pub fn parse_offer(sdp: &str) -> Result<SessionDescription, SdpError> {
    let mut lines = sdp
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .peekable();

    match lines.peek() {
        None => return Err(SdpError::Empty),
        Some((_, "v=0")) => {}
        Some(_) => return Err(SdpError::MissingVersion),
    }

    let mut bundle = None;
    let mut media: Vec<MediaSection> = Vec::new();

    for (index, line) in lines {
        let (key, value) = split_line(line).ok_or_else(|| SdpError::MalformedLine {
            line: index + 1,
            content: line.to_string(),
        })?;

        match key {
            'm' => media.push(parse_media_line(value)?),
            'a' => {
                let (name, rest) = value.split_once(':').unwrap_or((value, ""));
                match media.last_mut() {
                    None => {
                        if name == "group" && rest.starts_with("BUNDLE") {
                            bundle = Some(rest.to_string());
                        }
                    }
                    Some(section) => match name {
                        "mid" => section.mid = Some(rest.to_string()),
                        "rtcp-mux" => section.rtcp_mux = true,
                        "rtpmap" | "fmtp" | "sctp-port" => {
                            section.codec_attributes.push(value.to_string())
                        }
                        other => {
                            if let Some(direction) = Direction::parse(other) {
                                section.direction = Some(direction);
                            }
                        }
                    },
                }
            }
            _ => {}
        }
    }

    if media.is_empty() {
        return Err(SdpError::NoMedia);
    }
    Ok(SessionDescription { bundle, media })
}

fn split_line(line: &str) -> Option<(char, &str)> {
    let mut chars = line.chars();
    let key = chars.next().filter(char::is_ascii_alphabetic)?;
    let value = chars.as_str().strip_prefix('=')?;
    Some((key, value))
}

fn parse_media_line(value: &str) -> Result<MediaSection, SdpError> {
    let mut parts = value.split_whitespace();
    let (Some(kind), Some(port), Some(protocol)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(SdpError::MalformedMedia(value.to_string()));
    };
    Ok(MediaSection {
        kind: kind.to_string(),
        port: port.to_string(),
        protocol: protocol.to_string(),
        formats: parts.map(str::to_string).collect(),
        mid: None,
        direction: None,
        rtcp_mux: false,
        codec_attributes: Vec::new(),
    })
}

/// The DTLS identity this service advertises in its answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaIdentity {
    fingerprint: String,
}

impl MediaIdentity {
    /// A fresh identity for this process.
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::rng().random();
        let fingerprint = bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Self { fingerprint }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Builds the local answer for a parsed offer.
pub fn build_answer(offer: &SessionDescription, identity: &MediaIdentity) -> String {
    let ufrag = random_token(8);
    let pwd = random_token(24);
    let session_version: u64 = rand::rng().random_range(1..=u32::MAX as u64);

    let mut sdp = String::new();
    // Writing to a String cannot fail.
    let _ = write!(
        sdp,
        "v=0\r\no=- {session_version} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n"
    );
    if let Some(bundle) = &offer.bundle {
        let _ = write!(sdp, "a=group:{bundle}\r\n");
    }

    for section in &offer.media {
        let _ = write!(
            sdp,
            "m={} {} {}",
            section.kind, section.port, section.protocol
        );
        for format in &section.formats {
            let _ = write!(sdp, " {format}");
        }
        sdp.push_str("\r\nc=IN IP4 0.0.0.0\r\n");
        let _ = write!(sdp, "a=ice-ufrag:{ufrag}\r\na=ice-pwd:{pwd}\r\n");
        sdp.push_str("a=ice-options:trickle\r\n");
        let _ = write!(sdp, "a=fingerprint:sha-256 {}\r\n", identity.fingerprint());
        sdp.push_str("a=setup:active\r\n");
        if let Some(mid) = &section.mid {
            let _ = write!(sdp, "a=mid:{mid}\r\n");
        }
        if let Some(direction) = section.direction {
            let _ = write!(sdp, "a={}\r\n", direction.reversed().as_str());
        }
        if section.rtcp_mux {
            sdp.push_str("a=rtcp-mux\r\n");
        }
        for attribute in &section.codec_attributes {
            let _ = write!(sdp, "a={attribute}\r\n");
        }
    }
    sdp
}
