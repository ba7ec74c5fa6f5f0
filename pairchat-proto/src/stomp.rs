//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages:
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! A frame consisting only of end-of-line characters is a heart-beat.
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) on every frame except
//! `CONNECT` and `CONNECTED`, as the 1.2 grammar requires.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The bytes a peer sends as a heart-beat.
pub const HEARTBEAT: &str = "\n";

/// Error type for frame encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The first line is not a known STOMP command.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// A header line has no `:` separator.
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),

    /// A header contains an escape sequence STOMP does not define.
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),

    /// The blank line separating headers from the body is missing.
    #[error("frame has no header terminator")]
    MissingHeaderTerminator,

    /// The body is not terminated by a NUL octet.
    #[error("frame body is not NUL-terminated")]
    MissingNul,

    /// `content-length` is not a number or exceeds the available bytes.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    /// The heart-beat header is not two comma-separated integers.
    #[error("invalid heart-beat header {0:?}")]
    InvalidHeartBeat(String),
}

/// STOMP frame commands used by this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client opens a session.
    Connect,
    /// Alias of `CONNECT` accepted from 1.2 clients.
    Stomp,
    /// Server accepts a session.
    Connected,
    /// Client publishes to a destination.
    Send,
    /// Client subscribes to a destination.
    Subscribe,
    /// Client cancels a subscription.
    Unsubscribe,
    /// Server delivers a message to a subscription.
    Message,
    /// Server confirms a frame carrying a `receipt` header.
    Receipt,
    /// Server reports an error; the connection is closed afterwards.
    Error,
    /// Client ends the session.
    Disconnect,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Whether header values are escaped on this command.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins.
    pub headers: Vec<(String, String)>,
    /// Frame body (UTF-8 text; this protocol only carries JSON).
    pub body: String,
}

impl Frame {
    /// An empty frame with the given command.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header called `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the wire representation, adding `content-length` when
    /// the body is non-empty and the header is not already present.
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from a WebSocket text message.
    ///
    /// Returns `Ok(None)` for a heart-beat (a message made only of EOLs).
    /// Leading EOLs before a frame are skipped, as are EOLs after the NUL.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first grammar violation.
    pub fn decode(text: &str) -> Result<Option<Self>, FrameError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let (first, mut remaining) = split_line(text).ok_or(FrameError::MissingHeaderTerminator)?;
        let command: Command = first.parse()?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, rest) =
                split_line(remaining).ok_or(FrameError::MissingHeaderTerminator)?;
            remaining = rest;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = remaining.as_bytes();
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let body_len = match content_length {
            Some(len) => {
                if rest.len() <= len || rest[len] != 0 {
                    return Err(FrameError::InvalidContentLength(len.to_string()));
                }
                len
            }
            None => rest
                .iter()
                .position(|b| *b == 0)
                .ok_or(FrameError::MissingNul)?,
        };

        // Anything after the NUL is ignored: one frame per WebSocket message.
        let body = String::from_utf8_lossy(&rest[..body_len]).into_owned();
        Ok(Some(Self {
            command,
            headers,
            body,
        }))
    }
}

/// Split off one line (without its `\n` or `\r\n`), returning it and the rest.
fn split_line(text: &str) -> Option<(&str, &str)> {
    let newline = text.find('\n')?;
    let line = &text[..newline];
    Some((line.strip_suffix('\r').unwrap_or(line), &text[newline + 1..]))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

/// The `heart-beat` header: how often a peer can send, and how often it
/// wants to receive, in milliseconds. `0` means "not at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Smallest interval at which this peer can send heart-beats.
    pub send_ms: u64,
    /// Desired interval between heart-beats received by this peer.
    pub receive_ms: u64,
}

impl HeartBeat {
    /// Both directions at the same interval.
    #[must_use]
    pub fn symmetric(interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            send_ms: ms,
            receive_ms: ms,
        }
    }

    /// Header value: `"<send>,<receive>"`.
    #[must_use]
    pub fn to_header(self) -> String {
        format!("{},{}", self.send_ms, self.receive_ms)
    }

    /// Parse a `heart-beat` header value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidHeartBeat`] if the value is not two
    /// comma-separated non-negative integers.
    pub fn parse(value: &str) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidHeartBeat(value.to_string());
        let (send, receive) = value.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            send_ms: send.trim().parse().map_err(|_| invalid())?,
            receive_ms: receive.trim().parse().map_err(|_| invalid())?,
        })
    }

    /// Intervals agreed between `self` (the local peer) and `remote`.
    ///
    /// Local sends happen every `max(self.send, remote.receive)` unless
    /// either side is `0`; the same rule applies to what the local side
    /// should expect to receive.
    #[must_use]
    pub fn negotiate(self, remote: Self) -> NegotiatedHeartBeat {
        let pick = |a: u64, b: u64| {
            (a != 0 && b != 0).then(|| Duration::from_millis(a.max(b)))
        };
        NegotiatedHeartBeat {
            outgoing: pick(self.send_ms, remote.receive_ms),
            incoming: pick(self.receive_ms, remote.send_ms),
        }
    }
}

/// Result of heart-beat negotiation from the local peer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    /// Interval at which the local peer must send heart-beats.
    pub outgoing: Option<Duration>,
    /// Interval at which the remote peer promised to send heart-beats.
    pub incoming: Option<Duration>,
}
