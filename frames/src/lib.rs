//! Shared frame model and STOMP codec for the realtime chat transport.
//!
//! This crate owns the wire representation used by the inquiry chat client:
//! STOMP 1.2 frames carried as websocket text messages, plus the [`chat`]
//! message bodies those frames transport.
//!
//! DECODING
//! ========
//! A single websocket message may carry several frames, a partial frame, or a
//! bare EOL heart-beat. [`FrameDecoder`] buffers input and yields complete
//! frames in arrival order; a malformed frame is reported as an error item and
//! skipped so later frames on the same connection still decode.

pub mod chat;

/// Largest frame the decoder will hold, headers and body included.
///
/// Anything longer is reported and skipped up to the next NULL octet.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error returned while decoding STOMP frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The first line of the frame is not a STOMP command.
    #[error("unknown frame command: {0}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contains an undefined `\` escape sequence.
    #[error("invalid header escape in: {0}")]
    InvalidEscape(String),
    /// The `content-length` header is not a non-negative integer.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// The frame body is not UTF-8 text.
    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,
    /// The frame does not end with a NULL octet where one is required.
    #[error("frame is not NULL-terminated")]
    Unterminated,
    /// The frame has no blank line separating headers from body.
    #[error("frame has no header terminator")]
    MissingHeaderTerminator,
}

/// STOMP 1.2 frame commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Result<Self, CodecError> {
        match raw {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "CONNECTED" => Ok(Self::Connected),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "ACK" => Ok(Self::Ack),
            "NACK" => Ok(Self::Nack),
            "BEGIN" => Ok(Self::Begin),
            "COMMIT" => Ok(Self::Commit),
            "ABORT" => Ok(Self::Abort),
            "DISCONNECT" => Ok(Self::Disconnect),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(CodecError::UnknownCommand(other.to_owned())),
        }
    }

    /// CONNECT and CONNECTED frames carry raw header values (STOMP 1.2 §2.2.1).
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins on lookup.
    pub headers: Vec<(String, String)>,
    /// Text body (empty for most client frames).
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header value. Per STOMP, the first occurrence is authoritative.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Build the client handshake frame.
    #[must_use]
    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2,1.1,1.0")
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.header_value())
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    /// Build a `SEND` frame carrying a JSON body.
    #[must_use]
    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }
}

/// Heart-beat intervals in milliseconds, as advertised in the `heart-beat` header.
///
/// `outgoing_ms` is how often the advertiser can send, `incoming_ms` how often
/// it wants to receive. Zero disables that direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    #[must_use]
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self { outgoing_ms, incoming_ms }
    }

    /// Parse a `cx,cy` header value.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (outgoing, incoming) = raw.split_once(',')?;
        Some(Self {
            outgoing_ms: outgoing.trim().parse().ok()?,
            incoming_ms: incoming.trim().parse().ok()?,
        })
    }

    #[must_use]
    pub fn header_value(self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Resolve the effective intervals for our side given the peer's advertisement.
    ///
    /// The result's `outgoing_ms` is how often we must send, `incoming_ms` how
    /// often we should expect traffic from the peer.
    #[must_use]
    pub fn negotiate(self, peer: Self) -> Self {
        let pick = |ours: u64, theirs: u64| if ours == 0 || theirs == 0 { 0 } else { ours.max(theirs) };
        Self {
            outgoing_ms: pick(self.outgoing_ms, peer.incoming_ms),
            incoming_ms: pick(self.incoming_ms, peer.outgoing_ms),
        }
    }
}

/// Wire text of a heart-beat.
pub const HEARTBEAT: &str = "\n";

/// Encode a frame into its wire text, including the trailing NULL.
///
/// A `content-length` header is added for non-empty bodies unless the frame
/// already carries one.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(64 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
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
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode exactly one frame from wire text.
///
/// Leading heart-beat EOLs are ignored.
///
/// # Errors
///
/// Returns the first [`CodecError`] encountered, or
/// [`CodecError::Unterminated`] when the text does not hold a complete frame.
pub fn decode_frame(raw: &str) -> Result<Frame, CodecError> {
    let mut decoder = FrameDecoder::default();
    for item in decoder.push(raw.as_bytes()) {
        if let Decoded::Frame(frame) = item? {
            return Ok(frame);
        }
    }
    Err(CodecError::Unterminated)
}

/// One item produced by [`FrameDecoder::push`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A bare EOL between frames.
    HeartBeat,
    Frame(Frame),
}

/// Incremental STOMP decoder that buffers partial frames across pushes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    // Dropping input until the next NULL after a rejected frame.
    resync: bool,
}

impl FrameDecoder {
    /// Feed raw bytes and return every item that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Decoded, CodecError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(item) = self.next_item() {
            out.push(item);
        }
        out
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn next_item(&mut self) -> Option<Result<Decoded, CodecError>> {
        if self.resync {
            let Some(nul) = self.buf.iter().position(|b| *b == 0) else {
                self.buf.clear();
                return None;
            };
            self.buf.drain(..=nul);
            self.resync = false;
        }
        if self.buf.first() == Some(&b'\n') {
            self.buf.drain(..1);
            return Some(Ok(Decoded::HeartBeat));
        }
        if self.buf.starts_with(b"\r\n") {
            self.buf.drain(..2);
            return Some(Ok(Decoded::HeartBeat));
        }
        if self.buf.is_empty() {
            return None;
        }

        let Some((head_end, body_start)) = find_header_end(&self.buf) else {
            // A NULL before the blank line means the frame can never complete.
            let Some(nul) = self.buf.iter().position(|b| *b == 0) else {
                return self.discard_oversized();
            };
            self.buf.drain(..=nul);
            return Some(Err(CodecError::MissingHeaderTerminator));
        };

        let head = parse_head(&self.buf[..head_end]);
        let content_length = match &head {
            Ok((_, headers)) => match content_length(headers) {
                Ok(length) => length,
                Err(err) => {
                    self.skip_frame();
                    return Some(Err(err));
                }
            },
            Err(_) => None,
        };

        let body_end = if let Some(length) = content_length {
            let Some(end) = body_start.checked_add(length).filter(|end| *end <= MAX_FRAME_BYTES) else {
                self.skip_frame();
                return Some(Err(CodecError::InvalidContentLength(length.to_string())));
            };
            if self.buf.len() <= end {
                return None;
            }
            if self.buf[end] != 0 {
                self.buf.drain(..end);
                self.skip_frame();
                return Some(Err(CodecError::Unterminated));
            }
            end
        } else {
            match self.buf[body_start..].iter().position(|b| *b == 0) {
                Some(offset) => body_start + offset,
                None => return self.discard_oversized(),
            }
        };

        let body = String::from_utf8(self.buf[body_start..body_end].to_vec());
        self.buf.drain(..=body_end);

        let (command, headers) = match head {
            Ok(head) => head,
            Err(err) => return Some(Err(err)),
        };
        let Ok(body) = body else {
            return Some(Err(CodecError::InvalidUtf8));
        };
        Some(Ok(Decoded::Frame(Frame { command, headers, body })))
    }

    /// Give up on a frame that has outgrown [`MAX_FRAME_BYTES`] without completing.
    fn discard_oversized(&mut self) -> Option<Result<Decoded, CodecError>> {
        if self.buf.len() <= MAX_FRAME_BYTES {
            return None;
        }
        self.skip_frame();
        Some(Err(CodecError::Unterminated))
    }

    /// Drop the current frame through its NULL, or everything until one arrives.
    fn skip_frame(&mut self) {
        match self.buf.iter().position(|b| *b == 0) {
            Some(nul) => {
                self.buf.drain(..=nul);
            }
            None => {
                self.buf.clear();
                self.resync = true;
            }
        }
    }
}

/// Locate the blank line ending the header block.
///
/// Returns `(head_end, body_start)` byte offsets.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = buf[line_start..].iter().position(|b| *b == b'\n') {
        let newline = line_start + offset;
        let line = &buf[line_start..newline];
        if line_start > 0 && (line.is_empty() || line == b"\r") {
            return Some((line_start, newline + 1));
        }
        if line.contains(&0) {
            return None;
        }
        line_start = newline + 1;
    }
    None
}

type Head = (Command, Vec<(String, String)>);

fn parse_head(raw: &[u8]) -> Result<Head, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
    let mut lines = text.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(CodecError::MalformedHeader(line.to_owned()));
        };
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }
    Ok((command, headers))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, CodecError> {
    let Some((_, raw)) = headers.iter().find(|(name, _)| name == "content-length") else {
        return Ok(None);
    };
    raw.trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| CodecError::InvalidContentLength(raw.clone()))
}

/// Escape a header name or value per STOMP 1.2.
#[must_use]
pub fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_header`].
///
/// # Errors
///
/// Returns [`CodecError::InvalidEscape`] for undefined escape sequences.
pub fn unescape_header(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
