use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Header block too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Invalid string encoding")]
    InvalidString,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub const CRLF: &str = "\r\n";

/// Header names carried by every frame. Stored lower-cased.
pub const PATH_HEADER: &str = "path";
pub const REQUEST_ID_HEADER: &str = "x-requestid";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Well-known message paths
pub mod paths {
    // Client → Service
    pub const SPEECH_CONFIG: &str = "speech.config";
    pub const SPEECH_CONTEXT: &str = "speech.context";
    pub const AUDIO: &str = "audio";
    pub const TELEMETRY: &str = "telemetry";

    // Service → Client
    pub const TURN_START: &str = "turn.start";
    pub const TURN_END: &str = "turn.end";
    pub const SPEECH_START_DETECTED: &str = "speech.startdetected";
    pub const SPEECH_END_DETECTED: &str = "speech.enddetected";
    pub const SPEECH_HYPOTHESIS: &str = "speech.hypothesis";
    pub const SPEECH_FRAGMENT: &str = "speech.fragment";
    pub const SPEECH_PHRASE: &str = "speech.phrase";
    pub const TRANSLATION_HYPOTHESIS: &str = "translation.hypothesis";
    pub const TRANSLATION_PHRASE: &str = "translation.phrase";
    pub const TRANSLATION_SYNTHESIS_END: &str = "translation.synthesis.end";
}

/// Ordered header map with case-insensitive names.
///
/// Names are lower-cased on insert and values are trimmed, so a decoded
/// frame compares equal to the frame that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header
    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a CRLF separated header block.
    ///
    /// Each line is split on the first `:`. A line without a value yields an
    /// empty string rather than an error; blank lines are skipped.
    pub fn parse_block(block: &str) -> Self {
        let mut headers = Headers::new();
        for line in block.split(CRLF) {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => headers.insert(name, value),
                None => headers.insert(line, ""),
            }
        }
        headers
    }
}

/// Whether a frame travels as a text or a binary transport message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Raw transport payload, before framing is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl RawMessage {
    /// Size of the payload in bytes
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Text(text) => text.len(),
            RawMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One protocol message exchanged with the service.
///
/// `path` and `request_id` travel as the `Path` and `X-RequestId` headers;
/// every other header lives in [`Headers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    path: String,
    request_id: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Frame {
    /// Create a text frame
    pub fn text(path: &str, request_id: &str, body: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            path: path.to_string(),
            request_id: request_id.to_string(),
            headers: Headers::new(),
            body: body.into().into_bytes(),
        }
    }

    /// Create a binary frame
    pub fn binary(path: &str, request_id: &str, body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Binary,
            path: path.to_string(),
            request_id: request_id.to_string(),
            headers: Headers::new(),
            body,
        }
    }

    /// Add a header, routing `Path` and `X-RequestId` to their own fields
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if name.trim().eq_ignore_ascii_case(PATH_HEADER) {
            self.path = value.trim().to_string();
        } else if name.trim().eq_ignore_ascii_case(REQUEST_ID_HEADER) {
            self.request_id = value.trim().to_string();
        } else {
            self.headers.insert(name, value);
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path compared case-insensitively against the constants in [`paths`]
    pub fn is_path(&self, path: &str) -> bool {
        self.path.eq_ignore_ascii_case(path)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn set_request_id(&mut self, request_id: &str) {
        self.request_id = request_id.to_string();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body interpreted as UTF-8 text
    pub fn body_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.body).map_err(|_| ProtocolError::InvalidString)
    }

    /// Body deserialized from JSON
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Serialize the frame to a transport payload
    pub fn encode(&self) -> Result<RawMessage, ProtocolError> {
        match self.kind {
            FrameKind::Text => self.encode_text().map(RawMessage::Text),
            FrameKind::Binary => self.encode_binary().map(RawMessage::Binary),
        }
    }

    /// Deserialize a frame from a transport payload
    pub fn decode(raw: &RawMessage) -> Result<Self, ProtocolError> {
        match raw {
            RawMessage::Text(text) => Self::decode_text(text),
            RawMessage::Binary(data) => Self::decode_binary(data),
        }
    }

    /// Text wire format: header lines, an empty line, then the UTF-8 body
    pub fn encode_text(&self) -> Result<String, ProtocolError> {
        let body = self.body_text()?;
        let header_block = self.header_block()?;
        Ok(format!("{header_block}{CRLF}{CRLF}{body}"))
    }

    /// Binary wire format: [header length: u16 BE][header bytes][body bytes]
    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        let header_block = self.header_block()?;
        let header_bytes = header_block.as_bytes();

        if header_bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::HeaderTooLarge(header_bytes.len()));
        }

        let mut bytes = Vec::with_capacity(2 + header_bytes.len() + self.body.len());
        bytes.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
        bytes.extend_from_slice(header_bytes);
        bytes.extend_from_slice(&self.body);

        Ok(bytes)
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        let separator = format!("{CRLF}{CRLF}");
        let (header_block, body) = text.split_once(separator.as_str()).ok_or_else(|| {
            ProtocolError::MalformedFrame("text frame has no header/body separator".to_string())
        })?;

        Self::from_parts(
            FrameKind::Text,
            Headers::parse_block(header_block),
            body.as_bytes().to_vec(),
        )
    }

    pub fn decode_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::MalformedFrame(format!(
                "binary frame of {} bytes has no length prefix",
                data.len()
            )));
        }

        let header_length = u16::from_be_bytes([data[0], data[1]]) as usize;
        if header_length + 2 > data.len() {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared header length {} exceeds payload of {} bytes",
                header_length,
                data.len()
            )));
        }

        let header_block = std::str::from_utf8(&data[2..2 + header_length])
            .map_err(|_| ProtocolError::InvalidString)?;
        let body = data[2 + header_length..].to_vec();

        Self::from_parts(FrameKind::Binary, Headers::parse_block(header_block), body)
    }

    fn from_parts(
        kind: FrameKind,
        mut headers: Headers,
        body: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        let path = headers
            .remove(PATH_HEADER)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ProtocolError::MalformedFrame("missing Path header".to_string()))?;
        let request_id = headers.remove(REQUEST_ID_HEADER).unwrap_or_default();

        Ok(Self {
            kind,
            path,
            request_id,
            headers,
            body,
        })
    }

    fn header_block(&self) -> Result<String, ProtocolError> {
        if self.path.is_empty() {
            return Err(ProtocolError::MalformedFrame("frame has no path".to_string()));
        }

        let mut lines = vec![format!("Path: {}", self.path)];
        if !self.request_id.is_empty() {
            lines.push(format!("X-RequestId: {}", self.request_id));
        }
        lines.extend(self.headers.iter().map(|(n, v)| format!("{n}: {v}")));

        Ok(lines.join(CRLF))
    }
}
