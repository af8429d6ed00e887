//! Message protocol definitions
//!
//! Newline-delimited JSON envelope shared by the server and the client
//! connection. Every line on the wire is one encoded [`Message`].
//! Decoding is total: malformed input degrades to a `system` message
//! carrying the raw text instead of failing the read loop.

use std::fmt;
use std::io;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Message type tag
///
/// Parsed case-insensitively. Tags outside the known vocabulary are kept
/// verbatim in [`MessageKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Fan-out to every joined session
    Chat,
    /// Alias of `Chat`
    Broadcast,
    /// Delivered to the recipient and echoed to the sender
    Private,
    /// Server-originated informational line
    System,
    /// Body carries a JSON array of usernames
    UserList,
    /// Announces a new participant
    Connect,
    /// Alias of `Connect`
    Join,
    /// Announces a departure
    Disconnect,
    /// Alias of `Disconnect`
    Leave,
    /// Unrecognized tag
    Other(String),
}

impl MessageKind {
    /// Parse a wire tag. Blank tags become `System`.
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim();
        match tag.to_ascii_lowercase().as_str() {
            "" | "system" => Self::System,
            "chat" => Self::Chat,
            "broadcast" => Self::Broadcast,
            "private" => Self::Private,
            "userlist" => Self::UserList,
            "connect" => Self::Connect,
            "join" => Self::Join,
            "disconnect" => Self::Disconnect,
            "leave" => Self::Leave,
            _ => Self::Other(tag.to_string()),
        }
    }

    /// The tag as written on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Broadcast => "broadcast",
            Self::Private => "private",
            Self::System => "system",
            Self::UserList => "userlist",
            Self::Connect => "connect",
            Self::Join => "join",
            Self::Disconnect => "disconnect",
            Self::Leave => "leave",
            Self::Other(tag) => tag,
        }
    }

    /// `connect` or `join`
    pub fn is_join(&self) -> bool {
        matches!(self, Self::Connect | Self::Join)
    }

    /// `disconnect` or `leave`
    pub fn is_leave(&self) -> bool {
        matches!(self, Self::Disconnect | Self::Leave)
    }

    /// `chat` or `broadcast`
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Chat | Self::Broadcast)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Chat protocol envelope
///
/// Immutable once built; constructed by a producer before sending or by
/// [`Message::decode`] on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireMessage")]
pub struct Message {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender username, empty for server-originated messages
    pub from: String,
    /// Recipient username, empty for broadcast
    pub to: String,
    /// Free text, or a nested JSON payload for `userlist`
    pub body: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

/// Lenient inbound shape
///
/// Accepts both the lowercase field names and the capitalized names used by
/// older clients (`Type`, `From`, `To`, `Message`, `Timestamp`).
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default, rename = "type", alias = "Type")]
    kind: Option<String>,
    #[serde(default, alias = "From")]
    from: Option<String>,
    #[serde(default, alias = "To")]
    to: Option<String>,
    #[serde(default, alias = "Message", alias = "message")]
    body: Option<String>,
    #[serde(default, alias = "Timestamp")]
    timestamp: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            kind: MessageKind::parse(wire.kind.as_deref().unwrap_or_default()),
            from: wire.from.unwrap_or_default(),
            to: wire.to.unwrap_or_default(),
            body: wire.body.unwrap_or_default(),
            timestamp: wire
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// RFC 3339 with offset, or a naive ISO-8601 time taken as local time
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map(|local| local.with_timezone(&Utc))
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    /// Broadcast chat line
    pub fn chat(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, from, "", body)
    }

    /// Directed message to `to`
    pub fn private(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Private, from, to, body)
    }

    /// Server-originated informational line
    pub fn system(body: impl Into<String>) -> Self {
        Self::new(MessageKind::System, "", "", body)
    }

    /// Join announcement sent by a client after connecting
    pub fn join(username: impl Into<String>) -> Self {
        Self::new(MessageKind::Connect, username, "", "")
    }

    /// Departure announcement sent by a client before disconnecting
    pub fn leave(username: impl Into<String>) -> Self {
        Self::new(MessageKind::Disconnect, username, "", "")
    }

    /// User list with the names serialized as a JSON array in the body
    pub fn user_list(usernames: &[String]) -> Self {
        let body = serde_json::Value::from(usernames.to_vec()).to_string();
        Self::new(MessageKind::UserList, "", "", body)
    }

    /// Decode the usernames carried by a `userlist` body
    pub fn user_names(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Encode as a single line of JSON (no trailing newline)
    ///
    /// Embedded newlines in any field are escaped by the JSON encoder.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line. Never fails.
    pub fn decode(line: &str) -> Self {
        match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(_) => Self::system(format!("Raw message: {}", line)),
        }
    }

    /// Human-readable transcript line
    pub fn display_text(&self) -> String {
        let time = self.timestamp.with_timezone(&Local).format("%H:%M:%S");
        match &self.kind {
            MessageKind::System => format!("[{}] {}", time, self.body),
            MessageKind::Private => {
                format!("[{}] {} -> {}: {}", time, self.from, self.to, self.body)
            }
            MessageKind::UserList => format!("[{}] User list updated", time),
            MessageKind::Connect | MessageKind::Join => {
                format!("[{}] {} joined the chat", time, self.from)
            }
            MessageKind::Disconnect | MessageKind::Leave => {
                format!("[{}] {} left the chat", time, self.from)
            }
            MessageKind::Other(tag) => {
                format!("[{}] Unknown message type '{}': {}", time, tag, self.body)
            }
            MessageKind::Chat | MessageKind::Broadcast => {
                format!("[{}] {}: {}", time, self.from, self.body)
            }
        }
    }
}

/// Read one newline-terminated line from `reader`
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD rather than
/// failing the read, so a garbled line still reaches [`Message::decode`].
/// The trailing `\n` (and `\r`) is stripped. A final line without a
/// terminator is returned at end of stream; `Ok(None)` means the stream is
/// exhausted.
///
/// Cancel safe as long as `buf` is kept across calls: a partially read
/// line stays in `buf` and is completed by the next call.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    buf.clear();
    Ok(Some(line))
}
