//! Chat message bodies carried inside STOMP `SEND` and `MESSAGE` frames.
//!
//! DESIGN
//! ======
//! Messages are flat JSON records discriminated by `type`. Decoding is strict
//! about shape (unknown `type` values, missing ids and empty TALK text are
//! rejected) and lenient about representation (ids may arrive as numeric
//! strings, `sentAt` as a string or a date-time component array, nullable
//! text fields as `null`). Presence or absence of `chatMessageId` is the only
//! pending/confirmed signal; there is no separate status field.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Error returned by [`decode_chat_message`] and [`ChatMessage::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The body is not a JSON object of the expected shape.
    #[error("invalid chat message JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// An identifier field is zero or negative.
    #[error("invalid {field}: {value}")]
    InvalidId { field: &'static str, value: i64 },
    /// A TALK message carries no text.
    #[error("TALK message has empty text")]
    EmptyTalk,
    /// A history entry has no `chatMessageId`.
    #[error("history message has no chatMessageId")]
    Unconfirmed,
}

/// Kind of chat event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// A participant joined the room.
    Enter,
    /// User-authored content.
    Talk,
    /// A participant left the room.
    Leave,
}

impl MessageType {
    /// ENTER and LEAVE are presence events rendered system-style.
    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, Self::Enter | Self::Leave)
    }
}

/// One unit of chat communication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(deserialize_with = "deserialize_id")]
    pub chat_room_id: i64,
    #[serde(deserialize_with = "deserialize_id")]
    pub sender_id: i64,
    /// Display name captured at send time.
    #[serde(default, deserialize_with = "deserialize_nullable_string")]
    pub sender_nickname: String,
    /// Text content. Empty for client-originated ENTER/LEAVE.
    #[serde(default, deserialize_with = "deserialize_nullable_string")]
    pub message: String,
    /// Client clock for optimistic sends, server clock once echoed.
    #[serde(default, deserialize_with = "deserialize_sent_at", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    /// Server-assigned id; absent while the message only exists locally.
    #[serde(default, deserialize_with = "deserialize_optional_id", skip_serializing_if = "Option::is_none")]
    pub chat_message_id: Option<i64>,
}

impl ChatMessage {
    /// Presence event announcing `sender_id` joined `chat_room_id`.
    #[must_use]
    pub fn enter(chat_room_id: i64, sender_id: i64, sender_nickname: &str) -> Self {
        Self::presence(MessageType::Enter, chat_room_id, sender_id, sender_nickname)
    }

    /// Presence event announcing `sender_id` left `chat_room_id`.
    #[must_use]
    pub fn leave(chat_room_id: i64, sender_id: i64, sender_nickname: &str) -> Self {
        Self::presence(MessageType::Leave, chat_room_id, sender_id, sender_nickname)
    }

    /// User content stamped with the local clock and no server id.
    #[must_use]
    pub fn talk(chat_room_id: i64, sender_id: i64, sender_nickname: &str, text: &str, sent_at: String) -> Self {
        Self {
            kind: MessageType::Talk,
            chat_room_id,
            sender_id,
            sender_nickname: sender_nickname.to_owned(),
            message: text.to_owned(),
            sent_at: Some(sent_at),
            chat_message_id: None,
        }
    }

    fn presence(kind: MessageType, chat_room_id: i64, sender_id: i64, sender_nickname: &str) -> Self {
        Self {
            kind,
            chat_room_id,
            sender_id,
            sender_nickname: sender_nickname.to_owned(),
            message: String::new(),
            sent_at: None,
            chat_message_id: None,
        }
    }

    /// True once the server has assigned and echoed an id.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.chat_message_id.is_some()
    }

    /// Check the field contracts that serde alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidId`] for non-positive ids and
    /// [`ProtocolError::EmptyTalk`] for TALK messages without text.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        positive("chatRoomId", self.chat_room_id)?;
        positive("senderId", self.sender_id)?;
        if let Some(id) = self.chat_message_id {
            positive("chatMessageId", id)?;
        }
        if self.kind == MessageType::Talk && self.message.trim().is_empty() {
            return Err(ProtocolError::EmptyTalk);
        }
        Ok(())
    }

    /// Serialize to the flat JSON body used on the wire.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization failures.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn positive(field: &'static str, value: i64) -> Result<(), ProtocolError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ProtocolError::InvalidId { field, value })
    }
}

/// Snapshot of a room fetched before the live connection opens.
///
/// Every message in a decoded history is confirmed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub chat_room_id: i64,
    pub messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHistory {
    #[serde(deserialize_with = "deserialize_id")]
    chat_room_id: i64,
    #[serde(default, deserialize_with = "deserialize_nullable_list")]
    messages: Vec<serde_json::Value>,
}

/// Decode a history response body.
///
/// Entries that fail validation or lack a `chatMessageId` are left out of the
/// history and returned alongside it so the caller can log them; one bad record
/// does not reject the backlog.
///
/// # Errors
///
/// Returns [`ProtocolError`] when the envelope itself is malformed or the room
/// id is not positive.
pub fn decode_chat_history(body: &str) -> Result<(ChatHistory, Vec<ProtocolError>), ProtocolError> {
    let wire: WireHistory = serde_json::from_str(body)?;
    positive("chatRoomId", wire.chat_room_id)?;

    let mut messages = Vec::with_capacity(wire.messages.len());
    let mut rejected = Vec::new();
    for value in wire.messages {
        match chat_message_from_value(value) {
            Ok(message) if message.is_confirmed() => messages.push(message),
            Ok(_) => rejected.push(ProtocolError::Unconfirmed),
            Err(err) => rejected.push(err),
        }
    }
    Ok((ChatHistory { chat_room_id: wire.chat_room_id, messages }, rejected))
}

/// Decode and validate one inbound message body.
///
/// # Errors
///
/// Returns [`ProtocolError`] when the body is not a well-formed chat message.
pub fn decode_chat_message(body: &str) -> Result<ChatMessage, ProtocolError> {
    let message: ChatMessage = serde_json::from_str(body)?;
    message.validate()?;
    Ok(message)
}

/// Decode and validate a message already parsed as JSON.
///
/// # Errors
///
/// Returns [`ProtocolError`] when the value is not a well-formed chat message.
pub fn chat_message_from_value(value: serde_json::Value) -> Result<ChatMessage, ProtocolError> {
    let message: ChatMessage = serde_json::from_value(value)?;
    message.validate()?;
    Ok(message)
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| D::Error::custom(format!("expected integer id, got {value}")))
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    id_from_value(&value)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("expected integer id, got {value}")))
}

fn id_from_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn deserialize_nullable_list<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept `"2024-05-01T10:20:30"` or Jackson's `[2024,5,1,10,20,30,...]` form.
fn deserialize_sent_at<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(raw) => Ok(Some(raw)),
        serde_json::Value::Array(parts) => {
            let nums: Vec<i64> = parts.iter().filter_map(serde_json::Value::as_i64).collect();
            if nums.len() < 5 || nums.len() != parts.len() {
                return Err(D::Error::custom("expected [year, month, day, hour, minute, ...]"));
            }
            let second = nums.get(5).copied().unwrap_or(0);
            Ok(Some(format!(
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                nums[0], nums[1], nums[2], nums[3], nums[4], second
            )))
        }
        other => Err(D::Error::custom(format!("unsupported sentAt value: {other}"))),
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
