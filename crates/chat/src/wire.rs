use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::message::{Conversation, ConversationId, Message, Sender};

/// Raw message record as served by the conversation endpoints.
///
/// The server has emitted several shapes over time (`content` vs `text`,
/// `is_user` vs `user_email`), so every field is optional here and resolved
/// once by [`canonicalize_message`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub is_user: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Raw conversation record from `POST /conversation` and `GET /conversations`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireConversation {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "lastMessage")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

// Conversation ids are opaque strings in the model, but older server rows
// serialize the database primary key as a JSON number.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Numeric(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(raw) => raw,
        RawId::Numeric(raw) => raw.to_string(),
    })
}

/// Converts a wire message record into the canonical [`Message`].
///
/// Total by construction: missing text resolves to the empty string, a
/// missing or unparseable timestamp resolves to the epoch, and the sender is
/// `User` iff a user-identifying field is present and non-empty. Applying the
/// conversion to already-canonical data yields an identical message.
pub fn canonicalize_message(wire: WireMessage, conversation_id: &ConversationId) -> Message {
    let sender = if wire.is_user == Some(true)
        || wire
            .user_email
            .as_deref()
            .is_some_and(|email| !email.trim().is_empty())
    {
        Sender::User
    } else {
        Sender::Bot
    };

    let text = [wire.content, wire.text]
        .into_iter()
        .flatten()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_default();

    let image = wire.image.filter(|uri| !uri.trim().is_empty());

    Message {
        sender,
        text,
        timestamp: wire.timestamp.unwrap_or(DateTime::UNIX_EPOCH),
        image,
        conversation_id: conversation_id.clone(),
    }
}

/// Converts a wire conversation record into the canonical [`Conversation`].
///
/// Summary fields come from the embedded history when it is non-empty, so the
/// `last_message`/`timestamp` invariant holds regardless of what the server
/// reported alongside it.
pub fn canonicalize_conversation(wire: WireConversation) -> Conversation {
    let id = ConversationId::new(wire.id);
    let mut conversation = Conversation::new(
        id.clone(),
        wire.title.unwrap_or_default(),
        wire.timestamp.unwrap_or(DateTime::UNIX_EPOCH),
    );
    conversation.last_message = wire.last_message.unwrap_or_default();

    let messages = wire
        .messages
        .into_iter()
        .map(|message| canonicalize_message(message, &id))
        .collect();
    conversation.replace_messages(messages);
    conversation
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            content: Some(message.text.clone()),
            text: None,
            user_email: None,
            is_user: Some(message.sender == Sender::User),
            timestamp: Some(message.timestamp),
            image: message.image.clone(),
        }
    }
}
