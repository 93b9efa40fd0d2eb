use std::fmt;

use chrono::{DateTime, Utc};

/// Default title used for conversations the server has not named yet.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Opaque server-assigned conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Creates a typed conversation identifier from an opaque server string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier for one streaming generation session.
///
/// This must change on every submit/switch so stale publications can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Creates a typed stream session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-publication rejection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    /// Builds a full stream target from conversation and session IDs.
    pub fn new(conversation_id: ConversationId, session_id: StreamSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

/// Message author, decided once at ingestion and never re-inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Bot,
}

/// Core immutable message model.
///
/// A streaming bot reply exists only as ephemeral session state; exactly one
/// `Message` is appended when the stream completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub image: Option<String>,
    pub conversation_id: ConversationId,
}

impl Message {
    /// Creates a message with explicit sender.
    pub fn new(
        conversation_id: ConversationId,
        sender: Sender,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp,
            image: None,
            conversation_id,
        }
    }

    /// Creates a locally-originated user message.
    pub fn user(
        conversation_id: ConversationId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(conversation_id, Sender::User, text, timestamp)
    }

    /// Creates a finalized assistant message.
    pub fn bot(
        conversation_id: ConversationId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(conversation_id, Sender::Bot, text, timestamp)
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Conversation aggregate root.
///
/// `last_message` and `timestamp` always reflect the most recently appended
/// message; ordering is insertion order and is never re-sorted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new(id: ConversationId, title: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_CONVERSATION_TITLE.to_string();
        }

        Self {
            id,
            title,
            last_message: String::new(),
            timestamp,
            messages: Vec::new(),
        }
    }

    /// Appends a message and keeps the summary fields in sync with it.
    pub fn push(&mut self, message: Message) {
        self.last_message = message.text.clone();
        self.timestamp = message.timestamp;
        self.messages.push(message);
    }

    /// Replaces the transcript wholesale and re-derives the summary fields.
    ///
    /// Summary fields fall back to their current values when the replacement
    /// transcript is empty, so summary-only server entries keep their preview.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        if let Some(last) = messages.last() {
            self.last_message = last.text.clone();
            self.timestamp = last.timestamp;
        }
        self.messages = messages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    #[test]
    fn push_keeps_summary_fields_in_sync() {
        let id = ConversationId::new("c1");
        let mut conversation = Conversation::new(id.clone(), "Support", at(0));

        conversation.push(Message::user(id.clone(), "Hello", at(10)));
        assert_eq!(conversation.last_message, "Hello");
        assert_eq!(conversation.timestamp, at(10));

        conversation.push(Message::bot(id, "Hi there", at(11)));
        assert_eq!(conversation.last_message, "Hi there");
        assert_eq!(conversation.timestamp, at(11));
        assert_eq!(conversation.messages.len(), 2);
    }

    #[test]
    fn empty_title_falls_back_to_default() {
        let conversation = Conversation::new(ConversationId::new("c1"), "  ", at(0));
        assert_eq!(conversation.title, DEFAULT_CONVERSATION_TITLE);
    }

    #[test]
    fn replace_with_empty_transcript_keeps_existing_summary() {
        let id = ConversationId::new("c1");
        let mut conversation = Conversation::new(id.clone(), "Support", at(0));
        conversation.push(Message::user(id, "Hello", at(5)));

        conversation.replace_messages(Vec::new());
        assert_eq!(conversation.last_message, "Hello");
        assert_eq!(conversation.timestamp, at(5));
        assert!(conversation.messages.is_empty());
    }
}
