use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::message::{Conversation, ConversationId, DEFAULT_CONVERSATION_TITLE, Message};

/// List-view projection of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            last_message: conversation.last_message.clone(),
            timestamp: conversation.timestamp,
        }
    }
}

/// Single source of truth for what the user sees.
///
/// Merges three inputs: local optimistic appends, stream-finalized messages,
/// and authoritative list refreshes. Only the session controller mutates it.
#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    conversations: HashMap<ConversationId, Conversation>,
    // Server snapshot held back because its conversation had a stream in
    // flight when the refresh landed.
    deferred: Option<Conversation>,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn transcript(&self, conversation_id: &ConversationId) -> &[Message] {
        self.conversations
            .get(conversation_id)
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }

    /// Inserts a conversation wholesale (new-conversation flow).
    pub fn insert(&mut self, conversation: Conversation) {
        self.conversations.insert(conversation.id.clone(), conversation);
    }

    /// Appends a locally-originated message; never fails, always synchronous.
    pub fn append_optimistic(&mut self, message: Message) {
        self.append(message);
    }

    /// Appends the single finalized bot message of a completed stream.
    pub fn finalize_streamed(&mut self, message: Message) {
        self.append(message);
    }

    fn append(&mut self, message: Message) {
        let conversation = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(|| {
                Conversation::new(
                    message.conversation_id.clone(),
                    DEFAULT_CONVERSATION_TITLE,
                    message.timestamp,
                )
            });
        conversation.push(message);
    }

    /// Replaces local state with server truth.
    ///
    /// The conversation named by `in_flight` is exempt: its local transcript
    /// is preserved untouched and the server snapshot for it is parked until
    /// the stream terminates, so a refresh can never visibly truncate a reply
    /// that is still being typed. Conversations absent from the snapshot are
    /// removed (server-side deletion), except for in-flight or still-empty
    /// local entries the server may simply not know about yet.
    pub fn reconcile_from_server(
        &mut self,
        server_conversations: Vec<Conversation>,
        in_flight: Option<&ConversationId>,
    ) {
        let mut listed = HashSet::with_capacity(server_conversations.len());

        for server_conversation in server_conversations {
            listed.insert(server_conversation.id.clone());

            if Some(&server_conversation.id) == in_flight
                && self.conversations.contains_key(&server_conversation.id)
            {
                self.deferred = Some(server_conversation);
                continue;
            }

            self.conversations
                .insert(server_conversation.id.clone(), server_conversation);
        }

        self.conversations.retain(|id, conversation| {
            listed.contains(id) || Some(id) == in_flight || conversation.messages.is_empty()
        });
    }

    /// Takes the snapshot parked for a now-terminated stream, if any.
    ///
    /// Callers discard it: the snapshot predates the exchange that just
    /// finalized, and the follow-up refresh supplies fresher truth.
    pub fn take_deferred(&mut self, conversation_id: &ConversationId) -> Option<Conversation> {
        if self
            .deferred
            .as_ref()
            .is_some_and(|snapshot| snapshot.id == *conversation_id)
        {
            return self.deferred.take();
        }
        None
    }

    /// Summaries ordered most-recent first, ties broken by id.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut summaries = self
            .conversations
            .values()
            .map(ConversationSummary::from)
            .collect::<Vec<_>>();
        summaries.sort_by(sort_by_recent_desc);
        summaries
    }
}

fn sort_by_recent_desc(left: &ConversationSummary, right: &ConversationSummary) -> Ordering {
    right
        .timestamp
        .cmp(&left.timestamp)
        .then_with(|| right.id.cmp(&left.id))
}
