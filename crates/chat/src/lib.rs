/// Stream event contracts shared between transport and session layers.
pub mod events;
/// Domain entities and conversation aggregate invariants.
pub mod message;
/// Merges optimistic local state with authoritative server snapshots.
pub mod reconciler;
/// Deterministic stream lifecycle state machine.
pub mod state;
/// Wire-record decoding and total canonicalization.
pub mod wire;

pub use events::{StreamEvent, StreamEventPayload, StreamFailure};
pub use message::{
    Conversation, ConversationId, DEFAULT_CONVERSATION_TITLE, Message, Sender, StreamSessionId,
    StreamTarget,
};
pub use reconciler::{ConversationSummary, TranscriptReconciler};
pub use state::{StreamState, StreamTransition, StreamTransitionRejection, StreamTransitionResult};
pub use wire::{WireConversation, WireMessage, canonicalize_conversation, canonicalize_message};
