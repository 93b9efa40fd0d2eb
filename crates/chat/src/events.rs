use snafu::Snafu;

use crate::message::StreamTarget;
use crate::state::StreamTransition;

/// Terminal failure taxonomy for one streamed exchange.
///
/// Every variant is recoverable: the optimistic user message stays in the
/// transcript, partial text is discarded, and the user may resubmit. Nothing
/// is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum StreamFailure {
    #[snafu(display("assistant stream could not be opened: {detail}"))]
    Open { status: Option<u16>, detail: String },
    #[snafu(display("assistant reported a failure mid-stream: {message}"))]
    Protocol { message: String },
    #[snafu(display("assistant stream idled past {idle_ms} ms"))]
    Timeout { idle_ms: u64 },
    #[snafu(display("assistant stream transport failed: {detail}"))]
    Transport { detail: String },
}

/// Payload of one publication from the streaming response consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    /// Transport established; frames may follow.
    Opened,
    /// One revealed character appended to the reply accumulator.
    Delta(String),
    /// Terminal: the complete accumulated reply text.
    Done(String),
    /// Terminal: the stream failed; no reply message may be finalized.
    Error(StreamFailure),
}

/// One publication, tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(target: StreamTarget, payload: StreamEventPayload) -> Self {
        Self { target, payload }
    }

    /// Maps lifecycle payloads to stream state transitions.
    ///
    /// Delta payloads intentionally return `None` because they mutate the
    /// reply accumulator, not the stream lifecycle state.
    pub fn to_transition(&self) -> Option<StreamTransition> {
        match &self.payload {
            StreamEventPayload::Opened => Some(StreamTransition::Opened(self.target.clone())),
            StreamEventPayload::Delta(_) => None,
            StreamEventPayload::Done(_) => Some(StreamTransition::Complete(self.target.clone())),
            StreamEventPayload::Error(_) => Some(StreamTransition::Fail(self.target.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ConversationId, StreamSessionId};

    fn target() -> StreamTarget {
        StreamTarget::new(ConversationId::new("c1"), StreamSessionId::new(7))
    }

    #[test]
    fn lifecycle_payloads_map_to_transitions() {
        let opened = StreamEvent::new(target(), StreamEventPayload::Opened);
        assert_eq!(
            opened.to_transition(),
            Some(StreamTransition::Opened(target()))
        );

        let done = StreamEvent::new(target(), StreamEventPayload::Done("Hi".into()));
        assert_eq!(
            done.to_transition(),
            Some(StreamTransition::Complete(target()))
        );

        let failed = StreamEvent::new(
            target(),
            StreamEventPayload::Error(StreamFailure::Protocol {
                message: "rate_limited".into(),
            }),
        );
        assert_eq!(
            failed.to_transition(),
            Some(StreamTransition::Fail(target()))
        );

        let delta = StreamEvent::new(target(), StreamEventPayload::Delta("H".into()));
        assert_eq!(delta.to_transition(), None);
    }
}
