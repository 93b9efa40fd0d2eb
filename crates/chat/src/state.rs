use crate::message::StreamTarget;

/// Stream lifecycle state for one session.
///
/// `Opening` covers the window between submitting a message and the transport
/// reporting a successfully established stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Opening(StreamTarget),
    Streaming(StreamTarget),
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Submit(StreamTarget),
    Opened(StreamTarget),
    Complete(StreamTarget),
    Fail(StreamTarget),
    Cancel(StreamTarget),
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

/// Result type for stream transition application.
pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns the in-flight target for either the opening or streaming phase.
    pub fn active_target(&self) -> Option<&StreamTarget> {
        match self {
            Self::Opening(target) | Self::Streaming(target) => Some(target),
            Self::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, Self::Opening(_))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Returns true when an incoming publication matches the in-flight session.
    pub fn accepts_event(&self, target: &StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Applies one transition deterministically.
    ///
    /// `Submit` is legal only from `Idle`; every later transition must match
    /// the in-flight target exactly, so publications from a superseded
    /// generation can never advance the machine.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Submit(target) => self.apply_submit(target),
            StreamTransition::Opened(target) => self.apply_opened(target),
            StreamTransition::Complete(target)
            | StreamTransition::Fail(target)
            | StreamTransition::Cancel(target) => self.apply_terminal(target),
        }
    }

    fn apply_submit(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Idle => Ok(Self::Opening(target)),
            Self::Opening(active) | Self::Streaming(active) => {
                Err(StreamTransitionRejection::AlreadyActive {
                    active: active.clone(),
                    attempted: target,
                })
            }
        }
    }

    fn apply_opened(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Opening(active) if *active == target => Ok(Self::Streaming(target)),
            Self::Opening(active) | Self::Streaming(active) => {
                Err(StreamTransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle => Err(StreamTransitionRejection::NoActiveStream),
        }
    }

    // Every terminal transition is legal from both in-flight phases: the
    // transport can fail before the stream opens, and a conversation switch
    // can land at any point.
    fn apply_terminal(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Opening(active) | Self::Streaming(active) if *active == target => Ok(Self::Idle),
            Self::Opening(active) | Self::Streaming(active) => {
                Err(StreamTransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}
