use std::sync::Arc;

use chrono::Utc;
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use soar_chat::{
    ConversationId, ConversationSummary, Message, StreamEvent, StreamEventPayload, StreamFailure,
    StreamSessionId, StreamState, StreamTarget, StreamTransition, TranscriptReconciler,
};

use crate::backend::{ApiError, AssistantBackend, AudioClip, SendRequest, StreamHandle};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("message is empty after trimming"))]
    EmptyMessage,
    #[snafu(display("no conversation is active"))]
    NoActiveConversation,
    #[snafu(display("a request is already in flight"))]
    RequestInFlight,
    #[snafu(display("assistant api call failed on `{stage}`: {source}"))]
    Api {
        stage: &'static str,
        source: ApiError,
    },
}

/// Publication to session subscribers.
///
/// Everything the user sees changes only through one of these.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ActiveConversationChanged(Option<ConversationId>),
    MessageAppended(Message),
    StreamingTextChanged(String),
    StreamCompleted(ConversationId),
    StreamFailed(StreamFailure),
    StreamCancelled(ConversationId),
    ConversationsRefreshed,
}

/// Point-in-time view of the mutable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub active_conversation_id: Option<ConversationId>,
    pub draft_input: String,
    pub is_sending: bool,
    pub is_streaming: bool,
    pub streaming_text: String,
}

struct ActiveStream {
    target: StreamTarget,
    reader: JoinHandle<()>,
}

struct SessionInner {
    reconciler: TranscriptReconciler,
    active_conversation_id: Option<ConversationId>,
    draft_input: String,
    stream_state: StreamState,
    streaming_text: String,
    next_stream_session_id: u64,
    active_stream: Option<ActiveStream>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionInner {
    fn publish(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn apply_transition(&mut self, transition: StreamTransition) -> bool {
        match self.stream_state.apply(transition) {
            Ok(next) => {
                self.stream_state = next;
                true
            }
            Err(rejection) => {
                tracing::warn!(rejection = ?rejection, "stream transition rejected");
                false
            }
        }
    }

    // Tears down whatever stream is in flight. The aborted reader drops its
    // event stream, which signals the worker to stop publishing.
    fn cancel_in_flight(&mut self) -> Option<ConversationId> {
        let target = self.stream_state.active_target()?.clone();

        if let Some(active) = self.active_stream.take() {
            active.reader.abort();
        }
        self.apply_transition(StreamTransition::Cancel(target.clone()));
        self.streaming_text.clear();
        self.reconciler.take_deferred(&target.conversation_id);

        self.publish(SessionEvent::StreamingTextChanged(String::new()));
        self.publish(SessionEvent::StreamCancelled(target.conversation_id.clone()));
        Some(target.conversation_id)
    }
}

/// What one stream publication did to the session, from the reader's view.
enum ReaderOutcome {
    Ignored,
    Progress,
    Completed,
    Failed,
}

/// Conversation session controller.
///
/// Owns the reconciler, the stream lifecycle state, and the draft input.
/// Exactly one stream may be in flight; concurrent submits are serialized by
/// rejection rather than queueing.
#[derive(Clone)]
pub struct ChatSession {
    backend: Arc<dyn AssistantBackend>,
    user_email: String,
    inner: Arc<Mutex<SessionInner>>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn AssistantBackend>, user_email: impl Into<String>) -> Self {
        Self {
            backend,
            user_email: user_email.into(),
            inner: Arc::new(Mutex::new(SessionInner {
                reconciler: TranscriptReconciler::new(),
                active_conversation_id: None,
                draft_input: String::new(),
                stream_state: StreamState::Idle,
                streaming_text: String::new(),
                next_stream_session_id: 0,
                active_stream: None,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.inner.lock().await.subscribers.push(event_tx);
        event_rx
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            active_conversation_id: inner.active_conversation_id.clone(),
            draft_input: inner.draft_input.clone(),
            is_sending: inner.stream_state.is_opening(),
            is_streaming: inner.stream_state.is_streaming(),
            streaming_text: inner.streaming_text.clone(),
        }
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.reconciler.summaries()
    }

    pub async fn transcript(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .reconciler
            .transcript(conversation_id)
            .to_vec()
    }

    pub async fn set_draft(&self, draft: impl Into<String>) {
        self.inner.lock().await.draft_input = draft.into();
    }

    /// Folds a speech-to-text result into the draft without replacing it.
    pub async fn append_transcript(&self, text: &str) -> String {
        let mut inner = self.inner.lock().await;
        if inner.draft_input.is_empty() {
            inner.draft_input = text.to_string();
        } else {
            inner.draft_input.push(' ');
            inner.draft_input.push_str(text);
        }
        inner.draft_input.clone()
    }

    /// Transcribes a recorded clip and folds the result into the draft.
    pub async fn transcribe_to_draft(&self, clip: AudioClip) -> SessionResult<String> {
        let text = self
            .backend
            .transcribe_audio(clip)
            .await
            .context(ApiSnafu {
                stage: "transcribe_audio",
            })?;
        Ok(self.append_transcript(&text).await)
    }

    /// Submits one user message on the active conversation.
    ///
    /// The optimistic user message is appended before any network activity
    /// and survives every stream outcome. Exactly one generation is minted
    /// per accepted submit; publications from older generations are dropped.
    pub async fn submit(&self, text: &str) -> SessionResult<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return EmptyMessageSnafu.fail();
        }

        let (target, request) = {
            let mut inner = self.inner.lock().await;
            let conversation_id = inner
                .active_conversation_id
                .clone()
                .ok_or_else(|| NoActiveConversationSnafu.build())?;
            if !inner.stream_state.is_idle() {
                return RequestInFlightSnafu.fail();
            }

            inner.next_stream_session_id += 1;
            let target = StreamTarget::new(
                conversation_id.clone(),
                StreamSessionId::new(inner.next_stream_session_id),
            );
            if !inner.apply_transition(StreamTransition::Submit(target.clone())) {
                return RequestInFlightSnafu.fail();
            }

            let user_message = Message::user(conversation_id, trimmed, Utc::now());
            inner.reconciler.append_optimistic(user_message.clone());
            inner.draft_input.clear();
            inner.streaming_text.clear();
            inner.publish(SessionEvent::MessageAppended(user_message));
            inner.publish(SessionEvent::StreamingTextChanged(String::new()));

            let request = SendRequest::new(target.clone(), trimmed, self.user_email.clone());
            (target, request)
        };

        let StreamHandle { stream, worker } = self.backend.send_message(request);
        tokio::spawn(worker);
        let reader = tokio::spawn(run_reader(self.clone(), stream));

        let mut inner = self.inner.lock().await;
        if inner.stream_state.accepts_event(&target) {
            inner.active_stream = Some(ActiveStream { target, reader });
        } else {
            // The stream already terminated while we were spawning.
            reader.abort();
        }
        Ok(())
    }

    /// Makes a conversation current, cancelling any in-flight stream.
    ///
    /// The cancelled exchange still completes server-side; its reply lands on
    /// a later refresh rather than through the dead stream.
    pub async fn select_conversation(&self, conversation_id: ConversationId) {
        let mut inner = self.inner.lock().await;
        inner.cancel_in_flight();

        if inner.active_conversation_id.as_ref() != Some(&conversation_id) {
            inner.active_conversation_id = Some(conversation_id.clone());
            inner.publish(SessionEvent::ActiveConversationChanged(Some(
                conversation_id,
            )));
        }
    }

    /// Creates a fresh server-side conversation and makes it active.
    pub async fn new_conversation(&self) -> SessionResult<ConversationId> {
        if !self.inner.lock().await.stream_state.is_idle() {
            return RequestInFlightSnafu.fail();
        }

        let conversation = self
            .backend
            .create_conversation(&self.user_email)
            .await
            .context(ApiSnafu {
                stage: "create_conversation",
            })?;
        let conversation_id = conversation.id.clone();

        let mut inner = self.inner.lock().await;
        if !inner.stream_state.is_idle() {
            return RequestInFlightSnafu.fail();
        }
        inner.reconciler.insert(conversation);
        inner.active_conversation_id = Some(conversation_id.clone());
        inner.publish(SessionEvent::ActiveConversationChanged(Some(
            conversation_id.clone(),
        )));
        Ok(conversation_id)
    }

    /// Fetches the conversation list and reconciles it into local state.
    ///
    /// Never touches the draft input. The in-flight conversation, if any, is
    /// exempted from replacement per the reconciler's deferral rule.
    pub async fn refresh(&self) -> SessionResult<()> {
        let conversations = self
            .backend
            .list_conversations(&self.user_email)
            .await
            .context(ApiSnafu {
                stage: "list_conversations",
            })?;

        let mut inner = self.inner.lock().await;
        let in_flight = inner
            .stream_state
            .active_target()
            .map(|target| target.conversation_id.clone());
        inner
            .reconciler
            .reconcile_from_server(conversations, in_flight.as_ref());

        // The active conversation can disappear on a server-side deletion.
        if let Some(active) = inner.active_conversation_id.clone()
            && !inner.reconciler.contains(&active)
        {
            inner.active_conversation_id = None;
            inner.publish(SessionEvent::ActiveConversationChanged(None));
        }

        inner.publish(SessionEvent::ConversationsRefreshed);
        Ok(())
    }

    async fn handle_stream_event(&self, event: StreamEvent) -> ReaderOutcome {
        let mut inner = self.inner.lock().await;

        // Stale-generation publications never touch session state.
        if !inner.stream_state.accepts_event(&event.target) {
            tracing::debug!(target = ?event.target, "dropping stale stream event");
            return ReaderOutcome::Ignored;
        }

        let conversation_id = event.target.conversation_id.clone();
        match event.payload {
            StreamEventPayload::Opened => {
                inner.apply_transition(StreamTransition::Opened(event.target));
                ReaderOutcome::Progress
            }
            StreamEventPayload::Delta(delta) => {
                inner.streaming_text.push_str(&delta);
                let current = inner.streaming_text.clone();
                inner.publish(SessionEvent::StreamingTextChanged(current));
                ReaderOutcome::Progress
            }
            StreamEventPayload::Done(full_text) => {
                inner.apply_transition(StreamTransition::Complete(event.target));
                inner.active_stream = None;
                inner.streaming_text.clear();
                inner.reconciler.take_deferred(&conversation_id);

                let reply = Message::bot(conversation_id.clone(), full_text, Utc::now());
                inner.reconciler.finalize_streamed(reply.clone());

                inner.publish(SessionEvent::StreamingTextChanged(String::new()));
                inner.publish(SessionEvent::MessageAppended(reply));
                inner.publish(SessionEvent::StreamCompleted(conversation_id));
                ReaderOutcome::Completed
            }
            StreamEventPayload::Error(failure) => {
                tracing::warn!(target = ?event.target, error = %failure, "stream failed");
                inner.apply_transition(StreamTransition::Fail(event.target));
                inner.active_stream = None;
                inner.streaming_text.clear();
                inner.reconciler.take_deferred(&conversation_id);

                inner.publish(SessionEvent::StreamingTextChanged(String::new()));
                inner.publish(SessionEvent::StreamFailed(failure));
                ReaderOutcome::Failed
            }
        }
    }
}

async fn run_reader(session: ChatSession, mut stream: crate::backend::ResponseStream) {
    while let Some(event) = stream.recv().await {
        match session.handle_stream_event(event).await {
            ReaderOutcome::Completed => {
                // Fire-and-forget: a failed refresh only costs list freshness.
                let refresher = session.clone();
                tokio::spawn(async move {
                    if let Err(error) = refresher.refresh().await {
                        tracing::warn!(error = %error, "post-completion refresh failed");
                    }
                });
                return;
            }
            ReaderOutcome::Failed => return,
            ReaderOutcome::Ignored | ReaderOutcome::Progress => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use futures::StreamExt;
    use futures::stream;

    use soar_chat::{Conversation, Sender};

    use crate::backend::{ApiResult, BoxFuture, make_event_stream};
    use crate::stream::{StreamTuning, pump_frames};

    enum Script {
        /// Open succeeds, listed frames are served, then the stream ends
        /// cleanly (or hangs, for cancellation tests).
        Frames {
            frames: Vec<&'static str>,
            hang_after: bool,
        },
        OpenFailure {
            status: Option<u16>,
        },
    }

    struct ScriptedBackend {
        conversations: StdMutex<Vec<Conversation>>,
        scripts: StdMutex<VecDeque<Script>>,
        send_count: AtomicUsize,
        created: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                conversations: StdMutex::new(Vec::new()),
                scripts: StdMutex::new(scripts.into()),
                send_count: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
            })
        }

        fn set_server_conversations(&self, conversations: Vec<Conversation>) {
            *self.conversations.lock().expect("lock") = conversations;
        }

        fn sends(&self) -> usize {
            self.send_count.load(Ordering::SeqCst)
        }
    }

    impl AssistantBackend for ScriptedBackend {
        fn create_conversation<'a>(
            &'a self,
            _user_id: &'a str,
        ) -> BoxFuture<'a, ApiResult<Conversation>> {
            Box::pin(async move {
                let index = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Conversation::new(
                    ConversationId::new(format!("c{index}")),
                    "",
                    Utc::now(),
                ))
            })
        }

        fn list_conversations<'a>(
            &'a self,
            _email: &'a str,
        ) -> BoxFuture<'a, ApiResult<Vec<Conversation>>> {
            Box::pin(async move { Ok(self.conversations.lock().expect("lock").clone()) })
        }

        fn transcribe_audio<'a>(&'a self, _clip: AudioClip) -> BoxFuture<'a, ApiResult<String>> {
            Box::pin(async move { Ok("note to self".to_string()) })
        }

        fn send_message(&self, request: SendRequest) -> StreamHandle {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Script::Frames {
                    frames: Vec::new(),
                    hang_after: true,
                });

            let (event_tx, stream, cancel_rx) = make_event_stream(request.target.clone());
            let target = request.target;
            let tuning = StreamTuning {
                reveal_interval: Duration::ZERO,
                idle_timeout: Duration::from_secs(3600),
            };

            let worker: crate::backend::StreamWorker = Box::pin(async move {
                match script {
                    Script::OpenFailure { status } => {
                        let _ = event_tx.send(StreamEvent::new(
                            target,
                            StreamEventPayload::Error(StreamFailure::Open {
                                status,
                                detail: "scripted open failure".to_string(),
                            }),
                        ));
                    }
                    Script::Frames { frames, hang_after } => {
                        if event_tx
                            .send(StreamEvent::new(target.clone(), StreamEventPayload::Opened))
                            .is_err()
                        {
                            return;
                        }
                        let lines = frames
                            .into_iter()
                            .map(|frame| Ok::<Bytes, std::io::Error>(Bytes::from(format!("{frame}\n"))))
                            .collect::<Vec<_>>();
                        if hang_after {
                            let bytes = stream::iter(lines).chain(stream::pending());
                            pump_frames(bytes, target, tuning, event_tx, cancel_rx).await;
                        } else {
                            let bytes = stream::iter(lines);
                            pump_frames(bytes, target, tuning, event_tx, cancel_rx).await;
                        }
                    }
                }
            });

            StreamHandle { stream, worker }
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("session still publishing")
    }

    async fn wait_for_completion(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            if let SessionEvent::StreamCompleted(_) = next_event(events).await {
                return;
            }
        }
    }

    async fn session_with_active_conversation(
        backend: Arc<ScriptedBackend>,
    ) -> (ChatSession, ConversationId) {
        let session = ChatSession::new(backend, "sam@example.com");
        let conversation_id = session.new_conversation().await.expect("new conversation");
        (session, conversation_id)
    }

    #[tokio::test]
    async fn submit_appends_the_user_message_before_any_network_call() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![],
            hang_after: true,
        }]);
        let (session, conversation_id) =
            session_with_active_conversation(backend.clone()).await;
        let mut events = session.subscribe().await;

        session.submit("  Hello  ").await.expect("submit");

        // First publication is the optimistic append, already trimmed.
        match next_event(&mut events).await {
            SessionEvent::MessageAppended(message) => {
                assert_eq!(message.sender, Sender::User);
                assert_eq!(message.text, "Hello");
            }
            other => panic!("expected optimistic append first, got {other:?}"),
        }
        assert_eq!(backend.sends(), 1);
        assert_eq!(session.transcript(&conversation_id).await.len(), 1);
        assert_eq!(session.snapshot().await.draft_input, "");
    }

    #[tokio::test]
    async fn completed_stream_finalizes_one_bot_message_and_refreshes() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![
                r#"data: {"chunk":"Hi"}"#,
                r#"data: {"chunk":" there"}"#,
            ],
            hang_after: false,
        }]);
        let (session, conversation_id) =
            session_with_active_conversation(backend.clone()).await;

        // Server truth the post-completion refresh will return.
        let mut server = Conversation::new(conversation_id.clone(), "Support", Utc::now());
        server.push(Message::user(conversation_id.clone(), "Hello", Utc::now()));
        server.push(Message::bot(conversation_id.clone(), "Hi there", Utc::now()));
        backend.set_server_conversations(vec![server]);

        let mut events = session.subscribe().await;
        session.submit("Hello").await.expect("submit");
        wait_for_completion(&mut events).await;

        let transcript = session.transcript(&conversation_id).await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].sender, Sender::User);
        assert_eq!(transcript[1].sender, Sender::Bot);
        assert_eq!(transcript[1].text, "Hi there");

        let snapshot = session.snapshot().await;
        assert!(!snapshot.is_sending);
        assert!(!snapshot.is_streaming);
        assert_eq!(snapshot.streaming_text, "");

        // Fire-and-forget refresh lands after completion.
        loop {
            if let SessionEvent::ConversationsRefreshed = next_event(&mut events).await {
                break;
            }
        }
        assert_eq!(session.transcript(&conversation_id).await.len(), 2);
    }

    #[tokio::test]
    async fn streaming_text_grows_by_prefix_while_the_reply_arrives() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![r#"data: {"chunk":"Hi"}"#],
            hang_after: false,
        }]);
        let (session, _conversation_id) = session_with_active_conversation(backend).await;
        let mut events = session.subscribe().await;
        session.submit("Hello").await.expect("submit");

        let mut observed = Vec::new();
        loop {
            match next_event(&mut events).await {
                SessionEvent::StreamingTextChanged(text) if !text.is_empty() => {
                    observed.push(text);
                }
                SessionEvent::StreamCompleted(_) => break,
                _ => {}
            }
        }
        assert_eq!(observed, vec!["H".to_string(), "Hi".to_string()]);
    }

    #[tokio::test]
    async fn stream_error_keeps_the_optimistic_message_and_returns_to_idle() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![
                r#"data: {"chunk":"Hi"}"#,
                r#"data: {"error":"rate_limited"}"#,
            ],
            hang_after: false,
        }]);
        let (session, conversation_id) = session_with_active_conversation(backend).await;
        let mut events = session.subscribe().await;
        session.submit("Hello").await.expect("submit");

        loop {
            match next_event(&mut events).await {
                SessionEvent::StreamFailed(StreamFailure::Protocol { message }) => {
                    assert_eq!(message, "rate_limited");
                    break;
                }
                SessionEvent::StreamFailed(other) => panic!("unexpected failure {other}"),
                _ => {}
            }
        }

        let transcript = session.transcript(&conversation_id).await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].sender, Sender::User);

        let snapshot = session.snapshot().await;
        assert!(!snapshot.is_sending && !snapshot.is_streaming);
        assert_eq!(snapshot.streaming_text, "");

        // The failure is recoverable: the next submit is accepted.
        session.submit("Hello again").await.expect("resubmit");
    }

    #[tokio::test]
    async fn open_failure_surfaces_without_losing_the_user_message() {
        let backend = ScriptedBackend::new(vec![Script::OpenFailure { status: Some(503) }]);
        let (session, conversation_id) = session_with_active_conversation(backend).await;
        let mut events = session.subscribe().await;
        session.submit("Hello").await.expect("submit");

        loop {
            match next_event(&mut events).await {
                SessionEvent::StreamFailed(StreamFailure::Open { status, .. }) => {
                    assert_eq!(status, Some(503));
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(session.transcript(&conversation_id).await.len(), 1);
    }

    #[tokio::test]
    async fn submit_is_rejected_while_a_request_is_in_flight() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![],
            hang_after: true,
        }]);
        let (session, _conversation_id) = session_with_active_conversation(backend.clone()).await;
        session.submit("first").await.expect("submit");

        assert!(matches!(
            session.submit("second").await,
            Err(SessionError::RequestInFlight)
        ));
        assert!(matches!(
            session.new_conversation().await,
            Err(SessionError::RequestInFlight)
        ));
        assert_eq!(backend.sends(), 1);
    }

    #[tokio::test]
    async fn empty_and_homeless_submits_are_rejected_synchronously() {
        let backend = ScriptedBackend::new(vec![]);
        let session = ChatSession::new(backend.clone(), "sam@example.com");

        assert!(matches!(
            session.submit("   ").await,
            Err(SessionError::EmptyMessage)
        ));
        assert!(matches!(
            session.submit("Hello").await,
            Err(SessionError::NoActiveConversation)
        ));
        assert_eq!(backend.sends(), 0);
    }

    #[tokio::test]
    async fn switching_conversations_cancels_the_stream_and_clears_streaming_text() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![r#"data: {"chunk":"partial"}"#],
            hang_after: true,
        }]);
        let (session, first) = session_with_active_conversation(backend.clone()).await;
        let mut events = session.subscribe().await;
        session.submit("Hello").await.expect("submit");

        // Wait until at least one character has been revealed.
        loop {
            if let SessionEvent::StreamingTextChanged(text) = next_event(&mut events).await
                && !text.is_empty()
            {
                break;
            }
        }

        let second = ConversationId::new("other");
        session.select_conversation(second.clone()).await;

        loop {
            match next_event(&mut events).await {
                SessionEvent::StreamCancelled(cancelled) => {
                    assert_eq!(cancelled, first);
                    break;
                }
                _ => {}
            }
        }

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.active_conversation_id, Some(second));
        assert_eq!(snapshot.streaming_text, "");
        assert!(!snapshot.is_sending && !snapshot.is_streaming);

        // No bot message was finalized on the abandoned conversation.
        let transcript = session.transcript(&first).await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].sender, Sender::User);
    }

    #[tokio::test]
    async fn cancelled_exchange_lands_on_a_later_refresh() {
        let backend = ScriptedBackend::new(vec![Script::Frames {
            frames: vec![],
            hang_after: true,
        }]);
        let (session, first) = session_with_active_conversation(backend.clone()).await;
        session.submit("Hello").await.expect("submit");
        session.select_conversation(ConversationId::new("other")).await;

        // Server finished the exchange on its side.
        let mut server = Conversation::new(first.clone(), "Support", Utc::now());
        server.push(Message::user(first.clone(), "Hello", Utc::now()));
        server.push(Message::bot(first.clone(), "Hi there", Utc::now()));
        backend.set_server_conversations(vec![server]);

        session.refresh().await.expect("refresh");
        let transcript = session.transcript(&first).await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].text, "Hi there");
    }

    #[tokio::test]
    async fn refresh_never_touches_the_draft_and_drops_deleted_active() {
        let backend = ScriptedBackend::new(vec![]);
        let (session, conversation_id) = session_with_active_conversation(backend.clone()).await;
        session.set_draft("still typing").await;

        // Give the conversation history so reconciliation can delete it.
        let mut server = Conversation::new(conversation_id.clone(), "Support", Utc::now());
        server.push(Message::user(conversation_id.clone(), "old", Utc::now()));
        backend.set_server_conversations(vec![server]);
        session.refresh().await.expect("refresh");

        backend.set_server_conversations(vec![]);
        session.refresh().await.expect("refresh");

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.draft_input, "still typing");
        assert_eq!(snapshot.active_conversation_id, None);
    }

    #[tokio::test]
    async fn new_conversation_starts_empty_and_becomes_active() {
        let backend = ScriptedBackend::new(vec![]);
        let session = ChatSession::new(backend, "sam@example.com");
        let mut events = session.subscribe().await;

        let conversation_id = session.new_conversation().await.expect("new conversation");
        assert!(session.transcript(&conversation_id).await.is_empty());
        assert_eq!(
            session.snapshot().await.active_conversation_id,
            Some(conversation_id.clone())
        );
        match next_event(&mut events).await {
            SessionEvent::ActiveConversationChanged(Some(active)) => {
                assert_eq!(active, conversation_id);
            }
            other => panic!("expected active-conversation change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcription_folds_into_the_draft() {
        let backend = ScriptedBackend::new(vec![]);
        let session = ChatSession::new(backend, "sam@example.com");
        session.set_draft("Remind me:").await;

        let draft = session
            .transcribe_to_draft(AudioClip {
                bytes: vec![0, 1, 2],
                file_name: "clip.webm".to_string(),
                mime_type: "audio/webm".to_string(),
            })
            .await
            .expect("transcription");
        assert_eq!(draft, "Remind me: note to self");
        assert_eq!(session.snapshot().await.draft_input, "Remind me: note to self");
    }

    #[tokio::test]
    async fn stale_generation_events_are_dropped() {
        let backend = ScriptedBackend::new(vec![]);
        let (session, conversation_id) = session_with_active_conversation(backend).await;

        let stale = StreamEvent::new(
            StreamTarget::new(conversation_id.clone(), StreamSessionId::new(99)),
            StreamEventPayload::Done("ghost reply".to_string()),
        );
        assert!(matches!(
            session.handle_stream_event(stale).await,
            ReaderOutcome::Ignored
        ));
        assert!(session.transcript(&conversation_id).await.is_empty());
    }
}
