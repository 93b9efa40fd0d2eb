use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use soar_chat::{Conversation, StreamEvent, StreamTarget};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ApiResult<T> = Result<T, ApiError>;

/// Request description for one streamed assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub target: StreamTarget,
    pub message: String,
    pub user_email: String,
}

impl SendRequest {
    pub fn new(
        target: StreamTarget,
        message: impl Into<String>,
        user_email: impl Into<String>,
    ) -> Self {
        Self {
            target,
            message: message.into(),
            user_email: user_email.into(),
        }
    }
}

/// Captured audio handed to the speech-to-text endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    RequestFailed {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("assistant endpoint returned status {status} on `{stage}`: {body}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode assistant payload on `{stage}`: {detail}"))]
    DecodePayload {
        stage: &'static str,
        detail: String,
    },
}

/// Live handle over one streamed assistant reply.
///
/// Dropping the handle cancels the stream: the worker observes the cancel
/// signal at its next suspension point, publishes nothing further, and emits
/// no terminal event.
pub struct ResponseStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ResponseStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Event stream plus the worker future that drives it.
///
/// Callers spawn the worker themselves so cancellation and task lifetimes
/// stay under session control.
pub struct StreamHandle {
    pub stream: ResponseStream,
    pub worker: StreamWorker,
}

/// Seam between the session controller and the assistant service.
pub trait AssistantBackend: Send + Sync {
    fn create_conversation<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, ApiResult<Conversation>>;
    fn list_conversations<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, ApiResult<Vec<Conversation>>>;
    fn transcribe_audio<'a>(&'a self, clip: AudioClip) -> BoxFuture<'a, ApiResult<String>>;
    /// Opens exactly one stream per call; every outcome, including open
    /// failures, is reported through the handle's event stream.
    fn send_message(&self, request: SendRequest) -> StreamHandle;
}

/// Builds the channel trio a backend implementation wires its worker to.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ResponseStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ResponseStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
