use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use soar_chat::{StreamEvent, StreamEventPayload, StreamFailure, StreamTarget};

use crate::config::ClientConfig;

/// Marker prefix of a recognized protocol frame.
const DATA_FRAME_PREFIX: &str = "data: ";

/// Pacing knobs for one stream, snapshotted from [`ClientConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamTuning {
    pub reveal_interval: Duration,
    pub idle_timeout: Duration,
}

impl From<&ClientConfig> for StreamTuning {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reveal_interval: config.reveal_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataFrame {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Decodes one transport line.
///
/// `None` for lines without the frame marker (keep-alives, blank separators).
/// A marked line that fails to parse, or that carries neither payload field,
/// is a protocol failure: the server is speaking a dialect we do not know.
pub(crate) fn decode_frame(line: &str) -> Option<Result<String, StreamFailure>> {
    let payload = line.strip_prefix(DATA_FRAME_PREFIX)?;

    let frame = match serde_json::from_str::<DataFrame>(payload) {
        Ok(frame) => frame,
        Err(source) => {
            return Some(Err(StreamFailure::Protocol {
                message: format!("malformed frame payload: {source}"),
            }));
        }
    };

    if let Some(message) = frame.error {
        return Some(Err(StreamFailure::Protocol { message }));
    }

    match frame.chunk {
        Some(chunk) => Some(Ok(chunk)),
        None => Some(Err(StreamFailure::Protocol {
            message: "frame carried neither chunk nor error".to_string(),
        })),
    }
}

/// Drives one opened byte stream to a single terminal outcome.
///
/// Frames are processed strictly in arrival order; every chunk character is
/// appended to the accumulator after the reveal delay and published as a
/// `Delta`. Exactly one of three things ends the call: `Done` with the full
/// accumulated text, `Error` with a failure, or silent return on cancel.
pub(crate) async fn pump_frames<S, E>(
    bytes: S,
    target: StreamTarget,
    tuning: StreamTuning,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    pin_mut!(bytes);

    let mut accumulator = String::new();
    let mut pending_line = String::new();

    loop {
        let next_read = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "assistant stream cancelled");
                return;
            }
            next_read = tokio::time::timeout(tuning.idle_timeout, bytes.next()) => next_read,
        };

        let chunk_bytes = match next_read {
            Err(_elapsed) => {
                let failure = StreamFailure::Timeout {
                    idle_ms: tuning.idle_timeout.as_millis() as u64,
                };
                tracing::warn!(target = ?target, error = %failure, "assistant stream idled out");
                let _ = event_tx.send(StreamEvent::new(
                    target,
                    StreamEventPayload::Error(failure),
                ));
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(source))) => {
                let failure = StreamFailure::Transport {
                    detail: source.to_string(),
                };
                tracing::warn!(target = ?target, error = %failure, "assistant stream transport failed");
                let _ = event_tx.send(StreamEvent::new(
                    target,
                    StreamEventPayload::Error(failure),
                ));
                return;
            }
            Ok(Some(Ok(chunk_bytes))) => chunk_bytes,
        };

        pending_line.push_str(&String::from_utf8_lossy(&chunk_bytes));

        while let Some(newline) = pending_line.find('\n') {
            let line = pending_line[..newline].trim_end_matches('\r').to_string();
            pending_line.drain(..=newline);

            match handle_line(
                &line,
                &target,
                tuning,
                &mut accumulator,
                &event_tx,
                &mut cancel_rx,
            )
            .await
            {
                LineOutcome::Continue => {}
                LineOutcome::Stop => return,
            }
        }
    }

    // A final frame is allowed to arrive without a trailing newline.
    let trailing = pending_line.trim_end_matches('\r').to_string();
    if !trailing.is_empty() {
        if let LineOutcome::Stop = handle_line(
            &trailing,
            &target,
            tuning,
            &mut accumulator,
            &event_tx,
            &mut cancel_rx,
        )
        .await
        {
            return;
        }
    }

    let _ = event_tx.send(StreamEvent::new(
        target,
        StreamEventPayload::Done(accumulator),
    ));
}

enum LineOutcome {
    Continue,
    Stop,
}

async fn handle_line(
    line: &str,
    target: &StreamTarget,
    tuning: StreamTuning,
    accumulator: &mut String,
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> LineOutcome {
    match decode_frame(line) {
        None => LineOutcome::Continue,
        Some(Err(failure)) => {
            tracing::warn!(target = ?target, error = %failure, "assistant stream failed");
            let _ = event_tx.send(StreamEvent::new(
                target.clone(),
                StreamEventPayload::Error(failure),
            ));
            LineOutcome::Stop
        }
        Some(Ok(chunk)) => reveal_chunk(&chunk, target, tuning, accumulator, event_tx, cancel_rx).await,
    }
}

// Publishes the chunk one character at a time, pacing each reveal so the
// reply reads as if it were being typed.
async fn reveal_chunk(
    chunk: &str,
    target: &StreamTarget,
    tuning: StreamTuning,
    accumulator: &mut String,
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> LineOutcome {
    for character in chunk.chars() {
        tokio::select! {
            _ = &mut *cancel_rx => {
                tracing::debug!(target = ?target, "assistant stream cancelled mid-reveal");
                return LineOutcome::Stop;
            }
            _ = tokio::time::sleep(tuning.reveal_interval) => {}
        }

        accumulator.push(character);
        let sent = event_tx.send(StreamEvent::new(
            target.clone(),
            StreamEventPayload::Delta(character.to_string()),
        ));
        if sent.is_err() {
            return LineOutcome::Stop;
        }
    }

    LineOutcome::Continue
}
