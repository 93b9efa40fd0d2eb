use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use soar_chat::{
    Conversation, StreamEvent, StreamEventPayload, StreamFailure, canonicalize_conversation,
    wire::WireConversation,
};

use crate::backend::{
    ApiResult, AssistantBackend, AudioClip, BoxFuture, DecodePayloadSnafu, RequestFailedSnafu,
    SendRequest, StreamHandle, UnexpectedStatusSnafu, make_event_stream,
};
use crate::config::ClientConfig;
use crate::stream::{StreamTuning, pump_frames};

/// Assistant service backend over plain HTTP.
///
/// One endpoint family under a single base URL; every response body goes
/// through the wire canonicalization layer before it reaches the session.
pub struct HttpBackend {
    http: reqwest::Client,
    config: ClientConfig,
}

#[derive(Debug, Serialize)]
struct CreateConversationBody<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    #[serde(rename = "conversationId")]
    conversation_id: &'a str,
    message: &'a str,
    user_email: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    text: String,
}

impl HttpBackend {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    async fn read_success_body(
        response: reqwest::Response,
        stage: &'static str,
    ) -> ApiResult<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .context(RequestFailedSnafu { stage })?;
        if !status.is_success() {
            return UnexpectedStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        Ok(body)
    }
}

impl AssistantBackend for HttpBackend {
    fn create_conversation<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, ApiResult<Conversation>> {
        Box::pin(async move {
            let stage = "create_conversation";
            let response = self
                .http
                .post(self.endpoint("conversation"))
                .json(&CreateConversationBody { user_id })
                .send()
                .await
                .context(RequestFailedSnafu { stage })?;

            let body = Self::read_success_body(response, stage).await?;
            let wire = serde_json::from_str::<WireConversation>(&body)
                .map_err(|source| {
                    DecodePayloadSnafu {
                        stage,
                        detail: source.to_string(),
                    }
                    .build()
                })?;
            Ok(canonicalize_conversation(wire))
        })
    }

    fn list_conversations<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, ApiResult<Vec<Conversation>>> {
        Box::pin(async move {
            let stage = "list_conversations";
            let response = self
                .http
                .get(self.endpoint("conversations"))
                .query(&[("email", email)])
                .send()
                .await
                .context(RequestFailedSnafu { stage })?;

            let body = Self::read_success_body(response, stage).await?;
            let wire = serde_json::from_str::<Vec<WireConversation>>(&body)
                .map_err(|source| {
                    DecodePayloadSnafu {
                        stage,
                        detail: source.to_string(),
                    }
                    .build()
                })?;
            Ok(wire.into_iter().map(canonicalize_conversation).collect())
        })
    }

    fn transcribe_audio<'a>(&'a self, clip: AudioClip) -> BoxFuture<'a, ApiResult<String>> {
        Box::pin(async move {
            let stage = "transcribe_audio";
            let part = Part::bytes(clip.bytes)
                .file_name(clip.file_name)
                .mime_str(&clip.mime_type)
                .map_err(|source| {
                    DecodePayloadSnafu {
                        stage,
                        detail: source.to_string(),
                    }
                    .build()
                })?;
            let form = Form::new().part("file", part);

            let response = self
                .http
                .post(self.endpoint("speech-to-text"))
                .multipart(form)
                .send()
                .await
                .context(RequestFailedSnafu { stage })?;

            let body = Self::read_success_body(response, stage).await?;
            let transcription = serde_json::from_str::<TranscriptionBody>(&body)
                .map_err(|source| {
                    DecodePayloadSnafu {
                        stage,
                        detail: source.to_string(),
                    }
                    .build()
                })?;
            Ok(transcription.text)
        })
    }

    fn send_message(&self, request: SendRequest) -> StreamHandle {
        let (event_tx, stream, cancel_rx) = make_event_stream(request.target.clone());
        let tuning = StreamTuning::from(&self.config);
        let url = self.endpoint("message");
        let http = self.http.clone();

        let worker = Box::pin(async move {
            let target = request.target;
            let body = SendMessageBody {
                conversation_id: target.conversation_id.as_str(),
                message: &request.message,
                user_email: &request.user_email,
            };

            let response = match http.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(source) => {
                    tracing::warn!(target = ?target, error = %source, "failed to reach assistant");
                    let _ = event_tx.send(StreamEvent::new(
                        target,
                        StreamEventPayload::Error(StreamFailure::Open {
                            status: None,
                            detail: source.to_string(),
                        }),
                    ));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                tracing::warn!(
                    target = ?target,
                    status = status.as_u16(),
                    "assistant rejected the message"
                );
                let _ = event_tx.send(StreamEvent::new(
                    target,
                    StreamEventPayload::Error(StreamFailure::Open {
                        status: Some(status.as_u16()),
                        detail,
                    }),
                ));
                return;
            }

            if event_tx
                .send(StreamEvent::new(target.clone(), StreamEventPayload::Opened))
                .is_err()
            {
                return;
            }

            let bytes = response.bytes_stream();
            pump_frames(bytes, target, tuning, event_tx, cancel_rx).await;
        });

        StreamHandle { stream, worker }
    }
}
