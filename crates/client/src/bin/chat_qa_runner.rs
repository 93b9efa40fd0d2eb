use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::mpsc;

use soar_chat::{
    Conversation, ConversationId, DEFAULT_CONVERSATION_TITLE, Message, Sender, StreamEvent,
    StreamEventPayload, StreamSessionId, StreamState, StreamTarget, StreamTransition,
    StreamTransitionRejection, TranscriptReconciler, canonicalize_conversation,
    wire::WireConversation,
};
use soar_client::{
    ApiResult, AssistantBackend, AudioClip, BoxFuture, ChatSession, ClientConfig, HttpBackend,
    IdentityStore, IdentityStoreError, SendRequest, SessionError, SessionEvent, StoredIdentity,
    StreamHandle, make_event_stream,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    data_root: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    WireCanonical,
    StateMachine,
    ReconcileDefer,
    SessionRoundtrip,
    IdentityRoundtrip,
    LiveSmoke,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "wire_canonical" => Some(Self::WireCanonical),
            "state_machine" => Some(Self::StateMachine),
            "reconcile_defer" => Some(Self::ReconcileDefer),
            "session_roundtrip" => Some(Self::SessionRoundtrip),
            "identity_roundtrip" => Some(Self::IdentityRoundtrip),
            "live_smoke" => Some(Self::LiveSmoke),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::WireCanonical => "wire_canonical",
            Self::StateMachine => "state_machine",
            Self::ReconcileDefer => "reconcile_defer",
            Self::SessionRoundtrip => "session_roundtrip",
            Self::IdentityRoundtrip => "identity_roundtrip",
            Self::LiveSmoke => "live_smoke",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --data-root argument for scenario '{scenario}'"))]
    MissingDataRoot {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("missing SOAR_BASE_URL environment variable for scenario 'live_smoke'"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("session call failed: {source}"))]
    SessionCall {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("identity store failed: {source}"))]
    IdentityIo {
        stage: &'static str,
        source: IdentityStoreError,
    },
    #[snafu(display("wire decode failed: {source}"))]
    WireDecode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(data_root) = args.data_root.as_deref() {
        println!("data_root={data_root}");
    }

    match args.scenario {
        Scenario::WireCanonical => run_wire_canonical(),
        Scenario::StateMachine => run_state_machine(),
        Scenario::ReconcileDefer => run_reconcile_defer(),
        Scenario::SessionRoundtrip => run_session_roundtrip().await,
        Scenario::IdentityRoundtrip => {
            run_identity_roundtrip(require_data_root(&args, "identity_roundtrip")?)
        }
        Scenario::LiveSmoke => {
            let base_url = env::var("SOAR_BASE_URL").ok().context(MissingBaseUrlSnafu {
                stage: "scenario-live-smoke-env",
            })?;
            run_live_smoke(&base_url).await
        }
        Scenario::All => run_all(args.data_root.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut data_root = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--data-root" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-data-root-value",
                    arg: "--data-root",
                })?;
                data_root = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        data_root,
    })
}

fn require_data_root<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.data_root.as_deref().context(MissingDataRootSnafu {
        stage: "require-data-root",
        scenario,
    })
}

async fn run_all(data_root: Option<&str>) -> RunnerResult<()> {
    run_wire_canonical()?;
    run_state_machine()?;
    run_reconcile_defer()?;
    run_session_roundtrip().await?;

    if let Some(data_root) = data_root {
        run_identity_roundtrip(data_root)?;
    }
    if let Ok(base_url) = env::var("SOAR_BASE_URL") {
        run_live_smoke(&base_url).await?;
    }

    println!("all_passed=true");
    Ok(())
}

fn scenario_check(scenario: &'static str, check: &str, ok: bool) -> RunnerResult<()> {
    println!("{check}={ok}");
    if ok {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: format!("check '{check}' failed"),
    }
    .fail()
}

fn run_wire_canonical() -> RunnerResult<()> {
    let scenario = "wire_canonical";
    let wire: WireConversation = serde_json::from_str(
        r#"{
            "id": 42,
            "title": "",
            "lastMessage": "stale preview",
            "messages": [
                {"content": "Hello", "user_email": "qa@example.com", "timestamp": "2024-05-01T12:00:00Z"},
                {"text": "Hi there", "timestamp": "2024-05-01T12:00:05Z"},
                {}
            ]
        }"#,
    )
    .context(WireDecodeSnafu {
        stage: "scenario-wire-canonical-decode",
    })?;

    let conversation = canonicalize_conversation(wire);
    scenario_check(scenario, "numeric_id_accepted", conversation.id.as_str() == "42")?;
    scenario_check(
        scenario,
        "blank_title_defaulted",
        conversation.title == DEFAULT_CONVERSATION_TITLE,
    )?;
    scenario_check(
        scenario,
        "sender_inferred",
        conversation.messages[0].sender == Sender::User
            && conversation.messages[1].sender == Sender::Bot,
    )?;
    scenario_check(
        scenario,
        "empty_record_total",
        conversation.messages[2].text.is_empty(),
    )?;
    scenario_check(
        scenario,
        "summary_rederived",
        conversation.last_message.is_empty(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn run_state_machine() -> RunnerResult<()> {
    let scenario = "state_machine";
    let target = StreamTarget::new(ConversationId::new("qa"), StreamSessionId::new(1));
    let stale = StreamTarget::new(ConversationId::new("qa"), StreamSessionId::new(0));

    let opening = StreamState::Idle
        .apply(StreamTransition::Submit(target.clone()))
        .map_err(|rejection| {
            ScenarioFailedSnafu {
                stage: "scenario-state-machine-submit",
                scenario,
                reason: format!("submit rejected: {rejection:?}"),
            }
            .build()
        })?;
    scenario_check(scenario, "submit_opens", opening.is_opening())?;

    let double_submit = opening.apply(StreamTransition::Submit(stale.clone()));
    scenario_check(
        scenario,
        "double_submit_rejected",
        matches!(
            double_submit,
            Err(StreamTransitionRejection::AlreadyActive { .. })
        ),
    )?;

    let streaming = opening
        .apply(StreamTransition::Opened(target.clone()))
        .map_err(|rejection| {
            ScenarioFailedSnafu {
                stage: "scenario-state-machine-opened",
                scenario,
                reason: format!("opened rejected: {rejection:?}"),
            }
            .build()
        })?;
    scenario_check(
        scenario,
        "stale_terminal_rejected",
        matches!(
            streaming.apply(StreamTransition::Complete(stale)),
            Err(StreamTransitionRejection::TargetMismatch { .. })
        ),
    )?;
    scenario_check(
        scenario,
        "complete_returns_to_idle",
        streaming.apply(StreamTransition::Complete(target)) == Ok(StreamState::Idle),
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn run_reconcile_defer() -> RunnerResult<()> {
    let scenario = "reconcile_defer";
    let in_flight = ConversationId::new("qa");
    let mut reconciler = TranscriptReconciler::new();
    reconciler.append_optimistic(Message::user(in_flight.clone(), "Hello", Utc::now()));

    // Server has not seen the exchange and reports an empty history.
    let stale_snapshot = Conversation::new(in_flight.clone(), "QA", Utc::now());
    reconciler.reconcile_from_server(vec![stale_snapshot], Some(&in_flight));

    scenario_check(
        scenario,
        "in_flight_not_shortened",
        reconciler.transcript(&in_flight).len() == 1,
    )?;
    scenario_check(
        scenario,
        "snapshot_deferred",
        reconciler.take_deferred(&in_flight).is_some(),
    )?;
    scenario_check(
        scenario,
        "deferred_taken_once",
        reconciler.take_deferred(&in_flight).is_none(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

/// Scripted backend serving one canned streamed reply per send.
struct CannedBackend {
    reply: &'static str,
}

impl AssistantBackend for CannedBackend {
    fn create_conversation<'a>(
        &'a self,
        _user_id: &'a str,
    ) -> BoxFuture<'a, ApiResult<Conversation>> {
        Box::pin(async move {
            Ok(Conversation::new(
                ConversationId::new("qa-conversation"),
                "",
                Utc::now(),
            ))
        })
    }

    fn list_conversations<'a>(
        &'a self,
        _email: &'a str,
    ) -> BoxFuture<'a, ApiResult<Vec<Conversation>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn transcribe_audio<'a>(&'a self, _clip: AudioClip) -> BoxFuture<'a, ApiResult<String>> {
        Box::pin(async move { Ok("canned transcript".to_string()) })
    }

    fn send_message(&self, request: SendRequest) -> StreamHandle {
        let (event_tx, stream, _cancel_rx) = make_event_stream(request.target.clone());
        let target = request.target;
        let reply = self.reply;

        let worker = Box::pin(async move {
            if event_tx
                .send(StreamEvent::new(target.clone(), StreamEventPayload::Opened))
                .is_err()
            {
                return;
            }
            for character in reply.chars() {
                if event_tx
                    .send(StreamEvent::new(
                        target.clone(),
                        StreamEventPayload::Delta(character.to_string()),
                    ))
                    .is_err()
                {
                    return;
                }
            }
            let _ = event_tx.send(StreamEvent::new(
                target,
                StreamEventPayload::Done(reply.to_string()),
            ));
        });

        StreamHandle { stream, worker }
    }
}

async fn wait_for_completion(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    scenario: &'static str,
) -> RunnerResult<()> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .ok()
            .flatten()
            .context(ScenarioFailedSnafu {
                stage: "scenario-wait-completion",
                scenario,
                reason: "stream did not complete in time".to_string(),
            })?;
        match event {
            SessionEvent::StreamCompleted(_) => return Ok(()),
            SessionEvent::StreamFailed(failure) => {
                return ScenarioFailedSnafu {
                    stage: "scenario-wait-completion",
                    scenario,
                    reason: format!("stream failed: {failure}"),
                }
                .fail();
            }
            _ => {}
        }
    }
}

async fn run_session_roundtrip() -> RunnerResult<()> {
    let scenario = "session_roundtrip";
    let backend = Arc::new(CannedBackend { reply: "Hi there" });
    let session = ChatSession::new(backend, "qa@example.com");
    let mut events = session.subscribe().await;

    let conversation_id = session.new_conversation().await.context(SessionCallSnafu {
        stage: "scenario-session-new-conversation",
    })?;
    session.submit("Hello").await.context(SessionCallSnafu {
        stage: "scenario-session-submit",
    })?;
    wait_for_completion(&mut events, scenario).await?;

    let transcript = session.transcript(&conversation_id).await;
    scenario_check(scenario, "two_messages_finalized", transcript.len() == 2)?;
    scenario_check(
        scenario,
        "reply_text_complete",
        transcript[1].sender == Sender::Bot && transcript[1].text == "Hi there",
    )?;
    let snapshot = session.snapshot().await;
    scenario_check(
        scenario,
        "session_returned_to_idle",
        !snapshot.is_sending && !snapshot.is_streaming && snapshot.streaming_text.is_empty(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn run_identity_roundtrip(data_root: &str) -> RunnerResult<()> {
    let scenario = "identity_roundtrip";
    let store = IdentityStore::in_data_root(data_root);
    let identity = StoredIdentity {
        email: "qa@example.com".to_string(),
        display_name: "QA\tRunner".to_string(),
    };

    store.save(&identity).context(IdentityIoSnafu {
        stage: "scenario-identity-save",
    })?;
    let loaded = store.load().context(IdentityIoSnafu {
        stage: "scenario-identity-load",
    })?;

    scenario_check(
        scenario,
        "identity_round_trips",
        loaded.as_ref() == Some(&identity),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_live_smoke(base_url: &str) -> RunnerResult<()> {
    let scenario = "live_smoke";
    println!("base_url={base_url}");

    let backend = Arc::new(HttpBackend::new(ClientConfig::new(base_url)));
    let session = ChatSession::new(backend, "qa@example.com");
    let mut events = session.subscribe().await;

    let conversation_id = session.new_conversation().await.context(SessionCallSnafu {
        stage: "scenario-live-new-conversation",
    })?;
    session
        .submit("ping from the qa runner")
        .await
        .context(SessionCallSnafu {
            stage: "scenario-live-submit",
        })?;
    wait_for_completion(&mut events, scenario).await?;

    let transcript = session.transcript(&conversation_id).await;
    scenario_check(
        scenario,
        "live_reply_received",
        transcript.len() == 2 && !transcript[1].text.is_empty(),
    )?;

    println!("runner_ok=true");
    Ok(())
}
