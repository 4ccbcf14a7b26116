use std::env;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use visor::{SettingsStore, file_store_from_settings, initialize_backend};
use visor_chat::{
    ChatClient, ChatError, ContextFileSelection, Notice, Role, SendStatus, SessionId,
    UploadBatchHandle, UploadEvent, UploadEventPayload,
};
use visor_files::{FileUpload, MemoryFileStore, StoredFile};
use visor_llm::{BackendStreamHandle, ScriptedBackend, ScriptedTurn};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    BootstrapProbe,
    SendFlow,
    ChunkReassembly,
    EmptySendRejected,
    BusySendRejected,
    UploadOutOfOrder,
    UploadFailureIsolated,
    AttachmentSpend,
    SessionSwitchGuard,
    SessionNotFound,
    ContextRegistry,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bootstrap_probe" => Some(Self::BootstrapProbe),
            "send_flow" => Some(Self::SendFlow),
            "chunk_reassembly" => Some(Self::ChunkReassembly),
            "empty_send_rejected" => Some(Self::EmptySendRejected),
            "busy_send_rejected" => Some(Self::BusySendRejected),
            "upload_out_of_order" => Some(Self::UploadOutOfOrder),
            "upload_failure_isolated" => Some(Self::UploadFailureIsolated),
            "attachment_spend" => Some(Self::AttachmentSpend),
            "session_switch_guard" => Some(Self::SessionSwitchGuard),
            "session_not_found" => Some(Self::SessionNotFound),
            "context_registry" => Some(Self::ContextRegistry),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::BootstrapProbe => "bootstrap_probe",
            Self::SendFlow => "send_flow",
            Self::ChunkReassembly => "chunk_reassembly",
            Self::EmptySendRejected => "empty_send_rejected",
            Self::BusySendRejected => "busy_send_rejected",
            Self::UploadOutOfOrder => "upload_out_of_order",
            Self::UploadFailureIsolated => "upload_failure_isolated",
            Self::AttachmentSpend => "attachment_spend",
            Self::SessionSwitchGuard => "session_switch_guard",
            Self::SessionNotFound => "session_not_found",
            Self::ContextRegistry => "context_registry",
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
    #[snafu(display("chat core validation failed: {source}"))]
    ChatValidation {
        stage: &'static str,
        source: ChatError,
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

    match args.scenario {
        Scenario::BootstrapProbe => run_bootstrap_probe(),
        Scenario::SendFlow => run_send_flow().await,
        Scenario::ChunkReassembly => run_chunk_reassembly().await,
        Scenario::EmptySendRejected => run_empty_send_rejected(),
        Scenario::BusySendRejected => run_busy_send_rejected(),
        Scenario::UploadOutOfOrder => run_upload_out_of_order(),
        Scenario::UploadFailureIsolated => run_upload_failure_isolated().await,
        Scenario::AttachmentSpend => run_attachment_spend().await,
        Scenario::SessionSwitchGuard => run_session_switch_guard().await,
        Scenario::SessionNotFound => run_session_not_found(),
        Scenario::ContextRegistry => run_context_registry(),
        Scenario::All => run_all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
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
    })
}

fn offline_client(turns: Vec<ScriptedTurn>) -> ChatClient {
    ChatClient::new(
        Arc::new(ScriptedBackend::new(turns)),
        Arc::new(MemoryFileStore::new()),
    )
}

async fn drive_turn(client: &mut ChatClient, handle: BackendStreamHandle) {
    let BackendStreamHandle { mut stream, worker } = handle;
    worker.await;
    while let Some(event) = stream.try_recv() {
        client.apply_stream_event(event);
    }
}

async fn drive_uploads(client: &mut ChatClient, handle: UploadBatchHandle) {
    let UploadBatchHandle { mut stream, worker } = handle;
    worker.await;
    while let Some(event) = stream.try_recv() {
        client.apply_upload_event(event);
    }
}

async fn run_all() -> RunnerResult<()> {
    run_bootstrap_probe()?;
    run_send_flow().await?;
    run_chunk_reassembly().await?;
    run_empty_send_rejected()?;
    run_busy_send_rejected()?;
    run_upload_out_of_order()?;
    run_upload_failure_isolated().await?;
    run_attachment_spend().await?;
    run_session_switch_guard().await?;
    run_session_not_found()?;
    run_context_registry()?;

    println!("all_passed=true");
    Ok(())
}

fn run_bootstrap_probe() -> RunnerResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    // Construction only; nothing here talks to the network.
    let (backend, model_id, backend_error) = initialize_backend(&settings);
    let file_store = file_store_from_settings(&settings);

    let backend_id = backend
        .map(|backend| backend.id().to_string())
        .unwrap_or_else(|| "none".to_string());

    println!("backend_id={backend_id}");
    println!("model_id={model_id}");
    if let Some(backend_error) = backend_error {
        println!("backend_error={backend_error}");
    }

    if model_id.trim().is_empty() {
        return ScenarioFailedSnafu {
            stage: "scenario-bootstrap-probe-assert-model",
            scenario: "bootstrap_probe",
            reason: "bootstrap must always resolve a model id".to_string(),
        }
        .fail();
    }

    let _ = file_store;
    println!("runner_ok=true");
    Ok(())
}

async fn run_send_flow() -> RunnerResult<()> {
    let mut client = offline_client(vec![ScriptedTurn::completing(&["Hi", " there"])]);

    let handle = client.send("hello").context(ChatValidationSnafu {
        stage: "scenario-send-flow-send",
    })?;

    let awaiting_after_send = client.status() == SendStatus::AwaitingResponse;
    let user_message_ok = client.messages().len() == 1
        && client.messages()[0].role == Role::User
        && client.messages()[0].text() == "hello";

    drive_turn(&mut client, handle).await;

    let idle_after_stream = client.status() == SendStatus::Idle;
    let assistant_text = client
        .messages()
        .last()
        .map(|message| message.text())
        .unwrap_or_default();

    println!("user_message_ok={user_message_ok}");
    println!("awaiting_after_send={awaiting_after_send}");
    println!("idle_after_stream={idle_after_stream}");
    println!("assistant_text={assistant_text}");

    if !user_message_ok || !awaiting_after_send || !idle_after_stream {
        return ScenarioFailedSnafu {
            stage: "scenario-send-flow-assert-lifecycle",
            scenario: "send_flow",
            reason: "send lifecycle did not pass through awaiting and back to idle".to_string(),
        }
        .fail();
    }

    if assistant_text != "Hi there" {
        return ScenarioFailedSnafu {
            stage: "scenario-send-flow-assert-text",
            scenario: "send_flow",
            reason: format!("expected assistant text 'Hi there', got '{assistant_text}'"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_chunk_reassembly() -> RunnerResult<()> {
    let full_text = "The answer is 42.";
    let chunkings: [&[&str]; 3] = [
        &[full_text],
        &["The answer", " is 42."],
        &["The", " answer", " is", " 42", "."],
    ];

    for chunks in chunkings {
        let mut client = offline_client(vec![ScriptedTurn::completing(chunks)]);
        let handle = client.send("question").context(ChatValidationSnafu {
            stage: "scenario-chunk-reassembly-send",
        })?;
        drive_turn(&mut client, handle).await;

        let assembled = client
            .messages()
            .last()
            .map(|message| message.text())
            .unwrap_or_default();

        if assembled != full_text {
            return ScenarioFailedSnafu {
                stage: "scenario-chunk-reassembly-assert",
                scenario: "chunk_reassembly",
                reason: format!(
                    "chunking {:?} reassembled to '{assembled}' instead of '{full_text}'",
                    chunks
                ),
            }
            .fail();
        }
    }

    println!("reassembly_stable=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_empty_send_rejected() -> RunnerResult<()> {
    let mut client = offline_client(vec![ScriptedTurn::completing(&["unused"])]);

    let rejected = matches!(
        client.send("   "),
        Err(ChatError::SendRejectedEmptyInput { .. })
    );
    let no_message_created = client.messages().is_empty();
    let still_idle = client.status() == SendStatus::Idle;

    println!("rejected={rejected}");
    println!("no_message_created={no_message_created}");
    println!("still_idle={still_idle}");

    if !rejected || !no_message_created || !still_idle {
        return ScenarioFailedSnafu {
            stage: "scenario-empty-send-assert",
            scenario: "empty_send_rejected",
            reason: "blank input must be a complete no-op".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_busy_send_rejected() -> RunnerResult<()> {
    let mut client = offline_client(vec![
        ScriptedTurn::completing(&["slow"]),
        ScriptedTurn::completing(&["unused"]),
    ]);

    // The first turn's worker is never driven, so it stays in flight.
    let _pending = client.send("first").context(ChatValidationSnafu {
        stage: "scenario-busy-send-first",
    })?;

    let rejected = matches!(client.send("second"), Err(ChatError::SendRejectedBusy { .. }));
    let history_unchanged = client.messages().len() == 1;

    println!("rejected={rejected}");
    println!("history_unchanged={history_unchanged}");

    if !rejected || !history_unchanged {
        return ScenarioFailedSnafu {
            stage: "scenario-busy-send-assert",
            scenario: "busy_send_rejected",
            reason: "a second send while awaiting must not alter the history".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_upload_out_of_order() -> RunnerResult<()> {
    let mut client = offline_client(Vec::new());

    let handle = client.upload(vec![
        FileUpload::new("first.png", "image/png", vec![1; 8]),
        FileUpload::new("second.png", "image/png", vec![2; 8]),
    ]);
    drop(handle);

    let first_ticket = client.pending_files()[0].ticket;
    let second_ticket = client.pending_files()[1].ticket;

    // Completion order is the network's order, not submission order.
    client.apply_upload_event(UploadEvent {
        ticket: second_ticket,
        payload: UploadEventPayload::Stored(StoredFile::new(
            "k2",
            "image/png",
            "memory://files/k2/second.png",
        )),
    });
    client.apply_upload_event(UploadEvent {
        ticket: first_ticket,
        payload: UploadEventPayload::Stored(StoredFile::new(
            "k1",
            "image/png",
            "memory://files/k1/first.png",
        )),
    });

    let pending_order = client
        .pending_attachments()
        .iter()
        .map(|attachment| attachment.key.as_str())
        .collect::<Vec<_>>()
        .join(",");

    println!("pending_order={pending_order}");

    if pending_order != "k2,k1" {
        return ScenarioFailedSnafu {
            stage: "scenario-upload-order-assert",
            scenario: "upload_out_of_order",
            reason: format!("expected completion order k2,k1 but got {pending_order}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_upload_failure_isolated() -> RunnerResult<()> {
    let mut client = ChatClient::new(
        Arc::new(ScriptedBackend::new(Vec::new())),
        Arc::new(MemoryFileStore::new().with_failing_file("bad.png")),
    );

    let handle = client.upload(vec![
        FileUpload::new("good.png", "image/png", vec![1; 8]),
        FileUpload::new("bad.png", "image/png", vec![2; 8]),
    ]);
    drive_uploads(&mut client, handle).await;

    let surviving_attachments = client.pending_attachments().len();
    let notices = client.take_notices();
    let failure_surfaced = notices
        .iter()
        .any(|notice| matches!(notice, Notice::UploadFailed { file_name, .. } if file_name == "bad.png"));

    println!("surviving_attachments={surviving_attachments}");
    println!("failure_surfaced={failure_surfaced}");

    if surviving_attachments != 1 || !failure_surfaced {
        return ScenarioFailedSnafu {
            stage: "scenario-upload-failure-assert",
            scenario: "upload_failure_isolated",
            reason: "one sibling must survive and the failure must be visible".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_attachment_spend() -> RunnerResult<()> {
    let mut client = offline_client(vec![ScriptedTurn::completing(&["noted"])]);

    let upload_handle = client.upload(vec![FileUpload::new(
        "photo.png",
        "image/png",
        vec![1, 2, 3],
    )]);
    drive_uploads(&mut client, upload_handle).await;

    let pending_before_send = client.pending_attachments().len();
    let handle = client.send("look at this").context(ChatValidationSnafu {
        stage: "scenario-attachment-spend-send",
    })?;

    let pending_after_send = client.pending_attachments().len();
    let files_after_send = client.pending_files().len();
    let attached_to_message = client.messages()[0].attachments.len();

    drive_turn(&mut client, handle).await;

    println!("pending_before_send={pending_before_send}");
    println!("pending_after_send={pending_after_send}");
    println!("files_after_send={files_after_send}");
    println!("attached_to_message={attached_to_message}");

    if pending_before_send != 1
        || pending_after_send != 0
        || files_after_send != 0
        || attached_to_message != 1
    {
        return ScenarioFailedSnafu {
            stage: "scenario-attachment-spend-assert",
            scenario: "attachment_spend",
            reason: "attachments must move from the tray onto the sent message".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_session_switch_guard() -> RunnerResult<()> {
    let mut client = offline_client(vec![ScriptedTurn::completing(&["Hi", " there"])]);
    let original_id = client.active_session_id();

    let handle = client.send("hello").context(ChatValidationSnafu {
        stage: "scenario-switch-guard-send",
    })?;

    let new_id = client.create_session();
    let new_session_empty = client.messages().is_empty();

    // The detached turn's events arrive after the switch and must be dropped.
    drive_turn(&mut client, handle).await;
    let new_session_still_empty = client.messages().is_empty();

    client
        .switch_session(original_id)
        .context(ChatValidationSnafu {
            stage: "scenario-switch-guard-switch-back",
        })?;
    let original_history_len = client.messages().len();
    let original_idle = client.status() == SendStatus::Idle;

    println!("new_session_empty={new_session_empty}");
    println!("new_session_still_empty={new_session_still_empty}");
    println!("original_history_len={original_history_len}");
    println!("original_idle={original_idle}");

    if !new_session_empty || !new_session_still_empty || original_history_len != 1 || !original_idle
    {
        return ScenarioFailedSnafu {
            stage: "scenario-switch-guard-assert",
            scenario: "session_switch_guard",
            reason: "a detached response leaked into a session it does not belong to".to_string(),
        }
        .fail();
    }

    let _ = new_id;
    println!("runner_ok=true");
    Ok(())
}

fn run_session_not_found() -> RunnerResult<()> {
    let mut client = offline_client(Vec::new());
    let active_before = client.active_session_id();

    let missing = SessionId::generate();
    let not_found = matches!(
        client.switch_session(missing),
        Err(ChatError::SessionNotFound { .. })
    );
    let active_unchanged = client.active_session_id() == active_before;

    println!("not_found={not_found}");
    println!("active_unchanged={active_unchanged}");

    if !not_found || !active_unchanged {
        return ScenarioFailedSnafu {
            stage: "scenario-session-not-found-assert",
            scenario: "session_not_found",
            reason: "switching to an unknown session must be observable and harmless".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_context_registry() -> RunnerResult<()> {
    let mut client = offline_client(Vec::new());

    client.add_context_files(vec![
        ContextFileSelection::new("notes.pdf", "application/pdf", 2_048),
        ContextFileSelection::new("data.csv", "text/csv", 512),
    ]);

    let expanded_after_add = client.context_expanded();
    let registered = client.context_files().len();

    let known_id = client.context_files()[0].id;
    client.remove_context_file(known_id);
    let after_known_removal = client.context_files().len();

    // Removing an id that no longer exists is a harmless no-op.
    client.remove_context_file(known_id);
    let after_unknown_removal = client.context_files().len();

    println!("expanded_after_add={expanded_after_add}");
    println!("registered={registered}");
    println!("after_known_removal={after_known_removal}");
    println!("after_unknown_removal={after_unknown_removal}");

    if !expanded_after_add || registered != 2 || after_known_removal != 1 || after_unknown_removal != 1
    {
        return ScenarioFailedSnafu {
            stage: "scenario-context-registry-assert",
            scenario: "context_registry",
            reason: "context registry bookkeeping deviated from add/remove semantics".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}
