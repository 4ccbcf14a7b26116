use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Fallback model when neither settings nor environment name one.
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Opaque key identifying the chat session a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(pub Uuid);

impl SessionKey {
    /// Creates a typed session key.
    pub const fn new(raw: Uuid) -> Self {
        Self(raw)
    }
}

/// Identifier for one streaming generation.
///
/// This must change on every send so stale chunks can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Creates a typed stream session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key echoed back on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session: SessionKey,
    pub stream: StreamSessionId,
}

impl StreamTarget {
    /// Builds a full stream target from session and stream IDs.
    pub const fn new(session: SessionKey, stream: StreamSessionId) -> Self {
        Self { session, stream }
    }
}

/// Chat speaker role at the backend boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Stored-file reference carried alongside a message turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttachment {
    pub content_type: String,
    pub url: String,
}

impl MessageAttachment {
    pub fn new(content_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            url: url.into(),
        }
    }
}

/// One turn of history as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<MessageAttachment>,
}

impl BackendMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<MessageAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<BackendMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<BackendMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One increment of a streamed reply, or its terminal marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("scripted backend has no remaining turns"))]
    ScriptExhausted { stage: &'static str },
}

/// Receiving half of a backend stream, with cancel-on-drop semantics.
pub struct BackendEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Stream plus the worker future that feeds it; the host spawns the worker.
pub struct BackendStreamHandle {
    pub stream: BackendEventStream,
    pub worker: BackendWorker,
}

impl BackendEventStream {
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

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for BackendEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Assistant backend seam: a history in, a stream of text increments out.
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> BackendResult<BackendStreamHandle>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model,
        }
    }
}

/// Builds a backend adapter for the configured provider id.
pub fn create_backend(config: ProviderConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    match config.provider_id.as_str() {
        // An empty provider id falls through to the OpenAI-compatible adapter
        // so minimal configs keep working.
        "" | crate::rig_adapter::RIG_OPENAI_PROVIDER_ID => Ok(Arc::new(
            crate::rig_adapter::RigBackendAdapter::new(config)?,
        )),
        _ => UnsupportedProviderSnafu {
            stage: "create-backend",
            provider_id: config.provider_id,
        }
        .fail(),
    }
}

pub(crate) fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    BackendEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        BackendEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
