pub mod backend;
pub mod rig_adapter;
pub mod scripted;

pub use backend::{
    BackendError, BackendEventStream, BackendMessage, BackendResult, BackendStreamHandle,
    BackendWorker, BoxFuture, ChatBackend, DEFAULT_OPENAI_MODEL, MessageAttachment,
    ProviderConfig, Role, SessionKey, StreamEvent, StreamEventPayload, StreamRequest,
    StreamSessionId, StreamTarget, create_backend,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigBackendAdapter};
pub use scripted::{ScriptedBackend, ScriptedOutcome, ScriptedTurn};
