pub mod client;
pub mod context;
pub mod conversation;
pub mod error;
pub mod message;
pub mod notice;
pub mod session;
pub mod uploader;

pub use client::ChatClient;
pub use context::{ContextFile, ContextFileSelection, ContextRegistry};
pub use conversation::{Conversation, SendStatus};
pub use error::{ChatError, ChatResult};
pub use message::{
    AttachmentRef, ContextFileId, Message, MessageId, MessageStatus, Role, SessionId,
    StreamSessionId, StreamTarget, UploadTicket,
};
pub use notice::Notice;
pub use session::{DEFAULT_SESSION_TITLE, Session, SessionManager};
pub use uploader::{
    PendingFile, UploadBatchHandle, UploadEvent, UploadEventPayload, UploadEventStream,
    UploadOutcome, UploadWorker, Uploader,
};
