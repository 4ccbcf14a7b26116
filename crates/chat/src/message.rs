use std::fmt;

use uuid::Uuid;

/// Stable identifier for one chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a typed session identifier.
    pub const fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    /// Allocates a fresh, time-ordered session identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Stable identifier for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one streaming generation turn.
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

/// Identifier for one queued upload; lives until the upload resolves or the
/// pending file is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadTicket(pub u64);

impl UploadTicket {
    /// Creates a typed upload ticket.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Registry-local identifier for one context file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextFileId(pub u64);

impl ContextFileId {
    /// Creates a typed context file identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-chunk rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub stream_id: StreamSessionId,
}

impl StreamTarget {
    /// Builds a full stream target from session and stream IDs.
    pub const fn new(session_id: SessionId, stream_id: StreamSessionId) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Stored-file reference eligible for inclusion in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub key: String,
    pub content_type: String,
    pub url: String,
}

impl AttachmentRef {
    pub fn new(
        key: impl Into<String>,
        content_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            content_type: content_type.into(),
            url: url.into(),
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming(StreamSessionId),
    Done,
    Error(String),
    /// A session switch detached the stream before it finished; the text that
    /// arrived stays, nothing more is appended.
    Detached,
}

/// One conversation turn: ordered text fragments plus attachment references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text_parts: Vec<String>,
    pub attachments: Vec<AttachmentRef>,
    pub status: MessageStatus,
}

impl Message {
    /// Creates a complete user message with its attachment snapshot.
    pub fn user(id: MessageId, text: impl Into<String>, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            id,
            role: Role::User,
            text_parts: vec![text.into()],
            attachments,
            status: MessageStatus::Done,
        }
    }

    /// Creates the assistant message when the first stream increment arrives.
    pub fn assistant_streaming(
        id: MessageId,
        stream_id: StreamSessionId,
        first_chunk: impl Into<String>,
    ) -> Self {
        Self {
            id,
            role: Role::Assistant,
            text_parts: vec![first_chunk.into()],
            attachments: Vec::new(),
            status: MessageStatus::Streaming(stream_id),
        }
    }

    /// Appends one increment in receipt order.
    pub fn push_fragment(&mut self, chunk: impl Into<String>) {
        self.text_parts.push(chunk.into());
    }

    /// Reassembles the full text from its fragments.
    pub fn text(&self) -> String {
        self.text_parts.concat()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_carries_its_text_as_the_sole_fragment() {
        let message = Message::user(MessageId::new(1), "hello", Vec::new());
        assert_eq!(message.text_parts, vec!["hello".to_string()]);
        assert_eq!(message.status, MessageStatus::Done);
        assert_eq!(message.role, Role::User);
    }

    #[test]
    fn fragment_concatenation_reassembles_the_streamed_text() {
        let mut message =
            Message::assistant_streaming(MessageId::new(2), StreamSessionId::new(1), "Hi");
        message.push_fragment(" the");
        message.push_fragment("re");
        assert_eq!(message.text(), "Hi there");
        assert!(message.is_streaming());
    }

    #[test]
    fn session_ids_are_unique_and_printable() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert_eq!(first.to_string().len(), 36);
    }
}
