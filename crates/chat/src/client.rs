use std::collections::HashMap;
use std::sync::Arc;

use snafu::{ResultExt, ensure};
use visor_files::{FileStore, FileUpload};
use visor_llm::{
    BackendMessage, BackendStreamHandle, ChatBackend, MessageAttachment,
    Role as BackendRole, SessionKey, StreamEvent as BackendStreamEvent,
    StreamEventPayload as BackendStreamEventPayload, StreamRequest,
    StreamSessionId as BackendStreamSessionId, StreamTarget as BackendStreamTarget,
};

use crate::context::{ContextFile, ContextFileSelection, ContextRegistry};
use crate::conversation::{Conversation, SendStatus};
use crate::error::{
    BackendSnafu, ChatResult, SendRejectedBusySnafu, SendRejectedEmptyInputSnafu,
};
use crate::message::{
    AttachmentRef, ContextFileId, Message, MessageId, Role, SessionId, StreamSessionId,
    StreamTarget, UploadTicket,
};
use crate::notice::Notice;
use crate::session::{DEFAULT_SESSION_TITLE, Session, SessionManager};
use crate::uploader::{
    PendingFile, UploadBatchHandle, UploadEvent, UploadOutcome, Uploader,
};

/// Owned state container for the whole chat core.
///
/// The host holds this by `&mut`, calls the mutation operations below, and
/// feeds completion events from the worker futures back in. All state lives
/// here; the rendering layer only reads.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn FileStore>,
    model_id: String,
    max_tokens: Option<u64>,
    sessions: SessionManager,
    conversations: HashMap<SessionId, Conversation>,
    uploader: Uploader,
    context: ContextRegistry,
    notices: Vec<Notice>,
    next_message_id: u64,
    next_stream_id: u64,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<dyn FileStore>) -> Self {
        let sessions = SessionManager::bootstrap();
        let active_id = sessions.active_id();

        let mut conversations = HashMap::new();
        conversations.insert(active_id, Conversation::new(active_id));

        let model_id = backend.default_model().to_string();

        Self {
            backend,
            store,
            model_id,
            max_tokens: None,
            sessions,
            conversations,
            uploader: Uploader::new(),
            context: ContextRegistry::new(),
            notices: Vec::new(),
            next_message_id: 0,
            next_stream_id: 0,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn set_model(&mut self, model_id: impl Into<String>, max_tokens: Option<u64>) {
        self.model_id = model_id.into();
        self.max_tokens = max_tokens;
    }

    // --- sessions ---

    pub fn sessions(&self) -> &[Session] {
        self.sessions.sessions()
    }

    pub fn active_session_id(&self) -> SessionId {
        self.sessions.active_id()
    }

    /// Creates a session with the default title and makes it active.
    ///
    /// A response still streaming for the previous session is detached.
    pub fn create_session(&mut self) -> SessionId {
        self.detach_active_stream();

        let id = self.sessions.create(DEFAULT_SESSION_TITLE);
        self.conversations.insert(id, Conversation::new(id));
        tracing::info!(session_id = %id, "created chat session");
        id
    }

    /// Switches to an existing session; unknown ids change nothing.
    pub fn switch_session(&mut self, session_id: SessionId) -> ChatResult<()> {
        if session_id == self.active_session_id() {
            return Ok(());
        }

        if !self.sessions.contains(session_id) {
            // Validate before detaching so a failed switch is a true no-op.
            return self.sessions.switch_to(session_id);
        }

        self.detach_active_stream();
        self.sessions.switch_to(session_id)?;
        self.conversations
            .entry(session_id)
            .or_insert_with(|| Conversation::new(session_id));
        Ok(())
    }

    fn detach_active_stream(&mut self) {
        let active_id = self.sessions.active_id();
        if let Some(conversation) = self.conversations.get_mut(&active_id)
            && let Some(target) = conversation.detach_turn()
        {
            tracing::debug!(
                session_id = %active_id,
                stream_id = target.stream_id.0,
                "detached in-flight response on session change"
            );
        }
    }

    // --- conversation ---

    pub fn status(&self) -> SendStatus {
        self.active_conversation()
            .map(Conversation::send_status)
            .unwrap_or_default()
    }

    pub fn messages(&self) -> &[Message] {
        self.active_conversation()
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }

    /// Sends the current input to the assistant backend.
    ///
    /// Appends the user message optimistically, spends the pending
    /// attachments, and returns the stream handle for the host to drive;
    /// events come back through [`ChatClient::apply_stream_event`].
    pub fn send(&mut self, text: &str) -> ChatResult<BackendStreamHandle> {
        ensure!(
            !text.trim().is_empty() || !self.uploader.pending_attachments().is_empty(),
            SendRejectedEmptyInputSnafu { stage: "send" }
        );

        let active_id = self.sessions.active_id();
        let target = StreamTarget::new(active_id, self.alloc_stream_id());
        let user_message_id = self.alloc_message_id();

        let conversation = self
            .conversations
            .entry(active_id)
            .or_insert_with(|| Conversation::new(active_id));

        // Check before spending attachments so a rejected send leaves the
        // pending lists intact.
        ensure!(
            !conversation.is_awaiting_response(),
            SendRejectedBusySnafu {
                stage: "send",
                session_id: active_id,
            }
        );

        let attachments = self.uploader.take_for_send();
        conversation.begin_turn(target, Message::user(user_message_id, text, attachments))?;

        let request = Self::build_stream_request(
            conversation,
            target,
            &self.model_id,
            self.max_tokens,
        );

        match self.backend.stream_chat(request) {
            Ok(handle) => {
                tracing::debug!(
                    session_id = %active_id,
                    stream_id = target.stream_id.0,
                    "opened assistant stream"
                );
                Ok(handle)
            }
            Err(source) => {
                conversation.abort_turn(target);
                Err(source).context(BackendSnafu { stage: "send" })
            }
        }
    }

    /// Applies one backend stream event to the owning conversation.
    ///
    /// Events whose target does not match an in-flight turn are dropped;
    /// that is the stale-session guard.
    pub fn apply_stream_event(&mut self, event: BackendStreamEvent) {
        let target = Self::chat_target(event.target);

        let Some(conversation) = self.conversations.get_mut(&target.session_id) else {
            tracing::warn!(session_id = %target.session_id, "stream event for an unknown session");
            return;
        };

        if !conversation.accepts_stream_event(target) {
            tracing::debug!(
                session_id = %target.session_id,
                stream_id = target.stream_id.0,
                "dropping stale stream event"
            );
            return;
        }

        match event.payload {
            BackendStreamEventPayload::Delta(chunk) => {
                if conversation.has_streaming_message(target) {
                    conversation.append_chunk(target, chunk);
                } else {
                    let assistant_message_id = self.alloc_message_id();
                    self.conversations
                        .get_mut(&target.session_id)
                        .expect("conversation checked above")
                        .start_assistant(target, assistant_message_id, chunk);
                }
            }
            BackendStreamEventPayload::Done => {
                conversation.complete_turn(target);
            }
            BackendStreamEventPayload::Error(reason) => {
                conversation.fail_turn(target, reason.clone());
                self.notices.push(Notice::StreamFailed {
                    session_id: target.session_id,
                    reason,
                });
            }
        }
    }

    // --- uploads ---

    /// Starts storing the selected files; the host drives the returned handle
    /// and feeds its events to [`ChatClient::apply_upload_event`].
    pub fn upload(&mut self, files: Vec<FileUpload>) -> UploadBatchHandle {
        self.uploader.begin_batch(files, Arc::clone(&self.store))
    }

    pub fn apply_upload_event(&mut self, event: UploadEvent) {
        match self.uploader.apply_event(event) {
            UploadOutcome::Attached | UploadOutcome::Dropped => {}
            UploadOutcome::Failed { file_name, reason } => {
                tracing::warn!(file_name = %file_name, reason = %reason, "upload failed");
                self.notices.push(Notice::UploadFailed { file_name, reason });
            }
        }
    }

    pub fn remove_pending_file(&mut self, ticket: UploadTicket) -> bool {
        self.uploader.remove_pending(ticket)
    }

    pub fn pending_files(&self) -> &[PendingFile] {
        self.uploader.pending_files()
    }

    pub fn pending_attachments(&self) -> &[AttachmentRef] {
        self.uploader.pending_attachments()
    }

    // --- context files ---

    pub fn add_context_files(&mut self, selections: Vec<ContextFileSelection>) {
        self.context.add(selections);
    }

    pub fn remove_context_file(&mut self, id: ContextFileId) {
        self.context.remove(id);
    }

    pub fn context_files(&self) -> &[ContextFile] {
        self.context.files()
    }

    pub fn context_expanded(&self) -> bool {
        self.context.is_expanded()
    }

    pub fn toggle_context_expanded(&mut self) {
        self.context.toggle_expanded();
    }

    // --- notices ---

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    // --- internals ---

    fn active_conversation(&self) -> Option<&Conversation> {
        self.conversations.get(&self.sessions.active_id())
    }

    fn alloc_message_id(&mut self) -> MessageId {
        self.next_message_id = self.next_message_id.saturating_add(1);
        MessageId::new(self.next_message_id)
    }

    fn alloc_stream_id(&mut self) -> StreamSessionId {
        self.next_stream_id = self.next_stream_id.saturating_add(1);
        StreamSessionId::new(self.next_stream_id)
    }

    fn build_stream_request(
        conversation: &Conversation,
        target: StreamTarget,
        model_id: &str,
        max_tokens: Option<u64>,
    ) -> StreamRequest {
        let messages = conversation
            .messages
            .iter()
            .filter(|message| !message.is_streaming())
            .map(|message| {
                // Keep role mapping explicit at the crate boundary so backend
                // types stay decoupled from chat domain enums.
                BackendMessage::new(Self::backend_role(message.role), message.text())
                    .with_attachments(
                        message
                            .attachments
                            .iter()
                            .map(|attachment| {
                                MessageAttachment::new(
                                    attachment.content_type.clone(),
                                    attachment.url.clone(),
                                )
                            })
                            .collect(),
                    )
            })
            .collect();

        let mut request =
            StreamRequest::new(Self::backend_target(target), model_id, messages);
        if let Some(max_tokens) = max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    fn backend_role(role: Role) -> BackendRole {
        match role {
            Role::User => BackendRole::User,
            Role::Assistant => BackendRole::Assistant,
        }
    }

    fn backend_target(target: StreamTarget) -> BackendStreamTarget {
        // Preserve identity while translating between domain-specific typed wrappers.
        BackendStreamTarget::new(
            SessionKey::new(target.session_id.0),
            BackendStreamSessionId::new(target.stream_id.0),
        )
    }

    fn chat_target(target: BackendStreamTarget) -> StreamTarget {
        StreamTarget::new(
            SessionId::new(target.session.0),
            StreamSessionId::new(target.stream.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::message::MessageStatus;
    use visor_files::MemoryFileStore;
    use visor_llm::{ScriptedBackend, ScriptedTurn};

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

    #[tokio::test(flavor = "current_thread")]
    async fn hello_round_trip_assembles_the_streamed_reply() {
        let mut client = offline_client(vec![ScriptedTurn::completing(&["Hi", " there"])]);

        let handle = client.send("hello").expect("send accepted");
        assert_eq!(client.status(), SendStatus::AwaitingResponse);
        assert_eq!(client.messages().len(), 1);
        assert_eq!(client.messages()[0].role, Role::User);
        assert_eq!(client.messages()[0].text(), "hello");

        drive_turn(&mut client, handle).await;

        assert_eq!(client.status(), SendStatus::Idle);
        let assistant = &client.messages()[1];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.text(), "Hi there");
        assert_eq!(assistant.status, MessageStatus::Done);
        assert!(client.take_notices().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn any_chunking_of_the_same_text_reassembles_identically() {
        for chunks in [
            vec!["The answer is 42."],
            vec!["The answer", " is 42."],
            vec!["The", " answer", " is", " 42", "."],
        ] {
            let mut client = offline_client(vec![ScriptedTurn::completing(&chunks)]);
            let handle = client.send("question").expect("send accepted");
            drive_turn(&mut client, handle).await;
            assert_eq!(client.messages()[1].text(), "The answer is 42.");
        }
    }

    #[test]
    fn empty_input_with_no_attachments_is_rejected_without_a_message() {
        let mut client = offline_client(vec![ScriptedTurn::completing(&["unused"])]);

        let error = client.send("   ").err().expect("blank send must fail");

        assert!(matches!(error, ChatError::SendRejectedEmptyInput { .. }));
        assert!(client.messages().is_empty());
        assert_eq!(client.status(), SendStatus::Idle);
    }

    #[test]
    fn sending_while_awaiting_is_rejected_and_changes_nothing() {
        let mut client = offline_client(vec![
            ScriptedTurn::completing(&["slow"]),
            ScriptedTurn::completing(&["unused"]),
        ]);

        // First send's worker is never driven, so the turn stays in flight.
        let _pending = client.send("first").expect("first send accepted");
        assert_eq!(client.status(), SendStatus::AwaitingResponse);

        let error = client.send("second").err().expect("busy send must fail");

        assert!(matches!(error, ChatError::SendRejectedBusy { .. }));
        assert_eq!(client.messages().len(), 1);
        assert_eq!(client.messages()[0].text(), "first");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_failure_keeps_the_partial_text_and_raises_a_notice() {
        let mut client =
            offline_client(vec![ScriptedTurn::failing(&["par", "tial"], "upstream 500")]);

        let handle = client.send("hello").expect("send accepted");
        drive_turn(&mut client, handle).await;

        assert_eq!(client.status(), SendStatus::Idle);
        let assistant = &client.messages()[1];
        assert_eq!(assistant.text(), "partial");
        assert_eq!(
            assistant.status,
            MessageStatus::Error("upstream 500".to_string())
        );

        let notices = client.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], Notice::StreamFailed { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn attachments_are_spent_on_send_and_travel_with_the_user_message() {
        let mut client = offline_client(vec![ScriptedTurn::completing(&["ok"])]);

        let upload_handle = client.upload(vec![FileUpload::new(
            "photo.png",
            "image/png",
            vec![1, 2, 3],
        )]);
        drive_uploads(&mut client, upload_handle).await;
        assert_eq!(client.pending_attachments().len(), 1);

        let handle = client.send("look at this").expect("send accepted");

        assert!(client.pending_attachments().is_empty());
        assert!(client.pending_files().is_empty());
        assert_eq!(client.messages()[0].attachments.len(), 1);
        assert_eq!(client.messages()[0].attachments[0].content_type, "image/png");

        drive_turn(&mut client, handle).await;
        assert_eq!(client.status(), SendStatus::Idle);
    }

    #[test]
    fn a_rejected_send_leaves_pending_attachments_alone() {
        let mut client = offline_client(vec![ScriptedTurn::completing(&["slow"])]);
        let _pending = client.send("first").expect("first send accepted");

        // Simulate an already-resolved upload sitting in the tray.
        let upload_handle = client.upload(vec![FileUpload::new(
            "doc.pdf",
            "application/pdf",
            vec![9; 4],
        )]);
        drop(upload_handle);
        let ticket = client.pending_files()[0].ticket;
        client.apply_upload_event(UploadEvent {
            ticket,
            payload: crate::uploader::UploadEventPayload::Stored(visor_files::StoredFile::new(
                "k1",
                "application/pdf",
                "memory://files/k1/doc.pdf",
            )),
        });
        assert_eq!(client.pending_attachments().len(), 1);

        let error = client.send("second").err().expect("busy send must fail");
        assert!(matches!(error, ChatError::SendRejectedBusy { .. }));
        assert_eq!(client.pending_attachments().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upload_failures_surface_a_notice_and_spare_the_siblings() {
        let mut client = ChatClient::new(
            Arc::new(ScriptedBackend::new(Vec::new())),
            Arc::new(MemoryFileStore::new().with_failing_file("bad.png")),
        );

        let handle = client.upload(vec![
            FileUpload::new("good.png", "image/png", vec![1; 4]),
            FileUpload::new("bad.png", "image/png", vec![2; 4]),
        ]);
        drive_uploads(&mut client, handle).await;

        assert_eq!(client.pending_attachments().len(), 1);
        let notices = client.take_notices();
        assert!(matches!(
            &notices[..],
            [Notice::UploadFailed { file_name, .. }] if file_name == "bad.png"
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn switching_sessions_detaches_the_in_flight_response() {
        let mut client = offline_client(vec![ScriptedTurn::completing(&["Hi", " there"])]);
        let original_id = client.active_session_id();

        let handle = client.send("hello").expect("send accepted");

        // The user opens a fresh chat while the reply is still streaming.
        let new_id = client.create_session();
        assert_eq!(client.active_session_id(), new_id);
        assert!(client.messages().is_empty());

        // Late events for the detached turn are dropped, not misrouted.
        drive_turn(&mut client, handle).await;
        assert!(client.messages().is_empty());

        client.switch_session(original_id).expect("original exists");
        assert_eq!(client.messages().len(), 1);
        assert_eq!(client.messages()[0].text(), "hello");
        assert_eq!(client.status(), SendStatus::Idle);
    }

    #[test]
    fn switching_to_an_unknown_session_reports_not_found() {
        let mut client = offline_client(Vec::new());
        let active_before = client.active_session_id();

        let error = client
            .switch_session(SessionId::generate())
            .err()
            .expect("unknown session must fail");

        assert!(matches!(error, ChatError::SessionNotFound { .. }));
        assert_eq!(client.active_session_id(), active_before);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sessions_keep_their_own_histories_across_switches() {
        let mut client = offline_client(vec![
            ScriptedTurn::completing(&["first reply"]),
            ScriptedTurn::completing(&["second reply"]),
        ]);
        let first_id = client.active_session_id();

        let handle = client.send("one").expect("send accepted");
        drive_turn(&mut client, handle).await;

        let second_id = client.create_session();
        let handle = client.send("two").expect("send accepted");
        drive_turn(&mut client, handle).await;
        assert_eq!(client.messages().len(), 2);

        client.switch_session(first_id).expect("first exists");
        assert_eq!(client.messages()[0].text(), "one");
        assert_eq!(client.messages()[1].text(), "first reply");

        client.switch_session(second_id).expect("second exists");
        assert_eq!(client.messages()[1].text(), "second reply");
    }

    #[test]
    fn a_synchronous_backend_refusal_rolls_back_the_gate() {
        // No scripted turns: stream_chat fails synchronously.
        let mut client = offline_client(Vec::new());

        let error = client.send("hello").err().expect("exhausted script fails");
        assert!(matches!(error, ChatError::Backend { .. }));

        // The optimistic user message stays, but the session can send again.
        assert_eq!(client.messages().len(), 1);
        assert_eq!(client.status(), SendStatus::Idle);
    }
}
