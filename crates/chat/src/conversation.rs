use snafu::ensure;

use crate::error::{ChatResult, SendRejectedBusySnafu};
use crate::message::{Message, MessageId, MessageStatus, SessionId, StreamTarget};

/// Externally visible request/response status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendStatus {
    #[default]
    Idle,
    AwaitingResponse,
}

/// Stream bookkeeping for the turn currently in flight.
///
/// The assistant message id stays empty until the first increment arrives;
/// no placeholder message exists before the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlightTurn {
    target: StreamTarget,
    assistant_message_id: Option<MessageId>,
}

/// Conversation aggregate: one session's append-only message history plus the
/// gate that admits at most one streaming turn at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: SessionId,
    pub messages: Vec<Message>,
    in_flight: Option<InFlightTurn>,
}

impl Conversation {
    /// Creates an empty conversation in idle state.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            in_flight: None,
        }
    }

    pub fn send_status(&self) -> SendStatus {
        if self.in_flight.is_some() {
            SendStatus::AwaitingResponse
        } else {
            SendStatus::Idle
        }
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Returns true when incoming stream data matches the active turn.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        self.in_flight
            .is_some_and(|in_flight| in_flight.target == target)
    }

    /// Admits a new turn: appends the user message and arms the stream gate.
    ///
    /// Rejected while a previous turn is still in flight; the message list is
    /// left untouched in that case.
    pub fn begin_turn(&mut self, target: StreamTarget, user_message: Message) -> ChatResult<()> {
        ensure!(
            self.in_flight.is_none(),
            SendRejectedBusySnafu {
                stage: "begin-turn",
                session_id: self.id,
            }
        );

        self.messages.push(user_message);
        self.in_flight = Some(InFlightTurn {
            target,
            assistant_message_id: None,
        });
        Ok(())
    }

    /// Clears the stream gate after a synchronous backend refusal.
    ///
    /// The optimistically appended user message stays; only the in-flight
    /// marker is rolled back so the session can send again.
    pub fn abort_turn(&mut self, target: StreamTarget) {
        if self.accepts_stream_event(target) {
            self.in_flight = None;
        }
    }

    pub fn has_streaming_message(&self, target: StreamTarget) -> bool {
        self.accepts_stream_event(target)
            && self
                .in_flight
                .is_some_and(|in_flight| in_flight.assistant_message_id.is_some())
    }

    /// Creates the assistant message for the first increment of a turn.
    pub fn start_assistant(&mut self, target: StreamTarget, id: MessageId, first_chunk: String) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        if in_flight.target != target || in_flight.assistant_message_id.is_some() {
            return;
        }

        in_flight.assistant_message_id = Some(id);
        self.messages
            .push(Message::assistant_streaming(id, target.stream_id, first_chunk));
    }

    /// Appends one increment to the turn's assistant message.
    pub fn append_chunk(&mut self, target: StreamTarget, chunk: String) {
        let Some(assistant_message_id) = self.streaming_message_id(target) else {
            return;
        };

        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.id == assistant_message_id)
        {
            message.push_fragment(chunk);
        }
    }

    /// Finalizes the turn successfully and returns the gate to idle.
    pub fn complete_turn(&mut self, target: StreamTarget) {
        self.finalize_turn(target, MessageStatus::Done);
    }

    /// Finalizes the turn after a stream failure, keeping the partial text.
    pub fn fail_turn(&mut self, target: StreamTarget, reason: String) {
        self.finalize_turn(target, MessageStatus::Error(reason));
    }

    /// Detaches the in-flight turn, if any, and reports its target.
    ///
    /// Used on session switch: the partial assistant message is frozen and
    /// later events for the old target fail the acceptance check.
    pub fn detach_turn(&mut self) -> Option<StreamTarget> {
        let target = self.in_flight?.target;
        self.finalize_turn(target, MessageStatus::Detached);
        Some(target)
    }

    fn streaming_message_id(&self, target: StreamTarget) -> Option<MessageId> {
        self.in_flight
            .filter(|in_flight| in_flight.target == target)
            .and_then(|in_flight| in_flight.assistant_message_id)
    }

    fn finalize_turn(&mut self, target: StreamTarget, final_status: MessageStatus) {
        let Some(in_flight) = self.in_flight else {
            return;
        };
        if in_flight.target != target {
            return;
        }

        if let Some(assistant_message_id) = in_flight.assistant_message_id
            && let Some(message) = self
                .messages
                .iter_mut()
                .find(|message| message.id == assistant_message_id)
        {
            message.status = final_status;
        }

        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::message::StreamSessionId;

    fn conversation() -> (Conversation, StreamTarget) {
        let session_id = SessionId::generate();
        let target = StreamTarget::new(session_id, StreamSessionId::new(1));
        (Conversation::new(session_id), target)
    }

    fn user(id: u64, text: &str) -> Message {
        Message::user(MessageId::new(id), text, Vec::new())
    }

    #[test]
    fn begin_turn_appends_the_user_message_and_awaits() {
        let (mut conversation, target) = conversation();

        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("idle conversation admits a turn");

        assert_eq!(conversation.send_status(), SendStatus::AwaitingResponse);
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].text(), "hello");
    }

    #[test]
    fn a_second_turn_is_rejected_while_one_is_in_flight() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "first"))
            .expect("first turn admitted");

        let second_target = StreamTarget::new(conversation.id, StreamSessionId::new(2));
        let error = conversation
            .begin_turn(second_target, user(2, "second"))
            .err()
            .expect("second turn must be rejected");

        assert!(matches!(error, ChatError::SendRejectedBusy { .. }));
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn assistant_message_appears_only_with_the_first_chunk() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("turn admitted");
        assert_eq!(conversation.messages.len(), 1);

        conversation.start_assistant(target, MessageId::new(2), "Hi".to_string());
        conversation.append_chunk(target, " there".to_string());
        conversation.complete_turn(target);

        assert_eq!(conversation.send_status(), SendStatus::Idle);
        let assistant = &conversation.messages[1];
        assert_eq!(assistant.text(), "Hi there");
        assert_eq!(assistant.status, MessageStatus::Done);
    }

    #[test]
    fn failed_turn_keeps_the_partial_text() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("turn admitted");
        conversation.start_assistant(target, MessageId::new(2), "par".to_string());
        conversation.append_chunk(target, "tial".to_string());

        conversation.fail_turn(target, "upstream 500".to_string());

        assert_eq!(conversation.send_status(), SendStatus::Idle);
        let assistant = &conversation.messages[1];
        assert_eq!(assistant.text(), "partial");
        assert_eq!(
            assistant.status,
            MessageStatus::Error("upstream 500".to_string())
        );
    }

    #[test]
    fn zero_chunk_failure_leaves_no_assistant_message() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("turn admitted");

        conversation.fail_turn(target, "connect timeout".to_string());

        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.send_status(), SendStatus::Idle);
    }

    #[test]
    fn detach_freezes_the_partial_message_and_drops_later_events() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("turn admitted");
        conversation.start_assistant(target, MessageId::new(2), "Hi".to_string());

        assert_eq!(conversation.detach_turn(), Some(target));
        assert!(!conversation.accepts_stream_event(target));

        // Late chunks for the detached target must not mutate anything.
        conversation.append_chunk(target, " there".to_string());
        assert_eq!(conversation.messages[1].text(), "Hi");
        assert_eq!(conversation.messages[1].status, MessageStatus::Detached);
    }

    #[test]
    fn abort_rolls_back_the_gate_but_keeps_the_user_message() {
        let (mut conversation, target) = conversation();
        conversation
            .begin_turn(target, user(1, "hello"))
            .expect("turn admitted");

        conversation.abort_turn(target);

        assert_eq!(conversation.send_status(), SendStatus::Idle);
        assert_eq!(conversation.messages.len(), 1);
    }
}
