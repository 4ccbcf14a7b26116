use std::collections::VecDeque;
use std::sync::Mutex;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    BackendResult, BackendStreamHandle, BackendWorker, ChatBackend, EmptyMessageSetSnafu,
    ScriptExhaustedSnafu, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
    make_event_stream,
};

/// Terminal outcome of one scripted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Complete,
    Fail(String),
}

/// One pre-recorded reply: its chunks and how the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedTurn {
    pub chunks: Vec<String>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedTurn {
    pub fn completing(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            outcome: ScriptedOutcome::Complete,
        }
    }

    pub fn failing(chunks: &[&str], reason: impl Into<String>) -> Self {
        Self {
            chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
            outcome: ScriptedOutcome::Fail(reason.into()),
        }
    }
}

/// Deterministic offline backend replaying pre-recorded turns.
///
/// Each `stream_chat` call consumes the next scripted turn in order; running
/// out of turns is a synchronous error so misconfigured runs fail loudly.
pub struct ScriptedBackend {
    turns: Mutex<VecDeque<ScriptedTurn>>,
}

impl ScriptedBackend {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
        }
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        self.turns.lock().ok().and_then(|mut turns| turns.pop_front())
    }

    async fn run_stream_worker(
        turn: ScriptedTurn,
        target: StreamTarget,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for chunk in turn.chunks {
            if !matches!(
                cancel_rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ) {
                tracing::debug!(target = ?target, "scripted stream cancelled");
                return;
            }

            if event_tx
                .send(StreamEvent {
                    target,
                    payload: StreamEventPayload::Delta(chunk),
                })
                .is_err()
            {
                return;
            }
        }

        let terminal = match turn.outcome {
            ScriptedOutcome::Complete => StreamEventPayload::Done,
            ScriptedOutcome::Fail(reason) => StreamEventPayload::Error(reason),
        };
        let _ = event_tx.send(StreamEvent {
            target,
            payload: terminal,
        });
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-echo"
    }

    fn stream_chat(&self, request: StreamRequest) -> BackendResult<BackendStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "scripted-stream-chat",
                target: request.target,
            }
        );

        let Some(turn) = self.next_turn() else {
            return ScriptExhaustedSnafu {
                stage: "scripted-stream-chat",
            }
            .fail();
        };

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: BackendWorker = Box::pin(Self::run_stream_worker(
            turn,
            request.target,
            event_tx,
            cancel_rx,
        ));

        Ok(BackendStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendMessage, Role, SessionKey, StreamSessionId};
    use uuid::Uuid;

    fn request(stream_id: u64) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(
                SessionKey::new(Uuid::now_v7()),
                StreamSessionId::new(stream_id),
            ),
            "scripted-echo",
            vec![BackendMessage::new(Role::User, "hello")],
        )
    }

    async fn drain(handle: BackendStreamHandle) -> Vec<StreamEventPayload> {
        let BackendStreamHandle { mut stream, worker } = handle;
        worker.await;

        let mut payloads = Vec::new();
        while let Some(event) = stream.try_recv() {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test(flavor = "current_thread")]
    async fn replays_chunks_then_completes() {
        let backend = ScriptedBackend::new([ScriptedTurn::completing(&["Hi", " there"])]);
        let handle = backend.stream_chat(request(1)).expect("turn available");

        let payloads = drain(handle).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("Hi".to_string()),
                StreamEventPayload::Delta(" there".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failing_turn_ends_with_an_error_event() {
        let backend = ScriptedBackend::new([ScriptedTurn::failing(&["partial"], "upstream 500")]);
        let handle = backend.stream_chat(request(1)).expect("turn available");

        let payloads = drain(handle).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("partial".to_string()),
                StreamEventPayload::Error("upstream 500".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelling_the_stream_stops_the_replay() {
        let backend = ScriptedBackend::new([ScriptedTurn::completing(&["a", "b", "c"])]);
        let BackendStreamHandle { mut stream, worker } =
            backend.stream_chat(request(1)).expect("turn available");

        stream.cancel();
        worker.await;

        // The worker observed the cancel signal before sending anything.
        assert_eq!(stream.try_recv(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exhausted_script_is_a_synchronous_error() {
        let backend = ScriptedBackend::new(Vec::new());
        let error = backend
            .stream_chat(request(1))
            .err()
            .expect("no turns remain");
        assert!(matches!(error, BackendError::ScriptExhausted { .. }));
    }
}
