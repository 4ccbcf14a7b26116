use snafu::Snafu;

use crate::message::SessionId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("send rejected: message text is empty and no attachments are pending"))]
    SendRejectedEmptyInput { stage: &'static str },
    #[snafu(display("send rejected: session {session_id} already has a response in flight"))]
    SendRejectedBusy {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session {session_id} was not found"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("backend refused the stream request on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: visor_llm::BackendError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
