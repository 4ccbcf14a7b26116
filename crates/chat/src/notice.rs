use crate::message::SessionId;

/// User-visible signal for a locally recovered failure.
///
/// These are state, not log lines: the host drains them and renders whatever
/// affordance it has (toast, banner, inline row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    UploadFailed { file_name: String, reason: String },
    StreamFailed { session_id: SessionId, reason: String },
}
