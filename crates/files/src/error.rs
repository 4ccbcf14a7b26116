use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FilesError {
    #[snafu(display("refusing to store '{file_name}': upload has no bytes"))]
    EmptyUpload {
        stage: &'static str,
        file_name: String,
    },
    #[snafu(display("storage service rejected '{file_name}': {reason}"))]
    StoreRejected {
        stage: &'static str,
        file_name: String,
        reason: String,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("storage endpoint returned status {status}: {body}"))]
    UploadStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse storage response: {source}"))]
    UploadPayloadParse {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type FilesResult<T> = Result<T, FilesError>;
