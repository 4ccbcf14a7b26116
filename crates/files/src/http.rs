use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use crate::error::{
    EmptyUploadSnafu, FilesResult, HttpRequestSnafu, UploadPayloadParseSnafu, UploadStatusSnafu,
};
use crate::types::{FileUpload, StoredFile};
use crate::{BoxFuture, FileStore};

/// Wire shape of the storage service's success payload.
#[derive(Debug, Deserialize)]
struct StoredFileResponse {
    key: String,
    content_type: String,
    url: String,
}

/// HTTP multipart client for the file storage service.
pub struct HttpFileStore {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpFileStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim().to_string(),
            api_token: None,
        }
    }

    pub fn with_api_token(mut self, api_token: impl Into<String>) -> Self {
        let api_token = api_token.into().trim().to_string();
        self.api_token = (!api_token.is_empty()).then_some(api_token);
        self
    }

    async fn store_upload(&self, upload: FileUpload) -> FilesResult<StoredFile> {
        ensure!(
            !upload.bytes.is_empty(),
            EmptyUploadSnafu {
                stage: "http-store-validate",
                file_name: upload.file_name.clone(),
            }
        );

        let part = Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .context(HttpRequestSnafu {
                stage: "http-store-build-part",
            })?;
        let form = Form::new().part("file", part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(api_token) = &self.api_token {
            request = request.bearer_auth(api_token);
        }

        let response = request.send().await.context(HttpRequestSnafu {
            stage: "http-store-send",
        })?;

        let status = response.status();
        let body = response.text().await.context(HttpRequestSnafu {
            stage: "http-store-read-body",
        })?;

        if !status.is_success() {
            return UploadStatusSnafu {
                stage: "http-store-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let payload: StoredFileResponse =
            serde_json::from_str(&body).context(UploadPayloadParseSnafu {
                stage: "http-store-parse-payload",
            })?;

        tracing::debug!(
            key = %payload.key,
            content_type = %payload.content_type,
            "stored file via http storage service"
        );

        Ok(StoredFile::new(
            payload.key,
            payload.content_type,
            payload.url,
        ))
    }
}

impl FileStore for HttpFileStore {
    fn store(&self, upload: FileUpload) -> BoxFuture<'_, FilesResult<StoredFile>> {
        Box::pin(self.store_upload(upload))
    }
}
