use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ensure;

use crate::error::{EmptyUploadSnafu, FilesResult, StoreRejectedSnafu};
use crate::types::{FileUpload, StoredFile};
use crate::{BoxFuture, FileStore};

const MEMORY_STORE_BASE_URL: &str = "memory://files";

/// In-memory storage collaborator for offline runs and tests.
///
/// Hands out synthetic keys/urls without keeping the bytes. File names listed
/// as failing are rejected, which is how failure paths are exercised without
/// a misbehaving network.
pub struct MemoryFileStore {
    next_key: AtomicU64,
    failing_file_names: HashSet<String>,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self {
            next_key: AtomicU64::new(1),
            failing_file_names: HashSet::new(),
        }
    }

    pub fn with_failing_file(mut self, file_name: impl Into<String>) -> Self {
        self.failing_file_names.insert(file_name.into());
        self
    }

    fn store_upload(&self, upload: FileUpload) -> FilesResult<StoredFile> {
        ensure!(
            !upload.bytes.is_empty(),
            EmptyUploadSnafu {
                stage: "memory-store-validate",
                file_name: upload.file_name.clone(),
            }
        );

        ensure!(
            !self.failing_file_names.contains(&upload.file_name),
            StoreRejectedSnafu {
                stage: "memory-store-scripted-failure",
                file_name: upload.file_name.clone(),
                reason: "file name is on the scripted failure list".to_string(),
            }
        );

        let sequence = self.next_key.fetch_add(1, Ordering::Relaxed);
        let key = format!("file-{sequence:04}");
        let url = format!("{MEMORY_STORE_BASE_URL}/{key}/{}", upload.file_name);

        Ok(StoredFile::new(key, upload.content_type, url))
    }
}

impl FileStore for MemoryFileStore {
    fn store(&self, upload: FileUpload) -> BoxFuture<'_, FilesResult<StoredFile>> {
        let result = self.store_upload(upload);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilesError;

    fn upload(name: &str) -> FileUpload {
        FileUpload::new(name, "image/png", vec![1, 2, 3])
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stored_files_get_sequential_keys_and_resolvable_urls() {
        let store = MemoryFileStore::new();

        let first = store.store(upload("a.png")).await.expect("store a");
        let second = store.store(upload("b.png")).await.expect("store b");

        assert_eq!(first.key, "file-0001");
        assert_eq!(second.key, "file-0002");
        assert_eq!(first.url, "memory://files/file-0001/a.png");
        assert_eq!(first.content_type, "image/png");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_failures_reject_only_the_listed_name() {
        let store = MemoryFileStore::new().with_failing_file("bad.png");

        let error = store
            .store(upload("bad.png"))
            .await
            .err()
            .expect("listed name must fail");
        assert!(matches!(error, FilesError::StoreRejected { .. }));

        store
            .store(upload("good.png"))
            .await
            .expect("unlisted name still stores");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_uploads_are_rejected() {
        let store = MemoryFileStore::new();
        let error = store
            .store(FileUpload::new("hollow.txt", "text/plain", Vec::new()))
            .await
            .err()
            .expect("empty upload must fail");
        assert!(matches!(error, FilesError::EmptyUpload { .. }));
    }
}
