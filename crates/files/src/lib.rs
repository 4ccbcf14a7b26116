use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod http;
pub mod memory;
pub mod types;

pub use error::{FilesError, FilesResult};
pub use http::HttpFileStore;
pub use memory::MemoryFileStore;
pub use types::{FileUpload, StoredFile};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// File storage seam: raw bytes in, a stable `{key, content_type, url}`
/// reference out.
pub trait FileStore: Send + Sync {
    fn store(&self, upload: FileUpload) -> BoxFuture<'_, FilesResult<StoredFile>>;
}
