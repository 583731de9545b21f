//! Remote drive access.
//!
//! [`RemoteDrive`] is the seam between the migration engine and Microsoft
//! Graph. Paths passed to it are slash-separated and relative to the drive
//! root (they include the configured source/destination folder).

pub mod auth;
pub mod client;
pub mod types;

#[cfg(test)]
pub mod memory;

use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use client::{DriveLocator, GraphDrive};
pub use types::{ByteRange, DriveItem, UploadSession};

/// File content as it arrives from the source
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Direct children of `folder` ("" is the drive root)
    async fn list_children(&self, folder: &str) -> Result<Vec<DriveItem>>;

    /// Stream a file's content, by item id when known, else by path
    async fn open_download(&self, remote_id: Option<&str>, path: &str) -> Result<ByteStream>;

    async fn item_exists(&self, path: &str) -> Result<bool>;

    /// Create `parent/name`; an existing folder is not an error
    async fn create_folder(&self, parent: &str, name: &str) -> Result<()>;

    /// Single-request upload of everything `body` yields
    async fn put_content(&self, path: &str, body: ByteStream) -> Result<()>;

    async fn create_upload_session(&self, path: &str, name: &str) -> Result<UploadSession>;

    /// Send one ordered chunk of an upload session
    async fn upload_chunk(&self, session: &UploadSession, range: ByteRange, chunk: Bytes) -> Result<()>;
}
