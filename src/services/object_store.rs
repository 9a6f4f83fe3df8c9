//! The object-store collaborator: listing directories, streaming objects
//! out, reading per-object headers and publishing new objects.

use crate::services::local_store::LocalStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sqlx::SqlitePool;
use std::{collections::HashMap, future::Future, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::AsyncBufRead;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid store path `{0}`")]
    InvalidPath(String),
    #[error("unsupported store url `{0}`")]
    Unsupported(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A readable object body.
pub type ObjectReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// A body being written, chunk by chunk.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub etag: Option<String>,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Entries directly under `dir`, sorted by name.
    async fn list(&self, dir: &str) -> StoreResult<Vec<ListEntry>>;

    async fn get(&self, path: &str) -> StoreResult<ObjectReader>;

    async fn info(&self, path: &str) -> StoreResult<ObjectInfo>;

    /// Write `body` to `path`. The object becomes visible only once the
    /// whole body was written; a failed upload leaves no object behind.
    async fn put(
        &self,
        path: &str,
        body: ByteStream,
        headers: HashMap<String, String>,
    ) -> StoreResult<ObjectInfo>;
}

/// Open the backend named by `url`. Only `file://<root>` is served locally.
pub fn connect(url: &str, db: Arc<SqlitePool>) -> StoreResult<Arc<dyn ObjectStore>> {
    match url.strip_prefix("file://") {
        Some(root) if !root.is_empty() => Ok(Arc::new(LocalStore::new(db, root))),
        _ => Err(StoreError::Unsupported(url.to_string())),
    }
}

/// Run a store operation under a deadline.
pub async fn timed<T>(
    limit: Duration,
    op: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// Join store path components with a single `/`.
pub fn join(dir: &str, name: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// A one-chunk body for small payloads built in memory.
pub fn body_from(bytes: impl Into<Bytes>) -> ByteStream {
    let chunk: Bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(chunk) }))
}
