//! src/services/local_store.rs
//!
//! LocalStore: an `ObjectStore` rooted in a local directory. Store paths map
//! one-to-one onto files beneath `root`, and per-object headers (such as the
//! `m-datacenter` tag a storage node attaches to its manifest) live in the
//! SQLite `object_metadata` table.

use crate::services::object_store::{
    ByteStream, EntryKind, ListEntry, ObjectInfo, ObjectReader, ObjectStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufReader},
};
use tracing::debug;
use uuid::Uuid;

const MAX_PATH_LEN: usize = 1024;
const TMP_PREFIX: &str = ".tmp-";
pub const ETAG_HEADER: &str = "etag";

#[derive(Clone)]
pub struct LocalStore {
    /// Pool holding the `object_metadata` table.
    pub db: Arc<SqlitePool>,

    /// Directory that store path `/` maps to.
    pub root: PathBuf,
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>, root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            root: root.into(),
        }
    }

    /// Store paths are absolute, `/`-separated and may not escape the root.
    fn ensure_path_safe(&self, path: &str) -> StoreResult<()> {
        let invalid = || StoreError::InvalidPath(path.to_string());
        if !path.starts_with('/') || path.len() > MAX_PATH_LEN {
            return Err(invalid());
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err(invalid());
        }
        if path
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    fn fs_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            full.push(seg);
        }
        full
    }

    async fn load_headers(&self, path: &str) -> StoreResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM object_metadata WHERE path = ?")
                .bind(path)
                .fetch_all(&*self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Replace every header row for `path` in one transaction.
    async fn save_headers(&self, path: &str, headers: &HashMap<String, String>) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM object_metadata WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        for (key, value) in headers {
            sqlx::query("INSERT INTO object_metadata (path, key, value) VALUES (?, ?, ?)")
                .bind(path)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, dir: &str) -> StoreResult<Vec<ListEntry>> {
        self.ensure_path_safe(dir)?;
        let mut reader = fs::read_dir(self.fs_path(dir))
            .await
            .map_err(|err| not_found_or(err, dir))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let kind = if entry.file_type().await?.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::Object
            };
            entries.push(ListEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get(&self, path: &str) -> StoreResult<ObjectReader> {
        self.ensure_path_safe(path)?;
        let file = File::open(self.fs_path(path))
            .await
            .map_err(|err| not_found_or(err, path))?;
        Ok(Box::new(BufReader::new(file)))
    }

    async fn info(&self, path: &str) -> StoreResult<ObjectInfo> {
        self.ensure_path_safe(path)?;
        let meta = fs::metadata(self.fs_path(path))
            .await
            .map_err(|err| not_found_or(err, path))?;
        if meta.is_dir() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let headers = self.load_headers(path).await?;
        Ok(ObjectInfo {
            path: path.to_string(),
            size: meta.len(),
            etag: headers.get(ETAG_HEADER).cloned(),
            headers,
        })
    }

    /// Stream-upload an object.
    ///
    /// - Writes chunks to a temporary file next to the destination.
    /// - Computes the MD5 etag and size while streaming.
    /// - Fsyncs, then renames into place and records headers.
    ///
    /// The temporary file is removed on any failure.
    async fn put(
        &self,
        path: &str,
        mut body: ByteStream,
        headers: HashMap<String, String>,
    ) -> StoreResult<ObjectInfo> {
        self.ensure_path_safe(path)?;
        let file_path = self.fs_path(path);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::InvalidPath(path.to_string())
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let etag = format!("{:x}", digest.compute());
        let mut headers = lowercase_keys(headers);
        headers.insert(ETAG_HEADER.to_string(), etag.clone());
        if let Err(err) = self.save_headers(path, &headers).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        debug!(path, size, etag = %etag, "stored object");

        Ok(ObjectInfo {
            path: path.to_string(),
            size,
            etag: Some(etag),
            headers,
        })
    }
}

fn lowercase_keys(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

fn not_found_or(err: io::Error, path: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(err)
    }
}
