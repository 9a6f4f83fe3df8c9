//! Test doubles: an in-memory SQLite pool and an in-memory object store with
//! fault injection and call accounting.

use crate::services::object_store::{
    ByteStream, EntryKind, ListEntry, ObjectInfo, ObjectReader, ObjectStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::io::StreamReader;

/// One-connection in-memory database with the schema applied.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let pool = Arc::new(pool);
    crate::run_migrations(&pool).await.unwrap();
    pool
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, (Bytes, HashMap<String, String>)>>,
    broken_reads: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    failing_put_prefix: Mutex<Option<String>>,
    gets: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn insert(&self, path: &str, body: impl Into<Bytes>, headers: &[(&str, &str)]) {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (body.into(), headers));
    }

    /// Reads of `path` fail after the first half of the body.
    pub fn break_reads(&self, path: &str) {
        self.broken_reads.lock().unwrap().insert(path.to_string());
    }

    pub fn delay_reads(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn fail_puts_under(&self, prefix: &str) {
        *self.failing_put_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn get_count(&self, path: &str) -> usize {
        self.gets.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .map(|(body, _)| String::from_utf8_lossy(body).into_owned())
    }

    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    async fn maybe_delay(&self, path: &str) {
        let delay = self.delays.lock().unwrap().get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, dir: &str) -> StoreResult<Vec<ListEntry>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut found = BTreeMap::new();
        for path in self.objects.lock().unwrap().keys() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((sub, _)) => found.insert(sub.to_string(), EntryKind::Directory),
                    None => found.insert(rest.to_string(), EntryKind::Object),
                };
            }
        }
        if found.is_empty() {
            return Err(StoreError::NotFound(dir.to_string()));
        }
        Ok(found
            .into_iter()
            .map(|(name, kind)| ListEntry { name, kind })
            .collect())
    }

    async fn get(&self, path: &str) -> StoreResult<ObjectReader> {
        self.gets.lock().unwrap().push(path.to_string());
        self.maybe_delay(path).await;
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let chunks: Vec<io::Result<Bytes>> = if self.broken_reads.lock().unwrap().contains(path) {
            vec![
                Ok(body.slice(..body.len() / 2)),
                Err(io::Error::other("connection reset by peer")),
            ]
        } else {
            vec![Ok(body)]
        };
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn info(&self, path: &str) -> StoreResult<ObjectInfo> {
        self.maybe_delay(path).await;
        let objects = self.objects.lock().unwrap();
        let (body, headers) = objects
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(ObjectInfo {
            path: path.to_string(),
            size: body.len() as u64,
            etag: None,
            headers: headers.clone(),
        })
    }

    async fn put(
        &self,
        path: &str,
        mut body: ByteStream,
        headers: HashMap<String, String>,
    ) -> StoreResult<ObjectInfo> {
        let failing = self.failing_put_prefix.lock().unwrap().clone();
        if failing.is_some_and(|prefix| path.starts_with(&prefix)) {
            return Err(StoreError::Io(io::Error::other("no space left on device")));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let size = buf.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (Bytes::from(buf), headers.clone()));
        Ok(ObjectInfo {
            path: path.to_string(),
            size,
            etag: None,
            headers,
        })
    }
}
