//! Summary store accessor.
//!
//! Returns a node's summary from the pre-built artifact when one is present
//! and readable, otherwise derives it from the raw manifest and writes the
//! result back as the artifact for later runs.

use crate::{
    config::StoreLayout,
    errors::{RollupError, RollupResult},
    models::summary::NodeSummary,
    services::{
        object_store::{ObjectStore, StoreError, body_from, join, timed},
        summarizer::Summarizer,
    },
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const SUMMARY_CONTENT_TYPE: &str = "text/tab-separated-values";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Prebuilt,
    Derived,
}

#[derive(Debug)]
pub struct FetchedSummary {
    pub summary: NodeSummary,
    pub source: SummarySource,
}

#[derive(Clone)]
pub struct SummaryStore {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
    timeout: Duration,
}

impl SummaryStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout, timeout: Duration) -> Self {
        Self {
            store,
            layout,
            timeout,
        }
    }

    pub fn manifest_path(&self, node: &str) -> String {
        join(&self.layout.manifest_dir, node)
    }

    pub fn summary_path(&self, node: &str) -> String {
        join(&self.layout.summary_dir, node)
    }

    pub async fn get_summary(&self, node: &str) -> RollupResult<FetchedSummary> {
        let prebuilt_err = match self.fetch_prebuilt(node).await {
            Ok(summary) => {
                return Ok(FetchedSummary {
                    summary,
                    source: SummarySource::Prebuilt,
                });
            }
            Err(StoreError::NotFound(_)) => {
                debug!(node, "no pre-built summary, deriving from manifest");
                "not found".to_string()
            }
            Err(err) => {
                warn!(node, error = %err, "pre-built summary unusable, deriving from manifest");
                err.to_string()
            }
        };

        let summary = self.derive(node).await.map_err(|err| {
            RollupError::summary_unavailable(
                node,
                format!("pre-built summary: {prebuilt_err}; manifest: {err}"),
            )
        })?;
        self.publish(node, &summary).await;

        Ok(FetchedSummary {
            summary,
            source: SummarySource::Derived,
        })
    }

    async fn fetch_prebuilt(&self, node: &str) -> Result<NodeSummary, StoreError> {
        let path = self.summary_path(node);
        let text = timed(self.timeout, async {
            let mut reader = self.store.get(&path).await?;
            let mut text = String::new();
            reader.read_to_string(&mut text).await?;
            Ok::<_, StoreError>(text)
        })
        .await?;

        NodeSummary::parse_tsv(&text).map_err(|err| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{path}: {err}"),
            ))
        })
    }

    async fn derive(&self, node: &str) -> Result<NodeSummary, StoreError> {
        let path = self.manifest_path(node);
        timed(self.timeout, async {
            let reader = self.store.get(&path).await?;
            Ok::<_, StoreError>(Summarizer::summarize(reader).await?)
        })
        .await
    }

    /// Write a freshly derived summary back. The artifact is only a cache,
    /// so a failed write is logged and otherwise ignored.
    async fn publish(&self, node: &str, summary: &NodeSummary) {
        let path = self.summary_path(node);
        let headers = HashMap::from([(
            "content-type".to_string(),
            SUMMARY_CONTENT_TYPE.to_string(),
        )]);
        let body = body_from(summary.to_tsv());
        match timed(self.timeout, self.store.put(&path, body, headers)).await {
            Ok(obj) => info!(
                node,
                path = %obj.path,
                size = obj.size,
                etag = ?obj.etag,
                "published node summary"
            ),
            Err(err) => warn!(node, error = %err, "failed to publish node summary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::MemoryStore;

    const MANIFEST: &str = "/manta/acctA/o1 100 x 50\n/manta/tombstone/2020-01-01/o2 10 x 5\n";

    fn layout() -> StoreLayout {
        StoreLayout {
            manifest_dir: "/poseidon/stor/mako".into(),
            summary_dir: "/poseidon/stor/mako/summary".into(),
            report_dir: "/poseidon/stor/mako/rollup".into(),
        }
    }

    fn accessor(store: &Arc<MemoryStore>) -> SummaryStore {
        SummaryStore::new(store.clone(), layout(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn derives_and_caches_when_no_prebuilt_summary() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        let accessor = accessor(&store);

        let fetched = accessor.get_summary("1.stor").await.unwrap();
        assert_eq!(fetched.source, SummarySource::Derived);
        assert_eq!(fetched.summary.totals.as_ref().unwrap().objects, 2);

        let cached = store.contents("/poseidon/stor/mako/summary/1.stor").unwrap();
        assert_eq!(cached, fetched.summary.to_tsv());
    }

    #[tokio::test]
    async fn prebuilt_summary_skips_the_manifest() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        let accessor = accessor(&store);

        accessor.get_summary("1.stor").await.unwrap();
        let first = accessor.get_summary("1.stor").await.unwrap();
        let second = accessor.get_summary("1.stor").await.unwrap();

        assert_eq!(first.source, SummarySource::Prebuilt);
        assert_eq!(second.source, SummarySource::Prebuilt);
        assert_eq!(store.get_count("/poseidon/stor/mako/1.stor"), 1);
        assert_eq!(first.summary, second.summary);
    }

    #[tokio::test]
    async fn cached_summary_matches_the_derived_one() {
        let store = Arc::new(MemoryStore::default());
        store.insert(
            "/poseidon/stor/mako/1.stor",
            "/manta/tombstone_ops/o 10 x 5\n/manta/acctA/o 1 x 1\n",
            &[],
        );
        let accessor = accessor(&store);

        let derived = accessor.get_summary("1.stor").await.unwrap();
        let cached = accessor.get_summary("1.stor").await.unwrap();
        assert_eq!(derived.source, SummarySource::Derived);
        assert_eq!(cached.source, SummarySource::Prebuilt);
        assert_eq!(derived.summary, cached.summary);
        assert!(cached.summary.tombstones.is_empty());

        let account_objects: u64 = cached.summary.accounts.iter().map(|r| r.stats.objects).sum();
        assert_eq!(cached.summary.totals.unwrap().objects, account_objects);
    }

    #[tokio::test]
    async fn malformed_prebuilt_summary_falls_back() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        store.insert("/poseidon/stor/mako/summary/1.stor", "not\ta\tsummary", &[]);

        let fetched = accessor(&store).get_summary("1.stor").await.unwrap();
        assert_eq!(fetched.source, SummarySource::Derived);
        assert_eq!(fetched.summary.accounts.len(), 2);
    }

    #[tokio::test]
    async fn unreadable_manifest_is_unavailable_and_not_cached() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        store.break_reads("/poseidon/stor/mako/1.stor");

        let err = accessor(&store).get_summary("1.stor").await.unwrap_err();
        assert!(matches!(err, RollupError::NodeSummaryUnavailable { ref node, .. } if node == "1.stor"));
        assert!(store.paths_under("/poseidon/stor/mako/summary").is_empty());
    }

    #[tokio::test]
    async fn missing_everything_is_unavailable() {
        let store = Arc::new(MemoryStore::default());
        let err = accessor(&store).get_summary("ghost").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn failed_cache_write_still_returns_summary() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        store.fail_puts_under("/poseidon/stor/mako/summary");

        let fetched = accessor(&store).get_summary("1.stor").await.unwrap();
        assert_eq!(fetched.source, SummarySource::Derived);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_manifest_times_out() {
        let store = Arc::new(MemoryStore::default());
        store.insert("/poseidon/stor/mako/1.stor", MANIFEST, &[]);
        store.delay_reads("/poseidon/stor/mako/1.stor", Duration::from_secs(60));

        let err = accessor(&store).get_summary("1.stor").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
