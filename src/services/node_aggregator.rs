//! src/services/node_aggregator.rs
//!
//! NodeAggregator drives one rollup run. Every storage node found in the
//! manifest directory is taken through
//! `Pending -> SummaryFetched -> TotalsExtracted -> Appended`; a node that
//! fails on the way is logged, recorded in the run report and left out of
//! the region aggregate. Nodes are fetched and summarized concurrently, but
//! only the single loop in `run` appends to the aggregate, and a failed
//! append ends the run.

use crate::{
    config::StoreLayout,
    errors::{RollupError, RollupResult},
    models::region::{NodeRecord, UNKNOWN_DATACENTER},
    services::{
        object_store::{EntryKind, ObjectStore, timed},
        region_builder::RegionBuilder,
        summary_store::SummaryStore,
        tombstone,
    },
};
use futures::{StreamExt, stream};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DATACENTER_HEADER: &str = "m-datacenter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    SummaryFetched,
    TotalsExtracted,
    Appended,
}

/// A node that was left out of the aggregate, with the last state it reached.
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub state: NodeState,
    pub error: RollupError,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub attempted: usize,
    pub appended: usize,
    pub failed: Vec<NodeFailure>,
    /// Tombstone rows dropped for malformed keys, across all nodes.
    pub tombstone_warnings: usize,
    pub report_path: Option<String>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.tombstone_warnings == 0
    }
}

struct ProcessedNode {
    record: NodeRecord,
    tombstone_skipped: usize,
}

pub struct NodeAggregator {
    store: Arc<dyn ObjectStore>,
    summaries: SummaryStore,
    layout: StoreLayout,
    concurrency: usize,
    timeout: Duration,
}

impl NodeAggregator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: StoreLayout,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            summaries: SummaryStore::new(store.clone(), layout.clone(), timeout),
            store,
            layout,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Storage node ids: every object directly under the manifest directory.
    pub async fn list_nodes(&self) -> RollupResult<Vec<String>> {
        let entries = timed(self.timeout, self.store.list(&self.layout.manifest_dir)).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Object)
            .map(|e| e.name)
            .collect())
    }

    /// Best effort; any failure yields `Unknown`.
    async fn datacenter(&self, node: &str) -> String {
        let path = self.summaries.manifest_path(node);
        match timed(self.timeout, self.store.info(&path)).await {
            Ok(info) => info
                .headers
                .get(DATACENTER_HEADER)
                .filter(|dc| !dc.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| UNKNOWN_DATACENTER.to_string()),
            Err(err) => {
                debug!(node, error = %err, "datacenter lookup failed");
                UNKNOWN_DATACENTER.to_string()
            }
        }
    }

    async fn process_node(&self, node: String) -> Result<ProcessedNode, NodeFailure> {
        let datacenter = self.datacenter(&node).await;

        let fetched = match self.summaries.get_summary(&node).await {
            Ok(fetched) => fetched,
            Err(error) => {
                return Err(NodeFailure {
                    node,
                    state: NodeState::Pending,
                    error,
                });
            }
        };
        debug!(node = %node, source = ?fetched.source, state = ?NodeState::SummaryFetched, "summary ready");

        let Some(totals) = fetched.summary.totals.as_ref() else {
            return Err(NodeFailure {
                error: RollupError::TotalsMissing(node.clone()),
                node,
                state: NodeState::SummaryFetched,
            });
        };
        let tombstones = tombstone::extract(&fetched.summary, &node);
        debug!(
            node = %node,
            objects = totals.objects,
            tombstone_dates = tombstones.entries.len(),
            state = ?NodeState::TotalsExtracted,
            "totals extracted"
        );

        Ok(ProcessedNode {
            record: NodeRecord {
                datacenter,
                kilobytes: totals.kilobytes.as_f64(),
                objects: totals.objects,
                avg: totals.avg_kb(),
                tombstone: tombstones.entries,
                storage_id: node,
            },
            tombstone_skipped: tombstones.skipped,
        })
    }

    /// Process every node, then publish the region report.
    ///
    /// Per-node failures are collected in the returned report. A failure to
    /// append to or publish the aggregate is returned as an error and stops
    /// the run.
    pub async fn run(&self, mut builder: RegionBuilder) -> RollupResult<RunReport> {
        let nodes = self.list_nodes().await?;
        info!(nodes = nodes.len(), concurrency = self.concurrency, "starting rollup");

        let mut report = RunReport {
            run_id: builder.run_id(),
            attempted: nodes.len(),
            appended: 0,
            failed: Vec::new(),
            tombstone_warnings: 0,
            report_path: None,
        };

        let mut results = stream::iter(nodes)
            .map(|node| self.process_node(node))
            .buffer_unordered(self.concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(processed) => {
                    builder.append(&processed.record).await?;
                    debug!(node = %processed.record.storage_id, state = ?NodeState::Appended, "node recorded");
                    report.tombstone_warnings += processed.tombstone_skipped;
                }
                Err(failure) => {
                    warn!(
                        node = %failure.node,
                        state = ?failure.state,
                        error = %failure.error,
                        "node left out of region report"
                    );
                    report.failed.push(failure);
                }
            }
        }
        drop(results);
        report.appended = builder.appended();

        let path = builder
            .publish(self.store.as_ref(), &self.layout.report_dir)
            .await?;
        report.report_path = Some(path);

        info!(
            run_id = %report.run_id,
            attempted = report.attempted,
            appended = report.appended,
            failed = report.failed.len(),
            tombstone_warnings = report.tombstone_warnings,
            report = ?report.report_path,
            "rollup finished"
        );
        Ok(report)
    }
}
