//! Records that make up the region-wide report.

use serde::{Deserialize, Serialize};

pub const UNKNOWN_DATACENTER: &str = "Unknown";

/// Reclaimable space in one tombstone date bucket of a node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TombstoneEntry {
    pub date: String,
    pub objects: u64,
    pub kilobytes: f64,
}

/// One storage node's line in the region report.
///
/// `storage_id` is unique within a report; nodes that could not be
/// summarized are left out rather than reported as zero.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub datacenter: String,
    pub storage_id: String,
    pub kilobytes: f64,
    pub objects: u64,
    pub avg: f64,
    pub tombstone: Vec<TombstoneEntry>,
}

/// The published document is a bare JSON array of node records.
pub type RegionAggregate = Vec<NodeRecord>;
