//! Manifest summarizer.
//!
//! Streams a storage node's manifest one line at a time and folds every
//! object into three accumulators: per account, per tombstone date, and the
//! node-wide totals. Nothing per-object is retained.

use crate::models::summary::{
    GroupStats, Kilobytes, NodeSummary, TOMBSTONE_ACCOUNT, is_tombstone_date,
};
use std::{collections::BTreeMap, io};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// The fields of one manifest line that the summary uses.
#[derive(Debug, PartialEq, Eq)]
struct ObjectRecord<'a> {
    account: &'a str,
    tombstone_date: Option<&'a str>,
    bytes: u128,
    kilobytes: Kilobytes,
}

/// Parse `path logical_bytes <ignored> physical_kilobytes ...`.
///
/// Absolute paths look like `/<namespace>/<account>/...`; relative paths
/// start at the account. Only a dated directory under `tombstone` opens a
/// tombstone bucket; anything else there counts toward the account alone.
fn parse_line(line: &str) -> Option<ObjectRecord<'_>> {
    let mut fields = line.split_whitespace();
    let path = fields.next()?;
    let bytes = fields.next()?.parse().ok()?;
    fields.next()?;
    let kilobytes = fields.next()?.parse().ok()?;

    let mut segments = path.split('/');
    if path.starts_with('/') {
        segments.next();
        segments.next();
    }
    let account = segments.next().filter(|s| !s.is_empty())?;
    let tombstone_date = if account == TOMBSTONE_ACCOUNT {
        segments.next().filter(|s| is_tombstone_date(s))
    } else {
        None
    };

    Some(ObjectRecord {
        account,
        tombstone_date,
        bytes,
        kilobytes,
    })
}

#[derive(Debug, Default)]
pub struct Summarizer {
    accounts: BTreeMap<String, GroupStats>,
    tombstones: BTreeMap<String, GroupStats>,
    totals: GroupStats,
    skipped_lines: u64,
}

impl Summarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one manifest line into the accumulators; malformed lines are
    /// counted and skipped.
    pub fn observe(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(record) = parse_line(line) else {
            debug!(line, "skipping malformed manifest line");
            self.skipped_lines += 1;
            return;
        };

        if let Some(date) = record.tombstone_date {
            self.tombstones
                .entry(date.to_string())
                .or_default()
                .add(record.bytes, record.kilobytes);
        }
        self.accounts
            .entry(record.account.to_string())
            .or_default()
            .add(record.bytes, record.kilobytes);
        self.totals.add(record.bytes, record.kilobytes);
    }

    pub fn finish(self) -> NodeSummary {
        NodeSummary::from_groups(self.accounts, self.tombstones, self.totals)
    }

    /// Summarize an entire manifest stream. A read error anywhere fails the
    /// whole summary; no partial result is returned.
    pub async fn summarize<R>(reader: R) -> io::Result<NodeSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summarizer = Self::new();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            summarizer.observe(&line);
        }
        if summarizer.skipped_lines > 0 {
            warn!(
                skipped = summarizer.skipped_lines,
                "manifest contained malformed lines"
            );
        }
        Ok(summarizer.finish())
    }
}
