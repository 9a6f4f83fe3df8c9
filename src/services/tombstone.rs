//! Turns a summary's `tombstone_<date>` rows into reclaimable-space entries.

use crate::{
    errors::{RollupError, RollupResult},
    models::{
        region::TombstoneEntry,
        summary::{NodeSummary, TOMBSTONE_DATE_FORMAT, TOMBSTONE_KEY_PREFIX, is_tombstone_date},
    },
};
use chrono::NaiveDate;
use tracing::warn;

#[derive(Debug, Default)]
pub struct TombstoneExtraction {
    pub entries: Vec<TombstoneEntry>,
    /// Rows whose key did not carry a valid date.
    pub skipped: usize,
}

/// Date part of a `tombstone_<YYYY-MM-DD>` key.
pub fn parse_tombstone_key(key: &str) -> RollupResult<String> {
    let parse_err = |reason: &str| RollupError::TombstoneParse {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let date = key
        .strip_prefix(TOMBSTONE_KEY_PREFIX)
        .ok_or_else(|| parse_err("missing `tombstone_` prefix"))?;
    NaiveDate::parse_from_str(date, TOMBSTONE_DATE_FORMAT)
        .map_err(|err| parse_err(&err.to_string()))?;
    if !is_tombstone_date(date) {
        return Err(parse_err("date is not zero-padded `YYYY-MM-DD`"));
    }
    Ok(date.to_string())
}

/// One entry per well-formed tombstone row, in summary order. Malformed
/// rows are logged and skipped.
pub fn extract(summary: &NodeSummary, node: &str) -> TombstoneExtraction {
    let mut out = TombstoneExtraction::default();
    for row in &summary.tombstones {
        match parse_tombstone_key(&row.key) {
            Ok(date) => out.entries.push(TombstoneEntry {
                date,
                objects: row.stats.objects,
                kilobytes: row.stats.kilobytes.as_f64(),
            }),
            Err(err) => {
                warn!(node, error = %err, "skipping tombstone row");
                out.skipped += 1;
            }
        }
    }
    out
}
