//! Error kinds raised by the rollup pipeline.
//!
//! Severity is carried by the variant: configuration and aggregate-write
//! errors abort the run, everything else is scoped to a single node (or a
//! single tombstone row) and only flags the final run status.

use crate::services::object_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RollupError {
    /// A required environment variable is absent or empty.
    #[error("required environment variable `{0}` is not set")]
    ConfigMissing(&'static str),

    #[error("invalid value for `{var}`: {reason}")]
    ConfigInvalid { var: &'static str, reason: String },

    /// Neither a pre-built summary nor the raw manifest produced a summary.
    #[error("summary for node `{node}` unavailable: {reason}")]
    NodeSummaryUnavailable { node: String, reason: String },

    #[error("summary for node `{0}` has no totals row")]
    TotalsMissing(String),

    #[error("malformed tombstone key `{key}`: {reason}")]
    TombstoneParse { key: String, reason: String },

    /// The region aggregate could not be persisted or published.
    #[error("aggregate write failed: {0}")]
    AggregateWrite(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RollupError {
    pub fn summary_unavailable(node: &str, reason: impl ToString) -> Self {
        Self::NodeSummaryUnavailable {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn aggregate_write(err: impl ToString) -> Self {
        Self::AggregateWrite(err.to_string())
    }
}

pub type RollupResult<T> = Result<T, RollupError>;

#[cfg(test)]
mod tests {
    use super::RollupError;

    #[test]
    fn messages_name_the_node() {
        let err = RollupError::summary_unavailable("3.stor.coal", "manifest missing");
        assert_eq!(
            err.to_string(),
            "summary for node `3.stor.coal` unavailable: manifest missing"
        );
    }
}
