//! Data shapes shared across the rollup pipeline.
//!
//! `summary` holds the per-node accumulators and their tab-separated artifact
//! format; `region` holds the serialized records of the regional report.

pub mod region;
pub mod summary;
