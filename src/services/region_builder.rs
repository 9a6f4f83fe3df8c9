//! Region aggregate builder.
//!
//! Every node record is journaled to SQLite as soon as it is produced, so an
//! interrupted run keeps its progress. The report itself is serialized once,
//! from the journal, and published only after every node was attempted.

use crate::{
    errors::{RollupError, RollupResult},
    models::region::{NodeRecord, RegionAggregate},
    services::object_store::{ObjectStore, body_from, join},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

pub struct RegionBuilder {
    db: Arc<SqlitePool>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    appended: usize,
}

impl RegionBuilder {
    /// Register a new run in the journal.
    pub async fn begin(db: Arc<SqlitePool>) -> RollupResult<Self> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        sqlx::query("INSERT INTO rollup_runs (run_id, started_at) VALUES (?, ?)")
            .bind(run_id.to_string())
            .bind(started_at)
            .execute(&*db)
            .await
            .map_err(RollupError::aggregate_write)?;

        Ok(Self {
            db,
            run_id,
            started_at,
            appended: 0,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Records journaled so far in this run.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Durably record one node. A second record for the same storage id in
    /// this run is rejected.
    pub async fn append(&mut self, record: &NodeRecord) -> RollupResult<()> {
        let json = serde_json::to_string(record).map_err(RollupError::aggregate_write)?;
        sqlx::query(
            "INSERT INTO node_records (run_id, seq, storage_id, record, appended_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(self.run_id.to_string())
        .bind(self.appended as i64)
        .bind(&record.storage_id)
        .bind(json)
        .bind(Utc::now())
        .execute(&*self.db)
        .await
        .map_err(|err| {
            RollupError::aggregate_write(format!("recording node `{}`: {err}", record.storage_id))
        })?;
        self.appended += 1;
        Ok(())
    }

    /// The run's records in append order, as the JSON report document.
    pub async fn finalize(&self) -> RollupResult<Vec<u8>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT record FROM node_records WHERE run_id = ? ORDER BY seq")
                .bind(self.run_id.to_string())
                .fetch_all(&*self.db)
                .await
                .map_err(RollupError::aggregate_write)?;

        let region: RegionAggregate = rows
            .into_iter()
            .map(|(json,)| serde_json::from_str(&json))
            .collect::<Result<_, _>>()
            .map_err(RollupError::aggregate_write)?;
        serde_json::to_vec_pretty(&region).map_err(RollupError::aggregate_write)
    }

    /// Upload the report as `<report_dir>/<run date>.json` and close the run.
    pub async fn publish(self, store: &dyn ObjectStore, report_dir: &str) -> RollupResult<String> {
        let document = self.finalize().await?;
        let path = join(
            report_dir,
            &format!("{}.json", self.started_at.format("%Y-%m-%d")),
        );
        let headers = HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]);

        let obj = store
            .put(&path, body_from(document), headers)
            .await
            .map_err(|err| RollupError::aggregate_write(format!("publishing {path}: {err}")))?;

        // The report is out; a stale run row only loses bookkeeping.
        if let Err(err) =
            sqlx::query("UPDATE rollup_runs SET completed_at = ?, report_path = ? WHERE run_id = ?")
                .bind(Utc::now())
                .bind(&path)
                .bind(self.run_id.to_string())
                .execute(&*self.db)
                .await
        {
            warn!(run_id = %self.run_id, path = %path, error = %err, "failed to mark run completed");
        }

        info!(
            run_id = %self.run_id,
            nodes = self.appended,
            path = %obj.path,
            size = obj.size,
            etag = ?obj.etag,
            "published region report"
        );
        Ok(path)
    }
}
