//! `runs` table operations (spec.md §4.3).

use super::{Db, StorageError};
use tubular_core::models::PipelineStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub pipeline_id: i64,
    pub branch: String,
    pub run_num: i64,
    pub start_ms: u64,
    pub duration_ms: u64,
    pub status: PipelineStatus,
    pub meta_json: String,
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let status_str: String = row.get(5)?;
    let status = status_str.parse().unwrap_or(PipelineStatus::Error);
    Ok(Run {
        pipeline_id: row.get(0)?,
        branch: row.get(1)?,
        run_num: row.get(2)?,
        start_ms: row.get::<_, i64>(3)? as u64,
        duration_ms: row.get::<_, i64>(4)? as u64,
        status,
        meta_json: row.get(6)?,
    })
}

impl Db {
    /// Inserts a `Running` run row; if `max_runs > 0` and the pipeline now has more
    /// than `max_runs` rows, deletes the oldest excess (by `run_num` ascending) and
    /// returns their run numbers so the caller can delete their artifact
    /// directories (spec.md §4.9 step 8).
    pub fn insert_run(
        &self,
        id: i64,
        run_num: i64,
        branch: &str,
        start_ms: u64,
        max_runs: i64,
    ) -> Result<Vec<i64>, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        conn.execute(
            "INSERT INTO runs (pipeline_id, branch, run_num, start_ms, duration_ms, status, meta_json)
             VALUES (?1, ?2, ?3, ?4, 0, 'Running', '{}')",
            rusqlite::params![id, branch, run_num, start_ms as i64],
        )?;

        if max_runs <= 0 {
            return Ok(Vec::new());
        }

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE pipeline_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let excess = total - max_runs;
        if excess <= 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT run_num FROM runs WHERE pipeline_id = ?1 ORDER BY run_num ASC LIMIT ?2",
        )?;
        let evicted: Vec<i64> = stmt
            .query_map(rusqlite::params![id, excess], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for run_num in &evicted {
            conn.execute(
                "DELETE FROM runs WHERE pipeline_id = ?1 AND run_num = ?2",
                rusqlite::params![id, run_num],
            )?;
        }

        Ok(evicted)
    }

    pub fn finalize_run(
        &self,
        id: i64,
        run_num: i64,
        duration_ms: u64,
        status: PipelineStatus,
        meta_json: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        let updated = conn.execute(
            "UPDATE runs SET duration_ms = ?1, status = ?2, meta_json = ?3
             WHERE pipeline_id = ?4 AND run_num = ?5",
            rusqlite::params![duration_ms as i64, status.to_string(), meta_json, id, run_num],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn last_run(&self, id: i64) -> Result<Option<Run>, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        let result = conn.query_row(
            "SELECT pipeline_id, branch, run_num, start_ms, duration_ms, status, meta_json
             FROM runs WHERE pipeline_id = ?1 ORDER BY run_num DESC LIMIT 1",
            [id],
            row_to_run,
        );
        match result {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs for pipeline `id`, newest first.
    pub fn runs(&self, id: i64) -> Result<Vec<Run>, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT pipeline_id, branch, run_num, start_ms, duration_ms, status, meta_json
             FROM runs WHERE pipeline_id = ?1 ORDER BY run_num DESC",
        )?;
        let rows = stmt.query_map([id], row_to_run)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// The statuses of the 50 most recently started runs across all pipelines.
    pub fn last50_statuses(&self) -> Result<Vec<PipelineStatus>, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        let mut stmt =
            conn.prepare("SELECT status FROM runs ORDER BY start_ms DESC LIMIT 50")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| s.parse().unwrap_or(PipelineStatus::Error))
            .collect())
    }

    pub fn run_meta(&self, id: i64, run_num: i64) -> Result<String, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        conn.query_row(
            "SELECT meta_json FROM runs WHERE pipeline_id = ?1 AND run_num = ?2",
            rusqlite::params![id, run_num],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            e => StorageError::Sqlite(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::tests::TestHarness;
    use tubular_core::models::PipelineStatus;

    #[test]
    fn insert_run_evicts_oldest_beyond_max_runs() {
        let harness = TestHarness::new();
        let (id, _) = harness.allocate_next_run("p").unwrap();

        for run_num in 1..=3 {
            harness.insert_run(id, run_num, "main", run_num as u64, 2).unwrap();
        }

        let remaining = harness.runs(id).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.run_num != 1));
    }

    #[test]
    fn finalize_run_updates_status_and_duration() {
        let harness = TestHarness::new();
        let (id, run_num) = harness.allocate_next_run("p").unwrap();
        harness.insert_run(id, run_num, "main", 0, 0).unwrap();

        harness
            .finalize_run(id, run_num, 1234, PipelineStatus::Success, "{\"ok\":true}")
            .unwrap();

        let run = harness.last_run(id).unwrap().unwrap();
        assert_eq!(run.status, PipelineStatus::Success);
        assert_eq!(run.duration_ms, 1234);
        assert_eq!(run.meta_json, "{\"ok\":true}");
    }

    #[test]
    fn runs_are_returned_newest_first() {
        let harness = TestHarness::new();
        let (id, _) = harness.allocate_next_run("p").unwrap();
        for run_num in 1..=3 {
            harness.insert_run(id, run_num, "main", run_num as u64, 0).unwrap();
        }
        let runs = harness.runs(id).unwrap();
        assert_eq!(runs.iter().map(|r| r.run_num).collect::<Vec<_>>(), vec![3, 2, 1]);
    }
}
