//! `pipelines` table operations: identity allocation and the monotonic run counter
//! (spec.md §4.3).

use super::{Db, StorageError};
use tubular_core::models::PipelineStatus;

/// A pipeline's identity plus its most recent run on `branch`, for the
/// `GET /api/pipelines?branch=` listing (spec.md §6).
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub path: String,
    pub last_start_ms: u64,
    pub last_status: PipelineStatus,
}

impl Db {
    /// Returns the pipeline's id, creating a `pipelines` row with `next_run = 1` if
    /// `path` is not yet known.
    pub fn get_or_create_pipeline_id(&self, path: &str) -> Result<i64, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        if let Some(id) = conn
            .query_row(
                "SELECT id FROM pipelines WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
                e => StorageError::Sqlite(e),
            })
            .ok()
        {
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO pipelines (path, next_run) VALUES (?1, 1)",
            [path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically increments `next_run` and returns `(id, runNum)`. Creates the
    /// pipeline with `next_run = 1` (returning `run_num = 1`) if absent.
    pub fn allocate_next_run(&self, path: &str) -> Result<(i64, i64), StorageError> {
        let mut conn = self.conn.lock().expect("run database lock poisoned");
        let tx = conn.transaction()?;

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, next_run FROM pipelines WHERE path = ?1",
                [path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let (id, run_num) = match existing {
            Some((id, next_run)) => {
                tx.execute(
                    "UPDATE pipelines SET next_run = next_run + 1 WHERE id = ?1",
                    [id],
                )?;
                (id, next_run)
            }
            None => {
                tx.execute(
                    "INSERT INTO pipelines (path, next_run) VALUES (?1, 2)",
                    [path],
                )?;
                (tx.last_insert_rowid(), 1)
            }
        };

        tx.commit()?;
        Ok((id, run_num))
    }

    /// Every pipeline with at least one run on `branch`, alongside that run's
    /// status and start time (spec.md §6 `GET /api/pipelines?branch=`).
    pub fn list_pipelines_for_branch(&self, branch: &str) -> Result<Vec<PipelineSummary>, StorageError> {
        let conn = self.conn.lock().expect("run database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT p.path, r.start_ms, r.status
             FROM pipelines p
             JOIN runs r ON r.pipeline_id = p.id
             WHERE r.branch = ?1 AND r.run_num = (
                 SELECT MAX(run_num) FROM runs WHERE pipeline_id = p.id AND branch = ?1
             )
             ORDER BY p.path ASC",
        )?;
        let rows = stmt.query_map([branch], |row| {
            let status_str: String = row.get(2)?;
            Ok(PipelineSummary {
                path: row.get(0)?,
                last_start_ms: row.get::<_, i64>(1)? as u64,
                last_status: status_str.parse().unwrap_or(PipelineStatus::Error),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::tests::TestHarness;

    #[test]
    fn allocate_next_run_starts_at_one_and_increments() {
        let harness = TestHarness::new();
        let (id_a, run_a) = harness.allocate_next_run("pipelines/build.yaml").unwrap();
        let (id_b, run_b) = harness.allocate_next_run("pipelines/build.yaml").unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(run_a, 1);
        assert_eq!(run_b, 2);
    }

    #[test]
    fn distinct_paths_get_distinct_ids() {
        let harness = TestHarness::new();
        let (id_a, _) = harness.allocate_next_run("a.yaml").unwrap();
        let (id_b, _) = harness.allocate_next_run("b.yaml").unwrap();
        assert_ne!(id_a, id_b);
    }
}
