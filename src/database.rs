use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};

use crate::error::TapeFlowError;
use crate::schema::CREATE_SCHEMA_SQL;

pub const DB_FILENAME: &str = "tapeflow.db";

/// Accumulators consulted by the FITS scalar during planner queries.
///
/// A planner pass resets the gate with the free capacity it is planning
/// against; each FITS call admits a row while its size still fits and counts
/// admitted and examined rows.
#[derive(Debug, Default)]
pub struct FitsGate {
    state: Mutex<FitsState>,
}

#[derive(Debug, Default)]
struct FitsState {
    free: i64,
    num_found: i64,
    total: i64,
}

impl FitsGate {
    #[allow(dead_code)]
    pub fn reset(&self, free: i64) {
        let mut state = self.state.lock().expect("fits gate mutex poisoned");
        state.free = free;
        state.num_found = 0;
        state.total = 0;
    }

    /// (free, num_found, total) after the most recent planner pass.
    #[allow(dead_code)]
    pub fn counters(&self) -> (i64, i64, i64) {
        let state = self.state.lock().expect("fits gate mutex poisoned");
        (state.free, state.num_found, state.total)
    }

    fn admit(&self, size: i64) -> bool {
        let mut state = self.state.lock().expect("fits gate mutex poisoned");
        state.total += 1;
        if state.free >= size {
            state.free -= size;
            state.num_found += 1;
            true
        } else {
            false
        }
    }
}

/// The persistent two-table work queue.
///
/// A single connection is shared behind a mutex; holding the guard across a
/// `BEGIN`/`END` pair gives the process-wide write-transaction scope that
/// the queue invariants rely on. Nested transactions are forbidden.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    fits: Arc<FitsGate>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl Database {
    /// Opens the queue store, either in memory or as `tapeflow.db` within
    /// `db_dir`, and registers the FITS predicate.
    pub fn open(db_dir: Option<&Path>, in_memory: bool) -> Result<Self, TapeFlowError> {
        let fits = Arc::new(FitsGate::default());

        let (conn, path) = if in_memory {
            (Connection::open_in_memory()?, None)
        } else {
            let db_dir = db_dir.ok_or_else(|| {
                TapeFlowError::Error("No database directory configured".to_string())
            })?;

            if !db_dir.is_dir() {
                return Err(TapeFlowError::Error(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    db_dir.display()
                )));
            }

            let db_path = db_dir.join(DB_FILENAME);
            info!("Opening database: {}", db_path.display());

            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                    | OpenFlags::SQLITE_OPEN_SHARED_CACHE
                    | OpenFlags::SQLITE_OPEN_EXRESCODE,
            )?;

            (conn, Some(db_path))
        };

        let gate = Arc::clone(&fits);
        conn.create_scalar_function(
            "FITS",
            2,
            FunctionFlags::SQLITE_UTF8,
            move |ctx| {
                let size: i64 = ctx.get(1)?;
                Ok(gate.admit(size) as i64)
            },
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            fits,
            path,
        })
    }

    /// Removes a previous run's database file and its side journal.
    pub fn cleanup(db_dir: &Path) {
        let db_path = db_dir.join(DB_FILENAME);
        let journal = db_dir.join(format!("{DB_FILENAME}-journal"));
        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&journal);
    }

    /// Idempotent creation of `JOB_QUEUE` and `REQUEST_QUEUE`.
    pub fn create_tables(&self) -> Result<(), TapeFlowError> {
        self.conn().execute_batch(CREATE_SCHEMA_SQL)?;
        debug!("Queue tables ready");
        Ok(())
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    #[allow(dead_code)]
    pub fn fits_gate(&self) -> &FitsGate {
        &self.fits
    }

    /// Runs `f` inside the global write-transaction scope.
    ///
    /// The connection mutex is held across the whole `BEGIN`/`END` window.
    /// If `BEGIN` fails the guard drops and the error surfaces; if `f`
    /// fails the transaction is rolled back before the error surfaces.
    pub fn write_transaction<T, F>(&self, f: F) -> Result<T, TapeFlowError>
    where
        F: FnOnce(&Connection) -> Result<T, TapeFlowError>,
    {
        let conn = self.conn();

        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;

        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("END TRANSACTION")?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK TRANSACTION");
                Err(err)
            }
        }
    }

    /// Rows changed by the most recent statement on this connection.
    #[allow(dead_code)]
    pub fn last_updates(conn: &Connection) -> usize {
        conn.changes() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_in_memory() -> Database {
        let db = Database::open(None, true).expect("in-memory open should succeed");
        db.create_tables().expect("schema creation should succeed");
        db
    }

    #[test]
    fn test_open_on_disk_creates_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let db = Database::open(Some(temp_dir.path()), false);
        assert!(db.is_ok(), "Database creation should succeed with valid path");

        let db_path = temp_dir.path().join(DB_FILENAME);
        assert!(db_path.exists(), "Database file should exist");
    }

    #[test]
    fn test_open_with_invalid_dir() {
        let db = Database::open(Some(Path::new("/nonexistent/path/for/tapeflow")), false);
        assert!(db.is_err(), "Database creation should fail with invalid path");

        match db.unwrap_err() {
            TapeFlowError::Error(msg) => {
                assert!(msg.contains("does not exist"), "unexpected message: {msg}");
            }
            other => panic!("Expected TapeFlowError::Error, got {other:?}"),
        }
    }

    #[test]
    fn test_create_tables_is_idempotent() {
        let db = open_in_memory();
        db.create_tables().expect("second creation should also succeed");

        for table in ["JOB_QUEUE", "REQUEST_QUEUE"] {
            let count: i32 = db
                .conn()
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .expect("Should be able to query table existence");
            assert_eq!(count, 1, "Table '{table}' should exist exactly once");
        }
    }

    #[test]
    fn test_cleanup_removes_db_and_journal() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(DB_FILENAME);
        let journal = temp_dir.path().join(format!("{DB_FILENAME}-journal"));
        fs::write(&db_path, "stale").unwrap();
        fs::write(&journal, "stale").unwrap();

        Database::cleanup(temp_dir.path());

        assert!(!db_path.exists());
        assert!(!journal.exists());
    }

    #[test]
    fn test_fits_admits_until_capacity_spent() {
        let db = open_in_memory();

        db.conn()
            .execute_batch(
                "INSERT INTO JOB_QUEUE (OPERATION, REQ_NUM, TARGET_STATE, REPL_NUM, FILE_SIZE,
                     FS_ID_H, FS_ID_L, I_GEN, I_NUM, MTIME_SEC, MTIME_NSEC, LAST_UPD, FILE_STATE)
                 VALUES (2, 1, 0, -1, 600, 1, 1, 1, 101, 0, 0, 0, 2),
                        (2, 1, 0, -1, 500, 1, 1, 1, 102, 0, 0, 0, 2),
                        (2, 1, 0, -1, 300, 1, 1, 1, 103, 0, 0, 0, 2)",
            )
            .expect("fixture insert should succeed");

        db.fits_gate().reset(1000);

        let admitted: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM JOB_QUEUE WHERE FITS(I_NUM, FILE_SIZE) = 1",
                [],
                |row| row.get(0),
            )
            .expect("FITS query should run");

        // 600 fits, 500 no longer does, 300 still fits.
        assert_eq!(admitted, 2);

        let (free, num_found, total) = db.fits_gate().counters();
        assert_eq!(free, 100);
        assert_eq!(num_found, 2);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_write_transaction_rolls_back_on_error() {
        let db = open_in_memory();

        let result: Result<(), TapeFlowError> = db.write_transaction(|conn| {
            conn.execute(
                "INSERT INTO REQUEST_QUEUE (OPERATION, REQ_NUM, TAPE_ID, TIME_ADDED, STATE)
                 VALUES (0, 7, 'T00001L6', 0, 0)",
                [],
            )?;
            Err(TapeFlowError::Error("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM REQUEST_QUEUE", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "failed transaction should leave no rows behind");
    }

    #[test]
    fn test_job_uniqueness_constraints() {
        let db = open_in_memory();

        let insert = "INSERT INTO JOB_QUEUE (OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE, REPL_NUM,
                FILE_SIZE, FS_ID_H, FS_ID_L, I_GEN, I_NUM, MTIME_SEC, MTIME_NSEC, LAST_UPD, FILE_STATE)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

        db.conn()
            .execute(
                insert,
                rusqlite::params![0, "/fs/a", 1, 0, -1, 10, 1, 2, 3, 4, 0, 0, 0, 2],
            )
            .expect("first insert should succeed");

        // Same (FILE_NAME, REPL_NUM) pair.
        let dup_name = db.conn().execute(
            insert,
            rusqlite::params![0, "/fs/a", 2, 0, -1, 10, 9, 9, 9, 9, 0, 0, 0, 2],
        );
        assert!(dup_name.is_err(), "duplicate (file_name, repl_num) must be rejected");

        // Same (FS_ID_H, FS_ID_L, I_GEN, I_NUM, REPL_NUM) tuple.
        let dup_uid = db.conn().execute(
            insert,
            rusqlite::params![0, "/fs/b", 2, 0, -1, 10, 1, 2, 3, 4, 0, 0, 0, 2],
        );
        assert!(dup_uid.is_err(), "duplicate file uid must be rejected");
    }

    #[test]
    fn test_last_updates() {
        let db = open_in_memory();

        db.conn()
            .execute(
                "INSERT INTO REQUEST_QUEUE (OPERATION, REQ_NUM, TAPE_ID, TIME_ADDED, STATE)
                 VALUES (0, 1, 'T00001L6', 0, 0)",
                [],
            )
            .unwrap();
        assert_eq!(Database::last_updates(&db.conn()), 1);
    }
}
