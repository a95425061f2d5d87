use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};

use crate::connector::RecInfo;
use crate::error::TapeFlowError;
use crate::fsobj::{FileState, Fuid};

/// Marker for columns that carry no value, e.g. the replica index of a
/// transparent recall.
pub const UNSET: i64 = -1;

const SQL_ADD_JOB: &str = "INSERT INTO JOB_QUEUE
        (OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE, REPL_NUM, FILE_SIZE,
         FS_ID_H, FS_ID_L, I_GEN, I_NUM, MTIME_SEC, MTIME_NSEC, LAST_UPD,
         TAPE_ID, FILE_STATE, START_BLOCK, CONN_INFO)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SQL_SET_RECALLING: &str = "UPDATE JOB_QUEUE SET FILE_STATE = ?1
     WHERE REQ_NUM = ?2 AND FILE_STATE = ?3 AND TAPE_ID = ?4";

// Jobs are worked in start-block order so the tape head moves monotonically.
const SQL_SELECT_RECALLING: &str = "SELECT FS_ID_H, FS_ID_L, I_GEN, I_NUM, FILE_NAME, FILE_STATE,
            TARGET_STATE, START_BLOCK, CONN_INFO
     FROM JOB_QUEUE
     WHERE REQ_NUM = ?1 AND (FILE_STATE = ?2 OR FILE_STATE = ?3) AND TAPE_ID = ?4
     ORDER BY START_BLOCK ASC";

const SQL_DELETE_JOB: &str = "DELETE FROM JOB_QUEUE
     WHERE REQ_NUM = ?1 AND TAPE_ID = ?2
       AND FS_ID_H = ?3 AND FS_ID_L = ?4 AND I_GEN = ?5 AND I_NUM = ?6";

const SQL_COUNT_REMAINING: &str =
    "SELECT COUNT(*) FROM JOB_QUEUE WHERE REQ_NUM = ?1 AND TAPE_ID = ?2";

const SQL_REMAINING_EVENTS: &str =
    "SELECT FS_ID_H, FS_ID_L, I_GEN, I_NUM, FILE_NAME, TARGET_STATE, CONN_INFO
     FROM JOB_QUEUE WHERE OPERATION = ?1";

const SQL_SMALLEST_JOB: &str =
    "SELECT MIN(FILE_SIZE) FROM JOB_QUEUE WHERE REQ_NUM = ?1 AND REPL_NUM = ?2";

const SQL_ALL_JOBS: &str = "SELECT OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE, REPL_NUM, FILE_SIZE,
            FS_ID_H, FS_ID_L, I_GEN, I_NUM, MTIME_SEC, MTIME_NSEC, LAST_UPD,
            TAPE_ID, FILE_STATE, START_BLOCK, CONN_INFO
     FROM JOB_QUEUE ORDER BY REQ_NUM, START_BLOCK";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i64)]
pub enum Operation {
    TransparentRecall = 0,
    SelectiveRecall = 1,
    Migration = 2,
}

impl Operation {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Operation::TransparentRecall,
            1 => Operation::SelectiveRecall,
            2 => Operation::Migration,
            _ => panic!("Invalid Operation value: {}", value),
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            Operation::TransparentRecall => "transparent recall",
            Operation::SelectiveRecall => "selective recall",
            Operation::Migration => "migration",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// One row of `JOB_QUEUE`: a single file's pending operation.
#[derive(Debug, Clone)]
pub struct Job {
    pub operation: Operation,
    pub file_name: Option<String>,
    pub req_num: i64,
    pub target_state: FileState,
    pub repl_num: i64,
    pub file_size: i64,
    pub fuid: Fuid,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub last_upd: i64,
    pub tape_id: String,
    pub file_state: FileState,
    pub start_block: i64,
    pub conn_info: i64,
}

/// A job selected for recall, carrying everything the executor needs to
/// copy the file and answer the originating event.
#[derive(Debug, Clone)]
pub struct RecallJob {
    pub rec: RecInfo,
    pub file_state: FileState,
    pub target_state: FileState,
    pub start_block: i64,
}

impl Job {
    pub fn insert(conn: &Connection, job: &Job) -> Result<(), TapeFlowError> {
        conn.execute(
            SQL_ADD_JOB,
            params![
                job.operation.as_i64(),
                job.file_name,
                job.req_num,
                job.target_state.as_i64(),
                job.repl_num,
                job.file_size,
                job.fuid.fs_id_h,
                job.fuid.fs_id_l,
                job.fuid.i_gen,
                job.fuid.i_num,
                job.mtime_sec,
                job.mtime_nsec,
                job.last_upd,
                job.tape_id,
                job.file_state.as_i64(),
                job.start_block,
                job.conn_info,
            ],
        )?;
        Ok(())
    }

    /// Moves all jobs of a request that are in `from` to the corresponding
    /// recalling state.
    pub fn set_recalling(
        conn: &Connection,
        req_num: i64,
        tape_id: &str,
        from: FileState,
        to: FileState,
    ) -> Result<usize, TapeFlowError> {
        let changed = conn.execute(
            SQL_SET_RECALLING,
            params![to.as_i64(), req_num, from.as_i64(), tape_id],
        )?;
        Ok(changed)
    }

    /// All recalling jobs of a request, ordered by start block.
    pub fn select_recalling(
        conn: &Connection,
        req_num: i64,
        tape_id: &str,
    ) -> Result<Vec<RecallJob>, TapeFlowError> {
        let mut stmt = conn.prepare(SQL_SELECT_RECALLING)?;

        let rows = stmt.query_map(
            params![
                req_num,
                FileState::RecallingMig.as_i64(),
                FileState::RecallingPremig.as_i64(),
                tape_id
            ],
            |row| {
                let target_state = FileState::from_i64(row.get(6)?);
                Ok(RecallJob {
                    rec: RecInfo {
                        fuid: Fuid {
                            fs_id_h: row.get(0)?,
                            fs_id_l: row.get(1)?,
                            i_gen: row.get(2)?,
                            i_num: row.get(3)?,
                        },
                        filename: row.get(4)?,
                        to_resident: target_state == FileState::Resident,
                        conn_info: row.get(8)?,
                    },
                    file_state: FileState::from_i64(row.get(5)?),
                    target_state,
                    start_block: row.get(7)?,
                })
            },
        )?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn delete_one(
        conn: &Connection,
        req_num: i64,
        tape_id: &str,
        fuid: Fuid,
    ) -> Result<usize, TapeFlowError> {
        let deleted = conn.execute(
            SQL_DELETE_JOB,
            params![
                req_num,
                tape_id,
                fuid.fs_id_h,
                fuid.fs_id_l,
                fuid.i_gen,
                fuid.i_num
            ],
        )?;
        Ok(deleted)
    }

    pub fn count_remaining(
        conn: &Connection,
        req_num: i64,
        tape_id: &str,
    ) -> Result<i64, TapeFlowError> {
        let count = conn.query_row(SQL_COUNT_REMAINING, params![req_num, tape_id], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Events of all jobs still queued for `operation`, used to answer
    /// outstanding events at shutdown.
    pub fn remaining_events(
        conn: &Connection,
        operation: Operation,
    ) -> Result<Vec<RecInfo>, TapeFlowError> {
        let mut stmt = conn.prepare(SQL_REMAINING_EVENTS)?;

        let rows = stmt.query_map(params![operation.as_i64()], |row| {
            let target_state = FileState::from_i64(row.get(5)?);
            Ok(RecInfo {
                fuid: Fuid {
                    fs_id_h: row.get(0)?,
                    fs_id_l: row.get(1)?,
                    i_gen: row.get(2)?,
                    i_num: row.get(3)?,
                },
                filename: row.get(4)?,
                to_resident: target_state == FileState::Resident,
                conn_info: row.get(6)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Size of the smallest job of a request, the lower bound the scheduler
    /// admits against.
    pub fn smallest_size(
        conn: &Connection,
        req_num: i64,
        repl_num: i64,
    ) -> Result<Option<i64>, TapeFlowError> {
        let size: Option<i64> = conn
            .query_row(SQL_SMALLEST_JOB, params![req_num, repl_num], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        Ok(size)
    }

    pub fn all(conn: &Connection) -> Result<Vec<Job>, TapeFlowError> {
        let mut stmt = conn.prepare(SQL_ALL_JOBS)?;

        let rows = stmt.query_map([], |row| {
            Ok(Job {
                operation: Operation::from_i64(row.get(0)?),
                file_name: row.get(1)?,
                req_num: row.get(2)?,
                target_state: FileState::from_i64(row.get(3)?),
                repl_num: row.get(4)?,
                file_size: row.get(5)?,
                fuid: Fuid {
                    fs_id_h: row.get(6)?,
                    fs_id_l: row.get(7)?,
                    i_gen: row.get(8)?,
                    i_num: row.get(9)?,
                },
                mtime_sec: row.get(10)?,
                mtime_nsec: row.get(11)?,
                last_upd: row.get(12)?,
                tape_id: row.get(13)?,
                file_state: FileState::from_i64(row.get(14)?),
                start_block: row.get(15)?,
                conn_info: row.get(16)?,
            })
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }
}
