use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::TapeFlowError;
use crate::jobs::Operation;

const SQL_ADD_REQUEST: &str =
    "INSERT INTO REQUEST_QUEUE (OPERATION, REQ_NUM, TAPE_ID, TIME_ADDED, STATE)
     VALUES (?, ?, ?, ?, ?)";

const SQL_REQUEST_EXISTS: &str = "SELECT STATE FROM REQUEST_QUEUE WHERE REQ_NUM = ?1";

const SQL_SET_STATE: &str =
    "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2 AND TAPE_ID = ?3";

// Oldest first: the scheduler considers requests in arrival order.
const SQL_SELECT_NEW: &str = "SELECT OPERATION, REQ_NUM, TARGET_STATE, NUM_REPL, REPL_NUM, TAPE_POOL,
            TAPE_ID, TIME_ADDED, STATE
     FROM REQUEST_QUEUE WHERE STATE = ?1 AND OPERATION = ?2
     ORDER BY TIME_ADDED ASC";

const SQL_DELETE_REQUEST: &str =
    "DELETE FROM REQUEST_QUEUE WHERE REQ_NUM = ?1 AND TAPE_ID = ?2";

const SQL_COUNT_IN_STATE: &str = "SELECT COUNT(*) FROM REQUEST_QUEUE WHERE STATE = ?1";

const SQL_ALL_REQUESTS: &str = "SELECT OPERATION, REQ_NUM, TARGET_STATE, NUM_REPL, REPL_NUM, TAPE_POOL,
            TAPE_ID, TIME_ADDED, STATE
     FROM REQUEST_QUEUE ORDER BY TIME_ADDED ASC";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i64)]
pub enum RequestState {
    New = 0,
    InProgress = 1,
    Completed = 2,
}

impl RequestState {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => RequestState::New,
            1 => RequestState::InProgress,
            2 => RequestState::Completed,
            _ => panic!("Invalid RequestState value: {}", value),
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            RequestState::New => "new",
            RequestState::InProgress => "in progress",
            RequestState::Completed => "completed",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// One row of `REQUEST_QUEUE`: the scheduler's unit of work for one tape.
#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub req_num: i64,
    #[allow(dead_code)]
    pub target_state: Option<i64>,
    #[allow(dead_code)]
    pub num_repl: Option<i64>,
    #[allow(dead_code)]
    pub repl_num: Option<i64>,
    #[allow(dead_code)]
    pub tape_pool: Option<String>,
    pub tape_id: String,
    pub time_added: i64,
    pub state: RequestState,
}

impl Request {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Request {
            operation: Operation::from_i64(row.get(0)?),
            req_num: row.get(1)?,
            target_state: row.get(2)?,
            num_repl: row.get(3)?,
            repl_num: row.get(4)?,
            tape_pool: row.get(5)?,
            tape_id: row.get(6)?,
            time_added: row.get(7)?,
            state: RequestState::from_i64(row.get(8)?),
        })
    }

    pub fn insert_new(
        conn: &Connection,
        operation: Operation,
        req_num: i64,
        tape_id: &str,
        time_added: i64,
    ) -> Result<(), TapeFlowError> {
        conn.execute(
            SQL_ADD_REQUEST,
            params![
                operation.as_i64(),
                req_num,
                tape_id,
                time_added,
                RequestState::New.as_i64()
            ],
        )?;
        Ok(())
    }

    pub fn exists(conn: &Connection, req_num: i64) -> Result<bool, TapeFlowError> {
        let state: Option<i64> = conn
            .query_row(SQL_REQUEST_EXISTS, params![req_num], |row| row.get(0))
            .optional()?;
        Ok(state.is_some())
    }

    pub fn set_state(
        conn: &Connection,
        req_num: i64,
        tape_id: &str,
        state: RequestState,
    ) -> Result<usize, TapeFlowError> {
        let changed = conn.execute(SQL_SET_STATE, params![state.as_i64(), req_num, tape_id])?;
        Ok(changed)
    }

    /// Candidate requests for scheduling, oldest first.
    pub fn select_new(
        conn: &Connection,
        operation: Operation,
    ) -> Result<Vec<Request>, TapeFlowError> {
        let mut stmt = conn.prepare(SQL_SELECT_NEW)?;
        let rows = stmt.query_map(
            params![RequestState::New.as_i64(), operation.as_i64()],
            Request::from_row,
        )?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    pub fn delete(conn: &Connection, req_num: i64, tape_id: &str) -> Result<usize, TapeFlowError> {
        let deleted = conn.execute(SQL_DELETE_REQUEST, params![req_num, tape_id])?;
        Ok(deleted)
    }

    pub fn count_in_state(conn: &Connection, state: RequestState) -> Result<i64, TapeFlowError> {
        let count = conn.query_row(SQL_COUNT_IN_STATE, params![state.as_i64()], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    pub fn all(conn: &Connection) -> Result<Vec<Request>, TapeFlowError> {
        let mut stmt = conn.prepare(SQL_ALL_REQUESTS)?;
        let rows = stmt.query_map([], Request::from_row)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }
}
