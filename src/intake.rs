use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::connector::RecInfo;
use crate::error::TapeFlowError;
use crate::fsobj::FileState;
use crate::jobs::{Job, Operation, UNSET};
use crate::requests::{Request, RequestState};
use crate::server::Server;
use crate::workqueue::WorkQueue;

pub struct AddJobTask {
    pub rec: RecInfo,
    pub tape_id: String,
    pub req_num: i64,
}

/// Recall event intake: a single long-running loop that validates incoming
/// events and queues AddJob work on a bounded pool, plus the queue mutator
/// itself.
pub struct Intake;

impl Intake {
    pub fn run(server: &Arc<Server>) {
        let config = Config::get();

        let pool_server = Arc::clone(server);
        let pool = WorkQueue::new(
            "addjob-wq",
            config.intake.threads,
            config.intake.queue_depth,
            move |task: AddJobTask| {
                if let Err(err) =
                    Intake::add_job(&pool_server, &task.rec, &task.tape_id, task.req_num)
                {
                    error!(
                        "Adding job for request {} (tape '{}') failed: {}",
                        task.req_num, task.tape_id, err
                    );
                }
            },
        );

        if let Err(err) = server.connector.init_recalls() {
            error!("Initializing the recall connector failed: {}", err);
            return;
        }

        for fs_path in &config.intake.filesystems {
            if server.fs.is_managed(fs_path) {
                info!("Re-attaching to managed filesystem '{}'", fs_path.display());
                if let Err(err) = server.fs.manage(fs_path, server.connector.start_time()) {
                    error!("Re-attaching to '{}' failed: {}", fs_path.display(), err);
                }
            }
        }

        // Tape id to request number, reused for the lifetime of the process
        // so follow-up events for the same tape coalesce into one request.
        let mut reqmap: HashMap<String, i64> = HashMap::new();

        while let Some(rec) = server.connector.get_event() {
            if rec.is_sentinel() {
                continue;
            }

            if server.terminating() {
                server.connector.respond(&rec, false);
                continue;
            }

            if rec.fuid.i_num == 0 {
                continue;
            }

            let tape_id = match Self::probe_event(server, &rec) {
                Ok(Some(tape_id)) => tape_id,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        "Cannot process recall event for inode {}: {}",
                        rec.fuid.i_num, err
                    );
                    server.connector.respond(&rec, false);
                    continue;
                }
            };

            let req_num = *reqmap
                .entry(tape_id.clone())
                .or_insert_with(|| server.next_req_num());

            debug!(
                "Queueing job for inode {} on tape '{}' (request {})",
                rec.fuid.i_num, tape_id, req_num
            );
            pool.enqueue(AddJobTask {
                rec,
                tape_id,
                req_num,
            });
        }

        info!("Processing of recall events stopped");
        server.connector.end_recalls();
        pool.wait_completion();
        pool.shutdown();

        if let Err(err) = Self::cleanup_events(server) {
            error!("Answering outstanding recall events failed: {}", err);
        }
        info!("Recall event cleanup finished");
    }

    /// Checks an event against the filesystem and determines the tape to
    /// recall from. `Ok(None)` means the event was already answered (the
    /// file converged to resident on its own).
    fn probe_event(
        server: &Arc<Server>,
        rec: &RecInfo,
    ) -> Result<Option<String>, TapeFlowError> {
        let obj = server.fs.open(rec.fuid)?;

        if obj.mig_state()? == FileState::Resident {
            obj.finish_recall(FileState::Resident)?;
            info!("File with inode {} is already resident", rec.fuid.i_num);
            server.connector.respond(rec, true);
            return Ok(None);
        }

        let attr = obj.attribute()?;
        // No cross-replica optimization: the recall is served from the
        // first tape carrying the file.
        let tape_id = attr.tape_ids.first().cloned().ok_or_else(|| {
            TapeFlowError::Error(format!(
                "Migration attribute of inode {} names no tape",
                rec.fuid.i_num
            ))
        })?;

        Ok(Some(tape_id))
    }

    /// The queue mutator: inserts one job for the event and creates or
    /// revives the per-tape request.
    ///
    /// Filesystem problems answer the event `failed` and are swallowed;
    /// database errors propagate so the pool marks the task failed (the
    /// request stays `NEW` and is retried on the next wakeup).
    pub fn add_job(
        server: &Arc<Server>,
        rec: &RecInfo,
        tape_id: &str,
        req_num: i64,
    ) -> Result<(), TapeFlowError> {
        let job = match Self::build_job(server, rec, tape_id, req_num) {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(()),
            Err(err) => {
                match &rec.filename {
                    Some(name) => error!("Recall of '{}' failed: {}", name, err),
                    None => error!("Recall of inode {} failed: {}", rec.fuid.i_num, err),
                }
                server.connector.respond(rec, false);
                return Ok(());
            }
        };

        server.db.write_transaction(|conn| Job::insert(conn, &job))?;

        // The scheduler mutex is held across the existence check, the
        // request mutation, and the signal so a scheduler that has just
        // drained the queue cannot miss the wakeup.
        let _shared = server.sched.lock();

        server.db.write_transaction(|conn| {
            if Request::exists(conn, req_num)? {
                Request::set_state(conn, req_num, tape_id, RequestState::New)?;
            } else {
                Request::insert_new(
                    conn,
                    Operation::TransparentRecall,
                    req_num,
                    tape_id,
                    Utc::now().timestamp(),
                )?;
            }
            Ok(())
        })?;

        server.sched.cond.notify_one();
        Ok(())
    }

    fn build_job(
        server: &Arc<Server>,
        rec: &RecInfo,
        tape_id: &str,
        req_num: i64,
    ) -> Result<Option<Job>, TapeFlowError> {
        let obj = server.fs.open(rec.fuid)?;

        let stat = obj.stat()?;
        if !stat.is_regular {
            return Err(TapeFlowError::Error(format!(
                "inode {} is not a regular file",
                rec.fuid.i_num
            )));
        }

        let state = obj.mig_state()?;
        if state == FileState::Resident {
            info!("File with inode {} is already resident", rec.fuid.i_num);
            server.connector.respond(rec, true);
            return Ok(None);
        }

        obj.attribute()?;

        let tape_path = server.fs.tape_path(rec.fuid, tape_id);
        let start_block = server.fs.start_block(&tape_path)?;

        Ok(Some(Job {
            operation: Operation::TransparentRecall,
            file_name: rec.filename.clone(),
            req_num,
            target_state: if rec.to_resident {
                FileState::Resident
            } else {
                FileState::Premigrated
            },
            repl_num: UNSET,
            file_size: stat.size,
            fuid: rec.fuid,
            mtime_sec: stat.mtime_sec,
            mtime_nsec: stat.mtime_nsec,
            last_upd: Utc::now().timestamp(),
            tape_id: tape_id.to_string(),
            file_state: state,
            start_block,
            conn_info: rec.conn_info,
        }))
    }

    /// Answers every event still backed by a queued job with `failed`.
    /// Runs after the event loop has stopped and the AddJob pool drained.
    pub fn cleanup_events(server: &Arc<Server>) -> Result<(), TapeFlowError> {
        let events = {
            let conn = server.db.conn();
            Job::remaining_events(&conn, Operation::TransparentRecall)?
        };

        for rec in events {
            match &rec.filename {
                Some(name) => debug!("Answering outstanding event for '{}'", name),
                None => debug!("Answering outstanding event for inode {}", rec.fuid.i_num),
            }
            server.connector.respond(&rec, false);
        }
        Ok(())
    }
}
