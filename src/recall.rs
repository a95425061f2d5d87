use std::fs::OpenOptions;
use std::io::Read;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::connector::RecInfo;
use crate::error::TapeFlowError;
use crate::fsobj::{FileState, FsObjLock};
use crate::jobs::Job;
use crate::requests::{Request, RequestState};
use crate::server::Server;

/// The recall executor: works one request at a time, streaming file
/// payloads off the tape-backed path back into the live files.
pub struct Recall;

impl Recall {
    /// Executes one scheduled request and finalizes it: frees the tape
    /// resources, then either deletes the drained request or returns it to
    /// `NEW` if events arrived during the cycle.
    pub fn exec_request(server: &Arc<Server>, req_num: i64, tape_id: &str) {
        info!("Executing recall request {} for tape '{}'", req_num, tape_id);

        if let Err(err) = Self::process_files(server, req_num, tape_id) {
            error!(
                "Processing files of request {} (tape '{}') failed: {}",
                req_num, tape_id, err
            );
        }

        Self::finish_request(server, req_num, tape_id);
    }

    /// Recalls the files of a request in start-block order so the tape head
    /// moves monotonically. Each file is attempted independently; a failed
    /// file never strands the rest of the request.
    pub fn process_files(
        server: &Arc<Server>,
        req_num: i64,
        tape_id: &str,
    ) -> Result<(), TapeFlowError> {
        server.db.write_transaction(|conn| {
            Job::set_recalling(
                conn,
                req_num,
                tape_id,
                FileState::Migrated,
                FileState::RecallingMig,
            )?;
            Job::set_recalling(
                conn,
                req_num,
                tape_id,
                FileState::Premigrated,
                FileState::RecallingPremig,
            )?;
            Ok(())
        })?;

        let jobs = {
            let conn = server.db.conn();
            Job::select_recalling(&conn, req_num, tape_id)?
        };

        let mut responses: Vec<(RecInfo, bool)> = Vec::new();

        for job in jobs {
            // On shutdown the current request stops picking up further
            // files; jobs not attempted stay queued and their events are
            // answered by the intake cleanup.
            if server.terminating() || server.forced_terminating() {
                break;
            }

            let state = if job.file_state == FileState::RecallingMig {
                FileState::Migrated
            } else {
                FileState::Premigrated
            };

            let succeeded =
                match Self::recall_file(server, &job.rec, tape_id, state, job.target_state) {
                    Ok(copied) => {
                        debug!(
                            "Recalled inode {} from tape '{}' (start block {}, {} bytes)",
                            job.rec.fuid.i_num, tape_id, job.start_block, copied
                        );
                        true
                    }
                    Err(err) => {
                        error!(
                            "Recall of inode {} from tape '{}' failed: {}",
                            job.rec.fuid.i_num, tape_id, err
                        );
                        false
                    }
                };

            responses.push((job.rec, succeeded));
        }

        server.db.write_transaction(|conn| {
            for (rec, _) in &responses {
                Job::delete_one(conn, req_num, tape_id, rec.fuid)?;
            }
            Ok(())
        })?;

        // respond only once the job rows are gone
        for (rec, succeeded) in &responses {
            server.connector.respond(rec, *succeeded);
        }

        Ok(())
    }

    /// Finalization of a request cycle, serialized with the queue mutator
    /// by the scheduler mutex: a reactivation that wins the mutex first is
    /// observed by the remaining-jobs count here.
    pub fn finish_request(server: &Arc<Server>, req_num: i64, tape_id: &str) {
        let mut shared = server.sched.lock();

        if let Err(err) = server.inventory.release_after_recall(tape_id) {
            error!("Releasing resources of tape '{}' failed: {}", tape_id, err);
        }

        let finalized = server.db.write_transaction(|conn| {
            let remaining = Job::count_remaining(conn, req_num, tape_id)?;
            if remaining > 0 {
                Request::set_state(conn, req_num, tape_id, RequestState::New)?;
            } else {
                Request::delete(conn, req_num, tape_id)?;
            }
            Ok(remaining)
        });

        match finalized {
            Ok(0) => info!("Recall request {} for tape '{}' drained", req_num, tape_id),
            Ok(remaining) => info!(
                "Recall request {} for tape '{}' requeued ({} jobs remaining)",
                req_num, tape_id, remaining
            ),
            Err(err) => error!(
                "Finalizing request {} (tape '{}') failed: {}",
                req_num, tape_id, err
            ),
        }

        shared.upd_req.insert(req_num, true);
        server.sched.upd_cond.notify_all();
        server.sched.cond.notify_one();
    }

    /// Copies a single file back from tape.
    ///
    /// The migration state is re-read under the per-file lock; if the file
    /// converged to resident on its own there is nothing to do. For a
    /// premigrated file the payload is already on disk and only the state
    /// transition runs.
    pub fn recall_file(
        server: &Arc<Server>,
        rec: &RecInfo,
        tape_id: &str,
        state: FileState,
        to_state: FileState,
    ) -> Result<u64, TapeFlowError> {
        let target = server.fs.open(rec.fuid)?;
        let _lock = FsObjLock::acquire(target.as_ref());

        let mut state = state;
        let current = target.mig_state()?;
        if current != state {
            info!(
                "Migration state of inode {} changed before its recall",
                rec.fuid.i_num
            );
            state = current;
        }

        if state == FileState::Resident {
            return Ok(0);
        }

        let mut to_state = to_state;
        let mut copied: u64 = 0;

        if state == FileState::Migrated {
            let tape_path = server.fs.tape_path(rec.fuid, tape_id);
            let mut source = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&tape_path)
                .map_err(|err| {
                    error!("Cannot open tape file '{}': {}", tape_path.display(), err);
                    TapeFlowError::Io(err)
                })?;

            let stat = target.stat()?;
            let mut expected = stat.size;

            let tape_size = source.metadata()?.len() as i64;
            if tape_size != expected {
                match &rec.filename {
                    Some(name) => warn!(
                        "Size of file '{}' ({}) differs from its size on tape ({})",
                        name, expected, tape_size
                    ),
                    None => warn!(
                        "Size of inode {} ({}) differs from its size on tape ({})",
                        rec.fuid.i_num, expected, tape_size
                    ),
                }
                expected = tape_size;
                // a partial payload can no longer be a valid premigration
                to_state = FileState::Resident;
            }

            target.prepare_recall()?;

            let mut buffer = vec![0u8; Config::get().recall.read_buffer_size];
            let mut offset: i64 = 0;

            while offset < expected {
                if server.forced_terminating() {
                    return Err(TapeFlowError::Terminated(match &rec.filename {
                        Some(name) => name.clone(),
                        None => rec.fuid.to_string(),
                    }));
                }

                let rsize = source.read(&mut buffer).map_err(|err| {
                    error!(
                        "Reading from tape file '{}' failed: {}",
                        tape_path.display(),
                        err
                    );
                    TapeFlowError::Io(err)
                })?;
                if rsize == 0 {
                    break;
                }

                let wsize = target.write(offset as u64, &buffer[..rsize])?;
                if wsize != rsize {
                    error!(
                        "Writing to inode {} failed: short write ({} of {} bytes)",
                        rec.fuid.i_num, wsize, rsize
                    );
                    return Err(TapeFlowError::Error(format!(
                        "short write recalling inode {}",
                        rec.fuid.i_num
                    )));
                }

                offset += rsize as i64;
            }

            copied = offset as u64;
        }

        target.finish_recall(to_state)?;
        if to_state == FileState::Resident {
            target.remove_attribute()?;
        }

        Ok(copied)
    }
}
