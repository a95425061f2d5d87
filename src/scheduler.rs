use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info};

use crate::error::TapeFlowError;
use crate::inventory::{CartridgeState, RecallClaim};
use crate::jobs::{Job, Operation, UNSET};
use crate::requests::{Request, RequestState};
use crate::server::Server;
use crate::workqueue::WorkQueue;

/// Scheduler state shared with the queue mutator and the recall executor,
/// guarded by the scheduler mutex.
#[derive(Default)]
pub struct SchedShared {
    /// Tapes operators have paused work on.
    pub suspend: HashMap<String, bool>,
    /// Per-request update flags, set when an executor finishes a cycle.
    pub upd_req: HashMap<i64, bool>,
}

#[derive(Default)]
pub struct SchedulerState {
    mtx: Mutex<SchedShared>,
    /// Wakes the scheduler; it is the only waiter on this variable.
    pub cond: Condvar,
    /// Wakes observers of the per-request update flags.
    pub upd_cond: Condvar,
}

impl SchedulerState {
    pub fn new() -> Self {
        SchedulerState::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SchedShared> {
        self.mtx.lock().expect("scheduler mutex poisoned")
    }

    /// Pauses or resumes scheduling for a tape and wakes the scheduler.
    #[allow(dead_code)]
    pub fn set_suspended(&self, tape_id: &str, suspended: bool) {
        let mut shared = self.lock();
        shared.suspend.insert(tape_id.to_string(), suspended);
        self.cond.notify_all();
    }

    /// Waits until an executor flags an update for `req_num`; the flag is
    /// consumed on success.
    #[allow(dead_code)]
    pub fn wait_request_update(&self, req_num: i64, timeout: Duration) -> bool {
        let shared = self.lock();
        let (mut shared, result) = self
            .upd_cond
            .wait_timeout_while(shared, timeout, |s| {
                !s.upd_req.get(&req_num).copied().unwrap_or(false)
            })
            .expect("scheduler mutex poisoned");

        if result.timed_out() {
            false
        } else {
            shared.upd_req.insert(req_num, false);
            true
        }
    }
}

/// The single cooperative scheduling loop.
///
/// Waits on the scheduler condition variable, scans `NEW` requests oldest
/// first, admits them against the tape inventory, and hands admitted
/// requests to the recall worker pool. Wakeups are cumulative; the loop
/// rescans the queue on every signal, so spurious wakeups are harmless.
pub struct Scheduler;

impl Scheduler {
    pub fn run(server: &Arc<Server>, recall_queue: &Arc<WorkQueue<(i64, String)>>) {
        info!("Scheduler started");

        loop {
            let dispatches = {
                let mut shared = server.sched.lock();

                loop {
                    if server.terminating() {
                        let in_progress = {
                            let conn = server.db.conn();
                            Request::count_in_state(&conn, RequestState::InProgress).unwrap_or(0)
                        };
                        if in_progress == 0 {
                            info!("Scheduler terminated");
                            return;
                        }
                        shared = server
                            .sched
                            .cond
                            .wait(shared)
                            .expect("scheduler mutex poisoned");
                        continue;
                    }

                    let picked = Self::pick_requests(server, &shared);
                    if !picked.is_empty() {
                        break picked;
                    }

                    shared = server
                        .sched
                        .cond
                        .wait(shared)
                        .expect("scheduler mutex poisoned");
                }
            };

            for (request, claim) in dispatches {
                if claim.needs_mount {
                    if let Err(err) = server.inventory.mount(&claim.drive_id, &request.tape_id) {
                        error!("Mounting tape '{}' failed: {}", request.tape_id, err);
                        let _ = server
                            .inventory
                            .release_claim(&claim.drive_id, &request.tape_id);
                        Self::requeue(server, &request);
                        continue;
                    }
                    if let Err(err) = server
                        .inventory
                        .set_cartridge_state(&request.tape_id, CartridgeState::InUse)
                    {
                        error!("Updating state of tape '{}' failed: {}", request.tape_id, err);
                    }
                }

                info!(
                    "Scheduling {} request {} for tape '{}'",
                    request.operation, request.req_num, request.tape_id
                );
                recall_queue.enqueue((request.req_num, request.tape_id.clone()));
            }
        }
    }

    /// One scan over the `NEW` requests: skips suspended tapes, admits
    /// against the inventory, and transitions admitted requests to
    /// `IN_PROGRESS`. Requests without resources stay `NEW` and are
    /// reconsidered on the next wakeup.
    fn pick_requests(
        server: &Arc<Server>,
        shared: &SchedShared,
    ) -> Vec<(Request, RecallClaim)> {
        let candidates = {
            let conn = server.db.conn();
            match Request::select_new(&conn, Operation::TransparentRecall) {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!("Reading schedulable requests failed: {}", err);
                    Vec::new()
                }
            }
        };

        let mut picked = Vec::new();

        for request in candidates {
            if shared
                .suspend
                .get(&request.tape_id)
                .copied()
                .unwrap_or(false)
            {
                debug!(
                    "Tape '{}' is suspended, skipping request {}",
                    request.tape_id, request.req_num
                );
                continue;
            }

            let min_file_size = {
                let conn = server.db.conn();
                Job::smallest_size(&conn, request.req_num, UNSET)
                    .unwrap_or(None)
                    .unwrap_or(0)
            };

            let claim = match Self::res_avail(server, &request.tape_id, min_file_size as u64) {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(err) => {
                    error!(
                        "Resource check for tape '{}' failed: {}",
                        request.tape_id, err
                    );
                    continue;
                }
            };

            let transitioned = {
                let conn = server.db.conn();
                Request::set_state(
                    &conn,
                    request.req_num,
                    &request.tape_id,
                    RequestState::InProgress,
                )
            };

            match transitioned {
                Ok(_) => picked.push((request, claim)),
                Err(err) => {
                    error!(
                        "Marking request {} in progress failed: {}",
                        request.req_num, err
                    );
                    let undo = if claim.needs_mount {
                        server
                            .inventory
                            .release_claim(&claim.drive_id, &request.tape_id)
                    } else {
                        server.inventory.release_after_recall(&request.tape_id)
                    };
                    if let Err(err) = undo {
                        error!("Releasing claim on tape '{}' failed: {}", request.tape_id, err);
                    }
                }
            }
        }

        picked
    }

    /// Admission for a recall reduces to cartridge and drive availability;
    /// the pool-capacity gate (FITS) only applies to migration requests.
    fn res_avail(
        server: &Arc<Server>,
        tape_id: &str,
        _min_file_size: u64,
    ) -> Result<Option<RecallClaim>, TapeFlowError> {
        server.inventory.claim_for_recall(tape_id)
    }

    fn requeue(server: &Arc<Server>, request: &Request) {
        let _shared = server.sched.lock();
        let result = {
            let conn = server.db.conn();
            Request::set_state(&conn, request.req_num, &request.tape_id, RequestState::New)
        };
        if let Err(err) = result {
            error!("Requeueing request {} failed: {}", request.req_num, err);
        }
        server.sched.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_suspend_flag_round_trip() {
        let state = SchedulerState::new();
        state.set_suspended("T00001L6", true);
        assert!(state.lock().suspend.get("T00001L6").copied().unwrap());

        state.set_suspended("T00001L6", false);
        assert!(!state.lock().suspend.get("T00001L6").copied().unwrap());
    }

    #[test]
    fn test_wait_request_update_times_out_without_update() {
        let state = SchedulerState::new();
        assert!(!state.wait_request_update(7, Duration::from_millis(30)));
    }

    #[test]
    fn test_wait_request_update_consumes_flag() {
        let state = Arc::new(SchedulerState::new());

        let flagger = Arc::clone(&state);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut shared = flagger.lock();
            shared.upd_req.insert(7, true);
            flagger.upd_cond.notify_all();
        });

        assert!(state.wait_request_update(7, Duration::from_secs(2)));
        handle.join().unwrap();

        // the flag was consumed, a second wait must time out
        assert!(!state.wait_request_update(7, Duration::from_millis(30)));
    }
}
