use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::config::Config;
use crate::connector::Connector;
use crate::database::Database;
use crate::fsobj::Filesystem;
use crate::intake::Intake;
use crate::inventory::Inventory;
use crate::recall::Recall;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::workqueue::WorkQueue;

/// Long-lived handles shared by intake, scheduler, and the recall
/// executors, plus the process-wide termination flags and the monotonic
/// request-number allocator.
pub struct Server {
    pub db: Arc<Database>,
    pub fs: Arc<dyn Filesystem>,
    pub connector: Arc<dyn Connector>,
    pub inventory: Arc<Inventory>,
    pub sched: Arc<SchedulerState>,
    terminate: AtomicBool,
    forced_terminate: AtomicBool,
    req_counter: AtomicI64,
}

/// Join handles of a started server.
pub struct ServerHandles {
    intake: JoinHandle<()>,
    scheduler: JoinHandle<()>,
    recall_queue: Arc<WorkQueue<(i64, String)>>,
}

impl Server {
    pub fn new(
        db: Arc<Database>,
        fs: Arc<dyn Filesystem>,
        connector: Arc<dyn Connector>,
        inventory: Arc<Inventory>,
    ) -> Arc<Self> {
        Arc::new(Server {
            db,
            fs,
            connector,
            inventory,
            sched: Arc::new(SchedulerState::new()),
            terminate: AtomicBool::new(false),
            forced_terminate: AtomicBool::new(false),
            req_counter: AtomicI64::new(0),
        })
    }

    /// Allocates a process-unique request number.
    pub fn next_req_num(&self) -> i64 {
        self.req_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn forced_terminating(&self) -> bool {
        self.forced_terminate.load(Ordering::SeqCst)
    }

    /// Spawns the intake and scheduler threads and the recall worker pool.
    pub fn start(self: &Arc<Self>) -> ServerHandles {
        let config = Config::get();

        let exec_server = Arc::clone(self);
        let recall_queue = Arc::new(WorkQueue::new(
            "recall-wq",
            config.recall.threads,
            config.recall.queue_depth,
            move |(req_num, tape_id): (i64, String)| {
                Recall::exec_request(&exec_server, req_num, &tape_id);
            },
        ));

        let sched_server = Arc::clone(self);
        let sched_queue = Arc::clone(&recall_queue);
        let scheduler = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || Scheduler::run(&sched_server, &sched_queue))
            .expect("Spawning the scheduler thread failed");

        let intake_server = Arc::clone(self);
        let intake = thread::Builder::new()
            .name("intake".to_string())
            .spawn(move || Intake::run(&intake_server))
            .expect("Spawning the intake thread failed");

        info!("Server started");

        ServerHandles {
            intake,
            scheduler,
            recall_queue,
        }
    }

    /// Initiates shutdown. Graceful shutdown stops event intake and lets
    /// in-flight recalls complete; forced shutdown additionally aborts the
    /// running byte copies.
    pub fn shutdown(&self, forced: bool) {
        info!(
            "Initiating {} shutdown",
            if forced { "forced" } else { "graceful" }
        );

        self.terminate.store(true, Ordering::SeqCst);
        if forced {
            self.forced_terminate.store(true, Ordering::SeqCst);
        }

        // unblock the event wait and the scheduler
        self.connector.shutdown();
        self.sched.cond.notify_all();
    }
}

impl ServerHandles {
    /// Waits for intake and scheduler to exit and drains the recall pool.
    pub fn join(self) {
        if self.intake.join().is_err() {
            error!("Intake thread panicked");
        }
        if self.scheduler.join().is_err() {
            error!("Scheduler thread panicked");
        }
        self.recall_queue.wait_completion();
        self.recall_queue.shutdown();
        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChannelConnector, RecInfo};
    use crate::error::TapeFlowError;
    use crate::fsobj::{FileState, Fuid, LocalFs};
    use crate::jobs::Job;
    use crate::requests::{Request, RequestState};
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const TAPE: &str = "T00001L6";
    const DRIVE: &str = "D00";

    struct Fixture {
        server: Arc<Server>,
        connector: Arc<ChannelConnector>,
        fs: Arc<LocalFs>,
        _temp_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let fs = Arc::new(
            LocalFs::new(&temp_dir.path().join("data"), &temp_dir.path().join("tape")).unwrap(),
        );
        let connector = Arc::new(ChannelConnector::new());
        let db = Arc::new(Database::open(None, true).unwrap());
        db.create_tables().unwrap();
        let inventory = Arc::new(Inventory::new(&[DRIVE.to_string()], &[TAPE.to_string()]));

        let server = Server::new(
            db,
            Arc::clone(&fs) as Arc<dyn Filesystem>,
            Arc::clone(&connector) as Arc<dyn Connector>,
            inventory,
        );

        Fixture {
            server,
            connector,
            fs,
            _temp_dir: temp_dir,
        }
    }

    fn fuid(i_num: i64) -> Fuid {
        Fuid {
            fs_id_h: 1,
            fs_id_l: 2,
            i_gen: 3,
            i_num,
        }
    }

    fn stage_migrated(fx: &Fixture, i_num: i64, start_block: i64, payload: &[u8]) -> RecInfo {
        let path = fx.fs.data_root().join(format!("file{}", i_num));
        fx.fs
            .stage_migrated(fuid(i_num), &path, TAPE, start_block, payload)
            .unwrap();
        RecInfo {
            fuid: fuid(i_num),
            filename: Some(path.to_string_lossy().into_owned()),
            to_resident: true,
            conn_info: 100 + i_num,
        }
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn mig_state(fx: &Fixture, i_num: i64) -> FileState {
        fx.fs.open(fuid(i_num)).unwrap().mig_state().unwrap()
    }

    #[test]
    fn test_request_numbers_are_monotonic() {
        let fx = fixture();
        assert_eq!(fx.server.next_req_num(), 1);
        assert_eq!(fx.server.next_req_num(), 2);
        assert_eq!(fx.server.next_req_num(), 3);
    }

    // Single file recall to resident: one job and one request are created
    // and drained, the event is answered success, the file ends resident
    // with its attribute removed.
    #[test]
    fn test_single_file_recall_to_resident() {
        let fx = fixture();
        fx.server.inventory.mount(DRIVE, TAPE).unwrap();

        let payload = vec![42u8; 1000];
        let rec = stage_migrated(&fx, 4, 0, &payload);
        let path = rec.filename.clone().unwrap();

        let handles = fx.server.start();
        fx.connector.post_event(rec);

        assert!(fx.connector.wait_responses(1, Duration::from_secs(10)));
        assert_eq!(fx.connector.responses(), vec![(104, true)]);
        assert!(fx
            .server
            .sched
            .wait_request_update(1, Duration::from_secs(10)));

        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::all(&conn).unwrap().len(), 0);
            assert_eq!(Request::all(&conn).unwrap().len(), 0);
        }

        assert_eq!(mig_state(&fx, 4), FileState::Resident);
        assert!(fx.fs.open(fuid(4)).unwrap().attribute().is_err());
        assert_eq!(fs::read(path).unwrap(), payload);

        fx.server.shutdown(false);
        handles.join();
    }

    // Coalescing: three events for the same tape within one scheduler
    // cycle become three jobs but a single request, and the files are
    // recalled in start-block order.
    #[test]
    fn test_coalescing_recalls_in_start_block_order() {
        let fx = fixture();
        fx.server.inventory.mount(DRIVE, TAPE).unwrap();

        // hold the scheduler off until all three jobs are queued
        fx.server.sched.set_suspended(TAPE, true);

        let handles = fx.server.start();

        let recs = [
            stage_migrated(&fx, 1, 300, b"c"),
            stage_migrated(&fx, 2, 100, b"a"),
            stage_migrated(&fx, 3, 200, b"b"),
        ];
        for rec in recs {
            fx.connector.post_event(rec);
        }

        assert!(wait_until(Duration::from_secs(10), || {
            let conn = fx.server.db.conn();
            Job::count_remaining(&conn, 1, TAPE).unwrap() == 3
        }));
        {
            let conn = fx.server.db.conn();
            assert_eq!(Request::all(&conn).unwrap().len(), 1);
        }

        fx.server.sched.set_suspended(TAPE, false);

        assert!(fx.connector.wait_responses(3, Duration::from_secs(10)));
        assert!(fx
            .server
            .sched
            .wait_request_update(1, Duration::from_secs(10)));

        let mut responses = fx.connector.responses();
        responses.sort();
        assert_eq!(responses, vec![(101, true), (102, true), (103, true)]);

        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::all(&conn).unwrap().len(), 0);
            assert_eq!(Request::all(&conn).unwrap().len(), 0);
        }

        // start blocks 100, 200, 300 belong to inodes 2, 3, 1
        assert_eq!(
            fx.fs.prepared_order(),
            vec![fuid(2), fuid(3), fuid(1)],
            "files must be recalled in start-block order"
        );

        fx.server.shutdown(false);
        handles.join();
    }

    // Reactivation race: an event lands after process_files but before the
    // remaining-count query; the request returns to NEW and a second cycle
    // drains it.
    #[test]
    fn test_reactivation_when_event_lands_during_cycle() {
        let fx = fixture();
        fx.server.inventory.mount(DRIVE, TAPE).unwrap();

        let rec_a = stage_migrated(&fx, 1, 0, b"first");
        Intake::add_job(&fx.server, &rec_a, TAPE, 5).unwrap();

        fx.server.inventory.claim_for_recall(TAPE).unwrap().unwrap();
        {
            let conn = fx.server.db.conn();
            Request::set_state(&conn, 5, TAPE, RequestState::InProgress).unwrap();
        }

        Recall::process_files(&fx.server, 5, TAPE).unwrap();
        assert_eq!(fx.connector.responses(), vec![(101, true)]);

        // second event arrives before the finalization step
        let rec_b = stage_migrated(&fx, 2, 10, b"second");
        Intake::add_job(&fx.server, &rec_b, TAPE, 5).unwrap();

        Recall::finish_request(&fx.server, 5, TAPE);

        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::count_remaining(&conn, 5, TAPE).unwrap(), 1);
            let requests = Request::all(&conn).unwrap();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].state, RequestState::New);
        }

        // second cycle drains the request
        fx.server.inventory.claim_for_recall(TAPE).unwrap().unwrap();
        {
            let conn = fx.server.db.conn();
            Request::set_state(&conn, 5, TAPE, RequestState::InProgress).unwrap();
        }
        Recall::exec_request(&fx.server, 5, TAPE);

        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::all(&conn).unwrap().len(), 0);
            assert_eq!(Request::all(&conn).unwrap().len(), 0);
        }
        assert_eq!(fx.connector.responses(), vec![(101, true), (102, true)]);
    }

    // Tape size mismatch: the recorded size exceeds what the tape holds;
    // the copy clamps to the tape size and the file is forced resident
    // even though premigration was requested.
    #[test]
    fn test_tape_size_mismatch_clamps_and_forces_resident() {
        let fx = fixture();
        fx.server.inventory.mount(DRIVE, TAPE).unwrap();

        let payload = vec![9u8; 2048];
        let mut rec = stage_migrated(&fx, 6, 0, &payload);
        rec.to_resident = false;
        let path = rec.filename.clone().unwrap();

        // the tape holds less than the recorded size
        let tape_path = fx.fs.tape_path(fuid(6), TAPE);
        fs::OpenOptions::new()
            .write(true)
            .open(&tape_path)
            .unwrap()
            .set_len(1024)
            .unwrap();

        let handles = fx.server.start();
        fx.connector.post_event(rec);

        assert!(fx.connector.wait_responses(1, Duration::from_secs(10)));
        assert_eq!(fx.connector.responses(), vec![(106, true)]);
        assert!(fx
            .server
            .sched
            .wait_request_update(1, Duration::from_secs(10)));

        assert_eq!(
            mig_state(&fx, 6),
            FileState::Resident,
            "a clamped recall can no longer be a premigration"
        );
        assert!(fx.fs.open(fuid(6)).unwrap().attribute().is_err());

        let content = fs::read(path).unwrap();
        assert_eq!(&content[..1024], &payload[..1024]);

        fx.server.shutdown(false);
        handles.join();
    }

    // Forced termination: the byte loop aborts, the file stays migrated,
    // unattempted jobs keep their rows, and cleanup answers their events.
    #[test]
    fn test_forced_termination_aborts_copy_and_keeps_rows() {
        let fx = fixture();
        fx.server.inventory.mount(DRIVE, TAPE).unwrap();

        let payload = vec![1u8; 10 * 1024 * 1024];
        let rec = stage_migrated(&fx, 7, 0, &payload);
        Intake::add_job(&fx.server, &rec, TAPE, 5).unwrap();

        fx.server.shutdown(true);

        let aborted = Recall::recall_file(
            &fx.server,
            &rec,
            TAPE,
            FileState::Migrated,
            FileState::Resident,
        );
        assert!(matches!(aborted, Err(TapeFlowError::Terminated(_))));
        assert_eq!(mig_state(&fx, 7), FileState::Migrated);

        // the executor stops picking up jobs, rows and events survive
        Recall::process_files(&fx.server, 5, TAPE).unwrap();
        assert!(fx.connector.responses().is_empty());
        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::count_remaining(&conn, 5, TAPE).unwrap(), 1);
        }

        Intake::cleanup_events(&fx.server).unwrap();
        assert_eq!(fx.connector.responses(), vec![(107, false)]);
    }

    // An event for a file that is already resident is answered success
    // without touching the queue; finish_recall runs exactly once.
    #[test]
    fn test_already_resident_on_intake() {
        let fx = fixture();

        let path = fx.fs.data_root().join("resident");
        fs::write(&path, b"data").unwrap();
        fx.fs.register(fuid(8), &path);

        let handles = fx.server.start();
        fx.connector.post_event(RecInfo {
            fuid: fuid(8),
            filename: Some(path.to_string_lossy().into_owned()),
            to_resident: true,
            conn_info: 108,
        });

        assert!(fx.connector.wait_responses(1, Duration::from_secs(10)));
        assert_eq!(fx.connector.responses(), vec![(108, true)]);

        {
            let conn = fx.server.db.conn();
            assert_eq!(Job::all(&conn).unwrap().len(), 0);
            assert_eq!(Request::all(&conn).unwrap().len(), 0);
        }
        assert_eq!(fx.fs.finish_log(), vec![(fuid(8), FileState::Resident)]);

        fx.server.shutdown(false);
        handles.join();
    }

    // Graceful shutdown with queued but unscheduled work: intake drains,
    // outstanding events are answered failed, the threads exit.
    #[test]
    fn test_graceful_shutdown_answers_outstanding_events() {
        let fx = fixture();
        // the scheduler never picks the tape up
        fx.server.sched.set_suspended(TAPE, true);

        let handles = fx.server.start();

        let rec = stage_migrated(&fx, 9, 0, b"stuck");
        fx.connector.post_event(rec);

        assert!(wait_until(Duration::from_secs(10), || {
            let conn = fx.server.db.conn();
            Job::all(&conn).map(|jobs| jobs.len() == 1).unwrap_or(false)
        }));

        fx.server.shutdown(false);
        handles.join();

        assert_eq!(fx.connector.responses(), vec![(109, false)]);
        assert_eq!(mig_state(&fx, 9), FileState::Migrated);
    }
}
