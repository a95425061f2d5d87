use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;

use crate::error::TapeFlowError;
use crate::fsobj::Fuid;

/// One recall event as delivered by the event transport.
///
/// `conn_info` is the transport's opaque handle; it is echoed back in the
/// response and stored with the job row. A handle of zero marks the wakeup
/// sentinel and never reaches the queue.
#[derive(Debug, Clone, Default)]
pub struct RecInfo {
    pub fuid: Fuid,
    pub filename: Option<String>,
    pub to_resident: bool,
    pub conn_info: i64,
}

impl RecInfo {
    #[allow(dead_code)]
    pub fn sentinel() -> Self {
        RecInfo::default()
    }

    pub fn is_sentinel(&self) -> bool {
        self.conn_info == 0
    }
}

/// The event transport the intake loop is attached to.
///
/// Implementations must answer every delivered event exactly once via
/// `respond`, successfully or not.
pub trait Connector: Send + Sync {
    fn init_recalls(&self) -> Result<(), TapeFlowError>;
    fn end_recalls(&self);

    /// Blocks until the next event arrives; `None` once the transport has
    /// shut down.
    fn get_event(&self) -> Option<RecInfo>;

    fn respond(&self, rec: &RecInfo, success: bool);

    /// Moment the connector came up, handed to filesystems on re-attach.
    fn start_time(&self) -> i64;

    /// Closes the transport so `get_event` returns `None`.
    fn shutdown(&self);
}

/// In-process connector backed by a channel pair.
///
/// Applications (and tests) post events with [`ChannelConnector::post_event`]
/// and observe responses through [`ChannelConnector::responses`].
pub struct ChannelConnector {
    tx: Mutex<Option<Sender<RecInfo>>>,
    rx: Receiver<RecInfo>,
    responses: Mutex<Vec<(i64, bool)>>,
    response_cv: Condvar,
    start_time: i64,
}

impl ChannelConnector {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        ChannelConnector {
            tx: Mutex::new(Some(tx)),
            rx,
            responses: Mutex::new(Vec::new()),
            response_cv: Condvar::new(),
            start_time: Utc::now().timestamp(),
        }
    }

    #[allow(dead_code)]
    pub fn post_event(&self, rec: RecInfo) {
        let tx = self.tx.lock().expect("connector sender mutex poisoned");
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(rec).is_err() {
                    warn!("Dropping recall event: connector already shut down");
                }
            }
            None => warn!("Dropping recall event: connector already shut down"),
        }
    }

    /// Responses recorded so far as `(conn_info, success)` pairs.
    #[allow(dead_code)]
    pub fn responses(&self) -> Vec<(i64, bool)> {
        self.responses
            .lock()
            .expect("connector response mutex poisoned")
            .clone()
    }

    /// Waits until at least `count` responses have been recorded.
    #[allow(dead_code)]
    pub fn wait_responses(&self, count: usize, timeout: Duration) -> bool {
        let guard = self
            .responses
            .lock()
            .expect("connector response mutex poisoned");
        let (guard, result) = self
            .response_cv
            .wait_timeout_while(guard, timeout, |responses| responses.len() < count)
            .expect("connector response mutex poisoned");
        drop(guard);
        !result.timed_out()
    }
}

impl Default for ChannelConnector {
    fn default() -> Self {
        ChannelConnector::new()
    }
}

impl Connector for ChannelConnector {
    fn init_recalls(&self) -> Result<(), TapeFlowError> {
        Ok(())
    }

    fn end_recalls(&self) {}

    fn get_event(&self) -> Option<RecInfo> {
        self.rx.recv().ok()
    }

    fn respond(&self, rec: &RecInfo, success: bool) {
        let mut responses = self
            .responses
            .lock()
            .expect("connector response mutex poisoned");
        responses.push((rec.conn_info, success));
        self.response_cv.notify_all();
    }

    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn shutdown(&self) {
        self.tx
            .lock()
            .expect("connector sender mutex poisoned")
            .take();
    }
}
