//! Journal runtime: device I/O workers, completion handling and the reclaim
//! thread around a [`Log`]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use raidlog_common::{Error, JournalConfig, Result, Sector};
use tracing::{error, info, warn};

use crate::array::RaidArray;
use crate::completion::{Completion, IoRequest};
use crate::device::BlockDevice;
use crate::log::Log;
use crate::ring::Ring;

/// How often idle threads look at the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running journal
pub struct Journal {
    log: Arc<Log>,
    /// Stops the I/O and completion threads
    shutdown: Arc<AtomicBool>,
    /// Stops the reclaim thread, which is restarted by [`Journal::resume`]
    reclaim_stop: Arc<AtomicBool>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Journal {
    /// Recover the journal on `device` and start its threads
    pub fn open(
        device: Arc<dyn BlockDevice>,
        array: Arc<dyn RaidArray>,
        config: JournalConfig,
    ) -> Result<Self> {
        let (log, requests) = Log::open(Arc::clone(&device), array, config)?;
        let log = Arc::new(log);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let journal = Self {
            log: Arc::clone(&log),
            shutdown: Arc::clone(&shutdown),
            reclaim_stop: Arc::new(AtomicBool::new(false)),
            reclaim_handle: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        {
            let mut workers = journal.workers.lock();
            for i in 0..log.config().io_workers.max(1) {
                let worker = IoWorker {
                    device: Arc::clone(&device),
                    ring: *log.ring(),
                    requests: requests.clone(),
                    done: done_tx.clone(),
                    shutdown: Arc::clone(&shutdown),
                };
                workers.push(spawn(format!("raidlog-io-{i}"), move || worker.run())?);
            }
            let completer = Arc::clone(&log);
            let stop = Arc::clone(&shutdown);
            workers.push(spawn("raidlog-complete".to_string(), move || {
                run_completions(&completer, &done_rx, &stop);
            })?);
        }
        journal.start_reclaim()?;

        info!(
            array = %log.array.id(),
            size = log.ring().size(),
            mode = %log.cache_mode(),
            "journal started"
        );
        Ok(journal)
    }

    #[must_use]
    pub const fn log(&self) -> &Arc<Log> {
        &self.log
    }

    fn start_reclaim(&self) -> Result<()> {
        let mut handle = self.reclaim_handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.reclaim_stop.store(false, Ordering::Release);

        let log = Arc::clone(&self.log);
        let stop = Arc::clone(&self.reclaim_stop);
        *handle = Some(spawn("raidlog-reclaim".to_string(), move || {
            info!("journal reclaim thread started");
            let interval = log.config().reclaim_interval();
            while !stop.load(Ordering::Acquire) {
                log.reclaim_signal.wait(interval);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = log.reclaim_pass() {
                    report(&e, "journal reclaim failed");
                }
            }
            info!("journal reclaim thread stopped");
        })?);
        Ok(())
    }

    fn stop_reclaim(&self) {
        self.reclaim_stop.store(true, Ordering::Release);
        self.log.reclaim_signal.notify();
        if let Some(handle) = self.reclaim_handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Drain the journal for teardown: submit the open unit, wait for every
    /// unit to retire and write the final tail, which is the start of the
    /// last retired unit. The array must keep running stripes until this
    /// returns.
    pub fn quiesce(&self) -> Result<()> {
        self.log.in_teardown.store(true, Ordering::Release);
        self.log.write_stripe_run()?;
        self.log.wake_reclaim(Sector::MAX);
        self.stop_reclaim();
        self.log.do_reclaim();
        self.log.update_super()?;
        info!(tail = self.log.last_checkpoint().sector, "journal quiesced");
        Ok(())
    }

    /// Restart reclaim after [`Journal::quiesce`]
    pub fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.log.in_teardown.store(false, Ordering::Release);
        self.start_reclaim()
    }

    /// Quiesce and stop every thread
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.quiesce();
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("journal stopped");
        result
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "journal shutdown failed");
        }
    }
}

/// Broken invariants are bugs; anything else is the device acting up and
/// has already marked the journal faulty
fn report(err: &Error, what: &str) {
    if err.is_fatal() {
        error!(error = %err, "{what}");
    } else {
        warn!(error = %err, "{what}");
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| Error::internal(format!("failed to spawn journal thread: {e}")))
}

/// Executes device requests. Holds no reference to the log so requests
/// never wait on its locks.
struct IoWorker {
    device: Arc<dyn BlockDevice>,
    ring: Ring,
    requests: Receiver<IoRequest>,
    done: Sender<Completion>,
    shutdown: Arc<AtomicBool>,
}

impl IoWorker {
    fn run(self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.requests.recv_timeout(POLL_INTERVAL) {
                Ok(request) => {
                    let completion = request.execute(&*self.device, &self.ring);
                    if self.done.send(completion).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

fn run_completions(log: &Log, done: &Receiver<Completion>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match done.recv_timeout(POLL_INTERVAL) {
            Ok(completion) => {
                if let Err(e) = log.handle_completion(completion) {
                    report(&e, "journal completion failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
