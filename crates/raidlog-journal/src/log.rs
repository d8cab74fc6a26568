//! The journal log and its write path
//!
//! Locks, outermost first:
//!
//! - `head` (io mutex): builds the open I/O unit, owns the log head
//! - `cache.stripe_in_cache`, then a stripe's own lock
//! - `lists` (list lock): the I/O unit arena and lifecycle lists
//! - `no_space_stripes`
//!
//! Completion and reclaim never take `head` while holding `lists`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use raidlog_common::{
    BLOCK_SECTORS, Error, JournalConfig, Result, Sector, blocks_to_sectors, page_checksum,
    uuid_seed,
};
use tracing::{debug, error, info, warn};

use crate::array::RaidArray;
use crate::cache::WriteBackCache;
use crate::completion::{IoRequest, LogWrite};
use crate::device::BlockDevice;
use crate::io_unit::{IoLists, UnitId};
use crate::meta::{MetaBlockWriter, Payload, fits_in_block, payload_meta_size};
use crate::page::{Page, PagePool};
use crate::recovery;
use crate::ring::{JournalPos, Ring};
use crate::stripe::{CacheState, DevFlags, Stripe, StripeFlags};

/// What happened to a stripe handed to the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOutcome {
    /// Appended to the open I/O unit
    Journaled,
    /// Parked; released again once the condition clears
    Parked(ParkReason),
    /// Not journaled, the caller writes the stripe to the member disks
    Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkReason {
    /// Not enough free log space, reclaim was asked for more
    NoSpace,
    /// Every I/O unit slot is in flight
    NoMem,
}

/// What to do with a flush request from the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDisposition {
    /// The array has no journal
    NoJournal,
    /// Empty flush, complete it right away
    Completed,
    /// Carries data: strip the flush flag and write it normally
    Continue,
}

/// Head of the log, guarded by the io mutex
#[derive(Debug)]
pub(crate) struct LogHead {
    /// Where the next metadata block goes
    pub(crate) log_start: Sector,
    /// Sequence number of the next metadata block
    pub(crate) seq: u64,
    pub(crate) current: Option<OpenUnit>,
}

/// The I/O unit being filled
#[derive(Debug)]
pub(crate) struct OpenUnit {
    id: UnitId,
    writer: MetaBlockWriter,
    pages: Vec<Bytes>,
    stripes: Vec<Arc<Stripe>>,
    log_start: Sector,
    log_end: Sector,
}

impl OpenUnit {
    fn append(
        &mut self,
        ring: &Ring,
        log_start: &mut Sector,
        payload: &Payload,
        pages: &[&Page],
    ) -> Result<()> {
        if !self.writer.append(payload) {
            return Err(Error::invariant(format!(
                "metadata block at {} overflowed",
                self.log_start
            )));
        }
        for page in pages {
            self.pages.push(page.to_bytes());
            *log_start = ring.add(*log_start, BLOCK_SECTORS);
        }
        self.log_end = *log_start;
        Ok(())
    }
}

/// Wake-up flag for the reclaim thread
#[derive(Debug, Default)]
pub(crate) struct ReclaimSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl ReclaimSignal {
    pub(crate) fn notify(&self) {
        *self.woken.lock() = true;
        self.cond.notify_one();
    }

    /// Wait for a notification or the timeout, true if notified
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cond.wait_for(&mut woken, timeout);
        }
        std::mem::replace(&mut *woken, false)
    }
}

/// Journal state for one array
pub struct Log {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) array: Arc<dyn RaidArray>,
    pub(crate) config: JournalConfig,
    pub(crate) seed: u32,
    pub(crate) ring: Ring,
    pub(crate) max_free_space: Sector,
    pub(crate) need_cache_flush: AtomicBool,
    pub(crate) in_teardown: AtomicBool,
    pub(crate) faulty: AtomicBool,
    pub(crate) head: Mutex<LogHead>,
    /// Durable tail. Only written with `head` held.
    pub(crate) last_checkpoint: AtomicU64,
    pub(crate) last_cp_seq: AtomicU64,
    pub(crate) lists: Mutex<IoLists>,
    /// Signalled whenever I/O units retire
    pub(crate) iounit_wait: Condvar,
    pub(crate) no_space_stripes: Mutex<VecDeque<Arc<Stripe>>>,
    pub(crate) reclaim_target: AtomicU64,
    pub(crate) reclaim_signal: ReclaimSignal,
    pub(crate) cache: WriteBackCache,
    pub(crate) meta_pool: PagePool,
    submit_tx: Sender<IoRequest>,
}

impl Log {
    /// Load the log from `device`, replay it onto the array's member disks
    /// and get ready to append. Returns the queue of device requests the
    /// caller must execute and complete through
    /// [`handle_completion`](Self::handle_completion).
    pub fn open(
        device: Arc<dyn BlockDevice>,
        array: Arc<dyn RaidArray>,
        config: JournalConfig,
    ) -> Result<(Self, Receiver<IoRequest>)> {
        config.validate()?;
        let seed = uuid_seed(&array.id());
        let loaded = recovery::load(&*device, &*array, &config, seed)?;
        let need_cache_flush = config
            .need_cache_flush
            .unwrap_or_else(|| device.needs_flush());
        let flush_threshold = array.geometry().data_disks();
        let (submit_tx, submit_rx) = crossbeam_channel::unbounded();

        info!(
            array = %array.id(),
            size = loaded.ring.size(),
            tail = loaded.checkpoint.sector,
            head = loaded.head.sector,
            seq = loaded.head.seq,
            need_cache_flush,
            mode = %config.cache_mode,
            "journal opened"
        );

        let log = Self {
            seed,
            ring: loaded.ring,
            max_free_space: loaded.max_free_space,
            need_cache_flush: AtomicBool::new(need_cache_flush),
            in_teardown: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            head: Mutex::new(LogHead {
                log_start: loaded.head.sector,
                seq: loaded.head.seq,
                current: None,
            }),
            last_checkpoint: AtomicU64::new(loaded.checkpoint.sector),
            last_cp_seq: AtomicU64::new(loaded.checkpoint.seq),
            lists: Mutex::new(IoLists::new(config.pool_size, loaded.checkpoint)),
            iounit_wait: Condvar::new(),
            no_space_stripes: Mutex::new(VecDeque::new()),
            reclaim_target: AtomicU64::new(0),
            reclaim_signal: ReclaimSignal::default(),
            cache: WriteBackCache::new(config.cache_mode, flush_threshold),
            meta_pool: PagePool::new(config.pool_size),
            submit_tx,
            device,
            array,
            config,
        };
        Ok((log, submit_rx))
    }

    /// Checksum seed derived from the array UUID
    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.seed
    }

    #[must_use]
    pub const fn ring(&self) -> &Ring {
        &self.ring
    }

    #[must_use]
    pub const fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Reclaimable space past which reclaim starts on its own
    #[must_use]
    pub const fn max_free_space(&self) -> Sector {
        self.max_free_space
    }

    /// Where the next metadata block goes and the sequence it gets
    pub fn head(&self) -> JournalPos {
        let head = self.head.lock();
        JournalPos::new(head.log_start, head.seq)
    }

    /// Durable tail
    pub fn last_checkpoint(&self) -> JournalPos {
        JournalPos::new(
            self.last_checkpoint.load(Ordering::Acquire),
            self.last_cp_seq.load(Ordering::Acquire),
        )
    }

    /// Where the tail can move once the units in flight retire
    pub fn next_checkpoint(&self) -> JournalPos {
        self.lists.lock().next_checkpoint
    }

    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::Acquire)
    }

    pub fn need_cache_flush(&self) -> bool {
        self.need_cache_flush.load(Ordering::Acquire)
    }

    /// Turn the flush-before-durable step on or off
    pub fn set_need_cache_flush(&self, enabled: bool) -> Result<()> {
        let was = self.need_cache_flush.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "journal cache flush changed");
            // units parked for a flush that will no longer be issued
            self.flush_stripe_to_raid()?;
        }
        Ok(())
    }

    /// Whether `size` more sectors can be appended right now
    pub fn has_free_space(&self, size: Sector) -> bool {
        let head = self.head.lock();
        self.has_free_space_locked(&head, size)
    }

    fn has_free_space_locked(&self, head: &LogHead, size: Sector) -> bool {
        self.ring.has_free_space(
            self.last_checkpoint.load(Ordering::Acquire),
            head.log_start,
            size,
        )
    }

    pub(crate) fn mark_faulty(&self, err: &Error) {
        if !self.faulty.swap(true, Ordering::AcqRel) {
            error!(error = %err, "journal device failed");
            self.array.journal_failed();
        }
    }

    pub(crate) fn submit(&self, request: IoRequest) -> Result<()> {
        self.submit_tx
            .send(request)
            .map_err(|_| Error::ShuttingDown)
    }

    /// Journal the data and parity of a stripe whose parity is computed.
    /// Fails with [`Error::JournalFaulty`] once the device has failed.
    ///
    /// Appends to the open I/O unit; the unit goes to the device once full
    /// or on [`write_stripe_run`](Self::write_stripe_run).
    pub fn write_stripe(&self, stripe: &Arc<Stripe>) -> Result<JournalOutcome> {
        if self.is_faulty() {
            return Err(Error::JournalFaulty);
        }
        let (write_disks, data_pages, parity_pages) = {
            let mut st = stripe.lock();
            if st.log_io.is_some()
                || !st.devs[stripe.pd_idx()]
                    .flags
                    .contains(DevFlags::WANT_WRITE)
                || st.flags.contains(StripeFlags::SYNCING)
            {
                // already journaled, goes to the member disks now
                st.flags.remove(StripeFlags::LOG_TRAPPED);
                return Ok(JournalOutcome::Bypass);
            }

            match st.cache_state {
                CacheState::Frozen => st.cache_state = CacheState::ParityRun,
                CacheState::ParityRun => {}
                other => warn!(
                    stripe = stripe.sector(),
                    state = ?other,
                    "journaling parity of a stripe that was not frozen"
                ),
            }

            // checksums survive from the attempt that parked the stripe
            let trapped = st.flags.contains(StripeFlags::LOG_TRAPPED);
            let mut write_disks = 0usize;
            for dev in &mut st.devs {
                if !dev.flags.contains(DevFlags::WANT_WRITE)
                    || dev.flags.contains(DevFlags::IN_CACHE)
                {
                    continue;
                }
                write_disks += 1;
                if !trapped {
                    dev.log_checksum = page_checksum(self.seed, dev.page.as_slice());
                }
            }
            let parity_pages = 1 + usize::from(stripe.qd_idx().is_some());
            let data_pages = write_disks.saturating_sub(parity_pages);
            let meta_size = payload_meta_size(data_pages, parity_pages);
            if !fits_in_block(meta_size) {
                return Err(Error::invalid_argument(format!(
                    "stripe {} needs {meta_size} bytes of metadata",
                    stripe.sector()
                )));
            }
            st.flags.insert(StripeFlags::LOG_TRAPPED);
            st.flags.remove(StripeFlags::DELAYED);
            (write_disks, data_pages, parity_pages)
        };

        stripe.pin();
        let reserve = blocks_to_sectors(1 + write_disks as u64);
        let mut head = self.head.lock();
        self.reserve_and_log(&mut head, stripe, reserve, data_pages, parity_pages)
    }

    /// Admit the columns marked want-cache to the write-back cache
    pub fn cache_data(&self, stripe: &Arc<Stripe>, to_cache: usize) -> Result<JournalOutcome> {
        if self.is_faulty() {
            return Err(Error::JournalFaulty);
        }
        if to_cache == 0 {
            return Err(Error::invariant(format!(
                "stripe {} has nothing to cache",
                stripe.sector()
            )));
        }
        {
            let mut st = stripe.lock();
            let mut page_count = 0;
            for dev in &mut st.devs {
                if !dev.flags.contains(DevFlags::WANT_CACHE) {
                    continue;
                }
                dev.log_checksum = page_checksum(self.seed, dev.page.as_slice());
                page_count += 1;
            }
            if page_count != to_cache {
                warn!(
                    stripe = stripe.sector(),
                    page_count, to_cache, "cached column count mismatch"
                );
            }
            let meta_size = payload_meta_size(to_cache, 0);
            if !fits_in_block(meta_size) {
                return Err(Error::invalid_argument(format!(
                    "stripe {} needs {meta_size} bytes of metadata",
                    stripe.sector()
                )));
            }
            st.flags.remove(StripeFlags::DELAYED);
        }

        stripe.pin();
        let reserve = blocks_to_sectors(1 + to_cache as u64);
        let mut head = self.head.lock();
        self.reserve_and_log(&mut head, stripe, reserve, to_cache, 0)
    }

    /// Submit the open I/O unit, if any
    pub fn write_stripe_run(&self) -> Result<()> {
        let mut head = self.head.lock();
        self.submit_current_io(&mut head)
    }

    fn reserve_and_log(
        &self,
        head: &mut LogHead,
        stripe: &Arc<Stripe>,
        reserve: Sector,
        data_pages: usize,
        parity_pages: usize,
    ) -> Result<JournalOutcome> {
        if !self.has_free_space_locked(head, reserve) {
            debug!(stripe = stripe.sector(), reserve, "no log space, parking stripe");
            self.no_space_stripes.lock().push_back(Arc::clone(stripe));
            self.wake_reclaim(reserve);
            return Ok(JournalOutcome::Parked(ParkReason::NoSpace));
        }
        if self.log_stripe(head, stripe, data_pages, parity_pages)? {
            Ok(JournalOutcome::Journaled)
        } else {
            debug!(stripe = stripe.sector(), "no free I/O unit, parking stripe");
            Ok(JournalOutcome::Parked(ParkReason::NoMem))
        }
    }

    /// Append the stripe's descriptors and pages. Returns false, with the
    /// stripe parked on the no-mem list, if no I/O unit could be opened.
    fn log_stripe(
        &self,
        head: &mut LogHead,
        stripe: &Arc<Stripe>,
        data_pages: usize,
        parity_pages: usize,
    ) -> Result<bool> {
        let meta_size = payload_meta_size(data_pages, parity_pages);
        if !self.get_meta(head, meta_size, stripe)? {
            return Ok(false);
        }

        let LogHead {
            log_start, current, ..
        } = head;
        let Some(io) = current.as_mut() else {
            return Err(Error::internal("no open I/O unit"));
        };
        let geometry = self.array.geometry();
        {
            let mut st = stripe.lock();
            for (i, dev) in st.devs.iter().enumerate() {
                // cached columns are already in the log unless rewritten
                let wanted = dev.flags.contains(DevFlags::WANT_CACHE)
                    || (dev.flags.contains(DevFlags::WANT_WRITE)
                        && !dev.flags.contains(DevFlags::IN_CACHE));
                if !wanted || stripe.is_parity(i) {
                    continue;
                }
                let location = geometry.compute_blocknr(stripe.sector(), i);
                io.append(
                    &self.ring,
                    log_start,
                    &Payload::data(location, dev.log_checksum),
                    &[&dev.page],
                )?;
            }

            let pd = &st.devs[stripe.pd_idx()];
            match (parity_pages, stripe.qd_idx()) {
                (0, _) => {}
                (1, None) => io.append(
                    &self.ring,
                    log_start,
                    &Payload::parity(stripe.sector(), pd.log_checksum, None),
                    &[&pd.page],
                )?,
                (2, Some(qd)) => {
                    let q = &st.devs[qd];
                    io.append(
                        &self.ring,
                        log_start,
                        &Payload::parity(stripe.sector(), pd.log_checksum, Some(q.log_checksum)),
                        &[&pd.page, &q.page],
                    )?;
                }
                (n, qd) => {
                    return Err(Error::invariant(format!(
                        "{n} parity pages for stripe {} with Q column {qd:?}",
                        stripe.sector()
                    )));
                }
            }
            st.log_io = Some(io.id);
        }
        io.stripes.push(Arc::clone(stripe));

        // read under the cache list lock so update_super sees either the
        // stripe or a checkpoint no newer than its journal start
        let mut in_cache = self.cache.stripe_in_cache.lock();
        let next_checkpoint = self.lists.lock().next_checkpoint;
        let mut st = stripe.lock();
        if st.journal_start.is_none() {
            st.journal_start = Some(next_checkpoint);
            in_cache.push_back(Arc::clone(stripe));
        }
        Ok(true)
    }

    fn get_meta(&self, head: &mut LogHead, payload_size: usize, waiting: &Arc<Stripe>) -> Result<bool> {
        if head
            .current
            .as_ref()
            .is_some_and(|io| !io.writer.has_room(payload_size))
        {
            self.submit_current_io(head)?;
        }
        if head.current.is_none() {
            return Ok(self.new_meta(head, waiting));
        }
        Ok(true)
    }

    /// Open a new I/O unit at the head. When every slot is taken `waiting`
    /// is parked under the same lock that retiring units take it from.
    fn new_meta(&self, head: &mut LogHead, waiting: &Arc<Stripe>) -> bool {
        let log_start = head.log_start;
        let log_end = self.ring.add(log_start, BLOCK_SECTORS);
        let id = {
            let mut lists = self.lists.lock();
            let Some(id) = lists.alloc(head.seq, log_start, log_end) else {
                lists.no_mem_stripes.push_back(Arc::clone(waiting));
                return false;
            };
            id
        };
        let page = self.meta_pool.acquire();
        head.current = Some(OpenUnit {
            id,
            writer: MetaBlockWriter::new(page, head.seq, log_start),
            pages: Vec::new(),
            stripes: Vec::new(),
            log_start,
            log_end,
        });
        head.seq += 1;
        head.log_start = log_end;
        true
    }

    fn submit_current_io(&self, head: &mut LogHead) -> Result<()> {
        let Some(io) = head.current.take() else {
            return Ok(());
        };
        let meta = io.writer.finish(self.seed);
        self.lists.lock().seal(io.id, io.log_end, io.stripes)?;
        self.submit(IoRequest::Write(LogWrite {
            unit: io.id,
            start: io.log_start,
            meta,
            pages: io.pages,
        }))
    }

    /// Decide what to do with a flush request
    #[must_use]
    pub const fn handle_flush_request(&self, has_data: bool) -> FlushDisposition {
        // the journal is flushed before anything reaches the member disks,
        // so an empty flush has nothing left to wait for
        if has_data {
            FlushDisposition::Continue
        } else {
            FlushDisposition::Completed
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("ring", &self.ring)
            .field("last_checkpoint", &self.last_checkpoint())
            .field("faulty", &self.is_faulty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl Log {
    /// Place the tail and the head anywhere on the ring
    pub(crate) fn set_positions(&self, tail: JournalPos, head: JournalPos) {
        let mut guard = self.head.lock();
        guard.log_start = head.sector;
        guard.seq = head.seq;
        self.last_checkpoint.store(tail.sector, Ordering::Release);
        self.last_cp_seq.store(tail.seq, Ordering::Release);
        self.lists.lock().next_checkpoint = tail;
    }
}

/// Journal a stripe if the array has a journal
pub fn write_stripe(log: Option<&Log>, stripe: &Arc<Stripe>) -> Result<JournalOutcome> {
    log.map_or(Ok(JournalOutcome::Bypass), |log| log.write_stripe(stripe))
}

/// Submit the open I/O unit if the array has a journal
pub fn write_stripe_run(log: Option<&Log>) -> Result<()> {
    log.map_or(Ok(()), Log::write_stripe_run)
}

/// Route a flush request
#[must_use]
pub fn handle_flush_request(log: Option<&Log>, has_data: bool) -> FlushDisposition {
    log.map_or(FlushDisposition::NoJournal, |log| {
        log.handle_flush_request(has_data)
    })
}

/// Writes must stop: the journal is missing or has failed
pub fn log_disk_error(log: Option<&Log>, array: &dyn RaidArray) -> bool {
    log.map_or_else(|| array.has_journal(), Log::is_faulty)
}
