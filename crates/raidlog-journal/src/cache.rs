//! Write-back cache state machine
//!
//! In write-back mode full-page writes are completed once their data is in
//! the journal. The stripe stays in the array's stripe cache with those
//! columns marked in-cache until reclaim freezes it, parity is computed and
//! journaled, and the stripe is finally written to the member disks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use raidlog_common::{CacheMode, Error, Result};
use tracing::{debug, info, warn};

use crate::log::Log;
use crate::stripe::{CacheState, DevFlags, Stripe, StripeFlags, StripeState};

/// Write-back cache bookkeeping
#[derive(Debug)]
pub(crate) struct WriteBackCache {
    pub(crate) mode: Mutex<CacheMode>,
    /// Stripes with at least this many cached columns are flushed by reclaim
    pub(crate) flush_threshold: AtomicUsize,
    /// Stripes with a journal start, oldest first
    pub(crate) stripe_in_cache: Mutex<VecDeque<Arc<Stripe>>>,
    /// Stripes with data only in the journal
    pub(crate) cached_stripes: AtomicUsize,
    pub(crate) read_full_hits: AtomicU64,
    pub(crate) read_partial_hits: AtomicU64,
    pub(crate) read_misses: AtomicU64,
}

impl WriteBackCache {
    pub(crate) fn new(mode: CacheMode, flush_threshold: usize) -> Self {
        Self {
            mode: Mutex::new(mode),
            flush_threshold: AtomicUsize::new(flush_threshold),
            stripe_in_cache: Mutex::new(VecDeque::new()),
            cached_stripes: AtomicUsize::new(0),
            read_full_hits: AtomicU64::new(0),
            read_partial_hits: AtomicU64::new(0),
            read_misses: AtomicU64::new(0),
        }
    }
}

/// Where a write to a stripe goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dirtying {
    /// Nothing for the cache to do, the regular write path applies
    Bypass,
    /// The stripe was frozen and is written through
    WriteThrough,
    /// This many columns were marked for the cache; journal them with
    /// [`Log::cache_data`] once drained
    Cache(usize),
}

impl Log {
    pub fn cache_mode(&self) -> CacheMode {
        *self.cache.mode.lock()
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        let mut current = self.cache.mode.lock();
        if *current != mode {
            info!(from = %*current, to = %mode, "journal cache mode changed");
            *current = mode;
        }
    }

    /// Set the cache mode from its name or index
    pub fn store_cache_mode(&self, value: &str) -> Result<CacheMode> {
        let mode: CacheMode = value.trim().parse()?;
        self.set_cache_mode(mode);
        Ok(mode)
    }

    pub fn flush_threshold(&self) -> usize {
        self.cache.flush_threshold.load(Ordering::Acquire)
    }

    /// Stripes whose data is only in the journal
    pub fn cached_stripes(&self) -> usize {
        self.cache.cached_stripes.load(Ordering::Acquire)
    }

    /// Decide how a write to `stripe` is handled. Call with the write queued
    /// on its columns (`towrite`) but not drained into the pages.
    pub fn handle_stripe_dirtying(&self, stripe: &Stripe) -> Dirtying {
        let mut st = stripe.lock();
        if st.cache_state >= CacheState::Frozen {
            return Dirtying::Bypass;
        }
        if self.cache_mode() == CacheMode::WriteThrough
            || self.array.is_quiescing()
            || self.array.is_degraded()
        {
            self.freeze_locked(stripe, &mut st);
            return Dirtying::WriteThrough;
        }
        // partial writes need the old data for parity
        if st.devs.iter().any(|dev| {
            dev.towrite
                && !dev.flags.contains(DevFlags::OVERWRITE)
                && !dev.flags.contains(DevFlags::IN_CACHE)
        }) {
            self.freeze_locked(stripe, &mut st);
            return Dirtying::WriteThrough;
        }

        let mut to_cache = 0;
        for dev in st.devs.iter_mut().filter(|dev| dev.towrite) {
            dev.flags
                .insert(DevFlags::WANT_CACHE | DevFlags::WANT_DRAIN | DevFlags::LOCKED);
            to_cache += 1;
        }
        Dirtying::Cache(to_cache)
    }

    /// Stop a stripe from accepting cached writes so it can be written out
    pub fn freeze_stripe_for_reclaim(&self, stripe: &Stripe) {
        let mut st = stripe.lock();
        self.freeze_locked(stripe, &mut st);
    }

    fn freeze_locked(&self, stripe: &Stripe, st: &mut StripeState) {
        if st.cache_state >= CacheState::Frozen {
            warn!(stripe = stripe.sector(), state = ?st.cache_state, "stripe frozen twice");
        }
        st.cache_state = CacheState::Frozen;
        st.flags.insert(StripeFlags::PREREAD_ACTIVE);
        if st.flags.contains(StripeFlags::IN_R5C_CACHE) {
            st.flags.remove(StripeFlags::IN_R5C_CACHE);
            self.uncount_cached_stripe(stripe);
        }
    }

    fn uncount_cached_stripe(&self, stripe: &Stripe) {
        let dropped = self
            .cache
            .cached_stripes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if dropped.is_err() {
            warn!(stripe = stripe.sector(), "cached stripe count underflow");
        }
    }

    /// A stripe's journal write completed; move its write-back state on
    pub(crate) fn finish_cache_stripe(&self, st: &mut StripeState) -> Result<()> {
        match st.cache_state {
            CacheState::ParityRun => {
                for dev in &mut st.devs {
                    if dev.flags.contains(DevFlags::IN_CACHE) {
                        dev.flags.insert(DevFlags::WANT_WRITE);
                    }
                }
                st.cache_state = CacheState::ParityDone;
                Ok(())
            }
            CacheState::Clean | CacheState::Running => {
                st.cache_state = CacheState::Running;
                self.handle_data_cached(st);
                Ok(())
            }
            other => Err(Error::invariant(format!(
                "journal write completed for a stripe in state {other:?}"
            ))),
        }
    }

    fn handle_data_cached(&self, st: &mut StripeState) {
        let mut cached = 0;
        for dev in &mut st.devs {
            if dev.flags.contains(DevFlags::WANT_CACHE) {
                dev.flags.remove(DevFlags::WANT_CACHE | DevFlags::LOCKED);
                if !dev.flags.contains(DevFlags::IN_CACHE) {
                    dev.flags.insert(DevFlags::IN_CACHE);
                    cached += 1;
                }
            }
        }
        st.dev_in_cache += cached;
        if st.dev_in_cache > 0 && !st.flags.contains(StripeFlags::IN_R5C_CACHE) {
            st.flags.insert(StripeFlags::IN_R5C_CACHE);
            self.cache.cached_stripes.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// The array wrote a stripe to the member disks. Drops the stripe from
    /// the write-back cache once its parity had been journaled. Call without
    /// the stripe lock held.
    pub fn handle_stripe_flush(&self, stripe: &Arc<Stripe>) -> bool {
        let mut in_cache = self.cache.stripe_in_cache.lock();
        let mut st = stripe.lock();
        if st.cache_state != CacheState::ParityDone {
            return false;
        }
        st.cache_state = CacheState::InRaid;

        let mut wake = false;
        for dev in &mut st.devs {
            dev.flags.remove(DevFlags::IN_CACHE | DevFlags::UPTODATE);
            if dev.flags.contains(DevFlags::OVERLAP) {
                dev.flags.remove(DevFlags::OVERLAP);
                wake = true;
            }
        }
        st.dev_in_cache = 0;
        st.journal_start = None;
        drop(st);

        if let Some(pos) = in_cache.iter().position(|s| Arc::ptr_eq(s, stripe)) {
            in_cache.remove(pos);
        }
        drop(in_cache);

        if wake {
            self.array.wake_overlap();
        }
        true
    }

    /// Recompute the flush threshold from the stripe cache pressure
    pub fn adjust_flush_threshold(&self) -> usize {
        let geometry = self.array.geometry();
        let pressure = self.array.cache_pressure();
        let cached = self.cached_stripes();
        let current = self.flush_threshold();

        let threshold = if pressure.inactive_blocked || cached * 2 > pressure.max_stripes {
            1
        } else if cached * 4 > pressure.max_stripes {
            geometry.data_disks() / 2
        } else if cached * 8 > pressure.max_stripes {
            geometry.data_disks().saturating_sub(1)
        } else {
            geometry.data_disks()
        };

        if threshold >= 1 && threshold != current {
            debug!(from = current, to = threshold, cached, "flush threshold changed");
            self.cache.flush_threshold.store(threshold, Ordering::Release);
        }
        self.flush_threshold()
    }

    /// Freeze and hand back to the array every cached stripe with at least
    /// the flush threshold of columns in the cache. Returns how many.
    pub fn cache_reclaim(&self) -> usize {
        if self.cache_mode() != CacheMode::WriteBack {
            return 0;
        }
        let threshold = self.adjust_flush_threshold();
        let stripes = self
            .array
            .drain_cached_stripes(&mut |st: &StripeState| st.dev_in_cache >= threshold);
        let flushed = stripes.len();
        for stripe in stripes {
            self.flush_cached_stripe(stripe);
        }
        if self.array.cache_pressure().inactive_blocked {
            self.array.wake_overlap();
        }
        flushed
    }

    /// Write every cached stripe out. Returns how many.
    pub fn flush_cache(&self) -> usize {
        let stripes = self.array.drain_cached_stripes(&mut |_| true);
        let flushed = stripes.len();
        for stripe in stripes {
            self.flush_cached_stripe(stripe);
        }
        if flushed > 0 {
            info!(stripes = flushed, "flushing journal cache");
        }
        flushed
    }

    fn flush_cached_stripe(&self, stripe: Arc<Stripe>) {
        {
            let mut st = stripe.lock();
            self.freeze_locked(&stripe, &mut st);
            st.flags.insert(StripeFlags::HANDLE);
        }
        self.array.release_stripe(stripe);
    }
}

/// Route a write through the cache if the array has a journal
pub fn handle_stripe_dirtying(log: Option<&Log>, stripe: &Stripe) -> Dirtying {
    log.map_or(Dirtying::Bypass, |log| log.handle_stripe_dirtying(stripe))
}
