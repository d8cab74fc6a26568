//! Reclaiming journal space
//!
//! Space between the durable tail (`last_checkpoint`) and the oldest unit
//! still in flight (`next_checkpoint`) is reclaimable. Reclaim moves the
//! superblock's tail forward over it, bounded by the oldest stripe whose
//! data still lives only in the write-back cache.

use std::sync::atomic::Ordering;

use raidlog_common::{Result, Sector};
use tracing::{debug, info, warn};

use crate::io_unit::IoLists;
use crate::log::Log;
use crate::ring::JournalPos;
use crate::stripe::StripeFlags;

impl Log {
    /// Space that moving the tail up to the next checkpoint would free
    pub fn reclaimable_space(&self) -> Sector {
        let lists = self.lists.lock();
        self.reclaimable_locked(&lists)
    }

    pub(crate) fn reclaimable_locked(&self, lists: &IoLists) -> Sector {
        self.ring.distance(
            self.last_checkpoint.load(Ordering::Acquire),
            lists.next_checkpoint.sector,
        )
    }

    /// Ask the reclaim thread for at least `space` sectors. Only ever raises
    /// the pending target; a lower request than the current one is dropped.
    pub fn wake_reclaim(&self, space: Sector) {
        let mut target = self.reclaim_target.load(Ordering::Acquire);
        loop {
            if space < target {
                return;
            }
            match self.reclaim_target.compare_exchange_weak(
                target,
                space,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => target = current,
            }
        }
        self.reclaim_signal.notify();
    }

    /// Pending reclaim target
    pub fn reclaim_target(&self) -> Sector {
        self.reclaim_target.load(Ordering::Acquire)
    }

    /// Wait for enough units to retire to satisfy the reclaim target, then
    /// let the stripes parked for space try again. Returns the reclaimable
    /// space found.
    pub fn do_reclaim(&self) -> Sector {
        let target = self.reclaim_target.swap(0, Ordering::AcqRel);
        let poll = self.config.reclaim_interval();

        let reclaimable = {
            let mut lists = self.lists.lock();
            loop {
                let reclaimable = self.reclaimable_locked(&lists);
                if reclaimable >= target || lists.is_idle() {
                    break reclaimable;
                }
                self.array.wakeup();
                while self.reclaimable_locked(&lists) <= reclaimable && !lists.is_idle() {
                    self.iounit_wait.wait_for(&mut lists, poll);
                }
            }
        };
        if reclaimable == 0 {
            return 0;
        }

        debug!(target, reclaimable, "reclaimed journal space");
        self.run_no_space_stripes();
        reclaimable
    }

    fn run_no_space_stripes(&self) {
        let parked: Vec<_> = self.no_space_stripes.lock().drain(..).collect();
        for stripe in parked {
            stripe.lock().flags.insert(StripeFlags::HANDLE);
            self.array.release_stripe(stripe);
        }
    }

    /// Move the durable tail up to the oldest position still needed: the
    /// first cached stripe's journal start or, with nothing cached, the next
    /// checkpoint.
    pub fn update_super(&self) -> Result<()> {
        let (end, next) = {
            let in_cache = self.cache.stripe_in_cache.lock();
            let oldest = in_cache.front().map(|stripe| stripe.lock().journal_start);
            let next = self.lists.lock().next_checkpoint;
            match oldest {
                None => (next, next),
                Some(Some(pos)) => (pos, next),
                Some(None) => {
                    warn!("cached stripe without a journal start");
                    return Ok(());
                }
            }
        };
        let last = self.last_checkpoint.load(Ordering::Acquire);
        if end.sector == last {
            return Ok(());
        }
        if !self.tail_move_in_range(last, end.sector, next.sector) {
            warn!(
                tail = last,
                end = end.sector,
                next = next.sector,
                "refusing to move the journal tail outside the retired range"
            );
            return Ok(());
        }
        self.write_super_and_discard(end)
    }

    /// `end` lies in `(last, next]` going forward around the ring
    pub(crate) fn tail_move_in_range(&self, last: Sector, end: Sector, next: Sector) -> bool {
        let moved = self.ring.distance(last, end);
        moved > 0 && moved <= self.ring.distance(last, next)
    }

    fn write_super_and_discard(&self, end: JournalPos) -> Result<()> {
        let start = self.last_checkpoint.load(Ordering::Acquire);
        self.array.set_journal_tail(end.sector);
        self.commit_superblock()?;

        if self.device.supports_discard() {
            let len = self.ring.distance(start, end.sector);
            for (sector, len) in self.ring.extents(start, len).into_iter().flatten() {
                if let Err(e) = self.device.discard(sector, len) {
                    debug!(sector, len, error = %e, "journal discard failed");
                }
            }
        }

        let _head = self.head.lock();
        self.last_checkpoint.store(end.sector, Ordering::Release);
        self.last_cp_seq.store(end.seq, Ordering::Release);
        debug!(tail = end.sector, seq = end.seq, "journal tail moved");
        Ok(())
    }

    /// Make the new tail durable. Outside teardown the array thread writes
    /// the superblock; once teardown starts it may no longer be running, so
    /// a waiting commit gives up and the superblock is written here.
    fn commit_superblock(&self) -> Result<()> {
        if self.in_teardown.load(Ordering::Acquire) {
            return self.array.write_superblock();
        }
        if self.array.commit_superblock(&self.in_teardown)? {
            return Ok(());
        }
        info!("teardown raced a superblock commit, writing it directly");
        self.array.write_superblock()
    }

    /// One pass of the reclaim thread
    pub fn reclaim_pass(&self) -> Result<()> {
        self.cache_reclaim();
        self.do_reclaim();
        self.update_super()?;
        self.array.wakeup();
        Ok(())
    }
}
