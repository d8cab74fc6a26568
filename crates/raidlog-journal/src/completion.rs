//! Journal device requests and the completion pipeline
//!
//! Submitted units travel running → (io_end → flushing →) finished. A unit
//! only leaves the running list once every unit ahead of it has been
//! written, so stripes reach the member disks in log order.

use std::sync::Arc;

use bytes::Bytes;
use raidlog_common::{BLOCK_SECTORS, Result, Sector};
use tracing::{debug, error};

use crate::device::BlockDevice;
use crate::io_unit::{IoLists, IoUnitState, UnitId};
use crate::log::Log;
use crate::page::Page;
use crate::ring::Ring;
use crate::stripe::{Stripe, StripeFlags};

/// One I/O unit's metadata block and payload pages, written contiguously
/// (modulo wrap) from `start`
#[derive(Debug)]
pub struct LogWrite {
    pub unit: UnitId,
    pub start: Sector,
    pub meta: Page,
    pub pages: Vec<Bytes>,
}

impl LogWrite {
    fn write_to(&self, device: &dyn BlockDevice, ring: &Ring) -> Result<()> {
        device.write_page(self.start, self.meta.as_slice())?;
        let mut sector = ring.add(self.start, BLOCK_SECTORS);
        for page in &self.pages {
            device.write_page(sector, page)?;
            sector = ring.add(sector, BLOCK_SECTORS);
        }
        Ok(())
    }
}

/// Work for the journal device
#[derive(Debug)]
pub enum IoRequest {
    Write(LogWrite),
    /// Empty cache flush covering every write completed before it
    Flush,
}

impl IoRequest {
    /// Run the request against the journal device
    #[must_use]
    pub fn execute(self, device: &dyn BlockDevice, ring: &Ring) -> Completion {
        match self {
            Self::Write(write) => {
                let result = write.write_to(device, ring);
                Completion::Write {
                    unit: write.unit,
                    meta: write.meta,
                    result,
                }
            }
            Self::Flush => Completion::Flush {
                result: device.flush(),
            },
        }
    }
}

/// A finished [`IoRequest`], fed back through [`Log::handle_completion`]
#[derive(Debug)]
pub enum Completion {
    Write {
        unit: UnitId,
        meta: Page,
        result: Result<()>,
    },
    Flush {
        result: Result<()>,
    },
}

impl Log {
    /// Advance the pipeline after a journal device request finished.
    ///
    /// Device errors mark the journal faulty but bookkeeping carries on, the
    /// array decides what to do with a failed journal. Errors returned here
    /// are broken invariants.
    pub fn handle_completion(&self, completion: Completion) -> Result<()> {
        match completion {
            Completion::Write { unit, meta, result } => self.log_endio(unit, meta, result),
            Completion::Flush { result } => self.flush_endio(result),
        }
    }

    fn log_endio(&self, unit: UnitId, meta: Page, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            self.mark_faulty(&e);
        }
        self.meta_pool.release(meta);

        let (stripes, queued) = {
            let mut lists = self.lists.lock();
            lists.set_state(unit, IoUnitState::IoEnd)?;
            let written = lists.pop_written();
            // earlier units still waiting on a flush keep their place even
            // if flushing has since been turned off
            let queued = self.need_cache_flush()
                || !lists.io_end.is_empty()
                || !lists.flushing.is_empty();
            if queued {
                lists.io_end.extend(written);
                (Vec::new(), true)
            } else {
                (finish_units(&mut lists, written)?, false)
            }
        };

        let run = self.run_stripes(stripes);
        if queued {
            self.flush_stripe_to_raid()?;
        }
        run
    }

    /// Issue one cache flush for every unit waiting on the io_end list.
    /// Only one flush is in flight; its completion issues the next.
    pub fn flush_stripe_to_raid(&self) -> Result<()> {
        let mut lists = self.lists.lock();
        if !lists.flushing.is_empty() || lists.io_end.is_empty() {
            return Ok(());
        }
        if !self.need_cache_flush() {
            // flushing was turned off with units still waiting
            let waiting: Vec<UnitId> = lists.io_end.drain(..).collect();
            let stripes = finish_units(&mut lists, waiting)?;
            drop(lists);
            return self.run_stripes(stripes);
        }
        let batch: Vec<UnitId> = lists.io_end.drain(..).collect();
        debug!(units = batch.len(), "flushing journal device");
        lists.flushing.extend(batch);
        drop(lists);
        self.submit(IoRequest::Flush)
    }

    fn flush_endio(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            self.mark_faulty(&e);
        }
        let stripes = {
            let mut lists = self.lists.lock();
            let batch: Vec<UnitId> = lists.flushing.drain(..).collect();
            finish_units(&mut lists, batch)?
        };
        let run = self.run_stripes(stripes);
        self.flush_stripe_to_raid()?;
        run
    }

    /// Hand journaled stripes back to the array
    fn run_stripes(&self, stripes: Vec<Arc<Stripe>>) -> Result<()> {
        let mut first_err = None;
        for stripe in stripes {
            {
                let mut st = stripe.lock();
                if let Err(e) = self.finish_cache_stripe(&mut st) {
                    error!(stripe = stripe.sector(), error = %e, "bad cache state after journal write");
                    first_err.get_or_insert(e);
                }
                st.flags.insert(StripeFlags::HANDLE);
            }
            self.array.release_stripe(stripe);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// The array wrote `stripe` to the member disks
    pub fn stripe_write_finished(&self, stripe: &Stripe) -> Result<()> {
        let Some(id) = stripe.lock().log_io.take() else {
            return Ok(());
        };

        let mut lists = self.lists.lock();
        if !lists.stripe_finished(id)? {
            return Ok(());
        }
        let (retired, wake) = lists.complete_finished();
        if retired == 0 {
            return Ok(());
        }
        let reclaimable = self.reclaimable_locked(&lists);
        drop(lists);

        if reclaimable > self.max_free_space {
            self.wake_reclaim(0);
        }
        self.iounit_wait.notify_all();
        for stripe in wake {
            stripe.lock().flags.insert(StripeFlags::HANDLE);
            self.array.release_stripe(stripe);
        }
        Ok(())
    }
}

/// Move units to the finished list, in order, and collect their stripes
fn finish_units(
    lists: &mut IoLists,
    units: impl IntoIterator<Item = UnitId>,
) -> Result<Vec<Arc<Stripe>>> {
    let mut stripes = Vec::new();
    for id in units {
        stripes.extend(lists.take_stripes(id)?);
        lists.finished.push_back(id);
    }
    Ok(stripes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::JournalPos;
    use crate::test_utils::{MemArray, dirty_stripe, open_log, open_log_on, run_io};
    use crate::device::MemDevice;
    use raidlog_common::JournalConfig;

    #[test]
    fn test_out_of_order_completion_keeps_log_order() {
        let array = MemArray::new(4, 1);
        let (log, rx, _dev) = open_log(&array, 1000);

        let mut stripes = Vec::new();
        for (i, fill) in [(0u64, 0xa), (1, 0xb), (2, 0xc)] {
            let sh = dirty_stripe(&array, i * 8, &[0], fill);
            log.write_stripe(&sh).unwrap();
            log.write_stripe_run().unwrap();
            stripes.push(sh);
        }
        let requests: Vec<IoRequest> = rx.try_iter().collect();
        assert_eq!(requests.len(), 3);
        let mut done: Vec<Completion> = requests
            .into_iter()
            .map(|r| r.execute(&*log.device, log.ring()))
            .collect();
        let c = done.pop().unwrap();
        let b = done.pop().unwrap();
        let a = done.pop().unwrap();

        // B first: nothing may move past A
        log.handle_completion(b).unwrap();
        assert!(array.released().is_empty());
        assert_eq!(log.lists.lock().running.len(), 3);

        log.handle_completion(a).unwrap();
        assert_eq!(array.released(), vec![0, 8]);
        assert_eq!(log.lists.lock().running.len(), 1);

        log.handle_completion(c).unwrap();
        assert_eq!(array.released(), vec![0, 8, 16]);

        // retire: B's member write lands first, the checkpoint waits for A
        let start = log.next_checkpoint();
        log.stripe_write_finished(&stripes[1]).unwrap();
        assert_eq!(log.next_checkpoint(), start);
        log.stripe_write_finished(&stripes[0]).unwrap();
        assert_eq!(log.next_checkpoint(), JournalPos::new(3 * 8, start.seq + 1));
        log.stripe_write_finished(&stripes[2]).unwrap();
        assert_eq!(log.next_checkpoint(), JournalPos::new(2 * 3 * 8, start.seq + 2));
        assert!(log.lists.lock().is_idle());
        // a second notification for the same stripe is ignored
        log.stripe_write_finished(&stripes[2]).unwrap();
    }

    #[test]
    fn test_flush_batches_written_units() {
        let array = MemArray::new(4, 1);
        let dev = Arc::new(MemDevice::new(1000).with_flush(true));
        let (log, rx) = open_log_on(&array, &dev, JournalConfig::default());
        assert!(log.need_cache_flush());

        for i in 0..3u64 {
            let sh = dirty_stripe(&array, i * 8, &[0, 1], 1);
            log.write_stripe(&sh).unwrap();
            log.write_stripe_run().unwrap();
        }
        let writes: Vec<IoRequest> = rx.try_iter().collect();
        let mut done = writes
            .into_iter()
            .map(|r| r.execute(&*log.device, log.ring()));

        // first write: a flush goes out covering it alone
        log.handle_completion(done.next().unwrap()).unwrap();
        assert!(array.released().is_empty());
        assert_eq!(log.lists.lock().flushing.len(), 1);
        let flush = rx.try_recv().unwrap();
        assert!(matches!(flush, IoRequest::Flush));

        // the other two wait behind the flush in flight
        for c in done {
            log.handle_completion(c).unwrap();
        }
        assert!(rx.is_empty());
        assert_eq!(log.lists.lock().io_end.len(), 2);

        log.handle_completion(flush.execute(&*log.device, log.ring()))
            .unwrap();
        assert_eq!(array.released(), vec![0]);
        // one flush for both
        assert_eq!(run_io(&log, &rx), 1);
        assert_eq!(array.released(), vec![0, 8, 16]);
        assert_eq!(dev.flush_count(), 2);
    }

    #[test]
    fn test_disabling_flush_releases_waiting_units() {
        let array = MemArray::new(4, 1);
        let dev = Arc::new(MemDevice::new(1000).with_flush(true));
        let (log, rx) = open_log_on(&array, &dev, JournalConfig::default());

        let a = dirty_stripe(&array, 0, &[0], 1);
        log.write_stripe(&a).unwrap();
        log.write_stripe_run().unwrap();
        let write = rx.try_recv().unwrap();
        log.handle_completion(write.execute(&*log.device, log.ring()))
            .unwrap();
        let flush = rx.try_recv().unwrap();

        let b = dirty_stripe(&array, 8, &[0], 1);
        log.write_stripe(&b).unwrap();
        log.write_stripe_run().unwrap();
        let write = rx.try_recv().unwrap();
        log.handle_completion(write.execute(&*log.device, log.ring()))
            .unwrap();

        // b may not overtake a while a's flush is in flight
        log.set_need_cache_flush(false).unwrap();
        assert!(array.released().is_empty());

        log.handle_completion(flush.execute(&*log.device, log.ring()))
            .unwrap();
        assert_eq!(array.released(), vec![0, 8]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_unit_written_after_disabling_flush_waits_for_earlier_flush() {
        let array = MemArray::new(4, 1);
        let dev = Arc::new(MemDevice::new(1000).with_flush(true));
        let (log, rx) = open_log_on(&array, &dev, JournalConfig::default());

        let a = dirty_stripe(&array, 0, &[0], 1);
        log.write_stripe(&a).unwrap();
        log.write_stripe_run().unwrap();
        let write = rx.try_recv().unwrap();
        log.handle_completion(write.execute(&*log.device, log.ring()))
            .unwrap();
        let flush = rx.try_recv().unwrap();
        assert!(matches!(flush, IoRequest::Flush));

        // flushing goes off while a's flush is still in flight
        log.set_need_cache_flush(false).unwrap();
        let b = dirty_stripe(&array, 8, &[0], 2);
        log.write_stripe(&b).unwrap();
        log.write_stripe_run().unwrap();
        let start = log.next_checkpoint();
        let write = rx.try_recv().unwrap();
        log.handle_completion(write.execute(&*log.device, log.ring()))
            .unwrap();

        assert!(array.released().is_empty());
        assert_eq!(log.lists.lock().io_end.len(), 1);
        assert_eq!(log.next_checkpoint(), start);

        // a's flush lands: a runs, then b behind it without another flush
        log.handle_completion(flush.execute(&*log.device, log.ring()))
            .unwrap();
        assert_eq!(array.released(), vec![0, 8]);
        assert!(rx.is_empty());
        assert_eq!(dev.flush_count(), 1);

        log.stripe_write_finished(&b).unwrap();
        assert_eq!(log.next_checkpoint(), start);
        log.stripe_write_finished(&a).unwrap();
        assert_eq!(log.next_checkpoint(), JournalPos::new(24, start.seq + 1));
        assert!(log.lists.lock().is_idle());
    }

    #[test]
    fn test_retired_units_wake_reclaim_past_limit() {
        let array = MemArray::new(4, 1);
        let mut config = JournalConfig::default();
        config.max_free_space = 16;
        let dev = Arc::new(MemDevice::new(1000));
        let (log, rx) = open_log_on(&array, &dev, config);
        assert_eq!(log.max_free_space(), 16);

        let sh = dirty_stripe(&array, 0, &[0, 1, 2], 1);
        log.write_stripe(&sh).unwrap();
        log.write_stripe_run().unwrap();
        run_io(&log, &rx);
        log.stripe_write_finished(&sh).unwrap();
        assert_eq!(log.next_checkpoint(), JournalPos::new(0, log.head().seq - 1));
        // the unit's own block is not reclaimable yet, nothing to do
        assert!(!log.reclaim_signal.wait(std::time::Duration::ZERO));

        let sh = dirty_stripe(&array, 8, &[0, 1, 2], 1);
        log.write_stripe(&sh).unwrap();
        log.write_stripe_run().unwrap();
        run_io(&log, &rx);
        log.stripe_write_finished(&sh).unwrap();
        assert_eq!(log.reclaimable_space(), 40);
        assert!(log.reclaim_signal.wait(std::time::Duration::ZERO));
    }
}
