//! The RAID array as a collaborator of the journal
//!
//! The journal never owns stripes or member disks. It reaches them, the
//! array superblock and the array's stripe state machine through this trait.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use raidlog_common::{ArrayId, Result, Sector};

use crate::device::BlockDevice;
use crate::stripe::{Stripe, StripeGeometry, StripeState};

/// How full the array's stripe cache is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePressure {
    /// Stripe slots in the stripe cache
    pub max_stripes: usize,
    /// Stripe allocation is blocked waiting for free slots
    pub inactive_blocked: bool,
}

pub trait RaidArray: Send + Sync {
    fn id(&self) -> ArrayId;

    fn geometry(&self) -> StripeGeometry;

    /// Hand a stripe back to the stripe state machine, dropping one pin
    fn release_stripe(&self, stripe: Arc<Stripe>);

    /// Pinned stripe at `sector` if it is in the stripe cache and column
    /// `dev_idx` is up to date
    fn find_stripe(&self, sector: Sector, dev_idx: usize) -> Option<Arc<Stripe>>;

    /// Remove and return, pinned, the stripes on the cached list for which
    /// `filter` holds
    fn drain_cached_stripes(&self, filter: &mut dyn FnMut(&StripeState) -> bool)
    -> Vec<Arc<Stripe>>;

    /// Member disk `disk`, if present and working
    fn member(&self, disk: usize) -> Option<Arc<dyn BlockDevice>>;

    /// Replacement being rebuilt for member `disk`
    fn replacement(&self, disk: usize) -> Option<Arc<dyn BlockDevice>>;

    /// Journal tail recorded in the superblock
    fn journal_tail(&self) -> Sector;

    fn set_journal_tail(&self, tail: Sector);

    /// Ask the array thread to write the superblock and wait for it.
    /// Returns `Ok(false)` if `abort` was raised before the write completed.
    fn commit_superblock(&self, abort: &AtomicBool) -> Result<bool>;

    /// Write the superblock from the calling thread
    fn write_superblock(&self) -> Result<()>;

    /// Parity of `sector` must be recomputed from the data columns
    fn resync_stripe(&self, sector: Sector);

    /// The journal device failed
    fn journal_failed(&self);

    /// The array was created with a journal device
    fn has_journal(&self) -> bool {
        true
    }

    fn is_degraded(&self) -> bool;

    fn is_quiescing(&self) -> bool;

    fn cache_pressure(&self) -> CachePressure;

    /// Kick the array's stripe handling thread
    fn wakeup(&self) {}

    /// Wake writers waiting for an overlapping stripe to leave the cache
    fn wake_overlap(&self) {}
}
