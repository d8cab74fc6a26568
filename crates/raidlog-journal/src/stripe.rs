//! Stripes as seen by the journal
//!
//! The stripe cache itself belongs to the array. The journal only needs the
//! per-column pages and flags, the write-back sub-state, and the two fields
//! it owns: `journal_start` and the `log_io` back reference.

use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use raidlog_common::{BLOCK_SECTORS, Error, Result, Sector};

use crate::io_unit::UnitId;
use crate::page::Page;
use crate::ring::JournalPos;

bitflags! {
    /// Per-column state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevFlags: u32 {
        /// Page holds current data
        const UPTODATE = 1 << 0;
        const LOCKED = 1 << 1;
        /// The pending write covers the whole page
        const OVERWRITE = 1 << 2;
        /// Page goes to the member disk
        const WANT_WRITE = 1 << 3;
        /// Page goes to the journal only
        const WANT_CACHE = 1 << 4;
        /// Pending writes still have to be drained into the page
        const WANT_DRAIN = 1 << 5;
        /// Latest data lives in the journal, not yet on the member disk
        const IN_CACHE = 1 << 6;
        const OVERLAP = 1 << 7;
    }
}

bitflags! {
    /// Stripe-wide state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StripeFlags: u32 {
        /// Needs another pass of the array's stripe state machine
        const HANDLE = 1 << 0;
        const DELAYED = 1 << 1;
        const SYNCING = 1 << 2;
        /// The journal owns the stripe until its log write completes
        const LOG_TRAPPED = 1 << 3;
        const PREREAD_ACTIVE = 1 << 4;
        /// Counted among the stripes with data in the write-back cache
        const IN_R5C_CACHE = 1 << 5;
    }
}

/// Write-back sub-state of a stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CacheState {
    /// No cached data
    #[default]
    Clean,
    /// Accepting writes into the cache
    Running,
    /// Stopped accepting writes, parity about to be computed
    Frozen,
    /// Parity computed, being journaled
    ParityRun,
    /// Parity journaled, ready for the member disks
    ParityDone,
    /// Written to the member disks
    InRaid,
}

/// One column of a stripe
#[derive(Debug, Clone, Default)]
pub struct StripeDev {
    /// Working page, parity computation may run in place
    pub page: Page,
    /// Data as written by the upper layer
    pub orig_page: Page,
    pub flags: DevFlags,
    /// Checksum recorded in the journal for `page`
    pub log_checksum: u32,
    /// Writes queued for this column and not yet drained into the page
    pub towrite: bool,
}

/// Mutable part of a stripe, guarded by the stripe lock
#[derive(Debug)]
pub struct StripeState {
    pub devs: Vec<StripeDev>,
    pub flags: StripeFlags,
    pub cache_state: CacheState,
    /// Log position of the first journal write of this stripe
    pub journal_start: Option<JournalPos>,
    /// I/O unit carrying this stripe's journal write
    pub log_io: Option<UnitId>,
    /// Columns whose latest data lives only in the journal
    pub dev_in_cache: usize,
}

/// A stripe of the array's stripe cache
#[derive(Debug)]
pub struct Stripe {
    sector: Sector,
    pd_idx: usize,
    qd_idx: Option<usize>,
    count: AtomicUsize,
    state: Mutex<StripeState>,
}

impl Stripe {
    /// Empty stripe at `sector` laid out according to `geometry`
    #[must_use]
    pub fn new(geometry: &StripeGeometry, sector: Sector) -> Self {
        let (pd_idx, qd_idx) = geometry.parity_disks(sector);
        Self {
            sector,
            pd_idx,
            qd_idx,
            count: AtomicUsize::new(0),
            state: Mutex::new(StripeState {
                devs: vec![StripeDev::default(); geometry.raid_disks()],
                flags: StripeFlags::empty(),
                cache_state: CacheState::Clean,
                journal_start: None,
                log_io: None,
                dev_in_cache: 0,
            }),
        }
    }

    /// Stripe sector on every member disk
    #[must_use]
    pub const fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub const fn pd_idx(&self) -> usize {
        self.pd_idx
    }

    #[must_use]
    pub const fn qd_idx(&self) -> Option<usize> {
        self.qd_idx
    }

    /// Whether column `idx` holds parity
    #[must_use]
    pub fn is_parity(&self, idx: usize) -> bool {
        idx == self.pd_idx || Some(idx) == self.qd_idx
    }

    pub fn lock(&self) -> MutexGuard<'_, StripeState> {
        self.state.lock()
    }

    /// Take a reference, returns the new count
    pub fn pin(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference, returns the new count
    pub fn unpin(&self) -> usize {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "stripe {} unpinned too often", self.sector);
        prev.saturating_sub(1)
    }

    pub fn pins(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Left-symmetric RAID5/RAID6 layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeGeometry {
    raid_disks: usize,
    max_degraded: usize,
    chunk_sectors: Sector,
}

impl StripeGeometry {
    /// `max_degraded` is 1 for RAID5 and 2 for RAID6
    pub fn new(raid_disks: usize, max_degraded: usize, chunk_sectors: Sector) -> Result<Self> {
        if !(1..=2).contains(&max_degraded) {
            return Err(Error::invalid_argument(format!(
                "unsupported parity count {max_degraded}"
            )));
        }
        if raid_disks < max_degraded + 2 {
            return Err(Error::invalid_argument(format!(
                "{raid_disks} disks are too few for {max_degraded} parity columns"
            )));
        }
        if chunk_sectors == 0 || chunk_sectors % BLOCK_SECTORS != 0 {
            return Err(Error::invalid_argument(format!(
                "chunk size {chunk_sectors} is not a multiple of {BLOCK_SECTORS} sectors"
            )));
        }
        Ok(Self {
            raid_disks,
            max_degraded,
            chunk_sectors,
        })
    }

    #[must_use]
    pub const fn raid_disks(&self) -> usize {
        self.raid_disks
    }

    #[must_use]
    pub const fn max_degraded(&self) -> usize {
        self.max_degraded
    }

    #[must_use]
    pub const fn data_disks(&self) -> usize {
        self.raid_disks - self.max_degraded
    }

    #[must_use]
    pub const fn chunk_sectors(&self) -> Sector {
        self.chunk_sectors
    }

    /// Parity and Q columns of the stripe at `stripe_sector`
    #[must_use]
    pub const fn parity_disks(&self, stripe_sector: Sector) -> (usize, Option<usize>) {
        let row = stripe_sector / self.chunk_sectors;
        let n = self.raid_disks as Sector;
        let pd = (n - 1 - row % n) as usize;
        if self.max_degraded == 2 {
            (pd, Some((pd + 1) % self.raid_disks))
        } else {
            (pd, None)
        }
    }

    /// Map an array logical sector to the stripe sector on the member disks
    /// and the data column holding it
    #[must_use]
    pub const fn compute_sector(&self, logical: Sector) -> (Sector, usize) {
        let chunk_offset = logical % self.chunk_sectors;
        let chunk = logical / self.chunk_sectors;
        let data_disks = self.data_disks() as Sector;
        let row = chunk / data_disks;
        let data_idx = (chunk % data_disks) as usize;
        let stripe_sector = row * self.chunk_sectors + chunk_offset;
        let (pd, _) = self.parity_disks(stripe_sector);
        let dd_idx = (pd + self.max_degraded + data_idx) % self.raid_disks;
        (stripe_sector, dd_idx)
    }

    /// Inverse of [`compute_sector`](Self::compute_sector) for data column
    /// `dev_idx` of the stripe at `stripe_sector`
    #[must_use]
    pub const fn compute_blocknr(&self, stripe_sector: Sector, dev_idx: usize) -> Sector {
        let (pd, _) = self.parity_disks(stripe_sector);
        let n = self.raid_disks;
        let data_idx = (dev_idx + 2 * n - pd - self.max_degraded) % n;
        let row = stripe_sector / self.chunk_sectors;
        let chunk_offset = stripe_sector % self.chunk_sectors;
        (row * self.data_disks() as Sector + data_idx as Sector) * self.chunk_sectors
            + chunk_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn test_geometry_validation() {
        assert!(StripeGeometry::new(4, 1, 128).is_ok());
        assert!(StripeGeometry::new(2, 1, 128).is_err());
        assert!(StripeGeometry::new(3, 2, 128).is_err());
        assert!(StripeGeometry::new(4, 3, 128).is_err());
        assert!(StripeGeometry::new(4, 1, 12).is_err());
    }

    #[test]
    fn test_parity_rotates_left_symmetric() {
        let geo = StripeGeometry::new(4, 1, 8).unwrap();
        let pds: Vec<usize> = (0..5).map(|row| geo.parity_disks(row * 8).0).collect();
        assert_eq!(pds, vec![3, 2, 1, 0, 3]);

        let geo = StripeGeometry::new(5, 2, 8).unwrap();
        assert_eq!(geo.parity_disks(0), (4, Some(0)));
        assert_eq!(geo.parity_disks(8), (3, Some(4)));
    }

    #[test]
    fn test_first_row_layout() {
        // 4 disks, chunk of one block: row 0 has P on disk 3, data on 0..3
        let geo = StripeGeometry::new(4, 1, 8).unwrap();
        assert_eq!(geo.compute_sector(0), (0, 0));
        assert_eq!(geo.compute_sector(8), (0, 1));
        assert_eq!(geo.compute_sector(16), (0, 2));
        // row 1: P on disk 2, data starts right after it
        assert_eq!(geo.compute_sector(24), (8, 3));
        assert_eq!(geo.compute_sector(32), (8, 0));
    }

    #[test]
    fn test_blocknr_inverts_sector() {
        let mut rng = StdRng::seed_from_u64(3);
        for (disks, parity) in [(3, 1), (4, 1), (6, 1), (4, 2), (7, 2)] {
            let geo = StripeGeometry::new(disks, parity, 128).unwrap();
            for _ in 0..2_000 {
                let logical = rng.gen_range(0..1u64 << 32);
                let (stripe, dd) = geo.compute_sector(logical);
                let (pd, qd) = geo.parity_disks(stripe);
                assert_ne!(dd, pd);
                assert_ne!(Some(dd), qd);
                assert_eq!(geo.compute_blocknr(stripe, dd), logical);
            }
        }
    }

    #[test]
    fn test_stripe_pins() {
        let geo = StripeGeometry::new(4, 1, 8).unwrap();
        let sh = Stripe::new(&geo, 8);
        assert_eq!(sh.pd_idx(), 2);
        assert!(sh.is_parity(2));
        assert_eq!(sh.lock().devs.len(), 4);
        assert_eq!(sh.pin(), 1);
        assert_eq!(sh.pin(), 2);
        assert_eq!(sh.unpin(), 1);
        assert_eq!(sh.pins(), 1);
    }

    #[test]
    fn test_cache_state_order() {
        assert!(CacheState::Clean < CacheState::Running);
        assert!(CacheState::Frozen < CacheState::ParityRun);
        assert!(CacheState::ParityDone < CacheState::InRaid);
    }
}
