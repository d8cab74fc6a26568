//! In-memory array and helpers shared by the unit tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use raidlog_common::{ArrayId, BLOCK_SIZE, JournalConfig, Result, Sector};

use crate::array::{CachePressure, RaidArray};
use crate::completion::IoRequest;
use crate::device::{BlockDevice, MemDevice};
use crate::log::Log;
use crate::stripe::{CacheState, DevFlags, Stripe, StripeGeometry, StripeState};

const MEMBER_SECTORS: Sector = 1024;

/// Array double: keeps a stripe cache, records what the journal asks of it
pub(crate) struct MemArray {
    id: ArrayId,
    geometry: StripeGeometry,
    stripes: Mutex<HashMap<Sector, Arc<Stripe>>>,
    cached: Mutex<Vec<Arc<Stripe>>>,
    released: Mutex<Vec<Sector>>,
    members: Mutex<HashMap<usize, Arc<MemDevice>>>,
    tail: AtomicU64,
    superblock_writes: AtomicU64,
    /// Commits wait for the abort flag, like an array thread that is busy
    block_commits: AtomicBool,
    commit_waiting: AtomicBool,
    aborted_commits: AtomicU64,
    resynced: Mutex<Vec<Sector>>,
    journal_failed: AtomicBool,
    degraded: AtomicBool,
    quiescing: AtomicBool,
    pressure: Mutex<CachePressure>,
    overlap_wakeups: AtomicUsize,
}

impl MemArray {
    pub(crate) fn new(raid_disks: usize, max_degraded: usize) -> Arc<Self> {
        Self::with_chunk(raid_disks, max_degraded, 64)
    }

    pub(crate) fn with_chunk(raid_disks: usize, max_degraded: usize, chunk: Sector) -> Arc<Self> {
        let geometry = StripeGeometry::new(raid_disks, max_degraded, chunk).unwrap();
        Self::build(ArrayId::new(), geometry, 0)
    }

    fn build(id: ArrayId, geometry: StripeGeometry, tail: Sector) -> Arc<Self> {
        Arc::new(Self {
            id,
            geometry,
            stripes: Mutex::new(HashMap::new()),
            cached: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            members: Mutex::new(HashMap::new()),
            tail: AtomicU64::new(tail),
            superblock_writes: AtomicU64::new(0),
            block_commits: AtomicBool::new(false),
            commit_waiting: AtomicBool::new(false),
            aborted_commits: AtomicU64::new(0),
            resynced: Mutex::new(Vec::new()),
            journal_failed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            quiescing: AtomicBool::new(false),
            pressure: Mutex::new(CachePressure {
                max_stripes: 256,
                inactive_blocked: false,
            }),
            overlap_wakeups: AtomicUsize::new(0),
        })
    }

    /// Same array after a restart: superblock kept, stripe cache and
    /// member disks fresh
    pub(crate) fn reopen(&self) -> Arc<Self> {
        Self::build(self.id, self.geometry, self.tail.load(Ordering::Acquire))
    }

    /// Stripe at `sector`, created empty on first use
    pub(crate) fn stripe(&self, sector: Sector) -> Arc<Stripe> {
        let mut stripes = self.stripes.lock();
        Arc::clone(
            stripes
                .entry(sector)
                .or_insert_with(|| Arc::new(Stripe::new(&self.geometry, sector))),
        )
    }

    pub(crate) fn released(&self) -> Vec<Sector> {
        self.released.lock().clone()
    }

    pub(crate) fn take_released(&self) -> Vec<Sector> {
        std::mem::take(&mut *self.released.lock())
    }

    /// Poll until `count` releases were recorded
    pub(crate) fn wait_released(&self, count: usize) -> Vec<Sector> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let released = self.released();
            if released.len() >= count || Instant::now() > deadline {
                return released;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn member_dev(&self, disk: usize) -> Arc<MemDevice> {
        Arc::clone(
            self.members
                .lock()
                .entry(disk)
                .or_insert_with(|| Arc::new(MemDevice::new(MEMBER_SECTORS))),
        )
    }

    /// Put a stripe on the cached list
    pub(crate) fn add_cached(&self, stripe: &Arc<Stripe>) {
        self.cached.lock().push(Arc::clone(stripe));
    }

    pub(crate) fn superblock_writes(&self) -> u64 {
        self.superblock_writes.load(Ordering::Acquire)
    }

    pub(crate) fn set_block_commits(&self, block: bool) {
        self.block_commits.store(block, Ordering::Release);
    }

    /// A commit is parked waiting for the abort flag
    pub(crate) fn commit_waiting(&self) -> bool {
        self.commit_waiting.load(Ordering::Acquire)
    }

    pub(crate) fn aborted_commits(&self) -> u64 {
        self.aborted_commits.load(Ordering::Acquire)
    }

    pub(crate) fn resynced(&self) -> Vec<Sector> {
        self.resynced.lock().clone()
    }

    pub(crate) fn journal_failed_flag(&self) -> bool {
        self.journal_failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    pub(crate) fn set_pressure(&self, pressure: CachePressure) {
        *self.pressure.lock() = pressure;
    }

    pub(crate) fn overlap_wakeups(&self) -> usize {
        self.overlap_wakeups.load(Ordering::Acquire)
    }
}

impl RaidArray for MemArray {
    fn id(&self) -> ArrayId {
        self.id
    }

    fn geometry(&self) -> StripeGeometry {
        self.geometry
    }

    fn release_stripe(&self, stripe: Arc<Stripe>) {
        self.released.lock().push(stripe.sector());
        stripe.unpin();
    }

    fn find_stripe(&self, sector: Sector, dev_idx: usize) -> Option<Arc<Stripe>> {
        let stripe = Arc::clone(self.stripes.lock().get(&sector)?);
        if !stripe.lock().devs[dev_idx].flags.contains(DevFlags::UPTODATE) {
            return None;
        }
        stripe.pin();
        Some(stripe)
    }

    fn drain_cached_stripes(
        &self,
        filter: &mut dyn FnMut(&StripeState) -> bool,
    ) -> Vec<Arc<Stripe>> {
        let mut cached = self.cached.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = cached
            .drain(..)
            .partition(|stripe| filter(&stripe.lock()));
        *cached = kept;
        for stripe in &taken {
            stripe.pin();
        }
        taken
    }

    fn member(&self, disk: usize) -> Option<Arc<dyn BlockDevice>> {
        let device: Arc<dyn BlockDevice> = self.member_dev(disk);
        Some(device)
    }

    fn replacement(&self, _disk: usize) -> Option<Arc<dyn BlockDevice>> {
        None
    }

    fn journal_tail(&self) -> Sector {
        self.tail.load(Ordering::Acquire)
    }

    fn set_journal_tail(&self, tail: Sector) {
        self.tail.store(tail, Ordering::Release);
    }

    fn commit_superblock(&self, abort: &AtomicBool) -> Result<bool> {
        if self.block_commits.load(Ordering::Acquire) {
            self.commit_waiting.store(true, Ordering::Release);
            while !abort.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.commit_waiting.store(false, Ordering::Release);
            self.aborted_commits.fetch_add(1, Ordering::AcqRel);
            return Ok(false);
        }
        self.superblock_writes.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    fn write_superblock(&self) -> Result<()> {
        self.superblock_writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn resync_stripe(&self, sector: Sector) {
        self.resynced.lock().push(sector);
    }

    fn journal_failed(&self) {
        self.journal_failed.store(true, Ordering::Release);
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }

    fn cache_pressure(&self) -> CachePressure {
        *self.pressure.lock()
    }

    fn wake_overlap(&self) {
        self.overlap_wakeups.fetch_add(1, Ordering::AcqRel);
    }
}

/// Stripe at `sector` ready to journal: the given data columns (counted
/// from the first data column) and parity filled and marked for writing
pub(crate) fn dirty_stripe(
    array: &MemArray,
    sector: Sector,
    data: &[usize],
    fill: u8,
) -> Arc<Stripe> {
    let stripe = array.stripe(sector);
    let geometry = array.geometry();
    {
        let mut st = stripe.lock();
        for &k in data {
            let idx = (stripe.pd_idx() + geometry.max_degraded() + k) % geometry.raid_disks();
            let dev = &mut st.devs[idx];
            dev.flags.insert(DevFlags::WANT_WRITE | DevFlags::UPTODATE);
            dev.page.copy_from(&[fill; BLOCK_SIZE]);
            dev.orig_page.copy_from(&[fill; BLOCK_SIZE]);
        }
        let pd = &mut st.devs[stripe.pd_idx()];
        pd.flags.insert(DevFlags::WANT_WRITE | DevFlags::UPTODATE);
        pd.page.copy_from(&[!fill; BLOCK_SIZE]);
        if let Some(qd) = stripe.qd_idx() {
            let q = &mut st.devs[qd];
            q.flags.insert(DevFlags::WANT_WRITE | DevFlags::UPTODATE);
            q.page.copy_from(&[fill.rotate_left(1); BLOCK_SIZE]);
        }
        st.cache_state = CacheState::Frozen;
    }
    stripe
}

pub(crate) fn open_log_on(
    array: &Arc<MemArray>,
    device: &Arc<MemDevice>,
    config: JournalConfig,
) -> (Log, Receiver<IoRequest>) {
    let array: Arc<dyn RaidArray> = Arc::clone(array) as Arc<dyn RaidArray>;
    let device: Arc<dyn BlockDevice> = Arc::clone(device) as Arc<dyn BlockDevice>;
    Log::open(device, array, config).unwrap()
}

pub(crate) fn open_log_with(
    array: &Arc<MemArray>,
    sectors: Sector,
    config: JournalConfig,
) -> (Log, Receiver<IoRequest>, Arc<MemDevice>) {
    let device = Arc::new(MemDevice::new(sectors));
    let (log, rx) = open_log_on(array, &device, config);
    (log, rx, device)
}

pub(crate) fn open_log(
    array: &Arc<MemArray>,
    sectors: Sector,
) -> (Log, Receiver<IoRequest>, Arc<MemDevice>) {
    open_log_with(array, sectors, JournalConfig::default())
}

/// Execute and complete queued device requests in order, including the
/// ones their completions queue. Returns how many ran.
pub(crate) fn run_io(log: &Log, rx: &Receiver<IoRequest>) -> usize {
    let mut count = 0;
    while let Ok(request) = rx.try_recv() {
        let completion = request.execute(&*log.device, log.ring());
        log.handle_completion(completion).unwrap();
        count += 1;
    }
    count
}
