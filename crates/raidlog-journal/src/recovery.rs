//! Loading the log and replaying it after a crash
//!
//! Starting at the superblock's tail, metadata blocks are read while they
//! carry the expected position and consecutive sequence numbers. Every
//! stripe they describe is verified against its checksums and written to
//! the member disks. A stripe whose pages do not verify is skipped; the
//! first block that does not verify ends the log.

use raidlog_common::{
    BLOCK_SECTORS, JournalConfig, Result, Sector, is_block_aligned, verify_page,
};
use tracing::{debug, info, warn};

use crate::array::RaidArray;
use crate::device::BlockDevice;
use crate::meta::{MetaBlock, MetaBlockWriter, PayloadType};
use crate::page::Page;
use crate::ring::{JournalPos, Ring};
use crate::stripe::StripeGeometry;

/// Log state found on the device
#[derive(Debug, Clone, Copy)]
pub(crate) struct Loaded {
    pub(crate) ring: Ring,
    pub(crate) max_free_space: Sector,
    /// Durable tail after recovery
    pub(crate) checkpoint: JournalPos,
    /// Where appending resumes
    pub(crate) head: JournalPos,
}

/// Find the tail, replay the log from it and prepare the head
pub(crate) fn load(
    device: &dyn BlockDevice,
    array: &dyn RaidArray,
    config: &JournalConfig,
    seed: u32,
) -> Result<Loaded> {
    let ring = Ring::new(device.size_sectors())?;
    let mut cp = array.journal_tail();
    if cp >= ring.size() || !is_block_aligned(cp) {
        warn!(tail = cp, size = ring.size(), "journal tail out of range, using 0");
        cp = 0;
    }

    let mut page = Page::zeroed();
    device.read_page(cp, page.as_mut_slice())?;
    let last_cp_seq = match MetaBlock::decode(page.as_slice(), seed, cp, None) {
        Ok(block) => block.seq,
        Err(reason) => {
            info!(tail = cp, %reason, "no journal at tail, starting a new log");
            cp = 0;
            array.set_journal_tail(0);
            array.write_superblock()?;
            u64::from(rand::random::<u32>())
        }
    };

    let max_free_space = (ring.size() >> config.max_free_space_shift).min(config.max_free_space);
    let tail = JournalPos::new(cp, last_cp_seq);
    let (checkpoint, head) = Replay::new(device, array, ring, seed)
        .run(tail, config.sentinel_seq_margin)?;

    Ok(Loaded {
        ring,
        max_free_space,
        checkpoint,
        head,
    })
}

/// A page read back from the log for one column
struct Column {
    idx: usize,
    page: Page,
    checksum: u32,
}

/// Consecutive payloads of one stripe
struct StripeGroup {
    sector: Sector,
    columns: Vec<Column>,
    has_parity: bool,
}

impl StripeGroup {
    const fn new(sector: Sector) -> Self {
        Self {
            sector,
            columns: Vec::new(),
            has_parity: false,
        }
    }
}

struct Replay<'a> {
    device: &'a dyn BlockDevice,
    array: &'a dyn RaidArray,
    ring: Ring,
    seed: u32,
    geometry: StripeGeometry,
    meta: Page,
}

impl<'a> Replay<'a> {
    fn new(
        device: &'a dyn BlockDevice,
        array: &'a dyn RaidArray,
        ring: Ring,
        seed: u32,
    ) -> Self {
        Self {
            device,
            array,
            ring,
            seed,
            geometry: array.geometry(),
            meta: Page::zeroed(),
        }
    }

    /// Replay from `tail`. Returns the tail and head to run with.
    fn run(&mut self, tail: JournalPos, margin: u64) -> Result<(JournalPos, JournalPos)> {
        let mut pos = tail.sector;
        let mut seq = tail.seq;
        let mut blocks = 0u64;
        let mut stripes = 0usize;

        loop {
            self.device.read_page(pos, self.meta.as_mut_slice())?;
            let block = match MetaBlock::decode(self.meta.as_slice(), self.seed, pos, Some(seq)) {
                Ok(block) => block,
                Err(reason) => {
                    debug!(pos, seq, %reason, "end of journal");
                    break;
                }
            };
            stripes += self.replay_block(pos, &block)?;
            blocks += 1;
            seq += 1;
            pos = self.ring.add(pos, block.total_sectors());
        }

        if blocks > 0 {
            info!(blocks, stripes, tail = tail.sector, end = pos, "journal replayed");
        }

        // Stale blocks of an earlier lap may follow with a fitting sequence.
        // An empty block far ahead in sequence fences them off.
        if seq > tail.seq + 1 {
            let sentinel = JournalPos::new(pos, seq + margin);
            self.write_sentinel(sentinel)?;
            let head = JournalPos::new(self.ring.add(pos, BLOCK_SECTORS), sentinel.seq + 1);
            return Ok((sentinel, head));
        }
        Ok((tail, JournalPos::new(pos, seq)))
    }

    fn write_sentinel(&self, at: JournalPos) -> Result<()> {
        let block = MetaBlockWriter::new(Page::zeroed(), at.seq, at.sector).finish(self.seed);
        self.device.write_page(at.sector, block.as_slice())?;
        self.device.flush()?;
        self.array.set_journal_tail(at.sector);
        self.array.write_superblock()?;
        debug!(pos = at.sector, seq = at.seq, "sentinel block written");
        Ok(())
    }

    fn read_page(&self, sector: Sector) -> Result<Page> {
        let mut page = Page::zeroed();
        self.device.read_page(sector, page.as_mut_slice())?;
        Ok(page)
    }

    /// Replay the stripes of one block, returns how many were written
    fn replay_block(&self, pos: Sector, block: &MetaBlock) -> Result<usize> {
        let mut offset = self.ring.add(pos, BLOCK_SECTORS);
        let mut group: Option<StripeGroup> = None;
        let mut replayed = 0;

        for payload in &block.payloads {
            match payload.kind {
                PayloadType::Data => {
                    let (sector, idx) = self.geometry.compute_sector(payload.location);
                    if group.as_ref().is_some_and(|g| g.sector != sector) {
                        replayed += self.finish_group(group.take());
                    }
                    let page = self.read_page(offset)?;
                    group
                        .get_or_insert_with(|| StripeGroup::new(sector))
                        .columns
                        .push(Column {
                            idx,
                            page,
                            checksum: payload.checksum,
                        });
                }
                PayloadType::Parity => {
                    let sector = payload.location;
                    if group.as_ref().is_some_and(|g| g.sector != sector) {
                        replayed += self.finish_group(group.take());
                    }
                    let mut g = group.take().unwrap_or_else(|| StripeGroup::new(sector));
                    let (pd, qd) = self.geometry.parity_disks(sector);
                    g.columns.push(Column {
                        idx: pd,
                        page: self.read_page(offset)?,
                        checksum: payload.checksum,
                    });
                    g.has_parity = true;
                    match (payload.q_checksum, qd) {
                        (Some(q_checksum), Some(qd)) => g.columns.push(Column {
                            idx: qd,
                            page: self.read_page(self.ring.add(offset, BLOCK_SECTORS))?,
                            checksum: q_checksum,
                        }),
                        (Some(_), None) => {
                            // the data still lands; parity comes from a resync
                            warn!(
                                stripe = sector,
                                "Q parity logged for a single-parity array, resyncing the stripe"
                            );
                            g.columns.retain(|c| c.idx != pd);
                            g.has_parity = false;
                        }
                        (None, _) => {}
                    }
                    replayed += self.finish_group(Some(g));
                }
            }
            offset = self.ring.add(offset, payload.size_sectors());
        }
        replayed += self.finish_group(group);
        Ok(replayed)
    }

    /// Verify a stripe's pages and write them to the member disks
    fn finish_group(&self, group: Option<StripeGroup>) -> usize {
        let Some(group) = group else {
            return 0;
        };
        for column in &group.columns {
            if let Err(e) = verify_page(self.seed, column.page.as_slice(), column.checksum) {
                warn!(
                    stripe = group.sector,
                    disk = column.idx,
                    error = %e,
                    "skipping stripe with a bad journal page"
                );
                return 0;
            }
        }

        for column in &group.columns {
            let targets = [self.array.member(column.idx), self.array.replacement(column.idx)];
            for device in targets.into_iter().flatten() {
                if let Err(e) = device.write_page(group.sector, column.page.as_slice()) {
                    warn!(
                        stripe = group.sector,
                        disk = column.idx,
                        error = %e,
                        "replay write to member failed"
                    );
                }
            }
        }
        if !group.has_parity {
            // data without parity: the stripe's parity is stale now
            self.array.resync_stripe(group.sector);
        }
        debug!(stripe = group.sector, columns = group.columns.len(), "stripe replayed");
        1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::MemDevice;
    use crate::log::Log;
    use crate::meta::Payload;
    use crate::stripe::DevFlags;
    use crate::test_utils::{MemArray, dirty_stripe, open_log_on, run_io};
    use raidlog_common::{BLOCK_SIZE, SECTOR_SIZE, page_checksum};

    /// Journal `count` stripes of 2 data columns and return the journal
    fn journal_stripes(array: &Arc<MemArray>, count: u64) -> (Arc<MemDevice>, JournalPos) {
        let dev = Arc::new(MemDevice::new(2048));
        let (log, rx) = open_log_on(array, &dev, JournalConfig::default());
        let tail = log.last_checkpoint();
        for i in 0..count {
            let sh = dirty_stripe(array, i * 8, &[0, 1], 0x10 + i as u8);
            log.write_stripe(&sh).unwrap();
            log.write_stripe_run().unwrap();
        }
        run_io(&log, &rx);
        (dev, tail)
    }

    fn reopen(array: &Arc<MemArray>, image: Vec<u8>) -> (Arc<MemArray>, Arc<MemDevice>, Log) {
        let array = array.reopen();
        let dev = Arc::new(MemDevice::from_image(image));
        let (log, _rx) = open_log_on(&array, &dev, JournalConfig::default());
        (array, dev, log)
    }

    #[test]
    fn test_fresh_device_starts_new_log() {
        let array = MemArray::new(4, 1);
        array.set_journal_tail(100);
        let dev = Arc::new(MemDevice::new(1024));
        let (log, _rx) = open_log_on(&array, &dev, JournalConfig::default());
        assert_eq!(array.journal_tail(), 0);
        assert_eq!(array.superblock_writes(), 1);
        assert_eq!(log.last_checkpoint().sector, 0);
        assert_eq!(log.head(), log.last_checkpoint());
        assert_eq!(log.max_free_space(), 256);
        assert!(array.resynced().is_empty());
    }

    #[test]
    fn test_replay_writes_members() {
        let array = MemArray::new(4, 1);
        let (dev, tail) = journal_stripes(&array, 3);

        let (replayed, _dev, log) = reopen(&array, dev.image());
        for i in 0..3u64 {
            let sh = array.stripe(i * 8);
            for col in [0, 1] {
                assert_eq!(replayed.member_dev(col).block(i * 8), vec![0x10 + i as u8; BLOCK_SIZE]);
            }
            let pd = sh.pd_idx();
            assert_eq!(
                replayed.member_dev(pd).block(i * 8),
                sh.lock().devs[pd].page.as_slice()
            );
        }
        // three blocks replayed: the tail moved to a sentinel at the end
        let end = 3 * 4 * BLOCK_SECTORS;
        assert_eq!(log.last_checkpoint(), JournalPos::new(end, tail.seq + 3 + 10));
        assert_eq!(log.head(), JournalPos::new(end + BLOCK_SECTORS, tail.seq + 14));
        assert_eq!(replayed.journal_tail(), end);
        assert!(replayed.resynced().is_empty());
    }

    #[test]
    fn test_corrupt_block_ends_log() {
        let array = MemArray::new(4, 1);
        let (dev, tail) = journal_stripes(&array, 3);
        let mut image = dev.image();
        let third = 2 * 4 * BLOCK_SECTORS as usize * SECTOR_SIZE;
        image[third + 40] ^= 0x01;

        let (replayed, _dev, log) = reopen(&array, image);
        assert_eq!(replayed.member_dev(0).block(8), vec![0x11; BLOCK_SIZE]);
        assert_eq!(replayed.member_dev(0).block(16), vec![0; BLOCK_SIZE]);

        let sentinel = 2 * 4 * BLOCK_SECTORS;
        assert_eq!(log.last_checkpoint(), JournalPos::new(sentinel, tail.seq + 2 + 10));
        assert_eq!(log.head(), JournalPos::new(sentinel + 8, tail.seq + 13));
    }

    #[test]
    fn test_recovery_is_stable() {
        let array = MemArray::new(4, 1);
        let (dev, _tail) = journal_stripes(&array, 2);

        let (first, dev1, log1) = reopen(&array, dev.image());
        let head = log1.head();
        let checkpoint = log1.last_checkpoint();
        drop(log1);

        // second crash right after recovery: the sentinel is the tail now
        let (second, _dev2, log2) = reopen(&first, dev1.image());
        assert_eq!(log2.last_checkpoint(), checkpoint);
        assert_eq!(log2.head(), head);
        for col in 0..4 {
            assert!(second.member_dev(col).block(0).iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_replay_twice_gives_same_members() {
        let array = MemArray::new(5, 2);
        let (dev, _tail) = journal_stripes(&array, 4);
        let image = dev.image();

        let (a, _, _) = reopen(&array, image.clone());
        let (b, _, _) = reopen(&array, image);
        for col in 0..5 {
            assert_eq!(a.member_dev(col).image(), b.member_dev(col).image());
        }
        // Q parity went to its own column
        let sh = array.stripe(0);
        let qd = sh.qd_idx().unwrap();
        assert_eq!(
            a.member_dev(qd).block(0),
            sh.lock().devs[qd].page.as_slice()
        );
    }

    #[test]
    fn test_bad_page_skips_only_its_stripe() {
        let array = MemArray::new(4, 1);
        let (dev, tail) = journal_stripes(&array, 2);
        let mut image = dev.image();
        // first data page of the first stripe
        let page = BLOCK_SECTORS as usize * SECTOR_SIZE;
        image[page] ^= 0xff;

        let (replayed, _dev, log) = reopen(&array, image);
        assert_eq!(replayed.member_dev(0).block(0), vec![0; BLOCK_SIZE]);
        assert_eq!(replayed.member_dev(0).block(8), vec![0x11; BLOCK_SIZE]);
        assert_eq!(log.last_checkpoint().seq, tail.seq + 2 + 10);
    }

    #[test]
    fn test_cached_data_replay_requests_resync() {
        let array = MemArray::new(4, 1);
        let dev = Arc::new(MemDevice::new(2048));
        {
            let (log, rx) = open_log_on(&array, &dev, JournalConfig::default());
            let sh = array.stripe(0);
            {
                let mut st = sh.lock();
                st.devs[1].flags.insert(DevFlags::WANT_CACHE);
                st.devs[1].page.copy_from(&[0x5a; BLOCK_SIZE]);
            }
            log.cache_data(&sh, 1).unwrap();
            log.write_stripe_run().unwrap();
            run_io(&log, &rx);
        }
        let (replayed, _dev, _log) = reopen(&array, dev.image());
        assert_eq!(replayed.member_dev(1).block(0), vec![0x5a; BLOCK_SIZE]);
        assert_eq!(replayed.resynced(), vec![0]);
    }

    #[test]
    fn test_q_parity_on_single_parity_array_resyncs_stripe() {
        let array = MemArray::new(4, 1);
        let dev = Arc::new(MemDevice::new(2048));
        let (log, _rx) = open_log_on(&array, &dev, JournalConfig::default());
        let tail = log.last_checkpoint();
        let seed = log.seed();
        drop(log);

        let geometry = array.geometry();
        let (pd, _) = geometry.parity_disks(0);
        let data_idx = (pd + 1) % geometry.raid_disks();
        let data = [0x6b; BLOCK_SIZE];
        let parity = [0x94; BLOCK_SIZE];
        let mut writer = MetaBlockWriter::new(Page::zeroed(), tail.seq, tail.sector);
        assert!(writer.append(&Payload::data(
            geometry.compute_blocknr(0, data_idx),
            page_checksum(seed, &data)
        )));
        let p_sum = page_checksum(seed, &parity);
        assert!(writer.append(&Payload::parity(0, p_sum, Some(p_sum))));
        let block = writer.finish(seed);
        dev.write_page(tail.sector, block.as_slice()).unwrap();
        dev.write_page(tail.sector + BLOCK_SECTORS, &data).unwrap();
        dev.write_page(tail.sector + 2 * BLOCK_SECTORS, &parity).unwrap();
        dev.write_page(tail.sector + 3 * BLOCK_SECTORS, &parity).unwrap();

        let (replayed, _dev, log) = reopen(&array, dev.image());
        // data kept, the malformed parity left to the resync
        assert_eq!(replayed.member_dev(data_idx).block(0), data.to_vec());
        assert_eq!(replayed.member_dev(pd).block(0), vec![0; BLOCK_SIZE]);
        assert_eq!(replayed.resynced(), vec![0]);
        assert_eq!(log.head(), JournalPos::new(tail.sector + 4 * BLOCK_SECTORS, tail.seq + 1));
    }

    #[test]
    fn test_misaligned_tail_falls_back_to_start() {
        let array = MemArray::new(4, 1);
        let (dev, tail) = journal_stripes(&array, 1);
        let reopened = array.reopen();
        reopened.set_journal_tail(3);
        let dev = Arc::new(MemDevice::from_image(dev.image()));
        let (log, _rx) = open_log_on(&reopened, &dev, JournalConfig::default());
        // the block at 0 is valid, so the log survives
        assert_eq!(reopened.member_dev(0).block(0), vec![0x10; BLOCK_SIZE]);
        assert_eq!(log.last_checkpoint(), tail);
        assert_eq!(log.head(), JournalPos::new(4 * BLOCK_SECTORS, tail.seq + 1));
    }
}
