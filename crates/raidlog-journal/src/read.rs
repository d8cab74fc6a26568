//! Serving reads from the write-back cache
//!
//! Data completed into the cache may not be on the member disks yet, so a
//! read of a chunk first looks for its blocks in the stripe cache.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use raidlog_common::{BLOCK_SECTORS, Error, Result, SECTOR_SIZE, Sector};
use tracing::trace;

use crate::array::RaidArray;
use crate::log::Log;
use crate::stripe::Stripe;

/// A read within one chunk of the array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBio {
    /// First array sector
    pub sector: Sector,
    /// Destination, a whole number of sectors
    pub data: Vec<u8>,
}

impl ReadBio {
    #[must_use]
    pub fn new(sector: Sector, sectors: usize) -> Self {
        Self {
            sector,
            data: vec![0; sectors * SECTOR_SIZE],
        }
    }

    #[must_use]
    pub fn sectors(&self) -> Sector {
        (self.data.len() / SECTOR_SIZE) as Sector
    }

    #[must_use]
    pub fn end(&self) -> Sector {
        self.sector + self.sectors()
    }
}

#[derive(Debug)]
pub enum ChunkLookup {
    /// Nothing is cached, read from the member disks
    Miss,
    /// The whole read was served from the cache
    Hit,
    /// Some blocks are cached. Read from the member disks into the bio, then
    /// overlay the cached blocks with [`PartialRead::complete`].
    Partial(PartialRead),
}

/// Pinned stripes holding cached blocks of one chunk, block by block
struct ChunkMap {
    array: Arc<dyn RaidArray>,
    /// Block-aligned start of the read
    logical: Sector,
    dd_idx: usize,
    stripes: Vec<Option<Arc<Stripe>>>,
}

impl ChunkMap {
    fn cached_blocks(&self) -> usize {
        self.stripes.iter().flatten().count()
    }

    fn copy_into(&self, bio: &mut ReadBio) {
        let end = bio.end();
        for (i, stripe) in self.stripes.iter().enumerate() {
            let Some(stripe) = stripe else {
                continue;
            };
            let block = self.logical + i as Sector * BLOCK_SECTORS;
            let from = block.max(bio.sector);
            let to = (block + BLOCK_SECTORS).min(end);
            if from >= to {
                continue;
            }
            let src = (from - block) as usize * SECTOR_SIZE;
            let dst = (from - bio.sector) as usize * SECTOR_SIZE;
            let len = (to - from) as usize * SECTOR_SIZE;
            let st = stripe.lock();
            let page = st.devs[self.dd_idx].orig_page.as_slice();
            bio.data[dst..dst + len].copy_from_slice(&page[src..src + len]);
        }
    }
}

impl Drop for ChunkMap {
    fn drop(&mut self) {
        for stripe in self.stripes.drain(..).flatten() {
            self.array.release_stripe(stripe);
        }
    }
}

/// A read partly served from the cache
pub struct PartialRead {
    map: ChunkMap,
}

impl PartialRead {
    /// Blocks of the read found in the cache
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.map.cached_blocks()
    }

    /// The member disk read into `bio` finished; put the newer cached data
    /// over it and release the stripes
    pub fn complete(self, bio: &mut ReadBio) {
        self.map.copy_into(bio);
    }
}

impl std::fmt::Debug for PartialRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialRead")
            .field("logical", &self.map.logical)
            .field("dd_idx", &self.map.dd_idx)
            .field("cached_blocks", &self.cached_blocks())
            .finish()
    }
}

impl Log {
    /// Look up the blocks of a read in the stripe cache. Fully cached reads
    /// are filled in place.
    pub fn lookup_chunk(&self, bio: &mut ReadBio) -> Result<ChunkLookup> {
        let geometry = self.array.geometry();
        let chunk = geometry.chunk_sectors();
        if bio.data.is_empty() || bio.data.len() % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument(format!(
                "read of {} bytes is not a whole number of sectors",
                bio.data.len()
            )));
        }
        if bio.sector / chunk != (bio.end() - 1) / chunk {
            return Err(Error::invalid_argument(format!(
                "read at {} of {} sectors crosses a chunk boundary",
                bio.sector,
                bio.sectors()
            )));
        }

        let logical = bio.sector - bio.sector % BLOCK_SECTORS;
        let count = (bio.end() - logical).div_ceil(BLOCK_SECTORS);
        let (first_stripe, dd_idx) = geometry.compute_sector(logical);
        let stripes: Vec<Option<Arc<Stripe>>> = (0..count)
            .map(|i| {
                self.array
                    .find_stripe(first_stripe + i * BLOCK_SECTORS, dd_idx)
            })
            .collect();
        let map = ChunkMap {
            array: Arc::clone(&self.array),
            logical,
            dd_idx,
            stripes,
        };

        let found = map.cached_blocks();
        trace!(sector = bio.sector, blocks = count, found, "cache lookup");
        if found == 0 {
            self.cache.read_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(ChunkLookup::Miss);
        }
        if found as Sector == count {
            map.copy_into(bio);
            self.cache.read_full_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ChunkLookup::Hit);
        }
        self.cache.read_partial_hits.fetch_add(1, Ordering::Relaxed);
        Ok(ChunkLookup::Partial(PartialRead { map }))
    }
}

/// Look a read up in the cache if the array has a journal
pub fn lookup_chunk(log: Option<&Log>, bio: &mut ReadBio) -> Result<ChunkLookup> {
    log.map_or(Ok(ChunkLookup::Miss), |log| log.lookup_chunk(bio))
}
