//! Ring geometry of the journal device
//!
//! The log is an append-only sequence of blocks laid over a fixed circular
//! region. Offsets are sectors, always block aligned and always smaller than
//! the ring size.

use raidlog_common::{BLOCK_SECTORS, Error, Result, Sector, round_down_to_block};

/// A position in the log: the sector of a metadata block and the sequence
/// number that block carries (or will carry)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct JournalPos {
    pub sector: Sector,
    pub seq: u64,
}

impl JournalPos {
    #[must_use]
    pub const fn new(sector: Sector, seq: u64) -> Self {
        Self { sector, seq }
    }
}

/// Circular sector space of the journal device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ring {
    size: Sector,
}

impl Ring {
    /// Build the ring for a device of `device_sectors`, rounded down to whole
    /// blocks. A ring needs room for at least one metadata block and one page.
    pub fn new(device_sectors: Sector) -> Result<Self> {
        let size = round_down_to_block(device_sectors);
        if size < 2 * BLOCK_SECTORS {
            return Err(Error::Configuration(format!(
                "journal device too small: {device_sectors} sectors"
            )));
        }
        Ok(Self { size })
    }

    /// Usable size in sectors
    #[must_use]
    pub const fn size(&self) -> Sector {
        self.size
    }

    /// Advance `start` by `inc` sectors with wraparound
    #[inline]
    #[must_use]
    pub const fn add(&self, start: Sector, inc: Sector) -> Sector {
        (start % self.size + inc % self.size) % self.size
    }

    /// Forward distance from `start` to `end`
    #[inline]
    #[must_use]
    pub const fn distance(&self, start: Sector, end: Sector) -> Sector {
        if end >= start {
            end - start
        } else {
            end + self.size - start
        }
    }

    /// Whether `size` more sectors fit between the tail and the head.
    ///
    /// Strictly greater: a head that lands exactly on the tail would be
    /// indistinguishable from an empty log.
    #[inline]
    #[must_use]
    pub const fn has_free_space(&self, tail: Sector, head: Sector, size: Sector) -> bool {
        self.size > self.distance(tail, head) + size
    }

    /// Split `len` sectors starting at `start` into at most two contiguous
    /// extents, the second one beginning at sector 0 when the range wraps
    #[must_use]
    pub fn extents(&self, start: Sector, len: Sector) -> [Option<(Sector, Sector)>; 2] {
        if len == 0 {
            return [None, None];
        }
        let until_end = self.size - start;
        if len <= until_end {
            [Some((start, len)), None]
        } else {
            [Some((start, until_end)), Some((0, len - until_end))]
        }
    }
}
