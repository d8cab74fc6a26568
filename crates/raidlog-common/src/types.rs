//! Core type definitions for raidlog
//!
//! Sector and block arithmetic, the array identifier, and the cache mode
//! shared by the journal engine and the array it serves.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A 512-byte sector address or length
pub type Sector = u64;

/// Bytes per sector
pub const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;

/// Journal block size. Every metadata block and payload page is one block,
/// regardless of the hardware sector size underneath.
pub const BLOCK_SIZE: usize = 4096;

/// Sectors per journal block
pub const BLOCK_SECTORS: Sector = (BLOCK_SIZE >> SECTOR_SHIFT) as Sector;

/// Round a sector count down to a whole number of blocks
#[inline]
#[must_use]
pub const fn round_down_to_block(sectors: Sector) -> Sector {
    sectors - sectors % BLOCK_SECTORS
}

/// True if `sector` sits on a block boundary
#[inline]
#[must_use]
pub const fn is_block_aligned(sector: Sector) -> bool {
    sector % BLOCK_SECTORS == 0
}

/// Convert a block count to sectors
#[inline]
#[must_use]
pub const fn blocks_to_sectors(blocks: u64) -> Sector {
    blocks * BLOCK_SECTORS
}

/// Unique identifier of a RAID array
///
/// The journal derives its checksum seed from this value, so blocks written
/// for one array never validate against another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct ArrayId(Uuid);

impl ArrayId {
    /// Generate a new random array ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ArrayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayId({})", self.0)
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How writes use the journal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Journal data and parity, then write the stripe to the member disks
    WriteThrough,
    /// Acknowledge once data is in the journal; write to disks later
    #[default]
    WriteBack,
}

impl CacheMode {
    /// Numeric value used by the array's control interface
    #[must_use]
    pub const fn as_index(self) -> u8 {
        match self {
            Self::WriteThrough => 1,
            Self::WriteBack => 2,
        }
    }

    /// Name used in logs and the control interface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WriteThrough => "write-through",
            Self::WriteBack => "write-back",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_index(), self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    /// Accepts either the numeric value or the name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "write-through" => Ok(Self::WriteThrough),
            "2" | "write-back" => Ok(Self::WriteBack),
            other => Err(Error::invalid_argument(format!(
                "unsupported cache mode: {other}"
            ))),
        }
    }
}
