//! Checksum utilities for raidlog
//!
//! Every page written to the journal and every metadata block carries a
//! CRC32C seeded with a value derived from the array UUID.

use crate::error::{Error, Result};
use crate::types::ArrayId;

/// Derive the per-array checksum seed from the array UUID
#[inline]
#[must_use]
pub fn uuid_seed(array: &ArrayId) -> u32 {
    crc32c::crc32c_append(!0, array.as_bytes())
}

/// Seeded CRC32C of a page or metadata block
#[inline]
#[must_use]
pub fn page_checksum(seed: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(seed, data)
}

/// Verify a page against a stored checksum
#[inline]
pub fn verify_page(seed: u32, data: &[u8], expected: u32) -> Result<()> {
    let actual = page_checksum(seed, data);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { expected, actual })
    }
}
