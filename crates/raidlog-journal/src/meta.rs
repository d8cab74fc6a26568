//! Metadata block codec
//!
//! Every I/O unit starts with one metadata block describing the pages that
//! follow it in the log. All fields are little endian.
//!
//! ```text
//! offset  size  field
//!      0     4  magic
//!      4     1  version
//!      5     3  reserved
//!      8     4  meta_size (bytes used, header included)
//!     12     8  sequence
//!     20     8  position (sector of this block)
//!     28     4  checksum (CRC-32C over the block, this field zeroed)
//!     32        payload descriptors
//! ```
//!
//! A payload descriptor is `type:u16 flags:u16 size:u32 location:u64`
//! followed by one `u32` checksum per page (`size` is in sectors). Data
//! payloads describe one page. A parity payload describes the P page and,
//! on arrays with a second parity column, the Q page right after it.

use std::fmt;

use bytes::{Buf, BufMut};
use raidlog_common::{BLOCK_SECTORS, BLOCK_SIZE, Sector, page_checksum};

use crate::page::Page;

pub const META_MAGIC: u32 = 0x6433_c509;
pub const META_VERSION: u8 = 1;

pub const META_HEADER_SIZE: usize = 32;
pub const PAYLOAD_HEADER_SIZE: usize = 16;
pub const CHECKSUM_SIZE: usize = 4;

const VERSION_OFFSET: usize = 4;
const META_SIZE_OFFSET: usize = 8;
const SEQ_OFFSET: usize = 12;
const POSITION_OFFSET: usize = 20;
const CHECKSUM_OFFSET: usize = 28;

/// Set on a parity payload that also carries a Q page
pub const PAYLOAD_FLAG_Q: u16 = 1 << 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PayloadType {
    Data = 0,
    Parity = 1,
}

impl TryFrom<u16> for PayloadType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Parity),
            other => Err(other),
        }
    }
}

/// One payload descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadType,
    /// Array logical sector for data, stripe sector for parity
    pub location: Sector,
    pub checksum: u32,
    /// Checksum of the Q page, parity payloads on RAID6 only
    pub q_checksum: Option<u32>,
}

impl Payload {
    #[must_use]
    pub const fn data(location: Sector, checksum: u32) -> Self {
        Self {
            kind: PayloadType::Data,
            location,
            checksum,
            q_checksum: None,
        }
    }

    #[must_use]
    pub const fn parity(stripe_sector: Sector, checksum: u32, q_checksum: Option<u32>) -> Self {
        Self {
            kind: PayloadType::Parity,
            location: stripe_sector,
            checksum,
            q_checksum,
        }
    }

    /// Pages this payload occupies in the log
    #[must_use]
    pub const fn pages(&self) -> usize {
        if self.q_checksum.is_some() { 2 } else { 1 }
    }

    /// Log sectors occupied by the pages
    #[must_use]
    pub const fn size_sectors(&self) -> Sector {
        self.pages() as Sector * BLOCK_SECTORS
    }

    /// Bytes this descriptor takes in the metadata block
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        PAYLOAD_HEADER_SIZE + CHECKSUM_SIZE * self.pages()
    }

    const fn flags(&self) -> u16 {
        if self.q_checksum.is_some() {
            PAYLOAD_FLAG_Q
        } else {
            0
        }
    }
}

/// Descriptor bytes needed for a stripe with `data_pages` data pages and
/// `parity_pages` (0, 1 or 2) parity pages
#[must_use]
pub const fn payload_meta_size(data_pages: usize, parity_pages: usize) -> usize {
    let data = (PAYLOAD_HEADER_SIZE + CHECKSUM_SIZE) * data_pages;
    if parity_pages == 0 {
        data
    } else {
        data + PAYLOAD_HEADER_SIZE + CHECKSUM_SIZE * parity_pages
    }
}

/// Whether `payload_size` descriptor bytes fit a metadata block at all
#[must_use]
pub const fn fits_in_block(payload_size: usize) -> bool {
    META_HEADER_SIZE + payload_size <= BLOCK_SIZE
}

/// Builds a metadata block in place
#[derive(Debug)]
pub struct MetaBlockWriter {
    page: Page,
    offset: usize,
    seq: u64,
    position: Sector,
}

impl MetaBlockWriter {
    /// Start a block with sequence `seq` located at `position`
    #[must_use]
    pub fn new(mut page: Page, seq: u64, position: Sector) -> Self {
        page.clear();
        let mut header = page.as_mut_slice();
        header.put_u32_le(META_MAGIC);
        header.put_u8(META_VERSION);
        (&mut page.as_mut_slice()[SEQ_OFFSET..]).put_u64_le(seq);
        (&mut page.as_mut_slice()[POSITION_OFFSET..]).put_u64_le(position);
        Self {
            page,
            offset: META_HEADER_SIZE,
            seq,
            position,
        }
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn position(&self) -> Sector {
        self.position
    }

    /// Bytes used so far, header included
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn has_room(&self, payload_size: usize) -> bool {
        self.offset + payload_size <= BLOCK_SIZE
    }

    /// Append one descriptor. Returns false, leaving the block untouched, if
    /// it does not fit.
    pub fn append(&mut self, payload: &Payload) -> bool {
        if !self.has_room(payload.encoded_len()) {
            return false;
        }
        let mut out = &mut self.page.as_mut_slice()[self.offset..];
        out.put_u16_le(payload.kind as u16);
        out.put_u16_le(payload.flags());
        out.put_u32_le(payload.size_sectors() as u32);
        out.put_u64_le(payload.location);
        out.put_u32_le(payload.checksum);
        if let Some(q) = payload.q_checksum {
            out.put_u32_le(q);
        }
        self.offset += payload.encoded_len();
        true
    }

    /// Seal the block: record its size and checksum
    #[must_use]
    pub fn finish(mut self, seed: u32) -> Page {
        let data = self.page.as_mut_slice();
        (&mut data[META_SIZE_OFFSET..]).put_u32_le(self.offset as u32);
        (&mut data[CHECKSUM_OFFSET..]).put_u32_le(0);
        let crc = page_checksum(seed, data);
        (&mut data[CHECKSUM_OFFSET..]).put_u32_le(crc);
        self.page
    }
}

/// Why a block is not a valid continuation of the log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaInvalid {
    BadMagic(u32),
    BadVersion(u8),
    BadSize(u32),
    SeqMismatch { expected: u64, found: u64 },
    PositionMismatch { expected: Sector, found: Sector },
    ChecksumMismatch { expected: u32, actual: u32 },
    BadPayload { offset: usize },
}

impl fmt::Display for MetaInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad magic {m:#010x}"),
            Self::BadVersion(v) => write!(f, "unsupported version {v}"),
            Self::BadSize(s) => write!(f, "bad meta size {s}"),
            Self::SeqMismatch { expected, found } => {
                write!(f, "sequence {found}, expected {expected}")
            }
            Self::PositionMismatch { expected, found } => {
                write!(f, "position {found}, expected {expected}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum {actual:#010x}, expected {expected:#010x}")
            }
            Self::BadPayload { offset } => write!(f, "malformed payload at byte {offset}"),
        }
    }
}

/// A decoded and validated metadata block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaBlock {
    pub seq: u64,
    pub position: Sector,
    pub meta_size: u32,
    pub checksum: u32,
    pub payloads: Vec<Payload>,
}

impl MetaBlock {
    /// Decode the block read from `position`. When `seq` is given the block
    /// must carry exactly that sequence number.
    pub fn decode(
        data: &[u8],
        seed: u32,
        position: Sector,
        seq: Option<u64>,
    ) -> Result<Self, MetaInvalid> {
        if data.len() < BLOCK_SIZE {
            return Err(MetaInvalid::BadSize(data.len() as u32));
        }
        let data = &data[..BLOCK_SIZE];
        let mut header = data;
        let magic = header.get_u32_le();
        if magic != META_MAGIC {
            return Err(MetaInvalid::BadMagic(magic));
        }
        let version = data[VERSION_OFFSET];
        if version != META_VERSION {
            return Err(MetaInvalid::BadVersion(version));
        }
        let meta_size = (&data[META_SIZE_OFFSET..]).get_u32_le();
        let found_seq = (&data[SEQ_OFFSET..]).get_u64_le();
        let found_position = (&data[POSITION_OFFSET..]).get_u64_le();
        let stored = (&data[CHECKSUM_OFFSET..]).get_u32_le();

        if let Some(expected) = seq {
            if found_seq != expected {
                return Err(MetaInvalid::SeqMismatch {
                    expected,
                    found: found_seq,
                });
            }
        }
        if found_position != position {
            return Err(MetaInvalid::PositionMismatch {
                expected: position,
                found: found_position,
            });
        }

        let actual = {
            let crc = page_checksum(seed, &data[..CHECKSUM_OFFSET]);
            let crc = page_checksum(crc, &[0u8; CHECKSUM_SIZE]);
            page_checksum(crc, &data[CHECKSUM_OFFSET + CHECKSUM_SIZE..])
        };
        if actual != stored {
            return Err(MetaInvalid::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let size = meta_size as usize;
        if !(META_HEADER_SIZE..=BLOCK_SIZE).contains(&size) {
            return Err(MetaInvalid::BadSize(meta_size));
        }

        Ok(Self {
            seq: found_seq,
            position: found_position,
            meta_size,
            checksum: stored,
            payloads: decode_payloads(&data[..size])?,
        })
    }

    /// Log sectors taken by this block and its pages
    #[must_use]
    pub fn total_sectors(&self) -> Sector {
        BLOCK_SECTORS + self.payloads.iter().map(Payload::size_sectors).sum::<Sector>()
    }
}

fn decode_payloads(block: &[u8]) -> Result<Vec<Payload>, MetaInvalid> {
    let mut payloads = Vec::new();
    let mut offset = META_HEADER_SIZE;
    while offset < block.len() {
        let bad = MetaInvalid::BadPayload { offset };
        if block.len() - offset < PAYLOAD_HEADER_SIZE {
            return Err(bad);
        }
        let mut buf = &block[offset..];
        let kind = PayloadType::try_from(buf.get_u16_le()).map_err(|_| bad)?;
        let flags = buf.get_u16_le();
        let size = Sector::from(buf.get_u32_le());
        let location = buf.get_u64_le();

        let pages = match (kind, size) {
            (PayloadType::Data | PayloadType::Parity, BLOCK_SECTORS) => 1,
            (PayloadType::Parity, s) if s == 2 * BLOCK_SECTORS => 2,
            _ => return Err(bad),
        };
        if (flags & PAYLOAD_FLAG_Q != 0) != (pages == 2) {
            return Err(bad);
        }
        if buf.remaining() < CHECKSUM_SIZE * pages {
            return Err(bad);
        }
        let checksum = buf.get_u32_le();
        let q_checksum = (pages == 2).then(|| buf.get_u32_le());

        let payload = Payload {
            kind,
            location,
            checksum,
            q_checksum,
        };
        offset += payload.encoded_len();
        payloads.push(payload);
    }
    Ok(payloads)
}
