//! raidlog Journal - write-back journal and stripe cache for RAID5/6
//!
//! Every stripe write is first appended to a journal device as an I/O unit:
//! one metadata block describing the payloads, followed by their data and
//! parity blocks. Only once the unit is durable does the stripe go to the
//! member disks, so a crash between the two never leaves parity
//! inconsistent with its data (the write hole).
//!
//! In write-back mode data is completed to the caller as soon as it is in
//! the journal and is later written to the member disks by the array. The
//! journal tail can only move past a stripe once it reaches the disks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  write_stripe   ┌────────────────┐
//! │   RAID array     │────────────────▶│      Log       │
//! │  (RaidArray)     │◀────────────────│ head / lists   │
//! └──────────────────┘ release_stripe  └───────┬────────┘
//!          ▲                                   │ IoRequest
//!          │ superblock / tail        ┌────────▼────────┐
//!          │                          │   I/O workers   │──▶ journal device
//!    ┌─────┴──────┐                   └────────┬────────┘
//!    │  reclaim   │◀── iounit_wait ─── completions
//!    └────────────┘
//! ```

pub mod array;
pub mod cache;
pub mod completion;
pub mod device;
pub mod io_unit;
pub mod journal;
pub mod log;
pub mod meta;
pub mod page;
pub mod read;
pub mod reclaim;
pub mod recovery;
pub mod ring;
pub mod stats;
pub mod stripe;

#[cfg(test)]
pub(crate) mod test_utils;

pub use array::{CachePressure, RaidArray};
pub use cache::{Dirtying, handle_stripe_dirtying};
pub use completion::{Completion, IoRequest};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use journal::Journal;
pub use log::{
    FlushDisposition, JournalOutcome, Log, ParkReason, handle_flush_request, log_disk_error,
    write_stripe, write_stripe_run,
};
pub use read::{ChunkLookup, PartialRead, ReadBio, lookup_chunk};
pub use ring::JournalPos;
pub use stats::{JournalStats, PrometheusExporter};
pub use stripe::{CacheState, DevFlags, Stripe, StripeFlags, StripeGeometry, StripeState};
