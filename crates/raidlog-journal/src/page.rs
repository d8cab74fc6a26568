//! Block-sized page buffers and the bounded pool metadata pages come from
//!
//! Pages are aligned to the block size so they can be handed to a device
//! opened with direct I/O without a bounce copy.

use std::fmt;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use raidlog_common::BLOCK_SIZE;

#[repr(C, align(4096))]
#[derive(Clone)]
struct PageData([u8; BLOCK_SIZE]);

/// One journal block worth of memory, aligned for direct I/O
#[derive(Clone)]
pub struct Page(Box<PageData>);

impl Page {
    /// Allocate a zero-filled page
    #[must_use]
    pub fn zeroed() -> Self {
        Self(Box::new(PageData([0; BLOCK_SIZE])))
    }

    /// Allocate a page holding `src`, zero padded
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let mut page = Self::zeroed();
        page.copy_from(src);
        page
    }

    /// Get the page as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0.0
    }

    /// Get the page as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0.0
    }

    /// Copy data into the page (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let copy_len = src.len().min(BLOCK_SIZE);
        self.0.0[..copy_len].copy_from_slice(&src[..copy_len]);
        self.0.0[copy_len..].fill(0);
    }

    pub fn clear(&mut self) {
        self.0.0.fill(0);
    }

    /// Snapshot of the contents, detached from this buffer
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("head", &&self.as_slice()[..8])
            .finish_non_exhaustive()
    }
}

impl AsRef<[u8]> for Page {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for Page {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

/// Fixed-capacity pool of pages.
///
/// `acquire` blocks until a page is returned. Every page handed out is
/// returned once the I/O using it completes, and that completion never
/// needs a page from the same pool.
pub struct PagePool {
    free: Mutex<Vec<Page>>,
    returned: Condvar,
    capacity: usize,
}

impl PagePool {
    /// Create a pool with `capacity` preallocated pages
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new((0..capacity).map(|_| Page::zeroed()).collect()),
            returned: Condvar::new(),
            capacity,
        }
    }

    /// Take a zeroed page, waiting for one to be released if necessary
    pub fn acquire(&self) -> Page {
        let mut free = self.free.lock();
        loop {
            if let Some(mut page) = free.pop() {
                page.clear();
                return page;
            }
            self.returned.wait(&mut free);
        }
    }

    /// Take a zeroed page if one is available right now
    pub fn try_acquire(&self) -> Option<Page> {
        let mut page = self.free.lock().pop()?;
        page.clear();
        Some(page)
    }

    /// Give a page back to the pool
    pub fn release(&self, page: Page) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(page);
        }
        drop(free);
        self.returned.notify_one();
    }

    /// Pages currently available
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .finish()
    }
}
