//! Block devices the journal and replay write to
//!
//! [`BlockDevice`] is the seam between the engine and real storage. The
//! journal device and every member disk of the array are reached through it.
//! [`FileDevice`] serves files and block devices with positional I/O,
//! [`MemDevice`] keeps everything in memory and records what happened to it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use raidlog_common::{
    BLOCK_SIZE, DeviceConfig, Error, Result, SECTOR_SHIFT, SECTOR_SIZE, Sector,
};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

use crate::page::Page;

/// Synchronous sector-addressed storage
pub trait BlockDevice: Send + Sync {
    /// Capacity in sectors
    fn size_sectors(&self) -> Sector;

    /// Read `buf.len()` bytes (a multiple of the block size) at `sector`
    fn read_page(&self, sector: Sector, buf: &mut [u8]) -> Result<()>;

    /// Write `data` (a multiple of the block size) at `sector`
    fn write_page(&self, sector: Sector, data: &[u8]) -> Result<()>;

    /// Make every completed write durable
    fn flush(&self) -> Result<()>;

    /// Tell the device `len` sectors at `sector` are no longer used
    fn discard(&self, sector: Sector, len: Sector) -> Result<()>;

    /// Whether completed writes need a [`flush`](Self::flush) to be durable
    fn needs_flush(&self) -> bool;

    fn supports_discard(&self) -> bool;
}

fn check_range(size: Sector, sector: Sector, len: usize) -> Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::invalid_argument(format!(
            "I/O length {len} is not a multiple of {BLOCK_SIZE}"
        )));
    }
    let end = sector + (len >> SECTOR_SHIFT) as Sector;
    if end > size {
        return Err(Error::storage(format!(
            "I/O at sector {sector} (+{len} bytes) beyond device end {size}"
        )));
    }
    Ok(())
}

/// In-memory device
#[derive(Debug)]
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
    needs_flush: bool,
    discard: bool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
    flushes: AtomicU64,
    discards: Mutex<Vec<(Sector, Sector)>>,
}

impl MemDevice {
    /// Zero-filled device of `sectors` sectors
    #[must_use]
    pub fn new(sectors: Sector) -> Self {
        Self::from_image(vec![0; sectors as usize * SECTOR_SIZE])
    }

    /// Device backed by a copy of an existing image
    #[must_use]
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(image),
            needs_flush: false,
            discard: true,
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            discards: Mutex::new(Vec::new()),
        }
    }

    /// Report a volatile write cache
    #[must_use]
    pub const fn with_flush(mut self, needs_flush: bool) -> Self {
        self.needs_flush = needs_flush;
        self
    }

    #[must_use]
    pub const fn with_discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    /// Make every following write and flush fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Copy of the current contents
    pub fn image(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// The block at `sector`
    pub fn block(&self, sector: Sector) -> Vec<u8> {
        let start = sector as usize * SECTOR_SIZE;
        self.data.read()[start..start + BLOCK_SIZE].to_vec()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Discarded ranges, oldest first
    pub fn discarded(&self) -> Vec<(Sector, Sector)> {
        self.discards.lock().clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::DiskIo(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }
}

impl BlockDevice for MemDevice {
    fn size_sectors(&self) -> Sector {
        (self.data.read().len() / SECTOR_SIZE) as Sector
    }

    fn read_page(&self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        check_range((data.len() / SECTOR_SIZE) as Sector, sector, buf.len())?;
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_page(&self, sector: Sector, src: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        check_range((data.len() / SECTOR_SIZE) as Sector, sector, src.len())?;
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + src.len()].copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_writable()?;
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn discard(&self, sector: Sector, len: Sector) -> Result<()> {
        if !self.discard {
            return Err(Error::storage("discard not supported"));
        }
        let mut data = self.data.write();
        let start = sector as usize * SECTOR_SIZE;
        let end = start + len as usize * SECTOR_SIZE;
        if end > data.len() {
            return Err(Error::storage(format!(
                "discard of {len} sectors at {sector} beyond device end"
            )));
        }
        data[start..end].fill(0);
        self.discards.lock().push((sector, len));
        Ok(())
    }

    fn needs_flush(&self) -> bool {
        self.needs_flush
    }

    fn supports_discard(&self) -> bool {
        self.discard
    }
}

/// File or block device accessed with positional I/O
pub struct FileDevice {
    file: File,
    path: String,
    size: u64,
    direct_io: bool,
}

impl FileDevice {
    /// Open an existing file or block device
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let path_str = config.path.to_string_lossy().to_string();
        let file = Self::options(config.direct_io)
            .open(&config.path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;

        let is_block_device = {
            use std::os::unix::fs::FileTypeExt;
            file.metadata()
                .map(|m| m.file_type().is_block_device())
                .unwrap_or(false)
        };
        let size = if is_block_device {
            Self::block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| {
                    Error::Storage(format!("failed to get metadata for {path_str}: {e}"))
                })?
                .len()
        };

        tracing::debug!(path = %path_str, size, direct_io = config.direct_io, "opened device");
        Ok(Self {
            file,
            path: path_str,
            size,
            direct_io: config.direct_io,
        })
    }

    /// Create (or truncate) a regular file of `size` bytes and open it
    pub fn create(config: &DeviceConfig, size: u64) -> Result<Self> {
        let path_str = config.path.to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;
        file.set_len(size)
            .map_err(|e| Error::Storage(format!("failed to set size of {path_str}: {e}")))?;
        drop(file);
        Self::open(config)
    }

    fn options(direct_io: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        // O_DIRECT bypasses page cache on Linux
        #[cfg(target_os = "linux")]
        {
            if direct_io {
                options.custom_flags(libc::O_DIRECT);
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = direct_io;
        }
        options
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::Storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0))
            .map_err(|e| Error::Storage(format!("failed to get device size for {path}: {e}")))
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn size_sectors(&self) -> Sector {
        self.size >> SECTOR_SHIFT
    }

    fn read_page(&self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        check_range(self.size_sectors(), sector, buf.len())?;
        let offset = sector << SECTOR_SHIFT;
        if !self.direct_io {
            self.file.read_exact_at(buf, offset)?;
            return Ok(());
        }
        // O_DIRECT needs an aligned buffer, bounce through a page
        let mut bounce = Page::zeroed();
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.file
                .read_exact_at(bounce.as_mut_slice(), offset + (i * BLOCK_SIZE) as u64)?;
            chunk.copy_from_slice(bounce.as_slice());
        }
        Ok(())
    }

    fn write_page(&self, sector: Sector, data: &[u8]) -> Result<()> {
        check_range(self.size_sectors(), sector, data.len())?;
        let offset = sector << SECTOR_SHIFT;
        if !self.direct_io {
            self.file.write_all_at(data, offset)?;
            return Ok(());
        }
        let mut bounce = Page::zeroed();
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            bounce.copy_from(chunk);
            self.file
                .write_all_at(bounce.as_slice(), offset + (i * BLOCK_SIZE) as u64)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("failed to sync {}: {e}", self.path)))
    }

    fn discard(&self, _sector: Sector, _len: Sector) -> Result<()> {
        Err(Error::storage("discard not supported"))
    }

    fn needs_flush(&self) -> bool {
        true
    }

    fn supports_discard(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("direct_io", &self.direct_io)
            .finish()
    }
}
