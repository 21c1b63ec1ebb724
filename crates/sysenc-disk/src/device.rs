//! Block device abstraction over raw drives, container files and memory

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sysenc_core::{SysencError, SysencResult};

/// Byte-addressed storage with a fixed logical sector size.
///
/// Offsets passed to `read_at`/`write_at` are byte offsets; callers keep
/// them sector aligned.
pub trait BlockDevice: Send {
    fn sector_size(&self) -> usize;

    /// Size in bytes.
    fn len(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SysencResult<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> SysencResult<()>;

    fn flush(&mut self) -> SysencResult<()>;

    /// True for a raw drive or partition, false for a container file.
    fn is_device(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sector_count(&self) -> u64 {
        self.len() / self.sector_size() as u64
    }

    fn read_sectors(&mut self, first_sector: u64, buf: &mut [u8]) -> SysencResult<()> {
        let offset = first_sector * self.sector_size() as u64;
        self.read_at(offset, buf)
    }

    fn write_sectors(&mut self, first_sector: u64, buf: &[u8]) -> SysencResult<()> {
        let offset = first_sector * self.sector_size() as u64;
        self.write_at(offset, buf)
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }
    fn len(&self) -> u64 {
        (**self).len()
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SysencResult<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> SysencResult<()> {
        (**self).write_at(offset, buf)
    }
    fn flush(&mut self) -> SysencResult<()> {
        (**self).flush()
    }
    fn is_device(&self) -> bool {
        (**self).is_device()
    }
}

/// A drive, partition or container file opened through the filesystem.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    sector_size: usize,
    len: u64,
    is_device: bool,
}

impl FileDevice {
    /// Open an existing drive or file read-write.
    pub fn open(path: &Path, sector_size: usize) -> SysencResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SysencError::device(format!("opening {}", path.display()), e))?;
        Self::from_file(file, path, sector_size)
    }

    /// Open read-only (inspection, verification).
    pub fn open_read_only(path: &Path, sector_size: usize) -> SysencResult<Self> {
        let file = File::open(path)
            .map_err(|e| SysencError::device(format!("opening {}", path.display()), e))?;
        Self::from_file(file, path, sector_size)
    }

    /// Create (or truncate) a container file of `size` bytes.
    pub fn create_container(path: &Path, size: u64, sector_size: usize) -> SysencResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SysencError::device(format!("creating {}", path.display()), e))?;
        file.set_len(size)
            .map_err(|e| SysencError::device(format!("sizing {}", path.display()), e))?;
        Self::from_file(file, path, sector_size)
    }

    fn from_file(mut file: File, path: &Path, sector_size: usize) -> SysencResult<Self> {
        let meta = file
            .metadata()
            .map_err(|e| SysencError::device(format!("stat {}", path.display()), e))?;
        let is_device = is_block_device(&meta);
        let len = if is_device {
            file.seek(SeekFrom::End(0))
                .map_err(|e| SysencError::device(format!("sizing {}", path.display()), e))?
        } else {
            meta.len()
        };
        tracing::debug!(path = %path.display(), len, is_device, "opened block device");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            sector_size,
            len,
            is_device,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn is_block_device(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_meta: &std::fs::Metadata) -> bool {
    false
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SysencResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| {
                SysencError::device(format!("reading {} at {offset}", self.path.display()), e)
            })
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> SysencResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| {
                SysencError::device(format!("writing {} at {offset}", self.path.display()), e)
            })
    }

    fn flush(&mut self) -> SysencResult<()> {
        self.file
            .sync_data()
            .map_err(|e| SysencError::device(format!("flushing {}", self.path.display()), e))
    }

    fn is_device(&self) -> bool {
        self.is_device
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    bad_sectors: BTreeSet<u64>,
    unwritable_sectors: BTreeSet<u64>,
    failing_writes: usize,
    write_log: Vec<(u64, usize)>,
}

/// Shared in-memory drive. Clones see the same bytes, which lets a test
/// inspect a device while a worker thread owns another handle to it.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    inner: Arc<Mutex<MemoryInner>>,
    sector_size: usize,
    is_device: bool,
}

impl MemoryDevice {
    pub fn new(len: usize, sector_size: usize) -> Self {
        Self::from_bytes(vec![0u8; len], sector_size)
    }

    pub fn from_bytes(data: Vec<u8>, sector_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                data,
                ..MemoryInner::default()
            })),
            sector_size,
            is_device: true,
        }
    }

    /// Report as a container file instead of a raw device.
    pub fn as_container(mut self) -> Self {
        self.is_device = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Reads touching this sector fail.
    pub fn mark_bad_sector(&self, sector: u64) {
        self.lock().bad_sectors.insert(sector);
    }

    /// Writes reaching this sector land the sectors before it, then fail.
    pub fn mark_unwritable_sector(&self, sector: u64) {
        self.lock().unwritable_sectors.insert(sector);
    }

    pub fn clear_unwritable_sectors(&self) {
        self.lock().unwritable_sectors.clear();
    }

    /// The next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// (offset, length) of every successful write so far.
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.lock().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.lock().write_log.clear();
    }
}

impl BlockDevice for MemoryDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn len(&self) -> u64 {
        self.lock().data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SysencResult<()> {
        let inner = self.lock();
        let ss = self.sector_size as u64;
        let first = offset / ss;
        let last = (offset + buf.len() as u64).div_ceil(ss);
        if inner.bad_sectors.range(first..last).next().is_some() {
            return Err(SysencError::Device(format!(
                "unreadable sector in {first}..{last}"
            )));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > inner.data.len() {
            return Err(SysencError::Device(format!(
                "read past end of device at {offset}"
            )));
        }
        buf.copy_from_slice(&inner.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> SysencResult<()> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(SysencError::Device(format!("injected write failure at {offset}")));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > inner.data.len() {
            return Err(SysencError::Device(format!(
                "write past end of device at {offset}"
            )));
        }
        let ss = self.sector_size as u64;
        let first = offset / ss;
        let last = (offset + buf.len() as u64).div_ceil(ss);
        if let Some(&stuck) = inner.unwritable_sectors.range(first..last).next() {
            // torn write: everything before the stuck sector lands
            let landed = (stuck * ss).saturating_sub(offset) as usize;
            inner.data[start..start + landed].copy_from_slice(&buf[..landed]);
            return Err(SysencError::Device(format!(
                "write failed at sector {stuck} after {landed} bytes"
            )));
        }
        inner.data[start..end].copy_from_slice(buf);
        // Writes repair unreadable sectors.
        let repaired: Vec<u64> = inner.bad_sectors.range(first..last).copied().collect();
        for s in repaired {
            inner.bad_sectors.remove(&s);
        }
        inner.write_log.push((offset, buf.len()));
        Ok(())
    }

    fn flush(&mut self) -> SysencResult<()> {
        Ok(())
    }

    fn is_device(&self) -> bool {
        self.is_device
    }
}
