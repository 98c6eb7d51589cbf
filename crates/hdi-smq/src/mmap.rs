//! File-backed shared mappings.
//!
//! Both endpoints agree on a path out of band (typically under `/dev/shm`).
//! The creator sizes the file; the peer opens it and maps whatever size it
//! finds.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::region::{Region, RegionError};

/// A `MAP_SHARED` mapping of a file, unmapped on drop.
pub struct MmapRegion {
    base_addr: *mut u8,
    size: usize,
    path: PathBuf,
    /// Kept open for the lifetime of the mapping.
    _file: File,
}

// SAFETY: the mapping is plain memory; structures placed in it synchronize
// through atomics.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Create (or truncate) the file at `path`, size it to `size` bytes and
    /// map it.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self, RegionError> {
        if size == 0 {
            return Err(RegionError::Empty);
        }
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;

        let region = Self::map(file, size, path)?;
        debug!(path = %path.display(), size, "created shared segment");
        Ok(region)
    }

    /// Map an existing file at its current size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(RegionError::Empty);
        }

        let region = Self::map(file, size, path)?;
        debug!(path = %path.display(), size, "attached shared segment");
        Ok(region)
    }

    fn map(file: File, size: usize, path: &Path) -> Result<Self, RegionError> {
        // SAFETY: mapping a regular file we hold open; the result is checked.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            return Err(RegionError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// View of the mapping. Page alignment satisfies the 64-byte requirement.
    pub fn region(&self) -> Region {
        // SAFETY: mapped for `size` bytes until self is dropped.
        unsafe { Region::from_raw(self.base_addr, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: base_addr and size describe the mapping created in map().
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}
