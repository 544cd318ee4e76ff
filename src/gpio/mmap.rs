//! Shared memory-mapped register regions for fast GPIO paths.
//!
//! A GPIO bank's register page is mapped once per process and shared by
//! every context that enables the fast path. The registry below hands
//! out `Arc`s to a single mapping per path; the map/unmap lifetime is
//! the `Arc` count, and the registry itself is mutex-guarded so
//! concurrent enables from different threads cannot double-map or
//! unmap a region out from under a reader.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

static REGIONS: OnceLock<Mutex<HashMap<PathBuf, Weak<MmapRegion>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<MmapRegion>>> {
    REGIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One mapped register region. Unmapped when the last `Arc` drops.
pub struct MmapRegion {
    path: PathBuf,
    ptr: *mut u8,
    len: usize,
}

// The raw pointer is only dereferenced through volatile accessors with
// bounds checks; the mapping itself is shared device memory.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes of `path`, or return the existing process-wide
    /// mapping for it.
    pub fn acquire(path: &Path, len: usize) -> Result<Arc<MmapRegion>> {
        if len == 0 {
            return Err(Error::InvalidParameter("mmap length must be non-zero".into()));
        }

        let mut regions = registry().lock().unwrap_or_else(|e| e.into_inner());
        regions.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = regions.get(path).and_then(Weak::upgrade) {
            if existing.len < len {
                return Err(Error::InvalidParameter(format!(
                    "{} already mapped with {} bytes, {len} requested",
                    path.display(),
                    existing.len
                )));
            }
            trace!(path = %path.display(), "reusing mapped register region");
            return Ok(existing);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;

        // SAFETY: len is non-zero, the fd is valid for the duration of
        // the call, and the mapping outlives the fd by design of mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::NoResources(format!(
                "mmap of {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        debug!(path = %path.display(), len, "mapped register region");
        let region = Arc::new(MmapRegion {
            path: path.to_path_buf(),
            ptr: ptr.cast(),
            len,
        });
        regions.insert(path.to_path_buf(), Arc::downgrade(&region));
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Volatile 32-bit register read.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;
        // SAFETY: bounds and alignment checked above; mapping is live
        // for the lifetime of self.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) })
    }

    /// Volatile 32-bit register write.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;
        // SAFETY: as for read_u32.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value) };
        Ok(())
    }

    fn check(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return Err(Error::InvalidParameter(format!(
                "register offset {offset} out of range for {}-byte region",
                self.len
            )));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "unmapping register region");
        // SAFETY: ptr/len are the values returned by mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_same_path_shares_one_mapping() {
        let file = backing_file(4096);
        let a = MmapRegion::acquire(file.path(), 4096).unwrap();
        let b = MmapRegion::acquire(file.path(), 4096).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.write_u32(8, 0xDEAD_BEEF).unwrap();
        assert_eq!(b.read_u32(8).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_region_remapped_after_all_handles_drop() {
        let file = backing_file(4096);
        let a = MmapRegion::acquire(file.path(), 4096).unwrap();
        drop(a);
        let b = MmapRegion::acquire(file.path(), 4096).unwrap();
        assert_eq!(b.len(), 4096);
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let file = backing_file(4096);
        let region = MmapRegion::acquire(file.path(), 4096).unwrap();
        assert!(matches!(
            region.read_u32(4096),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            region.write_u32(2, 1),
            Err(Error::InvalidParameter(_))
        ));
    }
}
