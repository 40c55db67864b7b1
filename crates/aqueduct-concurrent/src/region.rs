use std::path::{Path, PathBuf};

use shared_memory::{ShmemConf, ShmemError};

use crate::error::RegionError;

/// A file-backed shared-memory region identified by a flink path. The driver
/// creates regions (control file, counter values, log buffers); clients open
/// them. The mapping stays alive for the life of the process; `unlink`
/// removes the path so the next creator starts fresh.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    path: PathBuf,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> Result<Self, RegionError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match ShmemConf::new().size(len).flink(path).create() {
            Ok(shmem) => {
                let ptr = shmem.as_ptr();
                // keep the mapping for the life of the process, same flink is
                // picked back up on restart
                std::mem::forget(shmem);
                unsafe { std::ptr::write_bytes(ptr, 0, len) };
                Ok(Self { ptr, len, path: path.to_path_buf() })
            }
            Err(ShmemError::LinkExists) => {
                tracing::warn!(?path, "stale mapped file, removing and recreating");
                let _ = std::fs::remove_file(path);
                Self::create(path, len)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegionError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RegionError::NonExistingFile);
        }
        let shmem = ShmemConf::new().flink(path).open()?;
        let ptr = shmem.as_ptr();
        let len = shmem.len();
        std::mem::forget(shmem);
        Ok(Self { ptr, len, path: path.to_path_buf() })
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the flink so no new process can attach. Existing mappings
    /// stay valid until their processes exit.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path)
            .inspect_err(|e| tracing::warn!(path = ?self.path, "couldn't unlink region: {e}"));
    }
}
