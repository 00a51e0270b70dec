//! Low-level POSIX shared memory operations

use crate::error::{QueueError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const SHM_PREFIX: &str = "/venomq_";
pub(crate) const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Handle to a mapped shared memory region
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the mapping stays valid for the lifetime of the handle and all
// mutation of its contents is serialized by the segment lock.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn os_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(QueueError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    if name.is_empty() || name.contains('/') {
        return Err(QueueError::InvalidKey(name.to_string()));
    }
    CString::new(format!("{}{}", SHM_PREFIX, name))
        .map_err(|_| QueueError::InvalidKey(name.to_string()))
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| QueueError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| QueueError::Mmap(std::io::Error::other("mmap returned null")))
}

impl ShmRegion {
    /// Create a new shared memory region
    ///
    /// Creation is exclusive: an existing region with the same name is a
    /// collision and reported as [`QueueError::Allocation`].
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| QueueError::Allocation {
            name: name.to_string(),
            source: e.into(),
        })?;

        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| QueueError::Truncate(e.into()))
            .and_then(|_| map_shared(&fd, size));

        let addr = match mapped {
            Ok(addr) => addr,
            Err(err) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(err);
            }
        };

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        tracing::debug!(name, size, "created shared memory region");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            QueueError::SegmentNotFound {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        // Get size from file
        let stat = rustix::fs::fstat(&fd).map_err(|e| QueueError::SegmentNotFound {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(QueueError::Truncated { need: 1, got: 0 });
        }

        let addr = map_shared(&fd, size)?;

        tracing::debug!(name, size, "opened shared memory region");

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Remove the OS name of a region
    ///
    /// Existing mappings stay valid until they are dropped; new `open` calls
    /// fail from this point on.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = os_name(name)?;
        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => Ok(()),
            Err(Errno::NOENT) => Err(QueueError::SegmentNotFound {
                name: name.to_string(),
                source: Errno::NOENT.into(),
            }),
            Err(e) => Err(QueueError::Teardown {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of shared memory
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap only; unlinking is an explicit teardown decision
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}
