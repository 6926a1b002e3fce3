//! POSIX shared-memory segments backing shared MemPools.
//!
//! Grounded on the shm_open/mmap handling in the enrichment crate's SPSC
//! transport: named `/dev/shm` objects, owner-only permissions, explicit
//! unmap/unlink on drop.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::MemPoolError;

static NEXT_SHM_ID: AtomicU32 = AtomicU32::new(1);

fn shm_name(id: u32) -> CString {
    CString::new(format!("/pulse-shm-{id:08x}")).expect("no interior nul")
}

/// A POSIX shared-memory region, either owned (created read-write by this
/// process) or imported (opened read-only from a peer's `shm_id`).
pub struct SharedSegment {
    ptr: *mut u8,
    len: usize,
    shm_id: u32,
    owned: bool,
}

// SAFETY: the mapped region is only ever read after creation (owned side
// writes happen only through `as_mut_slice` before any cross-thread
// sharing) and the pointer is stable for the segment's lifetime.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates a new read-write segment of `len` bytes with 0700 permissions
    /// and returns it along with the freshly allocated `shm_id`.
    pub fn create(len: usize) -> Result<Self, MemPoolError> {
        let id = NEXT_SHM_ID.fetch_add(1, Ordering::Relaxed);
        let name = shm_name(id);

        // SAFETY: name is a valid NUL-terminated C string; fd is checked below.
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o700) };
        if fd < 0 {
            return Err(MemPoolError::ShmCreateFailed(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid, just-opened shm fd.
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(MemPoolError::ShmCreateFailed(err));
        }

        // SAFETY: fd is valid and sized to `len`.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(name.as_ptr()) };
            return Err(MemPoolError::ShmMapFailed(err));
        }

        Ok(Self { ptr: ptr as *mut u8, len, shm_id: id, owned: true })
    }

    /// Opens an existing segment read-only by its `shm_id`, as an importer
    /// does for a peer-owned pool.
    /// Creates an anonymous, process-private mapping of `len` bytes. Used
    /// for pools that are never exported; avoids the shm_open/unlink
    /// bookkeeping entirely while still giving every slot a stable address.
    pub fn create_private(len: usize) -> Result<Self, MemPoolError> {
        // SAFETY: MAP_ANONYMOUS with fd -1 and offset 0 is the documented
        // way to get a zeroed private mapping not backed by a file.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemPoolError::ShmMapFailed(io::Error::last_os_error()));
        }
        Ok(Self { ptr: ptr as *mut u8, len, shm_id: 0, owned: false })
    }

    pub fn open_readonly(shm_id: u32, len: usize) -> Result<Self, MemPoolError> {
        let name = shm_name(shm_id);

        // SAFETY: name is a valid NUL-terminated C string.
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0o700) };
        if fd < 0 {
            return Err(MemPoolError::ShmMapFailed(io::Error::last_os_error()));
        }

        // SAFETY: fd is valid; len is the caller-asserted segment size.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, libc::PROT_READ, libc::MAP_SHARED, fd, 0) };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(MemPoolError::ShmMapFailed(io::Error::last_os_error()));
        }

        Ok(Self { ptr: ptr as *mut u8, len, shm_id, owned: false })
    }

    pub fn shm_id(&self) -> u32 {
        self.shm_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Immutable view of the whole segment.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mmap for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable view; only meaningful for an owned (read-write) segment.
    ///
    /// # Safety
    /// Callers must ensure no other thread concurrently reads the slot
    /// range being written; the pool's freelist/ref-counting discipline is
    /// what normally guarantees this.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// Advises the kernel that `range` is no longer needed, letting it
    /// reclaim the backing pages. The region remains mappable and reads as
    /// zero afterward.
    pub fn vacuum_range(&self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let aligned_start = (start + page - 1) / page * page;
        if aligned_start >= start + len {
            return;
        }
        let aligned_len = (start + len) - aligned_start;
        // SAFETY: aligned_start/aligned_len lie within [0, self.len).
        unsafe {
            libc::madvise(
                self.ptr.add(aligned_start) as *mut libc::c_void,
                aligned_len,
                libc::MADV_DONTNEED,
            );
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the mapping created in `create`/`open_readonly`.
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if self.owned {
            let name = shm_name(self.shm_id);
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
    }
}
