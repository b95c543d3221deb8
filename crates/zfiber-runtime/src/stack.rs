//! Fiber stack allocation
//!
//! Stacks are mmap'd anonymous regions with a PROT_NONE guard page at the
//! low end, so running off the bottom faults instead of silently
//! corrupting a neighbour.

use zfiber_core::FiberResult;

/// Default fiber stack size (excluding the guard page)
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest usable stack we will hand out
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Guard page size; one page
const GUARD_SIZE: usize = 4096;

const PAGE_SIZE: usize = 4096;

#[inline]
fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A stack owned by a single fiber (or by a thread's switch stack)
///
/// Layout, low to high address:
///
/// ```text
/// base                     base + GUARD_SIZE                  top
///   | PROT_NONE guard page |     usable stack (grows down)     |
/// ```
pub struct OwnedStack {
    /// Base of the whole mapping (guard page included)
    base: *mut u8,
    /// Total mapping size (guard page included)
    map_size: usize,
    /// Usable stack size
    stack_size: usize,
}

// The mapping is private to the owning fiber; access is serialized by
// the fiber's own resume discipline.
unsafe impl Send for OwnedStack {}
unsafe impl Sync for OwnedStack {}

impl OwnedStack {
    /// Map a new stack of at least `size` usable bytes.
    ///
    /// Fails with `Syscall` if the kernel refuses the mapping; fiber
    /// construction treats that as fatal.
    pub fn new(size: usize) -> FiberResult<Self> {
        let stack_size = round_up_to_page(size.max(MIN_STACK_SIZE));
        let map_size = stack_size + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(zfiber_core::FiberError::last_os_error());
        }

        // Revoke access to the lowest page; stacks grow down into it on
        // overflow.
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = zfiber_core::FiberError::last_os_error();
            unsafe { libc::munmap(base, map_size) };
            return Err(err);
        }

        Ok(Self {
            base: base as *mut u8,
            map_size,
            stack_size,
        })
    }

    /// High end of the usable region; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.map_size) }
    }

    /// Low end of the usable region (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(GUARD_SIZE) }
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for OwnedStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_size) };
        if ret != 0 {
            log::warn!(
                "stack munmap failed: base={:p}, size={}, errno={}",
                self.base,
                self.map_size,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
        }
    }
}
