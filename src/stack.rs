//! Fiber stacks.
//!
//! Stacks are mmap'ed so that an optional guard page can be installed at the
//! low end: running off the stack then faults instead of silently corrupting
//! a neighbouring allocation. The usable region is rounded up to whole pages
//! and the top is 16-byte aligned as every supported ABI requires.

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Smallest usable stack. Debug logging alone can burn a few KiB of frames,
/// so anything below this is rejected as a bad argument.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default fiber stack size.
pub(crate) const DEFAULT_STACK_SIZE: usize = 64 * 1024;

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned, mmap'ed stack region.
#[derive(Debug)]
pub(crate) struct Stack {
    base: NonNull<u8>,
    /// Full mapping length, guard page included.
    len: usize,
    guard: usize,
}

impl Stack {
    /// Map a stack of at least `size` usable bytes, with a PROT_NONE guard
    /// page below it if `guard_page` is set.
    pub(crate) fn new(size: usize, guard_page: bool) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::BadArgument("stack size is below the minimum"));
        }
        let page = page_size();
        let usable = (size + page - 1) & !(page - 1);
        let guard = if guard_page { page } else { 0 };
        let len = usable + guard;

        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        let flags = flags | libc::MAP_STACK;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM) => Error::OutOfMemory,
                _ => Error::System(err),
            });
        }
        if guard != 0 && unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(Error::System(err));
        }

        Ok(Self {
            base: NonNull::new(base.cast()).expect("mmap returned a non-null mapping"),
            len,
            guard,
        })
    }

    /// Upper end of the usable region, 16-byte aligned by construction
    /// (mappings are page-aligned and pages are multiples of 16).
    #[inline]
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable bytes between the guard page and the top.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_and_aligns() {
        let stack = Stack::new(DEFAULT_STACK_SIZE, true).unwrap();
        assert!(stack.size() >= DEFAULT_STACK_SIZE);
        assert_eq!(stack.top() as usize % 16, 0);

        // The whole usable region is writable.
        let bottom = stack.top() as usize - stack.size();
        for offset in (0..stack.size()).step_by(4096) {
            unsafe { ((bottom + offset) as *mut u8).write(0xa5) };
        }
    }

    #[test]
    fn odd_size_rounds_up_to_pages() {
        let stack = Stack::new(MIN_STACK_SIZE + 123, false).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= MIN_STACK_SIZE + 123);
    }

    #[test]
    fn too_small_is_rejected() {
        let err = Stack::new(1024, false).unwrap_err();
        assert_eq!(err.variant_name(), "BadArgument");
    }
}
