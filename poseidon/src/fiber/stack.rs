use crate::utils::sys::page_size;
use anyhow::{anyhow, Result};

/// A fiber stack allocated with `mmap`, with an unreadable guard page at
/// each end so overflow and underflow fault instead of corrupting
/// neighbouring allocations.
pub(crate) struct FiberStack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is plain anonymous memory; it may be freed from any thread.
unsafe impl Send for FiberStack {}

impl FiberStack {
    pub(crate) fn alloc(vm_size: usize) -> Result<Self> {
        let page = page_size();
        let usable = vm_size.max(page).div_ceil(page) * page;
        let total = usable + 2 * page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(anyhow!(
                "could not allocate fiber stack of {} bytes: {}",
                total,
                std::io::Error::last_os_error()
            ));
        }
        let base = base as *mut u8;

        unsafe {
            if libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) != 0
                || libc::mprotect(
                    base.add(page + usable) as *mut libc::c_void,
                    page,
                    libc::PROT_NONE,
                ) != 0
            {
                let err = std::io::Error::last_os_error();
                libc::munmap(base as *mut libc::c_void, total);
                return Err(anyhow!("could not protect fiber stack guard pages: {}", err));
            }
        }

        Ok(Self {
            base,
            total,
            usable,
        })
    }

    /// Lowest usable address, just above the bottom guard page.
    pub(crate) fn lo(&self) -> *mut u8 {
        unsafe { self.base.add(page_size()) }
    }

    pub(crate) fn usable(&self) -> usize {
        self.usable
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_pages() -> Result<()> {
        let stack = FiberStack::alloc(100_000)?;
        assert_eq!(stack.usable() % page_size(), 0);
        assert!(stack.usable() >= 100_000);

        // The usable region must be writable end to end.
        unsafe {
            stack.lo().write_volatile(0xA5);
            stack.lo().add(stack.usable() - 1).write_volatile(0x5A);
        }
        Ok(())
    }

    #[test]
    fn test_zero_size_still_gets_one_page() -> Result<()> {
        let stack = FiberStack::alloc(0)?;
        assert_eq!(stack.usable(), page_size());
        Ok(())
    }
}
