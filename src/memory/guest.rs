//! Flat guest memory region backed by host memory.

use crate::error::{Error, Result};

/// Guest physical memory region.
///
/// This allocates a contiguous region of host memory that is mapped into the
/// guest's physical address space starting at guest address 0. Offsets into
/// the region are guest physical addresses; the mapping is shared with the
/// hypervisor, so a host write at offset X is guest-visible at physical
/// address X without copying.
pub struct GuestMemory {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Size of the allocation in bytes
    size: usize,
}

// Safety: GuestMemory owns its allocation and can be sent between threads.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocate a new guest memory region.
    ///
    /// The memory is page-aligned, zero-initialized, and shareable so the
    /// in-kernel vCPU emulation sees the same pages as the VMM.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidMemorySize(0));
        }

        // Round up to page size
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    /// Get the host virtual address of the start of the region.
    pub fn host_address(&self) -> u64 {
        self.ptr as u64
    }

    /// Get the size of the memory region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a slice view of the memory region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Get a mutable slice view of the memory region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let span = self.span(addr, buf.len())?;
        buf.copy_from_slice(&self.as_slice()[span.0..span.1]);
        Ok(())
    }

    /// Write bytes to a guest physical address.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let span = self.span(addr, data.len())?;
        self.as_mut_slice()[span.0..span.1].copy_from_slice(data);
        Ok(())
    }

    /// Read a plain value from a guest physical address.
    pub fn read_obj<T: Copy>(&self, addr: u64) -> Result<T> {
        self.span(addr, std::mem::size_of::<T>())?;
        unsafe { Ok(std::ptr::read_unaligned(self.ptr.add(addr as usize) as *const T)) }
    }

    /// Write a plain value to a guest physical address.
    pub fn write_obj<T: Copy>(&mut self, addr: u64, value: T) -> Result<()> {
        self.span(addr, std::mem::size_of::<T>())?;
        unsafe {
            std::ptr::write_unaligned(self.ptr.add(addr as usize) as *mut T, value);
        }
        Ok(())
    }

    /// Bounds-check an access of `len` bytes at `addr`.
    ///
    /// Out-of-range accesses are a VMM configuration bug, not something the
    /// guest can trigger: the guest cannot address memory the VMM did not map.
    fn span(&self, addr: u64, len: usize) -> Result<(usize, usize)> {
        let start = usize::try_from(addr).map_err(|_| Error::InvalidGuestAddress(addr))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(Error::InvalidGuestAddress(addr))?;
        Ok((start, end))
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed() {
        let mem = GuestMemory::new(0x4000).unwrap();
        assert!(mem.size() >= 0x4000);
        assert!(mem.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            GuestMemory::new(0),
            Err(Error::InvalidMemorySize(0))
        ));
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut mem = GuestMemory::new(0x4000).unwrap();
        mem.write(0x1000, b"hello").unwrap();

        let mut buf = [0u8; 5];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_write_visible_through_slice_view() {
        let mut mem = GuestMemory::new(0x2000).unwrap();
        mem.write_obj::<u32>(0x10, 0xdead_beef).unwrap();
        assert_eq!(&mem.as_slice()[0x10..0x14], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(mem.read_obj::<u32>(0x10).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut mem = GuestMemory::new(0x1000).unwrap();
        let size = mem.size() as u64;

        assert!(matches!(
            mem.write(size, &[0u8]),
            Err(Error::InvalidGuestAddress(_))
        ));
        assert!(matches!(
            mem.write(size - 2, &[0u8; 4]),
            Err(Error::InvalidGuestAddress(_))
        ));

        // Address + length overflow must not wrap around.
        assert!(matches!(
            mem.write(u64::MAX, &[0u8; 4]),
            Err(Error::InvalidGuestAddress(_))
        ));

        let mut buf = [0u8; 4];
        assert!(matches!(
            mem.read(size - 1, &mut buf),
            Err(Error::InvalidGuestAddress(_))
        ));
    }
}
