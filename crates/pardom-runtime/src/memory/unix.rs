//! Unix memory implementation using mmap

use pardom_core::error::{DomainResult, MemoryError};

/// Reserve `bsz` bytes of address space with no access rights.
///
/// The reservation consumes no physical memory until committed.
pub fn reserve(bsz: usize) -> DomainResult<usize> {
    let base = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            bsz,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MemoryError::ReserveFailed.into());
    }
    Ok(base as usize)
}

/// Make `[addr, addr + bsz)` readable and writable
pub fn commit(addr: usize, bsz: usize) -> DomainResult<()> {
    let ret = unsafe {
        libc::mprotect(addr as *mut libc::c_void, bsz, libc::PROT_READ | libc::PROT_WRITE)
    };
    if ret != 0 {
        return Err(MemoryError::CommitFailed.into());
    }
    Ok(())
}

/// Return `[addr, addr + bsz)` to the reserved-but-inaccessible state,
/// releasing the physical pages.
///
/// Decommitting instead of unmapping keeps the range claimed, so no
/// unrelated mapping can land inside the reservation.
pub fn decommit(addr: usize, bsz: usize) -> DomainResult<()> {
    let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, bsz, libc::PROT_NONE) };
    if ret != 0 {
        return Err(MemoryError::DecommitFailed.into());
    }
    let ret = unsafe { libc::madvise(addr as *mut libc::c_void, bsz, libc::MADV_DONTNEED) };
    if ret != 0 {
        return Err(MemoryError::DecommitFailed.into());
    }
    Ok(())
}

/// Release the reservation entirely
pub fn unmap(addr: usize, bsz: usize) -> DomainResult<()> {
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, bsz) };
    if ret != 0 {
        return Err(MemoryError::UnmapFailed.into());
    }
    Ok(())
}
