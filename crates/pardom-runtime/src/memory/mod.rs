//! Virtual memory primitives for the minor-heap reservation
//!
//! The reservation lifecycle is reserve (no access) → commit slices on
//! demand → decommit on release → unmap. Platform-specific implementations
//! provide the four operations plus the mapping granularity.

use std::sync::OnceLock;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::{commit, decommit, reserve, unmap};
    } else {
        compile_error!("no memory backend for this platform");
    }
}

/// OS page size, queried once
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

/// Round a byte size up to mapping granularity
pub fn round_up_mapping_size(bsz: usize) -> usize {
    let page = page_size();
    bsz.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_round_up() {
        let page = page_size();
        assert_eq!(round_up_mapping_size(0), 0);
        assert_eq!(round_up_mapping_size(1), page);
        assert_eq!(round_up_mapping_size(page), page);
        assert_eq!(round_up_mapping_size(page + 1), 2 * page);
    }

    #[test]
    fn test_reserve_commit_cycle() {
        let size = 16 * page_size();
        let base = reserve(size).unwrap();
        assert_ne!(base, 0);

        // commit a prefix and use it
        let committed = 4 * page_size();
        commit(base, committed).unwrap();
        unsafe {
            let p = base as *mut u8;
            p.write(0xAB);
            p.add(committed - 1).write(0xCD);
            assert_eq!(p.read(), 0xAB);
        }

        // decommit, then commit again: memory must be reusable and zeroed
        decommit(base, committed).unwrap();
        commit(base, committed).unwrap();
        unsafe {
            assert_eq!((base as *const u8).read(), 0);
        }

        unmap(base, size).unwrap();
    }
}
