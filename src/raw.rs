//! The OS page allocator collaborator: `raw_alloc`/`raw_free`.
//!
//! Backed by anonymous memory mappings so every block, standard or
//! oversized, is page-aligned.

use memmap::MmapMut;

/// A raw, page-backed allocation. Dropping it unmaps the memory; `raw_free`
/// is expressed as `drop`.
pub(crate) struct RawBlock {
    map: MmapMut,
}

impl RawBlock {
    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Requests `size` bytes (rounded up to a whole number of pages) from the
/// OS. Returns `None` on failure; the caller (the context's `oom_handler`
/// policy) decides whether that is retried, surfaced as a null result, or
/// fatal.
pub(crate) fn raw_alloc(size: usize) -> Option<RawBlock> {
    let size = round_up_to_page(size);
    MmapMut::map_anon(size).ok().map(|map| RawBlock { map })
}

/// Returns a previously-`raw_alloc`'d region to the OS.
///
/// Implemented as `Drop` on [`RawBlock`]; this function exists so call
/// sites can name the operation explicitly as a `raw_alloc`/`raw_free` pair.
#[inline]
pub(crate) fn raw_free(block: RawBlock) {
    drop(block);
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    let size = size.max(1);
    (size + page - 1) / page * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_page_and_is_writable() {
        let mut block = raw_alloc(1).expect("raw_alloc should succeed");
        assert!(block.len() >= page_size());
        unsafe {
            *block.as_mut_ptr() = 0xAB;
            assert_eq!(*block.as_mut_ptr(), 0xAB);
        }
        raw_free(block);
    }

    #[test]
    fn alloc_large_request_spans_multiple_pages() {
        let want = page_size() * 3 + 17;
        let block = raw_alloc(want).unwrap();
        assert!(block.len() >= want);
        raw_free(block);
    }
}
