//! Block headers: the unit the context and pools move between each other.
//!
//! A block is a contiguous region of memory prefixed by a [`BlockHeader`].
//! Standard blocks are exactly [`crate::config::ContextConfig::stdsize`]
//! bytes; non-standard (oversized) blocks are whatever size a large
//! allocation demanded, rounded up to fit a header and a [`crate::memtree`]
//! node.

use std::mem;
use std::ptr;

use crate::memtree::MemTreeNode;

/// Header placed at the start of every block this crate hands out: total
/// size (header included) plus an intrusive `next` link used while a block
/// sits on a free list or chain.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Total size of the block, header included.
    pub size: usize,
    /// Intrusive singly-linked next pointer. Meaning depends on context:
    /// next free standard block, next block in a pool's chain, etc.
    pub next: *mut BlockHeader,
}

/// `sizeof(block header)`, used in several size comparisons (minimum block
/// size, non-standard block accounting).
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// The smallest block this crate will ever hand out: large enough to hold
/// both a [`BlockHeader`] and a [`MemTreeNode`], since a cleared block's
/// body may need to be tracked as a memtree fragment.
pub(crate) const MEMBLOCK_MINIMUM: usize =
    BLOCK_HEADER_SIZE + mem::size_of::<MemTreeNode>();

impl BlockHeader {
    /// Writes a fresh header at `ptr`, returning it as a typed pointer.
    ///
    /// # Safety
    /// `ptr` must point to at least `size` writable, suitably aligned bytes.
    #[inline]
    pub(crate) unsafe fn init(ptr: *mut u8, size: usize) -> *mut BlockHeader {
        let hdr = ptr as *mut BlockHeader;
        ptr::write(
            hdr,
            BlockHeader {
                size,
                next: ptr::null_mut(),
            },
        );
        hdr
    }

    /// Address just past the header: where the block's usable body starts.
    #[inline]
    pub(crate) unsafe fn body(this: *mut BlockHeader) -> *mut u8 {
        (this as *mut u8).add(BLOCK_HEADER_SIZE)
    }

    /// Address one byte past the end of the block.
    #[inline]
    pub(crate) unsafe fn end(this: *mut BlockHeader) -> *mut u8 {
        (this as *mut u8).add((*this).size)
    }

    /// Usable body size: total size minus the header.
    #[inline]
    pub(crate) unsafe fn body_len(this: *mut BlockHeader) -> usize {
        (*this).size - BLOCK_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_covers_header_and_tree_node() {
        assert!(MEMBLOCK_MINIMUM >= BLOCK_HEADER_SIZE + mem::size_of::<MemTreeNode>());
    }

    #[test]
    fn init_roundtrips_size() {
        let mut buf = vec![0u8; 128];
        unsafe {
            let hdr = BlockHeader::init(buf.as_mut_ptr(), 128);
            assert_eq!((*hdr).size, 128);
            assert!((*hdr).next.is_null());
            assert_eq!(BlockHeader::body(hdr), buf.as_mut_ptr().add(BLOCK_HEADER_SIZE));
            assert_eq!(BlockHeader::body_len(hdr), 128 - BLOCK_HEADER_SIZE);
        }
    }
}
