//! The process-wide allocator root.
//!
//! A context owns the standard-block free list, the non-standard-size
//! memtree, the unhandled-error list and the cleanup registry. Pools borrow
//! from it but never own it.

use std::fmt;
use std::ptr;

use log::warn;

use crate::block::{BlockHeader, BLOCK_HEADER_SIZE};
use crate::cleanup::Registry;
use crate::config::{ContextConfig, OomPolicy};
use crate::error::ErrorLink;
use crate::memtree::MemTree;
use crate::raw::{raw_alloc, RawBlock};

/// Snapshot of a context's cache state for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextStats {
    pub standard_blocks_cached: usize,
    pub nonstandard_fragments_cached: usize,
    pub unhandled_errors: usize,
}

/// Process-wide allocator root.
pub struct Context {
    stdsize: usize,
    oom_policy: OomPolicy,
    std_blocks: *mut BlockHeader,
    std_blocks_len: usize,
    /// Backing raw mappings for every standard/non-standard block ever
    /// handed out by this context; kept here (rather than freed block by
    /// block) because `RawBlock` owns the mapping and `BlockHeader`s are
    /// just views into it.
    raw_blocks: Vec<RawBlock>,
    nonstd_blocks: MemTree,
    pub(crate) track_unhandled: bool,
    unhandled: *mut ErrorLink,
    pub(crate) tracing: bool,
    pub(crate) registry: Registry,
    /// Root pools (no parent), owned here so a context can tear down every
    /// descendant pool on drop.
    roots: Vec<Box<crate::pool::Pool>>,
    /// Lazily created internal pool backing every error object and its
    /// duplicated message text.
    error_pool: Option<*mut crate::pool::Pool>,
}

impl Context {
    /// `context_create()`: default configuration.
    pub fn create() -> Box<Context> {
        Context::create_custom(ContextConfig::default())
    }

    /// `context_create_custom(stdsize, oom_handler, track_unhandled)`.
    pub fn create_custom(config: ContextConfig) -> Box<Context> {
        let stdsize = config.normalised_stdsize();
        Box::new(Context {
            stdsize,
            oom_policy: config.oom_policy,
            std_blocks: ptr::null_mut(),
            std_blocks_len: 0,
            raw_blocks: Vec::new(),
            nonstd_blocks: MemTree::new(),
            track_unhandled: config.track_unhandled,
            unhandled: ptr::null_mut(),
            tracing: config.tracing,
            registry: Registry::new(),
            roots: Vec::new(),
            error_pool: None,
        })
    }

    /// Lazily creates (on first use) the internal pool backing error
    /// objects and their duplicated message text.
    pub(crate) fn error_pool(&mut self) -> *mut crate::pool::Pool {
        if let Some(p) = self.error_pool {
            return p;
        }
        let p = crate::pool::Pool::create_root(self);
        self.error_pool = Some(p);
        p
    }

    pub(crate) fn adopt_root(&mut self, root: Box<crate::pool::Pool>) {
        self.roots.push(root);
    }

    /// Removes and returns the root pool matching `pool`, if any.
    pub(crate) fn take_root(&mut self, pool: *mut crate::pool::Pool) -> Option<Box<crate::pool::Pool>> {
        let idx = self
            .roots
            .iter()
            .position(|b| b.as_ref() as *const crate::pool::Pool == pool as *const crate::pool::Pool)?;
        Some(self.roots.remove(idx))
    }

    pub fn stdsize(&self) -> usize {
        self.stdsize
    }

    pub fn set_tracing(&mut self, enabled: bool) {
        self.tracing = enabled;
    }

    /// `context_unhandled(ctx)`: head of the unhandled list, read-only.
    pub fn unhandled(&self) -> Option<*mut ErrorLink> {
        if self.unhandled.is_null() {
            None
        } else {
            Some(self.unhandled)
        }
    }

    pub(crate) fn unhandled_head_ptr(&mut self) -> *mut *mut ErrorLink {
        &mut self.unhandled as *mut _
    }

    /// `acquire_standard_block()`: pop a cached standard block, or mint one.
    pub(crate) fn acquire_standard_block(&mut self) -> *mut BlockHeader {
        if !self.std_blocks.is_null() {
            let hdr = self.std_blocks;
            unsafe {
                self.std_blocks = (*hdr).next;
                (*hdr).next = ptr::null_mut();
            }
            self.std_blocks_len -= 1;
            return hdr;
        }
        self.raw_block(self.stdsize)
    }

    /// `release_standard_block(b)`: push onto `std_blocks`. Never returns
    /// to the OS.
    pub(crate) fn release_standard_block(&mut self, hdr: *mut BlockHeader) {
        unsafe {
            (*hdr).next = self.std_blocks;
        }
        self.std_blocks = hdr;
        self.std_blocks_len += 1;
    }

    /// `release_nonstd(chain)`: inserts every block of an intrusive `next`
    /// chain into `nonstd_blocks`, keyed by size.
    pub(crate) fn release_nonstd(&mut self, mut chain: *mut BlockHeader) {
        while !chain.is_null() {
            let next = unsafe { (*chain).next };
            unsafe {
                self.nonstd_blocks.insert(chain as *mut u8, (*chain).size);
            }
            chain = next;
        }
    }

    /// `fetch_nonstd(size)`: best-fit lookup in the non-standard tree.
    pub(crate) fn fetch_nonstd(&mut self, size: usize) -> Option<*mut BlockHeader> {
        self.nonstd_blocks
            .fetch(size)
            .map(|(p, _)| p as *mut BlockHeader)
    }

    /// Allocates a fresh raw block of at least `size` bytes, applying the
    /// OOM policy on failure.
    pub(crate) fn raw_block(&mut self, size: usize) -> *mut BlockHeader {
        let total = size.max(BLOCK_HEADER_SIZE);
        loop {
            if let Some(mut block) = raw_alloc(total) {
                let hdr = unsafe { BlockHeader::init(block.as_mut_ptr(), block.len()) };
                self.raw_blocks.push(block);
                return hdr;
            }
            match &mut self.oom_policy {
                OomPolicy::Abort => {
                    panic!("pocore-memory: out of memory requesting {} bytes", total);
                }
                OomPolicy::FailNull => {
                    return ptr::null_mut();
                }
                OomPolicy::Retry { attempts, on_attempt } => {
                    if *attempts == 0 {
                        return ptr::null_mut();
                    }
                    *attempts -= 1;
                    on_attempt(total);
                }
                OomPolicy::Custom(f) => {
                    if !f(total) {
                        return ptr::null_mut();
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> ContextStats {
        let mut unhandled_errors = 0usize;
        let mut cur = self.unhandled;
        while !cur.is_null() {
            unhandled_errors += 1;
            cur = unsafe { crate::error::link_next(cur) };
        }
        ContextStats {
            standard_blocks_cached: self.std_blocks_len,
            nonstandard_fragments_cached: self.nonstd_blocks.len(),
            unhandled_errors,
        }
    }
}

impl Drop for Context {
    /// `context_destroy(ctx)`: destroys every remaining root pool (and so,
    /// transitively, every descendant), then drains the standard-block
    /// list and non-standard tree — both already returned to the OS once
    /// `raw_blocks` is dropped — and notes any surviving unhandled errors.
    fn drop(&mut self) {
        while let Some(root) = self
            .roots
            .last()
            .map(|b| b.as_ref() as *const crate::pool::Pool as *mut crate::pool::Pool)
        {
            unsafe { crate::pool::Pool::destroy(root) };
        }
        let stats = self.stats();
        if stats.unhandled_errors > 0 {
            warn!(
                "pocore-memory: context destroyed with {} unhandled error(s)",
                stats.unhandled_errors
            );
        }
        unsafe {
            crate::error::free_unhandled_list(self.unhandled);
        }
        self.unhandled = ptr::null_mut();
    }
}

impl fmt::Debug for Context {
    /// Identity summary only — a context can own an unbounded pool tree, so
    /// this deliberately does not walk it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Context")
            .field("stdsize", &self.stdsize)
            .field("root_pools", &self.roots.len())
            .field("standard_blocks_cached", &stats.standard_blocks_cached)
            .field("unhandled_errors", &stats.unhandled_errors)
            .finish()
    }
}
