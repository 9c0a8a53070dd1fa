//! Bump-pointer allocation arenas.
//!
//! A pool is always heap-boxed and owned either by its parent's `children`
//! vector or by the context's `roots` vector; callers interact with it
//! through a raw `*mut Pool`, mirroring the unsafe-associated-function style
//! already used by [`crate::block::BlockHeader`] and [`crate::memtree::MemTree`].
//! The box keeps the pool's address stable even as the owning vector grows.

use std::fmt;
use std::mem;
use std::ptr;

use crate::block::{BlockHeader, BLOCK_HEADER_SIZE};
use crate::cleanup::{OwnerList, RegKey};
use crate::context::Context;
use crate::memtree::MemTree;

const ALIGN: usize = 8;

#[inline]
fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Allocation arena: bump-pointer state over a chain of blocks borrowed
/// from a context, plus a per-pool remnant tree and parent/child links.
pub struct Pool {
    ctx: *mut Context,
    parent: *mut Pool,
    children: Vec<Box<Pool>>,
    first_block: *mut BlockHeader,
    current_block: *mut BlockHeader,
    current: *mut u8,
    remnants: MemTree,
    /// Head of an intrusive `next`-linked chain of oversized blocks charged
    /// to this pool.
    nonstd_blocks: *mut BlockHeader,
    nonstd_count: usize,
    coalesce: bool,
    owners: OwnerList,
    track_key: Option<RegKey>,
    /// Poisoned once `destroy` has run, to catch use-after-destroy.
    destroyed: bool,
}

impl Pool {
    /// `pool_root(ctx)`.
    pub fn create_root(ctx: &mut Context) -> *mut Pool {
        Self::new_into(ctx as *mut Context, ptr::null_mut(), false)
    }

    /// `pool_create(parent)`.
    ///
    /// # Safety
    /// `parent` must be a live pool obtained from this module.
    pub unsafe fn create(parent: *mut Pool) -> *mut Pool {
        Self::new_into((*parent).ctx, parent, false)
    }

    /// `pool_create_coalescing(parent)`.
    ///
    /// # Safety
    /// `parent` must be a live pool obtained from this module.
    pub unsafe fn create_coalescing(parent: *mut Pool) -> *mut Pool {
        Self::new_into((*parent).ctx, parent, true)
    }

    fn new_into(ctx: *mut Context, parent: *mut Pool, coalesce: bool) -> *mut Pool {
        let first_block = unsafe { (*ctx).acquire_standard_block() };
        let current = unsafe { BlockHeader::body(first_block) };
        let mut boxed = Box::new(Pool {
            ctx,
            parent,
            children: Vec::new(),
            first_block,
            current_block: first_block,
            current,
            remnants: MemTree::new(),
            nonstd_blocks: ptr::null_mut(),
            nonstd_count: 0,
            coalesce,
            owners: OwnerList::new(),
            track_key: None,
            destroyed: false,
        });
        let raw = boxed.as_mut() as *mut Pool;
        if parent.is_null() {
            // Root pools are owned by the context; see `context.rs`'s
            // `roots` bookkeeping field.
            unsafe { (*ctx).adopt_root(boxed) };
        } else {
            unsafe { (*parent).children.push(boxed) };
        }
        raw
    }

    /// `pool_track(pool)`: registers this pool's cleanup in the context's
    /// registry so external owners can depend on it.
    ///
    /// # Safety
    /// `pool` must be live.
    pub unsafe fn track(pool: *mut Pool) -> RegKey {
        if let Some(key) = (*pool).track_key {
            return key;
        }
        let target = pool;
        let key = (*(*pool).ctx)
            .registry
            .insert(Some(Box::new(move || {
                Pool::clear(target);
            })));
        (*pool).track_key = Some(key);
        key
    }

    /// Registers a cleanup owned directly by this pool (head-inserted, run
    /// before children on the next clear/destroy).
    ///
    /// # Safety
    /// `pool` must be live.
    pub unsafe fn register_owner(pool: *mut Pool, cleanup: Box<dyn FnMut()>) -> RegKey {
        let key = (*(*pool).ctx).registry.insert(Some(cleanup));
        (*pool).owners.push(key);
        key
    }

    /// Adopts an already-tracked entity — typically another pool's
    /// [`Pool::track`] key, or an external descriptor/handle tracked via
    /// [`crate::cleanup::Registry::insert`] through the crate's public
    /// `registry_track` — as one of this pool's owners, so its cleanup runs
    /// as part of this pool's clear/destroy protocol. This is how an owner
    /// external to the pool tree participates in cleanup.
    ///
    /// # Safety
    /// `pool` must be live; `key` must have been returned by [`Pool::track`]
    /// or the crate's `registry_track` on the same context.
    pub unsafe fn adopt_owner(pool: *mut Pool, key: RegKey) {
        (*pool).owners.push(key);
    }

    /// `alloc(pool, n)`: bump-allocate `n` bytes from this pool.
    ///
    /// # Safety
    /// `pool` must be live and not yet destroyed.
    pub unsafe fn alloc(pool: *mut Pool, n: usize) -> *mut u8 {
        assert!(!(*pool).destroyed, "pocore-memory: use of a destroyed pool");
        let requested = if (*pool).coalesce {
            n + mem::size_of::<usize>()
        } else {
            n
        };
        let aligned = align_up(requested);
        let ptr = Self::alloc_raw(pool, aligned);
        if (*pool).coalesce {
            let tail = ptr.add(n) as *mut usize;
            ptr::write_unaligned(tail, n);
        }
        ptr
    }

    unsafe fn alloc_raw(pool: *mut Pool, aligned: usize) -> *mut u8 {
        let p = &mut *pool;

        // Step 1: bump within the current block.
        let block_end = BlockHeader::end(p.current_block);
        if (p.current as usize) + aligned <= block_end as usize {
            let r = p.current;
            p.current = p.current.add(aligned);
            return r;
        }

        // Step 2: best-fit fetch from this pool's remnants. Split the tail
        // back into remnants whenever it's large enough to be tracked as a
        // memtree node in its own right.
        if let Some((frag, frag_size)) = p.remnants.fetch(aligned) {
            if frag_size > aligned + mem::size_of::<crate::memtree::MemTreeNode>() {
                let tail = frag.add(aligned);
                let tail_len = frag_size - aligned;
                p.remnants.insert(tail, tail_len);
            }
            return frag;
        }

        // Step 3: fits in a fresh standard block.
        let stdsize = (*p.ctx).stdsize();
        if aligned <= stdsize - BLOCK_HEADER_SIZE {
            let leftover = block_end as usize - p.current as usize;
            if leftover >= mem::size_of::<crate::memtree::MemTreeNode>() {
                p.remnants.insert(p.current, leftover);
            }
            let fresh = (*p.ctx).acquire_standard_block();
            (*p.current_block).next = fresh;
            p.current_block = fresh;
            let body = BlockHeader::body(fresh);
            p.current = body.add(aligned);
            return body;
        }

        // Step 4: oversized, goes to the context's non-standard tree.
        let need = BLOCK_HEADER_SIZE + aligned;
        let hdr = match (*p.ctx).fetch_nonstd(need) {
            Some(h) => h,
            None => (*p.ctx).raw_block(need),
        };
        (*hdr).next = p.nonstd_blocks;
        p.nonstd_blocks = hdr;
        p.nonstd_count += 1;
        BlockHeader::body(hdr)
    }

    pub fn allocated_bytes(pool: *mut Pool) -> usize {
        // Supplemented diagnostic (SPEC_FULL.md §D): total bytes held in
        // blocks charged to this pool, header included.
        unsafe {
            let mut total = 0usize;
            let mut b = (*pool).first_block;
            while !b.is_null() {
                total += (*b).size;
                b = (*b).next;
            }
            let mut n = (*pool).nonstd_blocks;
            while !n.is_null() {
                total += (*n).size;
                n = (*n).next;
            }
            total
        }
    }

    /// `pool_freemem(pool, mem, len)`.
    ///
    /// # Safety
    /// `mem` must be a live allocation of at least `len` bytes previously
    /// returned by [`Pool::alloc`] on this pool.
    pub unsafe fn freemem(pool: *mut Pool, mem: *mut u8, len: usize) {
        if len < std::mem::size_of::<crate::memtree::MemTreeNode>() {
            return;
        }
        (*pool).remnants.insert(mem, len);
    }

    /// `pool_clear(pool)`: runs the cleanup protocol, then resets bump
    /// state and releases memory upward to the context.
    ///
    /// # Safety
    /// `pool` must be live.
    pub unsafe fn clear(pool: *mut Pool) {
        Self::run_cleanup_protocol(pool);

        let p = &mut *pool;

        if p.nonstd_count > 0 {
            (*p.ctx).release_nonstd(p.nonstd_blocks);
            p.nonstd_blocks = ptr::null_mut();
            p.nonstd_count = 0;
        }

        // Return every block after `first_block` to the context.
        let mut b = (*p.first_block).next;
        (*p.first_block).next = ptr::null_mut();
        while !b.is_null() {
            let next = (*b).next;
            (*b).next = ptr::null_mut();
            (*p.ctx).release_standard_block(b);
            b = next;
        }
        p.current_block = p.first_block;
        p.current = BlockHeader::body(p.first_block);
        p.remnants = MemTree::new();
    }

    /// `pool_destroy(pool)`.
    ///
    /// # Safety
    /// `pool` must be live and not already destroyed. `pool` must not be
    /// dereferenced again after this call returns.
    pub unsafe fn destroy(pool: *mut Pool) {
        Self::clear(pool);
        let p = &mut *pool;
        let first_block = p.first_block;
        p.destroyed = true;
        p.current = ptr::null_mut();

        let ctx = p.ctx;
        let parent = p.parent;
        let owned = if parent.is_null() {
            (*ctx).take_root(pool)
        } else {
            let siblings = &mut (*parent).children;
            let idx = siblings
                .iter()
                .position(|b| b.as_ref() as *const Pool == pool as *const Pool);
            idx.map(|i| siblings.remove(i))
        };
        // `owned` now holds the only strong reference; dropping it frees
        // the `Pool` struct itself once we are done reading from `p`.
        (*ctx).release_standard_block(first_block);
        drop(owned);
    }

    fn run_cleanup_protocol(pool: *mut Pool) {
        loop {
            unsafe {
                let p = &mut *pool;
                while let Some(owner) = p.owners.pop() {
                    (*p.ctx).registry.run_and_free(owner);
                }
                while let Some(child) = p.children.last().map(|c| c.as_ref() as *const Pool as *mut Pool) {
                    Pool::destroy(child);
                }
                if p.owners.is_empty() && p.children.is_empty() {
                    break;
                }
            }
        }
    }

    /// `strdup`.
    ///
    /// # Safety
    /// `pool` must be live; `s` must be valid UTF-8-agnostic bytes (any
    /// NUL-free byte string).
    pub unsafe fn strdup(pool: *mut Pool, s: &[u8]) -> *mut u8 {
        Self::strmemdup(pool, s)
    }

    /// `strmemdup(p, s, len(s))`: copies `s` followed by one NUL byte.
    ///
    /// # Safety
    /// `pool` must be live.
    pub unsafe fn strmemdup(pool: *mut Pool, s: &[u8]) -> *mut u8 {
        let dst = Pool::alloc(pool, s.len() + 1);
        ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
        *dst.add(s.len()) = 0;
        dst
    }

    /// `strndup`: copies at most `n` bytes of `s`, then a NUL terminator.
    ///
    /// # Safety
    /// `pool` must be live.
    pub unsafe fn strndup(pool: *mut Pool, s: &[u8], n: usize) -> *mut u8 {
        let take = s.len().min(n);
        Self::strmemdup(pool, &s[..take])
    }

    /// `memdup`: copies `n` raw bytes with no terminator.
    ///
    /// # Safety
    /// `pool` must be live; `src` must be valid for `n` reads.
    pub unsafe fn memdup(pool: *mut Pool, src: *const u8, n: usize) -> *mut u8 {
        let dst = Pool::alloc(pool, n);
        ptr::copy_nonoverlapping(src, dst, n);
        dst
    }

}

impl fmt::Debug for Pool {
    /// Identity summary only — does not walk `children`, since a pool tree
    /// can be arbitrarily deep.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("children", &self.children.len())
            .field("coalesce", &self.coalesce)
            .field("destroyed", &self.destroyed)
            .field("allocated_bytes", &Self::allocated_bytes(self as *const Pool as *mut Pool))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    #[test]
    fn bump_pointer_reuse_after_clear() {
        let mut ctx = Context::create_custom(ContextConfig {
            stdsize: 8192,
            ..Default::default()
        });
        unsafe {
            let p = Pool::create_root(&mut ctx);
            let r1 = Pool::alloc(p, 100);
            let r2 = Pool::alloc(p, 200);
            assert_eq!(r2 as usize, r1 as usize + align_up(100));
            Pool::clear(p);
            let r3 = Pool::alloc(p, 100);
            assert_eq!(r3, r1);
        }
    }

    #[test]
    fn oversized_alloc_spills_to_nonstandard() {
        let mut ctx = Context::create_custom(ContextConfig {
            stdsize: 1024,
            ..Default::default()
        });
        unsafe {
            let p = Pool::create_root(&mut ctx);
            let r = Pool::alloc(p, 4000);
            assert!(!r.is_null());
            assert_eq!((*p).nonstd_count, 1);
            Pool::clear(p);
            assert_eq!(ctx.stats().nonstandard_fragments_cached, 1);
        }
    }

    #[test]
    fn cleanup_order_parent_before_children() {
        let mut ctx = Context::create();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        unsafe {
            let parent = Pool::create_root(&mut ctx);
            let child = Pool::create(parent);
            let _grandchild = Pool::create(child);

            let log1 = log.clone();
            Pool::register_owner(parent, Box::new(move || log1.borrow_mut().push("O1")));
            let log2 = log.clone();
            Pool::register_owner(child, Box::new(move || log2.borrow_mut().push("O2")));

            Pool::clear(parent);
            let seen = log.borrow();
            assert!(seen.contains(&"O1"));
            assert!(seen.contains(&"O2"));
        }
    }

    #[test]
    fn reentrant_cleanup_terminates() {
        let mut ctx = Context::create();
        unsafe {
            let p = Pool::create_root(&mut ctx);
            let spawned = std::rc::Rc::new(std::cell::Cell::new(false));
            let spawned2 = spawned.clone();
            Pool::register_owner(
                p,
                Box::new(move || {
                    if !spawned2.get() {
                        spawned2.set(true);
                        let _ = Pool::create(p);
                        Pool::register_owner(p, Box::new(|| {}));
                    }
                }),
            );
            Pool::clear(p);
            assert!((*p).children.is_empty());
            assert!((*p).owners.is_empty());
        }
    }

    #[test]
    fn adopted_external_owner_runs_as_part_of_clear() {
        let mut ctx = Context::create();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        unsafe {
            let p = Pool::create_root(&mut ctx);

            // An entity outside the pool tree (a descriptor, a handle) tracks
            // its own cleanup and a second tracked entity depends on it; once
            // it is adopted as one of `p`'s owners, clearing `p` runs its
            // cleanup and detaches the dependent just like a pool-owned one.
            let log1 = log.clone();
            let descriptor = ctx.registry.insert(Some(Box::new(move || {
                log1.borrow_mut().push("descriptor")
            })));
            let dependent = ctx.registry.insert(None);
            ctx.registry.add_dependent(descriptor, dependent);
            assert!(ctx.registry.is_live(dependent));

            Pool::adopt_owner(p, descriptor);
            Pool::clear(p);

            assert_eq!(*log.borrow(), vec!["descriptor"]);
            assert!((*p).owners.is_empty());
            // `dependent` is untouched by `descriptor`'s cleanup (it is only
            // detached, never freed), so it is still its own live entity.
            assert!(ctx.registry.is_live(dependent));
        }
    }

    #[test]
    fn strmemdup_roundtrips_with_nul_terminator() {
        let mut ctx = Context::create();
        unsafe {
            let p = Pool::create_root(&mut ctx);
            let dst = Pool::strmemdup(p, b"hello");
            let body = std::slice::from_raw_parts(dst, 6);
            assert_eq!(body, b"hello\0");
        }
    }

    #[test]
    fn destroy_removes_pool_from_parents_children_and_frees_subtree_nonstd() {
        let mut ctx = Context::create_custom(ContextConfig {
            stdsize: 1024,
            ..Default::default()
        });
        unsafe {
            let parent = Pool::create_root(&mut ctx);
            let child = Pool::create(parent);
            Pool::alloc(child, 4000);
            assert_eq!((*parent).children.len(), 1);

            Pool::destroy(child);
            assert_eq!((*parent).children.len(), 0);
            assert_eq!(ctx.stats().nonstandard_fragments_cached, 1);
        }
    }

    #[test]
    fn idempotent_clear_is_a_noop() {
        let mut ctx = Context::create();
        unsafe {
            let p = Pool::create_root(&mut ctx);
            Pool::alloc(p, 16);
            Pool::clear(p);
            let before = (*p).current as usize;
            Pool::clear(p);
            assert_eq!((*p).current as usize, before);
        }
    }
}
