//! `memtree`: a red-black tree of free memory fragments keyed by size, with
//! a same-size overflow chain per node.
//!
//! This is the block cache's core data structure. Nodes live *inside* the
//! free fragments they describe — there is no separate allocation for tree
//! bookkeeping, which is why `insert`/`fetch` take raw pointers rather than
//! owned values. Colour is tagged in a dedicated field rather than stealing
//! a bit from `size`, since every fragment is already at least
//! `size_of::<MemTreeNode>()` bytes and a packed bit buys nothing here.

use std::mem;
use std::ptr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// A node of the memtree, written at the start of a free fragment.
///
/// Fragments smaller than `size_of::<MemTreeNode>()` are never tracked; the
/// caller is responsible for that check before calling [`MemTree::insert`].
#[repr(C)]
pub(crate) struct MemTreeNode {
    pub size: usize,
    color: Color,
    left: *mut MemTreeNode,
    right: *mut MemTreeNode,
    parent: *mut MemTreeNode,
    /// Next fragment of the same size, or the tree's `nil` sentinel.
    chain: *mut MemTreeNode,
}

/// A best-fit red-black tree over free fragments.
///
/// Not `Send`/`Sync`: a `MemTree` is always owned by a single
/// [`crate::context::Context`] or [`crate::pool::Pool`], both of which are
/// single-threaded by contract.
pub(crate) struct MemTree {
    root: *mut MemTreeNode,
    /// Shared black sentinel leaf, CLRS-style. Owned by this tree; freed in
    /// `Drop`. Using a sentinel instead of null keeps every rotation/fixup
    /// branch free of null checks.
    nil: *mut MemTreeNode,
    len: usize,
}

impl MemTree {
    pub(crate) fn new() -> Self {
        let nil = Box::into_raw(Box::new(MemTreeNode {
            size: 0,
            color: Color::Black,
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            chain: ptr::null_mut(),
        }));
        unsafe {
            (*nil).left = nil;
            (*nil).right = nil;
            (*nil).parent = nil;
            (*nil).chain = nil;
        }
        MemTree {
            root: nil,
            nil,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.root == self.nil
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Treats `mem` as an untyped fragment of `size` bytes and splices it
    /// into the tree (or chains it onto an existing same-size node).
    ///
    /// # Safety
    /// `mem` must point to at least `size` writable bytes, and `size` must
    /// be `>= size_of::<MemTreeNode>()`.
    pub(crate) unsafe fn insert(&mut self, mem: *mut u8, size: usize) {
        debug_assert!(size >= mem::size_of::<MemTreeNode>());
        let node = mem as *mut MemTreeNode;
        ptr::write(
            node,
            MemTreeNode {
                size,
                color: Color::Red,
                left: self.nil,
                right: self.nil,
                parent: self.nil,
                chain: self.nil,
            },
        );

        let mut parent = self.nil;
        let mut cur = self.root;
        while cur != self.nil {
            parent = cur;
            if (*cur).size == size {
                // Same-size node already present: chain, no tree shape change.
                (*node).chain = (*cur).chain;
                (*cur).chain = node;
                self.len += 1;
                return;
            } else if size < (*cur).size {
                cur = (*cur).left;
            } else {
                cur = (*cur).right;
            }
        }

        (*node).parent = parent;
        if parent == self.nil {
            self.root = node;
        } else if size < (*parent).size {
            (*parent).left = node;
        } else {
            (*parent).right = node;
        }
        self.len += 1;
        self.insert_fixup(node);
    }

    /// Best-fit fetch: the smallest tracked fragment with `size >= min_size`,
    /// removed from the tree. Returns `(ptr, size)`, or `None` if nothing
    /// fits.
    pub(crate) unsafe fn fetch(&mut self, min_size: usize) -> Option<(*mut u8, usize)> {
        let mut cur = self.root;
        let mut best = self.nil;
        while cur != self.nil {
            if (*cur).size >= min_size {
                best = cur;
                cur = (*cur).left;
            } else {
                cur = (*cur).right;
            }
        }
        if best == self.nil {
            return None;
        }

        let size = (*best).size;
        self.len -= 1;

        // Same-size fragments queued behind `best`: pop one without
        // touching the tree shape at all (no rebalancing needed).
        if (*best).chain != self.nil {
            let popped = (*best).chain;
            (*best).chain = (*popped).chain;
            return Some((popped as *mut u8, size));
        }

        self.delete_node(best);
        Some((best as *mut u8, size))
    }

    // --- CLRS red-black tree machinery, operating through the `nil` sentinel ---

    unsafe fn rotate_left(&mut self, x: *mut MemTreeNode) {
        let y = (*x).right;
        (*x).right = (*y).left;
        if (*y).left != self.nil {
            (*(*y).left).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent == self.nil {
            self.root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }
        (*y).left = x;
        (*x).parent = y;
    }

    unsafe fn rotate_right(&mut self, x: *mut MemTreeNode) {
        let y = (*x).left;
        (*x).left = (*y).right;
        if (*y).right != self.nil {
            (*(*y).right).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent == self.nil {
            self.root = y;
        } else if x == (*(*x).parent).right {
            (*(*x).parent).right = y;
        } else {
            (*(*x).parent).left = y;
        }
        (*y).right = x;
        (*x).parent = y;
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut MemTreeNode) {
        while (*(*z).parent).color == Color::Red {
            let zp = (*z).parent;
            let zpp = (*zp).parent;
            if zp == (*zpp).left {
                let y = (*zpp).right;
                if (*y).color == Color::Red {
                    (*zp).color = Color::Black;
                    (*y).color = Color::Black;
                    (*zpp).color = Color::Red;
                    z = zpp;
                } else {
                    if z == (*zp).right {
                        z = zp;
                        self.rotate_left(z);
                    }
                    let zp = (*z).parent;
                    let zpp = (*zp).parent;
                    (*zp).color = Color::Black;
                    (*zpp).color = Color::Red;
                    self.rotate_right(zpp);
                }
            } else {
                let y = (*zpp).left;
                if (*y).color == Color::Red {
                    (*zp).color = Color::Black;
                    (*y).color = Color::Black;
                    (*zpp).color = Color::Red;
                    z = zpp;
                } else {
                    if z == (*zp).left {
                        z = zp;
                        self.rotate_right(z);
                    }
                    let zp = (*z).parent;
                    let zpp = (*zp).parent;
                    (*zp).color = Color::Black;
                    (*zpp).color = Color::Red;
                    self.rotate_left(zpp);
                }
            }
        }
        (*self.root).color = Color::Black;
    }

    unsafe fn transplant(&mut self, u: *mut MemTreeNode, v: *mut MemTreeNode) {
        let up = (*u).parent;
        if up == self.nil {
            self.root = v;
        } else if u == (*up).left {
            (*up).left = v;
        } else {
            (*up).right = v;
        }
        (*v).parent = up;
    }

    unsafe fn minimum(&self, mut x: *mut MemTreeNode) -> *mut MemTreeNode {
        while (*x).left != self.nil {
            x = (*x).left;
        }
        x
    }

    unsafe fn delete_node(&mut self, z: *mut MemTreeNode) {
        let mut y = z;
        let mut y_original_color = (*y).color;
        let x;

        if (*z).left == self.nil {
            x = (*z).right;
            self.transplant(z, (*z).right);
        } else if (*z).right == self.nil {
            x = (*z).left;
            self.transplant(z, (*z).left);
        } else {
            y = self.minimum((*z).right);
            y_original_color = (*y).color;
            x = (*y).right;
            if (*y).parent == z {
                (*x).parent = y;
            } else {
                self.transplant(y, (*y).right);
                (*y).right = (*z).right;
                (*(*y).right).parent = y;
            }
            self.transplant(z, y);
            (*y).left = (*z).left;
            (*(*y).left).parent = y;
            (*y).color = (*z).color;
        }

        if y_original_color == Color::Black {
            self.delete_fixup(x);
        }
    }

    unsafe fn delete_fixup(&mut self, mut x: *mut MemTreeNode) {
        while x != self.root && (*x).color == Color::Black {
            let xp = (*x).parent;
            if x == (*xp).left {
                let mut w = (*xp).right;
                if (*w).color == Color::Red {
                    (*w).color = Color::Black;
                    (*xp).color = Color::Red;
                    self.rotate_left(xp);
                    w = (*xp).right;
                }
                if (*(*w).left).color == Color::Black && (*(*w).right).color == Color::Black {
                    (*w).color = Color::Red;
                    x = xp;
                } else {
                    if (*(*w).right).color == Color::Black {
                        (*(*w).left).color = Color::Black;
                        (*w).color = Color::Red;
                        self.rotate_right(w);
                        w = (*xp).right;
                    }
                    (*w).color = (*xp).color;
                    (*xp).color = Color::Black;
                    (*(*w).right).color = Color::Black;
                    self.rotate_left(xp);
                    x = self.root;
                }
            } else {
                let mut w = (*xp).left;
                if (*w).color == Color::Red {
                    (*w).color = Color::Black;
                    (*xp).color = Color::Red;
                    self.rotate_right(xp);
                    w = (*xp).left;
                }
                if (*(*w).right).color == Color::Black && (*(*w).left).color == Color::Black {
                    (*w).color = Color::Red;
                    x = xp;
                } else {
                    if (*(*w).left).color == Color::Black {
                        (*(*w).right).color = Color::Black;
                        (*w).color = Color::Red;
                        self.rotate_left(w);
                        w = (*xp).left;
                    }
                    (*w).color = (*xp).color;
                    (*xp).color = Color::Black;
                    (*(*w).left).color = Color::Black;
                    self.rotate_right(xp);
                    x = self.root;
                }
            }
        }
        (*x).color = Color::Black;
    }

    /// Walks the whole tree asserting RB invariants. Used by tests and by
    /// `check_invariants`-gated call sites; O(n), never called on a hot path.
    #[cfg(any(test, feature = "check_invariants"))]
    pub(crate) fn assert_invariants(&self) {
        unsafe {
            assert_eq!((*self.nil).color, Color::Black);
            if self.root != self.nil {
                assert_eq!((*self.root).color, Color::Black);
            }
            self.check_node(self.root);
        }
    }

    #[cfg(any(test, feature = "check_invariants"))]
    unsafe fn check_node(&self, node: *mut MemTreeNode) -> usize {
        if node == self.nil {
            return 1;
        }
        if (*node).color == Color::Red {
            assert_eq!((*(*node).left).color, Color::Black, "red-red violation");
            assert_eq!((*(*node).right).color, Color::Black, "red-red violation");
        }
        if (*node).left != self.nil {
            assert!((*(*node).left).size < (*node).size, "BST order violated");
        }
        if (*node).right != self.nil {
            assert!((*(*node).right).size > (*node).size, "BST order violated");
        }
        let bh_left = self.check_node((*node).left);
        let bh_right = self.check_node((*node).right);
        assert_eq!(bh_left, bh_right, "black-height mismatch");
        bh_left + if (*node).color == Color::Black { 1 } else { 0 }
    }
}

impl Drop for MemTree {
    fn drop(&mut self) {
        // The tree does not own the fragments it tracks (they belong to the
        // context/pool's block lists), only the sentinel it allocated itself.
        unsafe {
            drop(Box::from_raw(self.nil));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand::rngs::StdRng;

    unsafe fn fragment(size: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(size, mem::align_of::<MemTreeNode>()).unwrap();
        std::alloc::alloc(layout)
    }

    unsafe fn free_fragment(p: *mut u8, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, mem::align_of::<MemTreeNode>()).unwrap();
        std::alloc::dealloc(p, layout);
    }

    #[test]
    fn fetch_on_empty_is_none() {
        let mut t = MemTree::new();
        unsafe {
            assert!(t.fetch(16).is_none());
        }
    }

    #[test]
    fn best_fit_returns_smallest_adequate() {
        unsafe {
            let mut t = MemTree::new();
            let sizes = [64usize, 256, 128, 512];
            let mut frags = vec![];
            for &s in &sizes {
                let p = fragment(s);
                t.insert(p, s);
                frags.push((p, s));
            }
            t.assert_invariants();

            let (p, s) = t.fetch(100).unwrap();
            assert_eq!(s, 128);
            t.assert_invariants();
            free_fragment(p, s);

            let (p, s) = t.fetch(100).unwrap();
            assert_eq!(s, 256);
            free_fragment(p, s);

            let (p, s) = t.fetch(100).unwrap();
            assert_eq!(s, 512);
            free_fragment(p, s);

            assert!(t.fetch(1).is_none());
        }
    }

    #[test]
    fn equal_size_chains_instead_of_rebalancing() {
        unsafe {
            let mut t = MemTree::new();
            let a = fragment(128);
            let b = fragment(128);
            let c = fragment(128);
            t.insert(a, 128);
            t.insert(b, 128);
            t.insert(c, 128);
            assert_eq!(t.len(), 3);
            t.assert_invariants();

            let (p1, _) = t.fetch(128).unwrap();
            let (p2, _) = t.fetch(128).unwrap();
            let (p3, _) = t.fetch(128).unwrap();
            assert!(t.is_empty());
            let got = [p1, p2, p3];
            assert!(got.contains(&a));
            assert!(got.contains(&b));
            assert!(got.contains(&c));
            for p in got {
                free_fragment(p, 128);
            }
        }
    }

    #[test]
    fn randomised_churn_preserves_invariants() {
        unsafe {
            let mut t = MemTree::new();
            let mut rng = StdRng::seed_from_u64(0xC0FFEE);
            let mut live: Vec<(*mut u8, usize)> = vec![];
            for _ in 0..2000 {
                if live.is_empty() || rng.gen_bool(0.6) {
                    let size = mem::size_of::<MemTreeNode>() + (rng.gen::<usize>() % 512);
                    let p = fragment(size);
                    t.insert(p, size);
                    live.push((p, size));
                } else {
                    let want = mem::size_of::<MemTreeNode>() + (rng.gen::<usize>() % 512);
                    if let Some((p, got)) = t.fetch(want) {
                        assert!(got >= want);
                        live.retain(|&(lp, _)| lp != p);
                        free_fragment(p, got);
                    }
                }
            }
            t.assert_invariants();
            // Drain whatever the tree still holds, then free the rest of the
            // still-live fragments directly; either way nothing should be
            // freed twice because `live` tracked allocations, not tree nodes.
            while let Some((p, s)) = t.fetch(0) {
                live.retain(|&(lp, _)| lp != p);
                free_fragment(p, s);
            }
            for (p, s) in live {
                free_fragment(p, s);
            }
        }
    }
}
