//! Tracking records and the registry that lets entities *outside* the pool
//! tree (descriptors, handles) participate in cleanup.
//!
//! The idiomatic Rust shape for "a freelist of reusable slots addressed by a
//! stable key" is a generational slot map; that's what [`Registry`] is, and
//! its [`Slot::Free`] variant is a free tracking-record slot.

use std::collections::VecDeque;

/// A stable handle into a [`Registry`], returned by [`Registry::insert`].
///
/// Carries a generation counter so a stale key (one whose slot has since
/// been freed and reused) is rejected rather than silently aliasing a
/// different entity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegKey {
    index: u32,
    generation: u32,
}

enum Slot {
    Allocated(TrackingRecord),
    Free { next: Option<u32>, next_generation: u32 },
}

/// An entity participating in the cleanup graph: its cleanup callback, plus
/// the owner/dependent edges between it and other tracked entities.
struct TrackingRecord {
    generation: u32,
    cleanup: Option<Box<dyn FnMut()>>,
    /// Entities this one depends on (run their cleanups after this one, as
    /// children of whatever pool registered them).
    owners: Vec<RegKey>,
    /// Entities that depend on this one; detached when this record's
    /// cleanup runs so nothing downstream dereferences a dangling owner.
    dependents: Vec<RegKey>,
}

/// Owns every tracking record in a [`crate::context::Context`].
///
/// One registry per context: pools register themselves here via
/// [`crate::pool::Pool::track`] so an owner that lives outside the pool
/// tree can still require this pool's cleanup to run before its own.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            slots: Vec::new(),
            free_head: None,
        }
    }

    pub(crate) fn insert(&mut self, cleanup: Option<Box<dyn FnMut()>>) -> RegKey {
        if let Some(idx) = self.free_head {
            let (next, generation) = match &self.slots[idx as usize] {
                Slot::Free { next, next_generation } => (*next, *next_generation),
                Slot::Allocated(_) => unreachable!("free_head pointed at an allocated slot"),
            };
            self.free_head = next;
            self.slots[idx as usize] = Slot::Allocated(TrackingRecord {
                generation,
                cleanup,
                owners: Vec::new(),
                dependents: Vec::new(),
            });
            RegKey { index: idx, generation }
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Allocated(TrackingRecord {
                generation: 0,
                cleanup,
                owners: Vec::new(),
                dependents: Vec::new(),
            }));
            RegKey { index: idx, generation: 0 }
        }
    }

    fn get(&self, key: RegKey) -> Option<&TrackingRecord> {
        match self.slots.get(key.index as usize) {
            Some(Slot::Allocated(r)) if r.generation == key.generation => Some(r),
            _ => None,
        }
    }

    fn get_mut(&mut self, key: RegKey) -> Option<&mut TrackingRecord> {
        match self.slots.get_mut(key.index as usize) {
            Some(Slot::Allocated(r)) if r.generation == key.generation => Some(r),
            _ => None,
        }
    }

    pub(crate) fn add_dependent(&mut self, owner: RegKey, dependent: RegKey) {
        if let Some(r) = self.get_mut(owner) {
            r.dependents.push(dependent);
        }
        if let Some(r) = self.get_mut(dependent) {
            r.owners.push(owner);
        }
    }

    /// Runs `key`'s cleanup (if any and if the key is still live), detaches
    /// it from every dependent's owner list, and frees the slot.
    pub(crate) fn run_and_free(&mut self, key: RegKey) {
        let (mut cleanup, dependents, generation) = match self.slots.get_mut(key.index as usize) {
            Some(Slot::Allocated(r)) if r.generation == key.generation => {
                (r.cleanup.take(), std::mem::take(&mut r.dependents), r.generation)
            }
            _ => return,
        };
        if let Some(f) = cleanup.as_mut() {
            f();
        }
        for dep in dependents {
            if let Some(r) = self.get_mut(dep) {
                r.owners.retain(|o| *o != key);
            }
        }
        self.slots[key.index as usize] = Slot::Free {
            next: self.free_head,
            next_generation: generation.wrapping_add(1),
        };
        self.free_head = Some(key.index);
    }

    pub(crate) fn is_live(&self, key: RegKey) -> bool {
        self.get(key).is_some()
    }
}

/// A pool's owner list: cleanup registrations made directly on that pool,
/// drained during that pool's clear/destroy protocol.
///
/// Head-insert/head-remove, to make ordering LIFO-ish without promising
/// more than that.
pub(crate) struct OwnerList {
    items: VecDeque<RegKey>,
}

impl OwnerList {
    pub(crate) fn new() -> Self {
        OwnerList {
            items: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, key: RegKey) {
        self.items.push_front(key);
    }

    pub(crate) fn pop(&mut self) -> Option<RegKey> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_runs_once_on_run_and_free() {
        let mut reg = Registry::new();
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log2 = log.clone();
        let key = reg.insert(Some(Box::new(move || log2.borrow_mut().push("ran"))));
        reg.run_and_free(key);
        assert_eq!(*log.borrow(), vec!["ran"]);
        // Idempotent: the slot is free now, so this is a no-op, not a
        // second invocation.
        reg.run_and_free(key);
        assert_eq!(*log.borrow(), vec!["ran"]);
    }

    #[test]
    fn dependent_detaches_from_owner_on_cleanup() {
        let mut reg = Registry::new();
        let owner = reg.insert(None);
        let dependent = reg.insert(None);
        reg.add_dependent(owner, dependent);
        assert!(reg.get(dependent).unwrap().owners.contains(&owner));
        reg.run_and_free(owner);
        assert!(reg.get(dependent).unwrap().owners.is_empty());
    }

    #[test]
    fn owner_list_is_lifo() {
        let mut reg = Registry::new();
        let a = reg.insert(None);
        let b = reg.insert(None);
        let mut owners = OwnerList::new();
        owners.push(a);
        owners.push(b);
        assert_eq!(owners.pop(), Some(b));
        assert_eq!(owners.pop(), Some(a));
        assert!(owners.is_empty());
        let _ = reg.is_live(a);
    }
}
