use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::unistd::Pid;

use crate::config::WATCH_MAX;

/// Slot 0 mirrors the inotify descriptor's position in the poll set, so it is
/// never handed out to a child.
pub const RESERVED_SLOT: usize = 0;

/// A spawned child we still have to reap.
#[derive(Debug)]
pub struct Child {
    pub pid: Pid,
    /// Read end of a pipe whose only write end belongs to the child. It
    /// polls readable/hung-up once the child is gone.
    pub pipe: OwnedFd,
    /// Index of the watch that spawned it.
    pub watch: usize,
}

/// Fixed-capacity registry of running spawns, addressed by slot index.
///
/// Holds at most `capacity - 1` children (slot 0 is reserved). A watch never
/// has more than one child registered at a time, so the default capacity
/// leaves room for every watch to have one running.
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<Option<Child>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::with_capacity(WATCH_MAX + RESERVED_SLOT + 1)
    }
}

impl ProcessTable {
    /// Creates an empty table with `capacity` slots, including the reserved one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(RESERVED_SLOT + 1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the first free slot, if any.
    pub fn allocate(&self) -> Option<usize> {
        (RESERVED_SLOT + 1..self.slots.len()).find(|&i| self.slots[i].is_none())
    }

    /// Records a freshly spawned child in `slot`.
    pub fn register(&mut self, slot: usize, pid: Pid, pipe: OwnedFd, watch: usize) {
        debug_assert_ne!(slot, RESERVED_SLOT, "slot 0 is reserved for inotify");
        debug_assert!(self.slots[slot].is_none(), "slot {slot} is already taken");
        debug_assert!(!self.is_spawned(watch), "watch {watch} already has a spawn");
        self.slots[slot] = Some(Child { pid, pipe, watch });
    }

    /// Frees `slot`, closing the child's pipe. Returns the pid it held.
    pub fn release(&mut self, slot: usize) -> Option<Pid> {
        self.slots.get_mut(slot)?.take().map(|child| child.pid)
    }

    pub fn get(&self, slot: usize) -> Option<&Child> {
        self.slots.get(slot)?.as_ref()
    }

    /// Pid of the child spawned by `watch`, if it is still running.
    pub fn find_by_watch(&self, watch: usize) -> Option<Pid> {
        self.occupied()
            .find(|(_, child)| child.watch == watch)
            .map(|(_, child)| child.pid)
    }

    pub fn is_spawned(&self, watch: usize) -> bool {
        self.find_by_watch(watch).is_some()
    }

    /// Occupied slots, in slot order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Child)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|child| (i, child)))
    }

    /// `(slot, pipe)` pairs to hand to `poll`.
    pub fn pipes(&self) -> impl Iterator<Item = (usize, BorrowedFd<'_>)> + '_ {
        self.occupied().map(|(i, child)| (i, child.pipe.as_fd()))
    }

    pub fn len(&self) -> usize {
        self.occupied().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
