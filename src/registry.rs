//! Session registry: id allocation and the id→session index.
//!
//! A registry instance is shared by every accepted-connection task of one
//! gateway. Tests construct fresh registries per case; nothing here is
//! process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::Conn;

/// Recycling allocator for session identifiers.
///
/// Ids come from a free-list when one is available, otherwise from a
/// monotonically growing watermark. Once every allocated id has been
/// released, both reset so steady-state ids stay small.
#[derive(Debug)]
pub struct IdAllocator {
    inner: Mutex<AllocatorInner>,
}

#[derive(Debug)]
struct AllocatorInner {
    start: u32,
    next: u32,
    free: Vec<u32>,
}

impl IdAllocator {
    /// Creates an allocator handing out ids from `start` upward.
    pub fn new(start: u32) -> Self {
        Self {
            inner: Mutex::new(AllocatorInner {
                start,
                next: start,
                free: Vec::new(),
            }),
        }
    }

    /// Returns an id not currently in use.
    pub fn acquire(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.free.pop() {
            return id;
        }
        let id = inner.next;
        inner.next += 1;
        id
    }

    /// Returns `id` to the free-list.
    ///
    /// # Panics
    ///
    /// Panics when `id` lies beyond the watermark: releasing an id that was
    /// never acquired means the caller's state is corrupt.
    pub fn release(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        assert!(id <= inner.next, "release of unallocated id {}", id);

        inner.free.push(id);
        if inner.free.len() as u32 == inner.next - inner.start {
            // Everything is free again; pull the watermark back down.
            inner.next = inner.start;
            inner.free.clear();
        }
    }
}

/// The id allocator plus the index of sessions addressable for reuse.
///
/// An id resolves here exactly while its session may still carry traffic;
/// a closed session's entry is removed and the id recycled.
#[derive(Debug)]
pub struct Registry {
    ids: IdAllocator,
    sessions: Mutex<HashMap<u32, Arc<Conn>>>,
}

impl Registry {
    /// A registry allocating ids from 1.
    pub fn new() -> Self {
        Self::with_start_id(1)
    }

    /// A registry allocating ids from `start`.
    pub fn with_start_id(start: u32) -> Self {
        Self {
            ids: IdAllocator::new(start),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh session id.
    pub fn acquire_id(&self) -> u32 {
        self.ids.acquire()
    }

    /// Recycles a session id. See [`IdAllocator::release`] for the panic
    /// contract.
    pub fn release_id(&self, id: u32) {
        self.ids.release(id)
    }

    /// Makes `session` addressable under `id`.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate insert: two live sessions under one id means
    /// the allocator and index disagree.
    pub fn register(&self, id: u32, session: Arc<Conn>) {
        let prev = self.sessions.lock().unwrap().insert(id, session);
        assert!(prev.is_none(), "duplicate session id {}", id);
    }

    /// Removes and returns the session addressed by `id`.
    pub fn deregister(&self, id: u32) -> Option<Arc<Conn>> {
        self.sessions.lock().unwrap().remove(&id)
    }

    /// The session addressed by `id`, if any.
    pub fn lookup(&self, id: u32) -> Option<Arc<Conn>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Points `id` at the successor session that absorbed its predecessor.
    /// Returns `false` when the id is no longer registered.
    pub fn rebind(&self, id: u32, session: Arc<Conn>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(slot) => {
                *slot = session;
                true
            }
            None => false,
        }
    }

    /// The number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
