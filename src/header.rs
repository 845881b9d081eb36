//! Per-cell bookkeeping.
//!
//! Each object header carries exactly one of two mutually exclusive
//! linkages: free list or in-use hash, never both. We express that as a
//! tagged `CellState` rather than two raw intrusive-list nodes: the free
//! list and in-use hash are owned, indexed collections (`Slab::free_list`,
//! `ObjectHash`) keyed by `(SlabId, cell index)`, and `CellState` is the
//! single source of truth for which collection a given cell currently
//! belongs to.

use std::ptr::NonNull;

pub(crate) const SKO_MAGIC: u32 = 0x2BEE_2BEE;

pub(crate) type SlabId = u64;

/// Identifies one cell: which slab it belongs to and its index within
/// that slab's header array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectRef {
    pub slab_id: SlabId,
    pub cell: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellState {
    Free,
    InUse,
}

/// Per-cell header: backpointer to slab (implicit via its position in
/// `Slab::headers`), address of the object body, and current linkage state.
pub(crate) struct ObjectHeader {
    pub magic: u32,
    pub body: NonNull<u8>,
    pub state: CellState,
}

impl ObjectHeader {
    pub fn new(body: NonNull<u8>) -> Self {
        ObjectHeader {
            magic: SKO_MAGIC,
            body,
            state: CellState::Free,
        }
    }
}

// SAFETY: the body pointer is only ever dereferenced by the cache that
// owns the slab, under that cache's lock or a no-preempt magazine scope.
unsafe impl Send for ObjectHeader {}
