use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::resource_id::{GroupId, ResourceId, INDEX_MAX_VALUE, INDEX_MIN_VALUE};

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("the group has no index values left to issue")]
    OutOfIndexes,
    #[error("the id is the invalid sentinel")]
    InvalidId,
    #[error("the id does not belong to this allocator's group")]
    MismatchedGroup,
    #[error("the id's index was never issued by this allocator")]
    IndexNotIssued,
}

/// Snapshot of an allocator's issued/recycled indices, for round-tripping
/// through persistence collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexAllocatorState {
    /// The next index value that has never been issued.
    pub next_fresh: u32,
    /// Freed indices awaiting reissue, in reissue order.
    pub recycled: Vec<u32>,
}

struct AllocatorState {
    next_fresh: u32,
    recycled: VecDeque<u32>,
}

/// Thread-safe generator and recycler of unique [`ResourceId`]s for a single
/// group.
///
/// Freed indices are reissued first-freed-first, so the sequence of ids for a
/// given history of calls is deterministic. All operations share one mutex.
pub struct IndexAllocator {
    group: GroupId,
    state: Mutex<AllocatorState>,
}

impl IndexAllocator {
    pub fn new(group: GroupId) -> Self {
        IndexAllocator {
            group,
            state: Mutex::new(AllocatorState {
                next_fresh: INDEX_MIN_VALUE,
                recycled: VecDeque::new(),
            }),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Issues a unique id, preferring recycled indices over fresh ones.
    pub fn generate(&self) -> Result<ResourceId, IdError> {
        let mut state = self.state.lock().unwrap();

        if let Some(index) = state.recycled.pop_front() {
            return Ok(ResourceId::new(self.group, index));
        }

        if state.next_fresh > INDEX_MAX_VALUE {
            return Err(IdError::OutOfIndexes);
        }

        let index = state.next_fresh;
        state.next_fresh += 1;
        Ok(ResourceId::new(self.group, index))
    }

    /// Returns an id's index for future reissue.
    ///
    /// Freeing an id that was not issued by this allocator is a caller
    /// contract violation and is rejected rather than accepted silently.
    pub fn free(
        &self,
        id: ResourceId,
    ) -> Result<(), IdError> {
        self.free_many(&[id])
    }

    /// Frees a batch of ids. Every id is validated before any is recycled, so
    /// a failure leaves the allocator untouched.
    pub fn free_many(
        &self,
        ids: &[ResourceId],
    ) -> Result<(), IdError> {
        let mut state = self.state.lock().unwrap();

        for id in ids {
            if !id.is_valid() {
                return Err(IdError::InvalidId);
            }
            if id.group() != self.group {
                return Err(IdError::MismatchedGroup);
            }
            if id.index() >= state.next_fresh {
                return Err(IdError::IndexNotIssued);
            }
        }

        for id in ids {
            state.recycled.push_back(id.index());
        }

        Ok(())
    }

    /// The next never-issued index value.
    pub fn peek_next_fresh(&self) -> u32 {
        self.state.lock().unwrap().next_fresh
    }

    /// Number of freed indices awaiting reissue.
    pub fn recyclable(&self) -> usize {
        self.state.lock().unwrap().recycled.len()
    }

    pub fn export_state(&self) -> IndexAllocatorState {
        let state = self.state.lock().unwrap();

        IndexAllocatorState {
            next_fresh: state.next_fresh,
            recycled: state.recycled.iter().copied().collect(),
        }
    }

    /// Replaces the allocator's state wholesale. Any previously issued ids
    /// are forgotten.
    pub fn import_state(
        &self,
        imported: IndexAllocatorState,
    ) {
        let mut state = self.state.lock().unwrap();

        state.next_fresh = imported.next_fresh.max(INDEX_MIN_VALUE);
        state.recycled = imported.recycled.into();
    }

    /// Calls `f` with every currently issued id, in ascending index order.
    ///
    /// Iterates over a snapshot; ids issued or freed concurrently may or may
    /// not be visited.
    pub fn for_each_active(
        &self,
        mut f: impl FnMut(ResourceId),
    ) {
        let snapshot = self.export_state();

        let mut recycled = snapshot.recycled;
        recycled.sort_unstable();

        let mut next_recycled = recycled.iter().peekable();
        for index in INDEX_MIN_VALUE..snapshot.next_fresh {
            if next_recycled.peek() == Some(&&index) {
                next_recycled.next();
                continue;
            }
            f(ResourceId::new(self.group, index));
        }
    }
}
