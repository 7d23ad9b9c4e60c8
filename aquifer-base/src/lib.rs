mod index_allocator;
mod resource_id;

pub use index_allocator::{IdError, IndexAllocator, IndexAllocatorState};
pub use resource_id::{
    GroupId, ResourceId, GROUP_BITS, GROUP_MAX_VALUE, INDEX_BITS, INDEX_MAX_VALUE, INDEX_MIN_VALUE,
};
