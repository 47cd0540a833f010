//! Address space and object store
//!
//! Buffer objects live in an arena keyed by [`ObjectId`]. Their placement in
//! the GTT is owned by [`AddressSpace`], which holds at most one [`Binding`]
//! per object, the free-list, the active/inactive lists and the fence pool.

mod address_space;
mod allocator;
mod fence;
mod object;

pub use address_space::{AddressSpace, AddressSpaceStats, BindJournal, BindRequest, Binding, Occupancy};
pub use allocator::{align_up, RangeAllocator};
pub use fence::{encode_fence, FenceRegisters, FenceWriter, NullFenceWriter, DEFAULT_FENCE_COUNT};
pub use object::{BufferObject, CacheLevel, Domains, ObjectId, ObjectStore, Tiling, PAGE_SIZE};
