//! Memory allocators.
//!
//! Two layers, matching the two lifetimes firmware memory tends to have:
//!
//!  - [`Arena`] hands out boot-time allocations (thread working areas, long
//!    lived buffers) from the two ends of a fixed region and never takes
//!    them back.
//!  - [`Heap`] is a first-fit free-list allocator for memory that is
//!    actually recycled, typically backed by one large [`Arena`] block.
//!
//! Both are protected by the kernel lock like every other piece of shared
//! kernel state, so they are usable from interrupt handlers through their
//! `*_with` methods.
mod arena;
mod heap;

pub use self::{
    arena::Arena,
    heap::{Heap, HeapStatus},
};
