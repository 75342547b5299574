//! The non-freeing core allocator.
use core::{fmt, mem::MaybeUninit, ptr::NonNull};

use crate::{
    error::{AllocError, BadContextError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    Port,
};

/// A two-ended bump allocator over a fixed region.
///
/// `alloc_from_base` advances the low cursor upward, `alloc_from_top` moves
/// the high cursor downward, and allocation fails once the cursors would
/// cross. Nothing is ever freed: this is the allocator for objects that
/// live until reset, and keeping the two ends separate lets callers segregate
/// e.g. thread working areas from DMA-capable buffers without fragmentation.
///
/// The `offset` parameter asks for a block whose address *plus `offset`* has
/// the requested alignment. [`Heap`](crate::mem::Heap) uses this to place an
/// aligned payload right after its block header.
pub struct Arena<P: Port> {
    base: CpuLockCell<P, usize>,
    top: CpuLockCell<P, usize>,
}

impl<P: Port> fmt::Debug for Arena<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("top", &self.top)
            .finish()
    }
}

impl<P: Port> Arena<P> {
    /// Construct an arena over `region`.
    pub fn new(region: &'static mut [MaybeUninit<u8>]) -> Self {
        let base = region.as_mut_ptr() as usize;
        Self {
            base: CpuLockCell::new(base),
            top: CpuLockCell::new(base + region.len()),
        }
    }

    /// Allocate from the low end. `align` must be a power of two; the
    /// returned address plus `offset` is `align`-aligned.
    pub fn alloc_from_base(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.alloc_from_base_with(lock.borrow_mut(), size, align, offset)
            .ok_or(AllocError::NoMemory)
    }

    /// [`Self::alloc_from_base`] under a held kernel lock.
    pub fn alloc_from_base_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());

        let base = self.base.get(&*lock);
        let top = self.top.get(&*lock);

        // Lowest p >= base with (p + offset) aligned
        let p = align_up(base.checked_add(offset)?, align)?.checked_sub(offset)?;
        let end = p.checked_add(size)?;
        if end > top {
            return None;
        }
        self.base.replace(&mut *lock, end);
        NonNull::new(p as *mut u8)
    }

    /// Allocate from the high end. `align` must be a power of two; the
    /// returned address plus `offset` is `align`-aligned.
    pub fn alloc_from_top(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.alloc_from_top_with(lock.borrow_mut(), size, align, offset)
            .ok_or(AllocError::NoMemory)
    }

    /// [`Self::alloc_from_top`] under a held kernel lock.
    pub fn alloc_from_top_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());

        let base = self.base.get(&*lock);
        let top = self.top.get(&*lock);

        // Highest p with p + size <= top and (p + offset) aligned
        let p = align_down(top.checked_sub(size)?.checked_add(offset)?, align)
            .checked_sub(offset)?;
        if p < base {
            return None;
        }
        self.top.replace(&mut *lock, p);
        NonNull::new(p as *mut u8)
    }

    /// Bytes not yet claimed by either cursor.
    pub fn free_bytes(&self) -> Result<usize, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.top.get(&*lock) - self.base.get(&*lock))
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
