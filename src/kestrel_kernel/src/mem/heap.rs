//! The page-granular first-fit heap.
use core::{fmt, mem, mem::MaybeUninit, ptr::NonNull};

use crate::{
    error::{AllocError, BadContextError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    Port,
};

/// A free or used block header. Every heap block, free or used, starts with
/// one of these, and all sizes are expressed in pages of `size_of::<Self>()`
/// bytes.
///
/// For a free block, `word0` is the address of the next free block (zero at
/// the end of the list). For a used block, `word0` is `MAGIC ^ pages`, which
/// lets [`Heap::free`] recover the size while catching most stray pointers
/// and double frees.
#[repr(C)]
struct BlockHeader {
    word0: usize,
    /// Number of payload pages following the header.
    pages: usize,
}

const PAGE: usize = mem::size_of::<BlockHeader>();
const MAGIC: usize = 0x6865_6170;

/// The free list, stored as plain addresses so the state is `Send`.
struct HeapState {
    /// Address of the first free block, or zero.
    free_head: usize,
    /// Total pages managed, headers included.
    total_pages: usize,
}

/// A first-fit allocator with page granularity.
///
/// Memory is carved into pages the size of a [`BlockHeader`]; every
/// allocation is rounded up to whole pages and prefixed by a header page.
/// The free list is kept sorted by address so that [`Self::free`] can merge
/// a released block with both neighbors, which keeps fragmentation bounded
/// under alloc/free churn.
///
/// Alignment is fixed at `align_of::<BlockHeader>()` (two words). Callers
/// needing more should over-allocate and align within the block.
pub struct Heap<P: Port> {
    state: CpuLockCell<P, HeapState>,
}

/// A point-in-time summary of a heap's free space, from [`Heap::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatus {
    /// Number of fragments in the free list.
    pub fragments: usize,
    /// Total free bytes, headers of free blocks excluded.
    pub free_bytes: usize,
    /// Largest allocation that would currently succeed, in bytes.
    pub largest_free: usize,
}

impl<P: Port> fmt::Debug for Heap<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Heap")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<P: Port> Heap<P> {
    /// Construct a heap managing no memory. Give it some with [`Self::init`].
    pub const fn new() -> Self {
        Self {
            state: CpuLockCell::new(HeapState {
                free_head: 0,
                total_pages: 0,
            }),
        }
    }

    /// Hand `region` to the heap. May be called once.
    pub fn init(&self, region: &'static mut [MaybeUninit<u8>]) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.init_with(lock.borrow_mut(), region);
        Ok(())
    }

    /// [`Self::init`] under a held kernel lock.
    pub fn init_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        region: &'static mut [MaybeUninit<u8>],
    ) {
        let start = region.as_mut_ptr() as usize;
        let aligned = (start + PAGE - 1) & !(PAGE - 1);
        let len = region.len().saturating_sub(aligned - start) & !(PAGE - 1);
        let total_pages = len / PAGE;

        let state = self.state.write(&mut *lock);
        debug_assert_eq!(state.total_pages, 0, "heap is already initialized");
        assert!(total_pages >= 2, "heap region is too small");

        // One free block spanning the whole region
        // Safety: the region is exclusively ours, page-aligned, and large
        // enough for a header
        unsafe {
            write_header(
                aligned,
                BlockHeader {
                    word0: 0,
                    pages: total_pages - 1,
                },
            );
        }
        state.free_head = aligned;
        state.total_pages = total_pages;
    }

    /// Allocate at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.alloc_with(lock.borrow_mut(), size)
            .ok_or(AllocError::NoMemory)
    }

    /// [`Self::alloc`] under a held kernel lock.
    pub fn alloc_with(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let pages = size.div_ceil(PAGE).max(1);
        let state = self.state.write(&mut *lock);

        // First fit. `link` is where the predecessor's next pointer lives;
        // for the head block that is `state.free_head` itself.
        let mut link = &mut state.free_head;
        let mut cur = *link;
        while cur != 0 {
            // Safety: addresses on the free list refer to live free blocks
            // within the region given to `init`
            let header = unsafe { read_header(cur) };
            if header.pages >= pages {
                if header.pages - pages >= 2 {
                    // Split: the tail becomes a new free block replacing
                    // `cur` in the list
                    let rest = cur + (1 + pages) * PAGE;
                    unsafe {
                        write_header(
                            rest,
                            BlockHeader {
                                word0: header.word0,
                                pages: header.pages - pages - 1,
                            },
                        );
                    }
                    *link = rest;
                    unsafe {
                        write_header(
                            cur,
                            BlockHeader {
                                word0: MAGIC ^ pages,
                                pages,
                            },
                        );
                    }
                } else {
                    // Grant the whole block; the slack is at most one page
                    *link = header.word0;
                    unsafe {
                        write_header(
                            cur,
                            BlockHeader {
                                word0: MAGIC ^ header.pages,
                                pages: header.pages,
                            },
                        );
                    }
                }
                return NonNull::new((cur + PAGE) as *mut u8);
            }
            // Safety: `cur` stays a live free block for the rest of the walk
            link = unsafe { &mut (*(cur as *mut BlockHeader)).word0 };
            cur = *link;
        }
        None
    }

    /// Release a block obtained from [`Self::alloc`].
    ///
    /// Panics if `ptr` does not carry a valid used-block tag; that means
    /// heap corruption or a double free, which there is no way to recover
    /// from.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.free_with(lock.borrow_mut(), ptr);
        Ok(())
    }

    /// [`Self::free`] under a held kernel lock.
    pub fn free_with(&self, mut lock: CpuLockTokenRefMut<'_, P>, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize - PAGE;
        // Safety: `addr` is validated by the tag check below before any
        // free-list surgery happens
        let header = unsafe { read_header(addr) };
        if header.word0 != MAGIC ^ header.pages {
            panic!("heap corruption or double free at {addr:#x}");
        }
        let mut pages = header.pages;

        let state = self.state.write(&mut *lock);

        // Find the free blocks surrounding `addr`. The list is kept sorted
        // by address; zero means none.
        let mut prev = 0;
        let mut next = state.free_head;
        while next != 0 && next < addr {
            prev = next;
            // Safety: addresses on the free list refer to live free blocks
            next = unsafe { read_header(next) }.word0;
        }

        // Absorb the following block when contiguous
        if next != 0 && addr + (1 + pages) * PAGE == next {
            // Safety: `next` is a live free block
            let next_header = unsafe { read_header(next) };
            pages += 1 + next_header.pages;
            next = next_header.word0;
        }

        if prev != 0 {
            // Safety: `prev` is a live free block
            let prev_header = unsafe { read_header(prev) };
            if prev + (1 + prev_header.pages) * PAGE == addr {
                // Contiguous with the preceding block; grow it in place
                unsafe {
                    write_header(
                        prev,
                        BlockHeader {
                            word0: next,
                            pages: prev_header.pages + 1 + pages,
                        },
                    );
                }
                return;
            }
            unsafe {
                write_header(addr, BlockHeader { word0: next, pages });
                (*(prev as *mut BlockHeader)).word0 = addr;
            }
        } else {
            unsafe {
                write_header(addr, BlockHeader { word0: next, pages });
            }
            state.free_head = addr;
        }
    }

    /// Summarize the free list.
    pub fn status(&self) -> Result<HeapStatus, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        Ok(self.status_with(lock.borrow_mut()))
    }

    /// [`Self::status`] under a held kernel lock.
    pub fn status_with(&self, lock: CpuLockTokenRefMut<'_, P>) -> HeapStatus {
        let state = self.state.read(&*lock);
        let mut fragments = 0;
        let mut free_pages = 0;
        let mut largest = 0;
        let mut cur = state.free_head;
        while cur != 0 {
            // Safety: free-list blocks are live
            let header = unsafe { read_header(cur) };
            fragments += 1;
            free_pages += header.pages;
            largest = largest.max(header.pages);
            cur = header.word0;
        }
        HeapStatus {
            fragments,
            free_bytes: free_pages * PAGE,
            largest_free: largest * PAGE,
        }
    }
}

/// # Safety
///
/// `addr` must point at a readable, page-aligned `BlockHeader`.
unsafe fn read_header(addr: usize) -> BlockHeader {
    // Safety: upheld by the caller
    unsafe { (addr as *const BlockHeader).read() }
}

/// # Safety
///
/// `addr` must point at writable, page-aligned storage for a `BlockHeader`.
unsafe fn write_header(addr: usize, header: BlockHeader) {
    // Safety: upheld by the caller
    unsafe { (addr as *mut BlockHeader).write(header) }
}
