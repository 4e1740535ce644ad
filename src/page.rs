//! Page manager: lazily allocated, fixed-size blocks of value storage.
//!
//! A page holds `VALUES_PER_PAGE` contiguous, possibly uninitialized `T`s.
//! Its memory is requested from the injected `PageAllocator` the moment the
//! first slot in it becomes live and handed back the moment the last live
//! slot is released. The page record itself (and therefore the index range
//! it covers) is kept until the owner resets the whole table.
//!
//! This layer only counts live slots per page; it never reads, writes or
//! drops values. The allocator above it owns that.

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

/// Failure to obtain storage for a new value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The page allocator could not provide a page.
    #[error(
        "page allocation of {} bytes (align {}) failed",
        .layout.size(),
        .layout.align()
    )]
    OutOfMemory { layout: Layout },
    /// Growing would produce an index the key type cannot encode.
    #[error("slot index space exhausted")]
    IndexSpaceExhausted,
}

/// Source of page memory.
///
/// Pages are requested one at a time with the layout the allocator was
/// monomorphized for and are returned with the same layout.
pub trait PageAllocator {
    /// Return a block satisfying `layout`, or `AllocError::OutOfMemory`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Release a block.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `layout` and must not have been deallocated since.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Forwards to the process-wide Rust allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct Global;

impl PageAllocator for Global {
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layouts reaching here always have a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory { layout })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

struct Page<T> {
    base: Option<NonNull<T>>,
    used_slots: usize,
}

pub(crate) struct PageTable<T, A: PageAllocator, const PAGE_SIZE: usize> {
    pages: Vec<Page<T>>,
    allocator: A,
    allocations: u64,
    deallocations: u64,
}

impl<T, A: PageAllocator, const PAGE_SIZE: usize> PageTable<T, A, PAGE_SIZE> {
    pub(crate) const VALUES_PER_PAGE: usize = {
        assert!(
            mem::size_of::<T>() > 0,
            "zero-sized values cannot be stored in pages"
        );
        let n = PAGE_SIZE / mem::size_of::<T>();
        assert!(n > 0, "PAGE_SIZE is too small to hold a single value");
        n
    };

    pub(crate) const LAYOUT: Layout =
        match Layout::from_size_align(PAGE_SIZE, mem::align_of::<T>()) {
            Ok(layout) => layout,
            Err(_) => panic!("PAGE_SIZE does not form a valid page layout"),
        };

    pub(crate) fn new(allocator: A) -> Self {
        Self {
            pages: Vec::new(),
            allocator,
            allocations: 0,
            deallocations: 0,
        }
    }

    /// Add an unbacked page record covering the next `VALUES_PER_PAGE`
    /// indices.
    pub(crate) fn reserve_page(&mut self) {
        self.pages.push(Page {
            base: None,
            used_slots: 0,
        });
    }

    pub(crate) fn reserved_pages(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn allocated_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.base.is_some()).count()
    }

    pub(crate) fn allocations(&self) -> u64 {
        self.allocations
    }

    pub(crate) fn deallocations(&self) -> u64 {
        self.deallocations
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    #[inline]
    fn locate(index: usize) -> (usize, usize) {
        (index / Self::VALUES_PER_PAGE, index % Self::VALUES_PER_PAGE)
    }

    /// Count `index` as live and return its (uninitialized) storage,
    /// allocating the page if this is its first live slot. On failure
    /// nothing changes.
    pub(crate) fn acquire(&mut self, index: usize) -> Result<NonNull<T>, AllocError> {
        let (page_index, offset) = Self::locate(index);
        let page = &mut self.pages[page_index];
        let base = match page.base {
            Some(base) => base,
            None => {
                debug_assert_eq!(page.used_slots, 0);
                let base = self.allocator.allocate(Self::LAYOUT)?.cast::<T>();
                self.allocations += 1;
                log::trace!(
                    "allocated page {} ({} bytes) at {:p}",
                    page_index,
                    PAGE_SIZE,
                    base
                );
                page.base = Some(base);
                base
            }
        };
        page.used_slots += 1;
        // SAFETY: offset < VALUES_PER_PAGE, and VALUES_PER_PAGE values fit in
        // PAGE_SIZE bytes.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
    }

    /// Storage for `index`, if its page is currently backed.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> Option<NonNull<T>> {
        let (page_index, offset) = Self::locate(index);
        let base = self.pages.get(page_index)?.base?;
        // SAFETY: see `acquire`.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
    }

    /// Stop counting `index` as live; frees the page when it was the last
    /// live slot. The value must already have been moved out or dropped.
    pub(crate) fn release(&mut self, index: usize) {
        let (page_index, _) = Self::locate(index);
        let page = &mut self.pages[page_index];
        debug_assert!(page.used_slots > 0, "releasing a slot of an empty page");
        page.used_slots -= 1;
        if page.used_slots == 0 {
            if let Some(base) = page.base.take() {
                // SAFETY: `base` came from `allocate` with `LAYOUT` and was
                // taken out of the page, so it is freed exactly once.
                unsafe { self.allocator.deallocate(base.cast(), Self::LAYOUT) };
                self.deallocations += 1;
                log::trace!("freed page {} at {:p}", page_index, base);
            }
        }
    }

    /// Free every backed page and forget all page records. Values still
    /// stored in them are leaked, not dropped.
    pub(crate) fn release_all(&mut self) {
        for (page_index, page) in self.pages.iter_mut().enumerate() {
            if let Some(base) = page.base.take() {
                // SAFETY: as in `release`.
                unsafe { self.allocator.deallocate(base.cast(), Self::LAYOUT) };
                self.deallocations += 1;
                log::trace!("freed page {} at {:p}", page_index, base);
            }
        }
        self.pages.clear();
    }

    #[cfg(test)]
    pub(crate) fn used_slots(&self) -> impl Iterator<Item = (bool, usize)> + '_ {
        self.pages.iter().map(|p| (p.base.is_some(), p.used_slots))
    }
}

impl<T, A: PageAllocator, const PAGE_SIZE: usize> Drop for PageTable<T, A, PAGE_SIZE> {
    fn drop(&mut self) {
        self.release_all();
    }
}
