//! The fixed-offset physical-to-virtual window.
//!
//! The allocators in this crate assume that every managed physical page is
//! mapped at a constant offset in the kernel's address space. A [`PhysMap`]
//! describes that mapping for the pages `[base_page, base_page + num_pages)`
//! and hands out pointers which carry the provenance of the whole window.

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;
use crate::{AllocInitError, BackingAllocator, BasePtr, Raw};

/// The size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A window mapping physical pages onto a contiguous virtual region.
pub struct PhysMap<A: BackingAllocator> {
    base: BasePtr,
    base_page: usize,
    num_pages: usize,
    backing_allocator: A,
}

// SAFETY: the window only hands out addresses; the pages it covers are owned
// by whichever allocator manages them.
unsafe impl<A: BackingAllocator + Send> Send for PhysMap<A> {}
// SAFETY: all methods take `&self` and only compute addresses.
unsafe impl<A: BackingAllocator + Sync> Sync for PhysMap<A> {}

impl PhysMap<Raw> {
    /// Constructs a window over an existing mapping.
    ///
    /// Page `base_page` is mapped at `region`, and each following page at the
    /// next multiple of [`PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidParameters`] if `region` is not
    /// page-aligned, `num_pages` is zero, or the window overflows either
    /// address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `num_pages *
    /// PAGE_SIZE` bytes for as long as the window and any allocator using it
    /// exist.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        base_page: usize,
        num_pages: usize,
    ) -> Result<PhysMap<Raw>, AllocInitError> {
        Self::with_parts(region, base_page, num_pages, Raw)
    }
}

#[cfg(any(feature = "alloc", test))]
impl PhysMap<Global> {
    /// Constructs a window of `num_pages` pages backed by the global
    /// allocator.
    ///
    /// This stands in for physical memory when the allocators run outside a
    /// kernel. The memory is freed when the window is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AllocFailed`] if the global allocator cannot
    /// provide the region, or [`AllocInitError::InvalidParameters`] if the
    /// window is empty or too large.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(base_page: usize, num_pages: usize) -> Result<PhysMap<Global>, AllocInitError> {
        let layout = Self::region_layout(num_pages)?;

        // SAFETY: region size is not zero.
        let region = unsafe { alloc::alloc::alloc(layout) };
        let region = NonNull::new(region).ok_or(AllocInitError::AllocFailed(layout))?;

        match Self::with_parts(region, base_page, num_pages, Global) {
            Ok(map) => Ok(map),
            Err(e) => {
                unsafe { alloc::alloc::dealloc(region.as_ptr(), layout) };
                Err(e)
            }
        }
    }
}

impl<A: BackingAllocator> PhysMap<A> {
    /// Returns the layout of the region backing `num_pages` pages.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the region is empty or its size overflows.
    pub fn region_layout(num_pages: usize) -> Result<Layout, AllocInitError> {
        if num_pages == 0 {
            return Err(AllocInitError::InvalidParameters);
        }

        let size = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(AllocInitError::InvalidParameters)?;

        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| AllocInitError::InvalidParameters)
    }

    fn with_parts(
        region: NonNull<u8>,
        base_page: usize,
        num_pages: usize,
        backing_allocator: A,
    ) -> Result<PhysMap<A>, AllocInitError> {
        let layout = Self::region_layout(num_pages)?;

        if region.addr().get() % PAGE_SIZE != 0 {
            return Err(AllocInitError::InvalidParameters);
        }

        // The last physical address must be representable too.
        base_page
            .checked_add(num_pages)
            .and_then(|end| end.checked_mul(PAGE_SIZE))
            .ok_or(AllocInitError::InvalidParameters)?;

        let base = BasePtr::new(region, layout.size()).ok_or(AllocInitError::InvalidParameters)?;

        Ok(PhysMap {
            base,
            base_page,
            num_pages,
            backing_allocator,
        })
    }

    /// Returns a pointer to the start of the window.
    pub fn base(&self) -> BasePtr {
        self.base
    }

    /// Returns the first page covered by the window.
    pub fn base_page(&self) -> usize {
        self.base_page
    }

    /// Returns the number of pages covered by the window.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Returns `true` if `page` is covered by the window.
    pub fn contains_page(&self, page: usize) -> bool {
        page >= self.base_page && page - self.base_page < self.num_pages
    }

    /// Returns `true` if the virtual address `addr` lies in the window.
    pub fn contains_addr(&self, addr: NonZeroUsize) -> bool {
        self.base.contains_addr(addr)
    }

    /// Returns the virtual address of `page`.
    pub fn page_to_virt(&self, page: usize) -> Option<NonNull<u8>> {
        if !self.contains_page(page) {
            return None;
        }

        self.base.with_offset((page - self.base_page) * PAGE_SIZE)
    }

    /// Returns the page containing the virtual address `addr`.
    pub fn virt_to_page(&self, addr: NonZeroUsize) -> Option<usize> {
        if !self.contains_addr(addr) {
            return None;
        }

        let offset = self.base.offset_to(addr)?;
        Some(self.base_page + offset / PAGE_SIZE)
    }

    /// Translates a physical address into a virtual pointer.
    pub fn phys_to_virt(&self, phys: usize) -> Option<NonNull<u8>> {
        let page_ptr = self.page_to_virt(phys / PAGE_SIZE)?;
        let addr = NonZeroUsize::new(page_ptr.addr().get() + phys % PAGE_SIZE)?;

        Some(self.base.with_addr(addr))
    }

    /// Translates a virtual address in the window into a physical address.
    pub fn virt_to_phys(&self, addr: NonZeroUsize) -> Option<usize> {
        let offset = self.base.offset_to(addr)?;
        self.contains_addr(addr)
            .then(|| self.base_page * PAGE_SIZE + offset)
    }
}

impl<A: BackingAllocator> Drop for PhysMap<A> {
    fn drop(&mut self) {
        // Checked when the window was constructed.
        if let Ok(layout) = Self::region_layout(self.num_pages) {
            unsafe { self.backing_allocator.deallocate(self.base.ptr(), layout) };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for PhysMap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysMap")
            .field("base", &self.base.ptr())
            .field("base_page", &self.base_page)
            .field("num_pages", &self.num_pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_errors() {
        assert_eq!(
            PhysMap::<Global>::try_new(0, 0).unwrap_err(),
            AllocInitError::InvalidParameters
        );
    }

    #[test]
    fn overflowing_window_errors() {
        PhysMap::<Global>::try_new(usize::MAX, 1).unwrap_err();
        PhysMap::<Global>::try_new(0, usize::MAX).unwrap_err();
    }

    #[test]
    fn translation_roundtrip() {
        let map = PhysMap::try_new(0x100, 4).unwrap();

        let first = map.page_to_virt(0x100).unwrap();
        let last = map.page_to_virt(0x103).unwrap();
        assert_eq!(first, map.base().ptr());
        assert_eq!(last.addr().get() - first.addr().get(), 3 * PAGE_SIZE);
        assert!(map.page_to_virt(0xff).is_none());
        assert!(map.page_to_virt(0x104).is_none());

        let inside = NonZeroUsize::new(last.addr().get() + 17).unwrap();
        assert_eq!(map.virt_to_page(inside), Some(0x103));
        assert_eq!(map.virt_to_phys(inside), Some(0x103 * PAGE_SIZE + 17));

        let phys = 0x102 * PAGE_SIZE + 5;
        let virt = map.phys_to_virt(phys).unwrap();
        assert_eq!(map.virt_to_phys(virt.addr()), Some(phys));

        let outside = NonZeroUsize::new(map.base().limit().get()).unwrap();
        assert_eq!(map.virt_to_page(outside), None);
        assert_eq!(map.virt_to_phys(outside), None);
    }

    #[test]
    fn window_memory_is_writable() {
        let map = PhysMap::try_new(0, 2).unwrap();
        let page = map.page_to_virt(1).unwrap();

        unsafe {
            page.as_ptr().write_bytes(0xa5, PAGE_SIZE);
            assert_eq!(page.as_ptr().add(PAGE_SIZE - 1).read(), 0xa5);
        }
    }
}
