//! General-purpose kernel allocation.
//!
//! [`Kmem`] ties the allocators together: a [`LockedBuddy`] hands out pages,
//! a [`PhysMap`] makes them addressable, and a [`CachePool`] carves them into
//! objects. Requests are routed by size:
//!
//! - sizes up to 2048 bytes are served by the slab cache of the smallest
//!   fitting class in [`SIZE_CLASSES`],
//! - larger sizes (including the 4096-byte class) are rounded up to a
//!   power-of-two number of pages and served by the buddy system.
//!
//! Every managed page carries a tag recording what `kmalloc` last put there,
//! so that `kfree` can dispatch on the address alone.

use core::{fmt, mem, num::NonZeroUsize, ptr::NonNull};

use spin::{Mutex, Once};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{
    buddy::{pages_to_order, AllocType, BuddyConfig, BuddyStats, LockedBuddy},
    phys::{PhysMap, PAGE_SIZE},
    slab::{CacheFlags, CachePool, CacheStats, ObjectFn, PageSource, SlabCache},
    AllocError, AllocInitError, BackingAllocator, BasePtr,
};

/// The sizes served by [`Kmem::kmalloc`] without rounding to whole pages.
pub const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

const NUM_CLASSES: usize = SIZE_CLASSES.len();

const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
    "kmalloc-4096",
];

/// What a managed page currently holds, as far as `kfree` is concerned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PageTag {
    Untracked,
    /// A slab not yet claimed by a size class, or one of a named cache.
    Cache,
    /// A slab of the given size class.
    Slab(u8),
    /// The first page of a multi-page allocation of the given order.
    Large(u8),
}

/// The parts of a [`Kmem`] fixed by [`Kmem::init`].
struct Setup<A: BackingAllocator> {
    map: PhysMap<A>,
    base_page: usize,
    total_pages: usize,
    /// Pool index of each slab-backed size class.
    classes: [Option<usize>; NUM_CLASSES],
}

/// The kernel memory allocator.
///
/// `BLOCKS` bounds both the buddy block table and the page-tag table, and
/// must be at least the number of managed pages plus the maximum order.
///
/// [`Kmem::new`] is a `const fn`, so a kernel can place the allocator in a
/// `static` and initialize it in place once its memory map is known:
///
/// ```
/// use kmem::{BuddyConfig, Kmem, PhysMap, Raw, PAGE_SIZE};
///
/// static KMEM: Kmem<64, Raw> = Kmem::new();
///
/// # use core::ptr::NonNull;
/// # let layout = std::alloc::Layout::from_size_align(16 * PAGE_SIZE, PAGE_SIZE).unwrap();
/// # let region = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
/// let map = unsafe { PhysMap::new_raw(region, 0x100, 16) }.unwrap();
/// KMEM.init(map, BuddyConfig::new(0x100, 16)).unwrap();
///
/// let obj = KMEM.kmalloc(100).unwrap();
/// unsafe { KMEM.kfree(obj.as_ptr()) }.unwrap();
/// ```
pub struct Kmem<const BLOCKS: usize, A: BackingAllocator> {
    setup: Once<Setup<A>>,
    buddy: LockedBuddy<BLOCKS>,
    caches: CachePool,
    tags: Mutex<[PageTag; BLOCKS]>,
}

impl<const BLOCKS: usize, A: BackingAllocator> Kmem<BLOCKS, A> {
    /// Constructs an uninitialized allocator.
    ///
    /// Every allocation fails with [`AllocError::InvalidParameters`] until
    /// [`Kmem::init`] succeeds.
    pub const fn new() -> Self {
        Kmem {
            setup: Once::new(),
            buddy: LockedBuddy::new(),
            caches: CachePool::new(),
            tags: Mutex::new([PageTag::Untracked; BLOCKS]),
        }
    }

    /// Constructs an allocator managing the pages described by `config`
    /// through `map`.
    ///
    /// The allocator is built on the stack; use [`Kmem::new`] and
    /// [`Kmem::init`] for large `BLOCKS`.
    ///
    /// # Errors
    ///
    /// See [`Kmem::init`].
    pub fn try_new(map: PhysMap<A>, config: BuddyConfig) -> Result<Self, AllocInitError> {
        let kmem = Kmem::new();
        kmem.init(map, config)?;
        Ok(kmem)
    }

    /// Initializes the allocator in place, managing the pages described by
    /// `config` through `map`.
    ///
    /// An allocator can only be initialized once; a failed initialization
    /// may be retried.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidParameters`] if the allocator is
    /// already initialized, the configuration is rejected by the buddy
    /// system or `map` does not cover every managed page, or
    /// [`AllocInitError::CapacityExceeded`] if `BLOCKS` is too small.
    pub fn init(&self, map: PhysMap<A>, config: BuddyConfig) -> Result<(), AllocInitError> {
        let mut ran = false;

        self.setup.try_call_once(|| {
            ran = true;
            self.build(map, config)
        })?;

        // Another caller got there first.
        if !ran {
            return Err(AllocInitError::InvalidParameters);
        }

        Ok(())
    }

    fn build(&self, map: PhysMap<A>, config: BuddyConfig) -> Result<Setup<A>, AllocInitError> {
        let (base_page, total_pages) = {
            let mut b = self.buddy.lock();
            b.init(config)?;
            (b.base_page(), b.total_pages())
        };

        if !map.contains_page(base_page) || !map.contains_page(base_page + total_pages - 1) {
            return Err(AllocInitError::InvalidParameters);
        }

        self.tags.lock().fill(PageTag::Untracked);

        let mut classes = [None; NUM_CLASSES];

        for (class, &size) in SIZE_CLASSES.iter().enumerate() {
            // Whole pages come straight from the buddy system.
            if size >= PAGE_SIZE {
                continue;
            }

            match self.caches.create(
                CLASS_NAMES[class],
                size,
                mem::align_of::<usize>(),
                CacheFlags::empty(),
                None,
                None,
            ) {
                Ok(cache) => classes[class] = Some(cache.id()),
                Err(e) => {
                    // Nothing has been allocated from these yet.
                    for cache in classes.iter().flatten().filter_map(|&id| self.caches.get(id)) {
                        let _ = unsafe { cache.destroy(self) };
                    }
                    return Err(e.into());
                }
            }
        }

        log::info!(
            "kmalloc: {} slab classes up to {} bytes over {total_pages} pages",
            classes.iter().flatten().count(),
            SIZE_CLASSES[NUM_CLASSES - 2]
        );

        Ok(Setup {
            map,
            base_page,
            total_pages,
            classes,
        })
    }

    fn setup(&self) -> Result<&Setup<A>, AllocError> {
        self.setup.get().ok_or(AllocError::InvalidParameters)
    }

    /// Returns `true` once [`Kmem::init`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.setup.is_completed()
    }

    /// Returns the physical window, if the allocator is initialized.
    pub fn phys(&self) -> Option<&PhysMap<A>> {
        self.setup.get().map(|s| &s.map)
    }

    /// Returns the cache pool.
    pub fn caches(&self) -> &CachePool {
        &self.caches
    }

    /// Returns the slab cache serving `size`, if that size is slab-backed.
    pub fn class_cache(&self, size: usize) -> Option<&SlabCache> {
        self.slab_class(size).map(|(_, cache)| cache)
    }

    fn slab_class(&self, size: usize) -> Option<(usize, &SlabCache)> {
        let class = SIZE_CLASSES.iter().position(|&c| c >= size)?;
        let id = self.setup.get()?.classes[class]?;
        Some((class, self.caches.get(id)?))
    }

    fn tag_index(&self, page: usize) -> Option<usize> {
        let setup = self.setup.get()?;
        let rel = page.checked_sub(setup.base_page)?;
        (rel < setup.total_pages).then_some(rel)
    }

    fn set_tag(&self, page: usize, tag: PageTag) {
        if let Some(idx) = self.tag_index(page) {
            self.tags.lock()[idx] = tag;
        }
    }

    fn tag(&self, page: usize) -> PageTag {
        self.tag_index(page)
            .map_or(PageTag::Untracked, |idx| self.tags.lock()[idx])
    }

    /// Allocates at least `size` bytes.
    ///
    /// Slab-backed allocations are aligned to the size of a pointer; page
    /// allocations are page-aligned.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if `size` is zero or the
    /// allocator is uninitialized, or [`AllocError::OutOfMemory`] if no
    /// memory is available.
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let setup = self.setup()?;
        if size == 0 {
            return Err(AllocError::InvalidParameters);
        }

        if let Some((class, cache)) = self.slab_class(size) {
            // SAFETY: class caches only ever draw pages from `self`.
            let obj = unsafe { cache.allocate(self)? };
            // A live object keeps its slab, so the tag cannot go stale.
            if let Some(page) = setup.map.virt_to_page(obj.addr()) {
                self.set_tag(page, PageTag::Slab(class as u8));
            }
            return Ok(obj);
        }

        let order = pages_to_order(size.div_ceil(PAGE_SIZE));
        let page = self.buddy.alloc(order)?;

        let Some(ptr) = setup.map.page_to_virt(page) else {
            // Checked at initialization.
            let _ = self.buddy.free(page, order);
            return Err(AllocError::OutOfMemory);
        };

        self.set_tag(page, PageTag::Large(order as u8));
        log::trace!("kmalloc: {size} bytes as order {order} at page {page:#x}");

        Ok(ptr)
    }

    /// Allocates at least `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// See [`Kmem::kmalloc`].
    pub fn kzalloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.kmalloc(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Frees memory returned by [`Kmem::kmalloc`] or [`Kmem::kzalloc`].
    ///
    /// Freeing a null pointer does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotFound`] if `ptr` does not point to the start
    /// of a live allocation made through `kmalloc`.
    ///
    /// # Safety
    ///
    /// No reference to the allocation may outlive this call.
    pub unsafe fn kfree(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let setup = self.setup().map_err(|_| AllocError::NotFound)?;
        let page = setup
            .map
            .virt_to_page(ptr.addr())
            .ok_or(AllocError::NotFound)?;

        match self.tag(page) {
            PageTag::Slab(class) => {
                let cache = setup.classes[class as usize]
                    .and_then(|id| self.caches.get(id))
                    .ok_or(AllocError::NotFound)?;
                unsafe { cache.deallocate(self, ptr) }
            }

            PageTag::Large(order) => {
                let idx = self.tag_index(page).ok_or(AllocError::NotFound)?;

                // Claim the tag first so a racing free of the same pointer
                // fails instead of freeing the page twice.
                {
                    let mut tags = self.tags.lock();
                    let start = setup.map.page_to_virt(page);
                    if tags[idx] != PageTag::Large(order) || start != Some(ptr) {
                        return Err(AllocError::NotFound);
                    }
                    tags[idx] = PageTag::Untracked;
                }

                self.buddy.free(page, order as u32)
            }

            PageTag::Cache | PageTag::Untracked => Err(AllocError::NotFound),
        }
    }

    /// Returns the usable size of the allocation at `ptr`.
    ///
    /// For slab-backed memory this is the size of the class, whether or not
    /// the slot is currently allocated.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotFound`] if `ptr` was not returned by
    /// `kmalloc`.
    pub fn ksize(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        let setup = self.setup().map_err(|_| AllocError::NotFound)?;
        let page = setup
            .map
            .virt_to_page(ptr.addr())
            .ok_or(AllocError::NotFound)?;

        match self.tag(page) {
            PageTag::Slab(class) => Ok(SIZE_CLASSES[class as usize]),
            PageTag::Large(order) if setup.map.page_to_virt(page) == Some(ptr) => {
                Ok((1 << order) * PAGE_SIZE)
            }
            _ => Err(AllocError::NotFound),
        }
    }

    /// Allocates `2^order` pages from anywhere in the managed range.
    ///
    /// Pages obtained this way must be returned with [`Kmem::buddy_free`],
    /// not `kfree`.
    ///
    /// # Errors
    ///
    /// See [`BuddySystem::alloc_type`](crate::BuddySystem::alloc_type).
    pub fn buddy_alloc(&self, order: u32) -> Result<usize, AllocError> {
        self.setup()?;
        self.buddy.alloc(order)
    }

    /// Allocates `2^order` pages from the zone selected by `ty`.
    ///
    /// # Errors
    ///
    /// See [`BuddySystem::alloc_type`](crate::BuddySystem::alloc_type).
    pub fn buddy_alloc_type(&self, order: u32, ty: AllocType) -> Result<usize, AllocError> {
        self.setup()?;
        self.buddy.alloc_type(order, ty)
    }

    /// Frees pages allocated with [`Kmem::buddy_alloc`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotFound`] if `page` holds a slab or a `kmalloc`
    /// allocation, otherwise see [`BuddySystem::free`](crate::BuddySystem::free).
    pub fn buddy_free(&self, page: usize, order: u32) -> Result<(), AllocError> {
        self.setup()?;

        // Pages from `kmalloc` and the caches go back through them.
        if self.tag(page) != PageTag::Untracked {
            return Err(AllocError::NotFound);
        }

        self.buddy.free(page, order)
    }

    /// Returns buddy system usage.
    pub fn buddy_stats(&self) -> BuddyStats {
        self.buddy.stats()
    }

    fn owns(&self, cache: &SlabCache) -> bool {
        self.caches
            .get(cache.id())
            .is_some_and(|c| core::ptr::eq(c, cache))
    }

    fn is_class_cache(&self, cache: &SlabCache) -> bool {
        self.setup
            .get()
            .is_some_and(|s| s.classes.contains(&Some(cache.id())))
    }

    /// Creates a named object cache whose slabs come from this allocator.
    ///
    /// # Errors
    ///
    /// See [`CachePool::create`].
    pub fn cache_create(
        &self,
        name: &'static str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectFn>,
        dtor: Option<ObjectFn>,
    ) -> Result<&SlabCache, AllocError> {
        self.caches.create(name, size, align, flags, ctor, dtor)
    }

    /// Allocates an object from `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if `cache` does not belong to
    /// this allocator, otherwise see [`SlabCache::allocate`].
    pub fn cache_alloc(&self, cache: &SlabCache) -> Result<NonNull<u8>, AllocError> {
        if !self.owns(cache) {
            return Err(AllocError::InvalidParameters);
        }

        // SAFETY: every cache in the pool draws pages from `self`.
        unsafe { cache.allocate(self) }
    }

    /// Returns an object to `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if `cache` does not belong to
    /// this allocator, otherwise see [`SlabCache::deallocate`].
    ///
    /// # Safety
    ///
    /// No reference to the object may outlive this call.
    pub unsafe fn cache_free(&self, cache: &SlabCache, obj: NonNull<u8>) -> Result<(), AllocError> {
        if !self.owns(cache) {
            return Err(AllocError::InvalidParameters);
        }

        // SAFETY: as for `cache_alloc`.
        unsafe { cache.deallocate(self, obj) }
    }

    /// Destroys `cache`, returning all of its pages.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if `cache` does not belong to
    /// this allocator or backs a `kmalloc` size class.
    pub fn cache_destroy(&self, cache: &SlabCache) -> Result<(), AllocError> {
        if !self.owns(cache) || self.is_class_cache(cache) {
            return Err(AllocError::InvalidParameters);
        }

        // SAFETY: as for `cache_alloc`.
        unsafe { cache.destroy(self) }
    }

    /// Returns the empty slabs of `cache` to the buddy system.
    ///
    /// Returns the number of pages released.
    pub fn cache_shrink(&self, cache: &SlabCache) -> usize {
        if !self.owns(cache) {
            return 0;
        }

        // SAFETY: as for `cache_alloc`.
        unsafe { cache.shrink(self) }
    }

    /// Returns object accounting for `cache`.
    ///
    /// A cache which does not belong to this allocator reports nothing.
    pub fn cache_stats(&self, cache: &SlabCache) -> CacheStats {
        if !self.owns(cache) {
            return CacheStats::default();
        }

        // SAFETY: as for `cache_alloc`.
        unsafe { cache.stats(self) }
    }
}

impl<const BLOCKS: usize, A: BackingAllocator> Default for Kmem<BLOCKS, A> {
    fn default() -> Self {
        Kmem::new()
    }
}

// SAFETY: the base is the window fixed at initialization, every managed page
// lies in it, and pages come from the buddy system, which hands each out once.
unsafe impl<const BLOCKS: usize, A: BackingAllocator> PageSource for Kmem<BLOCKS, A> {
    fn base(&self) -> Option<BasePtr> {
        self.setup.get().map(|s| s.map.base())
    }

    fn alloc_page(&self) -> Result<NonZeroUsize, AllocError> {
        let setup = self.setup()?;
        let page = self.buddy.alloc(0)?;

        match setup.map.page_to_virt(page) {
            Some(ptr) => {
                self.set_tag(page, PageTag::Cache);
                Ok(ptr.addr())
            }
            None => {
                let _ = self.buddy.free(page, 0);
                Err(AllocError::OutOfMemory)
            }
        }
    }

    unsafe fn free_page(&self, page: NonZeroUsize) {
        let Some(pfn) = self.phys().and_then(|map| map.virt_to_page(page)) else {
            log::warn!("kmalloc: freed slab page {page:#x} outside the window");
            return;
        };

        self.set_tag(pfn, PageTag::Untracked);
        if let Err(e) = self.buddy.free(pfn, 0) {
            log::warn!("kmalloc: failed to free slab page {pfn:#x}: {e}");
        }
    }
}

impl<const BLOCKS: usize, A: BackingAllocator> fmt::Debug for Kmem<BLOCKS, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kmem")
            .field("map", &self.phys())
            .field("buddy", &self.buddy)
            .field("caches", &self.caches)
            .finish()
    }
}
