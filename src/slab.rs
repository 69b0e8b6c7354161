//! Slab object caches.
//!
//! A slab cache hands out objects of one fixed size and alignment. Objects
//! are packed into *slabs*: single pages obtained from a [`PageSource`], each
//! laid out as
//!
//! ```text
//! +--------+---------+--------------------------------+--------+
//! | header | padding | object 0 | object 1 | ... | N-1 | bitmap |
//! +--------+---------+--------------------------------+--------+
//! ```
//!
//! where the trailing bitmap holds one bit per object (set = allocated). The
//! owning slab of an object is found by rounding its address down to a page
//! boundary.
//!
//! Each cache keeps its slabs on three intrusive lists, *full*, *partial* and
//! *empty*; a slab's list is a function of its number of free objects. Empty
//! slabs are kept for reuse until [`SlabCache::shrink`] or
//! [`SlabCache::destroy`] is called.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case         |
//! |--------------------------|-----------|--------------------|
//! | Allocate                 | O(1)      | O(objects / 32)    |
//! | Deallocate               | O(1)      | O(1)               |
//! | Statistics               | O(slabs)  | O(slabs)           |
//!
//! #### Fragmentation
//!
//! Slab caches exhibit no external fragmentation within a slab; the internal
//! fragmentation of a cache is the header, padding and bitmap overhead of each
//! page plus the difference between the object size and the size actually
//! needed by the caller.

use core::{fmt, mem, num::NonZeroUsize, ptr::NonNull};

use bitflags::bitflags;
use spin::Mutex;

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{
    base::{BlockList, DoubleBlockLink},
    bitmap::Bitmap,
    AllocError, BasePtr, PAGE_SIZE,
};

/// The number of cache descriptors in a [`CachePool`].
pub const MAX_CACHES: usize = 32;

/// The byte written over freed objects by caches with [`CacheFlags::POISON`].
pub const POISON_BYTE: u8 = 0x6b;

/// A function run on an object by a cache.
pub type ObjectFn = fn(NonNull<u8>);

bitflags! {
    /// Behavior flags for a [`SlabCache`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Zero every object before it is returned by `allocate`.
        ///
        /// This cannot be combined with a constructor.
        const ZERO = 1 << 0;
        /// Fill objects with [`POISON_BYTE`] when they are freed, and new
        /// slabs without a constructor when they are created.
        const POISON = 1 << 1;
    }
}

/// A supplier of whole pages for slabs.
///
/// # Safety
///
/// Slab caches write their headers into the pages a source hands out and
/// derive object pointers from [`PageSource::base`], so implementors must
/// guarantee that:
///
/// - `base` returns `None` until the source can hand out pages, and the same
///   region on every call after that;
/// - every address returned by `alloc_page` is aligned to [`PAGE_SIZE`], lies
///   with its whole page inside that region, and is valid for reads and
///   writes;
/// - a page is never handed out again until it has been passed to
///   `free_page`.
pub unsafe trait PageSource {
    /// Returns a pointer covering every page this source can hand out.
    ///
    /// Pointers to objects are derived from it, so that they carry its
    /// provenance.
    fn base(&self) -> Option<BasePtr>;

    /// Allocates one page, returning its virtual address.
    fn alloc_page(&self) -> Result<NonZeroUsize, AllocError>;

    /// Frees a page returned by [`PageSource::alloc_page`].
    ///
    /// # Safety
    ///
    /// `page` must have been returned by `alloc_page` on this source and not
    /// freed since.
    unsafe fn free_page(&self, page: NonZeroUsize);
}

/// Object accounting for one cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The number of slabs (pages) owned by the cache.
    pub slabs: usize,
    /// The number of object slots across all slabs.
    pub total_objects: usize,
    /// The number of allocated objects.
    pub used_objects: usize,
    /// The number of free object slots.
    pub free_objects: usize,
}

/// The header at the start of every slab page.
///
/// Every field is valid for any bit pattern, so a stray page can be inspected
/// before its owner is known.
#[repr(C)]
struct SlabHeader {
    // Must come first: the slab lists link pages through it.
    link: DoubleBlockLink,
    cache_id: u32,
    generation: u32,
    free_count: usize,
    total_count: usize,
    /// Address of the first object.
    start: usize,
}

const HEADER_SIZE: usize = mem::size_of::<SlabHeader>();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlabList {
    Full,
    Partial,
    Empty,
}

impl SlabList {
    fn for_counts(free_count: usize, total_count: usize) -> SlabList {
        match free_count {
            0 => SlabList::Full,
            f if f == total_count => SlabList::Empty,
            _ => SlabList::Partial,
        }
    }
}

/// The in-page layout shared by every slab of a cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SlabLayout {
    object_size: usize,
    objects_offset: usize,
    num_per_slab: usize,
    bitmap_offset: usize,
}

impl SlabLayout {
    /// Computes the largest number of objects which fit in one page alongside
    /// the header and the bitmap.
    fn new(size: usize, align: usize) -> Result<SlabLayout, AllocError> {
        if size == 0 || !align.is_power_of_two() || align > PAGE_SIZE || size > PAGE_SIZE {
            return Err(AllocError::InvalidParameters);
        }

        let object_size = size.next_multiple_of(align);
        let objects_offset = HEADER_SIZE.next_multiple_of(align);
        let bitmap_offset = |n: usize| {
            (objects_offset + n * object_size).next_multiple_of(mem::align_of::<u32>())
        };

        let mut n = PAGE_SIZE.saturating_sub(objects_offset) / object_size;
        while n > 0 && bitmap_offset(n) + Bitmap::map_size(n) > PAGE_SIZE {
            n -= 1;
        }

        // Objects never span pages.
        if n == 0 {
            return Err(AllocError::InvalidParameters);
        }

        Ok(SlabLayout {
            object_size,
            objects_offset,
            num_per_slab: n,
            bitmap_offset: bitmap_offset(n),
        })
    }
}

struct CacheState {
    live: bool,
    generation: u32,
    name: &'static str,
    align: usize,
    flags: CacheFlags,
    layout: SlabLayout,
    ctor: Option<ObjectFn>,
    dtor: Option<ObjectFn>,
    full: BlockList,
    partial: BlockList,
    empty: BlockList,
}

impl CacheState {
    const IDLE: CacheState = CacheState {
        live: false,
        generation: 0,
        name: "",
        align: 1,
        flags: CacheFlags::empty(),
        layout: SlabLayout {
            object_size: 0,
            objects_offset: 0,
            num_per_slab: 0,
            bitmap_offset: 0,
        },
        ctor: None,
        dtor: None,
        full: BlockList::new(),
        partial: BlockList::new(),
        empty: BlockList::new(),
    };

    fn list_mut(&mut self, which: SlabList) -> &mut BlockList {
        match which {
            SlabList::Full => &mut self.full,
            SlabList::Partial => &mut self.partial,
            SlabList::Empty => &mut self.empty,
        }
    }

    fn lists(&self) -> [&BlockList; 3] {
        [&self.full, &self.partial, &self.empty]
    }

    /// Moves `slab` between lists if its free count crossed a boundary.
    unsafe fn migrate(&mut self, base: BasePtr, slab: NonZeroUsize, from: SlabList, to: SlabList) {
        if from != to {
            unsafe {
                self.list_mut(from).remove(base, slab);
                self.list_mut(to).push(base, slab);
            }
        }
    }

    unsafe fn bitmap(&self, base: BasePtr, slab: NonZeroUsize) -> Bitmap {
        let map = base
            .with_addr(slab.saturating_add(self.layout.bitmap_offset))
            .cast::<u32>();

        unsafe { Bitmap::from_raw(self.layout.num_per_slab, map) }
    }

    fn object_ptr(&self, base: BasePtr, slab: NonZeroUsize, index: usize) -> NonNull<u8> {
        let offset = self.layout.objects_offset + index * self.layout.object_size;
        base.with_addr(slab.saturating_add(offset))
    }

    unsafe fn fill(&self, obj: NonNull<u8>, byte: u8) {
        unsafe { obj.as_ptr().write_bytes(byte, self.layout.object_size) };
    }
}

/// A cache of fixed-size objects backed by single-page slabs.
///
/// Caches are created from a [`CachePool`]. All state is behind one spinlock
/// which is held for the whole of every operation, including constructor and
/// destructor calls.
pub struct SlabCache {
    id: u32,
    state: Mutex<CacheState>,
}

impl SlabCache {
    #[allow(clippy::declare_interior_mutable_const)]
    const IDLE: SlabCache = SlabCache {
        id: 0,
        state: Mutex::new(CacheState::IDLE),
    };

    /// Returns the index of this cache in its pool.
    pub fn id(&self) -> usize {
        self.id as usize
    }

    /// Returns `true` if the cache has been created and not destroyed.
    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// Returns the name given at creation.
    pub fn name(&self) -> &'static str {
        self.state.lock().name
    }

    /// Returns the size of each object slot, rounded up to the alignment.
    pub fn object_size(&self) -> usize {
        self.state.lock().layout.object_size
    }

    /// Returns the alignment of every object.
    pub fn align(&self) -> usize {
        self.state.lock().align
    }

    /// Returns the flags given at creation.
    pub fn flags(&self) -> CacheFlags {
        self.state.lock().flags
    }

    /// Returns the number of objects in each slab.
    pub fn num_per_slab(&self) -> usize {
        self.state.lock().layout.num_per_slab
    }

    /// Allocates an object.
    ///
    /// A partially used slab is preferred, then an empty one; if neither
    /// exists a new slab is built from one page of `pages`, running the
    /// constructor on each of its objects.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if the cache is not live or
    /// `pages` has no region yet, or the error of [`PageSource::alloc_page`]
    /// if a new slab is needed and no page is available.
    ///
    /// # Safety
    ///
    /// `pages` must be the source passed to every earlier call on this cache
    /// since it was created.
    pub unsafe fn allocate<P: PageSource + ?Sized>(
        &self,
        pages: &P,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut state = self.state.lock();
        if !state.live {
            return Err(AllocError::InvalidParameters);
        }

        let base = pages.base().ok_or(AllocError::InvalidParameters)?;
        let slab = match state.partial.head().or(state.empty.head()) {
            Some(slab) => slab,
            None => self.grow(&mut state, base, pages)?,
        };

        let mut bitmap = unsafe { state.bitmap(base, slab) };
        // Slabs on the partial and empty lists have a free object.
        let index = bitmap.first_clear().ok_or(AllocError::OutOfMemory)?;
        bitmap.set(index, true);

        let (from, to) = {
            let header = unsafe { base.get_mut::<SlabHeader>(slab) };
            let from = SlabList::for_counts(header.free_count, header.total_count);
            header.free_count -= 1;
            let to = SlabList::for_counts(header.free_count, header.total_count);
            (from, to)
        };

        unsafe { state.migrate(base, slab, from, to) };

        let obj = state.object_ptr(base, slab, index);
        if state.flags.contains(CacheFlags::ZERO) {
            unsafe { state.fill(obj, 0) };
        }

        Ok(obj)
    }

    /// Builds a new slab and puts it on the empty list.
    fn grow<P: PageSource + ?Sized>(
        &self,
        state: &mut CacheState,
        base: BasePtr,
        pages: &P,
    ) -> Result<NonZeroUsize, AllocError> {
        let slab = pages.alloc_page()?;
        debug_assert_eq!(slab.get() % PAGE_SIZE, 0, "slab page is not page-aligned");
        debug_assert!(base.contains_addr(slab), "slab page is outside the source");

        let layout = state.layout;

        unsafe {
            base.write(
                slab,
                SlabHeader {
                    link: DoubleBlockLink::default(),
                    cache_id: self.id,
                    generation: state.generation,
                    free_count: layout.num_per_slab,
                    total_count: layout.num_per_slab,
                    start: slab.get() + layout.objects_offset,
                },
            );

            let map = base
                .with_addr(slab.saturating_add(layout.bitmap_offset))
                .cast::<u32>();
            Bitmap::init(layout.num_per_slab, map);
        }

        for index in 0..layout.num_per_slab {
            let obj = state.object_ptr(base, slab, index);
            match state.ctor {
                Some(ctor) => ctor(obj),
                None if state.flags.contains(CacheFlags::POISON) => unsafe {
                    state.fill(obj, POISON_BYTE)
                },
                None => (),
            }
        }

        unsafe { state.empty.push(base, slab) };

        log::debug!(
            "slab: cache {} grew to {} slabs",
            state.name,
            state.lists().iter().map(|l| l.len()).sum::<usize>()
        );

        Ok(slab)
    }

    /// Returns an object to the cache.
    ///
    /// Freeing an object which is already free does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotFound`] if `obj` is not an object slot of a
    /// slab of this cache, or [`AllocError::InvalidParameters`] if the cache
    /// is not live.
    ///
    /// # Safety
    ///
    /// `pages` must be the source passed to every earlier call on this cache
    /// since it was created, and no reference to the object may outlive this
    /// call.
    pub unsafe fn deallocate<P: PageSource + ?Sized>(
        &self,
        pages: &P,
        obj: NonNull<u8>,
    ) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if !state.live {
            return Err(AllocError::InvalidParameters);
        }

        let base = pages.base().ok_or(AllocError::NotFound)?;
        let addr = obj.addr();
        let slab = NonZeroUsize::new(addr.get() & !(PAGE_SIZE - 1))
            .filter(|&slab| base.contains_addr(slab))
            .ok_or(AllocError::NotFound)?;

        let (start, total_count) = {
            let header = unsafe { base.get_mut::<SlabHeader>(slab) };
            if header.cache_id != self.id || header.generation != state.generation {
                return Err(AllocError::NotFound);
            }
            (header.start, header.total_count)
        };

        let offset = addr
            .get()
            .checked_sub(start)
            .ok_or(AllocError::NotFound)?;
        let index = offset / state.layout.object_size;
        if offset % state.layout.object_size != 0 || index >= total_count {
            return Err(AllocError::NotFound);
        }

        let mut bitmap = unsafe { state.bitmap(base, slab) };
        if !bitmap.get(index) {
            log::debug!("slab: double free of {:#x} in cache {}", addr, state.name);
            return Ok(());
        }

        if let Some(dtor) = state.dtor {
            dtor(obj);
        }
        if state.flags.contains(CacheFlags::POISON) {
            unsafe { state.fill(obj, POISON_BYTE) };
        }

        bitmap.set(index, false);

        let (from, to) = {
            let header = unsafe { base.get_mut::<SlabHeader>(slab) };
            let from = SlabList::for_counts(header.free_count, header.total_count);
            header.free_count += 1;
            (from, SlabList::for_counts(header.free_count, header.total_count))
        };

        unsafe { state.migrate(base, slab, from, to) };

        Ok(())
    }

    /// Releases every empty slab back to `pages`.
    ///
    /// Returns the number of pages released.
    ///
    /// # Safety
    ///
    /// `pages` must be the source passed to every earlier call on this cache
    /// since it was created.
    pub unsafe fn shrink<P: PageSource + ?Sized>(&self, pages: &P) -> usize {
        let mut state = self.state.lock();
        let Some(base) = pages.base() else {
            return 0;
        };

        let mut released = 0;
        while let Some(slab) = unsafe { state.empty.pop(base) } {
            unsafe { pages.free_page(slab) };
            released += 1;
        }

        released
    }

    /// Destroys the cache.
    ///
    /// The destructor runs on every object still allocated, every slab page
    /// is returned to `pages`, and the descriptor goes back to its pool.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if the cache is not live.
    ///
    /// # Safety
    ///
    /// `pages` must be the source passed to every earlier call on this cache
    /// since it was created.
    pub unsafe fn destroy<P: PageSource + ?Sized>(&self, pages: &P) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if !state.live {
            return Err(AllocError::InvalidParameters);
        }

        let mut released = 0;

        // A source without a region never handed out a slab.
        if let Some(base) = pages.base() {
            for which in [SlabList::Full, SlabList::Partial, SlabList::Empty] {
                while let Some(slab) = unsafe { state.list_mut(which).pop(base) } {
                    if let Some(dtor) = state.dtor {
                        let bitmap = unsafe { state.bitmap(base, slab) };
                        for index in bitmap.iter_set() {
                            dtor(state.object_ptr(base, slab, index));
                        }
                    }

                    unsafe { pages.free_page(slab) };
                    released += 1;
                }
            }
        }

        log::debug!("slab: destroyed cache {}, released {released} pages", state.name);

        let generation = state.generation.wrapping_add(1);
        *state = CacheState {
            generation,
            ..CacheState::IDLE
        };

        Ok(())
    }

    /// Returns object accounting summed over all three slab lists.
    ///
    /// # Safety
    ///
    /// `pages` must be the source passed to every earlier call on this cache
    /// since it was created.
    pub unsafe fn stats<P: PageSource + ?Sized>(&self, pages: &P) -> CacheStats {
        let state = self.state.lock();
        let mut stats = CacheStats::default();
        let Some(base) = pages.base() else {
            return stats;
        };

        for list in state.lists() {
            let mut cur = list.head();
            while let Some(slab) = cur {
                let header = unsafe { base.get_mut::<SlabHeader>(slab) };
                debug_assert_eq!(
                    unsafe { state.bitmap(base, slab) }.count_set(),
                    header.total_count - header.free_count
                );
                stats.slabs += 1;
                stats.total_objects += header.total_count;
                stats.free_objects += header.free_count;
                cur = header.link.next;
            }
        }

        stats.used_objects = stats.total_objects - stats.free_objects;
        stats
    }

    #[cfg(test)]
    fn list_lens(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.full.len(), state.partial.len(), state.empty.len())
    }
}

impl fmt::Debug for SlabCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(state) = self.state.try_lock() else {
            return f.write_str("SlabCache(<locked>)");
        };

        f.debug_struct("SlabCache")
            .field("id", &self.id)
            .field("live", &state.live)
            .field("name", &state.name)
            .field("object_size", &state.layout.object_size)
            .field("num_per_slab", &state.layout.num_per_slab)
            .field("full", &state.full.len())
            .field("partial", &state.partial.len())
            .field("empty", &state.empty.len())
            .finish()
    }
}

/// A fixed pool of [`MAX_CACHES`] cache descriptors.
pub struct CachePool {
    caches: [SlabCache; MAX_CACHES],
}

impl CachePool {
    /// Constructs a pool with every descriptor idle.
    pub const fn new() -> CachePool {
        let mut caches = [SlabCache::IDLE; MAX_CACHES];

        let mut id = 0;
        while id < MAX_CACHES {
            caches[id].id = id as u32;
            id += 1;
        }

        CachePool { caches }
    }

    /// Creates a cache of objects of `size` bytes aligned to `align`.
    ///
    /// `ctor` runs once on every object when its slab is created; `dtor` runs
    /// when an object is freed and on every allocated object when the cache
    /// is destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if `size` is zero, `align`
    /// is not a power of two, [`CacheFlags::ZERO`] is combined with a
    /// constructor, or not even one object fits in a page. Returns
    /// [`AllocError::CapacityExceeded`] if every descriptor is in use.
    pub fn create(
        &self,
        name: &'static str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectFn>,
        dtor: Option<ObjectFn>,
    ) -> Result<&SlabCache, AllocError> {
        if flags.contains(CacheFlags::ZERO) && ctor.is_some() {
            return Err(AllocError::InvalidParameters);
        }

        let layout = SlabLayout::new(size, align)?;

        for cache in &self.caches {
            let mut state = cache.state.lock();
            if state.live {
                continue;
            }

            *state = CacheState {
                live: true,
                generation: state.generation,
                name,
                align,
                flags,
                layout,
                ctor,
                dtor,
                ..CacheState::IDLE
            };

            log::debug!(
                "slab: created cache {name}: {} bytes, {} per slab",
                layout.object_size,
                layout.num_per_slab
            );

            return Ok(cache);
        }

        Err(AllocError::CapacityExceeded)
    }

    /// Returns the live cache with the given id.
    pub fn get(&self, id: usize) -> Option<&SlabCache> {
        self.caches.get(id).filter(|c| c.is_live())
    }

    /// Returns an iterator over the live caches.
    pub fn iter(&self) -> impl Iterator<Item = &SlabCache> + '_ {
        self.caches.iter().filter(|c| c.is_live())
    }
}

impl Default for CachePool {
    fn default() -> Self {
        CachePool::new()
    }
}

impl fmt::Debug for CachePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
