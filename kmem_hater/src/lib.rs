//! A small library for ~~hating on~~ evaluating the correctness of kernel
//! allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s, painting every allocation with the id of the operation
//! that made it and verifying the paint before the allocation is freed.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

use arbitrary::{Arbitrary, Unstructured};
use kmem::{
    buddy::pages_to_order, AllocError, AllocInitError, BuddyConfig, BuddySystem, CacheFlags,
    Global, Kmem, PhysMap, SIZE_CLASSES, PAGE_SIZE,
};

/// The largest allocation size generated by [`AllocatorOp::arbitrary`].
pub const MAX_ALLOC_SIZE: usize = 64 * PAGE_SIZE;

/// The block table capacity of every subject.
pub const BLOCKS: usize = 1024;

/// The first page managed by every subject.
pub const BASE_PAGE: usize = 0x1000;

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Custom,
}

/// An operation performed on a [`Subject`].
#[derive(Clone, Debug)]
pub enum AllocatorOp<Op> {
    /// Allocate at least this many bytes.
    Alloc(usize),
    /// Free an outstanding allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `idx % n`.
    Dealloc(usize),
    /// A subject-specific operation.
    Custom(Op),
}

impl<'a, Op: Arbitrary<'a>> Arbitrary<'a> for AllocatorOp<Op> {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let op = match AllocatorOpTag::arbitrary(u)? {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(1 + usize::arbitrary(u)? % MAX_ALLOC_SIZE),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Custom => AllocatorOp::Custom(Op::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type Op: for<'a> Arbitrary<'a>;

    /// Allocates at least `size` bytes, returning the span that may be used.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    /// Deallocates the block of memory of `size` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// subject, and it must have been allocated with `size`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }

    /// Checks the subject's own accounting.
    fn consistent(&self) -> bool {
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // The usable span of the allocation.
    ptr: NonNull<[u8]>,
    // The size originally requested.
    size: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block`
    ///   until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, size: usize, id: u64) -> Block {
        let mut b = Block { ptr, size, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, usize) {
        (self.ptr, self.size)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed<Op> {
    pub completed: Vec<AllocatorOp<Op>>,
    pub failed_op: Option<AllocatorOp<Op>>,
}

impl<S: Subject> Evaluator<S>
where
    S::Op: Clone,
{
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed<S::Op>>
    where
        I: IntoIterator<Item = AllocatorOp<S::Op>>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id as u64;
            let ok = match op.clone() {
                AllocatorOp::Alloc(size) => {
                    if let Ok(ptr) = self.subject.allocate(size) {
                        let block = unsafe { Block::init(ptr, size, op_id) };
                        blocks.push(block);
                    }
                    true
                }

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) => {
                        let intact = block.verify();
                        block.paint(op_id);
                        let (ptr, size) = block.into_raw_parts();
                        unsafe { self.subject.deallocate(ptr.cast(), size) };
                        intact
                    }
                    None => true,
                },

                AllocatorOp::Custom(custom) => {
                    self.subject.handle_custom_op(custom);
                    true
                }
            };

            if !ok || !self.subject.consistent() {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                });
            }

            completed.push(op);
        }

        let mut intact = true;
        for block in blocks {
            intact &= block.verify();
            let (ptr, size) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr.cast(), size) };
        }

        if !intact || !self.subject.consistent() {
            return Err(Failed {
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}

fn new_kmem(num_pages: usize) -> Result<Kmem<BLOCKS, Global>, AllocInitError> {
    let map = PhysMap::try_new(BASE_PAGE, num_pages)?;
    Kmem::try_new(map, BuddyConfig::new(BASE_PAGE, num_pages))
}

/// Extra operations on a [`KmemSubject`].
#[derive(Arbitrary, Clone, Debug)]
pub enum KmemOp {
    /// Release the empty slabs of the size class at this index.
    Shrink(u8),
    /// Allocate zeroed memory and free it again.
    ZeroedRoundtrip(u16),
}

/// `kmalloc`/`kfree` over a window backed by the global allocator.
pub struct KmemSubject(Kmem<BLOCKS, Global>);

impl KmemSubject {
    pub fn new(num_pages: usize) -> Result<Self, AllocInitError> {
        Ok(KmemSubject(new_kmem(num_pages)?))
    }
}

impl Subject for KmemSubject {
    type Op = KmemOp;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.0.kmalloc(size)?;
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        assert!(self.0.ksize(ptr).is_ok_and(|usable| usable >= size));
        unsafe { self.0.kfree(ptr.as_ptr()).unwrap() };
    }

    fn handle_custom_op(&mut self, op: KmemOp) {
        match op {
            KmemOp::Shrink(class) => {
                let size = SIZE_CLASSES[class as usize % SIZE_CLASSES.len()];
                if let Some(cache) = self.0.class_cache(size) {
                    self.0.cache_shrink(cache);
                }
            }

            KmemOp::ZeroedRoundtrip(size) => {
                let size = usize::from(size).max(1);
                if let Ok(ptr) = self.0.kzalloc(size) {
                    let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == 0));
                    unsafe { self.0.kfree(ptr.as_ptr()).unwrap() };
                }
            }
        }
    }

    fn consistent(&self) -> bool {
        let stats = self.0.buddy_stats();
        stats.free_pages + stats.used_pages == stats.total_pages
    }
}

/// A single object cache drawing pages from a `Kmem`.
pub struct SlabSubject {
    kmem: Kmem<BLOCKS, Global>,
    cache: usize,
    live: usize,
}

impl SlabSubject {
    pub fn new(num_pages: usize, object_size: usize, align: usize) -> Result<Self, AllocInitError> {
        let kmem = new_kmem(num_pages)?;
        let cache = kmem
            .cache_create(
                "hater",
                object_size,
                align,
                CacheFlags::POISON,
                None,
                None,
            )?
            .id();

        Ok(SlabSubject {
            kmem,
            cache,
            live: 0,
        })
    }
}

impl Subject for SlabSubject {
    type Op = ();

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        let obj = self.kmem.cache_alloc(cache)?;
        self.live += 1;
        Ok(NonNull::slice_from_raw_parts(obj, size.min(cache.object_size())))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        unsafe { self.kmem.cache_free(cache, ptr).unwrap() };
        self.live -= 1;
    }

    fn handle_custom_op(&mut self, (): ()) {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        self.kmem.cache_shrink(cache);
    }

    fn consistent(&self) -> bool {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        let stats = self.kmem.cache_stats(cache);

        stats.used_objects == self.live
            && stats.total_objects == stats.slabs * cache.num_per_slab()
            && self.kmem.buddy_stats().used_pages == stats.slabs
    }
}

/// A bare buddy system whose pages are made addressable by a window.
pub struct BuddySubject {
    map: PhysMap<Global>,
    buddy: BuddySystem<BLOCKS>,
}

impl BuddySubject {
    pub fn new(config: BuddyConfig) -> Result<Self, AllocInitError> {
        let map = PhysMap::try_new(config.base_page, config.total_pages)?;
        let buddy = BuddySystem::try_new(config)?;
        Ok(BuddySubject { map, buddy })
    }

    fn order(&self, size: usize) -> u32 {
        pages_to_order(size.div_ceil(PAGE_SIZE)).max(self.buddy.min_order())
    }
}

impl Subject for BuddySubject {
    type Op = ();

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let page = self.buddy.alloc(self.order(size))?;
        let ptr = self.map.page_to_virt(page).ok_or(AllocError::OutOfMemory)?;
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = core::num::NonZeroUsize::new(ptr.as_ptr() as usize).unwrap();
        let page = self.map.virt_to_page(addr).unwrap();
        self.buddy.free(page, self.order(size)).unwrap();
    }

    fn consistent(&self) -> bool {
        let stats = self.buddy.stats();
        stats.free_pages + stats.used_pages == stats.total_pages
    }
}
