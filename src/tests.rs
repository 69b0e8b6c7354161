#![cfg(test)]
extern crate std;

use core::{fmt::Debug, marker::PhantomData, ptr, ptr::NonNull};

use crate::{
    buddy::{pages_to_order, BuddyConfig, BuddySystem},
    slab::CacheFlags,
    AllocError, AllocInitError, Global, Kmem, PhysMap, PAGE_SIZE,
};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

const BASE_PAGE: usize = 0x1000;
const BLOCKS: usize = 512;

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    /// Allocates at least `size` bytes, returning the usable span.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Checks the allocator's own accounting given `live` outstanding
    /// allocations.
    fn consistent(&self, live: usize) -> bool;
}

// Kmem =======================================================================

#[derive(Clone, Debug)]
struct KmemParams {
    num_pages: usize,
}

impl Arbitrary for KmemParams {
    fn arbitrary(g: &mut Gen) -> Self {
        KmemParams {
            num_pages: 1 + usize::arbitrary(g) % 256,
        }
    }

    fn shrink(&self) -> alloc::boxed::Box<dyn Iterator<Item = Self>> {
        let smaller = (self.num_pages > 1).then(|| KmemParams {
            num_pages: self.num_pages / 2,
        });
        alloc::boxed::Box::new(smaller.into_iter())
    }
}

fn new_kmem(num_pages: usize) -> Result<Kmem<BLOCKS, Global>, AllocInitError> {
    let map = PhysMap::try_new(BASE_PAGE, num_pages)?;
    Kmem::try_new(map, BuddyConfig::new(BASE_PAGE, num_pages))
}

impl QcAllocator for Kmem<BLOCKS, Global> {
    type Params = KmemParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        new_kmem(params.num_pages)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.kmalloc(size)?;
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _: usize) {
        unsafe { self.kfree(ptr.as_ptr()).unwrap() };
    }

    fn consistent(&self, _: usize) -> bool {
        let stats = self.buddy_stats();
        stats.free_pages + stats.used_pages == stats.total_pages
    }
}

// Slab =======================================================================

/// A single object cache drawing pages from a `Kmem`.
struct SlabSubject {
    kmem: Kmem<BLOCKS, Global>,
    cache: usize,
}

#[derive(Clone, Debug)]
struct SlabParams {
    object_size: usize,
    align_shift: u8,
}

impl Arbitrary for SlabParams {
    fn arbitrary(g: &mut Gen) -> Self {
        SlabParams {
            object_size: 1 + usize::arbitrary(g) % 1024,
            align_shift: u8::arbitrary(g) % 7,
        }
    }
}

impl QcAllocator for SlabSubject {
    type Params = SlabParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        let kmem = new_kmem(64)?;
        let cache = kmem
            .cache_create(
                "qc",
                params.object_size,
                1 << params.align_shift,
                CacheFlags::empty(),
                None,
                None,
            )?
            .id();

        Ok(SlabSubject { kmem, cache })
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        let obj = self.kmem.cache_alloc(cache)?;
        let len = size.min(cache.object_size());
        Ok(NonNull::slice_from_raw_parts(obj, len))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _: usize) {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        unsafe { self.kmem.cache_free(cache, ptr).unwrap() };
    }

    fn consistent(&self, live: usize) -> bool {
        let cache = self.kmem.caches().get(self.cache).unwrap();
        let stats = self.kmem.cache_stats(cache);

        stats.total_objects == stats.slabs * cache.num_per_slab()
            && stats.used_objects == live
            && stats.used_objects + stats.free_objects == stats.total_objects
            && self.kmem.buddy_stats().used_pages == stats.slabs
    }
}

// Buddy ======================================================================

/// A bare buddy system whose pages are made addressable by a window.
struct BuddySubject {
    map: PhysMap<Global>,
    buddy: BuddySystem<BLOCKS>,
}

#[derive(Clone, Debug)]
struct BuddyParams {
    num_pages: usize,
    min_order: u32,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        BuddyParams {
            num_pages: 1 + usize::arbitrary(g) % 256,
            min_order: u32::arbitrary(g) % 3,
        }
    }
}

impl BuddySubject {
    fn order(&self, size: usize) -> u32 {
        pages_to_order(size.div_ceil(PAGE_SIZE)).max(self.buddy.min_order())
    }
}

impl QcAllocator for BuddySubject {
    type Params = BuddyParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        let map = PhysMap::try_new(BASE_PAGE, params.num_pages)?;
        let config = BuddyConfig::new(BASE_PAGE, params.num_pages).with_orders(params.min_order, 20);

        // Small ranges may not accommodate the minimum order.
        let config = match BuddySystem::<BLOCKS>::try_new(config) {
            Ok(_) => config,
            Err(_) => config.with_orders(0, 20),
        };

        Ok(BuddySubject {
            map,
            buddy: BuddySystem::try_new(config)?,
        })
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let page = self.buddy.alloc(self.order(size))?;
        let ptr = self.map.page_to_virt(page).unwrap();
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let page = self.map.virt_to_page(ptr.addr()).unwrap();
        self.buddy.free(page, self.order(size)).unwrap();
    }

    fn consistent(&self, live: usize) -> bool {
        let stats = self.buddy.stats();

        stats.free_pages + stats.used_pages == stats.total_pages
            && stats.used_pages >= live
            && stats.total_blocks - stats.free_blocks == live
    }
}

// Operations =================================================================

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer of `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 16;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    1 + usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

/// A live allocation painted with the id of the operation which made it.
struct Painted {
    op_id: OpId,
    span: NonNull<[u8]>,
    size: usize,
}

impl Painted {
    fn pattern(op_id: OpId, i: usize) -> u8 {
        op_id.to_le_bytes()[i % 4]
    }

    fn paint(&mut self) {
        let bytes = unsafe { self.span.as_mut() };
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = Self::pattern(self.op_id, i);
        }
    }

    fn intact(&self) -> bool {
        let bytes = unsafe { self.span.as_ref() };
        bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| b == Self::pattern(self.op_id, i))
    }
}

struct AllocatorChecker<A: QcAllocator> {
    allocator: A,
    allocations: Vec<Painted>,
    num_ops: u32,
}

impl<A: QcAllocator> AllocatorChecker<A> {
    fn new(params: A::Params, capacity: usize) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: A::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { size } => match self.allocator.allocate(size) {
                Ok(span) => {
                    let mut painted = Painted { op_id, span, size };
                    painted.paint();
                    self.allocations.push(painted);
                }

                Err(AllocError::OutOfMemory) => (),
                Err(_) => return false,
            },

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.intact() {
                    return false;
                }

                unsafe { self.allocator.deallocate(a.span.cast(), a.size) };
            }
        }

        self.allocator.consistent(self.allocations.len())
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Every allocation must survive until the end.
        if !self.allocations.iter().all(Painted::intact) {
            return false;
        }

        for a in self.allocations.drain(..) {
            unsafe { self.allocator.deallocate(a.span.cast(), a.size) };
        }

        self.allocator.consistent(0)
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> MutuallyExclusive<A> {
    fn check(params: A::Params, ops: Vec<AllocatorOp>) -> bool {
        let mut checker: AllocatorChecker<A> =
            AllocatorChecker::new(params, ops.capacity()).unwrap();
        checker.run(ops)
    }
}

#[test]
fn kmalloc_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(MutuallyExclusive::<Kmem<BLOCKS, Global>>::check as fn(_, _) -> bool);
}

#[test]
fn slab_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(MutuallyExclusive::<SlabSubject>::check as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(MutuallyExclusive::<BuddySubject>::check as fn(_, _) -> bool);
}

#[test]
fn buddy_init_is_idempotent() {
    fn prop(params: BuddyParams) -> bool {
        let config = BuddyConfig::new(BASE_PAGE, params.num_pages);
        let a = BuddySystem::<BLOCKS>::try_new(config).unwrap();
        let mut b = BuddySystem::<BLOCKS>::try_new(config).unwrap();
        b.init(config).unwrap();

        a.stats() == b.stats()
            && a.blocks()
                .zip(b.blocks())
                .all(|(x, y)| (x.start_page(), x.order()) == (y.start_page(), y.order()))
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_) -> bool);
}

#[test]
fn freed_memory_is_reused() {
    let mut kmem = new_kmem(16).unwrap();

    let first = kmem.allocate(3 * PAGE_SIZE).unwrap();
    unsafe { kmem.deallocate(first.cast(), 3 * PAGE_SIZE) };
    let second = kmem.allocate(3 * PAGE_SIZE).unwrap();

    assert!(ptr::eq(first.as_ptr().cast::<u8>(), second.as_ptr().cast::<u8>()));
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
