//! A binary-buddy page allocator.
//!
//! The buddy system manages a run of physical pages as power-of-two blocks.
//! A block of order `k` spans `2^k` pages. Allocation splits larger blocks in
//! half until a block of the requested order is obtained; deallocation
//! coalesces a block with its *buddy* (the block at `page XOR 2^k`, relative
//! to the base page) whenever both are free.
//!
//! The allocator deals only in page numbers and never touches the pages it
//! manages, so it can be constructed before any memory is mapped. Its block
//! table is a statically sized array of `BLOCKS` entries; a table slot is
//! abandoned when a merge absorbs its block and is reused by a later split.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                  |
//! |--------------------------|-----------|-----------------------------|
//! | Allocate                 | O(1)      | O(total blocks)             |
//! | Deallocate               | O(blocks) | O(blocks × max order)       |
//! | Statistics               | O(blocks) | O(blocks)                   |
//!
//! #### Fragmentation
//!
//! Buddy allocators exhibit limited external fragmentation, but suffer up to
//! 50% internal fragmentation because all allocations are rounded up to a
//! power of two pages.

use core::fmt;

use spin::{Mutex, MutexGuard};

use crate::AllocError;

/// The largest supported block order.
pub const MAX_ORDER: u32 = 20;

const NUM_ORDERS: usize = MAX_ORDER as usize + 1;

/// Distinguishes kernel-reserved from general-purpose allocations.
///
/// The kernel-reserved zone is the first `kernel_reserved_pages` pages of the
/// managed range; the general zone is everything above it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AllocType {
    /// Any free pages may satisfy the request.
    #[default]
    Any,
    /// Only pages inside the kernel-reserved zone may satisfy the request.
    Kernel,
    /// Only pages outside the kernel-reserved zone may satisfy the request.
    General,
}

/// The state of a block-table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// The block is on the free list for its order.
    Free,
    /// The block has been handed out by [`BuddySystem::alloc_type`].
    Used,
    /// The entry describes no pages; it was absorbed by a merge.
    Vacant,
}

/// A run of `2^order` pages tracked by the buddy system.
#[derive(Copy, Clone, Debug)]
pub struct Block {
    order: u32,
    status: BlockStatus,
    alloc_type: AllocType,
    start_page: usize,
    count: usize,
    // Free list (or vacant chain) links, as table indices.
    prev: Option<usize>,
    next: Option<usize>,
}

impl Block {
    const VACANT: Block = Block {
        order: 0,
        status: BlockStatus::Vacant,
        alloc_type: AllocType::Any,
        start_page: 0,
        count: 0,
        prev: None,
        next: None,
    };

    /// Returns the order of the block.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Returns the status of the block.
    pub fn status(&self) -> BlockStatus {
        self.status
    }

    /// Returns the type the block was allocated with.
    ///
    /// Free blocks always report [`AllocType::Any`].
    pub fn alloc_type(&self) -> AllocType {
        self.alloc_type
    }

    /// Returns the first page of the block.
    pub fn start_page(&self) -> usize {
        self.start_page
    }

    /// Returns the number of pages in the block.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Parameters for [`BuddySystem::init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuddyConfig {
    /// The first page managed by the allocator.
    pub base_page: usize,
    /// The number of usable pages starting at `base_page`.
    pub total_pages: usize,
    /// The smallest order handed out; smaller requests are rounded up.
    pub min_order: u32,
    /// The largest order; shrunk at init until `2^max_order <= total_pages`.
    pub max_order: u32,
    /// The number of pages at the bottom of the range reserved for
    /// [`AllocType::Kernel`] allocations.
    pub kernel_reserved_pages: usize,
}

impl BuddyConfig {
    /// Returns a configuration managing `total_pages` pages from `base_page`
    /// with the full range of orders and no kernel-reserved zone.
    pub const fn new(base_page: usize, total_pages: usize) -> BuddyConfig {
        BuddyConfig {
            base_page,
            total_pages,
            min_order: 0,
            max_order: MAX_ORDER,
            kernel_reserved_pages: 0,
        }
    }

    /// Sets the order bounds.
    pub const fn with_orders(mut self, min_order: u32, max_order: u32) -> BuddyConfig {
        self.min_order = min_order;
        self.max_order = max_order;
        self
    }

    /// Reserves the first `pages` pages for kernel allocations.
    pub const fn with_kernel_reserved(mut self, pages: usize) -> BuddyConfig {
        self.kernel_reserved_pages = pages;
        self
    }
}

/// A snapshot of buddy allocator usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Pages in free blocks.
    pub free_pages: usize,
    /// Pages in allocated blocks.
    pub used_pages: usize,
    /// Pages under management (`2^max_order`).
    pub total_pages: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of live (free or used) blocks.
    pub total_blocks: usize,
}

/// Returns the smallest order whose blocks hold at least `pages` pages.
pub fn pages_to_order(pages: usize) -> u32 {
    match pages {
        0 | 1 => 0,
        p => usize::BITS - (p - 1).leading_zeros(),
    }
}

/// A binary-buddy page allocator with a table of at most `BLOCKS` entries.
///
/// `BLOCKS` must be at least `total_pages + max_order` for the configuration
/// passed to [`BuddySystem::init`].
pub struct BuddySystem<const BLOCKS: usize> {
    blocks: [Block; BLOCKS],
    /// Number of table entries ever used; entries past `len` are untouched.
    len: usize,
    free_lists: [Option<usize>; NUM_ORDERS],
    /// Chain of vacant entries below `len`, linked through `next`.
    vacant: Option<usize>,
    num_vacant: usize,
    total_blocks: usize,
    free_blocks: usize,
    base_page: usize,
    total_pages: usize,
    min_order: u32,
    max_order: u32,
    kernel_reserved_pages: usize,
    initialized: bool,
}

impl<const BLOCKS: usize> BuddySystem<BLOCKS> {
    /// Constructs an uninitialized buddy system.
    ///
    /// Every operation fails with [`AllocError::InvalidParameters`] until
    /// [`BuddySystem::init`] succeeds.
    pub const fn new() -> BuddySystem<BLOCKS> {
        BuddySystem {
            blocks: [Block::VACANT; BLOCKS],
            len: 0,
            free_lists: [None; NUM_ORDERS],
            vacant: None,
            num_vacant: 0,
            total_blocks: 0,
            free_blocks: 0,
            base_page: 0,
            total_pages: 0,
            min_order: 0,
            max_order: 0,
            kernel_reserved_pages: 0,
            initialized: false,
        }
    }

    /// Constructs and initializes a buddy system.
    ///
    /// # Errors
    ///
    /// See [`BuddySystem::init`].
    pub fn try_new(config: BuddyConfig) -> Result<BuddySystem<BLOCKS>, AllocError> {
        let mut buddy = BuddySystem::new();
        buddy.init(config)?;
        Ok(buddy)
    }

    /// (Re)initializes the allocator, discarding all previous state.
    ///
    /// The managed range is a single free block of the largest order that
    /// fits in `total_pages`; any pages past it are left unmanaged.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if any bound is violated, or
    /// [`AllocError::CapacityExceeded`] if the block table could overflow.
    pub fn init(&mut self, config: BuddyConfig) -> Result<(), AllocError> {
        let BuddyConfig {
            base_page,
            total_pages,
            min_order,
            mut max_order,
            kernel_reserved_pages,
        } = config;

        if max_order > MAX_ORDER || min_order > max_order || total_pages == 0 {
            return Err(AllocError::InvalidParameters);
        }

        while (1_usize << max_order) > total_pages {
            max_order -= 1;
        }

        let managed = 1_usize << max_order;

        if min_order > max_order
            || kernel_reserved_pages > managed
            || base_page.checked_add(managed).is_none()
        {
            return Err(AllocError::InvalidParameters);
        }

        let projected = total_pages
            .checked_add(max_order as usize)
            .ok_or(AllocError::CapacityExceeded)?;
        if projected > BLOCKS {
            return Err(AllocError::CapacityExceeded);
        }

        self.reset();
        self.base_page = base_page;
        self.total_pages = managed;
        self.min_order = min_order;
        self.max_order = max_order;
        self.kernel_reserved_pages = kernel_reserved_pages;
        self.initialized = true;

        let idx = self.take_slot().ok_or(AllocError::CapacityExceeded)?;
        self.blocks[idx] = Block {
            order: max_order,
            status: BlockStatus::Free,
            alloc_type: AllocType::Any,
            start_page: base_page,
            count: managed,
            prev: None,
            next: None,
        };
        self.total_blocks = 1;
        self.free_blocks = 1;
        self.free_list_push(idx);

        if managed < total_pages {
            log::warn!(
                "buddy: {} pages past page {:#x} are unmanaged",
                total_pages - managed,
                base_page + managed
            );
        }

        log::info!(
            "buddy: managing {managed} pages from page {base_page:#x}, orders {min_order}..={max_order}"
        );

        Ok(())
    }

    /// Clears the table in place; the table may be too large for the stack.
    fn reset(&mut self) {
        self.blocks[..self.len].fill(Block::VACANT);
        self.len = 0;
        self.free_lists = [None; NUM_ORDERS];
        self.vacant = None;
        self.num_vacant = 0;
        self.total_blocks = 0;
        self.free_blocks = 0;
        self.base_page = 0;
        self.total_pages = 0;
        self.min_order = 0;
        self.max_order = 0;
        self.kernel_reserved_pages = 0;
        self.initialized = false;
    }

    /// Returns the first managed page.
    pub fn base_page(&self) -> usize {
        self.base_page
    }

    /// Returns the number of managed pages.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Returns the smallest order handed out.
    pub fn min_order(&self) -> u32 {
        self.min_order
    }

    /// Returns the largest order, after shrinking to fit the managed range.
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Returns `true` once [`BuddySystem::init`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns an iterator over the live (free or used) table entries.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.blocks[..self.len]
            .iter()
            .filter(|b| b.status != BlockStatus::Vacant)
    }

    /// Returns the number of blocks on the free list for `order`.
    pub fn free_list_len(&self, order: u32) -> usize {
        let mut len = 0;
        let mut cur = self.free_lists.get(order as usize).copied().flatten();
        while let Some(idx) = cur {
            len += 1;
            cur = self.blocks[idx].next;
        }
        len
    }

    /// Allocates a block of `2^order` pages from anywhere in the range.
    ///
    /// # Errors
    ///
    /// See [`BuddySystem::alloc_type`].
    pub fn alloc(&mut self, order: u32) -> Result<usize, AllocError> {
        self.alloc_type(order, AllocType::Any)
    }

    /// Allocates a block of `2^order` pages from the zone selected by `ty`.
    ///
    /// Orders below the minimum order are rounded up to it. On success,
    /// returns the first page of the block.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidParameters`] if the allocator is
    /// uninitialized, or [`AllocError::OutOfMemory`] if `order` exceeds the
    /// maximum order or no eligible block exists.
    pub fn alloc_type(&mut self, order: u32, ty: AllocType) -> Result<usize, AllocError> {
        if !self.initialized {
            return Err(AllocError::InvalidParameters);
        }

        if order > self.max_order {
            log::debug!("buddy: order {order} exceeds max order {}", self.max_order);
            return Err(AllocError::OutOfMemory);
        }

        let order = order.max(self.min_order);

        let (idx, target) = (order..=self.max_order)
            .find_map(|o| self.find_eligible(o, order, ty))
            .ok_or_else(|| {
                log::debug!("buddy: no free block for order {order} ({ty:?})");
                AllocError::OutOfMemory
            })?;

        // Every split consumes one table slot.
        let splits = (self.blocks[idx].order - order) as usize;
        if splits > self.num_vacant + (BLOCKS - self.len) {
            return Err(AllocError::CapacityExceeded);
        }

        self.free_list_remove(idx);

        while self.blocks[idx].order > order {
            let block = self.blocks[idx];
            let half_order = block.order - 1;
            let half = 1_usize << half_order;
            let lower = block.start_page;
            let upper = lower + half;

            // Keep the half containing the target; free the other one.
            let (kept, freed) = if target >= upper {
                (upper, lower)
            } else {
                (lower, upper)
            };

            log::trace!("buddy: split page {lower:#x} order {}", block.order);

            let entry = &mut self.blocks[idx];
            entry.order = half_order;
            entry.start_page = kept;
            entry.count = half;

            // Checked above.
            let new_idx = self.take_slot().ok_or(AllocError::CapacityExceeded)?;
            self.blocks[new_idx] = Block {
                order: half_order,
                status: BlockStatus::Free,
                alloc_type: AllocType::Any,
                start_page: freed,
                count: half,
                prev: None,
                next: None,
            };
            self.total_blocks += 1;
            self.free_blocks += 1;
            self.free_list_push(new_idx);
        }

        let block = &mut self.blocks[idx];
        block.status = BlockStatus::Used;
        block.alloc_type = ty;
        self.free_blocks -= 1;

        Ok(block.start_page)
    }

    /// Frees the block starting at `page`.
    ///
    /// `order` is advisory: the order recorded when the block was allocated
    /// is authoritative. The freed block is coalesced with its buddy as long
    /// as the buddy is free and of the same order.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NotFound`] if no allocated block starts at
    /// `page`, or [`AllocError::InvalidParameters`] if the allocator is
    /// uninitialized.
    pub fn free(&mut self, page: usize, order: u32) -> Result<(), AllocError> {
        if !self.initialized {
            return Err(AllocError::InvalidParameters);
        }

        let mut idx = self
            .find(|b| b.status == BlockStatus::Used && b.start_page == page)
            .ok_or(AllocError::NotFound)?;

        if self.blocks[idx].order != order {
            log::debug!(
                "buddy: page {page:#x} freed as order {order}, allocated as order {}",
                self.blocks[idx].order
            );
        }

        let block = &mut self.blocks[idx];
        block.status = BlockStatus::Free;
        block.alloc_type = AllocType::Any;
        self.free_blocks += 1;

        while self.blocks[idx].order < self.max_order {
            let block = self.blocks[idx];
            let rel = block.start_page - self.base_page;
            let buddy_page = self.base_page + (rel ^ block.count);

            let Some(buddy_idx) = self.find(|b| {
                b.status == BlockStatus::Free
                    && b.start_page == buddy_page
                    && b.order == block.order
            }) else {
                break;
            };

            log::trace!(
                "buddy: merge pages {:#x} and {buddy_page:#x} at order {}",
                block.start_page,
                block.order
            );

            self.free_list_remove(buddy_idx);

            // The lower-addressed entry survives.
            let (survivor, absorbed) = if buddy_page < block.start_page {
                (buddy_idx, idx)
            } else {
                (idx, buddy_idx)
            };

            let merged = &mut self.blocks[survivor];
            merged.order += 1;
            merged.count *= 2;
            merged.start_page = merged.start_page.min(buddy_page);

            self.release_slot(absorbed);
            self.free_blocks -= 1;
            self.total_blocks -= 1;

            idx = survivor;
        }

        self.free_list_push(idx);

        Ok(())
    }

    /// Returns a snapshot of page usage.
    ///
    /// This scans the whole block table.
    pub fn stats(&self) -> BuddyStats {
        let pages_with = |status| {
            self.blocks()
                .filter(|b| b.status == status)
                .map(|b| b.count)
                .sum::<usize>()
        };

        BuddyStats {
            free_pages: pages_with(BlockStatus::Free),
            used_pages: pages_with(BlockStatus::Used),
            total_pages: self.total_pages,
            free_blocks: self.free_blocks,
            total_blocks: self.total_blocks,
        }
    }

    /// Walks the free list for `order` looking for a block which can be split
    /// into a block of `target_order` inside the zone for `ty`.
    ///
    /// Returns the table index and the first page of the eventual block.
    fn find_eligible(&self, order: u32, target_order: u32, ty: AllocType) -> Option<(usize, usize)> {
        let mut cur = self.free_lists[order as usize];

        while let Some(idx) = cur {
            if let Some(target) = self.target_in(&self.blocks[idx], target_order, ty) {
                return Some((idx, target));
            }
            cur = self.blocks[idx].next;
        }

        None
    }

    /// Returns the first page of the lowest aligned `2^order`-page sub-block
    /// of `block` which lies entirely in the zone for `ty`.
    fn target_in(&self, block: &Block, order: u32, ty: AllocType) -> Option<usize> {
        let size = 1_usize << order;
        let (zone_start, zone_end) = match ty {
            AllocType::Any => (0, self.total_pages),
            AllocType::Kernel => (0, self.kernel_reserved_pages),
            AllocType::General => (self.kernel_reserved_pages, self.total_pages),
        };

        let start = block.start_page - self.base_page;
        let end = start + block.count;

        let target = start.max(zone_start.next_multiple_of(size));
        (target + size <= end.min(zone_end)).then_some(self.base_page + target)
    }

    fn find(&self, pred: impl Fn(&Block) -> bool) -> Option<usize> {
        self.blocks[..self.len].iter().position(pred)
    }

    /// Takes a vacant table entry, or appends a new one.
    fn take_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.vacant {
            self.vacant = self.blocks[idx].next;
            self.num_vacant -= 1;
            self.blocks[idx] = Block::VACANT;
            return Some(idx);
        }

        (self.len < BLOCKS).then(|| {
            self.len += 1;
            self.len - 1
        })
    }

    fn release_slot(&mut self, idx: usize) {
        self.blocks[idx] = Block {
            next: self.vacant,
            ..Block::VACANT
        };
        self.vacant = Some(idx);
        self.num_vacant += 1;
    }

    fn free_list_push(&mut self, idx: usize) {
        let order = self.blocks[idx].order as usize;
        let old_head = self.free_lists[order];

        debug_assert_eq!(self.blocks[idx].status, BlockStatus::Free);
        debug_assert_eq!(
            (self.blocks[idx].start_page - self.base_page) % self.blocks[idx].count,
            0,
            "misaligned free block"
        );

        if let Some(h) = old_head {
            self.blocks[h].prev = Some(idx);
        }

        let block = &mut self.blocks[idx];
        block.prev = None;
        block.next = old_head;
        self.free_lists[order] = Some(idx);
    }

    fn free_list_remove(&mut self, idx: usize) {
        let Block {
            order, prev, next, ..
        } = self.blocks[idx];

        match prev {
            Some(p) => self.blocks[p].next = next,
            None => self.free_lists[order as usize] = next,
        }

        if let Some(n) = next {
            self.blocks[n].prev = prev;
        }

        let block = &mut self.blocks[idx];
        block.prev = None;
        block.next = None;
    }
}

impl<const BLOCKS: usize> Default for BuddySystem<BLOCKS> {
    fn default() -> Self {
        BuddySystem::new()
    }
}

impl<const BLOCKS: usize> fmt::Debug for BuddySystem<BLOCKS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddySystem")
            .field("base_page", &self.base_page)
            .field("total_pages", &self.total_pages)
            .field("min_order", &self.min_order)
            .field("max_order", &self.max_order)
            .field("total_blocks", &self.total_blocks)
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

/// A [`BuddySystem`] behind a spinlock.
///
/// Every operation holds the lock for its whole duration.
pub struct LockedBuddy<const BLOCKS: usize> {
    inner: Mutex<BuddySystem<BLOCKS>>,
}

impl<const BLOCKS: usize> LockedBuddy<BLOCKS> {
    /// Constructs an uninitialized, locked buddy system.
    pub const fn new() -> LockedBuddy<BLOCKS> {
        LockedBuddy {
            inner: Mutex::new(BuddySystem::new()),
        }
    }

    /// Constructs and initializes a locked buddy system.
    ///
    /// # Errors
    ///
    /// See [`BuddySystem::init`].
    pub fn try_new(config: BuddyConfig) -> Result<LockedBuddy<BLOCKS>, AllocError> {
        let buddy = LockedBuddy::new();
        buddy.init(config)?;
        Ok(buddy)
    }

    /// Acquires the lock.
    pub fn lock(&self) -> MutexGuard<'_, BuddySystem<BLOCKS>> {
        self.inner.lock()
    }

    /// See [`BuddySystem::init`].
    pub fn init(&self, config: BuddyConfig) -> Result<(), AllocError> {
        self.lock().init(config)
    }

    /// See [`BuddySystem::alloc`].
    pub fn alloc(&self, order: u32) -> Result<usize, AllocError> {
        self.lock().alloc(order)
    }

    /// See [`BuddySystem::alloc_type`].
    pub fn alloc_type(&self, order: u32, ty: AllocType) -> Result<usize, AllocError> {
        self.lock().alloc_type(order, ty)
    }

    /// See [`BuddySystem::free`].
    pub fn free(&self, page: usize, order: u32) -> Result<(), AllocError> {
        self.lock().free(page, order)
    }

    /// See [`BuddySystem::stats`].
    pub fn stats(&self) -> BuddyStats {
        self.lock().stats()
    }
}

impl<const BLOCKS: usize> Default for LockedBuddy<BLOCKS> {
    fn default() -> Self {
        LockedBuddy::new()
    }
}

impl<const BLOCKS: usize> fmt::Debug for LockedBuddy<BLOCKS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f.debug_tuple("LockedBuddy").field(&*inner).finish(),
            None => f.write_str("LockedBuddy(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    type Buddy = BuddySystem<64>;

    fn eight_pages() -> Buddy {
        Buddy::try_new(BuddyConfig::new(0, 8).with_orders(0, 3)).unwrap()
    }

    #[test]
    fn init_is_idempotent() {
        let config = BuddyConfig::new(16, 12).with_orders(0, 5);

        for _ in 0..2 {
            let buddy = Buddy::try_new(config).unwrap();
            let blocks: Vec<_> = buddy.blocks().collect();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].order(), 3);
            assert_eq!(blocks[0].start_page(), 16);
            assert_eq!(blocks[0].status(), BlockStatus::Free);
            assert_eq!(buddy.stats().used_pages, 0);
            assert_eq!(buddy.stats().free_pages, 8);
        }
    }

    #[test]
    fn reinit_discards_state() {
        let mut buddy = eight_pages();
        buddy.alloc(0).unwrap();
        buddy.init(BuddyConfig::new(0, 8).with_orders(0, 3)).unwrap();
        assert_eq!(buddy.stats().free_pages, 8);
        assert_eq!(buddy.blocks().count(), 1);
    }

    #[test]
    fn init_rejects_bad_bounds() {
        let bad = [
            BuddyConfig::new(0, 8).with_orders(0, MAX_ORDER + 1),
            BuddyConfig::new(0, 8).with_orders(3, 2),
            BuddyConfig::new(0, 0),
            // min_order no longer fits once max_order shrinks to 2.
            BuddyConfig::new(0, 4).with_orders(3, 5),
            BuddyConfig::new(0, 8).with_kernel_reserved(9),
        ];

        for config in bad {
            assert_eq!(
                Buddy::try_new(config).unwrap_err(),
                AllocError::InvalidParameters,
                "{config:?}"
            );
        }
    }

    #[test]
    fn init_rejects_oversized_table() {
        let err = BuddySystem::<8>::try_new(BuddyConfig::new(0, 8).with_orders(0, 3));
        assert_eq!(err.unwrap_err(), AllocError::CapacityExceeded);
    }

    #[test]
    fn uninitialized_rejects_everything() {
        let mut buddy = Buddy::new();
        assert_eq!(buddy.alloc(0), Err(AllocError::InvalidParameters));
        assert_eq!(buddy.free(0, 0), Err(AllocError::InvalidParameters));
    }

    #[test]
    fn split_roundtrip() {
        let mut buddy = eight_pages();

        let pages: Vec<_> = (0..4).map(|_| buddy.alloc(0).unwrap()).collect();
        assert_eq!(buddy.stats().used_pages, 4);

        for (i, page) in pages.into_iter().enumerate() {
            // The order passed to free is advisory.
            buddy.free(page, i as u32).unwrap();
        }

        let stats = buddy.stats();
        assert_eq!(stats.free_pages, 8);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(buddy.free_list_len(3), 1);
    }

    #[test]
    fn buddies_merge_to_lower_page() {
        let mut buddy = eight_pages();

        let a = buddy.alloc(0).unwrap();
        let b = buddy.alloc(0).unwrap();
        assert_eq!(a ^ 1, b);

        buddy.free(b, 0).unwrap();
        buddy.free(a, 0).unwrap();

        assert_eq!(buddy.alloc(1).unwrap(), a.min(b));
    }

    #[test]
    fn split_pushes_upper_halves() {
        let mut buddy = eight_pages();

        assert_eq!(buddy.alloc(0).unwrap(), 0);
        assert_eq!(buddy.free_list_len(0), 1);
        assert_eq!(buddy.free_list_len(1), 1);
        assert_eq!(buddy.free_list_len(2), 1);
        assert_eq!(buddy.free_list_len(3), 0);

        let stats = buddy.stats();
        assert_eq!(stats.free_blocks, 3);
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.used_pages, 1);
        assert_eq!(stats.free_pages, 7);
    }

    #[test]
    fn stats_match_the_table() {
        let mut buddy = BuddySystem::<64>::try_new(BuddyConfig::new(0, 32)).unwrap();
        let a = buddy.alloc(2).unwrap();
        let b = buddy.alloc(0).unwrap();
        let c = buddy.alloc(3).unwrap();

        let used = |buddy: &BuddySystem<64>| {
            buddy
                .blocks()
                .filter(|blk| blk.status() == BlockStatus::Used)
                .map(|blk| blk.count())
                .sum::<usize>()
        };
        let free_listed = |buddy: &BuddySystem<64>| {
            (0..=buddy.max_order())
                .map(|o| buddy.free_list_len(o))
                .sum::<usize>()
        };

        let stats = buddy.stats();
        assert_eq!(stats.used_pages, 4 + 1 + 8);
        assert_eq!(stats.used_pages, used(&buddy));
        assert_eq!(stats.free_blocks, free_listed(&buddy));
        assert_eq!(stats.free_pages + stats.used_pages, stats.total_pages);

        buddy.free(b, 0).unwrap();
        buddy.free(c, 3).unwrap();

        let stats = buddy.stats();
        assert_eq!(stats.used_pages, 4);
        assert_eq!(stats.free_blocks, free_listed(&buddy));
        assert_eq!(stats.total_blocks, buddy.blocks().count());

        buddy.free(a, 2).unwrap();
        assert_eq!(buddy.stats().free_blocks, 1);
    }

    #[test]
    fn free_unknown_page_is_not_found() {
        let mut buddy = eight_pages();
        let page = buddy.alloc(1).unwrap();

        assert_eq!(buddy.free(page + 1, 0), Err(AllocError::NotFound));
        buddy.free(page, 1).unwrap();
        assert_eq!(buddy.free(page, 1), Err(AllocError::NotFound));
    }

    #[test]
    fn out_of_memory() {
        let mut buddy = eight_pages();

        assert_eq!(buddy.alloc(4), Err(AllocError::OutOfMemory));

        let whole = buddy.alloc(3).unwrap();
        assert_eq!(buddy.alloc(0), Err(AllocError::OutOfMemory));
        buddy.free(whole, 3).unwrap();
        assert_eq!(buddy.stats().free_pages, 8);
    }

    #[test]
    fn min_order_rounds_up() {
        let mut buddy = Buddy::try_new(BuddyConfig::new(0, 8).with_orders(1, 3)).unwrap();

        buddy.alloc(0).unwrap();
        assert_eq!(buddy.stats().used_pages, 2);
    }

    #[test]
    fn unaligned_base_page() {
        let mut buddy = Buddy::try_new(BuddyConfig::new(5, 8).with_orders(0, 3)).unwrap();

        let a = buddy.alloc(1).unwrap();
        let b = buddy.alloc(1).unwrap();
        assert_eq!((a, b), (5, 7));

        buddy.free(a, 1).unwrap();
        buddy.free(b, 1).unwrap();
        assert_eq!(buddy.alloc(3).unwrap(), 5);
    }

    #[test]
    fn kernel_and_general_zones() {
        let config = BuddyConfig::new(0, 16)
            .with_orders(0, 4)
            .with_kernel_reserved(4);
        let mut buddy = Buddy::try_new(config).unwrap();

        let general = buddy.alloc_type(0, AllocType::General).unwrap();
        assert!(general >= 4);

        let kernel: Vec<_> = (0..4)
            .map(|_| buddy.alloc_type(0, AllocType::Kernel).unwrap())
            .collect();
        assert!(kernel.iter().all(|&p| p < 4));
        assert_eq!(
            buddy.alloc_type(0, AllocType::Kernel),
            Err(AllocError::OutOfMemory)
        );

        let upper = buddy.alloc_type(3, AllocType::General).unwrap();
        assert_eq!(upper, 8);

        let used: Vec<_> = buddy
            .blocks()
            .filter(|b| b.status() == BlockStatus::Used)
            .map(|b| b.alloc_type())
            .collect();
        assert_eq!(used.iter().filter(|&&t| t == AllocType::Kernel).count(), 4);
        assert_eq!(used.iter().filter(|&&t| t == AllocType::General).count(), 2);

        for page in kernel {
            buddy.free(page, 0).unwrap();
        }
        buddy.free(general, 0).unwrap();
        buddy.free(upper, 3).unwrap();
        assert_eq!(buddy.stats().free_pages, 16);

        // A general block may never straddle the reserved zone.
        assert_eq!(
            buddy.alloc_type(4, AllocType::General),
            Err(AllocError::OutOfMemory)
        );
        assert_eq!(buddy.alloc(4).unwrap(), 0);
    }

    #[test]
    fn no_reserved_zone_means_no_kernel_pages() {
        let mut buddy = eight_pages();
        assert_eq!(
            buddy.alloc_type(0, AllocType::Kernel),
            Err(AllocError::OutOfMemory)
        );
        assert!(buddy.alloc_type(0, AllocType::General).is_ok());
    }

    #[test]
    fn table_slots_are_reused() {
        let mut buddy = eight_pages();

        for _ in 0..100 {
            let pages: Vec<_> = (0..8).map(|_| buddy.alloc(0).unwrap()).collect();
            for page in pages.into_iter().rev() {
                buddy.free(page, 0).unwrap();
            }
        }

        assert_eq!(buddy.blocks().count(), 1);
        assert!(buddy.len <= 8);
    }

    #[test]
    fn conservation_over_mixed_orders() {
        let mut buddy = BuddySystem::<256>::try_new(BuddyConfig::new(0, 128)).unwrap();
        let mut live = vec![];

        for order in [0, 3, 1, 2, 0, 4, 0, 1] {
            let page = buddy.alloc(order).unwrap();
            live.push((page, order));
            let stats = buddy.stats();
            assert_eq!(stats.free_pages + stats.used_pages, stats.total_pages);
        }

        while let Some((page, order)) = live.pop() {
            buddy.free(page, order).unwrap();
            let stats = buddy.stats();
            assert_eq!(stats.free_pages + stats.used_pages, 128);
        }

        assert_eq!(buddy.stats().free_pages, 128);
        assert_eq!(buddy.blocks().count(), 1);
    }

    #[test]
    fn pages_to_order_rounds_up() {
        assert_eq!(pages_to_order(0), 0);
        assert_eq!(pages_to_order(1), 0);
        assert_eq!(pages_to_order(2), 1);
        assert_eq!(pages_to_order(3), 2);
        assert_eq!(pages_to_order(4), 2);
        assert_eq!(pages_to_order(5), 3);
    }

    #[test]
    fn large_static_table_initializes_on_a_small_stack() {
        static BIG: LockedBuddy<16384> = LockedBuddy::new();

        let handle = std::thread::Builder::new()
            .stack_size(128 * 1024)
            .spawn(|| {
                BIG.init(BuddyConfig::new(0, 16000)).unwrap();
                let page = BIG.alloc(0).unwrap();
                BIG.init(BuddyConfig::new(0, 16000)).unwrap();
                assert_eq!(BIG.lock().blocks().count(), 1);
                page
            })
            .unwrap();

        assert_eq!(handle.join().unwrap(), 0);
        assert_eq!(BIG.stats().free_pages, 8192);
    }

    #[test]
    fn locked_buddy_is_shared_between_threads() {
        let buddy = LockedBuddy::<512>::try_new(BuddyConfig::new(0, 256)).unwrap();

        std::thread::scope(|s| {
            for t in 0..4_u32 {
                let buddy = &buddy;
                s.spawn(move || {
                    for i in 0..200_u32 {
                        let order = (t + i) % 4;
                        let page = buddy.alloc(order).unwrap();
                        assert_eq!(page % (1 << order), 0);
                        buddy.free(page, order).unwrap();
                    }
                });
            }
        });

        let stats = buddy.stats();
        assert_eq!(stats.used_pages, 0);
        assert_eq!(stats.free_pages, 256);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn locked_buddy_delegates() {
        let buddy = LockedBuddy::<64>::try_new(BuddyConfig::new(0, 8)).unwrap();
        let page = buddy.alloc_type(1, AllocType::Any).unwrap();
        assert_eq!(buddy.stats().used_pages, 2);
        buddy.free(page, 1).unwrap();
        assert_eq!(buddy.stats().used_pages, 0);
    }
}
