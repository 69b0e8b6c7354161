use core::{num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

/// A pointer to the base of a region of memory managed by an allocator.
///
/// Links stored inside managed memory hold plain addresses rather than
/// pointers, so that no borrow is implied between blocks. Any actual pointer
/// into the region must be derived from a `BasePtr` with [`with_addr`], which
/// gives it the provenance of the whole region.
///
/// [`with_addr`]: BasePtr::with_addr
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region overflows the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the number of bytes covered by the region.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the first address past the end of the region.
    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Checked at construction.
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    /// Returns `true` if `addr` lies inside the region.
    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from the base to `addr`.
    ///
    /// Returns `None` if `addr` is below the base.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        addr.get().checked_sub(self.ptr.addr().get())
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    /// Creates a new pointer with the given offset from the base.
    ///
    /// Returns `None` if the offset lies outside the region.
    #[inline]
    pub fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.extent {
            return None;
        }

        let raw = self.ptr.addr().get().checked_add(offset)?;
        let addr = NonZeroUsize::new(raw)?;

        Some(self.ptr.with_addr(addr))
    }

    /// Returns a mutable reference to the `T` stored at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `T` values.
    /// - The memory at `addr` must contain a properly initialized `T` value.
    /// - The memory at `addr` must be within the provenance of `self`, and no
    ///   other reference to it may be live.
    #[inline]
    pub(crate) unsafe fn get_mut<'a, T>(self, addr: NonZeroUsize) -> &'a mut T {
        debug_assert!(self.contains_addr(addr));
        debug_assert_eq!(addr.get() % core::mem::align_of::<T>(), 0);

        unsafe { self.with_addr(addr).cast::<T>().as_mut() }
    }

    /// Writes `value` to `addr` without reading the old contents.
    ///
    /// # Safety
    ///
    /// `addr` must be a properly aligned address for `T` values, and the
    /// memory at `addr` must be within the provenance of `self` and valid for
    /// writes for `size_of::<T>()` bytes.
    #[inline]
    pub(crate) unsafe fn write<T>(self, addr: NonZeroUsize, value: T) {
        debug_assert!(self.contains_addr(addr));

        unsafe { self.with_addr(addr).cast::<T>().as_ptr().write(value) };
    }

    /// Returns a mutable reference to the `DoubleBlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// See [`BasePtr::get_mut`].
    #[inline]
    pub(crate) unsafe fn double_link_mut<'a>(self, link: NonZeroUsize) -> &'a mut DoubleBlockLink {
        let link = unsafe { self.get_mut::<DoubleBlockLink>(link) };

        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        link
    }
}

/// A double link in a linked list of blocks of memory.
///
/// This type is meant to be embedded at the start of the block itself,
/// forming an intrusive doubly linked list.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct DoubleBlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}

/// The head of an intrusive list of blocks linked through a
/// [`DoubleBlockLink`] at the start of each block.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BlockList {
    head: Option<NonZeroUsize>,
    len: usize,
}

impl BlockList {
    pub const fn new() -> BlockList {
        BlockList { head: None, len: 0 }
    }

    #[inline]
    pub fn head(&self) -> Option<NonZeroUsize> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes `block` onto the front of the list.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a `DoubleBlockLink` within the
    /// provenance of `base` which is not currently on any list.
    pub unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        if let Some(old_head) = self.head {
            unsafe { base.double_link_mut(old_head).prev = Some(block) };
        }

        let link = unsafe { base.double_link_mut(block) };
        link.prev = None;
        link.next = self.head;

        self.head = Some(block);
        self.len += 1;
    }

    /// Removes `block` from the list.
    ///
    /// # Safety
    ///
    /// `block` must be the address of an element of this list.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = *base.double_link_mut(block);

            match removed.prev {
                // Link `prev` forward to `next`.
                Some(p) => base.double_link_mut(p).next = removed.next,

                // If there's no previous block, then `block` is the head of
                // the list.
                None => {
                    debug_assert_eq!(self.head, Some(block));
                    self.head = removed.next;
                }
            }

            if let Some(n) = removed.next {
                // Link `next` back to `prev`.
                base.double_link_mut(n).prev = removed.prev;
            }

            *base.double_link_mut(block) = DoubleBlockLink::default();
        }

        self.len -= 1;
    }

    /// Removes and returns the first block of the list.
    ///
    /// # Safety
    ///
    /// Every element of the list must be within the provenance of `base`.
    pub unsafe fn pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;
        unsafe { self.remove(base, head) };
        Some(head)
    }
}
