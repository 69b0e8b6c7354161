//! Kernel memory allocators.
//!
//! This crate provides the memory-allocation core of a freestanding kernel:
//!
//! - [`BuddySystem`], a page-granular binary-buddy allocator over physical
//!   page numbers,
//! - [`SlabCache`], an object-cache allocator which carves buddy pages into
//!   fixed-size slots,
//! - [`Kmem`], a size-class router exposing `kmalloc`/`kfree` on top of both.
//!
//! None of the allocators needs a heap to bootstrap itself: all bookkeeping is
//! either statically sized or stored inside the pages being managed.

#![doc(html_root_url = "https://docs.rs/kmem/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
pub mod kmalloc;
pub mod phys;
pub mod slab;

#[cfg(feature = "sptr")]
mod polyfill;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    base::BasePtr,
    buddy::{AllocType, BuddyConfig, BuddyStats, BuddySystem, LockedBuddy, MAX_ORDER},
    kmalloc::{Kmem, SIZE_CLASSES},
    phys::{PhysMap, PAGE_SIZE},
    slab::{CacheFlags, CachePool, CacheStats, PageSource, SlabCache, MAX_CACHES},
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory for the managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidParameters,

    /// The configuration would not fit in the allocator's static capacity.
    CapacityExceeded,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidParameters => f.write_str("invalid allocator parameters"),
            AllocInitError::CapacityExceeded => f.write_str("allocator capacity exceeded"),
        }
    }
}

impl From<AllocError> for AllocInitError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::CapacityExceeded => AllocInitError::CapacityExceeded,
            _ => AllocInitError::InvalidParameters,
        }
    }
}

/// Indicates an allocation or deallocation failure.
///
/// None of these conditions is fatal; the allocator is left unchanged.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The arguments are out of bounds or the allocator is uninitialized.
    InvalidParameters,
    /// A statically sized table or pool is exhausted.
    CapacityExceeded,
    /// No eligible block or slab could satisfy the request.
    OutOfMemory,
    /// The address or page being freed is not a live allocation.
    NotFound,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParameters => "invalid parameters",
            AllocError::CapacityExceeded => "capacity exceeded",
            AllocError::OutOfMemory => "out of memory",
            AllocError::NotFound => "allocation not found",
        };

        f.write_str(msg)
    }
}

/// Types which provide the memory backing a [`PhysMap`].
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that the window is not backed by another
///   allocator. This is the case for a kernel's direct physical mapping.
/// - The `Global` marker type indicates that the window is backed by the
///   global allocator. The window frees its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a window is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
