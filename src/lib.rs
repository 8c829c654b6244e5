//! Buddy allocation of physical page frames.
//!
//! This crate implements the physical-memory side of a kernel's memory
//! manager: it tracks which fixed-size pages are free and serves requests
//! for power-of-two-sized contiguous blocks with low fragmentation, using
//! the classic binary-buddy scheme.
//!
//! The allocator works purely in terms of *frame numbers* and a
//! kernel-supplied table of [`PageDescriptor`]s; it never touches the memory
//! it manages, so it is `no_std`, allocation-free and contains no unsafe
//! code. Free-list links are descriptor-table indices rather than pointers.
//!
//! ```
//! use page_buddy::{BuddyAllocator, PageDescriptor, Pfn};
//!
//! // Eight pages, tracked in blocks of up to 2^3 pages.
//! let mut pages = vec![PageDescriptor::new(); 8];
//! let mut alloc = BuddyAllocator::<4>::new(&mut pages).unwrap();
//!
//! // Nothing is free until the kernel donates a range.
//! alloc.insert_page_range(Pfn::new(0), 8);
//!
//! let block = alloc.allocate_pages(1).unwrap();
//! assert_eq!(block, Pfn::new(0));
//!
//! alloc.free_pages(block, 1);
//! assert_eq!(alloc.available_pages(), 8);
//! ```
//!
//! Every operation runs to completion synchronously and the allocator holds
//! no interior locks; a preemptible kernel wraps the instance in whatever
//! mutual exclusion it already uses for its memory manager.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod buddy;
mod frame;

#[cfg(test)]
mod tests;

use core::fmt;

pub use crate::{
    buddy::{BuddyAllocator, MAX_ORDER, ORDER_COUNT},
    frame::{PageDescriptor, Pfn},
};

/// The error type returned when no sufficiently large free block exists.
///
/// Exhaustion is an ordinary, recoverable outcome, unlike the contract
/// violations the allocator panics on: the allocator's state is untouched
/// and the caller may retry once memory has been freed or reclaimed
/// elsewhere.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of physical memory")
    }
}

/// The error type for allocator constructors.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AllocInitError {
    /// The configuration of the allocator is impossible to satisfy.
    ///
    /// Returned when the descriptor table is empty, or when the order count
    /// is zero or wider than the frame-number space.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}
