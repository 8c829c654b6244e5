//! Frame numbers and page descriptors.

use core::fmt;

/// A physical frame number.
///
/// Frame numbers are dense integers starting at zero: frame `n` names the
/// `n`-th page-sized chunk of physical memory, and doubles as the index of
/// the page's descriptor in the kernel-supplied descriptor table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(usize);

impl Pfn {
    /// Creates a frame number from its raw index.
    #[inline]
    pub const fn new(raw: usize) -> Pfn {
        Pfn(raw)
    }

    /// Returns the raw index of this frame number.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pfn")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical page descriptor.
///
/// The kernel owns one descriptor per physical page, arranged in a single
/// table indexed by frame number and alive for the lifetime of the system.
/// The allocator's only addition to a descriptor is the link that threads it
/// into a free list while it is the head of a free block; the link carries no
/// meaning while the page is allocated, and a block's order is never stored
/// here.
#[derive(Clone, Debug)]
pub struct PageDescriptor {
    pub(crate) next_free: Option<Pfn>,
}

impl PageDescriptor {
    /// Creates a descriptor that is on no free list.
    pub const fn new() -> PageDescriptor {
        PageDescriptor { next_free: None }
    }
}

impl Default for PageDescriptor {
    fn default() -> PageDescriptor {
        PageDescriptor::new()
    }
}

/// The descriptor table, indexed by frame number.
///
/// All frame-number ↔ descriptor translation goes through this type. A frame
/// number outside the table means the free lists no longer describe physical
/// memory, which is not recoverable.
pub(crate) struct PageMap<'a> {
    pages: &'a mut [PageDescriptor],
}

impl<'a> PageMap<'a> {
    pub(crate) fn new(pages: &'a mut [PageDescriptor]) -> PageMap<'a> {
        PageMap { pages }
    }

    /// The number of pages in the table.
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    /// Reads the next-free link of the descriptor for `pfn`.
    pub(crate) fn next_free(&self, pfn: Pfn) -> Option<Pfn> {
        self.descriptor(pfn).next_free
    }

    /// Writes the next-free link of the descriptor for `pfn`.
    pub(crate) fn set_next_free(&mut self, pfn: Pfn, next: Option<Pfn>) {
        self.descriptor_mut(pfn).next_free = next;
    }

    fn descriptor(&self, pfn: Pfn) -> &PageDescriptor {
        match self.pages.get(pfn.get()) {
            Some(pgd) => pgd,
            None => panic!("frame {pfn} is outside the descriptor table"),
        }
    }

    fn descriptor_mut(&mut self, pfn: Pfn) -> &mut PageDescriptor {
        match self.pages.get_mut(pfn.get()) {
            Some(pgd) => pgd,
            None => panic!("frame {pfn} is outside the descriptor table"),
        }
    }
}
