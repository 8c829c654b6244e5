//! The buddy page allocator.
//!
//! Physical memory is tracked in blocks of `2^order` contiguous pages, where
//! a block's starting frame number is always a multiple of its size. Every
//! block of order `n < MAX_ORDER` has a unique *buddy*: the adjacent block
//! that merges with it to form a block of order `n + 1`. Free blocks live on
//! one address-ordered free list per order; allocation splits a larger block
//! down to the requested order one level at a time, and freeing eagerly
//! merges a block back up for as long as its buddy is also free, so
//! fragmentation is repaired on every free rather than on a schedule.

use core::{cmp, fmt};

use log::{debug, trace};

use crate::{
    frame::{PageDescriptor, PageMap, Pfn},
    AllocError, AllocInitError,
};

/// The largest block order supported by the default allocator configuration;
/// blocks span up to `2^MAX_ORDER` pages.
pub const MAX_ORDER: usize = 18;

/// The number of order-indexed free lists in the default allocator
/// configuration.
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// The number of pages in a block of the given order.
#[inline]
const fn pages_per_block(order: usize) -> usize {
    1 << order
}

/// A buddy allocator over a table of physical page descriptors.
///
/// `ORDERS` is the number of free lists the allocator maintains; the largest
/// block it tracks spans `2^(ORDERS - 1)` pages. The default is
/// [`ORDER_COUNT`], matching [`MAX_ORDER`].
///
/// The kernel supplies the descriptor table once, at construction; every
/// page starts out unavailable, and [`insert_page_range`] seeds the free
/// lists from the machine's memory map. The allocator never blocks or
/// yields, and takes `&mut self` everywhere: callers on preemptible or
/// multi-core systems must serialize all entry points externally.
///
/// [`insert_page_range`]: BuddyAllocator::insert_page_range
pub struct BuddyAllocator<'a, const ORDERS: usize = ORDER_COUNT> {
    /// Head of each order's free list, kept sorted by frame number.
    free_lists: [Option<Pfn>; ORDERS],
    pages: PageMap<'a>,
}

impl<'a, const ORDERS: usize> BuddyAllocator<'a, ORDERS> {
    /// Creates an allocator over `pages` with every page initially
    /// unavailable.
    ///
    /// Any free-list links left over in the descriptors are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the descriptor table is
    /// empty, or if `ORDERS` is zero or wider than the frame-number space.
    pub fn new(pages: &'a mut [PageDescriptor]) -> Result<Self, AllocInitError> {
        if ORDERS == 0 || ORDERS > usize::BITS as usize || pages.is_empty() {
            return Err(AllocInitError::InvalidConfig);
        }

        for pgd in pages.iter_mut() {
            pgd.next_free = None;
        }

        Ok(BuddyAllocator {
            free_lists: [None; ORDERS],
            pages: PageMap::new(pages),
        })
    }

    /// The largest block order this allocator tracks.
    #[inline]
    pub fn max_order(&self) -> usize {
        ORDERS - 1
    }

    /// The number of pages in the descriptor table.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Whether `pfn` may start a block of `order`.
    #[inline]
    fn is_aligned(pfn: Pfn, order: usize) -> bool {
        pfn.get() % pages_per_block(order) == 0
    }

    /// Returns the buddy of the `order` block starting at `pfn`, or `None`
    /// when the block is of the top order and has no buddy.
    ///
    /// Of two adjacent blocks of one order, exactly one starts on the
    /// boundary of the order above, so flipping the order bit of the frame
    /// number yields the other member of the pair: the next block over when
    /// `pfn` is aligned to `order + 1`, the previous one otherwise.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not aligned for `order`; a misaligned block start
    /// here means the caller's accounting is already wrong.
    fn buddy_of(&self, pfn: Pfn, order: usize) -> Option<Pfn> {
        assert!(
            Self::is_aligned(pfn, order),
            "frame {pfn} is not aligned for order {order}"
        );

        if order >= self.max_order() {
            return None;
        }

        Some(Pfn::new(pfn.get() ^ pages_per_block(order)))
    }

    /// Links the `order` block starting at `pfn` into the order's free list,
    /// keeping the list sorted by frame number.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is misaligned for `order` or already on the list; the
    /// latter is how a double free surfaces.
    fn insert_block(&mut self, pfn: Pfn, order: usize) {
        assert!(
            Self::is_aligned(pfn, order),
            "frame {pfn} is not aligned for order {order}"
        );

        // Walk to the first entry with a higher frame number, remembering
        // the predecessor so the block can be linked in between.
        let mut prev = None;
        let mut cur = self.free_lists[order];
        while let Some(head) = cur {
            assert!(
                head != pfn,
                "frame {pfn} is already on the order-{order} free list"
            );
            if pfn < head {
                break;
            }
            prev = Some(head);
            cur = self.pages.next_free(head);
        }

        self.pages.set_next_free(pfn, cur);
        match prev {
            Some(p) => self.pages.set_next_free(p, Some(pfn)),
            None => self.free_lists[order] = Some(pfn),
        }
    }

    /// Unlinks the `order` block starting at `pfn` from the order's free
    /// list.
    ///
    /// # Panics
    ///
    /// Panics if the block is not on the list. Absence means the free lists
    /// have diverged from physical memory, and carrying on would silently
    /// corrupt the allocator's accounting.
    fn remove_block(&mut self, pfn: Pfn, order: usize) {
        let mut prev = None;
        let mut cur = self.free_lists[order];
        while let Some(head) = cur {
            if head == pfn {
                let next = self.pages.next_free(head);
                match prev {
                    Some(p) => self.pages.set_next_free(p, next),
                    None => self.free_lists[order] = next,
                }
                self.pages.set_next_free(pfn, None);
                return;
            }
            prev = Some(head);
            cur = self.pages.next_free(head);
        }

        panic!("frame {pfn} is not on the order-{order} free list");
    }

    /// Whether the `order` block starting at `pfn` is currently free.
    fn is_free_block(&self, pfn: Pfn, order: usize) -> bool {
        let mut cur = self.free_lists[order];
        while let Some(head) = cur {
            if head == pfn {
                return true;
            }
            if head > pfn {
                // The list is sorted; no later entry can match.
                return false;
            }
            cur = self.pages.next_free(head);
        }
        false
    }

    /// Splits a free `order` block into its two `order - 1` halves, moving
    /// both onto the lower order's free list, and returns the left half.
    ///
    /// The left half keeps the block's starting frame; the right half starts
    /// `2^(order - 1)` pages later.
    fn split_block(&mut self, pfn: Pfn, order: usize) -> Pfn {
        assert!(order > 0, "cannot split an order-0 block");

        let half = order - 1;
        let right = Pfn::new(pfn.get() + pages_per_block(half));

        self.remove_block(pfn, order);
        self.insert_block(pfn, half);
        self.insert_block(right, half);

        pfn
    }

    /// Merges a free `order` block with its buddy into a single block of the
    /// order above, and returns the merged block's starting frame.
    ///
    /// The buddy must itself be free at `order`; callers check with
    /// [`is_free_block`](Self::is_free_block) before merging.
    fn merge_block(&mut self, pfn: Pfn, order: usize) -> Pfn {
        let buddy = self
            .buddy_of(pfn, order)
            .expect("no order above the top to merge into");

        self.remove_block(pfn, order);
        self.remove_block(buddy, order);

        let merged = cmp::min(pfn, buddy);
        self.insert_block(merged, order + 1);
        merged
    }

    /// Repeatedly merges the free block at `pfn` upward for as long as its
    /// buddy at the current order is also free, and returns the final block
    /// and order.
    fn coalesce(&mut self, pfn: Pfn, order: usize) -> (Pfn, usize) {
        let (mut pfn, mut order) = (pfn, order);

        while let Some(buddy) = self.buddy_of(pfn, order) {
            if !self.is_free_block(buddy, order) {
                break;
            }
            pfn = self.merge_block(pfn, order);
            order += 1;
        }

        (pfn, order)
    }

    /// Allocates a block of `2^order` contiguous pages.
    ///
    /// The returned frame starts a block that sits on no free list until it
    /// is handed back through [`free_pages`](Self::free_pages). Requests are
    /// all-or-nothing: the block is exactly the requested order, carved out
    /// of the smallest sufficiently large free block by repeated splitting.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when no free block of `order` or above exists.
    /// The allocator is left unchanged and the caller may retry once memory
    /// has been freed elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if `order` exceeds [`max_order`](Self::max_order).
    pub fn allocate_pages(&mut self, order: usize) -> Result<Pfn, AllocError> {
        assert!(
            order < ORDERS,
            "order {order} exceeds the maximum order {}",
            ORDERS - 1
        );

        let source = (order..ORDERS)
            .find(|&o| self.free_lists[o].is_some())
            .ok_or(AllocError)?;

        // Walk the found block down to the requested order, one split per
        // level. The left half keeps the address, so the allocation comes
        // from the lowest frames of the source block.
        let mut block = self.free_lists[source].expect("source order has a free block");
        for o in (order + 1..=source).rev() {
            block = self.split_block(block, o);
        }

        self.remove_block(block, order);
        trace!("allocate_pages: order={order} -> frame {block}");

        Ok(block)
    }

    /// Frees the block of `2^order` pages starting at `pfn`.
    ///
    /// The block is put back on its order's free list and immediately
    /// coalesced with any chain of free buddies, restoring the largest
    /// blocks reachable from it.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is misaligned for `order`, if `order` exceeds
    /// [`max_order`](Self::max_order), or if the block is already free.
    /// Freeing a block that was never allocated corrupts the accounting and
    /// is not detected beyond those checks.
    pub fn free_pages(&mut self, pfn: Pfn, order: usize) {
        assert!(
            order < ORDERS,
            "order {order} exceeds the maximum order {}",
            ORDERS - 1
        );
        assert!(
            Self::is_aligned(pfn, order),
            "frame {pfn} is not aligned for order {order}"
        );

        trace!("free_pages: frame {pfn} order={order}");
        self.insert_block(pfn, order);
        self.coalesce(pfn, order);
    }

    /// Marks the `count` pages starting at `start` as available for
    /// allocation.
    ///
    /// The range is covered by the fewest, largest correctly aligned blocks:
    /// each step inserts the biggest block permitted by the cursor's
    /// alignment and the pages remaining, so exactly `[start, start + count)`
    /// becomes free and nothing outside it. Typically called at boot, once
    /// per usable region of the memory map.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the descriptor table, or if part of
    /// the range is already free.
    pub fn insert_page_range(&mut self, start: Pfn, count: usize) {
        assert!(
            start
                .get()
                .checked_add(count)
                .is_some_and(|end| end <= self.pages.len()),
            "page range {start}+{count} extends past the descriptor table"
        );

        debug!("insert_page_range: start={start} count={count}");

        let mut pfn = start;
        let mut remaining = count;
        while remaining > 0 {
            let align_order = cmp::min(pfn.get().trailing_zeros() as usize, self.max_order());
            let fit_order = cmp::min(remaining.ilog2() as usize, self.max_order());
            let order = cmp::min(align_order, fit_order);

            self.insert_block(pfn, order);
            pfn = Pfn::new(pfn.get() + pages_per_block(order));
            remaining -= pages_per_block(order);
        }
    }

    /// Marks the `count` pages starting at `start` as unavailable, carving
    /// them out of whatever free blocks currently contain them.
    ///
    /// Used to reserve fixed regions (firmware tables, the kernel image)
    /// after the surrounding memory has already been made available. The
    /// removed pages will never be handed out until they are re-inserted.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is not currently inside a free block:
    /// that page is either allocated or was never inserted, and in both
    /// cases the request cannot be honored without corrupting the
    /// accounting.
    pub fn remove_page_range(&mut self, start: Pfn, count: usize) {
        debug!("remove_page_range: start={start} count={count}");

        for idx in 0..count {
            self.remove_page(Pfn::new(start.get() + idx));
        }
    }

    /// Isolates `target` as an order-0 block and unlinks it.
    fn remove_page(&mut self, target: Pfn) {
        let (mut block, mut order) = self
            .find_containing_block(target)
            .unwrap_or_else(|| panic!("frame {target} is not in any free block"));

        // Split the containing block down until the target page stands
        // alone, descending into whichever half still holds it.
        while order > 0 {
            let left = self.split_block(block, order);
            order -= 1;

            let right = Pfn::new(left.get() + pages_per_block(order));
            block = if target >= right { right } else { left };
        }

        self.remove_block(target, 0);
    }

    /// Finds the free block containing `target`, scanning orders from the
    /// smallest up.
    fn find_containing_block(&self, target: Pfn) -> Option<(Pfn, usize)> {
        for order in 0..ORDERS {
            let mut cur = self.free_lists[order];
            while let Some(head) = cur {
                if head > target {
                    // The list is sorted; no later block can contain it.
                    break;
                }
                if target.get() < head.get() + pages_per_block(order) {
                    return Some((head, order));
                }
                cur = self.pages.next_free(head);
            }
        }
        None
    }

    /// Whether the page `pfn` currently lies inside any free block.
    pub fn is_free(&self, pfn: Pfn) -> bool {
        self.find_containing_block(pfn).is_some()
    }

    /// The total number of pages currently free, across all orders.
    pub fn available_pages(&self) -> usize {
        (0..ORDERS)
            .map(|order| self.free_blocks(order).count() * pages_per_block(order))
            .sum()
    }

    /// Logs the full free-list state at debug level, one line per order
    /// listing the starting frame of every free block.
    ///
    /// Diagnostic output only; the format is not a stable interface.
    pub fn dump_state(&self) {
        debug!("buddy state:");
        for order in 0..ORDERS {
            debug!("  [{order:2}] {}", FreeList { alloc: self, order });
        }
    }

    /// Iterates the starting frames of `order`'s free blocks in ascending
    /// address order.
    pub(crate) fn free_blocks<'b>(&'b self, order: usize) -> FreeBlocks<'b, 'a, ORDERS> {
        FreeBlocks {
            alloc: self,
            cur: self.free_lists[order],
        }
    }
}

impl<const ORDERS: usize> fmt::Debug for BuddyAllocator<'_, ORDERS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries((0..ORDERS).map(|order| (order, FreeList { alloc: self, order })))
            .finish()
    }
}

/// Iterator over the starting frames of one order's free blocks.
pub(crate) struct FreeBlocks<'b, 'a, const ORDERS: usize> {
    alloc: &'b BuddyAllocator<'a, ORDERS>,
    cur: Option<Pfn>,
}

impl<const ORDERS: usize> Iterator for FreeBlocks<'_, '_, ORDERS> {
    type Item = Pfn;

    fn next(&mut self) -> Option<Pfn> {
        let pfn = self.cur?;
        self.cur = self.alloc.pages.next_free(pfn);
        Some(pfn)
    }
}

/// Formatting adapter for one order's free list.
struct FreeList<'b, 'a, const ORDERS: usize> {
    alloc: &'b BuddyAllocator<'a, ORDERS>,
    order: usize,
}

impl<const ORDERS: usize> fmt::Debug for FreeList<'_, '_, ORDERS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.alloc.free_blocks(self.order))
            .finish()
    }
}

impl<const ORDERS: usize> fmt::Display for FreeList<'_, '_, ORDERS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for pfn in self.alloc.free_blocks(self.order) {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{pfn}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
impl<const ORDERS: usize> BuddyAllocator<'_, ORDERS> {
    /// Test-only structural walk: every free block aligned, every list
    /// sorted, and no page covered by two free blocks.
    pub(crate) fn assert_invariants(&self) {
        for order in 0..ORDERS {
            let mut last: Option<Pfn> = None;
            for pfn in self.free_blocks(order) {
                assert!(
                    Self::is_aligned(pfn, order),
                    "free block {pfn} misaligned for order {order}"
                );
                if let Some(prev) = last {
                    assert!(prev < pfn, "order-{order} free list is not sorted");
                }
                last = Some(pfn);
            }
        }

        for a_order in 0..ORDERS {
            for a in self.free_blocks(a_order) {
                let a_end = a.get() + pages_per_block(a_order);
                for b_order in a_order..ORDERS {
                    for b in self.free_blocks(b_order) {
                        if a_order == b_order && a == b {
                            continue;
                        }
                        let b_end = b.get() + pages_per_block(b_order);
                        assert!(
                            a_end <= b.get() || b_end <= a.get(),
                            "free blocks {a} (order {a_order}) and {b} (order {b_order}) overlap"
                        );
                    }
                }
            }
        }
    }
}
