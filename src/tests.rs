#![cfg(test)]
extern crate std;

use std::{ops::Range, prelude::rust_2021::*};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{buddy::BuddyAllocator, PageDescriptor, Pfn};

/// Order count used by the property tests; blocks of up to 16 pages keep
/// generated cases small while still exercising multi-level splits.
const ORDERS: usize = 5;

const MAX_PAGES: usize = 64;

const MAX_TESTS: u64 = 200;

/// Construction parameters: a descriptor-table size and a set of disjoint
/// ranges to reserve after the whole table has been made available.
#[derive(Clone, Debug)]
struct AllocatorParams {
    num_pages: usize,
    gaps: Vec<Range<usize>>,
}

impl Arbitrary for AllocatorParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let num_pages = 1 + usize::arbitrary(g) % MAX_PAGES;

        // Disjoint gaps fall out of sorting a handful of cut points and
        // pairing them up.
        let gaps = {
            let mut cuts: Vec<usize> = Vec::arbitrary(g)
                .into_iter()
                .map(|cut: usize| cut % (num_pages + 1))
                .take(6)
                .collect();
            cuts.sort_unstable();

            cuts.chunks_exact(2)
                .map(|pair| pair[0]..pair[1])
                .filter(|gap| !gap.is_empty())
                .collect()
        };

        AllocatorParams { num_pages, gaps }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let mut items = Vec::new();

        for i in 0..self.gaps.len() {
            let mut gaps = self.gaps.clone();
            gaps.remove(i);
            items.push(AllocatorParams {
                num_pages: self.num_pages,
                gaps,
            });
        }

        if self.num_pages > 1 {
            let num_pages = self.num_pages / 2;
            items.push(AllocatorParams {
                num_pages,
                gaps: self
                    .gaps
                    .iter()
                    .filter(|gap| gap.end <= num_pages)
                    .cloned()
                    .collect(),
            });
        }

        Box::new(items.into_iter())
    }
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Request a block of `2^order` pages.
    Allocate { order: usize },
    /// Free an outstanding allocation. Given `n` outstanding allocations,
    /// the one at `index % n` is freed.
    Free { index: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                order: usize::arbitrary(g) % ORDERS,
            }
        } else {
            AllocatorOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

fn page_table(count: usize) -> Vec<PageDescriptor> {
    let mut pages = Vec::new();
    pages.resize(count, PageDescriptor::new());
    pages
}

/// Seeds an allocator per `params`: insert the whole table, then carve out
/// the reserved gaps.
fn seed<'a>(
    params: &AllocatorParams,
    pages: &'a mut [PageDescriptor],
) -> BuddyAllocator<'a, ORDERS> {
    let mut alloc = BuddyAllocator::<ORDERS>::new(pages).unwrap();
    alloc.insert_page_range(Pfn::new(0), params.num_pages);
    for gap in &params.gaps {
        alloc.remove_page_range(Pfn::new(gap.start), gap.len());
    }
    alloc
}

fn snapshot(alloc: &BuddyAllocator<'_, ORDERS>) -> Vec<Vec<usize>> {
    (0..ORDERS)
        .map(|order| alloc.free_blocks(order).map(Pfn::get).collect())
        .collect()
}

/// Blocks handed out are aligned, in bounds, mutually exclusive with every
/// other outstanding block, and invisible to `is_free`; once everything is
/// freed again the free lists coalesce back to exactly the seeded state.
fn allocations_are_exclusive_and_reversible(
    params: AllocatorParams,
    ops: Vec<AllocatorOp>,
) -> bool {
    let mut pages = page_table(params.num_pages);
    let mut alloc = seed(&params, &mut pages);

    let seeded = snapshot(&alloc);
    let seeded_avail = alloc.available_pages();

    let mut outstanding: Vec<(Pfn, usize)> = Vec::new();

    for op in ops {
        match op {
            AllocatorOp::Allocate { order } => {
                let Ok(pfn) = alloc.allocate_pages(order) else {
                    continue;
                };
                let span = pfn.get()..pfn.get() + (1 << order);

                if pfn.get() % (1 << order) != 0 || span.end > params.num_pages {
                    return false;
                }
                if span.clone().any(|page| alloc.is_free(Pfn::new(page))) {
                    return false;
                }
                for &(other, other_order) in &outstanding {
                    let other_span = other.get()..other.get() + (1 << other_order);
                    if span.start < other_span.end && other_span.start < span.end {
                        return false;
                    }
                }

                outstanding.push((pfn, order));
            }

            AllocatorOp::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }
                let (pfn, order) = outstanding.swap_remove(index % outstanding.len());
                alloc.free_pages(pfn, order);
            }
        }

        alloc.assert_invariants();
    }

    // Drain the outstanding allocations; eager coalescing must restore the
    // seeded free lists exactly.
    for (pfn, order) in outstanding.drain(..) {
        alloc.free_pages(pfn, order);
    }

    snapshot(&alloc) == seeded && alloc.available_pages() == seeded_avail
}

/// After seeding, a page reads as free exactly when it is outside every
/// reserved gap.
fn range_marking_is_exact(params: AllocatorParams) -> bool {
    let mut pages = page_table(params.num_pages);
    let alloc = seed(&params, &mut pages);

    (0..params.num_pages).all(|page| {
        let reserved = params.gaps.iter().any(|gap| gap.contains(&page));
        alloc.is_free(Pfn::new(page)) == !reserved
    })
}

#[test]
fn buddy_allocations_are_exclusive_and_reversible() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(allocations_are_exclusive_and_reversible as fn(_, _) -> bool);
}

#[test]
fn buddy_range_marking_is_exact() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(range_marking_is_exact as fn(_) -> bool);
}
