#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use page_buddy::{BuddyAllocator, PageDescriptor, Pfn};

const ORDERS: usize = 6;
const MAX_PAGES: usize = 256;

/// Shadow state of one page, used to issue only contract-respecting calls
/// and to check the allocator's answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageState {
    /// Never handed to the allocator.
    Untracked,
    Free,
    Allocated,
    /// Carved out via `remove_page_range`.
    Reserved,
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    Allocate { order: u8 },
    Free { index: u8 },
    InsertRange { start: u8, count: u8 },
    RemoveRange { start: u8, count: u8 },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    num_pages: u16,
    ops: Vec<Op>,
}

fuzz_target!(|args: Args| {
    let num_pages = 1 + args.num_pages as usize % MAX_PAGES;
    let mut pages = vec![PageDescriptor::new(); num_pages];
    let mut alloc = BuddyAllocator::<ORDERS>::new(&mut pages).unwrap();

    let mut model = vec![PageState::Untracked; num_pages];
    let mut outstanding: Vec<(Pfn, usize)> = Vec::new();

    for op in args.ops {
        match op {
            Op::Allocate { order } => {
                let order = order as usize % ORDERS;

                // Exhaustion cannot be predicted from the model alone
                // (range insertion does not coalesce with neighboring free
                // blocks), so only successful allocations are checked.
                if let Ok(pfn) = alloc.allocate_pages(order) {
                    let span = pfn.get()..pfn.get() + (1 << order);
                    assert_eq!(pfn.get() % (1 << order), 0, "misaligned allocation");
                    assert!(span.end <= num_pages, "allocation out of bounds");
                    for page in span {
                        assert_eq!(model[page], PageState::Free, "allocated a non-free page");
                        model[page] = PageState::Allocated;
                    }
                    outstanding.push((pfn, order));
                }
            }

            Op::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }
                let (pfn, order) = outstanding.swap_remove(index as usize % outstanding.len());
                alloc.free_pages(pfn, order);
                for page in pfn.get()..pfn.get() + (1 << order) {
                    model[page] = PageState::Free;
                }
            }

            Op::InsertRange { start, count } => {
                let start = start as usize % num_pages;
                let count = count as usize % (num_pages - start + 1);

                // Inserting pages that are already free (or handed out)
                // violates the caller contract; skip those ranges.
                let insertable = model[start..start + count]
                    .iter()
                    .all(|&s| s == PageState::Untracked || s == PageState::Reserved);
                if count == 0 || !insertable {
                    continue;
                }

                alloc.insert_page_range(Pfn::new(start), count);
                for state in &mut model[start..start + count] {
                    *state = PageState::Free;
                }
            }

            Op::RemoveRange { start, count } => {
                let start = start as usize % num_pages;
                let count = count as usize % (num_pages - start + 1);

                let removable = model[start..start + count]
                    .iter()
                    .all(|&s| s == PageState::Free);
                if count == 0 || !removable {
                    continue;
                }

                alloc.remove_page_range(Pfn::new(start), count);
                for state in &mut model[start..start + count] {
                    *state = PageState::Reserved;
                }
            }
        }
    }

    // The allocator and the model must agree on every page.
    let free_in_model = model.iter().filter(|&&s| s == PageState::Free).count();
    assert_eq!(alloc.available_pages(), free_in_model);
    for page in 0..num_pages {
        assert_eq!(
            alloc.is_free(Pfn::new(page)),
            model[page] == PageState::Free,
            "allocator and model disagree on page {page}"
        );
    }
});
