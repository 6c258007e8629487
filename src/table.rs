//! Paginated handle table (L2): pointer-stable growth plus a free-list.

use parking_lot::RwLock;

use crate::handle::HandleEntry;

/// A handle table whose entries never move, even as the table grows.
///
/// Entries are stored in fixed-size pages (`Box<[HandleEntry]>`); growing
/// the table only ever appends a new page, so an `&HandleEntry` obtained via
/// [`HandleTable::get`] remains valid for the arena's whole lifetime —
/// the compactor relies on this (§4.2: "existing entry pointers remain
/// stable under growth").
pub(crate) struct HandleTable {
    pages: RwLock<Vec<Box<[HandleEntry]>>>,
    page_size: u32,
}

impl HandleTable {
    pub(crate) fn new(initial_capacity: u32) -> Self {
        let page_size = initial_capacity.max(1);
        let first_page: Box<[HandleEntry]> =
            (0..page_size).map(|_| HandleEntry::default()).collect();
        Self {
            pages: RwLock::new(vec![first_page]),
            page_size,
        }
    }

    fn total_capacity(pages: &[Box<[HandleEntry]>], page_size: u32) -> u32 {
        pages
            .iter()
            .enumerate()
            .map(|(i, p)| if i == 0 { page_size } else { p.len() as u32 })
            .sum()
    }

    /// Ensure the table can address `needed` entries, growing on
    /// power-of-two boundaries (§4.2). Caller must hold the arena's
    /// `allocation_mutex` (growth must be serialized with free-list pops).
    pub(crate) fn ensure_capacity(&self, needed: u32) {
        loop {
            let cap = {
                let pages = self.pages.read();
                Self::total_capacity(&pages, self.page_size)
            };
            if cap >= needed {
                return;
            }
            let mut pages = self.pages.write();
            let cap = Self::total_capacity(&pages, self.page_size);
            if cap >= needed {
                continue;
            }
            let new_page_size = cap.max(self.page_size);
            let page: Box<[HandleEntry]> =
                (0..new_page_size).map(|_| HandleEntry::default()).collect();
            pages.push(page);
        }
    }

    /// Returns a stable reference to the entry at `idx`.
    ///
    /// Panics if `idx` has never been brought into capacity via
    /// [`HandleTable::ensure_capacity`].
    pub(crate) fn get(&self, idx: u32) -> &HandleEntry {
        let pages = self.pages.read();
        let (page_no, offset) = self.locate(&pages, idx);
        // SAFETY: pages are never removed or shrunk once pushed, and a
        // `Box<[T]>`'s heap allocation does not move when the outer `Vec`
        // reallocates — only the `Box` (a pointer) is copied. The reference
        // therefore remains valid after the read guard is dropped.
        let entry: &HandleEntry = &pages[page_no][offset];
        unsafe { &*(entry as *const HandleEntry) }
    }

    fn locate(&self, pages: &[Box<[HandleEntry]>], idx: u32) -> (usize, usize) {
        let mut remaining = idx;
        for (i, page) in pages.iter().enumerate() {
            let len = if i == 0 { self.page_size } else { page.len() as u32 };
            if remaining < len {
                return (i, remaining as usize);
            }
            remaining -= len;
        }
        panic!("handle index {idx} out of table capacity");
    }
}
