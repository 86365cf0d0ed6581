//! The free-space table: in-memory allocator over record addresses.
//!
//! Hands out sets of ranges on request and reclaims them on release.
//! Allocation prefers a single contiguous run (best fit over the current
//! holes), falls back to gathering multiple holes, and finally appends new
//! pages to the file. Persisting this table is a collaborator concern; on
//! reopen it is rebuilt from the live allocations reachable from the root.

use crate::error::Result;
use crate::storage::{PagedFile, RecordAddress, StorageRange};

/// Upper bound on the number of holes gathered for one allocation. Keeps
/// the worst-case chunk table a writer must reserve space for small.
pub const MAX_FRAGMENTS: usize = 8;

#[derive(Debug)]
pub struct FreeSpaceTable {
    /// Records per page
    page_size: u32,
    /// Pages known to exist in the file
    pages: u32,
    /// Free ranges, sorted by (page, record), coalesced
    free: Vec<StorageRange>,
}

impl FreeSpaceTable {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            pages: 0,
            free: Vec::new(),
        }
    }

    /// Rebuild the table for an existing file: everything not covered by
    /// `live` is free.
    pub fn from_live_ranges(page_size: u32, pages: u32, live: &[StorageRange]) -> Self {
        let mut used: Vec<StorageRange> = live.to_vec();
        used.sort_by_key(|r| (r.page, r.record));
        let mut free = Vec::new();
        let mut cursor: Option<(u32, u32)> = None; // (page, next record)
        let mut push_gap = |page: u32, from: u32, to: u32, free: &mut Vec<StorageRange>| {
            if to > from {
                free.push(StorageRange::new(page, from as u16, (to - from) as u16));
            }
        };
        for r in &used {
            let (mut page, mut next) = cursor.unwrap_or((0, 0));
            while page < r.page {
                push_gap(page, next, page_size, &mut free);
                page += 1;
                next = 0;
            }
            push_gap(page, next, r.record as u32, &mut free);
            cursor = Some((r.page, r.record as u32 + r.length as u32));
        }
        let (mut page, mut next) = cursor.unwrap_or((0, 0));
        while page < pages {
            push_gap(page, next, page_size, &mut free);
            page += 1;
            next = 0;
        }
        Self {
            page_size,
            pages,
            free,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.pages
    }

    pub fn total_records(&self) -> u64 {
        self.pages as u64 * self.page_size as u64
    }

    pub fn free_record_count(&self) -> u64 {
        self.free.iter().map(|r| r.length as u64).sum()
    }

    pub fn allocated_record_count(&self) -> u64 {
        self.total_records() - self.free_record_count()
    }

    /// Whether an address currently sits in the free set. Test hook.
    pub fn is_free(&self, addr: RecordAddress) -> bool {
        self.free.iter().any(|r| r.contains(addr))
    }

    /// Hand out ranges summing to exactly `n` records, growing the file
    /// when the free set can't cover the request.
    pub fn allocate(&mut self, n: u32, file: &PagedFile) -> Result<Vec<StorageRange>> {
        debug_assert!(n > 0);

        // Best fit: the tightest single hole that covers the request
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.length as u32 >= n)
            .min_by_key(|(_, r)| r.length);
        if let Some((i, _)) = best {
            let taken = self.take_front(i, n as u16);
            log::debug!("allocated {} record(s) at {}", n, taken.address());
            return Ok(vec![taken]);
        }

        // Gather the largest holes, bounded so the chunk table stays small
        let mut out: Vec<StorageRange> = Vec::new();
        let mut remaining = n;
        while remaining > 0 && out.len() + 1 < MAX_FRAGMENTS {
            let largest = self
                .free
                .iter()
                .enumerate()
                .max_by_key(|(_, r)| r.length)
                .map(|(i, r)| (i, r.length));
            let Some((i, len)) = largest else { break };
            if len == 0 {
                break;
            }
            let take = (len as u32).min(remaining) as u16;
            out.push(self.take_front(i, take));
            remaining -= take as u32;
        }

        // Append fresh pages for whatever is left
        if remaining > 0 {
            let new_pages = remaining.div_ceil(self.page_size);
            let first = file.grow_pages(new_pages)?;
            debug_assert_eq!(first, self.pages);
            self.pages += new_pages;
            for p in 0..new_pages {
                let take = remaining.min(self.page_size) as u16;
                out.push(StorageRange::new(first + p, 0, take));
                remaining -= take as u32;
                if (take as u32) < self.page_size {
                    self.free.push(StorageRange::new(
                        first + p,
                        take,
                        (self.page_size - take as u32) as u16,
                    ));
                }
            }
            self.sort_and_coalesce();
        }

        debug_assert_eq!(out.iter().map(|r| r.length as u32).sum::<u32>(), n);
        log::debug!("allocated {} record(s) across {} range(s)", n, out.len());
        Ok(out)
    }

    /// Mark ranges free again.
    pub fn release(&mut self, ranges: &[StorageRange]) {
        for r in ranges {
            if r.length == 0 {
                continue;
            }
            debug_assert!(
                !self.free.iter().any(|f| f.page == r.page
                    && (f.record as u32) < r.record as u32 + r.length as u32
                    && (r.record as u32) < f.record as u32 + f.length as u32),
                "double release of {:?}",
                r
            );
            self.free.push(*r);
        }
        self.sort_and_coalesce();
        log::debug!(
            "released {} range(s); {} record(s) free",
            ranges.len(),
            self.free_record_count()
        );
    }

    fn take_front(&mut self, i: usize, n: u16) -> StorageRange {
        let hole = self.free[i];
        debug_assert!(hole.length >= n);
        if hole.length == n {
            self.free.remove(i);
        } else {
            self.free[i] = StorageRange::new(hole.page, hole.record + n, hole.length - n);
        }
        StorageRange::new(hole.page, hole.record, n)
    }

    fn sort_and_coalesce(&mut self) {
        self.free.sort_by_key(|r| (r.page, r.record));
        let mut merged: Vec<StorageRange> = Vec::with_capacity(self.free.len());
        for r in self.free.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.page == r.page
                    && last.record as u32 + last.length as u32 == r.record as u32
                    && last.length as u32 + r.length as u32 <= u16::MAX as u32
                {
                    last.length += r.length;
                    continue;
                }
            }
            merged.push(r);
        }
        self.free = merged;
    }
}
