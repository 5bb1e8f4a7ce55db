// Copyright 2025 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size block allocator backing chunk storage.
//!
//! Blocks come in two size classes (8 KiB and 16 KiB) and are carved from
//! pages of up to 62 blocks. Each block carries a 64-byte prefix holding a
//! back-pointer to its page, so freeing is O(1); while a block is free the
//! prefix doubles as its free-list link. Block payloads are 64-byte aligned.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Payload bytes of a small block.
pub const SMALL_BLOCK_BYTES: usize = 8 * 1024;
/// Payload bytes of a large block.
pub const LARGE_BLOCK_BYTES: usize = 16 * 1024;
/// Reserved prefix preceding every block payload.
pub const BLOCK_PREFIX_BYTES: usize = 64;

const BLOCKS_PER_PAGE: u16 = 62;
const PAGE_ALIGN: usize = 4096;

/// Block size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn bytes(self) -> usize {
        match self {
            SizeClass::Small => SMALL_BLOCK_BYTES,
            SizeClass::Large => LARGE_BLOCK_BYTES,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => 1,
        }
    }

    /// Smallest class whose payload fits `requested` bytes.
    pub fn for_request(requested: usize) -> Self {
        assert!(
            requested <= LARGE_BLOCK_BYTES,
            "chunk request of {requested} bytes exceeds the large block size"
        );
        if requested <= SMALL_BLOCK_BYTES {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }
}

#[repr(C)]
struct BlockPrefix {
    page_id: u32,
    block_idx: u16,
    next_free: u16,
    class: u8,
}

struct Page {
    base: NonNull<u8>,
    class: SizeClass,
    free_head: u16,
    used: u16,
    id: u32,
}

impl Page {
    fn stride(class: SizeClass) -> usize {
        BLOCK_PREFIX_BYTES + class.bytes()
    }

    fn layout(class: SizeClass) -> Layout {
        // Stride is a multiple of 64 and the base is page-aligned, so every
        // block payload lands on a 64-byte boundary.
        Layout::from_size_align(Self::stride(class) * BLOCKS_PER_PAGE as usize, PAGE_ALIGN)
            .expect("page layout")
    }

    fn new(id: u32, class: SizeClass) -> Self {
        let layout = Self::layout(class);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        let page = Self {
            base,
            class,
            free_head: 0,
            used: 0,
            id,
        };
        for idx in 0..BLOCKS_PER_PAGE {
            // SAFETY: idx is in range; the prefix region is owned by this page.
            unsafe {
                page.prefix_ptr(idx).write(BlockPrefix {
                    page_id: id,
                    block_idx: idx,
                    next_free: idx + 1,
                    class: class.index() as u8,
                });
            }
        }
        page
    }

    fn prefix_ptr(&self, idx: u16) -> *mut BlockPrefix {
        debug_assert!(idx < BLOCKS_PER_PAGE);
        // SAFETY: idx is in range for the allocation.
        unsafe {
            self.base
                .as_ptr()
                .add(idx as usize * Self::stride(self.class))
                .cast()
        }
    }

    fn payload_ptr(&self, idx: u16) -> NonNull<u8> {
        // SAFETY: the payload follows the prefix inside the same allocation.
        unsafe {
            NonNull::new_unchecked(
                self.base
                    .as_ptr()
                    .add(idx as usize * Self::stride(self.class) + BLOCK_PREFIX_BYTES),
            )
        }
    }

    fn is_full(&self) -> bool {
        self.used == BLOCKS_PER_PAGE
    }

    fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn alloc_block(&mut self) -> NonNull<u8> {
        debug_assert!(!self.is_full());
        let idx = self.free_head;
        // SAFETY: idx came off the free list and is in range.
        self.free_head = unsafe { (*self.prefix_ptr(idx)).next_free };
        self.used += 1;
        self.payload_ptr(idx)
    }

    fn free_block(&mut self, idx: u16) {
        debug_assert!(self.used > 0);
        // SAFETY: idx names a block of this page; re-link it as the new head.
        unsafe {
            let prefix = self.prefix_ptr(idx);
            (*prefix).next_free = self.free_head;
            (*prefix).block_idx = idx;
        }
        self.free_head = idx;
        self.used -= 1;
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.class)) };
    }
}

/// Two-size-class block allocator with O(1) alloc and free.
pub struct ChunkAllocator {
    pages: Vec<Option<Page>>,
    /// Per class: ids of pages with at least one free block.
    free_pages: [Vec<u32>; 2],
    free_ids: Vec<u32>,
}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_pages: [Vec::new(), Vec::new()],
            free_ids: Vec::new(),
        }
    }

    /// Hand out one block whose payload holds at least `requested` bytes.
    /// The request is rounded up to a size class.
    pub fn alloc(&mut self, requested: usize) -> NonNull<u8> {
        let class = SizeClass::for_request(requested);
        let pid = match self.free_pages[class.index()].last() {
            Some(&pid) => pid,
            None => self.new_page(class),
        };
        let page = self.pages[pid as usize].as_mut().expect("live page");
        let payload = page.alloc_block();
        if page.is_full() {
            self.free_pages[class.index()].pop();
        }
        payload
    }

    /// Return a block to its page.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by [`Self::alloc`] on
    /// this allocator and not freed since.
    pub unsafe fn free(&mut self, payload: NonNull<u8>) {
        let prefix = payload.as_ptr().sub(BLOCK_PREFIX_BYTES) as *const BlockPrefix;
        let page_id = (*prefix).page_id;
        let block_idx = (*prefix).block_idx;

        let page = self.pages[page_id as usize].as_mut().expect("live page");
        let was_full = page.is_full();
        let class = page.class;
        page.free_block(block_idx);
        if was_full {
            self.free_pages[class.index()].push(page_id);
        }
    }

    /// Release pages with no blocks in use. Called during world teardown.
    pub fn flush(&mut self) {
        for pid in 0..self.pages.len() {
            let empty = self.pages[pid].as_ref().is_some_and(Page::is_empty);
            if empty {
                let page = self.pages[pid].take().expect("checked above");
                self.free_pages[page.class.index()].retain(|&id| id != page.id);
                self.free_ids.push(page.id);
            }
        }
    }

    fn new_page(&mut self, class: SizeClass) -> u32 {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.pages.push(None);
                (self.pages.len() - 1) as u32
            }
        };
        self.pages[id as usize] = Some(Page::new(id, class));
        self.free_pages[class.index()].push(id);
        id
    }

    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn blocks_in_use(&self) -> usize {
        self.pages
            .iter()
            .flatten()
            .map(|p| p.used as usize)
            .sum()
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_rounding() {
        assert_eq!(SizeClass::for_request(1), SizeClass::Small);
        assert_eq!(SizeClass::for_request(SMALL_BLOCK_BYTES), SizeClass::Small);
        assert_eq!(
            SizeClass::for_request(SMALL_BLOCK_BYTES + 1),
            SizeClass::Large
        );
    }

    #[test]
    #[should_panic(expected = "exceeds the large block size")]
    fn test_oversized_request_rejected() {
        SizeClass::for_request(LARGE_BLOCK_BYTES + 1);
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut alloc = ChunkAllocator::new();
        let a = alloc.alloc(100);
        let b = alloc.alloc(SMALL_BLOCK_BYTES + 1);
        assert_eq!(alloc.blocks_in_use(), 2);
        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert_eq!(b.as_ptr() as usize % 64, 0);

        // SAFETY: pointers came from this allocator.
        unsafe {
            alloc.free(a);
            alloc.free(b);
        }
        assert_eq!(alloc.blocks_in_use(), 0);
    }

    #[test]
    fn test_page_promotion_and_reuse() {
        let mut alloc = ChunkAllocator::new();
        let mut blocks = Vec::new();
        for _ in 0..63 {
            blocks.push(alloc.alloc(100));
        }
        // 62 blocks fill the first page; the 63rd opens a second.
        assert_eq!(alloc.page_count(), 2);

        // Freeing one block from the full page makes it allocatable again.
        // SAFETY: pointer came from this allocator.
        unsafe { alloc.free(blocks[0]) };
        let again = alloc.alloc(100);
        assert_eq!(alloc.page_count(), 2);
        assert_eq!(again.as_ptr(), blocks[0].as_ptr());
    }

    #[test]
    fn test_flush_releases_empty_pages() {
        let mut alloc = ChunkAllocator::new();
        let a = alloc.alloc(100);
        // SAFETY: pointer came from this allocator.
        unsafe { alloc.free(a) };
        assert_eq!(alloc.page_count(), 1);
        alloc.flush();
        assert_eq!(alloc.page_count(), 0);

        // Released ids are recycled for the next page.
        let _b = alloc.alloc(100);
        assert_eq!(alloc.page_count(), 1);
    }

    #[test]
    fn test_writes_do_not_corrupt_neighbors() {
        let mut alloc = ChunkAllocator::new();
        let a = alloc.alloc(SMALL_BLOCK_BYTES);
        let b = alloc.alloc(SMALL_BLOCK_BYTES);
        // SAFETY: both payloads are fully owned and of SMALL_BLOCK_BYTES size.
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAA, SMALL_BLOCK_BYTES);
            std::ptr::write_bytes(b.as_ptr(), 0x55, SMALL_BLOCK_BYTES);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0x55);
            alloc.free(a);
            alloc.free(b);
        }
    }
}
