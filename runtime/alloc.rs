//! First-fit free-list allocation over a growable linear buffer
//!
//! Addresses handed out here are byte offsets into the buffer, not host
//! pointers, so growth never invalidates them: the buffer only ever grows
//! append-only, in page-sized steps, and allocated blocks never move.
//!
//! Every block carries an 8-byte block header. While allocated only the
//! size word is meaningful; while free the second word links the block into
//! an address-ordered free list so that released neighbours can coalesce.
//!
//! ```text
//! [ size: u32 ][ next: u32 ][ payload ... ]
//! ^~~~~~~~~~~~~~~~~~~~~~~~~~^
//! {block address}           {address returned by allocate()}
//! ```

use std::cmp;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::MemoryError;

/// Growth granularity, matching the 64 KiB pages of the compile target
pub const PAGE_SIZE: u32 = 64 * 1024;

const BLOCK_HEADER_SIZE: u32 = 8;

/// Smallest block worth splitting off; anything less stays with the
/// allocation it was carved from
const MIN_BLOCK_SIZE: u32 = 16;

/// Free-list terminator
const NIL: u32 = u32::max_value();

/// Backing buffer for the managed heap
///
/// Owns the raw bytes and exposes checked word and byte accessors. Words are
/// little-endian to match the compile target; the object header's reference
/// count is the only big-endian field and is accessed bytewise.
pub struct LinearHeap {
    bytes: Vec<u8>,
    limit: Option<u32>,
}

impl LinearHeap {
    pub fn with_capacity(initial: u32) -> LinearHeap {
        LinearHeap {
            bytes: vec![0; initial as usize],
            limit: None,
        }
    }

    /// Caps the total buffer size; must be set before the first allocation
    pub fn set_limit(&mut self, limit: Option<u32>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Appends `additional` zeroed bytes to the buffer
    ///
    /// Fails without mutating anything when the configured limit would be
    /// exceeded. Existing offsets remain valid after growth.
    pub fn grow(&mut self, additional: u32) -> Result<(), MemoryError> {
        let new_len = self.bytes.len() as u64 + u64::from(additional);

        if new_len > u64::from(u32::max_value()) {
            return Err(MemoryError::OutOfMemory);
        }
        if let Some(limit) = self.limit {
            if new_len > u64::from(limit) {
                return Err(MemoryError::OutOfMemory);
            }
        }

        self.bytes.resize(new_len as usize, 0);
        Ok(())
    }

    pub fn word(&self, offset: u32) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        LittleEndian::read_u32(&self.bytes[offset as usize..offset as usize + 4])
    }

    pub fn set_word(&mut self, offset: u32, word: u32) {
        debug_assert_eq!(offset % 4, 0);
        LittleEndian::write_u32(&mut self.bytes[offset as usize..offset as usize + 4], word);
    }

    pub fn byte(&self, offset: u32) -> u8 {
        self.bytes[offset as usize]
    }

    pub fn set_byte(&mut self, offset: u32, byte: u8) {
        self.bytes[offset as usize] = byte;
    }

    pub fn slice(&self, offset: u32, len: u32) -> &[u8] {
        &self.bytes[offset as usize..(offset + len) as usize]
    }

    pub fn slice_mut(&mut self, offset: u32, len: u32) -> &mut [u8] {
        &mut self.bytes[offset as usize..(offset + len) as usize]
    }
}

/// First-fit free-list allocator
pub struct Allocator {
    heap: LinearHeap,
    free_head: u32,
}

impl Allocator {
    pub fn new(heap: LinearHeap) -> Allocator {
        let mut allocator = Allocator {
            heap,
            free_head: NIL,
        };

        let len = allocator.heap.len();
        if len >= BLOCK_HEADER_SIZE {
            allocator.heap.set_word(0, len);
            allocator.heap.set_word(4, NIL);
            allocator.free_head = 0;
        }

        allocator
    }

    pub fn heap(&self) -> &LinearHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut LinearHeap {
        &mut self.heap
    }

    /// Returns the byte offset of a stable `size`-byte region
    ///
    /// Grows the backing buffer when the free list has no fit. Fails with
    /// `OutOfMemory` and no partial mutation when growth would exceed the
    /// configured limit.
    pub fn allocate(&mut self, size: u32) -> Result<u32, MemoryError> {
        let padded = size.checked_add(7).ok_or(MemoryError::OutOfMemory)? & !7;
        let need = padded
            .checked_add(BLOCK_HEADER_SIZE)
            .ok_or(MemoryError::OutOfMemory)?;

        if let Some(addr) = self.take_fit(need) {
            trace!("allocate({:#x}) -> {:#010x}", size, addr);
            return Ok(addr);
        }

        self.grow_for(need)?;
        let addr = self.take_fit(need).ok_or(MemoryError::OutOfMemory)?;
        trace!("allocate({:#x}) -> {:#010x} (grown)", size, addr);
        Ok(addr)
    }

    /// Returns a previously allocated region to the free list
    ///
    /// Coalesces with free neighbours on both sides. The caller is
    /// responsible for not releasing an address twice.
    pub fn release(&mut self, addr: u32) {
        trace!("release({:#010x})", addr);
        let block = addr - BLOCK_HEADER_SIZE;
        let size = self.heap.word(block);
        self.insert_free(block, size);
    }

    /// Total bytes on the free list, block headers included
    pub fn free_bytes(&self) -> u32 {
        let mut total = 0;
        let mut block = self.free_head;
        while block != NIL {
            total += self.heap.word(block);
            block = self.heap.word(block + 4);
        }
        total
    }

    fn take_fit(&mut self, need: u32) -> Option<u32> {
        let mut prev = NIL;
        let mut block = self.free_head;

        while block != NIL {
            let size = self.heap.word(block);
            let next = self.heap.word(block + 4);

            if size >= need {
                let follower = if size - need >= MIN_BLOCK_SIZE {
                    // Carve the tail off as its own free block
                    let rest = block + need;
                    self.heap.set_word(rest, size - need);
                    self.heap.set_word(rest + 4, next);
                    self.heap.set_word(block, need);
                    rest
                } else {
                    next
                };

                if prev == NIL {
                    self.free_head = follower;
                } else {
                    self.heap.set_word(prev + 4, follower);
                }

                return Some(block + BLOCK_HEADER_SIZE);
            }

            prev = block;
            block = next;
        }

        None
    }

    fn grow_for(&mut self, need: u32) -> Result<(), MemoryError> {
        let start = self.heap.len();
        let chunk = match need.checked_add(PAGE_SIZE - 1) {
            Some(n) => cmp::max(n / PAGE_SIZE * PAGE_SIZE, PAGE_SIZE),
            None => need,
        };

        if self.heap.grow(chunk).is_ok() {
            self.insert_free(start, chunk);
            return Ok(());
        }

        // The page-rounded chunk exceeded the limit; retry with exactly what
        // the request needs
        self.heap.grow(need)?;
        self.insert_free(start, need);
        Ok(())
    }

    fn insert_free(&mut self, block: u32, size: u32) {
        self.heap.set_word(block, size);

        let mut prev = NIL;
        let mut cur = self.free_head;
        while cur != NIL && cur < block {
            prev = cur;
            cur = self.heap.word(cur + 4);
        }

        self.heap.set_word(block + 4, cur);
        if prev == NIL {
            self.free_head = block;
        } else {
            self.heap.set_word(prev + 4, block);
        }

        // Coalesce with the following block
        if cur != NIL && block + self.heap.word(block) == cur {
            let merged = self.heap.word(block) + self.heap.word(cur);
            let cur_next = self.heap.word(cur + 4);
            self.heap.set_word(block, merged);
            self.heap.set_word(block + 4, cur_next);
        }

        // Coalesce with the preceding block
        if prev != NIL && prev + self.heap.word(prev) == block {
            let merged = self.heap.word(prev) + self.heap.word(block);
            let block_next = self.heap.word(block + 4);
            self.heap.set_word(prev, merged);
            self.heap.set_word(prev + 4, block_next);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn allocator_with_capacity(capacity: u32) -> Allocator {
        Allocator::new(LinearHeap::with_capacity(capacity))
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut allocator = allocator_with_capacity(256);

        let a = allocator.allocate(12).unwrap();
        let b = allocator.allocate(12).unwrap();

        assert_eq!(0, a % 8);
        assert_eq!(0, b % 8);
        assert!(b >= a + 12 + BLOCK_HEADER_SIZE || a >= b + 12 + BLOCK_HEADER_SIZE);
    }

    #[test]
    fn released_blocks_are_reused() {
        let mut allocator = allocator_with_capacity(256);

        let a = allocator.allocate(16).unwrap();
        allocator.release(a);
        let b = allocator.allocate(16).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn releasing_everything_coalesces_to_one_block() {
        let mut allocator = allocator_with_capacity(256);

        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();
        let c = allocator.allocate(16).unwrap();

        // Release out of order to exercise both coalescing directions
        allocator.release(b);
        allocator.release(a);
        allocator.release(c);

        assert_eq!(allocator.heap().len(), allocator.free_bytes());
    }

    #[test]
    fn grows_when_the_free_list_has_no_fit() {
        let mut allocator = allocator_with_capacity(64);

        let addr = allocator.allocate(1024).unwrap();
        assert!(allocator.heap().len() >= 1024 + BLOCK_HEADER_SIZE);
        assert_eq!(0, addr % 8);
    }

    #[test]
    fn limit_fails_growth_without_mutation() {
        let mut heap = LinearHeap::with_capacity(64);
        heap.set_limit(Some(64));
        let mut allocator = Allocator::new(heap);

        let before_free = allocator.free_bytes();
        assert_eq!(Err(MemoryError::OutOfMemory), allocator.allocate(1024));
        assert_eq!(64, allocator.heap().len());
        assert_eq!(before_free, allocator.free_bytes());
    }

    #[test]
    fn limit_allows_exact_fit_growth() {
        let mut heap = LinearHeap::with_capacity(0);
        heap.set_limit(Some(1024));
        let mut allocator = Allocator::new(heap);

        // Far below a page, but must still succeed under the 1 KiB limit
        let addr = allocator.allocate(512).unwrap();
        assert_eq!(BLOCK_HEADER_SIZE, addr);
    }
}
