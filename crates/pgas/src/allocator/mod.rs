//! Region Allocator - First-Fit Block Allocator Over the Shared Region
//!
//! Block metadata lives in-band: every chunk is preceded by a 32-byte header
//! `{size, flags, next, prev}`. Headers link free and used blocks into a
//! single list in address order, and `next`/`prev` hold **offsets from the
//! region base**, never host pointers, because two processes observing the
//! same byte see different virtual addresses.
//!
//! ```text
//! region: | hdr | payload | hdr | payload | hdr | payload ... |
//!            \______next______/^  \_____next_____/^
//! ```
//!
//! Invariants:
//! - Blocks cover the region contiguously; `next` always names the
//!   physically adjacent block.
//! - The list is a total order by address.
//! - Coalescing on free never leaves two adjacent free blocks.
//!
//! A single mutex guards the block list. The lock is never held across a
//! suspension point.

use crate::error::{PgasError, Result};
use crate::region::SharedRegion;
use crate::util::align_up;
use crate::CACHE_LINE_SIZE;
use std::sync::{Arc, Mutex};

/// In-band header size in bytes
pub const BLOCK_HEADER_SIZE: u64 = 32;

/// Default allocation alignment (one cache line)
pub const DEFAULT_ALIGNMENT: usize = CACHE_LINE_SIZE;

/// Offset sentinel for the end of the block list
const NIL: u64 = u64::MAX;

const FLAG_FREE: u64 = 1;

/// Block header as laid out inside the region
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    /// Payload capacity in bytes (header excluded)
    size: u64,
    flags: u64,
    /// Offset of the physically next block, `NIL` at the tail
    next: u64,
    /// Offset of the physically previous block, `NIL` at the head
    prev: u64,
}

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0
    }
}

/// Mutable allocator state behind the lock
#[derive(Debug, Default)]
struct HeapState {
    live_bytes: u64,
    allocations: u64,
    deallocations: u64,
    bytes_allocated: u64,
    bytes_freed: u64,
}

/// Cumulative allocator statistics
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub live_bytes: u64,
}

/// Diagnostic view of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u64,
    pub free: bool,
}

/// First-fit coalescing allocator over the shared region
#[derive(Debug)]
pub struct RegionAllocator {
    region: Arc<SharedRegion>,
    state: Mutex<HeapState>,
}

impl RegionAllocator {
    /// Initialize the allocator, formatting the region as one free block
    pub fn new(region: Arc<SharedRegion>) -> Result<Self> {
        let size = region.len() as u64;
        if size < BLOCK_HEADER_SIZE + CACHE_LINE_SIZE as u64 {
            return Err(PgasError::RegionOpen(format!(
                "region of {} bytes is too small for the allocator",
                size
            )));
        }

        let allocator = Self {
            region,
            state: Mutex::new(HeapState::default()),
        };
        allocator.write_header(
            0,
            BlockHeader {
                size: size - BLOCK_HEADER_SIZE,
                flags: FLAG_FREE,
                next: NIL,
                prev: NIL,
            },
        );
        Ok(allocator)
    }

    /// Allocate `size` bytes, returning the payload offset within the region
    ///
    /// The size is rounded up to `alignment` (which is itself raised to at
    /// least 8 bytes); the returned offset is always 8-byte aligned.
    pub fn alloc(&self, size: usize, alignment: usize) -> Result<u64> {
        let alignment = alignment.max(8).next_power_of_two();
        let rounded = align_up(size.max(1), alignment) as u64;

        let mut state = self.state.lock().map_err(PgasError::from)?;

        let mut offset = 0u64;
        loop {
            let mut header = self.read_header(offset);

            if header.is_free() && header.size >= rounded {
                // Split when the residue can hold a header plus one line
                if header.size >= rounded + BLOCK_HEADER_SIZE + CACHE_LINE_SIZE as u64 {
                    let tail_offset = offset + BLOCK_HEADER_SIZE + rounded;
                    let tail = BlockHeader {
                        size: header.size - rounded - BLOCK_HEADER_SIZE,
                        flags: FLAG_FREE,
                        next: header.next,
                        prev: offset,
                    };
                    if header.next != NIL {
                        let mut after = self.read_header(header.next);
                        after.prev = tail_offset;
                        self.write_header(header.next, after);
                    }
                    self.write_header(tail_offset, tail);
                    header.next = tail_offset;
                    header.size = rounded;
                }

                header.flags &= !FLAG_FREE;
                self.write_header(offset, header);

                state.live_bytes += header.size;
                state.allocations += 1;
                state.bytes_allocated += header.size;
                return Ok(offset + BLOCK_HEADER_SIZE);
            }

            if header.next == NIL {
                break;
            }
            offset = header.next;
        }

        let available = self.free_bytes_locked();
        log::debug!(
            "allocator: no block for {} bytes ({} free)",
            rounded,
            available
        );
        Err(PgasError::OutOfMemory {
            requested: rounded as usize,
            available: available as usize,
        })
    }

    /// Return a previously allocated payload offset to the free list
    ///
    /// Behavior is undefined for offsets that were not returned by a prior
    /// [`RegionAllocator::alloc`]; a detectable double free is ignored with
    /// a warning rather than corrupting the list.
    pub fn free(&self, payload_offset: u64) -> Result<()> {
        if payload_offset < BLOCK_HEADER_SIZE
            || payload_offset >= self.region.len() as u64
        {
            return Err(PgasError::InvalidArgument(format!(
                "free of offset {} outside the region",
                payload_offset
            )));
        }

        let mut state = self.state.lock().map_err(PgasError::from)?;

        let offset = payload_offset - BLOCK_HEADER_SIZE;
        let mut header = self.read_header(offset);
        if header.is_free() {
            log::warn!("allocator: double free of offset {}", payload_offset);
            return Ok(());
        }

        header.flags |= FLAG_FREE;
        state.live_bytes = state.live_bytes.saturating_sub(header.size);
        state.deallocations += 1;
        state.bytes_freed += header.size;

        // Coalesce with the successor
        if header.next != NIL {
            let next = self.read_header(header.next);
            if next.is_free() {
                header.size += BLOCK_HEADER_SIZE + next.size;
                header.next = next.next;
                if next.next != NIL {
                    let mut after = self.read_header(next.next);
                    after.prev = offset;
                    self.write_header(next.next, after);
                }
            }
        }
        self.write_header(offset, header);

        // Coalesce with the predecessor
        if header.prev != NIL {
            let mut prev = self.read_header(header.prev);
            if prev.is_free() {
                prev.size += BLOCK_HEADER_SIZE + header.size;
                prev.next = header.next;
                self.write_header(header.prev, prev);
                if header.next != NIL {
                    let mut after = self.read_header(header.next);
                    after.prev = header.prev;
                    self.write_header(header.next, after);
                }
            }
        }

        Ok(())
    }

    /// Cumulative statistics
    pub fn stats(&self) -> AllocatorStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return AllocatorStats::default(),
        };
        AllocatorStats {
            allocations: state.allocations,
            deallocations: state.deallocations,
            bytes_allocated: state.bytes_allocated,
            bytes_freed: state.bytes_freed,
            live_bytes: state.live_bytes,
        }
    }

    /// Snapshot the block list in address order
    pub fn block_layout(&self) -> Vec<BlockInfo> {
        let _state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Vec::new(),
        };

        let mut blocks = Vec::new();
        let mut offset = 0u64;
        loop {
            let header = self.read_header(offset);
            blocks.push(BlockInfo {
                offset,
                size: header.size,
                free: header.is_free(),
            });
            if header.next == NIL {
                break;
            }
            offset = header.next;
        }
        blocks
    }

    /// Verify the block-list invariants
    ///
    /// Checks contiguous coverage of the region, address-ordered linkage,
    /// and the absence of adjacent free blocks.
    pub fn validate(&self) -> Result<()> {
        let _state = self.state.lock().map_err(PgasError::from)?;

        let region_size = self.region.len() as u64;
        let mut offset = 0u64;
        let mut prev: u64 = NIL;
        let mut prev_free = false;
        let mut covered = 0u64;

        loop {
            let header = self.read_header(offset);

            if header.prev != prev {
                return Err(PgasError::Internal(format!(
                    "block {} has prev {}, expected {}",
                    offset, header.prev, prev
                )));
            }
            if prev_free && header.is_free() {
                return Err(PgasError::Internal(format!(
                    "adjacent free blocks at {} and {}",
                    prev, offset
                )));
            }

            covered += BLOCK_HEADER_SIZE + header.size;

            match header.next {
                NIL => break,
                next if next != offset + BLOCK_HEADER_SIZE + header.size => {
                    return Err(PgasError::Internal(format!(
                        "block {} of size {} links to non-adjacent {}",
                        offset, header.size, next
                    )));
                }
                next => {
                    prev = offset;
                    prev_free = header.is_free();
                    offset = next;
                }
            }
        }

        if covered != region_size {
            return Err(PgasError::Internal(format!(
                "blocks cover {} of {} region bytes",
                covered, region_size
            )));
        }
        Ok(())
    }

    fn free_bytes_locked(&self) -> u64 {
        let mut free = 0u64;
        let mut offset = 0u64;
        loop {
            let header = self.read_header(offset);
            if header.is_free() {
                free += header.size;
            }
            match header.next {
                NIL => break,
                next => offset = next,
            }
        }
        free
    }

    fn read_header(&self, offset: u64) -> BlockHeader {
        // Block offsets are produced by this allocator and stay 8-byte
        // aligned and in bounds.
        unsafe { std::ptr::read(self.region.host_addr(offset) as *const BlockHeader) }
    }

    fn write_header(&self, offset: u64, header: BlockHeader) {
        unsafe { std::ptr::write(self.region.host_addr(offset) as *mut BlockHeader, header) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> RegionAllocator {
        let region = Arc::new(SharedRegion::open(1 << 20).unwrap());
        RegionAllocator::new(region).unwrap()
    }

    #[test]
    fn test_alloc_returns_payload_offset() {
        let heap = small_heap();
        let offset = heap.alloc(100, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(offset, BLOCK_HEADER_SIZE);
        assert_eq!(offset % 8, 0);
    }

    #[test]
    fn test_sizes_round_to_cache_line() {
        let heap = small_heap();
        let a = heap.alloc(1, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.alloc(65, DEFAULT_ALIGNMENT).unwrap();
        // 1 -> 64, so the second block starts one line plus a header later
        assert_eq!(b - a, 64 + BLOCK_HEADER_SIZE);

        let layout = heap.block_layout();
        assert_eq!(layout[0].size, 64);
        assert_eq!(layout[1].size, 128);
    }

    #[test]
    fn test_distinct_offsets() {
        let heap = small_heap();
        let offsets: Vec<u64> = (0..64)
            .map(|_| heap.alloc(64, DEFAULT_ALIGNMENT).unwrap())
            .collect();
        let mut unique = offsets.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), offsets.len());
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let heap = small_heap();
        let a = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();
        let c = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();
        let _d = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.validate().unwrap();

        // Freeing b joins a, b, and c into one block
        heap.free(b).unwrap();
        heap.validate().unwrap();

        let frees = heap
            .block_layout()
            .iter()
            .filter(|block| block.free)
            .count();
        assert_eq!(frees, 2); // merged front block plus the tail
    }

    #[test]
    fn test_free_all_restores_single_block() {
        let heap = small_heap();
        let offsets: Vec<u64> = (0..32)
            .map(|_| heap.alloc(256, DEFAULT_ALIGNMENT).unwrap())
            .collect();
        for offset in offsets {
            heap.free(offset).unwrap();
        }
        heap.validate().unwrap();

        let layout = heap.block_layout();
        assert_eq!(layout.len(), 1);
        assert!(layout[0].free);
        assert_eq!(layout[0].size, (1 << 20) - BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_out_of_memory() {
        let heap = small_heap();
        let err = heap.alloc(2 << 20, DEFAULT_ALIGNMENT).unwrap_err();
        match err {
            PgasError::OutOfMemory { requested, available } => {
                assert!(requested >= 2 << 20);
                assert!(available < 2 << 20);
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
    }

    #[test]
    fn test_reuse_after_free() {
        let heap = small_heap();
        let a = heap.alloc(128, DEFAULT_ALIGNMENT).unwrap();
        heap.free(a).unwrap();
        let b = heap.alloc(128, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let heap = small_heap();
        let a = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();
        heap.free(a).unwrap();
        heap.free(a).unwrap();
        heap.validate().unwrap();
    }

    #[test]
    fn test_free_out_of_range() {
        let heap = small_heap();
        assert!(heap.free(0).is_err());
        assert!(heap.free(u64::MAX).is_err());
    }

    #[test]
    fn test_stats_track_bytes() {
        let heap = small_heap();
        let a = heap.alloc(100, DEFAULT_ALIGNMENT).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.live_bytes, 128);

        heap.free(a).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.bytes_freed, 128);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        use std::sync::Arc as StdArc;
        let heap = StdArc::new(small_heap());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let heap = StdArc::clone(&heap);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let offset = heap.alloc(64, DEFAULT_ALIGNMENT).unwrap();
                    heap.free(offset).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        heap.validate().unwrap();
        assert_eq!(heap.stats().live_bytes, 0);
    }
}
