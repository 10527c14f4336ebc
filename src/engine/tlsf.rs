//! Two-Level Segregated Fit allocator over an index-addressed arena.
//!
//! The span is a plain `Vec<u8>`; every block starts with a 48-byte header
//! serialized little-endian at its offset, and all links (physical
//! predecessor, free-list neighbours) are offsets with `u64::MAX` as nil.
//! Free blocks are threaded through a two-dimensional array of list heads
//! indexed by a first-level (power of two) and second-level (linear
//! subdivision) class, with one bitmap word per level so that a fitting list
//! is found with a couple of mask-and-scan steps.

use std::fmt::{Debug, Formatter};

use snafu::{ensure, OptionExt};

use super::{
    frag, AllocError, AllocatorEngine, BlockRecord, DoubleFreeSnafu, InvalidFreeSnafu,
    OutOfMemorySnafu, MIN_BLOCK_SIZE,
};
use crate::util::{ctz, ffs, fls};

/// Bytes of metadata in front of every block's usable region.
pub const HEADER_SIZE: u64 = 48;

const FL_INDEX_COUNT: usize = 32;
const SL_INDEX_COUNT: usize = 32;

/// Offset value standing in for "no block".
const NIL: u64 = u64::MAX;

const STATE_USED: u64 = 0;
const STATE_FREE: u64 = 1;

// byte offsets of the header fields
const OFF_SIZE: u64 = 0;
const OFF_ALLOCATED: u64 = 8;
const OFF_STATE: u64 = 16;
const OFF_PREV_PHYS: u64 = 24;
const OFF_NEXT_FREE: u64 = 32;
const OFF_PREV_FREE: u64 = 40;

#[derive(Clone, Copy)]
struct Header {
    /// Usable bytes after the header; the block occupies `HEADER_SIZE + size`.
    size: u64,
    allocated: u64,
    state: u64,
    prev_phys: u64,
    next_free: u64,
    prev_free: u64,
}

impl Header {
    fn is_free(&self) -> bool {
        self.state == STATE_FREE
    }
}

pub struct TlsfAllocator {
    arena: Vec<u8>,
    total: u64,
    allocated: u64,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    free_heads: [[u64; SL_INDEX_COUNT]; FL_INDEX_COUNT],
}

impl Debug for TlsfAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TlsfAllocator {{ total: {}, allocated: {}, blocks: {} }}",
            self.total,
            self.allocated,
            self.chain().count()
        )
    }
}

impl TlsfAllocator {
    /// Creates an engine over a `capacity`-byte span; the initial free block
    /// carries `capacity - HEADER_SIZE` usable bytes at offset 0.
    pub fn new(capacity: u64) -> Self {
        assert!(
            capacity >= HEADER_SIZE + MIN_BLOCK_SIZE,
            "capacity must hold at least one header plus a minimum block"
        );
        let mut engine = TlsfAllocator {
            arena: vec![0; capacity as usize],
            total: capacity,
            allocated: 0,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            free_heads: [[NIL; SL_INDEX_COUNT]; FL_INDEX_COUNT],
        };
        engine.store(
            0,
            Header {
                size: capacity - HEADER_SIZE,
                allocated: 0,
                state: STATE_FREE,
                prev_phys: NIL,
                next_free: NIL,
                prev_free: NIL,
            },
        );
        engine.insert_free(0);
        engine
    }

    /* arena access */

    fn read_word(&self, at: u64) -> u64 {
        let i = at as usize;
        u64::from_le_bytes(
            self.arena[i..i + 8]
                .try_into()
                .expect("header field is 8 bytes"),
        )
    }

    fn write_word(&mut self, at: u64, value: u64) {
        let i = at as usize;
        self.arena[i..i + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn header(&self, at: u64) -> Header {
        Header {
            size: self.read_word(at + OFF_SIZE),
            allocated: self.read_word(at + OFF_ALLOCATED),
            state: self.read_word(at + OFF_STATE),
            prev_phys: self.read_word(at + OFF_PREV_PHYS),
            next_free: self.read_word(at + OFF_NEXT_FREE),
            prev_free: self.read_word(at + OFF_PREV_FREE),
        }
    }

    fn store(&mut self, at: u64, header: Header) {
        self.write_word(at + OFF_SIZE, header.size);
        self.write_word(at + OFF_ALLOCATED, header.allocated);
        self.write_word(at + OFF_STATE, header.state);
        self.write_word(at + OFF_PREV_PHYS, header.prev_phys);
        self.write_word(at + OFF_NEXT_FREE, header.next_free);
        self.write_word(at + OFF_PREV_FREE, header.prev_free);
    }

    /* two-level mapping */

    /// First- and second-level class of a block of `size` usable bytes.
    ///
    /// Requests larger than the top bucket clamp into it; that is sound only
    /// because the span is bounded at construction, and the find path walks
    /// candidate lists instead of trusting the class alone.
    fn mapping_indexes(size: u64) -> (usize, usize) {
        let size = size.max(MIN_BLOCK_SIZE);
        let raw_fl = fls(size) - 1;
        let fl = (raw_fl - ctz(MIN_BLOCK_SIZE)) as usize;
        if fl >= FL_INDEX_COUNT {
            return (FL_INDEX_COUNT - 1, SL_INDEX_COUNT - 1);
        }
        let width = 1u64 << raw_fl;
        let sl = ((size & (width - 1)) * SL_INDEX_COUNT as u64 / width) as usize;
        (fl, sl)
    }

    /* segregated free lists */

    fn insert_free(&mut self, at: u64) {
        let mut block = self.header(at);
        let (fl, sl) = Self::mapping_indexes(block.size);

        let head = self.free_heads[fl][sl];
        block.next_free = head;
        block.prev_free = NIL;
        self.store(at, block);
        if head != NIL {
            self.write_word(head + OFF_PREV_FREE, at);
        }
        self.free_heads[fl][sl] = at;

        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    fn remove_free(&mut self, at: u64) {
        let block = self.header(at);
        let (fl, sl) = Self::mapping_indexes(block.size);

        if block.prev_free != NIL {
            self.write_word(block.prev_free + OFF_NEXT_FREE, block.next_free);
        } else if self.free_heads[fl][sl] == at {
            self.free_heads[fl][sl] = block.next_free;
        }
        if block.next_free != NIL {
            self.write_word(block.next_free + OFF_PREV_FREE, block.prev_free);
        }
        self.write_word(at + OFF_NEXT_FREE, NIL);
        self.write_word(at + OFF_PREV_FREE, NIL);

        if self.free_heads[fl][sl] == NIL {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    /// First block in the `(fl, sl)` list with at least `need` usable bytes.
    fn find_in_list(&self, fl: usize, sl: usize, need: u64) -> Option<u64> {
        let mut at = self.free_heads[fl][sl];
        while at != NIL {
            let block = self.header(at);
            if block.size >= need {
                return Some(at);
            }
            at = block.next_free;
        }
        None
    }

    /// Locates a free block with `size >= need`, or none.
    ///
    /// The request's own sub-bucket is walked because it can hold blocks
    /// smaller than `need`; every block in a higher sub-bucket or first
    /// level is at least one granule bigger, so their heads fit directly.
    /// The fit check stays on every path regardless, which keeps the
    /// guarantee intact even inside the clamped top bucket.
    fn mapping_find(&self, need: u64) -> Option<u64> {
        let (fl, sl) = Self::mapping_indexes(need);

        // same first level, this sub-bucket or above
        let mut mask = self.sl_bitmap[fl] & (!0u32 << sl);
        while mask != 0 {
            let sl = (ffs(u64::from(mask)) - 1) as usize;
            if let Some(at) = self.find_in_list(fl, sl, need) {
                return Some(at);
            }
            mask &= mask - 1;
        }

        // any higher first level, lowest populated sub-bucket
        for fl in fl + 1..FL_INDEX_COUNT {
            if self.sl_bitmap[fl] != 0 {
                let sl = (ffs(u64::from(self.sl_bitmap[fl])) - 1) as usize;
                if let Some(at) = self.find_in_list(fl, sl, need) {
                    return Some(at);
                }
            }
        }

        None
    }

    /* physical chain */

    fn chain(&self) -> PhysicalChain<'_> {
        PhysicalChain {
            engine: self,
            at: 0,
        }
    }

    /// Carves a trailing free block out of `at` if the remainder after `need`
    /// can hold a header plus a minimum block.
    fn split(&mut self, at: u64, need: u64) {
        let mut block = self.header(at);
        if block.size < need + HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let tail = at + HEADER_SIZE + need;
        let old_end = at + HEADER_SIZE + block.size;
        self.store(
            tail,
            Header {
                size: block.size - need - HEADER_SIZE,
                allocated: 0,
                state: STATE_FREE,
                prev_phys: at,
                next_free: NIL,
                prev_free: NIL,
            },
        );
        block.size = need;
        self.store(at, block);
        if old_end < self.total {
            self.write_word(old_end + OFF_PREV_PHYS, tail);
        }
        self.insert_free(tail);
    }

    /// Coalesces the free block at `at` with its physical neighbours and
    /// returns the offset of the surviving block.
    fn merge_neighbors(&mut self, at: u64) -> Result<u64, AllocError> {
        let mut block = self.header(at);

        // forward: the next block starts right after this one's span
        let next = at + HEADER_SIZE + block.size;
        if next < self.total && self.total - next >= HEADER_SIZE {
            let nb = self.header(next);
            let nb_valid = nb.state <= STATE_FREE
                && nb.size >= MIN_BLOCK_SIZE
                && nb.size <= self.total - next - HEADER_SIZE;
            if nb_valid && nb.is_free() {
                ensure!(nb.prev_phys == at, InvalidFreeSnafu { address: at });
                self.remove_free(next);
                let grown = block
                    .size
                    .checked_add(HEADER_SIZE + nb.size)
                    .context(InvalidFreeSnafu { address: at })?;
                block.size = grown;
                self.store(at, block);
                let new_end = at + HEADER_SIZE + grown;
                if new_end < self.total {
                    self.write_word(new_end + OFF_PREV_PHYS, at);
                }
            }
        }

        // backward: the physical predecessor, if any and free
        let mut survivor = at;
        let prev = block.prev_phys;
        if prev != NIL {
            ensure!(prev < at, InvalidFreeSnafu { address: at });
            let mut pb = self.header(prev);
            let pb_valid =
                pb.state <= STATE_FREE && pb.size >= MIN_BLOCK_SIZE && pb.size <= self.total;
            if pb_valid && pb.is_free() {
                ensure!(
                    prev + HEADER_SIZE + pb.size == at,
                    InvalidFreeSnafu { address: at }
                );
                self.remove_free(prev);
                let grown = pb
                    .size
                    .checked_add(HEADER_SIZE + block.size)
                    .context(InvalidFreeSnafu { address: at })?;
                pb.size = grown;
                self.store(prev, pb);
                let new_end = prev + HEADER_SIZE + grown;
                if new_end < self.total {
                    self.write_word(new_end + OFF_PREV_PHYS, prev);
                }
                survivor = prev;
            }
        }

        Ok(survivor)
    }

    /// End offset of the highest block holding a live allocation.
    fn highest_allocated_end(&self) -> u64 {
        self.chain()
            .filter(|(_, h)| !h.is_free())
            .map(|(at, h)| at + HEADER_SIZE + h.size)
            .max()
            .unwrap_or(0)
    }

    fn external_fragmentation_below(&self, limit: Option<u64>) -> f64 {
        if self.allocated == 0 {
            return 0.0;
        }

        let mut actual = [0u64; FL_INDEX_COUNT];
        let mut total_free = 0u64;
        for (at, header) in self.chain() {
            if limit.is_some_and(|limit| at >= limit) {
                break;
            }
            if header.is_free() {
                actual[Self::mapping_indexes(header.size).0] += 1;
                total_free += header.size;
            }
        }

        frag::fragmentation_index(&actual, total_free, MIN_BLOCK_SIZE, true)
    }

    fn rounded_request(request: u64) -> u64 {
        (request.saturating_add(7) & !7).max(MIN_BLOCK_SIZE)
    }
}

impl AllocatorEngine for TlsfAllocator {
    fn alloc(&mut self, request: u64) -> Result<u64, AllocError> {
        if request == 0 {
            return Ok(0);
        }

        let need = Self::rounded_request(request);
        let at = self
            .mapping_find(need)
            .context(OutOfMemorySnafu { requested: request })?;
        self.remove_free(at);
        self.split(at, need);

        let mut block = self.header(at);
        block.state = STATE_USED;
        block.allocated = request;
        self.store(at, block);
        self.allocated += request;
        Ok(at)
    }

    fn align_alloc(&mut self, request: u64) -> Result<u64, AllocError> {
        if request == 0 {
            return Ok(0);
        }

        // the leading slack never exceeds `need + HEADER_SIZE +
        // MIN_BLOCK_SIZE - 1`, so a block that big always satisfies the
        // alignment no matter where it sits
        let need = Self::rounded_request(request);
        let search = need
            .saturating_mul(2)
            .saturating_add(HEADER_SIZE + MIN_BLOCK_SIZE);
        let at = self
            .mapping_find(search)
            .context(OutOfMemorySnafu { requested: request })?;
        self.remove_free(at);
        let block = self.header(at);

        // first usable offset on the `need` grid; the leading slack must be
        // zero or big enough to stand alone as a free block
        let data = at + HEADER_SIZE;
        let mut aligned = data.div_ceil(need) * need;
        let mut slack = aligned - data;
        while slack > 0 && slack < HEADER_SIZE + MIN_BLOCK_SIZE {
            aligned += need;
            slack += need;
        }
        if slack + need > block.size {
            self.insert_free(at);
            return OutOfMemorySnafu { requested: request }.fail();
        }

        let at = if slack == 0 {
            at
        } else {
            // carve the slack into a leading free block and restart the
            // candidate at the aligned position
            let old_end = at + HEADER_SIZE + block.size;
            let carved = aligned - HEADER_SIZE;
            self.store(
                at,
                Header {
                    size: slack - HEADER_SIZE,
                    allocated: 0,
                    state: STATE_FREE,
                    prev_phys: block.prev_phys,
                    next_free: NIL,
                    prev_free: NIL,
                },
            );
            self.store(
                carved,
                Header {
                    size: block.size - slack,
                    allocated: 0,
                    state: STATE_FREE,
                    prev_phys: at,
                    next_free: NIL,
                    prev_free: NIL,
                },
            );
            if old_end < self.total {
                self.write_word(old_end + OFF_PREV_PHYS, carved);
            }
            self.insert_free(at);
            carved
        };

        self.split(at, need);
        let mut block = self.header(at);
        block.state = STATE_USED;
        block.allocated = request;
        self.store(at, block);
        self.allocated += request;
        Ok(at)
    }

    fn dealloc(&mut self, address: u64) -> Result<(), AllocError> {
        ensure!(
            address < self.total && self.total - address >= HEADER_SIZE,
            InvalidFreeSnafu { address }
        );

        let mut block = self.header(address);
        let valid = block.state <= STATE_FREE
            && block.size >= MIN_BLOCK_SIZE
            && block.size <= self.total - address - HEADER_SIZE
            && block.allocated <= block.size;
        ensure!(valid, InvalidFreeSnafu { address });
        ensure!(!block.is_free(), DoubleFreeSnafu { address });

        self.allocated -= block.allocated;
        block.state = STATE_FREE;
        block.allocated = 0;
        block.next_free = NIL;
        block.prev_free = NIL;
        self.store(address, block);

        let survivor = self.merge_neighbors(address)?;
        self.insert_free(survivor);
        Ok(())
    }

    fn total_space(&self) -> u64 {
        self.total
    }

    fn allocated_space(&self) -> u64 {
        self.allocated
    }

    fn internal_fragmentation(&self) -> f64 {
        if self.allocated == 0 {
            return 0.0;
        }
        let wasted: u64 = self
            .chain()
            .filter(|(_, h)| !h.is_free())
            .map(|(_, h)| h.size - h.allocated)
            .sum();
        wasted as f64 / self.allocated as f64
    }

    fn external_fragmentation(&self) -> f64 {
        self.external_fragmentation_below(None)
    }

    fn trimmed_external_fragmentation(&self) -> f64 {
        self.external_fragmentation_below(Some(self.highest_allocated_end()))
    }

    fn blocks(&self) -> Vec<BlockRecord> {
        self.chain()
            .map(|(at, h)| BlockRecord {
                address: at,
                size: h.size,
                free: h.is_free(),
                waste_ratio: if h.is_free() {
                    0.0
                } else {
                    (h.size - h.allocated) as f64 / h.size as f64
                },
            })
            .collect()
    }
}

/// Walks blocks in address order, stopping at the end of the span or at the
/// first header that no longer fits inside it.
struct PhysicalChain<'a> {
    engine: &'a TlsfAllocator,
    at: u64,
}

impl Iterator for PhysicalChain<'_> {
    type Item = (u64, Header);

    fn next(&mut self) -> Option<(u64, Header)> {
        let total = self.engine.total;
        if self.at >= total || total - self.at < HEADER_SIZE {
            return None;
        }
        let header = self.engine.header(self.at);
        if header.size == 0 || header.size > total - self.at - HEADER_SIZE {
            return None;
        }
        let item = (self.at, header);
        self.at += HEADER_SIZE + header.size;
        Some(item)
    }
}
