//! Binary buddy allocator over a simulated power-of-two span.
//!
//! Blocks live in an address-ordered map; allocation is first-fit by address
//! with halve-in-place splitting, deallocation coalesces buddies (the block
//! at `address XOR size`) until no pair of equal-sized free siblings remains.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use snafu::{ensure, OptionExt};

use super::{
    frag, AllocError, AllocatorEngine, BlockRecord, DoubleFreeSnafu, InvalidFreeSnafu,
    OutOfMemorySnafu, MIN_BLOCK_SIZE,
};
use crate::util::{fls, next_pow2};

#[derive(Clone, Copy)]
struct Block {
    size: u64,
    allocated: u64,
    free: bool,
}

pub struct BuddyAllocator {
    total: u64,
    allocated: u64,
    blocks: BTreeMap<u64, Block>,
}

impl Debug for BuddyAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BuddyAllocator {{ total: {}, allocated: {}, blocks: {} }}",
            self.total,
            self.allocated,
            self.blocks.len()
        )
    }
}

impl BuddyAllocator {
    /// Creates an engine spanning `capacity` bytes rounded up to the next
    /// power of two, as one free block at address 0.
    pub fn new(capacity: u64) -> Self {
        let total = next_pow2(capacity).max(MIN_BLOCK_SIZE);
        let mut blocks = BTreeMap::new();
        blocks.insert(
            0,
            Block {
                size: total,
                allocated: 0,
                free: true,
            },
        );
        BuddyAllocator {
            total,
            allocated: 0,
            blocks,
        }
    }

    fn block_size_for(request: u64) -> u64 {
        next_pow2(request).max(MIN_BLOCK_SIZE)
    }

    /// Halves the free block at `addr` until it reaches `need`, inserting the
    /// upper halves back into the map as free blocks, then marks it allocated.
    fn take(&mut self, addr: u64, need: u64, request: u64) {
        let mut size = self.blocks[&addr].size;
        while size > need && size > MIN_BLOCK_SIZE {
            let half = size >> 1;
            self.blocks.insert(
                addr + half,
                Block {
                    size: half,
                    allocated: 0,
                    free: true,
                },
            );
            size = half;
        }

        let block = self
            .blocks
            .get_mut(&addr)
            .expect("candidate block vanished during split");
        block.size = size;
        block.free = false;
        block.allocated = request;
        self.allocated += request;
    }

    /// End offset of the highest block holding a live allocation.
    fn highest_allocated_end(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.free)
            .map(|(addr, b)| addr + b.size)
            .max()
            .unwrap_or(0)
    }

    fn external_fragmentation_below(&self, limit: Option<u64>) -> f64 {
        if self.allocated == 0 {
            return 0.0;
        }

        let classes = (fls(self.total) - fls(MIN_BLOCK_SIZE) + 1) as usize;
        let mut actual = vec![0u64; classes];
        let mut total_free = 0u64;
        for (addr, block) in &self.blocks {
            if limit.is_some_and(|limit| *addr >= limit) {
                break;
            }
            if block.free {
                actual[(fls(block.size) - fls(MIN_BLOCK_SIZE)) as usize] += 1;
                total_free += block.size;
            }
        }

        frag::fragmentation_index(&actual, total_free, MIN_BLOCK_SIZE, false)
    }
}

impl AllocatorEngine for BuddyAllocator {
    fn alloc(&mut self, request: u64) -> Result<u64, AllocError> {
        if request == 0 {
            return Ok(0);
        }

        let need = Self::block_size_for(request);
        let addr = self
            .blocks
            .iter()
            .find(|(_, b)| b.free && b.size >= need)
            .map(|(addr, _)| *addr)
            .context(OutOfMemorySnafu { requested: request })?;

        self.take(addr, need, request);
        Ok(addr)
    }

    fn align_alloc(&mut self, request: u64) -> Result<u64, AllocError> {
        if request == 0 {
            return Ok(0);
        }

        // Every block is naturally aligned to its own size, so a free block
        // large enough is already on the `need` grid; candidates are still
        // checked against the grid rather than assumed.
        let need = Self::block_size_for(request);
        let addr = self
            .blocks
            .iter()
            .filter(|(_, b)| b.free && b.size >= need)
            .find(|(addr, b)| {
                let grid = (*addr).div_ceil(need) * need;
                grid + need <= *addr + b.size
            })
            .map(|(addr, _)| *addr)
            .context(OutOfMemorySnafu { requested: request })?;
        debug_assert_eq!(addr % need, 0, "buddy block off its natural grid");

        self.take(addr, need, request);
        Ok(addr)
    }

    fn dealloc(&mut self, address: u64) -> Result<(), AllocError> {
        let block = self
            .blocks
            .get_mut(&address)
            .context(InvalidFreeSnafu { address })?;
        ensure!(!block.free, DoubleFreeSnafu { address });

        self.allocated -= block.allocated;
        block.free = true;
        block.allocated = 0;
        let mut size = block.size;

        // coalesce with the buddy until the sibling is missing, busy, or of
        // a different size
        let mut addr = address;
        while size < self.total {
            let buddy = addr ^ size;
            match self.blocks.get(&buddy) {
                Some(b) if b.free && b.size == size => {}
                _ => break,
            }

            let lower = addr.min(buddy);
            self.blocks.remove(&addr.max(buddy));
            size <<= 1;
            self.blocks
                .get_mut(&lower)
                .expect("surviving buddy vanished during merge")
                .size = size;
            addr = lower;
        }

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
            .blocks
            .values()
            .filter(|b| !b.free)
            .map(|b| b.size - b.allocated)
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
        self.blocks
            .iter()
            .map(|(addr, b)| BlockRecord {
                address: *addr,
                size: b.size,
                free: b.free,
                waste_ratio: if b.free {
                    0.0
                } else {
                    (b.size - b.allocated) as f64 / b.size as f64
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Sweeps the whole map checking the §-invariants that must hold after
    /// every operation: exact tiling, natural alignment, bookkeeping, and
    /// full coalescing.
    fn check_invariants(a: &BuddyAllocator) {
        let mut cursor = 0u64;
        let mut allocated = 0u64;
        for (addr, block) in &a.blocks {
            assert_eq!(*addr, cursor, "gap or overlap at {addr:#x}");
            assert!(block.size.is_power_of_two());
            assert!(block.size >= MIN_BLOCK_SIZE && block.size <= a.total);
            assert_eq!(addr % block.size, 0, "block off its natural alignment");
            if block.free {
                assert_eq!(block.allocated, 0);
                if block.size < a.total {
                    let buddy = addr ^ block.size;
                    if let Some(sibling) = a.blocks.get(&buddy) {
                        assert!(
                            !(sibling.free && sibling.size == block.size),
                            "uncoalesced buddy pair at {addr:#x}/{buddy:#x}"
                        );
                    }
                }
            } else {
                assert!(block.allocated <= block.size);
                allocated += block.allocated;
            }
            cursor += block.size;
        }
        assert_eq!(cursor, a.total, "blocks do not tile the span");
        assert_eq!(allocated, a.allocated);
    }

    #[test]
    fn fresh_engine_is_one_free_block() {
        let a = BuddyAllocator::new(1024);
        assert_eq!(a.total_space(), 1024);
        assert_eq!(a.free_space(), 1024);
        assert_eq!(a.internal_fragmentation(), 0.0);
        assert_eq!(a.external_fragmentation(), 0.0);

        let blocks = a.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].address, 0);
        assert_eq!(blocks[0].size, 1024);
        assert!(blocks[0].free);
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        assert_eq!(BuddyAllocator::new(1000).total_space(), 1024);
        assert_eq!(BuddyAllocator::new(1).total_space(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn split_cascade_places_first_fit_blocks() {
        let mut a = BuddyAllocator::new(1024);

        let x = a.alloc(100).unwrap();
        assert_eq!(x, 0);
        let blocks = a.blocks();
        assert_eq!(blocks[0].size, 128);
        assert!(!blocks[0].free);
        // the cascade leaves free buddies at 128, 256 and 512
        assert_eq!(
            blocks[1..]
                .iter()
                .map(|b| (b.address, b.size, b.free))
                .collect::<Vec<_>>(),
            vec![(128, 128, true), (256, 256, true), (512, 512, true)]
        );
        assert_eq!(a.free_space(), 1024 - 100);

        // next_pow2(50) = 64, so the 128-block at 128 splits once
        let y = a.alloc(50).unwrap();
        assert_eq!(y, 128);
        let blocks = a.blocks();
        assert_eq!(blocks[1].address, 128);
        assert_eq!(blocks[1].size, 64);
        assert!(!blocks[1].free);
        assert_eq!(blocks[2].address, 192);
        assert_eq!(blocks[2].size, 64);
        assert!(blocks[2].free);

        check_invariants(&a);
    }

    #[test]
    fn dealloc_coalesces_back_to_the_full_span() {
        let mut a = BuddyAllocator::new(1024);
        let x = a.alloc(100).unwrap();
        let y = a.alloc(50).unwrap();

        a.dealloc(x).unwrap();
        check_invariants(&a);
        a.dealloc(y).unwrap();
        check_invariants(&a);

        let blocks = a.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 1024);
        assert!(blocks[0].free);
    }

    #[test]
    fn internal_fragmentation_is_waste_per_requested_byte() {
        let mut a = BuddyAllocator::new(2048);
        for request in [17, 40, 48, 56, 31] {
            a.alloc(request).unwrap();
        }
        // rounded blocks are 32, 64, 64, 64, 32 against 192 requested bytes
        let expected = 64.0 / 192.0;
        assert!((a.internal_fragmentation() - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_request_is_a_sentinel() {
        let mut a = BuddyAllocator::new(1024);
        assert_eq!(a.alloc(0).unwrap(), 0);
        assert_eq!(a.align_alloc(0).unwrap(), 0);
        assert_eq!(a.free_space(), 1024);
        assert_eq!(a.blocks().len(), 1);
    }

    #[test]
    fn one_byte_rounds_to_the_minimum_block() {
        let mut a = BuddyAllocator::new(1024);
        let addr = a.alloc(1).unwrap();
        let block = &a.blocks()[0];
        assert_eq!(block.address, addr);
        assert_eq!(block.size, MIN_BLOCK_SIZE);
        check_invariants(&a);
    }

    #[test]
    fn whole_span_allocates_exactly_once() {
        let mut a = BuddyAllocator::new(1024);
        let addr = a.alloc(1024).unwrap();
        assert_eq!(addr, 0);
        assert_eq!(
            a.alloc(1),
            Err(AllocError::OutOfMemory { requested: 1 })
        );
        a.dealloc(addr).unwrap();
        assert_eq!(a.alloc(1024).unwrap(), 0);
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let mut a = BuddyAllocator::new(1024);
        assert_eq!(
            a.alloc(1025),
            Err(AllocError::OutOfMemory { requested: 1025 })
        );
        // a failed alloc leaves the engine untouched
        assert_eq!(a.free_space(), 1024);
        assert_eq!(a.blocks().len(), 1);
    }

    #[test]
    fn unknown_address_is_an_invalid_free() {
        let mut a = BuddyAllocator::new(1024);
        a.alloc(100).unwrap();
        assert_eq!(
            a.dealloc(64),
            Err(AllocError::InvalidFree { address: 64 })
        );
    }

    #[test]
    fn freeing_twice_is_a_double_free() {
        let mut a = BuddyAllocator::new(1024);
        let x = a.alloc(100).unwrap();
        let y = a.alloc(100).unwrap();
        a.dealloc(y).unwrap();
        assert_eq!(a.dealloc(y), Err(AllocError::DoubleFree { address: y }));
        // x is unaffected by the failed free
        a.dealloc(x).unwrap();
    }

    #[test]
    fn align_alloc_returns_addresses_on_the_request_grid() {
        let mut a = BuddyAllocator::new(4096);
        for request in [1, 17, 100, 250, 513] {
            let need = BuddyAllocator::block_size_for(request);
            let addr = a.align_alloc(request).unwrap();
            assert_eq!(addr % need, 0);
        }
        check_invariants(&a);
    }

    #[test]
    fn align_alloc_matches_alloc_under_natural_alignment() {
        let mut plain = BuddyAllocator::new(2048);
        let mut aligned = BuddyAllocator::new(2048);
        for request in [100, 50, 300, 16, 64] {
            assert_eq!(
                plain.alloc(request).unwrap(),
                aligned.align_alloc(request).unwrap()
            );
        }
    }

    #[test]
    fn alloc_dealloc_round_trip_restores_the_engine() {
        let mut a = BuddyAllocator::new(2048);
        a.alloc(100).unwrap();
        a.alloc(33).unwrap();

        let before_blocks = a.blocks();
        let before_free = a.free_space();
        let before_frag = a.external_fragmentation();

        let addr = a.alloc(200).unwrap();
        a.dealloc(addr).unwrap();

        assert_eq!(a.blocks(), before_blocks);
        assert_eq!(a.free_space(), before_free);
        assert_eq!(a.external_fragmentation(), before_frag);
    }

    #[test]
    fn metrics_are_pure() {
        let mut a = BuddyAllocator::new(2048);
        a.alloc(100).unwrap();
        a.alloc(17).unwrap();
        assert_eq!(a.internal_fragmentation(), a.internal_fragmentation());
        assert_eq!(a.external_fragmentation(), a.external_fragmentation());
        assert_eq!(
            a.trimmed_external_fragmentation(),
            a.trimmed_external_fragmentation()
        );
    }

    #[test]
    fn trimmed_fragmentation_ignores_the_free_tail() {
        let mut a = BuddyAllocator::new(256);
        let addrs: Vec<u64> = (0..8).map(|_| a.alloc(16).unwrap()).collect();
        a.dealloc(addrs[0]).unwrap();
        a.dealloc(addrs[2]).unwrap();

        // two 16-byte holes below the last allocation: the trimmed view sees
        // 32 free bytes that cannot serve the 32-byte class at all, while in
        // the full view the pristine 128-byte tail drowns the holes out
        let trimmed = a.trimmed_external_fragmentation();
        let full = a.external_fragmentation();
        assert!((trimmed - 0.5).abs() < 1e-12);
        assert!(full < trimmed);
    }

    #[test]
    fn random_stress_keeps_every_invariant() {
        let mut a = BuddyAllocator::new(64 * 1024);
        let mut live: Vec<u64> = Vec::new();
        let mut rng = rand::rng();

        for _ in 0..4000 {
            if live.is_empty() || rng.random_range(0..100) < 60 {
                let request = rng.random_range(1..=2048);
                match a.alloc(request) {
                    Ok(addr) => {
                        assert!(!live.contains(&addr), "duplicate outstanding address");
                        live.push(addr);
                    }
                    Err(AllocError::OutOfMemory { .. }) => {
                        let addr = live.swap_remove(rng.random_range(0..live.len()));
                        a.dealloc(addr).unwrap();
                    }
                    Err(err) => panic!("unexpected error: {err}"),
                }
            } else {
                let addr = live.swap_remove(rng.random_range(0..live.len()));
                a.dealloc(addr).unwrap();
            }
            check_invariants(&a);
        }

        // freeing everything in arbitrary order collapses to one block
        while let Some(addr) = live.pop() {
            a.dealloc(addr).unwrap();
        }
        let blocks = a.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, a.total_space());
        assert!(blocks[0].free);
    }
}
