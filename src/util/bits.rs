//! Bit-level helpers shared by the allocator engines and the renderer.
//!
//! All of them treat `x == 0` explicitly; the engines rely on that for
//! sentinel handling.

/// Smallest power of two greater than or equal to `x`; `next_pow2(0) == 1`.
pub fn next_pow2(x: u64) -> u64 {
    x.max(1).next_power_of_two()
}

/// Find Last Set: `floor(log2(x)) + 1`, or 0 when `x == 0`.
pub fn fls(x: u64) -> u32 {
    if x == 0 {
        0
    } else {
        64 - x.leading_zeros()
    }
}

/// Find First Set: index of the lowest set bit plus one, or 0 when `x == 0`.
pub fn ffs(x: u64) -> u32 {
    if x == 0 {
        0
    } else {
        x.trailing_zeros() + 1
    }
}

/// Count trailing zeros; the exact log2 for power-of-two sizes.
pub fn ctz(x: u64) -> u32 {
    x.trailing_zeros()
}
