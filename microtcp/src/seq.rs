//! Wrap-around sequence-number comparisons.
//!
//! Sequence numbers are `u32` and wrap modulo 2³².  Two numbers are compared
//! by the sign of their difference, which is meaningful as long as they are
//! less than `u32::MAX / 2` apart (always the case for a bounded window).

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is strictly before `b`.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}
