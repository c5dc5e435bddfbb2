//! Sparse-mask helpers.

use crate::ApInt;

/// Keep the `n` lowest set bits of `mask` and clear every set bit above them.
///
/// Used to trim a spare-bit mask to exactly the bits a tag value needs. If
/// `mask` has fewer than `n` set bits it is returned unchanged.
pub fn get_lowest_n_set_bits(mask: &ApInt, n: u32) -> ApInt {
    let mut result = mask.clone();
    let mut remaining = n;
    for bit in 0..mask.width() {
        if !mask.bit(bit) {
            continue;
        }
        if remaining > 0 {
            remaining -= 1;
        } else {
            result.clear_bit(bit);
        }
    }
    result
}
