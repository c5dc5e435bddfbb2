//! Scatter and gather of sparse bit masks, on constants and on IR values.
//!
//! Scattering deposits the low bits of a packed value into the set bits of
//! a mask, lowest set bit first. Gathering is the inverse: it extracts the
//! bits selected by a mask and packs them at the low end of the result.

use keel_bits::ApInt;
use keel_ir::{IrBuilder, ValueId};
use smallvec::SmallVec;

/// Maximal runs of set bits in `mask` as `(lowest bit, length)`, from bit 0
/// upward.
pub(crate) fn set_bit_runs(mask: &ApInt) -> SmallVec<[(u32, u32); 4]> {
    let mut runs = SmallVec::new();
    let mut bit = 0;
    while bit < mask.width() {
        if !mask.bit(bit) {
            bit += 1;
            continue;
        }
        let start = bit;
        while bit < mask.width() && mask.bit(bit) {
            bit += 1;
        }
        runs.push((start, bit - start));
    }
    runs
}

/// Pack the bits of `value` selected by `mask` into the low
/// `mask.count_ones()` bits of the result.
pub fn gather_bits(mask: &ApInt, value: &ApInt) -> ApInt {
    assert!(
        mask.width() == value.width(),
        "gather of an i{} value through an i{} mask",
        value.width(),
        mask.width()
    );
    let mut result = ApInt::zero(mask.count_ones());
    let mut used = 0;
    for (low, len) in set_bit_runs(mask) {
        result.insert_bits(&value.extract_bits(len, low), used);
        used += len;
    }
    result
}

/// Spread the low bits of `value` over the set bits of `mask`. Bits of
/// `value` beyond the mask's population are dropped.
pub fn scatter_bits(mask: &ApInt, value: &ApInt) -> ApInt {
    let mut result = ApInt::zero(mask.width());
    let mut used = 0;
    for (low, len) in set_bit_runs(mask) {
        if used >= value.width() {
            break;
        }
        let take = len.min(value.width() - used);
        result.insert_bits(&value.extract_bits(take, used), low);
        used += len;
    }
    result
}

/// Emit a scatter of `source`, starting at its bit `packed_low_bit`, into the
/// set bits of `mask`. The result is an integer as wide as `mask`.
pub(crate) fn emit_scatter_bits(
    b: &mut IrBuilder<'_>,
    mask: &ApInt,
    source: ValueId,
    packed_low_bit: u32,
) -> ValueId {
    let result_ty = b.int_type(mask.width());
    let source_ty = b.type_of(source);
    let source_width = b.bit_width(source);
    let mut result: Option<ValueId> = None;
    let mut used = 0;
    for (low, len) in set_bit_runs(mask) {
        let shift = packed_low_bit + used;
        if shift >= source_width {
            break;
        }
        let part = b.lshr_const(source, shift);
        let keep = b.const_typed(source_ty, &ApInt::low_bits_set(source_width, len.min(source_width)));
        let part = b.and(part, keep);
        let part = b.zext_or_trunc(part, result_ty);
        let part = b.shl_const(part, low);
        result = Some(match result {
            Some(acc) => b.or(acc, part),
            None => part,
        });
        used += len;
    }
    result.unwrap_or_else(|| b.const_zero(result_ty))
}

/// Emit a gather of the bits of `source` selected by `mask`, placed in an
/// integer of `result_width` bits starting at bit `result_low_bit`.
pub(crate) fn emit_gather_bits(
    b: &mut IrBuilder<'_>,
    mask: &ApInt,
    source: ValueId,
    result_low_bit: u32,
    result_width: u32,
) -> ValueId {
    let result_ty = b.int_type(result_width);
    let source_ty = b.type_of(source);
    let source_width = b.bit_width(source);
    assert!(
        mask.width() == source_width,
        "gather from i{source_width} through an i{} mask",
        mask.width()
    );
    let mut result: Option<ValueId> = None;
    let mut used = 0;
    for (low, len) in set_bit_runs(mask) {
        let at = result_low_bit + used;
        if at >= result_width {
            break;
        }
        let part = b.lshr_const(source, low);
        let keep = b.const_typed(source_ty, &ApInt::low_bits_set(source_width, len));
        let part = b.and(part, keep);
        let part = b.zext_or_trunc(part, result_ty);
        let part = b.shl_const(part, at);
        result = Some(match result {
            Some(acc) => b.or(acc, part),
            None => part,
        });
        used += len;
    }
    result.unwrap_or_else(|| b.const_zero(result_ty))
}
