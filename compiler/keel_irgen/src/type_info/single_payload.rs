//! The single-payload enum tag protocol.
//!
//! An enum with one payload case and `E` empty cases stores the empty cases
//! in the payload's extra inhabitants first. Cases left over are encoded
//! with tag bytes after the payload: a nonzero tag byte value selects a
//! group of cases and the low bytes of the payload area (at most four)
//! select the case within the group.
//!
//! Tags are `i32`s: zero is the payload case, `i + 1` is empty case `i`.
//! Sizes are words. Everything here works on emitted values so the same code
//! serves fixed layouts (where it folds to constants) and runtime ones.

use keel_bits::ApInt;
use keel_ir::{BlockId, ValueId};

use crate::context::{Address, IrGenFunction};

/// Tag values and tag bytes an enum layout needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EnumTagCounts {
    pub num_tags: u64,
    pub num_tag_bytes: u64,
}

/// Tags needed for `payload_cases` payload cases and `empty_cases` empty
/// cases sharing a payload area of `payload_size` bytes. Empty cases are
/// packed into the payload area, so each extra tag value covers
/// `2^(8 * payload_size)` of them (all of them once the area has four bytes).
pub fn enum_tag_counts(payload_size: u64, empty_cases: u64, payload_cases: u64) -> EnumTagCounts {
    let mut num_tags = payload_cases;
    if empty_cases > 0 {
        if payload_size >= 4 {
            num_tags += 1;
        } else {
            let bits = payload_size * 8;
            let cases_per_tag = 1u64 << bits;
            num_tags += empty_cases.div_ceil(cases_per_tag);
        }
    }
    let num_tag_bytes = match num_tags {
        0 | 1 => 0,
        2..=255 => 1,
        256..=65535 => 2,
        _ => 4,
    };
    EnumTagCounts {
        num_tags,
        num_tag_bytes,
    }
}

// ---------------------------------------------------------------------------
// Variable-width loads and stores
// ---------------------------------------------------------------------------

/// Byte counts a variable-width access can have.
const WIDTHS: [u64; 4] = [1, 2, 3, 4];

/// Emit `emit(width)` for the byte count `num_bytes` (a word, at most four):
/// directly when it is a constant, else under a switch. Returns the `i32`
/// results joined by a phi; zero bytes yield zero.
fn with_byte_count(
    igf: &mut IrGenFunction<'_>,
    num_bytes: ValueId,
    mut emit: impl FnMut(&mut IrGenFunction<'_>, u64) -> ValueId,
) -> ValueId {
    if let Some(n) = igf.builder.const_u64(num_bytes) {
        return if n == 0 { igf.builder.const_i32(0) } else { emit(igf, n) };
    }
    let done = igf.builder.append_block("bytes.done");
    let none = igf.builder.append_block("bytes.0");
    let blocks: Vec<BlockId> = WIDTHS
        .iter()
        .map(|n| igf.builder.append_block(&format!("bytes.{n}")))
        .collect();
    let width = igf.builder.bit_width(num_bytes);
    let cases = WIDTHS
        .iter()
        .zip(&blocks)
        .map(|(n, block)| (ApInt::new(width, *n), *block))
        .collect();
    igf.builder.switch(num_bytes, none, cases);

    let mut incoming = Vec::with_capacity(WIDTHS.len() + 1);
    igf.builder.position_at_end(none);
    let zero = igf.builder.const_i32(0);
    igf.builder.br(done);
    incoming.push((zero, none));
    for (n, block) in WIDTHS.iter().zip(&blocks) {
        igf.builder.position_at_end(*block);
        let value = igf.conditional_dominance(|igf| emit(igf, *n));
        let end = igf.builder.current_block().unwrap_or(*block);
        igf.builder.br(done);
        incoming.push((value, end));
    }
    igf.builder.position_at_end(done);
    let i32_ty = igf.builder.i32_type();
    igf.builder.phi(i32_ty, &incoming)
}

/// Load `num_bytes` (a word, at most four) bytes at `addr` as an integer,
/// zero-extended to `i32`.
pub(crate) fn emit_load_bytes(igf: &mut IrGenFunction<'_>, addr: ValueId, num_bytes: ValueId) -> ValueId {
    with_byte_count(igf, num_bytes, |igf, n| {
        let int_ty = igf.builder.int_type((n * 8) as u32);
        let value = igf.builder.load(int_ty, addr, 1);
        let i32_ty = igf.builder.i32_type();
        igf.builder.zext(value, i32_ty)
    })
}

/// Store the low `num_bytes` (a word, at most four) bytes of the `i32`
/// `value` at `addr`.
pub(crate) fn emit_store_bytes(igf: &mut IrGenFunction<'_>, addr: ValueId, value: ValueId, num_bytes: ValueId) {
    with_byte_count(igf, num_bytes, |igf, n| {
        let int_ty = igf.builder.int_type((n * 8) as u32);
        let truncated = igf.builder.trunc(value, int_ty);
        igf.builder.store(truncated, addr, 1);
        igf.builder.const_i32(0)
    });
}

/// `min(size, 4)` for a word `size`.
pub(crate) fn emit_payload_index_bytes(igf: &mut IrGenFunction<'_>, size: ValueId) -> ValueId {
    let four = igf.builder.const_size(4);
    let big = igf.builder.icmp_uge(size, four);
    igf.builder.select(big, four, size)
}

/// Tag values and tag bytes (both words) for `extra_cases` (an `i32`) empty
/// cases sharing a `size`-byte payload area with `payload_cases` payload
/// cases. The dynamic counterpart of [`enum_tag_counts`].
pub(crate) fn emit_enum_tag_counts(
    igf: &mut IrGenFunction<'_>,
    size: ValueId,
    extra_cases: ValueId,
    payload_cases: u64,
) -> (ValueId, ValueId) {
    let b = &mut igf.builder;
    if let (Some(size), Some(extra)) = (b.const_u64(size), b.const_u64(extra_cases)) {
        let counts = enum_tag_counts(size, extra, payload_cases);
        return (b.const_size(counts.num_tags), b.const_size(counts.num_tag_bytes));
    }
    let word = b.size_type();
    let extra = b.zext(extra_cases, word);
    let zero = b.const_size(0);
    let one = b.const_size(1);
    let four = b.const_size(4);
    let big = b.icmp_uge(size, four);
    let has_extra = b.icmp_ne(extra, zero);
    let big_tags = b.select(has_extra, one, zero);
    // 2^(8 * size) cases per tag value; only used below four bytes.
    let bits = b.shl_const(size, 3);
    let cases_per_tag = b.shl(one, bits);
    let rounded = b.add(extra, cases_per_tag);
    let rounded = b.sub(rounded, one);
    let small_tags = b.lshr(rounded, bits);
    let extra_tags = b.select(big, big_tags, small_tags);
    let base = b.const_size(payload_cases);
    let num_tags = b.add(base, extra_tags);

    let two = b.const_size(2);
    let limit_one = b.const_size(256);
    let limit_two = b.const_size(65536);
    let fits_two = b.icmp_ult(num_tags, limit_two);
    let wide = b.select(fits_two, two, four);
    let fits_one = b.icmp_ult(num_tags, limit_one);
    let narrow = b.select(fits_one, one, wide);
    let needs_tag = b.icmp_ugt(num_tags, one);
    let num_tag_bytes = b.select(needs_tag, narrow, zero);
    (num_tags, num_tag_bytes)
}

// ---------------------------------------------------------------------------
// The protocol
// ---------------------------------------------------------------------------

/// Cases the payload's `xi_count` extra inhabitants cannot hold.
fn emit_extra_cases(igf: &mut IrGenFunction<'_>, num_empty_cases: ValueId, xi_count: ValueId) -> ValueId {
    let b = &mut igf.builder;
    let zero = b.const_i32(0);
    let overflow = b.icmp_ugt(num_empty_cases, xi_count);
    let extra = b.sub(num_empty_cases, xi_count);
    b.select(overflow, extra, zero)
}

fn is_const_zero(igf: &IrGenFunction<'_>, value: ValueId) -> bool {
    igf.builder.const_u64(value) == Some(0)
}

/// Read the tag of a single-payload enum whose payload has `size` bytes and
/// `xi_count` extra inhabitants. `get_xi_tag(igf, addr, xi_count)` reads the
/// payload's extra-inhabitant tag.
pub(crate) fn emit_get_enum_tag_single_payload(
    igf: &mut IrGenFunction<'_>,
    addr: Address,
    num_empty_cases: ValueId,
    size: ValueId,
    xi_count: ValueId,
    get_xi_tag: impl FnOnce(&mut IrGenFunction<'_>, Address, ValueId) -> ValueId,
) -> ValueId {
    let i32_ty = igf.builder.i32_type();
    let extra_cases = emit_extra_cases(igf, num_empty_cases, xi_count);
    let (_, num_tag_bytes) = emit_enum_tag_counts(igf, size, extra_cases, 1);
    let done = igf.builder.append_block("tag.done");
    let mut incoming: Vec<(ValueId, BlockId)> = Vec::new();

    if !is_const_zero(igf, num_tag_bytes) {
        let check = igf.builder.append_block("tag.check-extra");
        let extra = igf.builder.append_block("tag.extra");
        let no_extra = igf.builder.append_block("tag.no-extra");
        let zero = igf.builder.const_size(0);
        let has_tag_bytes = igf.builder.icmp_ne(num_tag_bytes, zero);
        igf.builder.cond_br(has_tag_bytes, check, no_extra);

        igf.builder.position_at_end(check);
        let extra_tag = igf.conditional_dominance(|igf| {
            let tag_addr = igf.builder.byte_offset(addr.ptr, size);
            emit_load_bytes(igf, tag_addr, num_tag_bytes)
        });
        let zero = igf.builder.const_i32(0);
        let in_extra = igf.builder.icmp_ne(extra_tag, zero);
        igf.builder.cond_br(in_extra, extra, no_extra);

        igf.builder.position_at_end(extra);
        let result = igf.conditional_dominance(|igf| {
            let index_bytes = emit_payload_index_bytes(igf, size);
            let payload_index = emit_load_bytes(igf, addr.ptr, index_bytes);
            let b = &mut igf.builder;
            let four = b.const_size(4);
            let big = b.icmp_uge(size, four);
            let one = b.const_i32(1);
            let bits = b.shl_const(size, 3);
            let bits = b.trunc(bits, i32_ty);
            let group = b.sub(extra_tag, one);
            let group = b.shl(group, bits);
            let zero = b.const_i32(0);
            let group = b.select(big, zero, group);
            let case_index = b.or(group, payload_index);
            let tag = b.add(case_index, xi_count);
            b.add(tag, one)
        });
        let end = igf.builder.current_block().unwrap_or(extra);
        igf.builder.br(done);
        incoming.push((result, end));
        igf.builder.position_at_end(no_extra);
    }

    if is_const_zero(igf, xi_count) {
        let zero = igf.builder.const_i32(0);
        let here = igf.builder.current_block().unwrap_or(done);
        igf.builder.br(done);
        incoming.push((zero, here));
    } else {
        let xi_block = igf.builder.append_block("tag.xi");
        let zero = igf.builder.const_i32(0);
        let has_xi = igf.builder.icmp_ne(xi_count, zero);
        let here = igf.builder.current_block().unwrap_or(done);
        igf.builder.cond_br(has_xi, xi_block, done);
        incoming.push((zero, here));

        igf.builder.position_at_end(xi_block);
        let tag = igf.conditional_dominance(|igf| get_xi_tag(igf, addr, xi_count));
        let end = igf.builder.current_block().unwrap_or(xi_block);
        igf.builder.br(done);
        incoming.push((tag, end));
    }

    igf.builder.position_at_end(done);
    igf.builder.phi(i32_ty, &incoming)
}

/// Store `tag` into a single-payload enum. For tag zero the payload must
/// already be in place. `store_xi_tag(igf, addr, tag, xi_count)` writes a
/// payload extra inhabitant.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_store_enum_tag_single_payload(
    igf: &mut IrGenFunction<'_>,
    addr: Address,
    tag: ValueId,
    num_empty_cases: ValueId,
    size: ValueId,
    xi_count: ValueId,
    store_xi_tag: impl FnOnce(&mut IrGenFunction<'_>, Address, ValueId, ValueId),
) {
    let i32_ty = igf.builder.i32_type();
    let extra_cases = emit_extra_cases(igf, num_empty_cases, xi_count);
    let (_, num_tag_bytes) = emit_enum_tag_counts(igf, size, extra_cases, 1);
    let no_tag_bytes = is_const_zero(igf, num_tag_bytes);
    let tag_addr = igf.builder.byte_offset(addr.ptr, size);

    let in_payload = igf.builder.append_block("store-tag.payload");
    let out_of_payload = igf.builder.append_block("store-tag.extra");
    let done = igf.builder.append_block("store-tag.done");
    let fits = igf.builder.icmp_ule(tag, xi_count);
    igf.builder.cond_br(fits, in_payload, out_of_payload);

    igf.builder.position_at_end(in_payload);
    igf.conditional_dominance(|igf| {
        if !no_tag_bytes {
            let zero = igf.builder.const_i32(0);
            emit_store_bytes(igf, tag_addr, zero, num_tag_bytes);
        }
        if is_const_zero(igf, xi_count) {
            igf.builder.br(done);
            return;
        }
        let store_xi = igf.builder.append_block("store-tag.xi");
        let zero = igf.builder.const_i32(0);
        let is_payload = igf.builder.icmp_eq(tag, zero);
        igf.builder.cond_br(is_payload, done, store_xi);
        igf.builder.position_at_end(store_xi);
        igf.conditional_dominance(|igf| store_xi_tag(igf, addr, tag, xi_count));
        igf.builder.br(done);
    });

    igf.builder.position_at_end(out_of_payload);
    igf.conditional_dominance(|igf| {
        if no_tag_bytes {
            // Every empty case fits the extra inhabitants.
            igf.builder.unreachable();
            return;
        }
        let b = &mut igf.builder;
        let one = b.const_i32(1);
        let case_index = b.sub(tag, xi_count);
        let case_index = b.sub(case_index, one);
        let four = b.const_size(4);
        let big = b.icmp_uge(size, four);
        let bits = b.shl_const(size, 3);
        let bits = b.trunc(bits, i32_ty);
        let group = b.lshr(case_index, bits);
        let group = b.add(group, one);
        let extra_tag = b.select(big, one, group);
        let low_mask = b.shl(one, bits);
        let low_mask = b.sub(low_mask, one);
        let low = b.and(case_index, low_mask);
        let payload_index = b.select(big, case_index, low);
        b.memset(addr.ptr, 0, size);
        let index_bytes = emit_payload_index_bytes(igf, size);
        emit_store_bytes(igf, addr.ptr, payload_index, index_bytes);
        emit_store_bytes(igf, tag_addr, extra_tag, num_tag_bytes);
        igf.builder.br(done);
    });

    igf.builder.position_at_end(done);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tag_counts() {
        // Four-byte payloads need one extra tag however many cases remain.
        assert_eq!(enum_tag_counts(8, 1000, 1), EnumTagCounts { num_tags: 2, num_tag_bytes: 1 });
        // One byte holds 256 cases per tag value.
        assert_eq!(enum_tag_counts(1, 257, 1), EnumTagCounts { num_tags: 3, num_tag_bytes: 1 });
        // Empty payloads spend one tag per case.
        assert_eq!(enum_tag_counts(0, 300, 0), EnumTagCounts { num_tags: 300, num_tag_bytes: 2 });
        assert_eq!(enum_tag_counts(0, 1, 0), EnumTagCounts { num_tags: 1, num_tag_bytes: 0 });
        assert_eq!(enum_tag_counts(8, 0, 3), EnumTagCounts { num_tags: 3, num_tag_bytes: 1 });
        assert_eq!(enum_tag_counts(0, 70000, 0).num_tag_bytes, 4);
    }
}
