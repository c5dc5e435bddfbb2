//! Emitted layout queries.
//!
//! Each query folds to a constant when the entry's layout is fixed and
//! otherwise computes the answer from the value witnesses of the archetypes
//! and resilient types below it. Sizes, strides and alignment masks are
//! words; extra inhabitant counts are `i32`; flags are `i1`.

use keel_bits::ApInt;
use keel_ir::{BlockId, TypeId, ValueId};
use smallvec::SmallVec;

use super::{LayoutId, TypeLayoutEntry};
use crate::context::{Address, IrGenFunction};
use crate::type_info::single_payload::emit_enum_tag_counts;
use crate::type_info::{fits_inline, MAX_EXTRA_INHABITANTS};

impl LayoutId {
    pub(crate) fn entry(self, igf: &IrGenFunction<'_>) -> TypeLayoutEntry {
        igf.layouts().get(self).clone()
    }

    /// Metadata of the type whose value witnesses implement this entry.
    pub(crate) fn emit_metadata(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        let entry = self.entry(igf);
        let ty = entry
            .metadata_type()
            .unwrap_or_else(|| panic!("{} layout has no metadata", entry.kind_name()));
        igf.emit_type_metadata(ty)
    }

    pub fn size(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if let Some(size) = igf.layouts().fixed_size(self) {
            return igf.builder.const_size(size);
        }
        match self.entry(igf) {
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_load_size(metadata)
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let (_, end) = emit_child_offsets(igf, &children);
                end
            }
            TypeLayoutEntry::Enum { .. } => {
                let (payload_size, _, num_tag_bytes) = self.emit_enum_counts(igf);
                igf.builder.add(payload_size, num_tag_bytes)
            }
            TypeLayoutEntry::Array { element, count } => {
                let stride = element.stride(igf);
                let count = igf.builder.const_size(count);
                igf.builder.mul(stride, count)
            }
            entry => unreachable_fixed(&entry),
        }
    }

    pub fn alignment_mask(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if let Some(align) = igf.layouts().fixed_alignment(self) {
            return igf.builder.const_size(align - 1);
        }
        match self.entry(igf) {
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_load_alignment_mask(metadata)
            }
            TypeLayoutEntry::AlignedGroup { children, min_align }
            | TypeLayoutEntry::Enum {
                cases: children,
                min_align,
                ..
            } => {
                let mut mask = igf.builder.const_size(min_align - 1);
                for child in children {
                    let child_mask = child.alignment_mask(igf);
                    mask = igf.builder.or(mask, child_mask);
                }
                mask
            }
            TypeLayoutEntry::Array { element, .. } => element.alignment_mask(igf),
            entry => unreachable_fixed(&entry),
        }
    }

    /// `max(1, round_up(size, alignment))`.
    pub fn stride(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if let Some(layout) = igf.layouts().fixed_layout(self) {
            return igf.builder.const_size(layout.stride());
        }
        let size = self.size(igf);
        let mask = self.alignment_mask(igf);
        let b = &mut igf.builder;
        let rounded = b.add(size, mask);
        let inverse = b.not(mask);
        let rounded = b.and(rounded, inverse);
        let one = b.const_size(1);
        let empty = b.icmp_ult(rounded, one);
        b.select(empty, one, rounded)
    }

    pub fn extra_inhabitant_count(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if let Some(count) = igf.layouts().fixed_xi_count(self) {
            return igf.builder.const_i32(count);
        }
        match self.entry(igf) {
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_load_extra_inhabitant_count(metadata)
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let mut best = igf.builder.const_i32(0);
                for child in children {
                    let count = child.extra_inhabitant_count(igf);
                    let greater = igf.builder.icmp_ugt(count, best);
                    best = igf.builder.select(greater, count, best);
                }
                best
            }
            TypeLayoutEntry::Enum {
                num_empty_cases,
                cases,
                ..
            } => {
                if let [payload] = cases.as_slice() {
                    let payload_count = payload.extra_inhabitant_count(igf);
                    let b = &mut igf.builder;
                    let empty = b.const_i32(num_empty_cases);
                    let zero = b.const_i32(0);
                    let left = b.icmp_ugt(payload_count, empty);
                    let remaining = b.sub(payload_count, empty);
                    return b.select(left, remaining, zero);
                }
                let (_, num_tags, num_tag_bytes) = self.emit_enum_counts(igf);
                emit_tag_value_extra_inhabitants(igf, num_tags, num_tag_bytes)
            }
            TypeLayoutEntry::Array { element, .. } => element.extra_inhabitant_count(igf),
            entry => unreachable_fixed(&entry),
        }
    }

    pub fn is_bitwise_takable(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if igf.layouts().is_statically_bitwise_takable(self) {
            return igf.builder.const_bool(true);
        }
        if igf.layouts().is_fixed_size(self) {
            return igf.builder.const_bool(false);
        }
        match self.entry(igf) {
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_load_is_bitwise_takable(metadata)
            }
            TypeLayoutEntry::AlignedGroup { children, .. } | TypeLayoutEntry::Enum { cases: children, .. } => {
                let mut all = igf.builder.const_bool(true);
                for child in children {
                    let takable = child.is_bitwise_takable(igf);
                    all = igf.builder.and_bool(all, takable);
                }
                all
            }
            TypeLayoutEntry::Array { element, .. } => element.is_bitwise_takable(igf),
            entry => unreachable_fixed(&entry),
        }
    }

    /// True if values fit an existential's inline buffer.
    pub fn is_inline(self, igf: &mut IrGenFunction<'_>) -> ValueId {
        if let Some(layout) = igf.layouts().fixed_layout(self) {
            let takable = igf.layouts().is_statically_bitwise_takable(self);
            let inline = fits_inline(layout.size, layout.align, takable, igf.target());
            return igf.builder.const_bool(inline);
        }
        if let Some(ty) = self.entry(igf).metadata_type() {
            let metadata = igf.emit_type_metadata(ty);
            return igf.emit_load_is_inline(metadata);
        }
        let size = self.size(igf);
        let mask = self.alignment_mask(igf);
        let takable = self.is_bitwise_takable(igf);
        let buffer = igf.builder.const_size(igf.target().fixed_buffer_size());
        let pointer_mask = igf.builder.const_size(igf.pointer_size() - 1);
        let fits = igf.builder.icmp_ule(size, buffer);
        let aligned = igf.builder.icmp_ule(mask, pointer_mask);
        let inline = igf.builder.and_bool(fits, aligned);
        igf.builder.and_bool(inline, takable)
    }
}

fn unreachable_fixed(entry: &TypeLayoutEntry) -> ! {
    panic!("{} layout is always fixed", entry.kind_name())
}

/// Tag values above `num_tags` that `num_tag_bytes` bytes can hold, as an
/// `i32`.
pub(crate) fn emit_tag_value_extra_inhabitants(
    igf: &mut IrGenFunction<'_>,
    num_tags: ValueId,
    num_tag_bytes: ValueId,
) -> ValueId {
    let b = &mut igf.builder;
    let i32_ty = b.i32_type();
    let zero = b.const_size(0);
    let four = b.const_size(4);
    let bits = b.shl_const(num_tag_bytes, 3);
    let one = b.const_size(1);
    let values = b.shl(one, bits);
    let count = b.sub(values, num_tags);
    let count = b.trunc(count, i32_ty);
    let max = b.const_i32(MAX_EXTRA_INHABITANTS);
    let wide = b.icmp_uge(num_tag_bytes, four);
    let count = b.select(wide, max, count);
    let none = b.icmp_eq(num_tag_bytes, zero);
    let zero = b.const_i32(0);
    b.select(none, zero, count)
}

/// Byte offsets (words) of `children` laid out in order, and the end of the
/// last one. Constant while the children are fixed.
pub(crate) fn emit_child_offsets(
    igf: &mut IrGenFunction<'_>,
    children: &[LayoutId],
) -> (SmallVec<[ValueId; 4]>, ValueId) {
    let mut offsets = SmallVec::new();
    let mut offset = igf.builder.const_size(0);
    for child in children {
        let mask = child.alignment_mask(igf);
        let b = &mut igf.builder;
        let rounded = b.add(offset, mask);
        let inverse = b.not(mask);
        let aligned = b.and(rounded, inverse);
        offsets.push(aligned);
        let size = child.size(igf);
        offset = igf.builder.add(aligned, size);
    }
    (offsets, offset)
}

fn child_address(igf: &mut IrGenFunction<'_>, base: Address, child: LayoutId, offset: ValueId) -> Address {
    let ptr = igf.builder.byte_offset(base.ptr, offset);
    let align = igf.layouts().fixed_alignment(child).unwrap_or(1);
    Address::new(ptr, align)
}

/// Call `emit` for each child of a group with its address in `base`.
pub(crate) fn with_each_entry(
    igf: &mut IrGenFunction<'_>,
    children: &[LayoutId],
    base: Address,
    mut emit: impl FnMut(&mut IrGenFunction<'_>, LayoutId, Address),
) {
    let (offsets, _) = emit_child_offsets(igf, children);
    for (child, offset) in children.iter().zip(offsets) {
        let addr = child_address(igf, base, *child, offset);
        emit(igf, *child, addr);
    }
}

/// Call `emit` for each child of a group with its addresses in `dest` and
/// `src`.
pub(crate) fn with_each_entry_pair(
    igf: &mut IrGenFunction<'_>,
    children: &[LayoutId],
    dest: Address,
    src: Address,
    mut emit: impl FnMut(&mut IrGenFunction<'_>, LayoutId, Address, Address),
) {
    let (offsets, _) = emit_child_offsets(igf, children);
    for (child, offset) in children.iter().zip(offsets) {
        let dest_child = child_address(igf, dest, *child, offset);
        let src_child = child_address(igf, src, *child, offset);
        emit(igf, *child, dest_child, src_child);
    }
}

/// Call `emit` with the child of a group that provides its extra
/// inhabitants: the one with the most, first on ties. Picked statically
/// when the group is fixed, else by a switch over the children. When
/// `result` is given, `emit` returns a value of that type on every path.
pub(crate) fn with_extra_inhabitant_providing_entry(
    igf: &mut IrGenFunction<'_>,
    children: &[LayoutId],
    base: Address,
    result: Option<TypeId>,
    mut emit: impl FnMut(&mut IrGenFunction<'_>, LayoutId, Address) -> Option<ValueId>,
) -> Option<ValueId> {
    if let Some((child, offset)) = igf.layouts().static_extra_inhabitant_provider(children) {
        let ptr = igf.builder.byte_offset_const(base.ptr, offset);
        let align = igf.layouts().fixed_alignment(child).unwrap_or(1);
        return emit(igf, child, Address::new(ptr, align));
    }

    let (offsets, _) = emit_child_offsets(igf, children);
    let mut best_index = igf.builder.const_i32(0);
    let mut best_count = igf.builder.const_i32(0);
    for (i, child) in children.iter().enumerate() {
        let count = child.extra_inhabitant_count(igf);
        let index = igf.builder.const_i32(i as u32);
        let greater = igf.builder.icmp_ugt(count, best_count);
        best_count = igf.builder.select(greater, count, best_count);
        best_index = igf.builder.select(greater, index, best_index);
    }
    let addresses: SmallVec<[Address; 4]> = children
        .iter()
        .zip(offsets)
        .map(|(child, offset)| child_address(igf, base, *child, offset))
        .collect();

    let done = igf.builder.append_block("xi-provider.done");
    let blocks: SmallVec<[BlockId; 4]> = (0..children.len())
        .map(|i| igf.builder.append_block(&format!("xi-provider.{i}")))
        .collect();
    let cases = blocks
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, block)| (ApInt::new(32, i as u64), *block))
        .collect();
    igf.builder.switch(best_index, blocks[0], cases);

    let mut incoming = Vec::new();
    for ((child, addr), block) in children.iter().zip(addresses).zip(&blocks) {
        igf.builder.position_at_end(*block);
        let value = igf.conditional_dominance(|igf| emit(igf, *child, addr));
        let end = igf.builder.current_block().unwrap_or(*block);
        igf.builder.br(done);
        incoming.extend(value.map(|v| (v, end)));
    }
    igf.builder.position_at_end(done);
    result.map(|ty| igf.builder.phi(ty, &incoming))
}

impl LayoutId {
    /// Payload area size, tag value count and tag byte count (all words) of
    /// an enum entry.
    pub(crate) fn emit_enum_counts(self, igf: &mut IrGenFunction<'_>) -> (ValueId, ValueId, ValueId) {
        let TypeLayoutEntry::Enum {
            num_empty_cases,
            cases,
            ..
        } = self.entry(igf)
        else {
            panic!("enum counts of a non-enum layout");
        };
        if let [payload] = cases.as_slice() {
            let size = payload.size(igf);
            let payload_count = payload.extra_inhabitant_count(igf);
            let b = &mut igf.builder;
            let empty = b.const_i32(num_empty_cases);
            let zero = b.const_i32(0);
            let overflow = b.icmp_ugt(empty, payload_count);
            let extra = b.sub(empty, payload_count);
            let extra = b.select(overflow, extra, zero);
            let (num_tags, num_tag_bytes) = emit_enum_tag_counts(igf, size, extra, 1);
            return (size, num_tags, num_tag_bytes);
        }
        let mut payload_size = igf.builder.const_size(0);
        for case in &cases {
            let size = case.size(igf);
            let larger = igf.builder.icmp_ugt(size, payload_size);
            payload_size = igf.builder.select(larger, size, payload_size);
        }
        let empty = igf.builder.const_i32(num_empty_cases);
        let (num_tags, num_tag_bytes) = emit_enum_tag_counts(igf, payload_size, empty, cases.len() as u64);
        (payload_size, num_tags, num_tag_bytes)
    }
}
