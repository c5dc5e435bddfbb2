//! Enum layouts: copy strategies, the case tag and multi-payload encoding.
//!
//! Enums use the runtime's generic layout. A single payload case keeps its
//! empty cases in the payload's extra inhabitants and spills the rest into
//! tag bytes after it (see [`single_payload`](crate::type_info::single_payload)).
//! Multiple payload cases share a payload area as large as the largest case,
//! followed by tag bytes: tag values below the payload case count select a
//! payload case, higher ones select a group of empty cases whose index
//! within the group is in the low (at most four) bytes of the payload area.
//!
//! Case tags number the payload cases first, in declaration order, then the
//! empty cases.

use keel_bits::{ApInt, Endianness};
use keel_ir::ValueId;

use super::ops::{assign_scalar, destroy_scalar, initialize_scalar};
use super::{LayoutId, ScalarKind, TypeLayoutCache, TypeLayoutEntry};
use crate::context::{Address, IrGenFunction};
use crate::type_info::single_payload::{emit_load_bytes, emit_payload_index_bytes, emit_store_bytes};
use crate::type_info::{enum_tag_counts, place_bytes};

/// Static payload area and tag encoding of a fixed enum.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct EnumShape {
    pub payload_size: u64,
    pub num_tags: u64,
    pub tag_bytes: u64,
}

impl EnumShape {
    pub(crate) fn of(cache: &TypeLayoutCache, id: LayoutId) -> Option<Self> {
        let TypeLayoutEntry::Enum {
            num_empty_cases,
            cases,
            ..
        } = cache.get(id)
        else {
            return None;
        };
        let empty = u64::from(*num_empty_cases);
        let (payload_size, counts) = if let [payload] = cases.as_slice() {
            let payload = cache.fixed_layout(*payload)?;
            let spilled = empty.saturating_sub(u64::from(payload.extra_inhabitants));
            (payload.size, enum_tag_counts(payload.size, spilled, 1))
        } else {
            let mut payload_size = 0;
            for case in cases {
                payload_size = payload_size.max(cache.fixed_size(*case)?);
            }
            (payload_size, enum_tag_counts(payload_size, empty, cases.len() as u64))
        };
        Some(Self {
            payload_size,
            num_tags: counts.num_tags,
            tag_bytes: counts.num_tag_bytes,
        })
    }

    /// All tag bytes set, within a value of `total` bytes.
    pub(crate) fn tag_bytes_mask(&self, total: u64, endian: Endianness) -> ApInt {
        if self.tag_bytes == 0 {
            return ApInt::zero((total * 8) as u32);
        }
        let ones = ApInt::all_ones((self.tag_bytes * 8) as u32);
        place_bytes(&ones, self.payload_size, total, endian)
    }
}

/// How the values of an enum are copied and destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CopyDestroyStrategy {
    /// No case needs work; values are copied bytewise.
    TriviallyDestroyable,
    /// A single case with a payload and no other: operate on the payload.
    ForwardToPayload,
    /// One retainable pointer payload and one empty case stored as null:
    /// retain and release the pointer unconditionally.
    NullableRefcounted,
    /// Switch on the case and operate on the active payload.
    Normal,
}

impl TypeLayoutCache {
    /// The copy strategy of an enum entry; `None` for other entries.
    pub fn copy_destroy_strategy(&self, id: LayoutId) -> Option<CopyDestroyStrategy> {
        let TypeLayoutEntry::Enum {
            num_empty_cases,
            cases,
            ..
        } = self.get(id)
        else {
            return None;
        };
        let strategy = if self.is_trivially_destroyable(id) {
            CopyDestroyStrategy::TriviallyDestroyable
        } else if self.is_singleton(id) {
            CopyDestroyStrategy::ForwardToPayload
        } else if let ([payload], 1) = (cases.as_slice(), *num_empty_cases) {
            if self.is_single_retainable_pointer(*payload)
                && self.fixed_xi_count(*payload).is_some_and(|count| count >= 1)
            {
                CopyDestroyStrategy::NullableRefcounted
            } else {
                CopyDestroyStrategy::Normal
            }
        } else {
            CopyDestroyStrategy::Normal
        };
        Some(strategy)
    }

    /// True for enums with at least two payload cases.
    pub fn is_multi_payload_enum(&self, id: LayoutId) -> bool {
        matches!(self.get(id), TypeLayoutEntry::Enum { cases, .. } if cases.len() >= 2)
    }

    /// True for enums with exactly one case.
    pub fn is_singleton(&self, id: LayoutId) -> bool {
        matches!(
            self.get(id),
            TypeLayoutEntry::Enum { num_empty_cases, cases, .. } if cases.len() as u64 + u64::from(*num_empty_cases) == 1
        )
    }

    /// The scalar kind under a chain of single-child groups.
    fn retainable_leaf(&self, id: LayoutId) -> ScalarKind {
        match self.get(id) {
            TypeLayoutEntry::Scalar { kind, .. } => *kind,
            TypeLayoutEntry::AlignedGroup { children, .. } if children.len() == 1 => self.retainable_leaf(children[0]),
            entry => panic!("{} layout is not a single retainable pointer", entry.kind_name()),
        }
    }
}

struct EnumParts {
    num_empty_cases: u32,
    cases: Vec<LayoutId>,
}

impl LayoutId {
    fn enum_parts(self, igf: &IrGenFunction<'_>) -> EnumParts {
        match igf.layouts().get(self) {
            TypeLayoutEntry::Enum {
                num_empty_cases,
                cases,
                ..
            } => EnumParts {
                num_empty_cases: *num_empty_cases,
                cases: cases.to_vec(),
            },
            entry => panic!("enum operation on a {} layout", entry.kind_name()),
        }
    }

    fn copy_destroy_strategy(self, igf: &IrGenFunction<'_>) -> CopyDestroyStrategy {
        igf.layouts()
            .copy_destroy_strategy(self)
            .unwrap_or_else(|| panic!("{self} is not an enum layout"))
    }

    // -- Case tags --

    /// The case of the enum value at `addr`, as an `i32`.
    pub fn get_enum_tag(self, igf: &mut IrGenFunction<'_>, addr: Address) -> ValueId {
        let parts = self.enum_parts(igf);
        if let [payload] = parts.cases.as_slice() {
            let empty = igf.builder.const_i32(parts.num_empty_cases);
            return payload.get_enum_tag_single_payload(igf, empty, addr);
        }
        let (tag_addr, num_tag_bytes) = self.get_multi_payload_enum_tag_byte_addr_and_num_bytes(igf, addr);
        let tag = emit_load_bytes(igf, tag_addr.ptr, num_tag_bytes);
        let (payload_size, _, _) = self.emit_enum_counts(igf);
        let index_bytes = emit_payload_index_bytes(igf, payload_size);
        let payload_index = emit_load_bytes(igf, addr.ptr, index_bytes);

        let b = &mut igf.builder;
        let i32_ty = b.i32_type();
        let payload_cases = b.const_i32(parts.cases.len() as u32);
        let zero = b.const_i32(0);
        let four = b.const_size(4);
        let wide = b.icmp_uge(payload_size, four);
        let bits = b.shl_const(payload_size, 3);
        let bits = b.trunc(bits, i32_ty);
        let bits = b.select(wide, zero, bits);
        let group = b.sub(tag, payload_cases);
        let group = b.shl(group, bits);
        let group = b.select(wide, zero, group);
        let index = b.or(group, payload_index);
        let empty_case = b.add(payload_cases, index);
        let is_payload = b.icmp_ult(tag, payload_cases);
        b.select(is_payload, tag, empty_case)
    }

    /// Turn the enum at `addr` into its payload for in-place access. Payloads
    /// of this layout already start at the enum's address.
    pub fn destructive_project_enum_data(self, igf: &mut IrGenFunction<'_>, _addr: Address) {
        self.enum_parts(igf);
        tracing::trace!(layout = %self, "enum data projection is in place");
    }

    /// Set the case of the enum at `addr` to `tag` (an `i32`). For payload
    /// cases the payload must already be in place.
    pub fn destructive_inject_enum_tag(self, igf: &mut IrGenFunction<'_>, tag: ValueId, addr: Address) {
        let parts = self.enum_parts(igf);
        if let [payload] = parts.cases.as_slice() {
            let empty = igf.builder.const_i32(parts.num_empty_cases);
            payload.store_enum_tag_single_payload(igf, tag, empty, addr);
            return;
        }
        let payload_cases = igf.builder.const_i32(parts.cases.len() as u32);
        let payload_block = igf.builder.append_block("inject.payload");
        let empty_block = igf.builder.append_block("inject.empty");
        let done = igf.builder.append_block("inject.done");
        let is_payload = igf.builder.icmp_ult(tag, payload_cases);
        igf.builder.cond_br(is_payload, payload_block, empty_block);

        igf.builder.position_at_end(payload_block);
        igf.conditional_dominance(|igf| self.store_multi_payload_tag(igf, tag, addr));
        igf.builder.br(done);

        igf.builder.position_at_end(empty_block);
        igf.conditional_dominance(|igf| {
            let (payload_size, _, _) = self.emit_enum_counts(igf);
            let b = &mut igf.builder;
            let i32_ty = b.i32_type();
            let zero = b.const_i32(0);
            let one = b.const_i32(1);
            let four = b.const_size(4);
            let wide = b.icmp_uge(payload_size, four);
            let bits = b.shl_const(payload_size, 3);
            let bits = b.trunc(bits, i32_ty);
            let bits = b.select(wide, zero, bits);
            let index = b.sub(tag, payload_cases);
            let group = b.lshr(index, bits);
            let group = b.select(wide, zero, group);
            let tag_value = b.add(payload_cases, group);
            let low_mask = b.shl(one, bits);
            let low_mask = b.sub(low_mask, one);
            let low = b.and(index, low_mask);
            let payload_index = b.select(wide, index, low);
            self.store_multi_payload_value(igf, payload_index, addr);
            self.store_multi_payload_tag(igf, tag_value, addr);
        });
        igf.builder.br(done);

        igf.builder.position_at_end(done);
    }

    /// True (`i1`) if the single-payload enum at `addr` holds its payload.
    pub fn test_single_payload_enum_contains_payload(self, igf: &mut IrGenFunction<'_>, addr: Address) -> ValueId {
        let parts = self.enum_parts(igf);
        let [payload] = parts.cases.as_slice() else {
            panic!("{self} has {} payload cases", parts.cases.len());
        };
        let empty = igf.builder.const_i32(parts.num_empty_cases);
        let tag = payload.get_enum_tag_single_payload(igf, empty, addr);
        let zero = igf.builder.const_i32(0);
        igf.builder.icmp_eq(tag, zero)
    }

    /// Address and width (a word) of the tag bytes of a multi-payload enum.
    pub fn get_multi_payload_enum_tag_byte_addr_and_num_bytes(
        self,
        igf: &mut IrGenFunction<'_>,
        addr: Address,
    ) -> (Address, ValueId) {
        let (payload_size, _, num_tag_bytes) = self.emit_enum_counts(igf);
        let ptr = igf.builder.byte_offset(addr.ptr, payload_size);
        (Address::new(ptr, 1), num_tag_bytes)
    }

    /// Write `value` (an `i32`) into the tag bytes.
    pub fn store_multi_payload_tag(self, igf: &mut IrGenFunction<'_>, value: ValueId, addr: Address) {
        let (tag_addr, num_tag_bytes) = self.get_multi_payload_enum_tag_byte_addr_and_num_bytes(igf, addr);
        emit_store_bytes(igf, tag_addr.ptr, value, num_tag_bytes);
    }

    /// Zero the payload area and write `value` (an `i32`) into its low
    /// bytes.
    pub fn store_multi_payload_value(self, igf: &mut IrGenFunction<'_>, value: ValueId, addr: Address) {
        let (payload_size, _, _) = self.emit_enum_counts(igf);
        igf.builder.memset(addr.ptr, 0, payload_size);
        let index_bytes = emit_payload_index_bytes(igf, payload_size);
        emit_store_bytes(igf, addr.ptr, value, index_bytes);
    }

    // -- Value operations --

    /// Emit `emit(case)` for the payload case held at `addr`, or `empty`
    /// when the value is an empty case.
    fn switch_on_payload_case(
        self,
        igf: &mut IrGenFunction<'_>,
        addr: Address,
        mut emit: impl FnMut(&mut IrGenFunction<'_>, LayoutId),
        empty: impl FnOnce(&mut IrGenFunction<'_>),
    ) {
        let parts = self.enum_parts(igf);
        let done = igf.builder.append_block("enum.done");
        let no_payload = igf.builder.append_block("enum.empty");
        if let [payload] = parts.cases.as_slice() {
            let has_payload = self.test_single_payload_enum_contains_payload(igf, addr);
            let payload_block = igf.builder.append_block("enum.payload");
            igf.builder.cond_br(has_payload, payload_block, no_payload);
            igf.builder.position_at_end(payload_block);
            igf.conditional_dominance(|igf| emit(igf, *payload));
            igf.builder.br(done);
        } else {
            let tag = self.get_enum_tag(igf, addr);
            let blocks: Vec<_> = (0..parts.cases.len())
                .map(|i| igf.builder.append_block(&format!("enum.case.{i}")))
                .collect();
            let switch_cases = blocks
                .iter()
                .enumerate()
                .map(|(i, block)| (ApInt::new(32, i as u64), *block))
                .collect();
            igf.builder.switch(tag, no_payload, switch_cases);
            for (case, block) in parts.cases.iter().zip(blocks) {
                igf.builder.position_at_end(block);
                igf.conditional_dominance(|igf| emit(igf, *case));
                igf.builder.br(done);
            }
        }
        igf.builder.position_at_end(no_payload);
        igf.conditional_dominance(empty);
        igf.builder.br(done);
        igf.builder.position_at_end(done);
    }

    pub(super) fn destroy_enum(self, igf: &mut IrGenFunction<'_>, addr: Address) {
        match self.copy_destroy_strategy(igf) {
            CopyDestroyStrategy::TriviallyDestroyable => {}
            CopyDestroyStrategy::ForwardToPayload => {
                let parts = self.enum_parts(igf);
                parts.cases[0].destroy(igf, addr);
            }
            CopyDestroyStrategy::NullableRefcounted => {
                let kind = self.nullable_payload_kind(igf);
                destroy_scalar(igf, kind, addr);
            }
            CopyDestroyStrategy::Normal => {
                self.switch_on_payload_case(igf, addr, |igf, case| case.destroy(igf, addr), |_| {});
            }
        }
    }

    pub(super) fn initialize_enum(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address, is_take: bool) {
        match self.copy_destroy_strategy(igf) {
            CopyDestroyStrategy::TriviallyDestroyable => {
                let size = self.size(igf);
                igf.builder.memcpy(dest.ptr, src.ptr, size);
            }
            CopyDestroyStrategy::ForwardToPayload => {
                let parts = self.enum_parts(igf);
                parts.cases[0].initialize(igf, dest, src, is_take);
            }
            CopyDestroyStrategy::NullableRefcounted => {
                let kind = self.nullable_payload_kind(igf);
                let size = igf.pointer_size();
                initialize_scalar(igf, kind, size, dest, src, is_take);
            }
            CopyDestroyStrategy::Normal => {
                let size = self.size(igf);
                self.switch_on_payload_case(
                    igf,
                    src,
                    |igf, case| {
                        case.initialize(igf, dest, src, is_take);
                        // Padding and tag bytes after the payload.
                        let payload_size = case.size(igf);
                        let rest = igf.builder.sub(size, payload_size);
                        let dest_rest = igf.builder.byte_offset(dest.ptr, payload_size);
                        let src_rest = igf.builder.byte_offset(src.ptr, payload_size);
                        igf.builder.memcpy(dest_rest, src_rest, rest);
                    },
                    |igf| igf.builder.memcpy(dest.ptr, src.ptr, size),
                );
            }
        }
    }

    pub(super) fn assign_enum(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address, is_take: bool) {
        match self.copy_destroy_strategy(igf) {
            CopyDestroyStrategy::TriviallyDestroyable => {
                let size = self.size(igf);
                igf.builder.memcpy(dest.ptr, src.ptr, size);
            }
            CopyDestroyStrategy::ForwardToPayload => {
                let parts = self.enum_parts(igf);
                parts.cases[0].assign(igf, dest, src, is_take);
            }
            CopyDestroyStrategy::NullableRefcounted => {
                let kind = self.nullable_payload_kind(igf);
                let size = igf.pointer_size();
                assign_scalar(igf, kind, size, dest, src, is_take);
            }
            CopyDestroyStrategy::Normal => {
                let distinct = igf.builder.append_block("assign.distinct");
                let done = igf.builder.append_block("assign.done");
                let same = igf.builder.icmp_eq(dest.ptr, src.ptr);
                igf.builder.cond_br(same, done, distinct);
                igf.builder.position_at_end(distinct);
                igf.conditional_dominance(|igf| {
                    self.destroy_enum(igf, dest);
                    self.initialize_enum(igf, dest, src, is_take);
                });
                igf.builder.br(done);
                igf.builder.position_at_end(done);
            }
        }
    }

    fn nullable_payload_kind(self, igf: &IrGenFunction<'_>) -> ScalarKind {
        let parts = self.enum_parts(igf);
        igf.layouts().retainable_leaf(parts.cases[0])
    }
}
