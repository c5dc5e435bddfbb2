//! The single-payload enum tag protocol over layout entries.
//!
//! Leaves with fixed type info answer from their extra-inhabitant encoding,
//! leaves known only to the runtime call their value witnesses, and
//! aggregates run the generic algorithm of
//! [`single_payload`](crate::type_info::single_payload) with an
//! extra-inhabitant callback that forwards to the child holding them.

use keel_ir::ValueId;

use super::queries::with_extra_inhabitant_providing_entry;
use super::{LayoutId, ScalarKind, TypeInfoKind, TypeLayoutEntry};
use crate::context::{Address, IrGenFunction};
use crate::runtime::ValueWitness;
use crate::type_info::single_payload::{
    emit_get_enum_tag_single_payload, emit_load_bytes, emit_store_bytes, emit_store_enum_tag_single_payload,
};

impl LayoutId {
    /// Tag of a single-payload enum with `num_empty_cases` (an `i32`) empty
    /// cases whose payload is this layout: zero for the payload, `i + 1`
    /// for empty case `i`.
    pub fn get_enum_tag_single_payload(
        self,
        igf: &mut IrGenFunction<'_>,
        num_empty_cases: ValueId,
        addr: Address,
    ) -> ValueId {
        match self.entry(igf) {
            TypeLayoutEntry::Scalar {
                kind: ScalarKind::CustomReference,
                ..
            }
            | TypeLayoutEntry::Archetype { .. }
            | TypeLayoutEntry::Resilient { .. }
            | TypeLayoutEntry::TypeInfoBased {
                kind: TypeInfoKind::Foreign,
                ..
            } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_call_value_witness(
                    metadata,
                    ValueWitness::GetEnumTagSinglePayload,
                    &[addr.ptr, num_empty_cases],
                )
            }
            TypeLayoutEntry::Scalar { info, .. } | TypeLayoutEntry::TypeInfoBased { info, .. } => {
                igf.emit_get_fixed_type_enum_tag_single_payload(&info, num_empty_cases, addr)
            }
            TypeLayoutEntry::Empty
            | TypeLayoutEntry::AlignedGroup { .. }
            | TypeLayoutEntry::Enum { .. }
            | TypeLayoutEntry::Array { .. } => {
                let size = self.size(igf);
                let xi_count = self.extra_inhabitant_count(igf);
                emit_get_enum_tag_single_payload(igf, addr, num_empty_cases, size, xi_count, |igf, addr, xi| {
                    self.get_extra_inhabitant_tag(igf, addr, xi)
                })
            }
        }
    }

    /// Store `tag` (an `i32`) into a single-payload enum whose payload is
    /// this layout. For tag zero the payload must already be in place.
    pub fn store_enum_tag_single_payload(
        self,
        igf: &mut IrGenFunction<'_>,
        tag: ValueId,
        num_empty_cases: ValueId,
        addr: Address,
    ) {
        match self.entry(igf) {
            TypeLayoutEntry::Scalar {
                kind: ScalarKind::CustomReference,
                ..
            }
            | TypeLayoutEntry::Archetype { .. }
            | TypeLayoutEntry::Resilient { .. }
            | TypeLayoutEntry::TypeInfoBased {
                kind: TypeInfoKind::Foreign,
                ..
            } => {
                let metadata = self.emit_metadata(igf);
                igf.emit_call_value_witness(
                    metadata,
                    ValueWitness::StoreEnumTagSinglePayload,
                    &[addr.ptr, tag, num_empty_cases],
                );
            }
            TypeLayoutEntry::Scalar { info, .. } | TypeLayoutEntry::TypeInfoBased { info, .. } => {
                igf.emit_store_fixed_type_enum_tag_single_payload(&info, tag, num_empty_cases, addr);
            }
            TypeLayoutEntry::Empty
            | TypeLayoutEntry::AlignedGroup { .. }
            | TypeLayoutEntry::Enum { .. }
            | TypeLayoutEntry::Array { .. } => {
                let size = self.size(igf);
                let xi_count = self.extra_inhabitant_count(igf);
                emit_store_enum_tag_single_payload(
                    igf,
                    addr,
                    tag,
                    num_empty_cases,
                    size,
                    xi_count,
                    |igf, addr, tag, xi| self.store_extra_inhabitant_tag(igf, addr, tag, xi),
                );
            }
        }
    }

    /// Extra-inhabitant tag of an aggregate: zero for a valid value, `i + 1`
    /// for extra inhabitant `i`. `xi_count` is this layout's count.
    fn get_extra_inhabitant_tag(self, igf: &mut IrGenFunction<'_>, addr: Address, xi_count: ValueId) -> ValueId {
        let i32_ty = igf.builder.i32_type();
        match self.entry(igf) {
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                with_extra_inhabitant_providing_entry(igf, &children, addr, Some(i32_ty), |igf, child, addr| {
                    Some(child.get_enum_tag_single_payload(igf, xi_count, addr))
                })
                .unwrap_or_else(|| panic!("extra inhabitant tag of an empty group"))
            }
            TypeLayoutEntry::Array { element, .. } => element.get_enum_tag_single_payload(igf, xi_count, addr),
            TypeLayoutEntry::Enum {
                num_empty_cases,
                cases,
                ..
            } => {
                if let [payload] = cases.as_slice() {
                    // The enum's extra inhabitants are the payload's past
                    // those spent on empty cases.
                    let empty = igf.builder.const_i32(num_empty_cases);
                    let payload_cases = igf.builder.add(empty, xi_count);
                    let payload_tag = payload.get_enum_tag_single_payload(igf, payload_cases, addr);
                    let b = &mut igf.builder;
                    let zero = b.const_i32(0);
                    let is_xi = b.icmp_ugt(payload_tag, empty);
                    let tag = b.sub(payload_tag, empty);
                    return b.select(is_xi, tag, zero);
                }
                let (payload_size, num_tags, num_tag_bytes) = self.emit_enum_counts(igf);
                let tag_addr = igf.builder.byte_offset(addr.ptr, payload_size);
                let value = emit_load_bytes(igf, tag_addr, num_tag_bytes);
                let b = &mut igf.builder;
                let num_tags = b.trunc(num_tags, i32_ty);
                let zero = b.const_i32(0);
                let one = b.const_i32(1);
                let is_xi = b.icmp_uge(value, num_tags);
                let index = b.sub(value, num_tags);
                let tag = b.add(index, one);
                b.select(is_xi, tag, zero)
            }
            TypeLayoutEntry::Empty => igf.builder.const_i32(0),
            entry => panic!("{} layout has its own tag protocol", entry.kind_name()),
        }
    }

    /// Overwrite an aggregate with the extra inhabitant for `tag`.
    fn store_extra_inhabitant_tag(self, igf: &mut IrGenFunction<'_>, addr: Address, tag: ValueId, xi_count: ValueId) {
        match self.entry(igf) {
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                with_extra_inhabitant_providing_entry(igf, &children, addr, None, |igf, child, addr| {
                    child.store_enum_tag_single_payload(igf, tag, xi_count, addr);
                    None
                });
            }
            TypeLayoutEntry::Array { element, .. } => {
                element.store_enum_tag_single_payload(igf, tag, xi_count, addr);
            }
            TypeLayoutEntry::Enum {
                num_empty_cases,
                cases,
                ..
            } => {
                if let [payload] = cases.as_slice() {
                    let empty = igf.builder.const_i32(num_empty_cases);
                    let payload_cases = igf.builder.add(empty, xi_count);
                    let payload_tag = igf.builder.add(tag, empty);
                    payload.store_enum_tag_single_payload(igf, payload_tag, payload_cases, addr);
                    return;
                }
                let (payload_size, num_tags, num_tag_bytes) = self.emit_enum_counts(igf);
                let tag_addr = igf.builder.byte_offset(addr.ptr, payload_size);
                let b = &mut igf.builder;
                let i32_ty = b.i32_type();
                let num_tags = b.trunc(num_tags, i32_ty);
                let one = b.const_i32(1);
                let index = b.sub(tag, one);
                let value = b.add(index, num_tags);
                emit_store_bytes(igf, tag_addr, value, num_tag_bytes);
            }
            entry => panic!("storing an extra inhabitant into a {} layout", entry.kind_name()),
        }
    }
}
