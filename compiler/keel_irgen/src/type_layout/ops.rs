//! Copy, move and destroy over layout entries.
//!
//! Trivially destroyable values and takes of bitwise takable values are a
//! memory copy. Everything else dispatches on the entry: scalars call the
//! runtime's reference counting entry points, archetypes, resilient and
//! foreign types call their value witnesses, and aggregates recurse.

use keel_ir::{TargetConfig, ValueId};

use super::queries::{with_each_entry, with_each_entry_pair};
use super::{LayoutId, ScalarKind, TypeInfoKind, TypeLayoutEntry};
use crate::context::{Address, IrGenFunction};
use crate::existential::{class_instance_runtime_fn, OpaqueExistentialLayout};
use crate::runtime::{RuntimeFn, ValueWitness};

/// Retain and release entry points of a reference scalar.
fn reference_entry_points(kind: ScalarKind, target: &TargetConfig) -> Option<(RuntimeFn, RuntimeFn)> {
    let pair = match kind {
        ScalarKind::NativeStrongReference | ScalarKind::ThickFunc => (RuntimeFn::Retain, RuntimeFn::Release),
        ScalarKind::UnknownReference => (RuntimeFn::UnknownObjectRetain, RuntimeFn::UnknownObjectRelease),
        ScalarKind::BridgeReference => (RuntimeFn::BridgeObjectRetain, RuntimeFn::BridgeObjectRelease),
        ScalarKind::BlockReference => (RuntimeFn::BlockRetain, RuntimeFn::BlockRelease),
        ScalarKind::ObjCReference => (RuntimeFn::ObjCRetain, RuntimeFn::ObjCRelease),
        ScalarKind::ErrorReference => (RuntimeFn::ErrorRetain, RuntimeFn::ErrorRelease),
        ScalarKind::NativeUnownedReference => (RuntimeFn::UnownedRetain, RuntimeFn::UnownedRelease),
        ScalarKind::UnknownUnownedReference => (
            RuntimeFn::UnknownObjectUnownedRetain,
            RuntimeFn::UnknownObjectUnownedRelease,
        ),
        ScalarKind::ExistentialReference { .. } => (
            class_instance_runtime_fn(target, true),
            class_instance_runtime_fn(target, false),
        ),
        _ => return None,
    };
    Some(pair)
}

/// Runtime entry points of a weak reference scalar.
struct WeakEntryPoints {
    copy_init: RuntimeFn,
    take_init: RuntimeFn,
    destroy: RuntimeFn,
    copy_assign: RuntimeFn,
    take_assign: RuntimeFn,
}

impl WeakEntryPoints {
    fn of(kind: ScalarKind) -> Option<Self> {
        match kind {
            ScalarKind::NativeWeakReference => Some(Self {
                copy_init: RuntimeFn::WeakCopyInit,
                take_init: RuntimeFn::WeakTakeInit,
                destroy: RuntimeFn::WeakDestroy,
                copy_assign: RuntimeFn::WeakCopyAssign,
                take_assign: RuntimeFn::WeakTakeAssign,
            }),
            ScalarKind::UnknownWeakReference => Some(Self {
                copy_init: RuntimeFn::UnknownObjectWeakCopyInit,
                take_init: RuntimeFn::UnknownObjectWeakTakeInit,
                destroy: RuntimeFn::UnknownObjectWeakDestroy,
                copy_assign: RuntimeFn::UnknownObjectWeakCopyAssign,
                take_assign: RuntimeFn::UnknownObjectWeakTakeAssign,
            }),
            _ => None,
        }
    }
}

/// Load the reference counted pointer of a scalar: the context word of a
/// thick function, the first word otherwise.
fn load_reference(igf: &mut IrGenFunction<'_>, kind: ScalarKind, addr: Address) -> ValueId {
    let pointer_size = igf.pointer_size();
    let offset = if kind == ScalarKind::ThickFunc { pointer_size } else { 0 };
    let slot = igf.builder.byte_offset_const(addr.ptr, offset);
    let ptr = igf.builder.ptr_type();
    igf.builder.load(ptr, slot, pointer_size)
}

fn reference_entry_points_or_panic(igf: &IrGenFunction<'_>, kind: ScalarKind) -> (RuntimeFn, RuntimeFn) {
    reference_entry_points(kind, igf.target()).unwrap_or_else(|| panic!("{kind:?} is not reference counted"))
}

pub(super) fn destroy_scalar(igf: &mut IrGenFunction<'_>, kind: ScalarKind, addr: Address) {
    if let Some(weak) = WeakEntryPoints::of(kind) {
        igf.call_runtime(weak.destroy, &[addr.ptr]);
        return;
    }
    let (_, release) = reference_entry_points_or_panic(igf, kind);
    let object = load_reference(igf, kind, addr);
    igf.call_runtime(release, &[object]);
}

pub(super) fn initialize_scalar(
    igf: &mut IrGenFunction<'_>,
    kind: ScalarKind,
    size: u64,
    dest: Address,
    src: Address,
    is_take: bool,
) {
    if let Some(weak) = WeakEntryPoints::of(kind) {
        let function = if is_take { weak.take_init } else { weak.copy_init };
        igf.call_runtime(function, &[dest.ptr, src.ptr]);
        return;
    }
    let (retain, _) = reference_entry_points_or_panic(igf, kind);
    igf.builder.memcpy_const(dest.ptr, src.ptr, size);
    if !is_take {
        let object = load_reference(igf, kind, src);
        igf.call_runtime(retain, &[object]);
    }
}

pub(super) fn assign_scalar(
    igf: &mut IrGenFunction<'_>,
    kind: ScalarKind,
    size: u64,
    dest: Address,
    src: Address,
    is_take: bool,
) {
    if let Some(weak) = WeakEntryPoints::of(kind) {
        let function = if is_take { weak.take_assign } else { weak.copy_assign };
        igf.call_runtime(function, &[dest.ptr, src.ptr]);
        return;
    }
    let (retain, release) = reference_entry_points_or_panic(igf, kind);
    // Retain first: `dest` and `src` may be the same value.
    if !is_take {
        let object = load_reference(igf, kind, src);
        igf.call_runtime(retain, &[object]);
    }
    let old = load_reference(igf, kind, dest);
    igf.builder.memcpy_const(dest.ptr, src.ptr, size);
    igf.call_runtime(release, &[old]);
}

/// Emit `emit` once per element of an array at `dest` (and `src`), in a
/// loop over the element index.
fn for_each_element(
    igf: &mut IrGenFunction<'_>,
    element: LayoutId,
    count: u64,
    dest: Address,
    src: Option<Address>,
    mut emit: impl FnMut(&mut IrGenFunction<'_>, Address, Option<Address>),
) {
    let stride = element.stride(igf);
    let align = igf.layouts().fixed_alignment(element).unwrap_or(1);
    let word = igf.builder.size_type();
    let preheader = igf
        .builder
        .current_block()
        .unwrap_or_else(|| panic!("array loop emitted outside a block"));
    let header = igf.builder.append_block("array.header");
    let body = igf.builder.append_block("array.body");
    let exit = igf.builder.append_block("array.exit");
    let zero = igf.builder.const_size(0);
    let count = igf.builder.const_size(count);
    igf.builder.br(header);

    igf.builder.position_at_end(header);
    let index = igf.builder.phi(word, &[(zero, preheader)]);
    let more = igf.builder.icmp_ult(index, count);
    igf.builder.cond_br(more, body, exit);

    igf.builder.position_at_end(body);
    let offset = igf.builder.mul(index, stride);
    let dest_element = Address::new(igf.builder.byte_offset(dest.ptr, offset), align);
    let src_element = src.map(|src| Address::new(igf.builder.byte_offset(src.ptr, offset), align));
    igf.conditional_dominance(|igf| emit(igf, dest_element, src_element));
    let one = igf.builder.const_size(1);
    let next = igf.builder.add(index, one);
    let latch = igf.builder.current_block().unwrap_or(body);
    igf.builder.br(header);
    igf.builder.add_incoming(index, next, latch);

    igf.builder.position_at_end(exit);
}

fn paired(src: Option<Address>) -> Address {
    src.unwrap_or_else(|| panic!("array pair loop without a source"))
}

impl LayoutId {
    pub fn destroy(self, igf: &mut IrGenFunction<'_>, addr: Address) {
        if igf.layouts().is_trivially_destroyable(self) {
            return;
        }
        let entry = self.entry(igf);
        if entry.metadata_type().is_some() {
            let metadata = self.emit_metadata(igf);
            igf.emit_call_value_witness(metadata, ValueWitness::Destroy, &[addr.ptr]);
            return;
        }
        match entry {
            TypeLayoutEntry::Scalar { kind, .. } => destroy_scalar(igf, kind, addr),
            TypeLayoutEntry::TypeInfoBased {
                kind: TypeInfoKind::OpaqueExistential { num_tables },
                ..
            } => OpaqueExistentialLayout::new(num_tables).destroy(igf, addr),
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                with_each_entry(igf, &children, addr, |igf, child, addr| child.destroy(igf, addr));
            }
            TypeLayoutEntry::Enum { .. } => self.destroy_enum(igf, addr),
            TypeLayoutEntry::Array { element, count } => {
                for_each_element(igf, element, count, addr, None, |igf, addr, _| element.destroy(igf, addr));
            }
            entry => panic!("destroying a {} layout", entry.kind_name()),
        }
    }

    pub fn assign_with_copy(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.assign(igf, dest, src, false);
    }

    pub fn assign_with_take(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.assign(igf, dest, src, true);
    }

    pub fn init_with_copy(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.initialize(igf, dest, src, false);
    }

    pub fn init_with_take(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.initialize(igf, dest, src, true);
    }

    /// Replace the value at `dest` with a copy (or the value, if `is_take`)
    /// of the one at `src`.
    pub fn assign(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address, is_take: bool) {
        if igf.layouts().is_trivially_destroyable(self) {
            let size = self.size(igf);
            igf.builder.memcpy(dest.ptr, src.ptr, size);
            return;
        }
        let entry = self.entry(igf);
        if entry.metadata_type().is_some() {
            let metadata = self.emit_metadata(igf);
            let witness = if is_take {
                ValueWitness::AssignWithTake
            } else {
                ValueWitness::AssignWithCopy
            };
            igf.emit_call_value_witness(metadata, witness, &[dest.ptr, src.ptr]);
            return;
        }
        match entry {
            TypeLayoutEntry::Scalar { kind, info, .. } => assign_scalar(igf, kind, info.size(), dest, src, is_take),
            TypeLayoutEntry::TypeInfoBased {
                kind: TypeInfoKind::OpaqueExistential { num_tables },
                ..
            } => {
                let layout = OpaqueExistentialLayout::new(num_tables);
                if is_take {
                    layout.assign_with_take(igf, dest, src);
                } else {
                    layout.assign_with_copy(igf, dest, src);
                }
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                with_each_entry_pair(igf, &children, dest, src, |igf, child, dest, src| {
                    child.assign(igf, dest, src, is_take);
                });
            }
            TypeLayoutEntry::Enum { .. } => self.assign_enum(igf, dest, src, is_take),
            TypeLayoutEntry::Array { element, count } => {
                for_each_element(igf, element, count, dest, Some(src), |igf, dest, src| {
                    element.assign(igf, dest, paired(src), is_take);
                });
            }
            entry => panic!("assigning a {} layout", entry.kind_name()),
        }
    }

    /// Initialize `dest` with a copy (or the value, if `is_take`) of the
    /// one at `src`.
    pub fn initialize(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address, is_take: bool) {
        let layouts = igf.layouts();
        if layouts.is_trivially_destroyable(self) || (is_take && layouts.is_statically_bitwise_takable(self)) {
            let size = self.size(igf);
            igf.builder.memcpy(dest.ptr, src.ptr, size);
            return;
        }
        let entry = self.entry(igf);
        if entry.metadata_type().is_some() {
            let metadata = self.emit_metadata(igf);
            let witness = if is_take {
                ValueWitness::InitializeWithTake
            } else {
                ValueWitness::InitializeWithCopy
            };
            igf.emit_call_value_witness(metadata, witness, &[dest.ptr, src.ptr]);
            return;
        }
        match entry {
            TypeLayoutEntry::Scalar { kind, info, .. } => {
                initialize_scalar(igf, kind, info.size(), dest, src, is_take);
            }
            TypeLayoutEntry::TypeInfoBased {
                kind: TypeInfoKind::OpaqueExistential { num_tables },
                ..
            } => {
                let layout = OpaqueExistentialLayout::new(num_tables);
                if is_take {
                    layout.init_with_take(igf, dest, src);
                } else {
                    layout.init_with_copy(igf, dest, src);
                }
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                with_each_entry_pair(igf, &children, dest, src, |igf, child, dest, src| {
                    child.initialize(igf, dest, src, is_take);
                });
            }
            TypeLayoutEntry::Enum { .. } => self.initialize_enum(igf, dest, src, is_take),
            TypeLayoutEntry::Array { element, count } => {
                for_each_element(igf, element, count, dest, Some(src), |igf, dest, src| {
                    element.initialize(igf, dest, paired(src), is_take);
                });
            }
            entry => panic!("initializing a {} layout", entry.kind_name()),
        }
    }

    /// Copy the value in the existential buffer `src` into the buffer
    /// `dest`. Inline values are copied into the buffer; boxed values share
    /// the box. Returns the address of the copied value.
    pub fn init_buffer_with_copy_of_buffer(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) -> ValueId {
        let is_inline = self.is_inline(igf);
        if let Some(inline) = igf.builder.const_u64(is_inline) {
            if inline != 0 {
                self.init_with_copy(igf, dest, src);
                return dest.ptr;
            }
            return self.share_box(igf, dest, src);
        }
        let inline_block = igf.builder.append_block("buffer.inline");
        let boxed_block = igf.builder.append_block("buffer.boxed");
        let done = igf.builder.append_block("buffer.done");
        igf.builder.cond_br(is_inline, inline_block, boxed_block);

        igf.builder.position_at_end(inline_block);
        igf.conditional_dominance(|igf| self.init_with_copy(igf, dest, src));
        let inline_end = igf.builder.current_block().unwrap_or(inline_block);
        igf.builder.br(done);

        igf.builder.position_at_end(boxed_block);
        let boxed_value = igf.conditional_dominance(|igf| self.share_box(igf, dest, src));
        let boxed_end = igf.builder.current_block().unwrap_or(boxed_block);
        igf.builder.br(done);

        igf.builder.position_at_end(done);
        let ptr = igf.builder.ptr_type();
        igf.builder.phi(ptr, &[(dest.ptr, inline_end), (boxed_value, boxed_end)])
    }

    fn share_box(self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) -> ValueId {
        let pointer_size = igf.pointer_size();
        let ptr = igf.builder.ptr_type();
        let object = igf.builder.load(ptr, src.ptr, pointer_size);
        igf.call_runtime(RuntimeFn::Retain, &[object]);
        igf.builder.store(object, dest.ptr, pointer_size);
        let mask = self.alignment_mask(igf);
        let header = igf.builder.const_size(igf.target().heap_header_size());
        let b = &mut igf.builder;
        let rounded = b.add(header, mask);
        let inverse = b.not(mask);
        let start = b.and(rounded, inverse);
        b.byte_offset(object, start)
    }
}
