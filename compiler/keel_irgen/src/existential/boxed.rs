//! Shared helpers for opaque existential containers.
//!
//! Whether a container's value is inline or boxed is only known from its
//! metadata at run time. The operations that branch on it are emitted once
//! per witness table count as `__keel_<op>_boxed_opaque_existential_<n>`
//! and called from every use site.
//!
//! A boxed value lives at `(heap_header + mask) & !mask` from the start of
//! its box, where `mask` is the value's alignment mask.

use keel_ir::{BlockId, FunctionId, TypeId, ValueId};

use super::{fixed_buffer_type, OpaqueExistentialLayout};
use crate::context::{Address, IrGenFunction};
use crate::runtime::{RuntimeFn, ValueWitness};

/// Offset of the value from the start of its box, as a word.
fn emit_box_start(igf: &mut IrGenFunction<'_>, metadata: ValueId) -> ValueId {
    let mask = igf.emit_load_alignment_mask(metadata);
    let header = igf.builder.const_size(igf.target().heap_header_size());
    let rounded = igf.builder.add(header, mask);
    let inverse = igf.builder.not(mask);
    igf.builder.and(rounded, inverse)
}

fn emit_load_box(igf: &mut IrGenFunction<'_>, buffer: Address) -> ValueId {
    let ptr = igf.builder.ptr_type();
    igf.builder.load(ptr, buffer.ptr, buffer.align)
}

/// Branch on whether values of `metadata` are inline, emitting each side in
/// its own conditional scope. When `result` is given both sides return a
/// value of that type, joined by a phi.
fn emit_inline_branch(
    igf: &mut IrGenFunction<'_>,
    metadata: ValueId,
    result: Option<TypeId>,
    inline: impl FnOnce(&mut IrGenFunction<'_>) -> Option<ValueId>,
    boxed: impl FnOnce(&mut IrGenFunction<'_>) -> Option<ValueId>,
) -> Option<ValueId> {
    let is_inline = igf.emit_load_is_inline(metadata);
    let inline_block = igf.builder.append_block("inline");
    let boxed_block = igf.builder.append_block("boxed");
    let done = igf.builder.append_block("inline.done");
    igf.builder.cond_br(is_inline, inline_block, boxed_block);

    let mut incoming: Vec<(ValueId, BlockId)> = Vec::new();
    igf.builder.position_at_end(inline_block);
    let value = igf.conditional_dominance(inline);
    let end = igf.builder.current_block().unwrap_or(inline_block);
    igf.builder.br(done);
    incoming.extend(value.map(|v| (v, end)));

    igf.builder.position_at_end(boxed_block);
    let value = igf.conditional_dominance(boxed);
    let end = igf.builder.current_block().unwrap_or(boxed_block);
    igf.builder.br(done);
    incoming.extend(value.map(|v| (v, end)));

    igf.builder.position_at_end(done);
    result.map(|ty| igf.builder.phi(ty, &incoming))
}

impl OpaqueExistentialLayout {
    fn helper_name(&self, op: &str) -> String {
        format!("__keel_{op}_boxed_opaque_existential_{}", self.num_tables)
    }

    /// `(dest, src)`: copy-assign `src` over the initialized `dest`.
    pub(super) fn assign_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        let void = igf.builder.void_type();
        igf.get_or_create_helper(&self.helper_name("assign"), &[ptr, ptr], void, |igf, args| {
            let align = igf.pointer_size();
            let dest = Address::new(args[0], align);
            let src = Address::new(args[1], align);
            let done = igf.builder.append_block("done");
            let distinct = igf.builder.append_block("distinct");
            let same_addr = igf.builder.icmp_eq(dest.ptr, src.ptr);
            igf.builder.cond_br(same_addr, done, distinct);

            igf.builder.position_at_end(distinct);
            let dest_metadata = layout.load_metadata_ref(igf, dest);
            let src_metadata = layout.load_metadata_ref(igf, src);
            let same_type = igf.builder.append_block("same-type");
            let different_type = igf.builder.append_block("different-type");
            let same = igf.builder.icmp_eq(dest_metadata, src_metadata);
            igf.builder.cond_br(same, same_type, different_type);

            igf.builder.position_at_end(same_type);
            igf.conditional_dominance(|igf| {
                let dest_buffer = layout.project_existential_buffer(igf, dest);
                let src_buffer = layout.project_existential_buffer(igf, src);
                emit_inline_branch(
                    igf,
                    src_metadata,
                    None,
                    |igf| {
                        igf.emit_call_value_witness(
                            src_metadata,
                            ValueWitness::AssignWithCopy,
                            &[dest_buffer.ptr, src_buffer.ptr],
                        );
                        None
                    },
                    |igf| {
                        let src_box = emit_load_box(igf, src_buffer);
                        igf.call_runtime(RuntimeFn::Retain, &[src_box]);
                        let dest_box = emit_load_box(igf, dest_buffer);
                        igf.call_runtime(RuntimeFn::Release, &[dest_box]);
                        igf.builder.store(src_box, dest_buffer.ptr, dest_buffer.align);
                        None
                    },
                );
                igf.builder.br(done);
            });

            igf.builder.position_at_end(different_type);
            igf.conditional_dominance(|igf| {
                layout.copy_metadata_and_tables(igf, dest, src);
                let dest_buffer = layout.project_existential_buffer(igf, dest);
                let src_buffer = layout.project_existential_buffer(igf, src);
                let words = igf.target().fixed_buffer_words();
                let buffer_ty = fixed_buffer_type(igf.builder.module_mut().types_mut(), words);
                let tmp = Address::new(igf.builder.alloca(buffer_ty, align, "old-value"), align);

                // Move the old value out of the way.
                emit_inline_branch(
                    igf,
                    dest_metadata,
                    None,
                    |igf| {
                        igf.emit_call_value_witness(
                            dest_metadata,
                            ValueWitness::InitializeWithTake,
                            &[tmp.ptr, dest_buffer.ptr],
                        );
                        None
                    },
                    |igf| {
                        let old_box = emit_load_box(igf, dest_buffer);
                        igf.builder.store(old_box, tmp.ptr, tmp.align);
                        None
                    },
                );
                emit_inline_branch(
                    igf,
                    src_metadata,
                    None,
                    |igf| {
                        igf.emit_call_value_witness(
                            src_metadata,
                            ValueWitness::InitializeWithCopy,
                            &[dest_buffer.ptr, src_buffer.ptr],
                        );
                        None
                    },
                    |igf| {
                        let src_box = emit_load_box(igf, src_buffer);
                        igf.call_runtime(RuntimeFn::Retain, &[src_box]);
                        igf.builder.store(src_box, dest_buffer.ptr, dest_buffer.align);
                        None
                    },
                );
                emit_inline_branch(
                    igf,
                    dest_metadata,
                    None,
                    |igf| {
                        igf.emit_call_value_witness(dest_metadata, ValueWitness::Destroy, &[tmp.ptr]);
                        None
                    },
                    |igf| {
                        let old_box = emit_load_box(igf, tmp);
                        igf.call_runtime(RuntimeFn::Release, &[old_box]);
                        None
                    },
                );
                igf.builder.br(done);
            });

            igf.builder.position_at_end(done);
            igf.builder.ret_void();
        })
    }

    /// `(container)`: destroy the value, releasing its box if boxed.
    pub(super) fn destroy_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        let void = igf.builder.void_type();
        igf.get_or_create_helper(&self.helper_name("destroy"), &[ptr], void, |igf, args| {
            let container = Address::new(args[0], igf.pointer_size());
            let metadata = layout.load_metadata_ref(igf, container);
            let buffer = layout.project_existential_buffer(igf, container);
            emit_inline_branch(
                igf,
                metadata,
                None,
                |igf| {
                    igf.emit_call_value_witness(metadata, ValueWitness::Destroy, &[buffer.ptr]);
                    None
                },
                |igf| {
                    let object = emit_load_box(igf, buffer);
                    igf.call_runtime(RuntimeFn::Release, &[object]);
                    None
                },
            );
            igf.builder.ret_void();
        })
    }

    /// `(container) -> value address`: allocate a box when the value does
    /// not fit the buffer.
    pub(super) fn allocate_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        igf.get_or_create_helper(&self.helper_name("allocate"), &[ptr], ptr, |igf, args| {
            let container = Address::new(args[0], igf.pointer_size());
            let metadata = layout.load_metadata_ref(igf, container);
            let buffer = layout.project_existential_buffer(igf, container);
            let value = emit_inline_branch(
                igf,
                metadata,
                Some(ptr),
                |_| Some(buffer.ptr),
                |igf| {
                    let object = igf.call_runtime(RuntimeFn::AllocBox, &[metadata]);
                    igf.builder.store(object, buffer.ptr, buffer.align);
                    let start = emit_box_start(igf, metadata);
                    Some(igf.builder.byte_offset(object, start))
                },
            );
            if let Some(value) = value {
                igf.builder.ret(value);
            }
        })
    }

    /// `(container)`: free the box of a boxed value.
    pub(super) fn deallocate_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        let void = igf.builder.void_type();
        igf.get_or_create_helper(&self.helper_name("deallocate"), &[ptr], void, |igf, args| {
            let container = Address::new(args[0], igf.pointer_size());
            let metadata = layout.load_metadata_ref(igf, container);
            let buffer = layout.project_existential_buffer(igf, container);
            emit_inline_branch(
                igf,
                metadata,
                None,
                |_| None,
                |igf| {
                    let object = emit_load_box(igf, buffer);
                    let size = igf.emit_load_size(metadata);
                    let start = emit_box_start(igf, metadata);
                    let alloc_size = igf.builder.add(start, size);
                    let mask = igf.emit_load_alignment_mask(metadata);
                    let pointer_mask = igf.builder.const_size(igf.pointer_size() - 1);
                    let alloc_mask = igf.builder.or(mask, pointer_mask);
                    igf.call_runtime(RuntimeFn::DeallocBox, &[object, alloc_size, alloc_mask]);
                    None
                },
            );
            igf.builder.ret_void();
        })
    }

    /// `(container) -> value address`, for reading.
    pub(super) fn project_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        igf.get_or_create_helper(&self.helper_name("project"), &[ptr], ptr, |igf, args| {
            let container = Address::new(args[0], igf.pointer_size());
            let metadata = layout.load_metadata_ref(igf, container);
            let buffer = layout.project_existential_buffer(igf, container);
            let value = emit_inline_branch(
                igf,
                metadata,
                Some(ptr),
                |_| Some(buffer.ptr),
                |igf| {
                    let object = emit_load_box(igf, buffer);
                    let start = emit_box_start(igf, metadata);
                    Some(igf.builder.byte_offset(object, start))
                },
            );
            if let Some(value) = value {
                igf.builder.ret(value);
            }
        })
    }

    /// `(container) -> value address`, for writing: a shared box is
    /// replaced by a unique copy first.
    pub(super) fn mutable_project_helper(&self, igf: &mut IrGenFunction<'_>) -> FunctionId {
        let layout = *self;
        let ptr = igf.builder.ptr_type();
        igf.get_or_create_helper(&self.helper_name("mutable_project"), &[ptr], ptr, |igf, args| {
            let container = Address::new(args[0], igf.pointer_size());
            let metadata = layout.load_metadata_ref(igf, container);
            let buffer = layout.project_existential_buffer(igf, container);
            let value = emit_inline_branch(
                igf,
                metadata,
                Some(ptr),
                |_| Some(buffer.ptr),
                |igf| {
                    let mask = igf.emit_load_alignment_mask(metadata);
                    let object = igf.call_runtime(RuntimeFn::MakeBoxUnique, &[buffer.ptr, metadata, mask]);
                    let start = emit_box_start(igf, metadata);
                    Some(igf.builder.byte_offset(object, start))
                },
            );
            if let Some(value) = value {
                igf.builder.ret(value);
            }
        })
    }
}
