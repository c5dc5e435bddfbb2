//! Memory operations (alloca, load, store, address arithmetic) for `IrBuilder`.

use super::IrBuilder;
use crate::module::{Inst, ValueKind};
use crate::{TypeId, ValueId};

impl IrBuilder<'_> {
    /// Stack slot for `ty`, placed with the other allocas at the top of the
    /// entry block so it dominates every use.
    pub fn alloca(&mut self, ty: TypeId, align: u64, name: &str) -> ValueId {
        let Some(entry) = self.module.function(self.function).entry_block() else {
            panic!("alloca in a function without an entry block");
        };
        let ptr = self.ptr_type();
        let id = self.module.push_value(
            ptr,
            ValueKind::Inst {
                block: entry,
                inst: Inst::Alloca { ty, align },
            },
        );
        self.module.set_value_name(id, name);
        let position = {
            let module = &*self.module;
            module
                .block(entry)
                .insts
                .iter()
                .take_while(|v| matches!(module.inst(**v), Some(Inst::Alloca { .. })))
                .count()
        };
        self.module.block_mut(entry).insts.insert(position, id);
        id
    }

    /// Load a value of type `ty`.
    pub fn load(&mut self, ty: TypeId, ptr: ValueId, align: u64) -> ValueId {
        assert!(
            self.module.types().is_ptr(self.type_of(ptr)),
            "load through non-pointer"
        );
        self.emit(ty, Inst::Load { ptr, align })
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId, align: u64) {
        assert!(
            self.module.types().is_ptr(self.type_of(ptr)),
            "store through non-pointer"
        );
        let void = self.void_type();
        self.emit(void, Inst::Store { value, ptr, align });
    }

    /// `base + offset` bytes, where `offset` is any integer.
    pub fn byte_offset(&mut self, base: ValueId, offset: ValueId) -> ValueId {
        if self.const_value(offset).is_some_and(|c| c.is_zero()) {
            return base;
        }
        let word = self.size_type();
        let offset = self.zext_or_trunc(offset, word);
        let ptr = self.ptr_type();
        self.emit(ptr, Inst::ByteOffset { base, offset })
    }

    pub fn byte_offset_const(&mut self, base: ValueId, offset: u64) -> ValueId {
        if offset == 0 {
            return base;
        }
        let offset = self.const_size(offset);
        self.byte_offset(base, offset)
    }

    /// Address of field `index` of a struct of type `struct_ty` at `base`.
    pub fn struct_gep(&mut self, struct_ty: TypeId, base: ValueId, index: u32) -> ValueId {
        let fields = self.module.types().struct_fields(struct_ty).len();
        assert!((index as usize) < fields, "struct_gep field {index} out of range");
        let ptr = self.ptr_type();
        self.emit(
            ptr,
            Inst::StructGep {
                base,
                struct_ty,
                index,
            },
        )
    }

    pub fn memcpy(&mut self, dest: ValueId, src: ValueId, size: ValueId) {
        if self.const_value(size).is_some_and(|c| c.is_zero()) {
            return;
        }
        let void = self.void_type();
        self.emit(void, Inst::MemCpy { dest, src, size });
    }

    pub fn memcpy_const(&mut self, dest: ValueId, src: ValueId, size: u64) {
        let size = self.const_size(size);
        self.memcpy(dest, src, size);
    }

    pub fn memset(&mut self, dest: ValueId, byte: u8, size: ValueId) {
        if self.const_value(size).is_some_and(|c| c.is_zero()) {
            return;
        }
        let byte = self.const_i8(byte);
        let void = self.void_type();
        self.emit(void, Inst::MemSet { dest, byte, size });
    }
}
