//! Integer width changes and pointer casts for `IrBuilder`.

use super::IrBuilder;
use crate::module::{CastOp, Inst, ValueKind};
use crate::{TypeId, ValueId};

impl IrBuilder<'_> {
    fn cast(&mut self, op: CastOp, value: ValueId, ty: TypeId) -> ValueId {
        if self.type_of(value) == ty {
            return value;
        }
        if let Some(c) = self.const_value(value) {
            let bits = self
                .module
                .types()
                .scalar_bits(ty)
                .unwrap_or_else(|| panic!("{} to non-scalar type", op.mnemonic()));
            return self
                .module
                .push_value(ty, ValueKind::Const(c.zext_or_trunc(bits)));
        }
        self.emit(ty, Inst::Cast { op, value })
    }

    pub fn zext(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        let from = self.bit_width(value);
        let to = self.module.types().int_width(ty).unwrap_or(0);
        assert!(to >= from, "zext from i{from} to narrower i{to}");
        self.cast(CastOp::ZExt, value, ty)
    }

    pub fn trunc(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        let from = self.bit_width(value);
        let to = self.module.types().int_width(ty).unwrap_or(u32::MAX);
        assert!(to <= from, "trunc from i{from} to wider i{to}");
        self.cast(CastOp::Trunc, value, ty)
    }

    /// Resize an integer to `ty`, extending or truncating as needed.
    pub fn zext_or_trunc(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        let from = self.bit_width(value);
        let to = self
            .module
            .types()
            .int_width(ty)
            .unwrap_or_else(|| panic!("zext_or_trunc to non-integer type"));
        if to >= from {
            self.zext(value, ty)
        } else {
            self.trunc(value, ty)
        }
    }

    pub fn int_to_ptr(&mut self, value: ValueId) -> ValueId {
        let ptr = self.ptr_type();
        let word = self.size_type();
        let value = self.zext_or_trunc(value, word);
        self.cast(CastOp::IntToPtr, value, ptr)
    }

    pub fn ptr_to_int(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        let word = self.size_type();
        let as_word = self.cast(CastOp::PtrToInt, value, word);
        self.zext_or_trunc(as_word, ty)
    }

    /// Convert a scalar to `ty`: integer resize, or a cast between integers
    /// and pointers.
    pub fn coerce(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        let from = self.type_of(value);
        if from == ty {
            return value;
        }
        let types = self.module.types();
        match (types.is_ptr(from), types.is_ptr(ty)) {
            (false, false) => self.zext_or_trunc(value, ty),
            (false, true) => self.int_to_ptr(value),
            (true, false) => self.ptr_to_int(value, ty),
            (true, true) => value,
        }
    }
}
