//! Constant creation for `IrBuilder`.

use keel_bits::ApInt;

use super::IrBuilder;
use crate::module::ValueKind;
use crate::{FunctionId, GlobalId, TypeId, ValueId};

impl IrBuilder<'_> {
    /// Integer or pointer constant of type `ty` holding `value`.
    pub fn const_int(&mut self, ty: TypeId, value: u64) -> ValueId {
        let bits = self
            .module
            .types()
            .scalar_bits(ty)
            .unwrap_or_else(|| panic!("const_int of non-scalar type"));
        self.module
            .push_value(ty, ValueKind::Const(ApInt::new(bits, value)))
    }

    /// Integer constant whose type is `i{value.width()}`.
    pub fn const_ap(&mut self, value: ApInt) -> ValueId {
        let ty = self.int_type(value.width());
        self.module.push_value(ty, ValueKind::Const(value))
    }

    /// Constant of an arbitrary scalar type from a wide value.
    pub fn const_typed(&mut self, ty: TypeId, value: &ApInt) -> ValueId {
        let bits = self
            .module
            .types()
            .scalar_bits(ty)
            .unwrap_or_else(|| panic!("const_typed of non-scalar type"));
        self.module
            .push_value(ty, ValueKind::Const(value.zext_or_trunc(bits)))
    }

    pub fn const_zero(&mut self, ty: TypeId) -> ValueId {
        self.const_int(ty, 0)
    }

    pub fn const_bool(&mut self, value: bool) -> ValueId {
        let ty = self.bool_type();
        self.const_int(ty, u64::from(value))
    }

    pub fn const_i8(&mut self, value: u8) -> ValueId {
        let ty = self.i8_type();
        self.const_int(ty, u64::from(value))
    }

    pub fn const_i32(&mut self, value: u32) -> ValueId {
        let ty = self.i32_type();
        self.const_int(ty, u64::from(value))
    }

    /// Pointer-width integer constant.
    pub fn const_size(&mut self, value: u64) -> ValueId {
        let ty = self.size_type();
        self.const_int(ty, value)
    }

    pub fn const_null(&mut self) -> ValueId {
        let ty = self.ptr_type();
        self.const_int(ty, 0)
    }

    pub fn undef(&mut self, ty: TypeId) -> ValueId {
        self.module.push_value(ty, ValueKind::Undef)
    }

    /// Address of a function, as a pointer.
    pub fn function_addr(&mut self, function: FunctionId) -> ValueId {
        let ty = self.ptr_type();
        self.module.push_value(ty, ValueKind::Function(function))
    }

    /// Address of a global, as a pointer.
    pub fn global_addr(&mut self, global: GlobalId) -> ValueId {
        let ty = self.ptr_type();
        self.module.push_value(ty, ValueKind::Global(global))
    }

    /// The constant behind `value`, if it is one.
    pub fn const_value(&self, value: ValueId) -> Option<ApInt> {
        self.constant(value).cloned()
    }

    /// The constant behind `value` as a `u64`, if it is one and fits.
    pub fn const_u64(&self, value: ValueId) -> Option<u64> {
        self.constant(value).and_then(ApInt::to_u64)
    }
}
