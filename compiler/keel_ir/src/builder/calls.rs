//! Call emission for `IrBuilder`.

use smallvec::SmallVec;

use super::IrBuilder;
use crate::module::{Callee, Inst};
use crate::{FunctionId, TypeId, ValueId};

impl IrBuilder<'_> {
    /// Direct call. Returns the result value, which has type `void` for
    /// functions returning nothing.
    pub fn call(&mut self, function: FunctionId, args: &[ValueId]) -> ValueId {
        let fn_ty = self.module.function(function).ty;
        self.check_args(fn_ty, args, &self.module.function(function).name.clone());
        let ret = self.module.types().signature(fn_ty).1;
        self.emit(
            ret,
            Inst::Call {
                callee: Callee::Direct(function),
                args: args.iter().copied().collect::<SmallVec<_>>(),
            },
        )
    }

    /// Call through a function pointer of type `fn_ty`.
    pub fn call_indirect(&mut self, fn_ty: TypeId, ptr: ValueId, args: &[ValueId]) -> ValueId {
        self.check_args(fn_ty, args, "<indirect>");
        let ret = self.module.types().signature(fn_ty).1;
        self.emit(
            ret,
            Inst::Call {
                callee: Callee::Indirect { ptr, fn_ty },
                args: args.iter().copied().collect::<SmallVec<_>>(),
            },
        )
    }

    fn check_args(&self, fn_ty: TypeId, args: &[ValueId], name: &str) {
        let (params, _) = self.module.types().signature(fn_ty);
        assert!(
            params.len() == args.len(),
            "call to {name} with {} arguments, expected {}",
            args.len(),
            params.len()
        );
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            assert!(
                *param == self.type_of(*arg),
                "call to {name}: argument {i} has type {}, expected {}",
                self.module.types().display(self.type_of(*arg)),
                self.module.types().display(*param)
            );
        }
    }
}
