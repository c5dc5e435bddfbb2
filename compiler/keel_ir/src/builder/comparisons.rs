//! Integer comparisons and selects for `IrBuilder`.

use super::IrBuilder;
use crate::module::{Inst, IntPredicate, ValueKind};
use crate::ValueId;

impl IrBuilder<'_> {
    /// Unsigned comparison producing an `i1`. Pointers compare as addresses.
    pub fn icmp(&mut self, pred: IntPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        assert!(
            self.type_of(lhs) == self.type_of(rhs),
            "icmp {} of mismatched types",
            pred.mnemonic()
        );
        let i1 = self.bool_type();
        if let (Some(a), Some(b)) = (self.const_value(lhs), self.const_value(rhs)) {
            let result = pred.fold(&a, &b);
            return self
                .module
                .push_value(i1, ValueKind::Const(keel_bits::ApInt::new(1, u64::from(result))));
        }
        self.emit(i1, Inst::ICmp { pred, lhs, rhs })
    }

    pub fn icmp_eq(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Eq, lhs, rhs)
    }

    pub fn icmp_ne(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Ne, lhs, rhs)
    }

    pub fn icmp_ult(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Ult, lhs, rhs)
    }

    pub fn icmp_ule(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Ule, lhs, rhs)
    }

    pub fn icmp_ugt(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Ugt, lhs, rhs)
    }

    pub fn icmp_uge(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.icmp(IntPredicate::Uge, lhs, rhs)
    }

    /// `cond ? then_value : else_value`.
    pub fn select(&mut self, cond: ValueId, then_value: ValueId, else_value: ValueId) -> ValueId {
        let ty = self.type_of(then_value);
        assert!(ty == self.type_of(else_value), "select of mismatched types");
        if let Some(c) = self.const_value(cond) {
            return if c.is_zero() { else_value } else { then_value };
        }
        if then_value == else_value {
            return then_value;
        }
        self.emit(
            ty,
            Inst::Select {
                cond,
                then_value,
                else_value,
            },
        )
    }

    /// Logical and of two `i1` values.
    pub fn and_bool(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        if let Some(c) = self.const_value(lhs) {
            return if c.is_zero() { lhs } else { rhs };
        }
        if let Some(c) = self.const_value(rhs) {
            return if c.is_zero() { rhs } else { lhs };
        }
        self.and(lhs, rhs)
    }
}
