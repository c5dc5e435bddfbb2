//! Integer arithmetic and bitwise operations for `IrBuilder`.

use super::IrBuilder;
use crate::module::{BinOp, Inst, ValueKind};
use crate::ValueId;

impl IrBuilder<'_> {
    /// Emit `lhs op rhs`, folding constants and trivial identities.
    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.type_of(lhs);
        assert!(
            ty == self.type_of(rhs),
            "{} of mismatched types {} and {}",
            op.mnemonic(),
            self.module.types().display(ty),
            self.module.types().display(self.type_of(rhs))
        );
        assert!(
            self.module.types().int_width(ty).is_some(),
            "{} of non-integer type",
            op.mnemonic()
        );

        let lc = self.const_value(lhs);
        let rc = self.const_value(rhs);
        if let (Some(a), Some(b)) = (&lc, &rc) {
            if let Some(folded) = op.fold(a, b) {
                return self.module.push_value(ty, ValueKind::Const(folded));
            }
        }
        if let Some(identity) = Self::identity(op, lhs, rhs, lc.as_ref(), rc.as_ref()) {
            return identity;
        }
        self.emit(ty, Inst::Binary { op, lhs, rhs })
    }

    fn identity(
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
        lc: Option<&keel_bits::ApInt>,
        rc: Option<&keel_bits::ApInt>,
    ) -> Option<ValueId> {
        let r_zero = rc.is_some_and(keel_bits::ApInt::is_zero);
        let l_zero = lc.is_some_and(keel_bits::ApInt::is_zero);
        match op {
            BinOp::Add | BinOp::Or | BinOp::Xor if r_zero => Some(lhs),
            BinOp::Add | BinOp::Or | BinOp::Xor if l_zero => Some(rhs),
            BinOp::Sub | BinOp::Shl | BinOp::LShr if r_zero => Some(lhs),
            BinOp::And if rc.is_some_and(keel_bits::ApInt::is_all_ones) => Some(lhs),
            BinOp::And if lc.is_some_and(keel_bits::ApInt::is_all_ones) => Some(rhs),
            _ => None,
        }
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn udiv(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    pub fn urem(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::URem, lhs, rhs)
    }

    pub fn and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    pub fn lshr(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::LShr, lhs, rhs)
    }

    /// Shift left by a constant amount.
    pub fn shl_const(&mut self, lhs: ValueId, amount: u32) -> ValueId {
        let ty = self.type_of(lhs);
        let amount = self.const_int(ty, u64::from(amount));
        self.shl(lhs, amount)
    }

    /// Logical shift right by a constant amount.
    pub fn lshr_const(&mut self, lhs: ValueId, amount: u32) -> ValueId {
        let ty = self.type_of(lhs);
        let amount = self.const_int(ty, u64::from(amount));
        self.lshr(lhs, amount)
    }

    /// Bitwise complement.
    pub fn not(&mut self, value: ValueId) -> ValueId {
        let ty = self.type_of(value);
        let bits = self.bit_width(value);
        let ones = self.const_typed(ty, &keel_bits::ApInt::all_ones(bits));
        self.xor(value, ones)
    }
}
