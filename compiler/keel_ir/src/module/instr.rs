//! Instructions and terminators.

use keel_bits::ApInt;
use smallvec::SmallVec;

use crate::{BlockId, FunctionId, TypeId, ValueId};

/// Two-operand integer operation. All arithmetic wraps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::UDiv => "udiv",
            Self::URem => "urem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::LShr => "lshr",
        }
    }

    /// Evaluate on constants. `None` for division by zero.
    pub fn fold(self, lhs: &ApInt, rhs: &ApInt) -> Option<ApInt> {
        let shift_amount = || u32::try_from(rhs.low_u64()).unwrap_or(u32::MAX);
        Some(match self {
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::UDiv | Self::URem => {
                let (Some(a), Some(b)) = (lhs.to_u64(), rhs.to_u64()) else {
                    return None;
                };
                if b == 0 {
                    return None;
                }
                let r = if self == Self::UDiv { a / b } else { a % b };
                ApInt::new(lhs.width(), r)
            }
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
            Self::Shl => lhs.shl(shift_amount()),
            Self::LShr => lhs.lshr(shift_amount()),
        })
    }
}

/// Unsigned integer comparison predicates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntPredicate {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Ult => "ult",
            Self::Ule => "ule",
            Self::Ugt => "ugt",
            Self::Uge => "uge",
        }
    }

    pub fn fold(self, lhs: &ApInt, rhs: &ApInt) -> bool {
        let ord = lhs.cmp_unsigned(rhs);
        match self {
            Self::Eq => ord.is_eq(),
            Self::Ne => ord.is_ne(),
            Self::Ult => ord.is_lt(),
            Self::Ule => ord.is_le(),
            Self::Ugt => ord.is_gt(),
            Self::Uge => ord.is_ge(),
        }
    }
}

/// Conversions; the destination type is the result value's type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CastOp {
    ZExt,
    Trunc,
    IntToPtr,
    PtrToInt,
}

impl CastOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::ZExt => "zext",
            Self::Trunc => "trunc",
            Self::IntToPtr => "inttoptr",
            Self::PtrToInt => "ptrtoint",
        }
    }
}

/// Target of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Direct(FunctionId),
    /// Call through a function pointer with the given function type.
    Indirect { ptr: ValueId, fn_ty: TypeId },
}

/// A non-terminator instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inst {
    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    ICmp {
        pred: IntPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cast {
        op: CastOp,
        value: ValueId,
    },
    Select {
        cond: ValueId,
        then_value: ValueId,
        else_value: ValueId,
    },
    /// Stack slot of `ty`; the result is a pointer.
    Alloca {
        ty: TypeId,
        align: u64,
    },
    /// Load of the result value's type.
    Load {
        ptr: ValueId,
        align: u64,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
        align: u64,
    },
    /// `base + offset` bytes.
    ByteOffset {
        base: ValueId,
        offset: ValueId,
    },
    /// Address of field `index` of a struct of type `struct_ty` at `base`.
    StructGep {
        base: ValueId,
        struct_ty: TypeId,
        index: u32,
    },
    MemCpy {
        dest: ValueId,
        src: ValueId,
        size: ValueId,
    },
    MemSet {
        dest: ValueId,
        byte: ValueId,
        size: ValueId,
    },
    Call {
        callee: Callee,
        args: SmallVec<[ValueId; 4]>,
    },
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
}

impl Inst {
    /// Operands read by this instruction, in order.
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        let mut ops = SmallVec::new();
        match self {
            Self::Binary { lhs, rhs, .. } | Self::ICmp { lhs, rhs, .. } => {
                ops.push(*lhs);
                ops.push(*rhs);
            }
            Self::Cast { value, .. } => ops.push(*value),
            Self::Select {
                cond,
                then_value,
                else_value,
            } => ops.extend([*cond, *then_value, *else_value]),
            Self::Alloca { .. } => {}
            Self::Load { ptr, .. } => ops.push(*ptr),
            Self::Store { value, ptr, .. } => ops.extend([*value, *ptr]),
            Self::ByteOffset { base, offset } => ops.extend([*base, *offset]),
            Self::StructGep { base, .. } => ops.push(*base),
            Self::MemCpy { dest, src, size } => ops.extend([*dest, *src, *size]),
            Self::MemSet { dest, byte, size } => ops.extend([*dest, *byte, *size]),
            Self::Call { callee, args } => {
                if let Callee::Indirect { ptr, .. } = callee {
                    ops.push(*ptr);
                }
                ops.extend(args.iter().copied());
            }
            Self::Phi { incoming } => ops.extend(incoming.iter().map(|(v, _)| *v)),
        }
        ops
    }
}

/// The instruction that ends a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        value: ValueId,
        default: BlockId,
        cases: Vec<(ApInt, BlockId)>,
    },
    Ret(Option<ValueId>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Self::Br(dest) => smallvec::smallvec![*dest],
            Self::CondBr {
                then_block,
                else_block,
                ..
            } => smallvec::smallvec![*then_block, *else_block],
            Self::Switch { default, cases, .. } => {
                let mut out: SmallVec<[BlockId; 2]> = smallvec::smallvec![*default];
                out.extend(cases.iter().map(|(_, b)| *b));
                out
            }
            Self::Ret(_) | Self::Unreachable => SmallVec::new(),
        }
    }
}
