//! Instruction builder.
//!
//! `IrBuilder` appends instructions to the current block of the current
//! function. Operations on constants fold eagerly, and a few identities
//! (`x | 0`, `x & ~0`, shifts by zero, zero byte offsets) return the input
//! value instead of emitting anything, so emitted helpers stay readable.
//!
//! # Method Organization
//!
//! | Category | Methods |
//! |----------|---------|
//! | Constants | `const_int`, `const_ap`, `const_size`, `const_bool`, `const_null`, `undef`, ... |
//! | Arithmetic | `add`, `sub`, `mul`, `udiv`, `and`, `or`, `xor`, `shl`, `lshr`, `not` |
//! | Comparisons | `icmp`, `icmp_eq`, `icmp_ne`, `icmp_ult`, ... |
//! | Conversions | `zext`, `trunc`, `zext_or_trunc`, `int_to_ptr`, `ptr_to_int`, `coerce` |
//! | Memory | `alloca`, `load`, `store`, `byte_offset`, `struct_gep`, `memcpy`, `memset` |
//! | Control flow | `br`, `cond_br`, `switch`, `select`, `ret`, `unreachable`, `phi` |
//! | Calls | `call`, `call_indirect` |
//! | Blocks | `append_block`, `position_at_end`, `current_block`, `insert_point` |

mod arithmetic;
mod calls;
mod comparisons;
mod constants;
mod control_flow;
mod conversions;
mod memory;

use crate::module::{Inst, ValueKind};
use crate::{BlockId, FunctionId, Module, TypeId, ValueId};

/// Saved builder position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InsertPoint {
    function: FunctionId,
    block: Option<BlockId>,
}

/// Builds instructions into a [`Module`].
pub struct IrBuilder<'m> {
    module: &'m mut Module,
    function: FunctionId,
    block: Option<BlockId>,
}

impl<'m> IrBuilder<'m> {
    /// A builder for `function`, not yet positioned in a block.
    pub fn new(module: &'m mut Module, function: FunctionId) -> Self {
        Self {
            module,
            function,
            block: None,
        }
    }

    /// A second builder over the same module, for emitting into another
    /// function while this one is suspended.
    pub fn nested(&mut self, function: FunctionId) -> IrBuilder<'_> {
        IrBuilder {
            module: &mut *self.module,
            function,
            block: None,
        }
    }

    #[inline]
    pub fn module(&self) -> &Module {
        self.module
    }

    #[inline]
    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    #[inline]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    // -- Types --

    #[inline]
    pub fn type_of(&self, value: ValueId) -> TypeId {
        self.module.value_type(value)
    }

    pub fn void_type(&mut self) -> TypeId {
        self.module.types_mut().void()
    }

    pub fn bool_type(&mut self) -> TypeId {
        self.module.types_mut().i1()
    }

    pub fn i8_type(&mut self) -> TypeId {
        self.module.types_mut().i8()
    }

    pub fn i32_type(&mut self) -> TypeId {
        self.module.types_mut().i32()
    }

    pub fn int_type(&mut self, bits: u32) -> TypeId {
        self.module.types_mut().int(bits)
    }

    /// The pointer-width integer type.
    pub fn size_type(&mut self) -> TypeId {
        self.module.types_mut().size_int()
    }

    pub fn ptr_type(&mut self) -> TypeId {
        self.module.types_mut().ptr()
    }

    /// Bit width of an integer or pointer value.
    pub fn bit_width(&self, value: ValueId) -> u32 {
        let ty = self.type_of(value);
        self.module
            .types()
            .scalar_bits(ty)
            .unwrap_or_else(|| panic!("bit width of non-scalar value of type {}", self.module.types().display(ty)))
    }

    #[inline]
    pub fn pointer_width(&self) -> u32 {
        self.module.layout().pointer_width
    }

    // -- Blocks --

    pub fn append_block(&mut self, name: &str) -> BlockId {
        self.module.append_block(self.function, name)
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        assert!(
            self.module.block(block).function == self.function,
            "positioning in a block of another function"
        );
        self.block = Some(block);
    }

    #[inline]
    pub fn current_block(&self) -> Option<BlockId> {
        self.block
    }

    /// True if the current block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        self.block
            .is_some_and(|b| self.module.block(b).terminator.is_some())
    }

    pub fn insert_point(&self) -> InsertPoint {
        InsertPoint {
            function: self.function,
            block: self.block,
        }
    }

    pub fn restore(&mut self, point: InsertPoint) {
        self.function = point.function;
        self.block = point.block;
    }

    // -- Emission --

    fn current(&self) -> BlockId {
        let Some(block) = self.block else {
            panic!("builder is not positioned in a block");
        };
        assert!(
            self.module.block(block).terminator.is_none(),
            "emitting into terminated block '{}'",
            self.module.block(block).name
        );
        block
    }

    pub(crate) fn emit(&mut self, ty: TypeId, inst: Inst) -> ValueId {
        let block = self.current();
        let id = self.module.push_value(ty, ValueKind::Inst { block, inst });
        self.module.block_mut(block).insts.push(id);
        id
    }

    pub(crate) fn constant(&self, value: ValueId) -> Option<&keel_bits::ApInt> {
        self.module.constant(value)
    }

    /// Name a value for printing.
    pub fn name_value(&mut self, value: ValueId, name: &str) {
        self.module.set_value_name(value, name);
    }
}

#[cfg(test)]
mod tests;
