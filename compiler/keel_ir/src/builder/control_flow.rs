//! Terminators and phi nodes for `IrBuilder`.

use keel_bits::ApInt;

use super::IrBuilder;
use crate::module::{Inst, Terminator, ValueKind};
use crate::{BlockId, TypeId, ValueId};

impl IrBuilder<'_> {
    fn terminate(&mut self, terminator: Terminator) {
        let block = self.current();
        self.module.block_mut(block).terminator = Some(terminator);
    }

    pub fn br(&mut self, dest: BlockId) {
        self.terminate(Terminator::Br(dest));
    }

    /// Conditional branch; a constant condition becomes a plain branch.
    pub fn cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) {
        if let Some(c) = self.const_value(cond) {
            self.br(if c.is_zero() { else_block } else { then_block });
            return;
        }
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        });
    }

    /// Multi-way branch on an integer. Case values must be distinct and
    /// as wide as `value`.
    pub fn switch(&mut self, value: ValueId, default: BlockId, cases: Vec<(ApInt, BlockId)>) {
        let width = self.bit_width(value);
        for (i, (case, _)) in cases.iter().enumerate() {
            assert!(case.width() == width, "switch case of width {} on i{width}", case.width());
            assert!(
                cases[..i].iter().all(|(other, _)| other != case),
                "duplicate switch case {case}"
            );
        }
        if let Some(c) = self.const_value(value) {
            let dest = cases
                .iter()
                .find(|(case, _)| *case == c)
                .map_or(default, |(_, b)| *b);
            self.br(dest);
            return;
        }
        self.terminate(Terminator::Switch {
            value,
            default,
            cases,
        });
    }

    pub fn ret(&mut self, value: ValueId) {
        self.terminate(Terminator::Ret(Some(value)));
    }

    pub fn ret_void(&mut self) {
        self.terminate(Terminator::Ret(None));
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    /// Phi node of type `ty` at the top of the current block.
    pub fn phi(&mut self, ty: TypeId, incoming: &[(ValueId, BlockId)]) -> ValueId {
        let block = self.current();
        let id = self.module.push_value(
            ty,
            ValueKind::Inst {
                block,
                inst: Inst::Phi {
                    incoming: incoming.to_vec(),
                },
            },
        );
        let position = {
            let module = &*self.module;
            module
                .block(block)
                .insts
                .iter()
                .take_while(|v| matches!(module.inst(**v), Some(Inst::Phi { .. })))
                .count()
        };
        self.module.block_mut(block).insts.insert(position, id);
        id
    }

    pub fn add_incoming(&mut self, phi: ValueId, value: ValueId, block: BlockId) {
        match self.module.inst_mut(phi) {
            Some(Inst::Phi { incoming }) => incoming.push((value, block)),
            _ => panic!("add_incoming on a non-phi value"),
        }
    }
}
