//! Reference interpreter for emitted IR.
//!
//! Executes functions of a [`Module`] against [`Memory`]. Every SSA value is
//! a scalar (an integer or a pointer-width address); aggregates only ever
//! live in memory. Calls to functions without a body are routed to a
//! [`HostFunctions`] implementation, which is how tests plug in a runtime.

mod memory;

use std::fmt;

use keel_bits::ApInt;
use rustc_hash::FxHashMap;

pub use memory::{Memory, HEAP_BASE};

use crate::module::{Callee, CastOp, Inst, Terminator, ValueKind};
use crate::{BlockId, FunctionId, GlobalId, Module, ValueId};

/// Default bound on executed instructions per [`Interpreter::run`].
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Execution fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpError {
    /// Access outside allocated memory.
    OutOfBounds { addr: u64, len: u64 },
    /// Indirect call to an address that is neither a function nor a symbol.
    BadCallee(u64),
    /// Declared function the host does not provide.
    UnresolvedSymbol(String),
    /// Wrong number of arguments.
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },
    DivisionByZero,
    /// Control reached an `unreachable` terminator.
    Unreachable { function: String, block: String },
    /// A block without a terminator.
    Unterminated { function: String, block: String },
    /// A value used before it was computed.
    UndefinedValue(u32),
    /// A load, store or argument of a type the interpreter cannot hold.
    NonScalar(String),
    StepLimit(u64),
    /// Fault reported by a host function.
    Host(String),
}

impl fmt::Display for InterpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { addr, len } => {
                write!(f, "access of {len} bytes at {addr:#x} is out of bounds")
            }
            Self::BadCallee(addr) => write!(f, "call through invalid function pointer {addr:#x}"),
            Self::UnresolvedSymbol(name) => write!(f, "unresolved symbol '{name}'"),
            Self::ArityMismatch {
                function,
                expected,
                found,
            } => write!(f, "'{function}' called with {found} arguments, expected {expected}"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::Unreachable { function, block } => {
                write!(f, "reached unreachable in '{function}' block '{block}'")
            }
            Self::Unterminated { function, block } => {
                write!(f, "block '{block}' of '{function}' has no terminator")
            }
            Self::UndefinedValue(id) => write!(f, "value %{id} used before definition"),
            Self::NonScalar(ty) => write!(f, "non-scalar type {ty} in a register"),
            Self::StepLimit(limit) => write!(f, "step limit of {limit} exceeded"),
            Self::Host(message) => write!(f, "host fault: {message}"),
        }
    }
}

impl std::error::Error for InterpError {}

/// Implementations of the functions a module declares but does not define.
pub trait HostFunctions {
    /// Run `name` with `args`. Return `Ok(None)` for `void` functions.
    fn call(
        &mut self,
        name: &str,
        args: &[ApInt],
        memory: &mut Memory,
    ) -> Result<Option<ApInt>, InterpError>;
}

/// Executes functions of one module.
pub struct Interpreter<'m, H> {
    module: &'m Module,
    memory: Memory,
    host: H,
    globals: Vec<u64>,
    steps: u64,
    step_limit: u64,
}

struct Frame {
    function: FunctionId,
    args: Vec<ApInt>,
    values: FxHashMap<ValueId, ApInt>,
}

impl<'m, H: HostFunctions> Interpreter<'m, H> {
    /// Create an interpreter, copying the module's globals into `memory`.
    pub fn new(module: &'m Module, mut memory: Memory, host: H) -> Result<Self, InterpError> {
        let mut globals = Vec::new();
        for (_, global) in module.globals() {
            let addr = memory.alloc(global.bytes.len() as u64, global.align);
            memory.write_bytes(addr, &global.bytes)?;
            globals.push(addr);
        }
        Ok(Self {
            module,
            memory,
            host,
            globals,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        })
    }

    #[must_use]
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Split borrow of host and memory, for setting up test state.
    pub fn host_and_memory(&mut self) -> (&mut H, &mut Memory) {
        (&mut self.host, &mut self.memory)
    }

    pub fn global_address(&self, global: GlobalId) -> u64 {
        self.globals[global.index()]
    }

    /// Run `function` to completion.
    pub fn run(&mut self, function: FunctionId, args: &[ApInt]) -> Result<Option<ApInt>, InterpError> {
        self.steps = 0;
        self.call_function(function, args.to_vec())
    }

    fn call_function(
        &mut self,
        function: FunctionId,
        args: Vec<ApInt>,
    ) -> Result<Option<ApInt>, InterpError> {
        let module = self.module;
        let data = module.function(function);
        if args.len() != data.params.len() {
            return Err(InterpError::ArityMismatch {
                function: data.name.clone(),
                expected: data.params.len(),
                found: args.len(),
            });
        }
        let ret_ty = module.return_type(function);
        let result = if data.is_declaration() {
            tracing::trace!(name = %data.name, "host call");
            self.host.call(&data.name, &args, &mut self.memory)?
        } else {
            let mut frame = Frame {
                function,
                args,
                values: FxHashMap::default(),
            };
            self.execute(&mut frame)?
        };
        let types = module.types();
        Ok(match (result, types.scalar_bits(ret_ty)) {
            (Some(v), Some(bits)) => Some(v.zext_or_trunc(bits)),
            _ => None,
        })
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<Option<ApInt>, InterpError> {
        let module = self.module;
        let data = module.function(frame.function);
        let mut block = data.blocks[0];
        let mut previous: Option<BlockId> = None;
        loop {
            let bd = module.block(block);
            // Phis read their inputs simultaneously.
            let mut phi_values = Vec::new();
            for id in &bd.insts {
                if let Some(Inst::Phi { incoming }) = module.inst(*id) {
                    let from = previous.and_then(|p| incoming.iter().find(|(_, b)| *b == p));
                    let Some((value, _)) = from else {
                        return Err(InterpError::UndefinedValue(id.raw()));
                    };
                    phi_values.push((*id, self.operand(frame, *value)?));
                }
            }
            for (id, value) in phi_values {
                frame.values.insert(id, value);
            }

            for id in &bd.insts {
                let Some(inst) = module.inst(*id) else {
                    continue;
                };
                if matches!(inst, Inst::Phi { .. }) {
                    continue;
                }
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(InterpError::StepLimit(self.step_limit));
                }
                if let Some(value) = self.step(frame, *id, inst)? {
                    frame.values.insert(*id, value);
                }
            }

            let Some(terminator) = &bd.terminator else {
                return Err(InterpError::Unterminated {
                    function: data.name.clone(),
                    block: bd.name.clone(),
                });
            };
            let next = match terminator {
                Terminator::Br(dest) => *dest,
                Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    if self.operand(frame, *cond)?.is_zero() {
                        *else_block
                    } else {
                        *then_block
                    }
                }
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    let v = self.operand(frame, *value)?;
                    cases
                        .iter()
                        .find(|(case, _)| *case == v)
                        .map_or(*default, |(_, b)| *b)
                }
                Terminator::Ret(value) => {
                    return value.map(|v| self.operand(frame, v)).transpose();
                }
                Terminator::Unreachable => {
                    return Err(InterpError::Unreachable {
                        function: data.name.clone(),
                        block: bd.name.clone(),
                    });
                }
            };
            previous = Some(block);
            block = next;
        }
    }

    fn operand(&self, frame: &Frame, value: ValueId) -> Result<ApInt, InterpError> {
        let data = self.module.value(value);
        let types = self.module.types();
        let width = || {
            types
                .scalar_bits(data.ty)
                .ok_or_else(|| InterpError::NonScalar(types.display(data.ty)))
        };
        let pointer_width = self.memory.pointer_width();
        match &data.kind {
            ValueKind::Const(c) => Ok(c.clone()),
            ValueKind::Undef => Ok(ApInt::zero(width()?)),
            ValueKind::Param { index, .. } => frame
                .args
                .get(*index as usize)
                .cloned()
                .ok_or(InterpError::UndefinedValue(value.raw())),
            ValueKind::Inst { .. } => frame
                .values
                .get(&value)
                .cloned()
                .ok_or(InterpError::UndefinedValue(value.raw())),
            ValueKind::Function(f) => Ok(ApInt::new(pointer_width, Memory::function_address(*f))),
            ValueKind::Global(g) => Ok(ApInt::new(pointer_width, self.globals[g.index()])),
        }
    }

    fn address(&self, frame: &Frame, value: ValueId) -> Result<u64, InterpError> {
        Ok(self.operand(frame, value)?.low_u64())
    }

    fn step(&mut self, frame: &Frame, id: ValueId, inst: &Inst) -> Result<Option<ApInt>, InterpError> {
        let module = self.module;
        let types = module.types();
        let result_ty = module.value_type(id);
        let pointer_width = self.memory.pointer_width();
        let value = match inst {
            Inst::Binary { op, lhs, rhs } => {
                let a = self.operand(frame, *lhs)?;
                let b = self.operand(frame, *rhs)?;
                Some(op.fold(&a, &b).ok_or(InterpError::DivisionByZero)?)
            }
            Inst::ICmp { pred, lhs, rhs } => {
                let a = self.operand(frame, *lhs)?;
                let b = self.operand(frame, *rhs)?;
                Some(ApInt::new(1, u64::from(pred.fold(&a, &b))))
            }
            Inst::Cast { op, value } => {
                let v = self.operand(frame, *value)?;
                let bits = match op {
                    CastOp::IntToPtr => pointer_width,
                    _ => types
                        .scalar_bits(result_ty)
                        .ok_or_else(|| InterpError::NonScalar(types.display(result_ty)))?,
                };
                Some(v.zext_or_trunc(bits))
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
            } => {
                let c = self.operand(frame, *cond)?;
                Some(self.operand(frame, if c.is_zero() { *else_value } else { *then_value })?)
            }
            Inst::Alloca { ty, align } => {
                let addr = self.memory.alloc(types.alloc_size(*ty), *align);
                Some(ApInt::new(pointer_width, addr))
            }
            Inst::Load { ptr, .. } => {
                let addr = self.address(frame, *ptr)?;
                let bits = types
                    .scalar_bits(result_ty)
                    .ok_or_else(|| InterpError::NonScalar(types.display(result_ty)))?;
                Some(self.memory.load_int(addr, bits)?)
            }
            Inst::Store { value, ptr, .. } => {
                let v = self.operand(frame, *value)?;
                let addr = self.address(frame, *ptr)?;
                self.memory.store_int(addr, &v)?;
                None
            }
            Inst::ByteOffset { base, offset } => {
                let base = self.operand(frame, *base)?;
                let offset = self.operand(frame, *offset)?.zext_or_trunc(pointer_width);
                Some(base.wrapping_add(&offset))
            }
            Inst::StructGep {
                base,
                struct_ty,
                index,
            } => {
                let base = self.address(frame, *base)?;
                let offset = types.field_offset(*struct_ty, *index as usize);
                Some(ApInt::new(pointer_width, base.wrapping_add(offset)))
            }
            Inst::MemCpy { dest, src, size } => {
                let dest = self.address(frame, *dest)?;
                let src = self.address(frame, *src)?;
                let size = self.operand(frame, *size)?.low_u64();
                self.memory.copy(dest, src, size)?;
                None
            }
            Inst::MemSet { dest, byte, size } => {
                let dest = self.address(frame, *dest)?;
                let byte = self.operand(frame, *byte)?.low_u64() as u8;
                let size = self.operand(frame, *size)?.low_u64();
                self.memory.fill(dest, byte, size)?;
                None
            }
            Inst::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|a| self.operand(frame, *a))
                    .collect::<Result<Vec<_>, _>>()?;
                match callee {
                    Callee::Direct(function) => self.call_function(*function, args)?,
                    Callee::Indirect { ptr, fn_ty } => {
                        let addr = self.address(frame, *ptr)?;
                        if let Some(function) = Memory::function_at(addr) {
                            self.call_function(function, args)?
                        } else if let Some(name) = self.memory.symbol_at(addr) {
                            let name = name.to_string();
                            let ret = types.signature(*fn_ty).1;
                            let result = self.host.call(&name, &args, &mut self.memory)?;
                            match (result, types.scalar_bits(ret)) {
                                (Some(v), Some(bits)) => Some(v.zext_or_trunc(bits)),
                                _ => None,
                            }
                        } else {
                            return Err(InterpError::BadCallee(addr));
                        }
                    }
                }
            }
            Inst::Phi { .. } => None,
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests;
