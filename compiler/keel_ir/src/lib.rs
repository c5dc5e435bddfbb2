//! Machine IR for the Keel layout engine.
//!
//! A deliberately small SSA IR covering what layout code emits: integer
//! arithmetic and comparisons, pointer arithmetic, loads and stores, memory
//! copies, direct and indirect calls, branches, switches and phis.
//!
//! - [`TargetConfig`]: target triple parsing and the layout facts derived
//!   from it.
//! - [`TypeTable`]: interned types with size and alignment queries.
//! - [`Module`]: arenas of values, blocks, functions and globals.
//! - [`IrBuilder`]: appends instructions, folding constants as it goes.
//! - [`Interpreter`]: executes functions against byte-addressed [`Memory`],
//!   forwarding calls to undefined functions to a [`HostFunctions`] runtime.
//!
//! Printing a [`Module`] with `{}` yields LLVM-flavored text.

mod builder;
mod ids;
mod interp;
mod module;
mod print;
mod target;
mod types;

pub use builder::{InsertPoint, IrBuilder};
pub use ids::{BlockId, FunctionId, GlobalId, TypeId, ValueId};
pub use interp::{HostFunctions, InterpError, Interpreter, Memory, DEFAULT_STEP_LIMIT, HEAP_BASE};
pub use module::{
    BinOp, BlockData, Callee, CastOp, FunctionData, GlobalData, Inst, IntPredicate, Linkage,
    Module, Terminator, ValueData, ValueKind,
};
pub use target::{TargetConfig, TargetError, TargetTripleComponents, SUPPORTED_TARGETS};
pub use types::{align_to, DataLayout, IrType, TypeTable};
