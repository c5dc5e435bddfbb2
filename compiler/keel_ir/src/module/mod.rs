//! The IR module: arenas of values, blocks, functions and globals.
//!
//! Values are module-wide; an instruction's result is a value whose
//! [`ValueKind::Inst`] records the instruction and the block it lives in.
//! Instructions that produce nothing (stores, `void` calls) still get a
//! value of type `void` so every instruction has a stable handle.

mod instr;

use keel_bits::ApInt;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub use instr::{BinOp, Callee, CastOp, Inst, IntPredicate, Terminator};

use crate::types::{DataLayout, TypeTable};
use crate::{BlockId, FunctionId, GlobalId, TypeId, ValueId};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// What a value is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Integer or pointer constant; pointers hold their address.
    Const(ApInt),
    Undef,
    Param { function: FunctionId, index: u32 },
    Inst { block: BlockId, inst: Inst },
    /// Address of a function.
    Function(FunctionId),
    /// Address of a global.
    Global(GlobalId),
}

#[derive(Clone, Debug)]
pub struct ValueData {
    pub ty: TypeId,
    pub kind: ValueKind,
    pub name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BlockData {
    pub function: FunctionId,
    pub name: String,
    pub insts: Vec<ValueId>,
    pub terminator: Option<Terminator>,
}

/// Symbol visibility of a function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
    External,
    /// One copy per program, merged across units; used for shared helpers.
    LinkOnceOdr,
    Internal,
}

#[derive(Clone, Debug)]
pub struct FunctionData {
    pub name: String,
    /// Function type (`IrType::Func`).
    pub ty: TypeId,
    pub params: Vec<ValueId>,
    pub blocks: Vec<BlockId>,
    pub linkage: Linkage,
    pub noinline: bool,
}

impl FunctionData {
    /// A function with no body is a declaration resolved at link time.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// Read-only bytes with a symbol name.
#[derive(Clone, Debug)]
pub struct GlobalData {
    pub name: String,
    pub bytes: Vec<u8>,
    pub align: u64,
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// A unit of IR.
#[derive(Debug)]
pub struct Module {
    name: String,
    types: TypeTable,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    functions: Vec<FunctionData>,
    globals: Vec<GlobalData>,
    function_names: FxHashMap<String, FunctionId>,
    global_names: FxHashMap<String, GlobalId>,
}

impl Module {
    pub fn new(name: &str, layout: DataLayout) -> Self {
        Self {
            name: name.to_string(),
            types: TypeTable::new(layout),
            values: Vec::new(),
            blocks: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            function_names: FxHashMap::default(),
            global_names: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    #[inline]
    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    #[inline]
    pub fn layout(&self) -> &DataLayout {
        self.types.layout()
    }

    // -- Values --

    pub(crate) fn push_value(&mut self, ty: TypeId, kind: ValueKind) -> ValueId {
        let id = ValueId::from_index(self.values.len());
        self.values.push(ValueData {
            ty,
            kind,
            name: None,
        });
        id
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    #[inline]
    pub fn value_type(&self, id: ValueId) -> TypeId {
        self.values[id.index()].ty
    }

    pub fn set_value_name(&mut self, id: ValueId, name: &str) {
        self.values[id.index()].name = Some(name.to_string());
    }

    /// The constant behind `id`, if it is one.
    pub fn constant(&self, id: ValueId) -> Option<&ApInt> {
        match &self.values[id.index()].kind {
            ValueKind::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn inst(&self, id: ValueId) -> Option<&Inst> {
        match &self.values[id.index()].kind {
            ValueKind::Inst { inst, .. } => Some(inst),
            _ => None,
        }
    }

    pub(crate) fn inst_mut(&mut self, id: ValueId) -> Option<&mut Inst> {
        match &mut self.values[id.index()].kind {
            ValueKind::Inst { inst, .. } => Some(inst),
            _ => None,
        }
    }

    // -- Functions --

    /// Declare `name` with function type `ty`, or return the existing
    /// function of that name.
    pub fn get_or_declare_function(&mut self, name: &str, ty: TypeId) -> FunctionId {
        if let Some(id) = self.function_names.get(name) {
            let id = *id;
            assert!(
                self.functions[id.index()].ty == ty,
                "function @{name} redeclared with a different type"
            );
            return id;
        }
        let id = FunctionId::from_index(self.functions.len());
        let param_tys: SmallVec<[TypeId; 4]> =
            self.types.signature(ty).0.iter().copied().collect();
        let params = param_tys
            .iter()
            .enumerate()
            .map(|(i, pty)| {
                let index = u32::try_from(i).unwrap_or(u32::MAX);
                self.push_value(*pty, ValueKind::Param { function: id, index })
            })
            .collect();
        self.functions.push(FunctionData {
            name: name.to_string(),
            ty,
            params,
            blocks: Vec::new(),
            linkage: Linkage::External,
            noinline: false,
        });
        self.function_names.insert(name.to_string(), id);
        tracing::trace!(name, "declared function");
        id
    }

    pub fn lookup_function(&self, name: &str) -> Option<FunctionId> {
        self.function_names.get(name).copied()
    }

    #[inline]
    pub fn function(&self, id: FunctionId) -> &FunctionData {
        &self.functions[id.index()]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionData)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FunctionId::from_index(i), f))
    }

    pub fn set_linkage(&mut self, id: FunctionId, linkage: Linkage) {
        self.functions[id.index()].linkage = linkage;
    }

    pub fn set_noinline(&mut self, id: FunctionId) {
        self.functions[id.index()].noinline = true;
    }

    pub fn param(&self, function: FunctionId, index: usize) -> ValueId {
        self.functions[function.index()].params[index]
    }

    /// Return type of `function`.
    pub fn return_type(&self, function: FunctionId) -> TypeId {
        self.types.signature(self.functions[function.index()].ty).1
    }

    // -- Blocks --

    pub fn append_block(&mut self, function: FunctionId, name: &str) -> BlockId {
        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(BlockData {
            function,
            name: name.to_string(),
            insts: Vec::new(),
            terminator: None,
        });
        self.functions[function.index()].blocks.push(id);
        id
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    #[inline]
    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.index()]
    }

    // -- Globals --

    /// Add a read-only byte array; names are uniqued with a numeric suffix.
    pub fn add_global_bytes(&mut self, name: &str, bytes: Vec<u8>, align: u64) -> GlobalId {
        let mut unique = name.to_string();
        let mut n = 0;
        while self.global_names.contains_key(&unique) {
            n += 1;
            unique = format!("{name}.{n}");
        }
        let id = GlobalId::from_index(self.globals.len());
        self.global_names.insert(unique.clone(), id);
        self.globals.push(GlobalData {
            name: unique,
            bytes,
            align,
        });
        id
    }

    /// Add a NUL-terminated string constant.
    pub fn add_global_string(&mut self, name: &str, text: &str) -> GlobalId {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.add_global_bytes(name, bytes, 1)
    }

    #[inline]
    pub fn global(&self, id: GlobalId) -> &GlobalData {
        &self.globals[id.index()]
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalData)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalId::from_index(i), g))
    }
}

#[cfg(test)]
mod tests {
    use keel_bits::Endianness;

    use super::*;

    fn module() -> Module {
        Module::new(
            "m",
            DataLayout {
                pointer_width: 64,
                endianness: Endianness::Little,
                max_int_alignment: 8,
            },
        )
    }

    #[test]
    fn declare_is_idempotent() {
        let mut m = module();
        let ptr = m.types_mut().ptr();
        let void = m.types_mut().void();
        let ty = m.types_mut().func(&[ptr], void);
        let a = m.get_or_declare_function("keel_release", ty);
        let b = m.get_or_declare_function("keel_release", ty);
        assert_eq!(a, b);
        assert!(m.function(a).is_declaration());
        assert_eq!(m.function(a).params.len(), 1);
        assert_eq!(m.value_type(m.param(a, 0)), ptr);
    }

    #[test]
    #[should_panic(expected = "redeclared")]
    fn redeclare_with_new_type_panics() {
        let mut m = module();
        let void = m.types_mut().void();
        let ptr = m.types_mut().ptr();
        let a = m.types_mut().func(&[], void);
        let b = m.types_mut().func(&[ptr], void);
        m.get_or_declare_function("f", a);
        m.get_or_declare_function("f", b);
    }

    #[test]
    fn global_names_are_uniqued() {
        let mut m = module();
        let a = m.add_global_string("msg", "size");
        let b = m.add_global_string("msg", "stride");
        assert_eq!(m.global(a).name, "msg");
        assert_eq!(m.global(b).name, "msg.1");
        assert_eq!(m.global(b).bytes.last(), Some(&0));
    }
}
