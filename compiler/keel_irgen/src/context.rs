//! Per-unit layout context and the per-function emission handle.
//!
//! One [`LayoutContext`] exists per compilation unit. It owns the IR module
//! being filled, the type pool, the layout entry cache, the table of emitted
//! helper functions and the runtime declarations; all of it is dropped with
//! the context. Emission goes through an [`IrGenFunction`], which pairs an
//! [`IrBuilder`] positioned in one function with mutable access to the rest
//! of the context.

use keel_bits::Endianness;
use keel_ir::{FunctionId, GlobalId, IrBuilder, Linkage, Module, TargetConfig, TypeId, ValueId};
use rustc_hash::FxHashMap;

use crate::existential::ExistentialCache;
use crate::options::IrGenOptions;
use crate::runtime::RuntimeFn;
use crate::type_layout::{LayoutId, TypeLayoutCache};
use crate::types::{TypePool, TypeRef};

/// A pointer together with the alignment it is known to have.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ptr: ValueId,
    pub align: u64,
}

impl Address {
    pub fn new(ptr: ValueId, align: u64) -> Self {
        Self { ptr, align }
    }
}

/// Everything in a [`LayoutContext`] except the module.
pub struct LayoutState {
    pub(crate) target: TargetConfig,
    pub(crate) types: TypePool,
    pub(crate) layouts: TypeLayoutCache,
    pub(crate) helpers: FxHashMap<String, FunctionId>,
    pub(crate) runtime: FxHashMap<RuntimeFn, FunctionId>,
    pub(crate) existentials: ExistentialCache,
    pub(crate) layout_strings: FxHashMap<LayoutId, GlobalId>,
    pub(crate) options: IrGenOptions,
}

/// State for laying out and emitting code for one compilation unit.
pub struct LayoutContext {
    module: Module,
    state: LayoutState,
}

impl LayoutContext {
    pub fn new(name: &str, target: TargetConfig) -> Self {
        Self::with_options(name, target, IrGenOptions::default())
    }

    pub fn with_options(name: &str, target: TargetConfig, options: IrGenOptions) -> Self {
        tracing::debug!(module = name, triple = target.triple(), "creating layout context");
        let module = Module::new(name, target.data_layout());
        Self {
            module,
            state: LayoutState {
                target,
                types: TypePool::new(),
                layouts: TypeLayoutCache::new(),
                helpers: FxHashMap::default(),
                runtime: FxHashMap::default(),
                existentials: ExistentialCache::default(),
                layout_strings: FxHashMap::default(),
                options,
            },
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    /// Consume the context, keeping only the emitted module.
    pub fn into_module(self) -> Module {
        self.module
    }

    pub fn target(&self) -> &TargetConfig {
        &self.state.target
    }

    pub fn options(&self) -> &IrGenOptions {
        &self.state.options
    }

    pub fn types(&self) -> &TypePool {
        &self.state.types
    }

    pub fn types_mut(&mut self) -> &mut TypePool {
        &mut self.state.types
    }

    pub fn layouts(&self) -> &TypeLayoutCache {
        &self.state.layouts
    }

    /// Declare a function with an entry block, ready for emission.
    pub fn define_function(&mut self, name: &str, params: &[TypeId], ret: TypeId) -> FunctionId {
        let fn_ty = self.module.types_mut().func(params, ret);
        let function = self.module.get_or_declare_function(name, fn_ty);
        self.module.append_block(function, "entry");
        function
    }

    /// An emission handle positioned at the end of `function`'s entry block.
    pub fn function(&mut self, function: FunctionId) -> IrGenFunction<'_> {
        let mut builder = IrBuilder::new(&mut self.module, function);
        if let Some(entry) = builder.module().function(function).entry_block() {
            builder.position_at_end(entry);
        }
        IrGenFunction::new(builder, &mut self.state)
    }

    /// The module and the layout state, borrowed separately.
    pub(crate) fn parts(&mut self) -> (&mut Module, &mut LayoutState) {
        (&mut self.module, &mut self.state)
    }
}

/// Emission handle for one function.
pub struct IrGenFunction<'a> {
    pub builder: IrBuilder<'a>,
    state: &'a mut LayoutState,
    /// Type metadata known in this function, with the conditional scope depth
    /// at which each entry was recorded.
    metadata: FxHashMap<TypeRef, (ValueId, u32)>,
    dominance_depth: u32,
}

impl<'a> IrGenFunction<'a> {
    pub(crate) fn new(builder: IrBuilder<'a>, state: &'a mut LayoutState) -> Self {
        Self {
            builder,
            state,
            metadata: FxHashMap::default(),
            dominance_depth: 0,
        }
    }

    /// A handle emitting into `function` while this one is suspended.
    pub(crate) fn nested(&mut self, function: FunctionId) -> IrGenFunction<'_> {
        IrGenFunction {
            builder: self.builder.nested(function),
            state: &mut *self.state,
            metadata: FxHashMap::default(),
            dominance_depth: 0,
        }
    }

    // -- Context access --

    #[inline]
    pub fn target(&self) -> &TargetConfig {
        &self.state.target
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.state.target.endianness()
    }

    #[inline]
    pub fn pointer_size(&self) -> u64 {
        self.state.target.pointer_size()
    }

    pub fn types(&self) -> &TypePool {
        &self.state.types
    }

    pub fn layouts(&self) -> &TypeLayoutCache {
        &self.state.layouts
    }

    pub fn options(&self) -> &IrGenOptions {
        &self.state.options
    }

    pub(crate) fn state(&self) -> &LayoutState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut LayoutState {
        self.state
    }

    // -- Metadata bindings --

    /// Make `metadata` the type metadata of `ty` for the rest of the function.
    pub fn bind_metadata(&mut self, ty: TypeRef, metadata: ValueId) {
        self.metadata.insert(ty, (metadata, 0));
    }

    pub(crate) fn cached_metadata(&self, ty: TypeRef) -> Option<ValueId> {
        self.metadata.get(&ty).map(|(value, _)| *value)
    }

    /// Remember metadata computed at the current point; forgotten when the
    /// enclosing conditional scope ends.
    pub(crate) fn cache_metadata(&mut self, ty: TypeRef, metadata: ValueId) {
        self.metadata.insert(ty, (metadata, self.dominance_depth));
    }

    // -- Conditional dominance --

    /// Run `emit` for code that only executes on some paths. Values cached
    /// inside are not reused after the scope ends.
    pub fn conditional_dominance<R>(&mut self, emit: impl FnOnce(&mut Self) -> R) -> R {
        self.dominance_depth += 1;
        let result = emit(self);
        let depth = self.dominance_depth;
        self.metadata.retain(|_, (_, recorded)| *recorded < depth);
        self.dominance_depth -= 1;
        result
    }

    #[inline]
    pub fn dominance_depth(&self) -> u32 {
        self.dominance_depth
    }

    // -- Helper functions --

    /// The helper named `name`, emitting it with `body` on first request.
    /// The body receives the helper's parameters and must terminate every
    /// block it creates.
    pub(crate) fn get_or_create_helper(
        &mut self,
        name: &str,
        params: &[TypeId],
        ret: TypeId,
        body: impl FnOnce(&mut IrGenFunction<'_>, &[ValueId]),
    ) -> FunctionId {
        if let Some(function) = self.state.helpers.get(name) {
            return *function;
        }
        let module = self.builder.module_mut();
        let fn_ty = module.types_mut().func(params, ret);
        let function = module.get_or_declare_function(name, fn_ty);
        module.set_linkage(function, Linkage::LinkOnceOdr);
        module.set_noinline(function);
        // Registered before the body so recursive requests find it.
        self.state.helpers.insert(name.to_string(), function);
        tracing::debug!(helper = name, "emitting helper function");

        let mut inner = self.nested(function);
        let entry = inner.builder.append_block("entry");
        inner.builder.position_at_end(entry);
        let args: Vec<ValueId> = (0..params.len())
            .map(|i| inner.builder.module().param(function, i))
            .collect();
        body(&mut inner, &args);
        function
    }

    /// Number of helper functions emitted so far.
    pub fn helper_count(&self) -> usize {
        self.state.helpers.len()
    }
}

#[cfg(test)]
mod tests {
    use keel_ir::TargetConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> LayoutContext {
        LayoutContext::new(
            "ctx",
            TargetConfig::from_triple("x86_64-unknown-linux-gnu").unwrap_or_else(|e| panic!("{e}")),
        )
    }

    #[test]
    fn conditional_scope_forgets_metadata() {
        let mut ctx = context();
        let t = ctx.types_mut().archetype("T");
        let u = ctx.types_mut().archetype("U");
        let ptr = ctx.module_mut().types_mut().ptr();
        let void = ctx.module_mut().types_mut().void();
        let f = ctx.define_function("f", &[ptr, ptr], void);
        let mut igf = ctx.function(f);
        let p0 = igf.builder.module().param(f, 0);
        let p1 = igf.builder.module().param(f, 1);
        igf.bind_metadata(t, p0);
        igf.conditional_dominance(|igf| {
            igf.cache_metadata(u, p1);
            assert_eq!(igf.cached_metadata(u), Some(p1));
            assert_eq!(igf.dominance_depth(), 1);
        });
        assert_eq!(igf.cached_metadata(u), None);
        assert_eq!(igf.cached_metadata(t), Some(p0));
    }

    #[test]
    fn helpers_are_memoized() {
        let mut ctx = context();
        let void = ctx.module_mut().types_mut().void();
        let f = ctx.define_function("caller", &[], void);
        let mut igf = ctx.function(f);
        let mut bodies = 0;
        let first = igf.get_or_create_helper("__keel_test_helper", &[], void, |inner, _| {
            bodies += 1;
            inner.builder.ret_void();
        });
        let second = igf.get_or_create_helper("__keel_test_helper", &[], void, |inner, _| {
            inner.builder.ret_void();
        });
        assert_eq!(first, second);
        assert_eq!(bodies, 1);
        assert_eq!(igf.helper_count(), 1);
        igf.builder.call(first, &[]);
        igf.builder.ret_void();
        let module = ctx.module();
        assert_eq!(module.function(first).linkage, Linkage::LinkOnceOdr);
        assert!(!module.function(first).is_declaration());
    }
}
