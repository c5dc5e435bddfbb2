use keel_bits::{ApInt, Endianness};
use keel_ir::{FunctionId, Interpreter, Memory, TargetConfig};
use pretty_assertions::assert_eq;

use super::*;
use crate::context::LayoutContext;
use crate::test_runtime::{context, TestRuntime, TestType};
use crate::types::{TypeDesc, TypeRef};
use crate::{ScalarKind, TypeLayoutEntry};

fn target(triple: &str) -> TargetConfig {
    TargetConfig::from_triple(triple).unwrap_or_else(|e| panic!("{e}"))
}

#[test]
fn opaque_container_with_two_tables() {
    let target = target("x86_64-unknown-linux-gnu");
    let layout = ExistentialLayout::for_protocols(&[Protocol::new("P"), Protocol::new("Q")]);
    assert_eq!(layout.representation, ExistentialRepresentation::Opaque);
    assert_eq!(layout.num_tables, 2);
    assert_eq!(layout.size(&target), target.fixed_buffer_size() + 8 * (2 + 1));
    let opaque = layout.opaque().unwrap_or_else(|| panic!("opaque layout"));
    assert_eq!(opaque.align(&target), 8);
    assert_eq!(opaque.metadata_ref_offset(&target), 24);

    let info = layout.type_info(&target);
    assert_eq!(info.size(), 48);
    assert_eq!(info.extra_inhabitants(), &ExtraInhabitants::HeapPointer { offset: 24 });
    assert!(!info.is_trivially_destroyable());
    assert!(info.is_bitwise_takable());
}

#[test]
fn opaque_storage_type_is_named_after_table_count() {
    let mut ctx = context(Endianness::Little);
    let types = ctx.module_mut().types_mut();
    let ty = OpaqueExistentialLayout::new(3).storage_type(types, 3);
    assert_eq!(types.lookup_named("__opaque_existential_type_3"), Some(ty));
    assert_eq!(types.struct_fields(ty).len(), 5);
    assert_eq!(types.alloc_size(ty), 24 + 8 * 4);
}

#[test]
fn storage_type_matches_size_on_32_bit() {
    let i686 = target("i686-unknown-linux-gnu");
    let mut ctx = LayoutContext::new("i686", i686.clone());
    let layout = OpaqueExistentialLayout::new(2);
    let types = ctx.module_mut().types_mut();
    let ty = layout.storage_type(types, i686.fixed_buffer_words());
    assert_eq!(types.alloc_size(ty), layout.size(&i686));
    assert_eq!(layout.size(&i686), 12 + 4 * 3);
}

#[test]
fn representation_follows_the_protocols() {
    let error = ExistentialLayout::for_protocols(&[Protocol::error()]);
    assert_eq!(error.representation, ExistentialRepresentation::Error);
    assert_eq!(error.num_tables, 0);

    let class = ExistentialLayout::for_protocols(&[Protocol::new("P"), Protocol::class_bound("C")]);
    assert_eq!(class.representation, ExistentialRepresentation::Class);
    assert_eq!(class.num_tables, 2);
    assert_eq!(class.size(&target("i686-unknown-linux-gnu")), 12);

    // The error protocol only boxes on its own.
    let mixed = ExistentialLayout::for_protocols(&[Protocol::error(), Protocol::new("P")]);
    assert_eq!(mixed.representation, ExistentialRepresentation::Opaque);
    assert!(mixed.opaque().is_some());
    assert!(class.opaque().is_none());

    let any = ExistentialLayout::for_protocols(&[]);
    assert_eq!(any.representation, ExistentialRepresentation::Opaque);
    assert_eq!(any.num_tables, 0);
}

#[test]
fn class_instances_use_unknown_refcounting_on_darwin() {
    let darwin = target("aarch64-apple-darwin");
    let linux = target("aarch64-unknown-linux-gnu");
    assert_eq!(class_instance_refcounting(&darwin), ReferenceCounting::Unknown);
    assert_eq!(class_instance_refcounting(&linux), ReferenceCounting::Native);
    assert_eq!(class_instance_runtime_fn(&darwin, true), RuntimeFn::UnknownObjectRetain);
    assert_eq!(class_instance_runtime_fn(&linux, false), RuntimeFn::Release);
}

#[test]
fn existential_types_lower_by_representation() {
    let mut ctx = context(Endianness::Little);
    let opaque = ctx.types_mut().existential(&[Protocol::new("P")]);
    let class = ctx.types_mut().existential(&[Protocol::class_bound("C")]);
    let error = ctx.types_mut().existential(&[Protocol::error()]);
    let opaque_id = ctx.type_layout(opaque);
    let class_id = ctx.type_layout(class);
    let error_id = ctx.type_layout(error);
    assert_eq!(ctx.type_layout(opaque), opaque_id);

    let layouts = ctx.layouts();
    assert_eq!(layouts.fixed_size(opaque_id), Some(40));
    assert!(!layouts.is_single_retainable_pointer(opaque_id));
    assert!(!layouts.is_single_retainable_pointer(class_id));
    assert_eq!(layouts.fixed_size(class_id), Some(16));
    assert!(matches!(
        layouts.get(class_id),
        TypeLayoutEntry::Scalar {
            kind: ScalarKind::ExistentialReference { num_tables: 1 },
            ..
        }
    ));
    assert!(matches!(
        layouts.get(error_id),
        TypeLayoutEntry::Scalar {
            kind: ScalarKind::ErrorReference,
            ..
        }
    ));
    assert!(matches!(ctx.types().get(opaque), TypeDesc::Existential { .. }));
}

#[test]
fn class_existentials_without_tables_are_one_pointer() {
    let objc = ExistentialLayout::for_protocols(&[Protocol::objc("O")]);
    assert_eq!(objc.representation, ExistentialRepresentation::Class);
    assert_eq!(objc.num_tables, 0);
    let mixed = ExistentialLayout::for_protocols(&[Protocol::objc("O"), Protocol::class_bound("C")]);
    assert_eq!(mixed.num_tables, 1);

    let mut ctx = context(Endianness::Little);
    let bare = ctx.types_mut().existential(&[Protocol::objc("O")]);
    let bare_id = ctx.type_layout(bare);
    let layouts = ctx.layouts();
    assert_eq!(layouts.fixed_size(bare_id), Some(8));
    assert!(layouts.is_single_retainable_pointer(bare_id));
    assert!(layouts.can_value_witness_extra_inhabitants_up_to(bare_id, 0));
    assert!(!layouts.can_value_witness_extra_inhabitants_up_to(bare_id, 1));
}

// -- Executed helpers --

const LAYOUT: OpaqueExistentialLayout = OpaqueExistentialLayout { num_tables: 1 };

/// Define `name(a: ptr, b: ptr) -> word` returning what `emit` returns, or
/// zero.
fn define(
    ctx: &mut LayoutContext,
    name: &str,
    emit: impl FnOnce(&mut IrGenFunction<'_>, Address, Address) -> Option<ValueId>,
) -> FunctionId {
    let ptr = ctx.module_mut().types_mut().ptr();
    let word = ctx.module_mut().types_mut().size_int();
    let f = ctx.define_function(name, &[ptr, ptr], word);
    let mut igf = ctx.function(f);
    let a = Address::new(igf.builder.module().param(f, 0), 8);
    let b = Address::new(igf.builder.module().param(f, 1), 8);
    let result = match emit(&mut igf, a, b) {
        Some(ptr) => igf.builder.ptr_to_int(ptr, word),
        None => igf.builder.const_size(0),
    };
    igf.builder.ret(result);
    f
}

/// Two containers holding metadata of `ty`, ready for the interpreter.
struct Containers<'m> {
    interp: Interpreter<'m, TestRuntime>,
    first: u64,
    second: u64,
}

impl<'m> Containers<'m> {
    fn new(ctx: &'m LayoutContext, ty: TypeRef, behavior: TestType) -> Self {
        let module = ctx.module();
        let target = ctx.target();
        let mut memory = Memory::new(module.layout());
        let mut runtime = TestRuntime::new(target);
        runtime.register(ty, behavior);
        let metadata = runtime.metadata(&mut memory, ty).unwrap_or_else(|e| panic!("{e}"));
        let size = LAYOUT.size(target);
        let first = memory.alloc(size, 8);
        let second = memory.alloc(size, 8);
        for container in [first, second] {
            memory
                .store_word(container + LAYOUT.metadata_ref_offset(target), metadata)
                .unwrap_or_else(|e| panic!("{e}"));
        }
        let interp = Interpreter::new(module, memory, runtime).unwrap_or_else(|e| panic!("{e}"));
        Self { interp, first, second }
    }

    fn call(&mut self, f: FunctionId) -> u64 {
        let args = [ApInt::new(64, self.first), ApInt::new(64, self.second)];
        self.interp
            .run(f, &args)
            .unwrap_or_else(|e| panic!("{e}"))
            .map_or(0, |v| v.low_u64())
    }

    fn box_of(&self, container: u64) -> u64 {
        self.interp
            .memory()
            .load_word(container)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn runtime(&self) -> &TestRuntime {
        self.interp.host()
    }
}

#[test]
fn large_values_are_boxed_after_the_heap_header() {
    let mut ctx = context(Endianness::Little);
    let big = ctx.types_mut().foreign("Big", 32, 8, true);
    let allocate = define(&mut ctx, "allocate", |igf, c, _| Some(LAYOUT.allocate_boxed(igf, c).ptr));
    let project = define(&mut ctx, "project", |igf, c, _| Some(LAYOUT.project_boxed(igf, c).ptr));
    let deallocate = define(&mut ctx, "deallocate", |igf, c, _| {
        LAYOUT.deallocate_boxed(igf, c);
        None
    });

    let mut run = Containers::new(&ctx, big, TestType::pod(32, 8));
    let value = run.call(allocate);
    let object = run.box_of(run.first);
    assert_eq!(value, object + 16);
    assert_eq!(run.runtime().box_refcount(object), Some(1));
    assert_eq!(run.call(project), value);

    run.call(deallocate);
    assert_eq!(run.runtime().calls_to("keel_deallocBox"), vec![&[object, 48, 7][..]]);
    assert_eq!(run.runtime().box_refcount(object), None);
}

#[test]
fn small_values_stay_in_the_buffer() {
    let mut ctx = context(Endianness::Little);
    let small = ctx.types_mut().foreign("Small", 8, 8, true);
    let allocate = define(&mut ctx, "allocate", |igf, c, _| Some(LAYOUT.allocate_boxed(igf, c).ptr));
    let project = define(&mut ctx, "project", |igf, c, _| Some(LAYOUT.mutable_project_boxed(igf, c).ptr));

    let mut run = Containers::new(&ctx, small, TestType::pod(8, 8));
    assert_eq!(run.call(allocate), run.first);
    assert_eq!(run.call(project), run.first);
    assert!(run.runtime().calls_to("keel_allocBox").is_empty());
    assert!(run.runtime().calls_to("keel_makeBoxUnique").is_empty());
}

#[test]
fn copies_share_the_box_until_mutated() {
    let mut ctx = context(Endianness::Little);
    let big = ctx.types_mut().foreign("Big", 32, 8, true);
    let allocate = define(&mut ctx, "allocate", |igf, c, _| Some(LAYOUT.allocate_boxed(igf, c).ptr));
    let copy = define(&mut ctx, "copy", |igf, first, second| {
        LAYOUT.init_with_copy(igf, second, first);
        None
    });
    let mutate = define(&mut ctx, "mutate", |igf, _, second| {
        Some(LAYOUT.mutable_project_boxed(igf, second).ptr)
    });
    let destroy = define(&mut ctx, "destroy", |igf, first, _| {
        LAYOUT.destroy(igf, first);
        None
    });

    let mut run = Containers::new(&ctx, big, TestType::pod(32, 8));
    run.call(allocate);
    let shared = run.box_of(run.first);
    run.call(copy);
    assert_eq!(run.box_of(run.second), shared);
    assert_eq!(run.runtime().box_refcount(shared), Some(2));

    let value = run.call(mutate);
    let unique = run.box_of(run.second);
    assert_ne!(unique, shared);
    assert_eq!(value, unique + 16);
    assert_eq!(run.runtime().box_refcount(unique), Some(1));
    assert_eq!(run.runtime().box_refcount(shared), Some(1));

    run.call(destroy);
    assert_eq!(run.runtime().box_refcount(shared), Some(0));
    assert_eq!(run.runtime().calls_to("keel_release"), vec![&[shared][..]]);
}

#[test]
fn assigning_shares_the_source_box() {
    let mut ctx = context(Endianness::Little);
    let big = ctx.types_mut().foreign("Big", 32, 8, true);
    let allocate = define(&mut ctx, "allocate", |igf, first, second| {
        LAYOUT.allocate_boxed(igf, first);
        LAYOUT.allocate_boxed(igf, second);
        None
    });
    let assign = define(&mut ctx, "assign", |igf, first, second| {
        LAYOUT.assign_with_copy(igf, second, first);
        LAYOUT.assign_with_copy(igf, second, second);
        None
    });

    let mut run = Containers::new(&ctx, big, TestType::pod(32, 8));
    run.call(allocate);
    let (kept, replaced) = (run.box_of(run.first), run.box_of(run.second));
    run.call(assign);
    assert_eq!(run.box_of(run.second), kept);
    assert_eq!(run.runtime().box_refcount(kept), Some(2));
    assert_eq!(run.runtime().box_refcount(replaced), Some(0));
}

#[test]
fn helpers_are_emitted_once_per_table_count() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "destroy_twice", |igf, first, second| {
        LAYOUT.destroy(igf, first);
        LAYOUT.destroy(igf, second);
        OpaqueExistentialLayout::new(2).destroy(igf, first);
        assert_eq!(igf.helper_count(), 2);
        None
    });
    let module = ctx.module();
    for name in [
        "__keel_destroy_boxed_opaque_existential_1",
        "__keel_destroy_boxed_opaque_existential_2",
    ] {
        let helper = module
            .lookup_function(name)
            .unwrap_or_else(|| panic!("{name} was not emitted"));
        assert!(!module.function(helper).is_declaration());
    }
}
