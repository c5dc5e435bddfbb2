//! Cross-checks statically computed layouts against the runtime's.
//!
//! [`emit_type_verifier`] emits one function that, for every type named in
//! [`IrGenOptions::verify_type_layouts`](crate::IrGenOptions), reads the
//! runtime's value witness table and hands each attribute together with the
//! compiler's answer to `keel_verifyTypeLayoutAttribute`. The runtime reports
//! any disagreement. Extra inhabitants are checked by asking the runtime to
//! store each one into a scratch buffer and comparing the significant bits,
//! then asking it to read the static pattern back.

use std::fmt;

use keel_bits::ApInt;
use keel_ir::{FunctionId, TypeId, ValueId};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::context::{Address, IrGenFunction, LayoutContext};
use crate::enum_payload::{EnumPayload, EnumPayloadSchema};
use crate::runtime::{RuntimeFn, ValueWitness};
use crate::type_info::fits_inline;
use crate::type_layout::{FixedLayout, LayoutId};
use crate::types::TypeRef;

/// Name of the emitted verification function.
pub const VERIFIER_FUNCTION: &str = "__keel_verify_type_layouts";

/// A type named for verification that could not be checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// No non-generic nominal type has this name.
    NotFound { name: String },
    /// The type mentions a generic parameter.
    Dependent { name: String },
    /// The layout depends on the runtime, so there is nothing to compare.
    NotFixed { name: String },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "type to verify `{name}` not found"),
            Self::Dependent { name } => {
                write!(f, "type to verify `{name}` depends on a generic parameter")
            }
            Self::NotFixed { name } => write!(f, "type to verify `{name}` has no fixed layout"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// The verification function and the names that were skipped.
#[derive(Debug)]
pub struct TypeVerifier {
    pub function: FunctionId,
    pub errors: Vec<VerifyError>,
    /// Types for which checks were emitted.
    pub verified: Vec<TypeRef>,
}

/// An attribute whose runtime and static bytes differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutMismatch {
    pub description: String,
    pub runtime: Vec<u8>,
    pub expected: Vec<u8>,
}

impl LayoutMismatch {
    /// Compare the two renditions of an attribute, logging a mismatch.
    pub fn check(description: &str, runtime: Vec<u8>, expected: Vec<u8>) -> Option<Self> {
        if runtime == expected {
            trace!(description, "layout attribute verified");
            return None;
        }
        let mismatch = Self {
            description: description.to_owned(),
            runtime,
            expected,
        };
        warn!(%mismatch, "layout attribute mismatch");
        Some(mismatch)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for LayoutMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: runtime 0x{}, static 0x{}",
            self.description,
            hex(&self.runtime),
            hex(&self.expected)
        )
    }
}

impl std::error::Error for LayoutMismatch {}

/// Emit `__keel_verify_type_layouts`, checking every type the context's
/// options name.
pub fn emit_type_verifier(ctx: &mut LayoutContext) -> TypeVerifier {
    let names = ctx.options().verify_type_layouts.clone();
    let mut errors = Vec::new();
    let mut targets = Vec::new();
    for name in names {
        let Some(ty) = ctx.types().lookup(&name) else {
            errors.push(VerifyError::NotFound { name });
            continue;
        };
        if ctx.types().has_archetype(ty) {
            errors.push(VerifyError::Dependent { name });
            continue;
        }
        let id = ctx.type_layout(ty);
        let Some(layout) = ctx.layouts().fixed_layout(id) else {
            errors.push(VerifyError::NotFixed { name });
            continue;
        };
        targets.push((name, ty, id, layout));
    }

    let void = ctx.module_mut().types_mut().void();
    let function = ctx.define_function(VERIFIER_FUNCTION, &[], void);
    let mut igf = ctx.function(function);
    let mut verifier = Verifier::default();
    let mut verified = Vec::with_capacity(targets.len());
    for (name, ty, id, layout) in targets {
        debug!(name, %id, size = layout.size, "verifying type layout");
        verifier.verify_type(&mut igf, &name, ty, id, layout);
        verified.push(ty);
    }
    igf.builder.ret_void();

    TypeVerifier {
        function,
        errors,
        verified,
    }
}

/// Scratch slots reused across checks of the same IR type.
#[derive(Default)]
struct Verifier {
    slots: FxHashMap<TypeId, (ValueId, ValueId)>,
}

impl Verifier {
    fn verify_type(
        &mut self,
        igf: &mut IrGenFunction<'_>,
        name: &str,
        ty: TypeRef,
        id: LayoutId,
        layout: FixedLayout,
    ) {
        let metadata = igf.emit_type_metadata(ty);
        let layouts = igf.layouts();
        let trivially_destroyable = layouts.is_trivially_destroyable(id);
        let bitwise_takable = layouts.is_statically_bitwise_takable(id);
        let inline = fits_inline(layout.size, layout.align, bitwise_takable, igf.target());

        let runtime = igf.emit_load_size(metadata);
        let expected = igf.builder.const_size(layout.size);
        self.verify_values(igf, metadata, runtime, expected, &format!("{name} size"));

        let runtime = igf.emit_load_alignment_mask(metadata);
        let expected = igf.builder.const_size(layout.align - 1);
        self.verify_values(igf, metadata, runtime, expected, &format!("{name} alignment mask"));

        let runtime = igf.emit_load_stride(metadata);
        let expected = igf.builder.const_size(layout.stride());
        self.verify_values(igf, metadata, runtime, expected, &format!("{name} stride"));

        let runtime = igf.emit_load_is_inline(metadata);
        self.verify_flag(igf, metadata, runtime, inline, &format!("{name} is-inline bit"));

        let runtime = igf.emit_load_is_pod(metadata);
        let description = format!("{name} is-trivially-destroyable bit");
        self.verify_flag(igf, metadata, runtime, trivially_destroyable, &description);

        let runtime = igf.emit_load_is_bitwise_takable(metadata);
        let description = format!("{name} is-bitwise-takable bit");
        self.verify_flag(igf, metadata, runtime, bitwise_takable, &description);

        let runtime = igf.emit_load_extra_inhabitant_count(metadata);
        let expected = igf.builder.const_i32(layout.extra_inhabitants);
        let description = format!("{name} extra inhabitant count");
        self.verify_values(igf, metadata, runtime, expected, &description);

        self.verify_extra_inhabitants(igf, name, id, layout, metadata);
    }

    /// Store each extra inhabitant through the runtime and compare it with
    /// the static pattern, then read the static pattern's tag back.
    fn verify_extra_inhabitants(
        &mut self,
        igf: &mut IrGenFunction<'_>,
        name: &str,
        id: LayoutId,
        layout: FixedLayout,
        metadata: ValueId,
    ) {
        let limit = igf.options().verifier_extra_inhabitant_limit;
        let count = layout.extra_inhabitants.min(limit);
        if count == 0 || layout.size == 0 {
            return;
        }
        let Some(mask) = igf.layouts().fixed_extra_inhabitant_mask(id, igf.target()) else {
            return;
        };
        let filler = igf.options().verifier_filler_byte;
        let schema = EnumPayloadSchema::fixed(layout.size * 8);

        let i8_ty = igf.builder.i8_type();
        let bytes_ty = igf.builder.module_mut().types_mut().array(i8_ty, layout.size);
        let runtime_buf = igf.builder.alloca(bytes_ty, layout.align, "xi.runtime");
        let static_buf = igf.builder.alloca(bytes_ty, layout.align, "xi.static");
        let runtime_addr = Address::new(runtime_buf, layout.align);
        let static_addr = Address::new(static_buf, layout.align);
        let size = igf.builder.const_size(layout.size);
        let num_cases = igf.builder.const_i32(count);
        let not_mask = !&mask;

        for index in 0..count {
            let Some(value) = igf
                .layouts()
                .fixed_extra_inhabitant_value(id, igf.target(), index)
            else {
                return;
            };
            let tag = igf.builder.const_i32(index + 1);

            // Fill, let the runtime store the inhabitant, and keep only the
            // bits that identify it.
            igf.builder.memset(runtime_buf, filler, size);
            igf.emit_call_value_witness(
                metadata,
                ValueWitness::StoreEnumTagSinglePayload,
                &[runtime_buf, tag, num_cases],
            );
            let mut stored = EnumPayload::load(igf, runtime_addr, schema);
            stored.emit_apply_and_mask(igf, &mask);
            stored.store(igf, runtime_addr);
            store_pattern(igf, &value, schema, static_addr);
            let description = format!("{name} stored extra inhabitant {index}");
            verify_buffers(igf, metadata, runtime_buf, static_buf, size, &description);

            // The runtime must ignore the bits outside the mask.
            let noisy = &value | &not_mask;
            store_pattern(igf, &noisy, schema, static_addr);
            let runtime_tag = igf.emit_call_value_witness(
                metadata,
                ValueWitness::GetEnumTagSinglePayload,
                &[static_buf, num_cases],
            );
            let description = format!("{name} extra inhabitant tag calculation {index}");
            self.verify_values(igf, metadata, runtime_tag, tag, &description);
        }
    }

    /// Hand an `i1` runtime flag and its static value to the runtime as bytes.
    fn verify_flag(
        &mut self,
        igf: &mut IrGenFunction<'_>,
        metadata: ValueId,
        runtime: ValueId,
        expected: bool,
        description: &str,
    ) {
        let i8_ty = igf.builder.i8_type();
        let runtime = igf.builder.zext(runtime, i8_ty);
        let expected = igf.builder.const_i8(u8::from(expected));
        self.verify_values(igf, metadata, runtime, expected, description);
    }

    fn verify_values(
        &mut self,
        igf: &mut IrGenFunction<'_>,
        metadata: ValueId,
        runtime: ValueId,
        expected: ValueId,
        description: &str,
    ) {
        let ty = igf.builder.type_of(runtime);
        let size = igf.builder.module().types().store_size(ty);
        let (runtime_slot, static_slot) = *self.slots.entry(ty).or_insert_with(|| {
            let runtime_slot = igf.builder.alloca(ty, size, "verify.runtime");
            let static_slot = igf.builder.alloca(ty, size, "verify.static");
            (runtime_slot, static_slot)
        });
        igf.builder.store(runtime, runtime_slot, size);
        igf.builder.store(expected, static_slot, size);
        let size = igf.builder.const_size(size);
        verify_buffers(igf, metadata, runtime_slot, static_slot, size, description);
    }
}

fn store_pattern(igf: &mut IrGenFunction<'_>, pattern: &ApInt, schema: EnumPayloadSchema, addr: Address) {
    let payload = EnumPayload::from_bit_pattern(igf, pattern, schema);
    payload.store(igf, addr);
}

fn verify_buffers(
    igf: &mut IrGenFunction<'_>,
    metadata: ValueId,
    runtime: ValueId,
    expected: ValueId,
    size: ValueId,
    description: &str,
) {
    let message = igf
        .builder
        .module_mut()
        .add_global_string("__keel_verify_message", description);
    let message = igf.builder.global_addr(message);
    igf.call_runtime(
        RuntimeFn::VerifyTypeLayoutAttribute,
        &[metadata, runtime, expected, size, message],
    );
}

#[cfg(test)]
mod tests {
    use keel_bits::Endianness;
    use keel_ir::{Interpreter, Memory};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::options::IrGenOptions;
    use crate::test_runtime::{target, TestRuntime, TestType};

    fn context(names: &[&str]) -> LayoutContext {
        let options = IrGenOptions::verifying(names.iter().copied()).with_extra_inhabitant_limit(3);
        LayoutContext::with_options("verify", target(Endianness::Little), options)
    }

    /// A struct `Pair { next: native ref, count: i64 }`.
    fn pair(ctx: &mut LayoutContext) -> TypeRef {
        let types = ctx.types_mut();
        let (native, word) = (types.native_ref(), types.int(64));
        types.struct_type("Pair", &[native, word])
    }

    fn pair_behavior() -> TestType {
        TestType {
            size: 16,
            refs: vec![0],
            heap_pointer: true,
            ..TestType::native_ref()
        }
    }

    fn run(ctx: &LayoutContext, function: FunctionId, runtime: TestRuntime) -> TestRuntime {
        let memory = Memory::new(ctx.module().layout());
        let mut interp = Interpreter::new(ctx.module(), memory, runtime).unwrap_or_else(|e| panic!("{e}"));
        interp.run(function, &[]).unwrap_or_else(|e| panic!("{e}"));
        let (runtime, _) = interp.host_and_memory();
        std::mem::take(runtime)
    }

    #[test]
    fn matching_layouts_verify_cleanly() {
        let mut ctx = context(&["Pair"]);
        let ty = pair(&mut ctx);
        let verifier = emit_type_verifier(&mut ctx);
        assert!(verifier.errors.is_empty());
        assert_eq!(verifier.verified, vec![ty]);
        assert_eq!(ctx.module().lookup_function(VERIFIER_FUNCTION), Some(verifier.function));

        let mut runtime = TestRuntime::new(ctx.target());
        runtime.register(ty, pair_behavior());
        let runtime = run(&ctx, verifier.function, runtime);
        assert_eq!(runtime.mismatches, Vec::new());
        // Seven attributes, then a store and a tag check per inhabitant.
        assert_eq!(runtime.calls_to("keel_verifyTypeLayoutAttribute").len(), 7 + 3 * 2);
        assert_eq!(runtime.calls_to("keel_vw_storeEnumTagSinglePayload").len(), 3);
    }

    #[test]
    fn disagreeing_runtime_layouts_are_reported() {
        let mut ctx = context(&["Pair"]);
        let ty = pair(&mut ctx);
        let verifier = emit_type_verifier(&mut ctx);

        let mut runtime = TestRuntime::new(ctx.target());
        runtime.register(
            ty,
            TestType {
                size: 24,
                ..pair_behavior()
            },
        );
        let runtime = run(&ctx, verifier.function, runtime);
        let descriptions: Vec<&str> = runtime.mismatches.iter().map(|m| m.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Pair size", "Pair stride"]);
        assert_eq!(runtime.mismatches[0].runtime[0], 24);
        assert_eq!(runtime.mismatches[0].expected[0], 16);
    }

    #[test]
    fn types_without_inhabitants_skip_the_buffer_checks() {
        let mut ctx = context(&["Plain"]);
        let word = ctx.types_mut().int(64);
        let ty = ctx.types_mut().struct_type("Plain", &[word]);
        let verifier = emit_type_verifier(&mut ctx);

        let mut runtime = TestRuntime::new(ctx.target());
        runtime.register(ty, TestType::pod(8, 8));
        let runtime = run(&ctx, verifier.function, runtime);
        assert!(runtime.mismatches.is_empty());
        assert_eq!(runtime.calls_to("keel_verifyTypeLayoutAttribute").len(), 7);
    }

    #[test]
    fn unverifiable_names_are_collected() {
        let mut ctx = context(&["Missing", "Holder", "Remote"]);
        let types = ctx.types_mut();
        let t = types.archetype("T");
        types.struct_type("Holder", &[t]);
        types.resilient_struct("Remote", &[]);
        let verifier = emit_type_verifier(&mut ctx);

        assert!(verifier.verified.is_empty());
        assert_eq!(
            verifier.errors,
            vec![
                VerifyError::NotFound {
                    name: "Missing".to_string()
                },
                VerifyError::Dependent {
                    name: "Holder".to_string()
                },
                VerifyError::NotFixed {
                    name: "Remote".to_string()
                },
            ]
        );
        assert_eq!(
            verifier.errors[1].to_string(),
            "type to verify `Holder` depends on a generic parameter"
        );
        let runtime = run(&ctx, verifier.function, TestRuntime::new(ctx.target()));
        assert!(runtime.calls.is_empty());
    }

    #[test]
    fn mismatches_print_both_renditions() {
        assert_eq!(LayoutMismatch::check("Pair size", vec![16, 0], vec![16, 0]), None);
        let mismatch = LayoutMismatch::check("Pair size", vec![0x18, 0], vec![0x10, 0])
            .unwrap_or_else(|| panic!("mismatch not reported"));
        assert_eq!(mismatch.to_string(), "Pair size: runtime 0x1800, static 0x1000");
    }
}
