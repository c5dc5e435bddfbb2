//! Layout engine for Keel code generation.
//!
//! Computes the bit-level layout of enums and existential containers and
//! emits [`keel_ir`] code that manipulates them: packing tags into spare bits
//! and extra inhabitants, copying, moving and destroying values, projecting
//! existential buffers.
//!
//! - [`enum_payload`]: enum payloads as word sequences ([`EnumPayload`]).
//! - [`type_info`]: fixed layouts of leaf types and their extra inhabitants.
//! - [`type_layout`]: the [`TypeLayoutEntry`] tree, uniqued in a
//!   [`TypeLayoutCache`], with value operations and the enum tag protocols.
//! - [`existential`]: opaque, class and error existential containers.
//! - [`runtime`]: runtime entry points and value witness access.
//! - [`verifier`]: cross-checks static layouts against the runtime's.
//!
//! All state for one compilation unit lives in a [`LayoutContext`]; code is
//! emitted through an [`IrGenFunction`].

mod context;
pub mod enum_payload;
pub mod existential;
mod options;
pub mod runtime;
pub mod type_info;
pub mod type_layout;
pub mod types;
pub mod verifier;

#[cfg(test)]
mod test_runtime;

use std::sync::Once;

pub use context::{Address, IrGenFunction, LayoutContext, LayoutState};
pub use enum_payload::{EnumPayload, EnumPayloadSchema, LazyValue};
pub use existential::{ExistentialLayout, ExistentialRepresentation, OpaqueExistentialLayout};
pub use options::IrGenOptions;
pub use type_info::{ExtraInhabitants, FixedTypeInfo};
pub use type_layout::{LayoutId, ScalarKind, TypeLayoutCache, TypeLayoutEntry};
pub use types::{TypeDesc, TypePool, TypeRef};
pub use verifier::{emit_type_verifier, LayoutMismatch};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Does nothing unless `RUST_LOG` is set. Safe to call more than once.
/// Enable with `RUST_LOG=keel_irgen=debug` or `RUST_LOG=keel_irgen=trace`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(EnvFilter::from_default_env())
                .init();
        }
    });
}
