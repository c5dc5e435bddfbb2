//! Bit-level building blocks for the Keel layout engine.
//!
//! This crate provides:
//!
//! - **Fixed-width integers** ([`ApInt`]) - arbitrary bit widths backed by
//!   64-bit words. Enum payloads, spare-bit masks and extra-inhabitant
//!   patterns are all `ApInt`s whose width is the size of the storage they
//!   describe.
//!
//! - **Bit patterns** ([`BitPatternReader`], [`BitPatternBuilder`]) - chunk a
//!   pattern into consecutive pieces (or assemble one from pieces) in the
//!   target's byte order. This is the only place that knows how a "first"
//!   chunk maps onto bit positions on a big-endian target; everything above
//!   it talks in logical order.
//!
//! - **Sparse masks** ([`get_lowest_n_set_bits`]) - trimming a spare-bit mask
//!   down to the bits a tag actually needs.
//!
//! # Crate Dependencies
//!
//! None on other `keel_*` crates. Both the IR (`keel_ir`) and the layout
//! engine (`keel_irgen`) depend on this crate.

mod apint;
mod mask;
mod pattern;

pub use apint::ApInt;
pub use mask::get_lowest_n_set_bits;
pub use pattern::{BitPatternBuilder, BitPatternReader};

/// Byte order of a target.
///
/// Bit-region operations are endianness-relative: "the next N bits" means
/// the next N bits in the target's scan direction, not the next N bits from
/// bit 0 of the integer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    #[inline]
    pub fn is_little(self) -> bool {
        self == Endianness::Little
    }
}
