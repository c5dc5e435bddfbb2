//! Target configuration.
//!
//! Provides target triple parsing and the handful of target facts layout
//! code depends on: pointer width, byte order, the lowest address a valid
//! heap object can live at, and the runtime's heap-object header size.
//!
//! # Usage
//!
//! ```
//! use keel_ir::TargetConfig;
//!
//! let config = TargetConfig::from_triple("x86_64-unknown-linux-gnu")
//!     .unwrap()
//!     .with_least_valid_pointer(0x1000);
//! assert_eq!(config.pointer_width(), 64);
//! ```

use std::fmt;

use keel_bits::Endianness;

use crate::types::DataLayout;

/// Error type for target configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// Target triple is not in the supported list.
    UnsupportedTarget {
        triple: String,
        supported: Vec<&'static str>,
    },
    /// Invalid target triple format.
    InvalidTripleFormat { triple: String, reason: String },
    /// Least valid pointer must be a power of two.
    InvalidLeastValidPointer(u64),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedTarget { triple, supported } => {
                write!(
                    f,
                    "unsupported target '{triple}'. Supported targets: {}",
                    supported.join(", ")
                )
            }
            Self::InvalidTripleFormat { triple, reason } => {
                write!(f, "invalid target triple '{triple}': {reason}")
            }
            Self::InvalidLeastValidPointer(value) => {
                write!(f, "least valid pointer {value:#x} is not a power of two")
            }
        }
    }
}

impl std::error::Error for TargetError {}

/// Supported target triples.
pub const SUPPORTED_TARGETS: &[&str] = &[
    "x86_64-unknown-linux-gnu",
    "aarch64-unknown-linux-gnu",
    "aarch64-apple-darwin",
    // big-endian
    "powerpc64-unknown-linux-gnu",
    "s390x-unknown-linux-gnu",
    // 32-bit
    "i686-unknown-linux-gnu",
];

/// Parsed components of a target triple.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetTripleComponents {
    /// CPU architecture (e.g., `x86_64`, `aarch64`, `s390x`)
    pub arch: String,
    /// Hardware vendor (e.g., `unknown`, `apple`, `pc`)
    pub vendor: String,
    /// Operating system (e.g., `linux`, `darwin`, `windows`)
    pub os: String,
    /// Environment/ABI (e.g., `gnu`, `msvc`) - optional
    pub env: Option<String>,
}

impl TargetTripleComponents {
    /// Parse a target triple string into components.
    ///
    /// Format: `<arch>-<vendor>-<os>[-<env>]`
    pub fn parse(triple: &str) -> Result<Self, TargetError> {
        let parts: Vec<&str> = triple.split('-').collect();

        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(TargetError::InvalidTripleFormat {
                triple: triple.to_string(),
                reason: "expected at least 3 components: <arch>-<vendor>-<os>".to_string(),
            });
        }

        Ok(Self {
            arch: parts[0].to_string(),
            vendor: parts[1].to_string(),
            os: parts[2].to_string(),
            env: parts.get(3).map(|s| (*s).to_string()),
        })
    }

    /// Pointer width in bits implied by the architecture.
    pub fn pointer_width(&self) -> u32 {
        match self.arch.as_str() {
            "i686" => 32,
            _ => 64,
        }
    }

    /// True for big-endian architectures.
    pub fn is_big_endian(&self) -> bool {
        matches!(self.arch.as_str(), "powerpc64" | "s390x")
    }

    /// Apple platforms reserve no low pointer bits but use a larger
    /// zero page on 64-bit targets.
    pub fn is_darwin(&self) -> bool {
        self.os == "darwin"
    }
}

impl fmt::Display for TargetTripleComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.vendor, self.os)?;
        if let Some(env) = &self.env {
            write!(f, "-{env}")?;
        }
        Ok(())
    }
}

/// Target configuration for code generation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetConfig {
    /// The target triple string (e.g., "x86_64-unknown-linux-gnu").
    triple: String,
    /// Parsed triple components.
    components: TargetTripleComponents,
    /// Pointer width in bits.
    pointer_width: u32,
    /// Byte order.
    big_endian: bool,
    /// Addresses below this are never valid heap objects; they are free to
    /// serve as extra inhabitants of pointer types.
    least_valid_pointer: u64,
    /// Low pointer bits the platform reserves (tagged pointers).
    reserved_low_bits: u32,
    /// Size of the runtime's heap-object header, in pointer-sized words.
    heap_header_words: u32,
    /// Size of the inline buffer of an opaque existential, in words.
    fixed_buffer_words: u32,
    /// Largest alignment given to integer types, in bytes.
    max_int_alignment: u64,
}

impl TargetConfig {
    /// Configuration for the host, derived from the compiler's own target.
    pub fn native() -> Self {
        let arch = if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else if cfg!(target_pointer_width = "32") {
            "i686"
        } else {
            "x86_64"
        };
        let (vendor, os) = if cfg!(target_os = "macos") {
            ("apple", "darwin")
        } else {
            ("unknown", "linux")
        };
        let components = TargetTripleComponents {
            arch: arch.to_string(),
            vendor: vendor.to_string(),
            os: os.to_string(),
            env: None,
        };
        let mut config = Self::from_components(components);
        config.big_endian = cfg!(target_endian = "big");
        config
    }

    /// Create a target configuration from a target triple string.
    pub fn from_triple(triple: &str) -> Result<Self, TargetError> {
        if !SUPPORTED_TARGETS.contains(&triple) {
            return Err(TargetError::UnsupportedTarget {
                triple: triple.to_string(),
                supported: SUPPORTED_TARGETS.to_vec(),
            });
        }

        let components = TargetTripleComponents::parse(triple)?;
        Ok(Self::from_components(components))
    }

    fn from_components(components: TargetTripleComponents) -> Self {
        let pointer_width = components.pointer_width();
        let least_valid_pointer = if components.is_darwin() && pointer_width == 64 {
            0x1_0000_0000
        } else {
            0x1000
        };
        let max_int_alignment = if components.arch == "i686" { 4 } else { 8 };
        Self {
            triple: components.to_string(),
            big_endian: components.is_big_endian(),
            components,
            pointer_width,
            least_valid_pointer,
            reserved_low_bits: 0,
            heap_header_words: 2,
            fixed_buffer_words: 3,
            max_int_alignment,
        }
    }

    /// Override the least valid pointer (builder pattern).
    #[must_use]
    pub fn with_least_valid_pointer(mut self, value: u64) -> Self {
        self.least_valid_pointer = value;
        self
    }

    /// Override the reserved low pointer bits (builder pattern).
    #[must_use]
    pub fn with_reserved_low_bits(mut self, bits: u32) -> Self {
        self.reserved_low_bits = bits;
        self
    }

    /// Override the byte order (builder pattern).
    #[must_use]
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.big_endian = endianness == Endianness::Big;
        self
    }

    /// Check invariants that builder overrides could break.
    pub fn validate(&self) -> Result<(), TargetError> {
        if !self.least_valid_pointer.is_power_of_two() {
            return Err(TargetError::InvalidLeastValidPointer(self.least_valid_pointer));
        }
        Ok(())
    }

    // -- Accessors --

    pub fn triple(&self) -> &str {
        &self.triple
    }

    pub fn components(&self) -> &TargetTripleComponents {
        &self.components
    }

    #[inline]
    pub fn pointer_width(&self) -> u32 {
        self.pointer_width
    }

    /// Pointer size in bytes.
    #[inline]
    pub fn pointer_size(&self) -> u64 {
        u64::from(self.pointer_width / 8)
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        if self.big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn least_valid_pointer(&self) -> u64 {
        self.least_valid_pointer
    }

    pub fn reserved_low_bits(&self) -> u32 {
        self.reserved_low_bits
    }

    /// Heap-object header size in bytes.
    pub fn heap_header_size(&self) -> u64 {
        u64::from(self.heap_header_words) * self.pointer_size()
    }

    /// Opaque existential inline buffer size in bytes.
    pub fn fixed_buffer_size(&self) -> u64 {
        u64::from(self.fixed_buffer_words) * self.pointer_size()
    }

    pub fn fixed_buffer_words(&self) -> u32 {
        self.fixed_buffer_words
    }

    /// The data layout the IR type table uses for this target.
    pub fn data_layout(&self) -> DataLayout {
        DataLayout {
            pointer_width: self.pointer_width,
            endianness: self.endianness(),
            max_int_alignment: self.max_int_alignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_triple_components() {
        let c = TargetTripleComponents::parse("aarch64-apple-darwin").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(c.arch, "aarch64");
        assert_eq!(c.os, "darwin");
        assert_eq!(c.env, None);
        assert_eq!(c.to_string(), "aarch64-apple-darwin");
    }

    #[test]
    fn reject_short_triple() {
        let err = TargetTripleComponents::parse("x86_64-linux");
        assert!(matches!(err, Err(TargetError::InvalidTripleFormat { .. })));
    }

    #[test]
    fn every_supported_triple_parses() {
        for triple in SUPPORTED_TARGETS {
            let config = TargetConfig::from_triple(triple).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(config.triple(), *triple);
        }
        assert!(TargetConfig::from_triple("wasm32-unknown-unknown").is_err());
    }

    #[test]
    fn reject_unsupported_triple() {
        let err = TargetConfig::from_triple("riscv64gc-unknown-linux-gnu");
        assert!(matches!(err, Err(TargetError::UnsupportedTarget { .. })));
    }

    #[test]
    fn big_endian_64_bit() {
        let config =
            TargetConfig::from_triple("s390x-unknown-linux-gnu").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.pointer_width(), 64);
        assert_eq!(config.endianness(), Endianness::Big);
        assert_eq!(config.heap_header_size(), 16);
        assert_eq!(config.fixed_buffer_size(), 24);
    }

    #[test]
    fn thirty_two_bit() {
        let config =
            TargetConfig::from_triple("i686-unknown-linux-gnu").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.pointer_size(), 4);
        assert_eq!(config.fixed_buffer_size(), 12);
        assert_eq!(config.data_layout().max_int_alignment, 4);
    }

    #[test]
    fn darwin_has_large_zero_page() {
        let config =
            TargetConfig::from_triple("aarch64-apple-darwin").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.least_valid_pointer(), 0x1_0000_0000);
    }

    #[test]
    fn validate_rejects_odd_least_valid_pointer() {
        let config = TargetConfig::native().with_least_valid_pointer(0x1001);
        assert_eq!(config.validate(), Err(TargetError::InvalidLeastValidPointer(0x1001)));
    }
}
