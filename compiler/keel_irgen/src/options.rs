//! Per-unit code generation options.

/// Options of one [`LayoutContext`](crate::LayoutContext).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IrGenOptions {
    /// Nominal names of the types the layout verifier checks.
    pub verify_type_layouts: Vec<String>,
    /// Most extra inhabitants the verifier checks per type.
    pub verifier_extra_inhabitant_limit: u32,
    /// Byte the verifier fills scratch buffers with before asking the runtime
    /// to store an extra inhabitant.
    pub verifier_filler_byte: u8,
}

impl Default for IrGenOptions {
    fn default() -> Self {
        Self {
            verify_type_layouts: Vec::new(),
            verifier_extra_inhabitant_limit: 256,
            verifier_filler_byte: 0x5A,
        }
    }
}

impl IrGenOptions {
    /// Options verifying the layouts of `names`.
    #[must_use]
    pub fn verifying<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verify_type_layouts: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_extra_inhabitant_limit(mut self, limit: u32) -> Self {
        self.verifier_extra_inhabitant_limit = limit;
        self
    }
}
