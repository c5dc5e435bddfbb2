//! Word chunking of enum payloads.

use keel_ir::{TypeId, TypeTable};
use smallvec::SmallVec;

/// How a payload of a given bit size splits into IR values: pointer-width
/// integers while at least a word of bits remains, then one integer holding
/// the remainder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnumPayloadSchema {
    bit_size: Option<u64>,
}

impl EnumPayloadSchema {
    pub fn fixed(bit_size: u64) -> Self {
        Self {
            bit_size: Some(bit_size),
        }
    }

    /// A payload whose size is only known at run time.
    pub fn dynamic() -> Self {
        Self { bit_size: None }
    }

    #[inline]
    pub fn bit_size(self) -> Option<u64> {
        self.bit_size
    }

    #[inline]
    pub fn is_fixed(self) -> bool {
        self.bit_size.is_some()
    }

    /// Widths of the element integers for a target with `pointer_width`-bit
    /// words.
    pub fn element_widths(self, pointer_width: u32) -> SmallVec<[u32; 4]> {
        let Some(mut remaining) = self.bit_size else {
            panic!("element widths of a dynamic payload schema");
        };
        let word = u64::from(pointer_width);
        let mut widths = SmallVec::new();
        while remaining >= word {
            widths.push(pointer_width);
            remaining -= word;
        }
        if remaining > 0 {
            widths.push(remaining as u32);
        }
        widths
    }

    /// Call `f` with the IR type of each element, in order.
    pub fn for_each_type(self, types: &mut TypeTable, mut f: impl FnMut(TypeId)) {
        let pointer_width = types.layout().pointer_width;
        for width in self.element_widths(pointer_width) {
            let ty = if width == pointer_width {
                types.size_int()
            } else {
                types.int(width)
            };
            f(ty);
        }
    }
}
