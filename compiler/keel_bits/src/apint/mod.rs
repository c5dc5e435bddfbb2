//! Fixed-width unsigned integers.
//!
//! `ApInt` stores `width` bits in little-endian word order (word 0 holds bits
//! 0..64). Bits above `width` in the last word are always zero; every
//! mutating operation re-establishes that before returning.
//!
//! Widths of zero are allowed and behave as the empty bit string. They show
//! up when a pattern builder is asked to append nothing.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Not};

use smallvec::{smallvec, SmallVec};

const WORD_BITS: u32 = 64;

/// Arbitrary-width unsigned integer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ApInt {
    width: u32,
    words: SmallVec<[u64; 2]>,
}

#[inline]
fn num_words(width: u32) -> usize {
    width.div_ceil(WORD_BITS) as usize
}

impl ApInt {
    // -- Construction --

    /// The all-zero value of the given width.
    pub fn zero(width: u32) -> Self {
        Self {
            width,
            words: smallvec![0; num_words(width)],
        }
    }

    /// A value of `width` bits holding `value`, truncated if it does not fit.
    pub fn new(width: u32, value: u64) -> Self {
        let mut result = Self::zero(width);
        if let Some(first) = result.words.first_mut() {
            *first = value;
        }
        result.clear_unused_bits();
        result
    }

    /// The all-ones value of the given width.
    pub fn all_ones(width: u32) -> Self {
        let mut result = Self {
            width,
            words: smallvec![u64::MAX; num_words(width)],
        };
        result.clear_unused_bits();
        result
    }

    /// A value with bits `0..n` set.
    pub fn low_bits_set(width: u32, n: u32) -> Self {
        assert!(n <= width, "low_bits_set: {n} bits exceed width {width}");
        Self::all_ones(n).zext(width)
    }

    /// Build from little-endian words, truncating to `width`.
    pub fn from_words(width: u32, words: &[u64]) -> Self {
        let mut result = Self::zero(width);
        for (dst, src) in result.words.iter_mut().zip(words) {
            *dst = *src;
        }
        result.clear_unused_bits();
        result
    }

    fn clear_unused_bits(&mut self) {
        let rem = self.width % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    // -- Queries --

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// The backing words, least significant first.
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_all_ones(&self) -> bool {
        *self == Self::all_ones(self.width)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn bit(&self, index: u32) -> bool {
        assert!(index < self.width, "bit {index} out of range for i{}", self.width);
        let word = self.words[(index / WORD_BITS) as usize];
        (word >> (index % WORD_BITS)) & 1 == 1
    }

    pub fn set_bit(&mut self, index: u32) {
        assert!(index < self.width, "bit {index} out of range for i{}", self.width);
        self.words[(index / WORD_BITS) as usize] |= 1u64 << (index % WORD_BITS);
    }

    pub fn clear_bit(&mut self, index: u32) {
        assert!(index < self.width, "bit {index} out of range for i{}", self.width);
        self.words[(index / WORD_BITS) as usize] &= !(1u64 << (index % WORD_BITS));
    }

    /// The value as a `u64`, or `None` if a bit at or above 64 is set.
    pub fn to_u64(&self) -> Option<u64> {
        if self.words.iter().skip(1).any(|w| *w != 0) {
            return None;
        }
        Some(self.low_u64())
    }

    /// The low 64 bits, ignoring anything above.
    #[inline]
    pub fn low_u64(&self) -> u64 {
        self.words.first().copied().unwrap_or(0)
    }

    /// Number of significant bits (position of the highest set bit plus one).
    pub fn active_bits(&self) -> u32 {
        for (i, word) in self.words.iter().enumerate().rev() {
            if *word != 0 {
                return i as u32 * WORD_BITS + (WORD_BITS - word.leading_zeros());
            }
        }
        0
    }

    // -- Width changes --

    /// Zero-extend to `width`, which must not be smaller.
    pub fn zext(&self, width: u32) -> Self {
        assert!(width >= self.width, "zext from i{} to smaller i{width}", self.width);
        Self::from_words(width, &self.words)
    }

    /// Truncate to `width`, which must not be larger.
    pub fn trunc(&self, width: u32) -> Self {
        assert!(width <= self.width, "trunc from i{} to larger i{width}", self.width);
        Self::from_words(width, &self.words)
    }

    pub fn zext_or_trunc(&self, width: u32) -> Self {
        Self::from_words(width, &self.words)
    }

    // -- Shifts --

    /// Logical shift left; bits shifted past the width are lost.
    pub fn shl(&self, amount: u32) -> Self {
        if amount >= self.width {
            return Self::zero(self.width);
        }
        let word_shift = (amount / WORD_BITS) as usize;
        let bit_shift = amount % WORD_BITS;
        let mut result = Self::zero(self.width);
        for i in (word_shift..self.words.len()).rev() {
            let src = i - word_shift;
            let mut w = self.words[src] << bit_shift;
            if bit_shift != 0 && src > 0 {
                w |= self.words[src - 1] >> (WORD_BITS - bit_shift);
            }
            result.words[i] = w;
        }
        result.clear_unused_bits();
        result
    }

    /// Logical shift right.
    pub fn lshr(&self, amount: u32) -> Self {
        if amount >= self.width {
            return Self::zero(self.width);
        }
        let word_shift = (amount / WORD_BITS) as usize;
        let bit_shift = amount % WORD_BITS;
        let mut result = Self::zero(self.width);
        let len = self.words.len();
        for i in 0..len - word_shift {
            let src = i + word_shift;
            let mut w = self.words[src] >> bit_shift;
            if bit_shift != 0 && src + 1 < len {
                w |= self.words[src + 1] << (WORD_BITS - bit_shift);
            }
            result.words[i] = w;
        }
        result
    }

    // -- Bit ranges --

    /// The `num_bits` bits starting at `bit_position`, as a value of width
    /// `num_bits`.
    pub fn extract_bits(&self, num_bits: u32, bit_position: u32) -> Self {
        assert!(
            bit_position + num_bits <= self.width,
            "extract_bits: [{bit_position}, {}) outside i{}",
            bit_position + num_bits,
            self.width
        );
        self.lshr(bit_position).trunc(num_bits)
    }

    /// Overwrite the bits starting at `bit_position` with `value`.
    pub fn insert_bits(&mut self, value: &ApInt, bit_position: u32) {
        assert!(
            bit_position + value.width <= self.width,
            "insert_bits: [{bit_position}, {}) outside i{}",
            bit_position + value.width,
            self.width
        );
        let field = Self::low_bits_set(self.width, value.width).shl(bit_position);
        let placed = value.zext(self.width).shl(bit_position);
        *self &= &!&field;
        *self |= &placed;
    }

    // -- Arithmetic (modulo 2^width) --

    pub fn wrapping_add(&self, rhs: &ApInt) -> Self {
        self.check_same_width(rhs, "add");
        let mut result = Self::zero(self.width);
        let mut carry = 0u128;
        for i in 0..self.words.len() {
            let sum = u128::from(self.words[i]) + u128::from(rhs.words[i]) + carry;
            result.words[i] = sum as u64;
            carry = sum >> WORD_BITS;
        }
        result.clear_unused_bits();
        result
    }

    pub fn wrapping_sub(&self, rhs: &ApInt) -> Self {
        self.check_same_width(rhs, "sub");
        let negated = (!rhs).wrapping_add(&Self::new(self.width, 1));
        self.wrapping_add(&negated)
    }

    pub fn wrapping_mul(&self, rhs: &ApInt) -> Self {
        self.check_same_width(rhs, "mul");
        let n = self.words.len();
        let mut acc: SmallVec<[u64; 4]> = smallvec![0; n];
        for i in 0..n {
            let mut carry = 0u128;
            for j in 0..n - i {
                let cur = u128::from(acc[i + j])
                    + u128::from(self.words[i]) * u128::from(rhs.words[j])
                    + carry;
                acc[i + j] = cur as u64;
                carry = cur >> WORD_BITS;
            }
        }
        Self::from_words(self.width, &acc)
    }

    /// Unsigned comparison.
    pub fn cmp_unsigned(&self, rhs: &ApInt) -> Ordering {
        self.check_same_width(rhs, "compare");
        for (a, b) in self.words.iter().rev().zip(rhs.words.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    pub fn ult(&self, rhs: &ApInt) -> bool {
        self.cmp_unsigned(rhs) == Ordering::Less
    }

    fn check_same_width(&self, rhs: &ApInt, op: &str) {
        assert_eq!(
            self.width, rhs.width,
            "{op} of mismatched widths i{} and i{}",
            self.width, rhs.width
        );
    }
}

// ---------------------------------------------------------------------------
// Bitwise operators
// ---------------------------------------------------------------------------

impl Not for &ApInt {
    type Output = ApInt;

    fn not(self) -> ApInt {
        let mut result = ApInt {
            width: self.width,
            words: self.words.iter().map(|w| !w).collect(),
        };
        result.clear_unused_bits();
        result
    }
}

impl Not for ApInt {
    type Output = ApInt;

    fn not(self) -> ApInt {
        !&self
    }
}

macro_rules! bitwise_op {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
        impl $assign_trait<&ApInt> for ApInt {
            fn $assign_method(&mut self, rhs: &ApInt) {
                self.check_same_width(rhs, stringify!($method));
                for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
                    *a = *a $op *b;
                }
            }
        }

        impl $trait<&ApInt> for &ApInt {
            type Output = ApInt;

            fn $method(self, rhs: &ApInt) -> ApInt {
                let mut result = self.clone();
                result.$assign_method(rhs);
                result
            }
        }

        impl $trait<&ApInt> for ApInt {
            type Output = ApInt;

            fn $method(mut self, rhs: &ApInt) -> ApInt {
                self.$assign_method(rhs);
                self
            }
        }
    };
}

bitwise_op!(BitAnd, bitand, BitAndAssign, bitand_assign, &);
bitwise_op!(BitOr, bitor, BitOrAssign, bitor_assign, |);
bitwise_op!(BitXor, bitxor, BitXorAssign, bitxor_assign, ^);

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

impl fmt::LowerHex for ApInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut started = false;
        for word in self.words.iter().rev() {
            if started {
                write!(f, "{word:016x}")?;
            } else if *word != 0 {
                write!(f, "{word:x}")?;
                started = true;
            }
        }
        if !started {
            write!(f, "0")?;
        }
        Ok(())
    }
}

impl fmt::Display for ApInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_u64() {
            Some(v) if v < 0x1_0000 => write!(f, "{v}"),
            _ => write!(f, "0x{self:x}"),
        }
    }
}

impl fmt::Debug for ApInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{} 0x{self:x}", self.width)
    }
}

#[cfg(test)]
mod tests;
