//! Endianness-aware chunking of bit patterns.
//!
//! A pattern is a sequence of chunks in the target's scan order. On a
//! little-endian target the first chunk occupies the lowest bits; on a
//! big-endian target it occupies the highest bits. [`BitPatternReader`] and
//! [`BitPatternBuilder`] are inverses: feeding a builder the chunks a reader
//! returns (in order) reproduces the original pattern.

use crate::{ApInt, Endianness};

/// Reads consecutive whole-byte chunks from a pattern.
#[derive(Clone, Debug)]
pub struct BitPatternReader {
    value: ApInt,
    offset: u32,
    endian: Endianness,
}

impl BitPatternReader {
    pub fn new(value: ApInt, endian: Endianness) -> Self {
        Self {
            value,
            offset: 0,
            endian,
        }
    }

    /// Read the next `num_bits` bits and advance.
    ///
    /// `num_bits` must be a multiple of 8 and must not run past the end of
    /// the pattern.
    pub fn read(&mut self, num_bits: u32) -> ApInt {
        let position = self.position_of(num_bits);
        self.offset += num_bits;
        self.value.extract_bits(num_bits, position)
    }

    /// Advance by `num_bits` without reading.
    pub fn skip(&mut self, num_bits: u32) {
        self.position_of(num_bits);
        self.offset += num_bits;
    }

    /// Bits left to read.
    pub fn remaining(&self) -> u32 {
        self.value.width() - self.offset
    }

    fn position_of(&self, num_bits: u32) -> u32 {
        assert!(
            num_bits % 8 == 0,
            "bit pattern reads must be whole bytes, got {num_bits} bits"
        );
        assert!(
            self.offset + num_bits <= self.value.width(),
            "read of {num_bits} bits at offset {} past end of i{} pattern",
            self.offset,
            self.value.width()
        );
        match self.endian {
            Endianness::Little => self.offset,
            Endianness::Big => self.value.width() - self.offset - num_bits,
        }
    }
}

/// Assembles a pattern from chunks in scan order.
#[derive(Clone, Debug)]
pub struct BitPatternBuilder {
    value: Option<ApInt>,
    endian: Endianness,
}

impl BitPatternBuilder {
    pub fn new(endian: Endianness) -> Self {
        Self {
            value: None,
            endian,
        }
    }

    /// Append `chunk` after everything appended so far.
    pub fn append(&mut self, chunk: &ApInt) {
        if chunk.width() == 0 {
            return;
        }
        let Some(current) = self.value.take() else {
            self.value = Some(chunk.clone());
            return;
        };
        let width = current.width() + chunk.width();
        let combined = match self.endian {
            Endianness::Little => {
                let mut v = current.zext(width);
                v.insert_bits(chunk, current.width());
                v
            }
            Endianness::Big => {
                let mut v = current.zext(width).shl(chunk.width());
                v.insert_bits(chunk, 0);
                v
            }
        };
        self.value = Some(combined);
    }

    pub fn append_set_bits(&mut self, n: u32) {
        self.append(&ApInt::all_ones(n));
    }

    pub fn append_clear_bits(&mut self, n: u32) {
        self.append(&ApInt::zero(n));
    }

    /// Append set bits until the pattern is `total_bits` wide.
    pub fn pad_with_set_bits_to(&mut self, total_bits: u32) {
        let size = self.size();
        assert!(size <= total_bits, "pattern of {size} bits already exceeds {total_bits}");
        self.append_set_bits(total_bits - size);
    }

    /// Append clear bits until the pattern is `total_bits` wide.
    pub fn pad_with_clear_bits_to(&mut self, total_bits: u32) {
        let size = self.size();
        assert!(size <= total_bits, "pattern of {size} bits already exceeds {total_bits}");
        self.append_clear_bits(total_bits - size);
    }

    /// Width of the pattern built so far.
    pub fn size(&self) -> u32 {
        self.value.as_ref().map_or(0, ApInt::width)
    }

    /// The assembled pattern, or `None` if nothing non-empty was appended.
    pub fn build(self) -> Option<ApInt> {
        self.value
    }
}
