//! Fixed layouts of leaf types and their extra inhabitants.
//!
//! A [`FixedTypeInfo`] is everything the layout engine knows statically
//! about a type whose size is a compile-time constant: size, alignment,
//! which bits of its storage are never used, and how invalid bit patterns
//! ("extra inhabitants") are encoded. Enums without room for their empty
//! cases in a payload's extra inhabitants fall back to explicit tag bytes;
//! see [`single_payload`].
//!
//! Bit patterns and masks here are integers as wide as the type's storage,
//! as a load of the whole storage in the target's byte order would produce
//! them.

pub(crate) mod single_payload;

use keel_bits::{get_lowest_n_set_bits, ApInt, Endianness};
use keel_ir::{align_to, TargetConfig, TypeId, TypeTable, ValueId};

use crate::context::{Address, IrGenFunction};
use crate::enum_payload::{scatter_bits, EnumPayload, EnumPayloadSchema};

pub use single_payload::{enum_tag_counts, EnumTagCounts};

/// The runtime supports at most this many extra inhabitants per type.
pub const MAX_EXTRA_INHABITANTS: u32 = 0x7fff_ffff;

/// How a type encodes its extra inhabitants.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtraInhabitants {
    /// Every bit pattern is a valid value.
    None,
    /// A pointer word at `offset` whose values below the least valid
    /// pointer are invalid. Index `i` is the address `i << reserved_low_bits`.
    HeapPointer { offset: u64 },
    /// Values with any spare bit set are invalid.
    SpareBits,
    /// An integer of `bytes` bytes at `offset` whose values at or above
    /// `valid` are invalid.
    Values { offset: u64, bytes: u32, valid: u64 },
}

/// Static layout of a fixed-size type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FixedTypeInfo {
    size: u64,
    align: u64,
    spare_bits: ApInt,
    extra_inhabitants: ExtraInhabitants,
    trivially_destroyable: bool,
    bitwise_takable: bool,
}

impl FixedTypeInfo {
    /// A type with no spare bits and no extra inhabitants.
    pub fn opaque(size: u64, align: u64, trivially_destroyable: bool, bitwise_takable: bool) -> Self {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let bits = u32::try_from(size * 8).unwrap_or_else(|_| panic!("type of {size} bytes is too large"));
        Self {
            size,
            align,
            spare_bits: ApInt::zero(bits),
            extra_inhabitants: ExtraInhabitants::None,
            trivially_destroyable,
            bitwise_takable,
        }
    }

    /// An integer of `bits` bits in the smallest power-of-two number of
    /// bytes, with the unused high bits spare.
    pub fn integer(bits: u32, target: &TargetConfig) -> Self {
        let size = u64::from(bits.div_ceil(8)).next_power_of_two();
        let align = size.min(target.pointer_size());
        let info = Self::opaque(size, align, true, true);
        let storage_bits = info.spare_bits.width();
        info.with_spare_bits(!ApInt::low_bits_set(storage_bits, bits))
    }

    /// `words` pointer-sized words, the first of which is a heap pointer.
    pub fn heap_pointer(
        target: &TargetConfig,
        words: u64,
        trivially_destroyable: bool,
        bitwise_takable: bool,
    ) -> Self {
        let pointer_size = target.pointer_size();
        Self::opaque(pointer_size * words, pointer_size, trivially_destroyable, bitwise_takable)
            .with_extra_inhabitants(ExtraInhabitants::HeapPointer { offset: 0 })
    }

    /// Mark `spare` as never used by valid values. Extra inhabitants come
    /// from the spare bits when there are any.
    #[must_use]
    pub fn with_spare_bits(mut self, spare: ApInt) -> Self {
        assert!(
            spare.width() == self.spare_bits.width(),
            "i{} spare bit mask for a type of {} bytes",
            spare.width(),
            self.size
        );
        if !spare.is_zero() {
            self.extra_inhabitants = ExtraInhabitants::SpareBits;
        }
        self.spare_bits = spare;
        self
    }

    #[must_use]
    pub fn with_extra_inhabitants(mut self, extra_inhabitants: ExtraInhabitants) -> Self {
        self.extra_inhabitants = extra_inhabitants;
        self
    }

    // -- Layout --

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn align(&self) -> u64 {
        self.align
    }

    #[inline]
    pub fn alignment_mask(&self) -> u64 {
        self.align - 1
    }

    /// Distance between consecutive array elements; never zero.
    pub fn stride(&self) -> u64 {
        align_to(self.size, self.align).max(1)
    }

    pub fn spare_bits(&self) -> &ApInt {
        &self.spare_bits
    }

    pub fn extra_inhabitants(&self) -> &ExtraInhabitants {
        &self.extra_inhabitants
    }

    pub fn is_trivially_destroyable(&self) -> bool {
        self.trivially_destroyable
    }

    pub fn is_bitwise_takable(&self) -> bool {
        self.bitwise_takable
    }

    /// True if values are stored inline in an existential's fixed buffer.
    pub fn is_inline(&self, target: &TargetConfig) -> bool {
        fits_inline(self.size, self.align, self.bitwise_takable, target)
    }

    /// The integer type a whole value loads as.
    pub fn storage_type(&self, types: &mut TypeTable) -> TypeId {
        types.int(self.spare_bits.width())
    }

    // -- Extra inhabitants --

    pub fn extra_inhabitant_count(&self, target: &TargetConfig) -> u32 {
        match &self.extra_inhabitants {
            ExtraInhabitants::None => 0,
            ExtraInhabitants::HeapPointer { .. } => heap_pointer_extra_inhabitant_count(target),
            ExtraInhabitants::SpareBits => spare_bit_extra_inhabitant_count(&self.spare_bits),
            ExtraInhabitants::Values { bytes, valid, .. } => {
                let values = 1u64 << (8 * (*bytes).min(4));
                let count = values.saturating_sub(*valid).min(u64::from(MAX_EXTRA_INHABITANTS));
                count as u32
            }
        }
    }

    /// The bits that distinguish extra inhabitants from each other.
    pub fn fixed_extra_inhabitant_mask(&self, target: &TargetConfig) -> ApInt {
        let width = self.spare_bits.width();
        let endian = target.endianness();
        match &self.extra_inhabitants {
            ExtraInhabitants::None => ApInt::zero(width),
            ExtraInhabitants::HeapPointer { offset } => {
                let word = ApInt::all_ones(target.pointer_width());
                place_bytes(&word, *offset, self.size, endian)
            }
            ExtraInhabitants::SpareBits => ApInt::all_ones(width),
            ExtraInhabitants::Values { offset, bytes, .. } => {
                place_bytes(&ApInt::all_ones(bytes * 8), *offset, self.size, endian)
            }
        }
    }

    /// Bit pattern of extra inhabitant `index`, within
    /// [`fixed_extra_inhabitant_mask`](Self::fixed_extra_inhabitant_mask).
    pub fn fixed_extra_inhabitant_value(&self, target: &TargetConfig, index: u32) -> ApInt {
        let count = self.extra_inhabitant_count(target);
        assert!(index < count, "extra inhabitant {index} of a type with {count}");
        let width = self.spare_bits.width();
        let endian = target.endianness();
        match &self.extra_inhabitants {
            ExtraInhabitants::None => ApInt::zero(width),
            ExtraInhabitants::HeapPointer { offset } => {
                let value = u64::from(index) << target.reserved_low_bits();
                place_bytes(&ApInt::new(target.pointer_width(), value), *offset, self.size, endian)
            }
            ExtraInhabitants::SpareBits => {
                let occupied = !&self.spare_bits;
                let occupied_used = occupied.count_ones().min(31);
                let index = u64::from(index);
                let occupied_value = index & ((1 << occupied_used) - 1);
                let spare_value = (index >> occupied_used) + 1;
                let occupied_mask = get_lowest_n_set_bits(&occupied, occupied_used);
                let low = scatter_bits(&occupied_mask, &ApInt::new(64, occupied_value));
                let high = scatter_bits(&self.spare_bits, &ApInt::new(64, spare_value));
                &low | &high
            }
            ExtraInhabitants::Values { offset, bytes, valid } => {
                let value = ApInt::new(bytes * 8, valid + u64::from(index));
                place_bytes(&value, *offset, self.size, endian)
            }
        }
    }
}

/// True if a value of this shape fits an existential's inline buffer.
pub fn fits_inline(size: u64, align: u64, bitwise_takable: bool, target: &TargetConfig) -> bool {
    bitwise_takable && size <= target.fixed_buffer_size() && align <= target.pointer_size()
}

/// Extra inhabitants of a heap pointer: every value below the least valid
/// pointer, at the granularity of the reserved low bits.
pub fn heap_pointer_extra_inhabitant_count(target: &TargetConfig) -> u32 {
    let count = target.least_valid_pointer() >> target.reserved_low_bits();
    count.min(u64::from(MAX_EXTRA_INHABITANTS)) as u32
}

/// `(2^spare - 1) << occupied`, saturated.
pub fn spare_bit_extra_inhabitant_count(spare_bits: &ApInt) -> u32 {
    let spare = spare_bits.count_ones();
    if spare == 0 {
        return 0;
    }
    let occupied = spare_bits.width() - spare;
    if spare >= 31 || occupied >= 31 {
        return MAX_EXTRA_INHABITANTS;
    }
    let count = ((1u64 << spare) - 1) << occupied;
    count.min(u64::from(MAX_EXTRA_INHABITANTS)) as u32
}

/// `value` placed at byte `offset` of a `total`-byte storage integer.
pub(crate) fn place_bytes(value: &ApInt, offset: u64, total: u64, endian: Endianness) -> ApInt {
    let bits = u64::from(value.width());
    assert!(bits % 8 == 0, "placing i{bits}, which is not whole bytes");
    assert!(
        offset * 8 + bits <= total * 8,
        "i{bits} at byte {offset} overruns {total} bytes"
    );
    let position = match endian {
        Endianness::Little => offset * 8,
        Endianness::Big => total * 8 - offset * 8 - bits,
    };
    let mut result = ApInt::zero((total * 8) as u32);
    result.insert_bits(value, position as u32);
    result
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

impl IrGenFunction<'_> {
    /// Extra-inhabitant tag of the value at `addr` as an `i32`: zero for a
    /// valid value, `index + 1` for extra inhabitant `index`.
    pub fn emit_get_extra_inhabitant_tag(&mut self, info: &FixedTypeInfo, addr: Address) -> ValueId {
        let i32_ty = self.builder.i32_type();
        match info.extra_inhabitants() {
            ExtraInhabitants::None => self.builder.const_i32(0),
            ExtraInhabitants::HeapPointer { offset } => {
                let pointer_size = self.pointer_size();
                let word_ty = self.builder.size_type();
                let slot = self.builder.byte_offset_const(addr.ptr, *offset);
                let value = self.builder.load(word_ty, slot, pointer_size);
                let reserved = self.target().reserved_low_bits();
                let limit = u64::from(heap_pointer_extra_inhabitant_count(self.target())) << reserved;
                let limit = self.builder.const_size(limit);
                let is_xi = self.builder.icmp_ult(value, limit);
                let index = self.builder.lshr_const(value, reserved);
                let index = self.builder.trunc(index, i32_ty);
                let one = self.builder.const_i32(1);
                let tag = self.builder.add(index, one);
                let zero = self.builder.const_i32(0);
                self.builder.select(is_xi, tag, zero)
            }
            ExtraInhabitants::SpareBits => {
                let spare_bits = info.spare_bits().clone();
                let occupied = !&spare_bits;
                let spare_used = spare_bits.count_ones().min(32);
                let occupied_used = occupied.count_ones().min(31);
                let schema = EnumPayloadSchema::fixed(u64::from(spare_bits.width()));
                let payload = EnumPayload::load(self, addr, schema);
                let spare = payload.emit_gather_spare_bits(self, &spare_bits, 0, spare_used);
                let spare = self.builder.zext_or_trunc(spare, i32_ty);
                let occupied_value = if occupied_used == 0 {
                    self.builder.const_i32(0)
                } else {
                    let value = payload.emit_gather_spare_bits(self, &occupied, 0, occupied_used);
                    self.builder.zext_or_trunc(value, i32_ty)
                };
                let b = &mut self.builder;
                let zero = b.const_i32(0);
                let one = b.const_i32(1);
                let is_xi = b.icmp_ne(spare, zero);
                let high = b.sub(spare, one);
                let high = b.shl_const(high, occupied_used);
                let index = b.or(high, occupied_value);
                let tag = b.add(index, one);
                b.select(is_xi, tag, zero)
            }
            ExtraInhabitants::Values { offset, bytes, valid } => {
                let int_ty = self.builder.int_type(bytes * 8);
                let slot = self.builder.byte_offset_const(addr.ptr, *offset);
                let value = self.builder.load(int_ty, slot, 1);
                let value = self.builder.zext(value, i32_ty);
                let valid = self.builder.const_i32(*valid as u32);
                let is_xi = self.builder.icmp_uge(value, valid);
                let index = self.builder.sub(value, valid);
                let one = self.builder.const_i32(1);
                let tag = self.builder.add(index, one);
                let zero = self.builder.const_i32(0);
                self.builder.select(is_xi, tag, zero)
            }
        }
    }

    /// Overwrite the value at `addr` with the extra inhabitant for `tag`
    /// (an `i32`, at least one).
    pub fn emit_store_extra_inhabitant_tag(&mut self, info: &FixedTypeInfo, addr: Address, tag: ValueId) {
        let one = self.builder.const_i32(1);
        let index = self.builder.sub(tag, one);
        match info.extra_inhabitants() {
            ExtraInhabitants::None => {
                panic!("storing an extra inhabitant into a type without any");
            }
            ExtraInhabitants::HeapPointer { offset } => {
                let pointer_size = self.pointer_size();
                let word_ty = self.builder.size_type();
                let value = self.builder.zext(index, word_ty);
                let value = self.builder.shl_const(value, self.target().reserved_low_bits());
                let slot = self.builder.byte_offset_const(addr.ptr, *offset);
                self.builder.store(value, slot, pointer_size);
            }
            ExtraInhabitants::SpareBits => {
                let spare_bits = info.spare_bits().clone();
                let occupied = !&spare_bits;
                let occupied_used = occupied.count_ones().min(31);
                let schema = EnumPayloadSchema::fixed(u64::from(spare_bits.width()));
                let mut payload = EnumPayload::zero(self, schema);
                if occupied_used > 0 {
                    let low_mask = self.builder.const_i32((1u32 << occupied_used) - 1);
                    let low = self.builder.and(index, low_mask);
                    let occupied_mask = get_lowest_n_set_bits(&occupied, occupied_used);
                    payload.emit_scatter_bits(self, &occupied_mask, low);
                }
                let high = self.builder.lshr_const(index, occupied_used);
                let spare_value = self.builder.add(high, one);
                payload.emit_scatter_bits(self, &spare_bits, spare_value);
                payload.store(self, addr);
            }
            ExtraInhabitants::Values { offset, bytes, valid } => {
                let valid = self.builder.const_i32(*valid as u32);
                let value = self.builder.add(index, valid);
                let int_ty = self.builder.int_type(bytes * 8);
                let value = self.builder.zext_or_trunc(value, int_ty);
                let slot = self.builder.byte_offset_const(addr.ptr, *offset);
                self.builder.store(value, slot, 1);
            }
        }
    }

    /// Single-payload enum tag of a value of fixed type `info` with
    /// `num_empty_cases` (an `i32`) empty cases.
    pub fn emit_get_fixed_type_enum_tag_single_payload(
        &mut self,
        info: &FixedTypeInfo,
        num_empty_cases: ValueId,
        addr: Address,
    ) -> ValueId {
        let size = self.builder.const_size(info.size());
        let xi_count = self.builder.const_i32(info.extra_inhabitant_count(self.target()));
        single_payload::emit_get_enum_tag_single_payload(self, addr, num_empty_cases, size, xi_count, |igf, addr, _| {
            igf.emit_get_extra_inhabitant_tag(info, addr)
        })
    }

    pub fn emit_store_fixed_type_enum_tag_single_payload(
        &mut self,
        info: &FixedTypeInfo,
        tag: ValueId,
        num_empty_cases: ValueId,
        addr: Address,
    ) {
        let size = self.builder.const_size(info.size());
        let xi_count = self.builder.const_i32(info.extra_inhabitant_count(self.target()));
        single_payload::emit_store_enum_tag_single_payload(
            self,
            addr,
            tag,
            num_empty_cases,
            size,
            xi_count,
            |igf, addr, tag, _| igf.emit_store_extra_inhabitant_tag(info, addr, tag),
        );
    }
}
