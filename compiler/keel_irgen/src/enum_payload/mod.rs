//! Enum payloads as sequences of lazily materialized words.
//!
//! An [`EnumPayload`] is the IR-level value of an enum's payload area, split
//! into the integer words its [`EnumPayloadSchema`] prescribes. A word that
//! nothing has been written to yet is kept as [`LazyValue::Zero`] and only
//! turned into a constant when something forces it, so payloads built from a
//! few inserted fields stay cheap.
//!
//! # Bit order
//!
//! Masks and patterns handed to a payload are integers as wide as the
//! payload, in the target's byte order: on a little-endian target the first
//! word is the low end of the integer, on a big-endian target the high end.
//! This is the integer a load of the whole payload area would produce, so
//! spare-bit masks and extra-inhabitant patterns computed from a type's
//! memory layout apply directly. All chunking goes through
//! [`BitPatternReader`].

mod bits;
mod schema;

use std::cell::Cell;
use std::fmt;

use keel_bits::{get_lowest_n_set_bits, ApInt, BitPatternReader, Endianness};
use keel_ir::{BlockId, IrBuilder, Module, TypeId, ValueId};
use smallvec::SmallVec;

pub use bits::{gather_bits, scatter_bits};
pub(crate) use bits::{emit_gather_bits, emit_scatter_bits};
pub use schema::EnumPayloadSchema;

use crate::context::{Address, IrGenFunction};

/// One word of a payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LazyValue {
    /// A materialized value.
    Concrete(ValueId),
    /// All zero bits, not yet materialized.
    Zero(TypeId),
}

impl LazyValue {
    pub fn ty(self, module: &Module) -> TypeId {
        match self {
            LazyValue::Concrete(v) => module.value_type(v),
            LazyValue::Zero(ty) => ty,
        }
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        matches!(self, LazyValue::Zero(_))
    }

    fn force(self, b: &mut IrBuilder<'_>) -> ValueId {
        match self {
            LazyValue::Concrete(v) => v,
            LazyValue::Zero(ty) => b.const_zero(ty),
        }
    }
}

fn bits_of(module: &Module, ty: TypeId) -> u32 {
    module
        .types()
        .scalar_bits(ty)
        .unwrap_or_else(|| panic!("payload element of non-scalar type {}", module.types().display(ty)))
}

/// The payload area of an enum value.
#[derive(Clone, Debug)]
pub struct EnumPayload {
    elements: SmallVec<[LazyValue; 4]>,
    schema: EnumPayloadSchema,
    storage_type: Cell<Option<TypeId>>,
}

impl EnumPayload {
    fn with_elements(elements: SmallVec<[LazyValue; 4]>, schema: EnumPayloadSchema) -> Self {
        Self {
            elements,
            schema,
            storage_type: Cell::new(None),
        }
    }

    fn schema_types(igf: &mut IrGenFunction<'_>, schema: EnumPayloadSchema) -> SmallVec<[TypeId; 4]> {
        let mut types = SmallVec::new();
        schema.for_each_type(igf.builder.module_mut().types_mut(), |ty| types.push(ty));
        types
    }

    // -- Construction --

    /// A payload of all zero bits.
    pub fn zero(igf: &mut IrGenFunction<'_>, schema: EnumPayloadSchema) -> Self {
        let elements = Self::schema_types(igf, schema)
            .into_iter()
            .map(LazyValue::Zero)
            .collect();
        Self::with_elements(elements, schema)
    }

    /// A constant payload holding `pattern`, which is as wide as the schema.
    pub fn from_bit_pattern(
        igf: &mut IrGenFunction<'_>,
        pattern: &ApInt,
        schema: EnumPayloadSchema,
    ) -> Self {
        assert!(
            schema.bit_size() == Some(u64::from(pattern.width())),
            "i{} pattern for a payload of {:?} bits",
            pattern.width(),
            schema.bit_size()
        );
        let mut reader = BitPatternReader::new(pattern.clone(), igf.endianness());
        let elements = Self::schema_types(igf, schema)
            .into_iter()
            .map(|ty| {
                let chunk = reader.read(bits_of(igf.builder.module(), ty));
                LazyValue::Concrete(igf.builder.const_typed(ty, &chunk))
            })
            .collect();
        Self::with_elements(elements, schema)
    }

    /// Take one value per schema word from `values`.
    pub fn from_explosion(
        igf: &mut IrGenFunction<'_>,
        values: &mut impl Iterator<Item = ValueId>,
        schema: EnumPayloadSchema,
    ) -> Self {
        let elements = Self::schema_types(igf, schema)
            .into_iter()
            .map(|ty| {
                let Some(value) = values.next() else {
                    panic!("explosion ran out of payload values");
                };
                assert!(
                    igf.builder.type_of(value) == ty,
                    "payload value of type {} where the schema has {}",
                    igf.builder.module().types().display(igf.builder.type_of(value)),
                    igf.builder.module().types().display(ty)
                );
                LazyValue::Concrete(value)
            })
            .collect();
        Self::with_elements(elements, schema)
    }

    /// One value per word, materializing zeros.
    pub fn explode(&self, igf: &mut IrGenFunction<'_>) -> SmallVec<[ValueId; 4]> {
        self.elements.iter().map(|e| e.force(&mut igf.builder)).collect()
    }

    // -- Accessors --

    #[inline]
    pub fn schema(&self) -> EnumPayloadSchema {
        self.schema
    }

    #[inline]
    pub fn elements(&self) -> &[LazyValue] {
        &self.elements
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Total significant bits of the words.
    pub fn bit_width(&self, module: &Module) -> u32 {
        self.elements.iter().map(|e| bits_of(module, e.ty(module))).sum()
    }

    fn assert_mask_width(&self, module: &Module, mask: &ApInt) {
        let width = self.bit_width(module);
        assert!(
            mask.width() == width,
            "mask of {} bits applied to a {width}-bit payload",
            mask.width()
        );
    }

    /// Total allocation size of the words, in bits.
    pub fn alloc_size_in_bits(&self, module: &Module) -> u64 {
        let bits: u64 = self
            .elements
            .iter()
            .map(|e| module.types().alloc_size(e.ty(module)) * 8)
            .sum();
        assert!(bits % 8 == 0, "payload allocation of {bits} bits is not whole bytes");
        bits
    }

    /// The IR type the payload is stored as: the single word's type, or an
    /// anonymous struct of the word types.
    pub fn storage_type(&self, module: &mut Module) -> TypeId {
        if let Some(ty) = self.storage_type.get() {
            return ty;
        }
        let types: SmallVec<[TypeId; 4]> = self.elements.iter().map(|e| e.ty(module)).collect();
        let ty = if let [single] = types.as_slice() {
            *single
        } else {
            module.types_mut().struct_type(&types)
        };
        self.storage_type.set(Some(ty));
        ty
    }

    // -- Memory --

    pub fn load(igf: &mut IrGenFunction<'_>, addr: Address, schema: EnumPayloadSchema) -> Self {
        let mut payload = Self::zero(igf, schema);
        if payload.is_empty() {
            return payload;
        }
        let storage = payload.storage_type(igf.builder.module_mut());
        if payload.len() == 1 {
            let ty = payload.elements[0].ty(igf.builder.module());
            let value = igf.builder.load(ty, addr.ptr, addr.align);
            payload.elements[0] = LazyValue::Concrete(value);
            return payload;
        }
        for i in 0..payload.len() {
            let ty = payload.elements[i].ty(igf.builder.module());
            let offset = igf.builder.module().types().field_offset(storage, i);
            let field = igf.builder.struct_gep(storage, addr.ptr, i as u32);
            let value = igf.builder.load(ty, field, offset_alignment(addr.align, offset));
            payload.elements[i] = LazyValue::Concrete(value);
        }
        payload
    }

    pub fn store(&self, igf: &mut IrGenFunction<'_>, addr: Address) {
        if self.is_empty() {
            return;
        }
        let storage = self.storage_type(igf.builder.module_mut());
        if self.len() == 1 {
            let value = self.elements[0].force(&mut igf.builder);
            igf.builder.store(value, addr.ptr, addr.align);
            return;
        }
        for (i, element) in self.elements.iter().enumerate() {
            let offset = igf.builder.module().types().field_offset(storage, i);
            let field = igf.builder.struct_gep(storage, addr.ptr, i as u32);
            let value = element.force(&mut igf.builder);
            igf.builder.store(value, field, offset_alignment(addr.align, offset));
        }
    }

    // -- Values at byte offsets --

    /// Mask of the bytes a value of type `ty` occupies at `bit_offset`, with
    /// only its low `significant` bits set within those bytes.
    fn element_mask(
        &self,
        module: &Module,
        endian: Endianness,
        ty: TypeId,
        bit_offset: u32,
        significant: u32,
    ) -> ApInt {
        assert!(bit_offset % 8 == 0, "payload value at bit offset {bit_offset} is not byte aligned");
        let payload_bits = self.bit_width(module);
        assert!(payload_bits % 8 == 0, "payload of {payload_bits} bits is not whole bytes");
        let store_bits = u32::try_from(module.types().store_size(ty) * 8)
            .unwrap_or_else(|_| panic!("payload value too large"));
        assert!(
            bit_offset + store_bits <= payload_bits,
            "value of {store_bits} bits at offset {bit_offset} overruns a {payload_bits}-bit payload"
        );
        let element = ApInt::low_bits_set(store_bits, significant);
        let position = match endian {
            Endianness::Little => bit_offset,
            Endianness::Big => payload_bits - bit_offset - store_bits,
        };
        let mut mask = ApInt::zero(payload_bits);
        mask.insert_bits(&element, position);
        mask
    }

    /// Write `value` into the bytes at `bit_offset`, replacing what was there.
    /// Only the low `num_bits_used` bits of the value are stored when given;
    /// the rest of its bytes are cleared.
    pub fn insert_value(
        &mut self,
        igf: &mut IrGenFunction<'_>,
        value: ValueId,
        bit_offset: u32,
        num_bits_used: Option<u32>,
    ) {
        let endian = igf.endianness();
        let module = igf.builder.module();
        let ty = module.value_type(value);
        let size = bits_of(module, ty);
        let store_bits = u32::try_from(module.types().store_size(ty) * 8)
            .unwrap_or_else(|_| panic!("payload value too large"));
        let significant = num_bits_used.map_or(size, |n| n.min(size));
        let region = self.element_mask(module, endian, ty, bit_offset, store_bits);
        let mask = self.element_mask(module, endian, ty, bit_offset, significant);
        self.emit_apply_and_mask(igf, &!&region);
        let int_ty = igf.builder.int_type(size);
        let value = igf.builder.coerce(value, int_ty);
        self.emit_scatter_bits(igf, &mask, value);
    }

    /// Read a value of type `ty` from the bytes at `bit_offset`.
    pub fn extract_value(&self, igf: &mut IrGenFunction<'_>, ty: TypeId, bit_offset: u32) -> ValueId {
        let endian = igf.endianness();
        let module = igf.builder.module();
        let size = bits_of(module, ty);
        let mask = self.element_mask(module, endian, ty, bit_offset, size);
        let value = self.emit_gather_spare_bits(igf, &mask, 0, size);
        igf.builder.coerce(value, ty)
    }

    /// Copy every word of this payload into `outer` starting at `bit_offset`.
    pub fn pack_into_enum_payload(
        &self,
        igf: &mut IrGenFunction<'_>,
        outer: &mut EnumPayload,
        bit_offset: u32,
    ) {
        let mut offset = bit_offset;
        for element in &self.elements {
            let value = element.force(&mut igf.builder);
            let width = igf.builder.bit_width(value);
            outer.insert_value(igf, value, offset, None);
            offset += width;
        }
    }

    /// The payload of `schema` stored in `outer` starting at `bit_offset`.
    pub fn unpack_from_enum_payload(
        igf: &mut IrGenFunction<'_>,
        outer: &EnumPayload,
        bit_offset: u32,
        schema: EnumPayloadSchema,
    ) -> Self {
        let mut offset = bit_offset;
        let elements = Self::schema_types(igf, schema)
            .into_iter()
            .map(|ty| {
                let value = outer.extract_value(igf, ty, offset);
                offset += bits_of(igf.builder.module(), ty);
                LazyValue::Concrete(value)
            })
            .collect();
        Self::with_elements(elements, schema)
    }

    // -- Sparse bits --

    /// Spread the low bits of `value` over the set bits of `mask`, OR-ing
    /// into the words they land in. Stops once every bit of the value has a
    /// place; later words are left alone.
    pub fn emit_scatter_bits(&mut self, igf: &mut IrGenFunction<'_>, mask: &ApInt, value: ValueId) {
        let endian = igf.endianness();
        let b = &mut igf.builder;
        let value_bits = b.bit_width(value);
        let value = {
            let int_ty = b.int_type(value_bits);
            b.coerce(value, int_ty)
        };
        let total = value_bits.min(mask.count_ones());
        let mut reader = BitPatternReader::new(get_lowest_n_set_bits(mask, total), endian);
        let mut used = 0;
        for element in &mut self.elements {
            if used >= total {
                break;
            }
            let ty = element.ty(b.module());
            let bits = bits_of(b.module(), ty);
            let part_mask = reader.read(bits);
            if part_mask.is_zero() {
                continue;
            }
            let count = part_mask.count_ones();
            let offset = match endian {
                Endianness::Little => used,
                Endianness::Big => total - count - used,
            };
            let mut part = emit_scatter_bits(b, &part_mask, value, offset);
            if let LazyValue::Concrete(existing) = *element {
                let int_ty = b.type_of(part);
                let existing = b.coerce(existing, int_ty);
                part = b.or(part, existing);
            }
            *element = LazyValue::Concrete(b.coerce(part, ty));
            used += count;
        }
        tracing::trace!(bits = total, "scattered bits into payload");
    }

    /// Collect the bits selected by the lowest `result_width - first_bit`
    /// set bits of `mask` into an integer of `result_width` bits, starting at
    /// bit `first_bit`. Zero words contribute zero bits.
    pub fn emit_gather_spare_bits(
        &self,
        igf: &mut IrGenFunction<'_>,
        mask: &ApInt,
        first_bit: u32,
        result_width: u32,
    ) -> ValueId {
        assert!(first_bit <= result_width, "gather starts past its own result");
        let endian = igf.endianness();
        let b = &mut igf.builder;
        let mask = get_lowest_n_set_bits(mask, result_width - first_bit);
        let count = mask.count_ones();
        let mut reader = BitPatternReader::new(mask, endian);
        let mut used = 0;
        let mut result: Option<ValueId> = None;
        for element in &self.elements {
            if used >= count {
                break;
            }
            let ty = element.ty(b.module());
            let bits = bits_of(b.module(), ty);
            let piece = reader.read(bits);
            let n = piece.count_ones();
            if n == 0 {
                continue;
            }
            let offset = first_bit
                + match endian {
                    Endianness::Little => used,
                    Endianness::Big => count - used - n,
                };
            used += n;
            let LazyValue::Concrete(value) = *element else {
                continue;
            };
            let int_ty = b.int_type(bits);
            let value = b.coerce(value, int_ty);
            let gathered = emit_gather_bits(b, &piece, value, offset, result_width);
            result = Some(match result {
                Some(acc) => b.or(acc, gathered),
                None => gathered,
            });
        }
        result.unwrap_or_else(|| {
            let ty = b.int_type(result_width);
            b.const_zero(ty)
        })
    }

    // -- Masks and comparisons --

    /// `(payload & mask) == value` as an `i1`.
    pub fn emit_compare(&self, igf: &mut IrGenFunction<'_>, mask: &ApInt, value: &ApInt) -> ValueId {
        let endian = igf.endianness();
        let b = &mut igf.builder;
        if self.is_empty() || mask.is_zero() {
            return b.const_bool(true);
        }
        assert!((&!mask & value).is_zero(), "compared value has bits outside the mask");
        let mut mask_reader = BitPatternReader::new(mask.clone(), endian);
        let mut value_reader = BitPatternReader::new(value.clone(), endian);
        let mut condition: Option<ValueId> = None;
        for element in &self.elements {
            let ty = element.ty(b.module());
            let bits = bits_of(b.module(), ty);
            let mask_piece = mask_reader.read(bits);
            let value_piece = value_reader.read(bits);
            if mask_piece.is_zero() {
                continue;
            }
            let int_ty = b.int_type(bits);
            let forced = element.force(b);
            let mut v = b.coerce(forced, int_ty);
            if !mask_piece.is_all_ones() {
                let m = b.const_typed(int_ty, &mask_piece);
                v = b.and(v, m);
            }
            let expected = b.const_typed(int_ty, &value_piece);
            let cmp = b.icmp_eq(v, expected);
            condition = Some(match condition {
                Some(c) => b.and_bool(c, cmp),
                None => cmp,
            });
        }
        condition.unwrap_or_else(|| panic!("no significant bits in a non-zero mask"))
    }

    /// `payload &= mask`. Words the mask clears entirely become zero words.
    ///
    /// `mask` must be exactly as wide as the payload, in the target's
    /// integer order; a mask of any other width panics before anything is
    /// emitted.
    pub fn emit_apply_and_mask(&mut self, igf: &mut IrGenFunction<'_>, mask: &ApInt) {
        self.assert_mask_width(igf.builder.module(), mask);
        if mask.is_all_ones() {
            return;
        }
        let endian = igf.endianness();
        let b = &mut igf.builder;
        let mut reader = BitPatternReader::new(mask.clone(), endian);
        for element in &mut self.elements {
            let ty = element.ty(b.module());
            let bits = bits_of(b.module(), ty);
            let piece = reader.read(bits);
            if piece.is_all_ones() {
                continue;
            }
            let LazyValue::Concrete(value) = *element else {
                continue;
            };
            if piece.is_zero() {
                *element = LazyValue::Zero(ty);
                continue;
            }
            let int_ty = b.int_type(bits);
            let v = b.coerce(value, int_ty);
            let m = b.const_typed(int_ty, &piece);
            let v = b.and(v, m);
            *element = LazyValue::Concrete(b.coerce(v, ty));
        }
    }

    /// `payload |= mask`. Same width contract as
    /// [`emit_apply_and_mask`](Self::emit_apply_and_mask).
    pub fn emit_apply_or_mask(&mut self, igf: &mut IrGenFunction<'_>, mask: &ApInt) {
        self.assert_mask_width(igf.builder.module(), mask);
        if mask.is_zero() {
            return;
        }
        let endian = igf.endianness();
        let b = &mut igf.builder;
        let mut reader = BitPatternReader::new(mask.clone(), endian);
        for element in &mut self.elements {
            let ty = element.ty(b.module());
            let bits = bits_of(b.module(), ty);
            let piece = reader.read(bits);
            if piece.is_zero() {
                continue;
            }
            let int_ty = b.int_type(bits);
            let m = b.const_typed(int_ty, &piece);
            match *element {
                LazyValue::Concrete(value) if !piece.is_all_ones() => {
                    let v = b.coerce(value, int_ty);
                    let v = b.or(v, m);
                    *element = LazyValue::Concrete(b.coerce(v, ty));
                }
                _ => *element = LazyValue::Concrete(b.coerce(m, ty)),
            }
        }
    }

    /// `payload |= other`, word by word. Both payloads must come from the
    /// same schema.
    pub fn emit_apply_or_mask_payload(&mut self, igf: &mut IrGenFunction<'_>, other: &EnumPayload) {
        assert!(
            self.schema == other.schema && self.len() == other.len(),
            "OR of payloads with different schemas ({:?} and {:?})",
            self.schema,
            other.schema
        );
        let b = &mut igf.builder;
        for (element, mask) in self.elements.iter_mut().zip(&other.elements) {
            match (*element, *mask) {
                (_, LazyValue::Zero(_)) => {}
                (LazyValue::Zero(_), LazyValue::Concrete(_)) => *element = *mask,
                (LazyValue::Concrete(lhs), LazyValue::Concrete(rhs)) => {
                    let ty = b.type_of(lhs);
                    let bits = bits_of(b.module(), ty);
                    let int_ty = b.int_type(bits);
                    let l = b.coerce(lhs, int_ty);
                    let r = b.coerce(rhs, int_ty);
                    let v = b.or(l, r);
                    *element = LazyValue::Concrete(b.coerce(v, ty));
                }
            }
        }
    }

    // -- Switches --

    /// Branch to the destination of the case whose value equals the payload
    /// bits under `mask`, or to `default`. Terminates the current block.
    pub fn emit_switch(
        &self,
        igf: &mut IrGenFunction<'_>,
        mask: &ApInt,
        cases: &[(ApInt, BlockId)],
        default: BlockId,
        default_unreachable: bool,
    ) {
        match cases {
            [] => {
                igf.builder.br(default);
                return;
            }
            [(value, dest)] => {
                if default_unreachable {
                    igf.builder.br(*dest);
                } else {
                    let cmp = self.emit_compare(igf, mask, value);
                    igf.builder.cond_br(cmp, *dest, default);
                }
                return;
            }
            _ => {}
        }

        let pointer_width = igf.builder.pointer_width();
        if mask.width() > 2 * pointer_width {
            for (i, (value, dest)) in cases.iter().enumerate() {
                let cmp = self.emit_compare(igf, mask, value);
                let last = i + 1 == cases.len();
                let next = if last {
                    default
                } else {
                    igf.builder.append_block("payload.case.next")
                };
                igf.builder.cond_br(cmp, *dest, next);
                if !last {
                    igf.builder.position_at_end(next);
                }
            }
            return;
        }

        let num_bits = mask.count_ones();
        assert!(num_bits > 0, "multi-way switch over an empty mask");
        let target = self.emit_gather_spare_bits(igf, mask, 0, num_bits);
        let gathered = cases
            .iter()
            .map(|(value, dest)| (gather_bits(mask, value), *dest))
            .collect();
        igf.builder.switch(target, default, gathered);
    }

    /// Debug rendering of the words.
    pub fn display<'a>(&'a self, module: &'a Module) -> PayloadDisplay<'a> {
        PayloadDisplay {
            payload: self,
            module,
        }
    }
}

/// Alignment of a field at `offset` inside storage aligned to `align`.
fn offset_alignment(align: u64, offset: u64) -> u64 {
    if offset == 0 {
        align
    } else {
        align.min(1 << offset.trailing_zeros())
    }
}

/// See [`EnumPayload::display`].
pub struct PayloadDisplay<'a> {
    payload: &'a EnumPayload,
    module: &'a Module,
}

impl fmt::Display for PayloadDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = self.module.types();
        if let Some(ty) = self.payload.storage_type.get() {
            writeln!(f, "storage-type: {}", types.display(ty))?;
        }
        for element in &self.payload.elements {
            match *element {
                LazyValue::Concrete(v) => {
                    let ty = types.display(self.module.value_type(v));
                    match self.module.constant(v) {
                        Some(c) => writeln!(f, "value: {ty} {c}")?,
                        None => writeln!(f, "value: {ty} %{}", v.raw())?,
                    }
                }
                LazyValue::Zero(ty) => writeln!(f, "type: {}", types.display(ty))?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
