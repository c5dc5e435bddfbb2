//! Interned IR types and the target data layout.
//!
//! The type table hands out one [`TypeId`] per structurally distinct
//! [`IrType`]; comparing types is comparing ids. Layout queries follow the
//! usual C rules: fields at increasing aligned offsets, the aggregate aligned
//! to its most aligned field, allocation size rounded up to alignment.

use std::fmt::Write as _;

use keel_bits::Endianness;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::TypeId;

/// Size and alignment rules of a target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataLayout {
    pub pointer_width: u32,
    pub endianness: Endianness,
    /// Alignment cap for integers, in bytes.
    pub max_int_alignment: u64,
}

impl DataLayout {
    #[inline]
    pub fn pointer_size(&self) -> u64 {
        u64::from(self.pointer_width / 8)
    }
}

/// Structural type of an IR value or memory location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    /// Integer of the given bit width.
    Int(u32),
    /// Opaque pointer.
    Ptr,
    Array {
        element: TypeId,
        len: u64,
    },
    /// Struct; named structs are distinct from anonymous ones with the same
    /// fields.
    Struct {
        name: Option<String>,
        fields: SmallVec<[TypeId; 4]>,
        packed: bool,
    },
    Func {
        params: SmallVec<[TypeId; 4]>,
        ret: TypeId,
    },
}

/// Interner and layout oracle for IR types.
#[derive(Debug)]
pub struct TypeTable {
    types: Vec<IrType>,
    ids: FxHashMap<IrType, TypeId>,
    named: FxHashMap<String, TypeId>,
    layout: DataLayout,
}

impl TypeTable {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            types: Vec::new(),
            ids: FxHashMap::default(),
            named: FxHashMap::default(),
            layout,
        }
    }

    #[inline]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Intern `ty`, returning the existing id if an equal type exists.
    pub fn intern(&mut self, ty: IrType) -> TypeId {
        if let Some(id) = self.ids.get(&ty) {
            return *id;
        }
        let id = TypeId::from_index(self.types.len());
        if let IrType::Struct { name: Some(name), .. } = &ty {
            self.named.insert(name.clone(), id);
        }
        self.types.push(ty.clone());
        self.ids.insert(ty, id);
        id
    }

    #[inline]
    pub fn get(&self, id: TypeId) -> &IrType {
        &self.types[id.index()]
    }

    // -- Constructors --

    pub fn void(&mut self) -> TypeId {
        self.intern(IrType::Void)
    }

    pub fn int(&mut self, bits: u32) -> TypeId {
        assert!(bits > 0, "zero-width integer type");
        self.intern(IrType::Int(bits))
    }

    pub fn i1(&mut self) -> TypeId {
        self.int(1)
    }

    pub fn i8(&mut self) -> TypeId {
        self.int(8)
    }

    pub fn i32(&mut self) -> TypeId {
        self.int(32)
    }

    /// The pointer-width integer type.
    pub fn size_int(&mut self) -> TypeId {
        self.int(self.layout.pointer_width)
    }

    pub fn ptr(&mut self) -> TypeId {
        self.intern(IrType::Ptr)
    }

    pub fn array(&mut self, element: TypeId, len: u64) -> TypeId {
        self.intern(IrType::Array { element, len })
    }

    pub fn struct_type(&mut self, fields: &[TypeId]) -> TypeId {
        self.intern(IrType::Struct {
            name: None,
            fields: fields.iter().copied().collect(),
            packed: false,
        })
    }

    pub fn packed_struct(&mut self, fields: &[TypeId]) -> TypeId {
        self.intern(IrType::Struct {
            name: None,
            fields: fields.iter().copied().collect(),
            packed: true,
        })
    }

    /// Get or create the named struct `name`.
    ///
    /// A name is bound to one body for the life of the table.
    pub fn named_struct(&mut self, name: &str, fields: &[TypeId]) -> TypeId {
        if let Some(id) = self.named.get(name) {
            let id = *id;
            assert!(
                self.struct_fields(id) == fields,
                "named struct %{name} redefined with a different body"
            );
            return id;
        }
        self.intern(IrType::Struct {
            name: Some(name.to_string()),
            fields: fields.iter().copied().collect(),
            packed: false,
        })
    }

    pub fn lookup_named(&self, name: &str) -> Option<TypeId> {
        self.named.get(name).copied()
    }

    pub fn func(&mut self, params: &[TypeId], ret: TypeId) -> TypeId {
        self.intern(IrType::Func {
            params: params.iter().copied().collect(),
            ret,
        })
    }

    // -- Predicates --

    pub fn int_width(&self, ty: TypeId) -> Option<u32> {
        match self.get(ty) {
            IrType::Int(bits) => Some(*bits),
            _ => None,
        }
    }

    pub fn is_ptr(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), IrType::Ptr)
    }

    pub fn is_void(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), IrType::Void)
    }

    /// Bit width of a scalar (integer or pointer) type.
    pub fn scalar_bits(&self, ty: TypeId) -> Option<u32> {
        match self.get(ty) {
            IrType::Int(bits) => Some(*bits),
            IrType::Ptr => Some(self.layout.pointer_width),
            _ => None,
        }
    }

    pub fn struct_fields(&self, ty: TypeId) -> &[TypeId] {
        match self.get(ty) {
            IrType::Struct { fields, .. } => fields,
            other => panic!("struct_fields of non-struct type {other:?}"),
        }
    }

    /// Parameter and return types of a function type.
    pub fn signature(&self, ty: TypeId) -> (&[TypeId], TypeId) {
        match self.get(ty) {
            IrType::Func { params, ret } => (params, *ret),
            other => panic!("signature of non-function type {other:?}"),
        }
    }

    // -- Layout --

    /// Bits a value of `ty` occupies, before padding.
    pub fn size_in_bits(&self, ty: TypeId) -> u64 {
        match self.get(ty) {
            IrType::Int(bits) => u64::from(*bits),
            _ => self.store_size(ty) * 8,
        }
    }

    /// Bytes written by a store of `ty`.
    pub fn store_size(&self, ty: TypeId) -> u64 {
        match self.get(ty) {
            IrType::Void => 0,
            IrType::Int(bits) => u64::from(bits.div_ceil(8)),
            IrType::Ptr => self.layout.pointer_size(),
            IrType::Array { element, len } => self.alloc_size(*element) * len,
            IrType::Struct { fields, packed, .. } => {
                let mut offset = 0;
                for field in fields {
                    if !packed {
                        offset = align_to(offset, self.abi_align(*field));
                    }
                    offset += self.alloc_size(*field);
                }
                offset
            }
            IrType::Func { .. } => panic!("function types have no storage size"),
        }
    }

    /// Bytes between consecutive elements of `ty` in an array.
    pub fn alloc_size(&self, ty: TypeId) -> u64 {
        align_to(self.store_size(ty), self.abi_align(ty))
    }

    pub fn abi_align(&self, ty: TypeId) -> u64 {
        match self.get(ty) {
            IrType::Void => 1,
            IrType::Int(bits) => {
                let store = u64::from(bits.div_ceil(8)).max(1);
                store.next_power_of_two().min(self.layout.max_int_alignment)
            }
            IrType::Ptr => self.layout.pointer_size(),
            IrType::Array { element, .. } => self.abi_align(*element),
            IrType::Struct { fields, packed, .. } => {
                if *packed {
                    1
                } else {
                    fields.iter().map(|f| self.abi_align(*f)).max().unwrap_or(1)
                }
            }
            IrType::Func { .. } => panic!("function types have no alignment"),
        }
    }

    /// Byte offset of field `index` of struct type `ty`.
    pub fn field_offset(&self, ty: TypeId, index: usize) -> u64 {
        let IrType::Struct { fields, packed, .. } = self.get(ty) else {
            panic!("field_offset of non-struct type");
        };
        assert!(index < fields.len(), "field {index} out of range");
        let mut offset = 0;
        for (i, field) in fields.iter().enumerate() {
            if !packed {
                offset = align_to(offset, self.abi_align(*field));
            }
            if i == index {
                return offset;
            }
            offset += self.alloc_size(*field);
        }
        offset
    }

    // -- Printing --

    /// Textual name as it appears in printed IR.
    pub fn display(&self, ty: TypeId) -> String {
        let mut out = String::new();
        self.write_type(&mut out, ty);
        out
    }

    fn write_type(&self, out: &mut String, ty: TypeId) {
        match self.get(ty) {
            IrType::Void => out.push_str("void"),
            IrType::Int(bits) => {
                let _ = write!(out, "i{bits}");
            }
            IrType::Ptr => out.push_str("ptr"),
            IrType::Array { element, len } => {
                let _ = write!(out, "[{len} x ");
                self.write_type(out, *element);
                out.push(']');
            }
            IrType::Struct { name: Some(name), .. } => {
                let _ = write!(out, "%{name}");
            }
            IrType::Struct {
                name: None,
                fields,
                packed,
            } => {
                if *packed {
                    out.push('<');
                }
                out.push_str("{ ");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_type(out, *field);
                }
                out.push_str(" }");
                if *packed {
                    out.push('>');
                }
            }
            IrType::Func { params, ret } => {
                self.write_type(out, *ret);
                out.push_str(" (");
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_type(out, *param);
                }
                out.push(')');
            }
        }
    }

    /// Named struct definitions, for the module header.
    pub(crate) fn named_definitions(&self) -> Vec<(String, TypeId)> {
        let mut defs: Vec<(String, TypeId)> =
            self.named.iter().map(|(n, id)| (n.clone(), *id)).collect();
        defs.sort_by_key(|(_, id)| *id);
        defs
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_to(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
    (value + align - 1) & !(align - 1)
}
