//! Runtime ABI: entry points, type metadata access and value witness tables.
//!
//! Generated code reaches the runtime in two ways. Free functions such as
//! `keel_retain` are declared in the module on first use and called
//! directly. Type-specific operations go through the value witness table,
//! whose address is the first word of every type metadata record.
//!
//! # Value witness table
//!
//! | Offset | Field |
//! |--------|-------|
//! | `0 * ptr` .. `7 * ptr` | function witnesses, in [`ValueWitness`] order |
//! | `8 * ptr` | size |
//! | `9 * ptr` | stride |
//! | `10 * ptr` | flags (`u32`) |
//! | `10 * ptr + 4` | extra inhabitant count (`u32`) |
//! | `10 * ptr + 8` .. | enum witnesses (only with [`ValueWitnessFlags::HAS_ENUM_WITNESSES`]) |
//!
//! Every witness function takes the type metadata as its last argument.

use bitflags::bitflags;
use keel_ir::{FunctionId, TypeId, TypeTable, ValueId};

use crate::context::IrGenFunction;
use crate::types::{TypeDesc, TypeRef};

// ---------------------------------------------------------------------------
// Runtime entry points
// ---------------------------------------------------------------------------

/// Scalar parameter and result types of runtime signatures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Abi {
    Ptr,
    Word,
    I32,
}

impl Abi {
    fn lower(self, types: &mut TypeTable) -> TypeId {
        match self {
            Abi::Ptr => types.ptr(),
            Abi::Word => types.size_int(),
            Abi::I32 => types.i32(),
        }
    }
}

fn lower_signature(types: &mut TypeTable, params: &[Abi], ret: Option<Abi>) -> TypeId {
    let params: Vec<TypeId> = params.iter().map(|p| p.lower(types)).collect();
    let ret = match ret {
        Some(r) => r.lower(types),
        None => types.void(),
    };
    types.func(&params, ret)
}

/// A function exported by the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `(type index: i32) -> metadata`
    GetTypeMetadata,
    /// `(type index: i32, arguments: ptr, count: i32) -> metadata`
    GetGenericMetadata,
    Retain,
    Release,
    UnknownObjectRetain,
    UnknownObjectRelease,
    BridgeObjectRetain,
    BridgeObjectRelease,
    BlockRetain,
    BlockRelease,
    ObjCRetain,
    ObjCRelease,
    ErrorRetain,
    ErrorRelease,
    UnownedRetain,
    UnownedRelease,
    UnknownObjectUnownedRetain,
    UnknownObjectUnownedRelease,
    /// `(dest, src)`
    WeakCopyInit,
    WeakTakeInit,
    WeakDestroy,
    WeakCopyAssign,
    WeakTakeAssign,
    UnknownObjectWeakCopyInit,
    UnknownObjectWeakTakeInit,
    UnknownObjectWeakDestroy,
    UnknownObjectWeakCopyAssign,
    UnknownObjectWeakTakeAssign,
    /// `(metadata) -> box`; the value lives in the box after the header.
    AllocBox,
    /// `(box, allocated size, alignment mask)`
    DeallocBox,
    /// `(buffer, metadata, alignment mask) -> box`
    MakeBoxUnique,
    /// `(metadata, runtime value, static value, byte count, description)`
    VerifyTypeLayoutAttribute,
}

impl RuntimeFn {
    pub const ALL: [RuntimeFn; 32] = [
        Self::GetTypeMetadata,
        Self::GetGenericMetadata,
        Self::Retain,
        Self::Release,
        Self::UnknownObjectRetain,
        Self::UnknownObjectRelease,
        Self::BridgeObjectRetain,
        Self::BridgeObjectRelease,
        Self::BlockRetain,
        Self::BlockRelease,
        Self::ObjCRetain,
        Self::ObjCRelease,
        Self::ErrorRetain,
        Self::ErrorRelease,
        Self::UnownedRetain,
        Self::UnownedRelease,
        Self::UnknownObjectUnownedRetain,
        Self::UnknownObjectUnownedRelease,
        Self::WeakCopyInit,
        Self::WeakTakeInit,
        Self::WeakDestroy,
        Self::WeakCopyAssign,
        Self::WeakTakeAssign,
        Self::UnknownObjectWeakCopyInit,
        Self::UnknownObjectWeakTakeInit,
        Self::UnknownObjectWeakDestroy,
        Self::UnknownObjectWeakCopyAssign,
        Self::UnknownObjectWeakTakeAssign,
        Self::AllocBox,
        Self::DeallocBox,
        Self::MakeBoxUnique,
        Self::VerifyTypeLayoutAttribute,
    ];

    /// The entry point exported as `symbol`.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == symbol)
    }

    /// Strong retain of a heap object, by any refcounting flavor.
    pub fn is_strong_retain(self) -> bool {
        matches!(
            self,
            Self::Retain
                | Self::UnknownObjectRetain
                | Self::BridgeObjectRetain
                | Self::BlockRetain
                | Self::ObjCRetain
                | Self::ErrorRetain
        )
    }

    pub fn is_strong_release(self) -> bool {
        matches!(
            self,
            Self::Release
                | Self::UnknownObjectRelease
                | Self::BridgeObjectRelease
                | Self::BlockRelease
                | Self::ObjCRelease
                | Self::ErrorRelease
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetTypeMetadata => "keel_getTypeMetadata",
            Self::GetGenericMetadata => "keel_getGenericMetadata",
            Self::Retain => "keel_retain",
            Self::Release => "keel_release",
            Self::UnknownObjectRetain => "keel_unknownObjectRetain",
            Self::UnknownObjectRelease => "keel_unknownObjectRelease",
            Self::BridgeObjectRetain => "keel_bridgeObjectRetain",
            Self::BridgeObjectRelease => "keel_bridgeObjectRelease",
            Self::BlockRetain => "keel_blockRetain",
            Self::BlockRelease => "keel_blockRelease",
            Self::ObjCRetain => "keel_objcRetain",
            Self::ObjCRelease => "keel_objcRelease",
            Self::ErrorRetain => "keel_errorRetain",
            Self::ErrorRelease => "keel_errorRelease",
            Self::UnownedRetain => "keel_unownedRetain",
            Self::UnownedRelease => "keel_unownedRelease",
            Self::UnknownObjectUnownedRetain => "keel_unknownObjectUnownedRetain",
            Self::UnknownObjectUnownedRelease => "keel_unknownObjectUnownedRelease",
            Self::WeakCopyInit => "keel_weakCopyInit",
            Self::WeakTakeInit => "keel_weakTakeInit",
            Self::WeakDestroy => "keel_weakDestroy",
            Self::WeakCopyAssign => "keel_weakCopyAssign",
            Self::WeakTakeAssign => "keel_weakTakeAssign",
            Self::UnknownObjectWeakCopyInit => "keel_unknownObjectWeakCopyInit",
            Self::UnknownObjectWeakTakeInit => "keel_unknownObjectWeakTakeInit",
            Self::UnknownObjectWeakDestroy => "keel_unknownObjectWeakDestroy",
            Self::UnknownObjectWeakCopyAssign => "keel_unknownObjectWeakCopyAssign",
            Self::UnknownObjectWeakTakeAssign => "keel_unknownObjectWeakTakeAssign",
            Self::AllocBox => "keel_allocBox",
            Self::DeallocBox => "keel_deallocBox",
            Self::MakeBoxUnique => "keel_makeBoxUnique",
            Self::VerifyTypeLayoutAttribute => "keel_verifyTypeLayoutAttribute",
        }
    }

    fn signature(self) -> (&'static [Abi], Option<Abi>) {
        use Abi::{Ptr, Word, I32};
        match self {
            Self::GetTypeMetadata => (&[I32], Some(Ptr)),
            Self::GetGenericMetadata => (&[I32, Ptr, I32], Some(Ptr)),
            Self::Retain
            | Self::Release
            | Self::UnknownObjectRetain
            | Self::UnknownObjectRelease
            | Self::BridgeObjectRetain
            | Self::BridgeObjectRelease
            | Self::BlockRetain
            | Self::BlockRelease
            | Self::ObjCRetain
            | Self::ObjCRelease
            | Self::ErrorRetain
            | Self::ErrorRelease
            | Self::UnownedRetain
            | Self::UnownedRelease
            | Self::UnknownObjectUnownedRetain
            | Self::UnknownObjectUnownedRelease
            | Self::WeakDestroy
            | Self::UnknownObjectWeakDestroy => (&[Ptr], None),
            Self::WeakCopyInit
            | Self::WeakTakeInit
            | Self::WeakCopyAssign
            | Self::WeakTakeAssign
            | Self::UnknownObjectWeakCopyInit
            | Self::UnknownObjectWeakTakeInit
            | Self::UnknownObjectWeakCopyAssign
            | Self::UnknownObjectWeakTakeAssign => (&[Ptr, Ptr], None),
            Self::AllocBox => (&[Ptr], Some(Ptr)),
            Self::DeallocBox => (&[Ptr, Word, Word], None),
            Self::MakeBoxUnique => (&[Ptr, Ptr, Word], Some(Ptr)),
            Self::VerifyTypeLayoutAttribute => (&[Ptr, Ptr, Ptr, Word, Ptr], None),
        }
    }

    pub(crate) fn fn_type(self, types: &mut TypeTable) -> TypeId {
        let (params, ret) = self.signature();
        lower_signature(types, params, ret)
    }
}

// ---------------------------------------------------------------------------
// Value witness table
// ---------------------------------------------------------------------------

/// A field of the value witness table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueWitness {
    /// `(dest buffer, src buffer, M) -> object`
    InitializeBufferWithCopyOfBuffer,
    /// `(object, M)`
    Destroy,
    /// `(dest, src, M) -> dest`
    InitializeWithCopy,
    AssignWithCopy,
    InitializeWithTake,
    AssignWithTake,
    /// `(object, empty cases: i32, M) -> tag: i32`
    GetEnumTagSinglePayload,
    /// `(object, tag: i32, empty cases: i32, M)`
    StoreEnumTagSinglePayload,
    Size,
    Stride,
    Flags,
    ExtraInhabitantCount,
    /// `(object, M) -> tag: i32`
    GetEnumTag,
    /// `(object, M)`
    DestructiveProjectEnumData,
    /// `(object, tag: i32, M)`
    DestructiveInjectEnumTag,
}

impl ValueWitness {
    pub const FUNCTIONS: [ValueWitness; 11] = [
        Self::InitializeBufferWithCopyOfBuffer,
        Self::Destroy,
        Self::InitializeWithCopy,
        Self::AssignWithCopy,
        Self::InitializeWithTake,
        Self::AssignWithTake,
        Self::GetEnumTagSinglePayload,
        Self::StoreEnumTagSinglePayload,
        Self::GetEnumTag,
        Self::DestructiveProjectEnumData,
        Self::DestructiveInjectEnumTag,
    ];

    /// Byte offset of the field from the start of the table.
    pub fn offset(self, pointer_size: u64) -> u64 {
        let enum_base = 10 * pointer_size + 8;
        match self {
            Self::InitializeBufferWithCopyOfBuffer => 0,
            Self::Destroy => pointer_size,
            Self::InitializeWithCopy => 2 * pointer_size,
            Self::AssignWithCopy => 3 * pointer_size,
            Self::InitializeWithTake => 4 * pointer_size,
            Self::AssignWithTake => 5 * pointer_size,
            Self::GetEnumTagSinglePayload => 6 * pointer_size,
            Self::StoreEnumTagSinglePayload => 7 * pointer_size,
            Self::Size => 8 * pointer_size,
            Self::Stride => 9 * pointer_size,
            Self::Flags => 10 * pointer_size,
            Self::ExtraInhabitantCount => 10 * pointer_size + 4,
            Self::GetEnumTag => enum_base,
            Self::DestructiveProjectEnumData => enum_base + pointer_size,
            Self::DestructiveInjectEnumTag => enum_base + 2 * pointer_size,
        }
    }

    /// Size of a table, with or without the enum witnesses.
    pub fn table_size(pointer_size: u64, with_enum_witnesses: bool) -> u64 {
        let base = 10 * pointer_size + 8;
        if with_enum_witnesses {
            base + 3 * pointer_size
        } else {
            base
        }
    }

    pub fn is_function(self) -> bool {
        !matches!(
            self,
            Self::Size | Self::Stride | Self::Flags | Self::ExtraInhabitantCount
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InitializeBufferWithCopyOfBuffer => "initializeBufferWithCopyOfBuffer",
            Self::Destroy => "destroy",
            Self::InitializeWithCopy => "initializeWithCopy",
            Self::AssignWithCopy => "assignWithCopy",
            Self::InitializeWithTake => "initializeWithTake",
            Self::AssignWithTake => "assignWithTake",
            Self::GetEnumTagSinglePayload => "getEnumTagSinglePayload",
            Self::StoreEnumTagSinglePayload => "storeEnumTagSinglePayload",
            Self::Size => "size",
            Self::Stride => "stride",
            Self::Flags => "flags",
            Self::ExtraInhabitantCount => "extraInhabitantCount",
            Self::GetEnumTag => "getEnumTag",
            Self::DestructiveProjectEnumData => "destructiveProjectEnumData",
            Self::DestructiveInjectEnumTag => "destructiveInjectEnumTag",
        }
    }

    fn signature(self) -> (&'static [Abi], Option<Abi>) {
        use Abi::{Ptr, I32};
        match self {
            Self::InitializeBufferWithCopyOfBuffer
            | Self::InitializeWithCopy
            | Self::AssignWithCopy
            | Self::InitializeWithTake
            | Self::AssignWithTake => (&[Ptr, Ptr, Ptr], Some(Ptr)),
            Self::Destroy | Self::DestructiveProjectEnumData => (&[Ptr, Ptr], None),
            Self::GetEnumTagSinglePayload => (&[Ptr, I32, Ptr], Some(I32)),
            Self::StoreEnumTagSinglePayload => (&[Ptr, I32, I32, Ptr], None),
            Self::GetEnumTag => (&[Ptr, Ptr], Some(I32)),
            Self::DestructiveInjectEnumTag => (&[Ptr, I32, Ptr], None),
            Self::Size | Self::Stride | Self::Flags | Self::ExtraInhabitantCount => {
                panic!("{} is not a function witness", self.name())
            }
        }
    }

    pub(crate) fn fn_type(self, types: &mut TypeTable) -> TypeId {
        let (params, ret) = self.signature();
        lower_signature(types, params, ret)
    }
}

bitflags! {
    /// The `flags` field of a value witness table.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ValueWitnessFlags: u32 {
        const ALIGNMENT_MASK = 0x0000_00ff;
        const IS_NON_POD = 0x0001_0000;
        const IS_NON_INLINE = 0x0002_0000;
        const IS_NON_BITWISE_TAKABLE = 0x0010_0000;
        const HAS_ENUM_WITNESSES = 0x0020_0000;
    }
}

impl ValueWitnessFlags {
    /// Flags for a type with the given properties.
    pub fn for_layout(alignment_mask: u64, pod: bool, inline: bool, bitwise_takable: bool) -> Self {
        assert!(alignment_mask <= 0xff, "alignment mask {alignment_mask:#x} does not fit the flags");
        let mut flags = Self::from_bits_retain(alignment_mask as u32);
        flags.set(Self::IS_NON_POD, !pod);
        flags.set(Self::IS_NON_INLINE, !inline);
        flags.set(Self::IS_NON_BITWISE_TAKABLE, !bitwise_takable);
        flags
    }

    pub fn alignment_mask(self) -> u64 {
        u64::from(self.bits() & Self::ALIGNMENT_MASK.bits())
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

impl IrGenFunction<'_> {
    /// The declaration of `function`, added to the module on first use.
    pub fn runtime_fn(&mut self, function: RuntimeFn) -> FunctionId {
        if let Some(id) = self.state().runtime.get(&function) {
            return *id;
        }
        let module = self.builder.module_mut();
        let fn_ty = function.fn_type(module.types_mut());
        let id = module.get_or_declare_function(function.name(), fn_ty);
        self.state_mut().runtime.insert(function, id);
        id
    }

    pub fn call_runtime(&mut self, function: RuntimeFn, args: &[ValueId]) -> ValueId {
        let id = self.runtime_fn(function);
        self.builder.call(id, args)
    }

    // -- Type metadata --

    /// Type metadata of `ty`. Archetypes must have been bound with
    /// [`IrGenFunction::bind_metadata`].
    pub fn emit_type_metadata(&mut self, ty: TypeRef) -> ValueId {
        if let Some(metadata) = self.cached_metadata(ty) {
            return metadata;
        }
        let desc = self.types().get(ty).clone();
        let index = self.builder.const_i32(ty.raw());
        let metadata = match &desc {
            TypeDesc::Archetype { name } => {
                panic!("no metadata bound for archetype {name}")
            }
            _ if desc.nominal().is_some_and(|n| !n.generic_args.is_empty()) => {
                let args = desc
                    .nominal()
                    .map(|n| n.generic_args.to_vec())
                    .unwrap_or_default();
                self.emit_generic_metadata(index, &args)
            }
            _ if self.types().has_archetype(ty) => {
                let args = self.types().archetypes_of(ty);
                self.emit_generic_metadata(index, &args)
            }
            _ => self.call_runtime(RuntimeFn::GetTypeMetadata, &[index]),
        };
        self.cache_metadata(ty, metadata);
        metadata
    }

    fn emit_generic_metadata(&mut self, index: ValueId, args: &[TypeRef]) -> ValueId {
        let pointer_size = self.pointer_size();
        let ptr = self.builder.ptr_type();
        let count = args.len() as u64;
        let array_ty = self.builder.module_mut().types_mut().array(ptr, count.max(1));
        let buffer = self.builder.alloca(array_ty, pointer_size, "generic.args");
        for (i, arg) in args.iter().enumerate() {
            let metadata = self.emit_type_metadata(*arg);
            let slot = self.builder.byte_offset_const(buffer, i as u64 * pointer_size);
            self.builder.store(metadata, slot, pointer_size);
        }
        let count = self.builder.const_i32(args.len() as u32);
        self.call_runtime(RuntimeFn::GetGenericMetadata, &[index, buffer, count])
    }

    // -- Value witnesses --

    pub fn emit_load_value_witness_table(&mut self, metadata: ValueId) -> ValueId {
        let pointer_size = self.pointer_size();
        let ptr = self.builder.ptr_type();
        self.builder.load(ptr, metadata, pointer_size)
    }

    /// Load a non-function field of the value witness table of `metadata`.
    /// Size and stride are words; flags and extra inhabitant count are `i32`.
    pub fn emit_load_value_witness(&mut self, metadata: ValueId, witness: ValueWitness) -> ValueId {
        assert!(!witness.is_function(), "{} is a function witness", witness.name());
        let pointer_size = self.pointer_size();
        let table = self.emit_load_value_witness_table(metadata);
        let slot = self.builder.byte_offset_const(table, witness.offset(pointer_size));
        match witness {
            ValueWitness::Size | ValueWitness::Stride => {
                let word = self.builder.size_type();
                self.builder.load(word, slot, pointer_size)
            }
            _ => {
                let i32_ty = self.builder.i32_type();
                self.builder.load(i32_ty, slot, 4)
            }
        }
    }

    /// Call the function witness `witness` of `metadata`, appending the
    /// metadata to `args`.
    pub fn emit_call_value_witness(
        &mut self,
        metadata: ValueId,
        witness: ValueWitness,
        args: &[ValueId],
    ) -> ValueId {
        assert!(witness.is_function(), "{} is not a function witness", witness.name());
        let pointer_size = self.pointer_size();
        let table = self.emit_load_value_witness_table(metadata);
        let slot = self.builder.byte_offset_const(table, witness.offset(pointer_size));
        let ptr = self.builder.ptr_type();
        let function = self.builder.load(ptr, slot, pointer_size);
        let fn_ty = witness.fn_type(self.builder.module_mut().types_mut());
        let mut all: Vec<ValueId> = args.to_vec();
        all.push(metadata);
        self.builder.call_indirect(fn_ty, function, &all)
    }

    pub fn emit_load_size(&mut self, metadata: ValueId) -> ValueId {
        self.emit_load_value_witness(metadata, ValueWitness::Size)
    }

    pub fn emit_load_stride(&mut self, metadata: ValueId) -> ValueId {
        self.emit_load_value_witness(metadata, ValueWitness::Stride)
    }

    /// The alignment mask of `metadata` as a word.
    pub fn emit_load_alignment_mask(&mut self, metadata: ValueId) -> ValueId {
        let flags = self.emit_load_value_witness(metadata, ValueWitness::Flags);
        let mask = self.builder.const_i32(ValueWitnessFlags::ALIGNMENT_MASK.bits());
        let masked = self.builder.and(flags, mask);
        let word = self.builder.size_type();
        self.builder.zext(masked, word)
    }

    /// Extra inhabitant count of `metadata` as an `i32`.
    pub fn emit_load_extra_inhabitant_count(&mut self, metadata: ValueId) -> ValueId {
        self.emit_load_value_witness(metadata, ValueWitness::ExtraInhabitantCount)
    }

    fn emit_flag_clear(&mut self, metadata: ValueId, flag: ValueWitnessFlags) -> ValueId {
        let flags = self.emit_load_value_witness(metadata, ValueWitness::Flags);
        let bit = self.builder.const_i32(flag.bits());
        let masked = self.builder.and(flags, bit);
        let zero = self.builder.const_i32(0);
        self.builder.icmp_eq(masked, zero)
    }

    /// True if values of `metadata` fit the inline existential buffer.
    pub fn emit_load_is_inline(&mut self, metadata: ValueId) -> ValueId {
        self.emit_flag_clear(metadata, ValueWitnessFlags::IS_NON_INLINE)
    }

    pub fn emit_load_is_bitwise_takable(&mut self, metadata: ValueId) -> ValueId {
        self.emit_flag_clear(metadata, ValueWitnessFlags::IS_NON_BITWISE_TAKABLE)
    }

    pub fn emit_load_is_pod(&mut self, metadata: ValueId) -> ValueId {
        self.emit_flag_clear(metadata, ValueWitnessFlags::IS_NON_POD)
    }
}
