//! The type layout entry tree.
//!
//! A [`TypeLayoutEntry`] describes how a type's value is laid out in memory
//! independently of the type itself: two structs with the same field layouts
//! share an entry. Entries are interned in the [`TypeLayoutCache`] of a
//! [`LayoutContext`](crate::LayoutContext) and addressed by [`LayoutId`];
//! they are never mutated or freed before the cache is dropped.
//!
//! Properties that depend only on the tree ([`LayoutFlags`], the fixed size,
//! alignment and extra-inhabitant count) are computed once, bottom-up, when
//! an entry is interned. Operations that emit code are methods on
//! [`LayoutId`] taking the [`IrGenFunction`](crate::IrGenFunction) to emit
//! into:
//!
//! - `queries`: size, alignment and extra-inhabitant queries
//! - `ops`: copy, move and destroy
//! - `enums`: enum layout strategies and tag access
//! - `layout_string`: the runtime's layout bytecode
//!
//! Entries are built from types by `lower`.

mod enums;
pub mod layout_string;
mod lower;
mod ops;
mod queries;
mod tags;

use std::fmt;

use bitflags::bitflags;
use keel_bits::ApInt;
use keel_ir::{align_to, TargetConfig};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::type_info::{enum_tag_counts, place_bytes, FixedTypeInfo, MAX_EXTRA_INHABITANTS};
use crate::types::TypeRef;

pub use enums::CopyDestroyStrategy;
pub use layout_string::{LayoutStringReader, RefCountingKind};

/// Handle of an interned [`TypeLayoutEntry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LayoutId(u32);

impl LayoutId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// What a scalar leaf holds, which decides how it is copied and destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    TriviallyDestroyable,
    /// Address-sensitive storage; trivially destroyable but never moved.
    Immovable,
    ErrorReference,
    NativeStrongReference,
    NativeUnownedReference,
    NativeWeakReference,
    UnknownReference,
    UnknownUnownedReference,
    UnknownWeakReference,
    BlockReference,
    BridgeReference,
    ObjCReference,
    BlockStorage,
    /// A function pointer and a native refcounted context.
    ThickFunc,
    /// A class existential: an instance pointer and witness tables.
    ExistentialReference { num_tables: u32 },
    /// Copied and destroyed through the type's value witnesses.
    CustomReference,
}

impl ScalarKind {
    pub fn is_trivially_destroyable(self) -> bool {
        matches!(self, Self::TriviallyDestroyable | Self::Immovable | Self::BlockStorage)
    }

    /// True for kinds whose value is one pointer that retain and release
    /// accept, null included.
    pub fn is_single_retainable_pointer(self) -> bool {
        matches!(
            self,
            Self::ErrorReference
                | Self::NativeStrongReference
                | Self::UnknownReference
                | Self::BlockReference
                | Self::BridgeReference
                | Self::ObjCReference
                | Self::ExistentialReference { num_tables: 0 }
        )
    }
}

/// Entries whose operations go through value witnesses but whose layout is
/// fixed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeInfoKind {
    /// A type defined by a foreign module.
    Foreign,
    /// An opaque existential container with `num_tables` witness tables.
    OpaqueExistential { num_tables: u32 },
}

/// One node of the layout tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeLayoutEntry {
    /// No storage.
    Empty,
    Scalar {
        ty: TypeRef,
        kind: ScalarKind,
        info: FixedTypeInfo,
    },
    /// An unsubstituted generic parameter.
    Archetype { ty: TypeRef },
    /// A struct or tuple.
    AlignedGroup {
        children: SmallVec<[LayoutId; 4]>,
        min_align: u64,
    },
    /// A type whose layout is only known at run time. `dependent` if its
    /// metadata depends on generic parameters.
    Resilient { ty: TypeRef, dependent: bool },
    Enum {
        num_empty_cases: u32,
        min_align: u64,
        /// Payload cases, in declaration order.
        cases: SmallVec<[LayoutId; 4]>,
    },
    TypeInfoBased {
        ty: TypeRef,
        info: FixedTypeInfo,
        kind: TypeInfoKind,
    },
    Array { element: LayoutId, count: u64 },
}

impl TypeLayoutEntry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Scalar { .. } => "scalar",
            Self::Archetype { .. } => "archetype",
            Self::AlignedGroup { .. } => "aligned group",
            Self::Resilient { .. } => "resilient",
            Self::Enum { .. } => "enum",
            Self::TypeInfoBased { .. } => "type info based",
            Self::Array { .. } => "array",
        }
    }

    /// The type whose metadata drives value witness calls, if any.
    pub fn metadata_type(&self) -> Option<TypeRef> {
        match self {
            Self::Archetype { ty } | Self::Resilient { ty, .. } => Some(*ty),
            Self::Scalar {
                ty,
                kind: ScalarKind::CustomReference,
                ..
            }
            | Self::TypeInfoBased {
                ty,
                kind: TypeInfoKind::Foreign,
                ..
            } => Some(*ty),
            _ => None,
        }
    }
}

bitflags! {
    /// Properties of an entry and everything below it.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct LayoutFlags: u8 {
        const HAS_ARCHETYPE_FIELD = 1 << 0;
        const HAS_RESILIENT_FIELD = 1 << 1;
        /// A resilient field whose metadata depends on generic parameters.
        const HAS_DEPENDENT_RESILIENT_FIELD = 1 << 2;
        const TRIVIALLY_DESTROYABLE = 1 << 3;
        const BITWISE_TAKABLE = 1 << 4;
        const SINGLE_RETAINABLE_POINTER = 1 << 5;
    }
}

impl LayoutFlags {
    /// Flags inherited from children: any archetype or resilient field
    /// below, and the value properties only if every child has them.
    fn inherit<I: IntoIterator<Item = LayoutFlags>>(children: I) -> LayoutFlags {
        let field_flags =
            Self::HAS_ARCHETYPE_FIELD | Self::HAS_RESILIENT_FIELD | Self::HAS_DEPENDENT_RESILIENT_FIELD;
        let mut any = Self::empty();
        let mut all = Self::TRIVIALLY_DESTROYABLE | Self::BITWISE_TAKABLE;
        for flags in children {
            any |= flags & field_flags;
            all &= flags;
        }
        any | all
    }
}

/// Static layout of an entry whose size is known at compile time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FixedLayout {
    pub size: u64,
    pub align: u64,
    pub extra_inhabitants: u32,
}

impl FixedLayout {
    const EMPTY: FixedLayout = FixedLayout {
        size: 0,
        align: 1,
        extra_inhabitants: 0,
    };

    pub fn stride(&self) -> u64 {
        align_to(self.size, self.align).max(1)
    }
}

#[derive(Clone, Debug)]
struct Interned {
    entry: TypeLayoutEntry,
    flags: LayoutFlags,
    fixed: Option<FixedLayout>,
}

/// Interner and arena of [`TypeLayoutEntry`]s for one compilation unit.
#[derive(Debug, Default)]
pub struct TypeLayoutCache {
    entries: Vec<Interned>,
    ids: FxHashMap<TypeLayoutEntry, LayoutId>,
    by_type: FxHashMap<TypeRef, LayoutId>,
}

impl TypeLayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, id: LayoutId) -> &TypeLayoutEntry {
        &self.entries[id.index()].entry
    }

    #[inline]
    pub fn flags(&self, id: LayoutId) -> LayoutFlags {
        self.entries[id.index()].flags
    }

    /// The entry already built for `ty`, if any.
    pub fn lookup_type(&self, ty: TypeRef) -> Option<LayoutId> {
        self.by_type.get(&ty).copied()
    }

    pub(crate) fn record_type(&mut self, ty: TypeRef, id: LayoutId) {
        self.by_type.insert(ty, id);
    }

    /// Intern `entry`, computing its properties on first sight.
    pub fn intern(&mut self, entry: TypeLayoutEntry, target: &TargetConfig) -> LayoutId {
        if let Some(id) = self.ids.get(&entry) {
            return *id;
        }
        let flags = self.compute_properties(&entry);
        let fixed = self.compute_fixed_layout(&entry, target);
        let id = LayoutId(u32::try_from(self.entries.len()).unwrap_or_else(|_| panic!("layout cache overflow")));
        tracing::debug!(
            %id,
            kind = entry.kind_name(),
            size = fixed.map(|f| f.size),
            ?flags,
            "interned layout entry"
        );
        self.entries.push(Interned {
            entry: entry.clone(),
            flags,
            fixed,
        });
        self.ids.insert(entry, id);
        id
    }

    fn compute_properties(&self, entry: &TypeLayoutEntry) -> LayoutFlags {
        match entry {
            TypeLayoutEntry::Empty => LayoutFlags::TRIVIALLY_DESTROYABLE | LayoutFlags::BITWISE_TAKABLE,
            TypeLayoutEntry::Scalar { kind, info, .. } => {
                let mut flags = LayoutFlags::empty();
                flags.set(LayoutFlags::TRIVIALLY_DESTROYABLE, info.is_trivially_destroyable());
                flags.set(LayoutFlags::BITWISE_TAKABLE, info.is_bitwise_takable());
                flags.set(
                    LayoutFlags::SINGLE_RETAINABLE_POINTER,
                    kind.is_single_retainable_pointer(),
                );
                flags
            }
            TypeLayoutEntry::TypeInfoBased { info, .. } => {
                let mut flags = LayoutFlags::empty();
                flags.set(LayoutFlags::TRIVIALLY_DESTROYABLE, info.is_trivially_destroyable());
                flags.set(LayoutFlags::BITWISE_TAKABLE, info.is_bitwise_takable());
                flags
            }
            // Archetypes may be bound to anything. Trivial archetypes are not
            // distinguished.
            TypeLayoutEntry::Archetype { .. } => LayoutFlags::HAS_ARCHETYPE_FIELD,
            TypeLayoutEntry::Resilient { dependent, .. } => {
                let mut flags = LayoutFlags::HAS_RESILIENT_FIELD;
                flags.set(LayoutFlags::HAS_DEPENDENT_RESILIENT_FIELD, *dependent);
                flags
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let mut flags = LayoutFlags::inherit(children.iter().map(|c| self.flags(*c)));
                if let [only] = children.as_slice() {
                    flags |= self.flags(*only) & LayoutFlags::SINGLE_RETAINABLE_POINTER;
                }
                flags
            }
            TypeLayoutEntry::Enum { cases, .. } => LayoutFlags::inherit(cases.iter().map(|c| self.flags(*c))),
            TypeLayoutEntry::Array { element, .. } => {
                LayoutFlags::inherit([self.flags(*element)]) & !LayoutFlags::SINGLE_RETAINABLE_POINTER
            }
        }
    }

    fn compute_fixed_layout(&self, entry: &TypeLayoutEntry, target: &TargetConfig) -> Option<FixedLayout> {
        match entry {
            TypeLayoutEntry::Empty => Some(FixedLayout::EMPTY),
            TypeLayoutEntry::Scalar { info, .. } | TypeLayoutEntry::TypeInfoBased { info, .. } => {
                Some(FixedLayout {
                    size: info.size(),
                    align: info.align(),
                    extra_inhabitants: info.extra_inhabitant_count(target),
                })
            }
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => None,
            TypeLayoutEntry::AlignedGroup { children, min_align } => {
                let mut size = 0;
                let mut align = *min_align;
                let mut extra_inhabitants = 0;
                for child in children {
                    let layout = self.fixed_layout(*child)?;
                    size = align_to(size, layout.align) + layout.size;
                    align = align.max(layout.align);
                    extra_inhabitants = extra_inhabitants.max(layout.extra_inhabitants);
                }
                Some(FixedLayout {
                    size,
                    align,
                    extra_inhabitants,
                })
            }
            TypeLayoutEntry::Enum {
                num_empty_cases,
                min_align,
                cases,
            } => {
                let payloads = cases
                    .iter()
                    .map(|c| self.fixed_layout(*c))
                    .collect::<Option<SmallVec<[FixedLayout; 4]>>>()?;
                Some(fixed_enum_layout(*num_empty_cases, *min_align, &payloads))
            }
            TypeLayoutEntry::Array { element, count } => {
                let element = self.fixed_layout(*element)?;
                Some(FixedLayout {
                    size: element.stride() * count,
                    align: element.align,
                    extra_inhabitants: if *count > 0 { element.extra_inhabitants } else { 0 },
                })
            }
        }
    }

    // -- Static queries --

    pub fn fixed_layout(&self, id: LayoutId) -> Option<FixedLayout> {
        self.entries[id.index()].fixed
    }

    pub fn fixed_size(&self, id: LayoutId) -> Option<u64> {
        self.fixed_layout(id).map(|l| l.size)
    }

    pub fn fixed_alignment(&self, id: LayoutId) -> Option<u64> {
        self.fixed_layout(id).map(|l| l.align)
    }

    pub fn fixed_xi_count(&self, id: LayoutId) -> Option<u32> {
        self.fixed_layout(id).map(|l| l.extra_inhabitants)
    }

    /// True iff nothing below is an archetype or resilient.
    pub fn is_fixed_size(&self, id: LayoutId) -> bool {
        self.fixed_layout(id).is_some()
    }

    pub fn is_trivially_destroyable(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::TRIVIALLY_DESTROYABLE)
    }

    /// True if the value is known to move with a plain memory copy.
    pub fn is_statically_bitwise_takable(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::BITWISE_TAKABLE)
    }

    pub fn is_single_retainable_pointer(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::SINGLE_RETAINABLE_POINTER)
    }

    pub fn contains_archetype_field(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::HAS_ARCHETYPE_FIELD)
    }

    pub fn contains_resilient_field(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::HAS_RESILIENT_FIELD)
    }

    pub fn contains_dependent_resilient_field(&self, id: LayoutId) -> bool {
        self.flags(id).contains(LayoutFlags::HAS_DEPENDENT_RESILIENT_FIELD)
    }

    /// True if the value witnesses of this layout can produce and recognize
    /// extra inhabitants up to `index`.
    pub fn can_value_witness_extra_inhabitants_up_to(&self, id: LayoutId, index: u32) -> bool {
        match self.get(id) {
            TypeLayoutEntry::Empty => false,
            TypeLayoutEntry::Scalar {
                kind: ScalarKind::ExistentialReference { .. },
                ..
            } => index == 0,
            TypeLayoutEntry::Scalar { .. } | TypeLayoutEntry::TypeInfoBased { .. } => {
                self.fixed_xi_count(id).is_some_and(|count| index < count)
            }
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => true,
            TypeLayoutEntry::AlignedGroup { children, .. } => self
                .static_extra_inhabitant_provider(children)
                .is_some_and(|(child, _)| self.can_value_witness_extra_inhabitants_up_to(child, index)),
            TypeLayoutEntry::Enum { .. } => self.fixed_xi_count(id).is_none_or(|count| index < count),
            TypeLayoutEntry::Array { element, .. } => {
                self.can_value_witness_extra_inhabitants_up_to(*element, index)
            }
        }
    }

    /// The child of a fixed group with the most extra inhabitants, first on
    /// ties, with its byte offset.
    pub(crate) fn static_extra_inhabitant_provider(&self, children: &[LayoutId]) -> Option<(LayoutId, u64)> {
        let mut best: Option<(LayoutId, u64, u32)> = None;
        let mut offset = 0;
        for child in children {
            let layout = self.fixed_layout(*child)?;
            offset = align_to(offset, layout.align);
            if best.is_none_or(|(_, _, count)| layout.extra_inhabitants > count) {
                best = Some((*child, offset, layout.extra_inhabitants));
            }
            offset += layout.size;
        }
        best.map(|(child, offset, _)| (child, offset))
    }

    /// Static byte offsets of the children of a fixed group.
    pub fn fixed_child_offsets(&self, children: &[LayoutId]) -> Option<SmallVec<[u64; 4]>> {
        let mut offset = 0;
        let mut offsets = SmallVec::new();
        for child in children {
            let layout = self.fixed_layout(*child)?;
            offset = align_to(offset, layout.align);
            offsets.push(offset);
            offset += layout.size;
        }
        Some(offsets)
    }

    // -- Extra inhabitant patterns --

    /// The bits that distinguish the extra inhabitants of a fixed layout, as
    /// an integer as wide as its storage in target byte order.
    pub fn fixed_extra_inhabitant_mask(&self, id: LayoutId, target: &TargetConfig) -> Option<ApInt> {
        let layout = self.fixed_layout(id)?;
        let endian = target.endianness();
        match self.get(id) {
            TypeLayoutEntry::Scalar { info, .. } | TypeLayoutEntry::TypeInfoBased { info, .. } => {
                Some(info.fixed_extra_inhabitant_mask(target))
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let (child, offset) = self.static_extra_inhabitant_provider(children)?;
                let mask = self.fixed_extra_inhabitant_mask(child, target)?;
                Some(place_bytes(&mask, offset, layout.size, endian))
            }
            TypeLayoutEntry::Array { element, .. } => {
                let mask = self.fixed_extra_inhabitant_mask(*element, target)?;
                Some(place_bytes(&mask, 0, layout.size, endian))
            }
            TypeLayoutEntry::Enum { cases, .. } => {
                let shape = enums::EnumShape::of(self, id)?;
                let tag_bytes = shape.tag_bytes_mask(layout.size, endian);
                let payload = match cases.as_slice() {
                    [payload] => {
                        let mask = self.fixed_extra_inhabitant_mask(*payload, target)?;
                        place_bytes(&mask, 0, layout.size, endian)
                    }
                    _ => ApInt::zero((layout.size * 8) as u32),
                };
                Some(&payload | &tag_bytes)
            }
            TypeLayoutEntry::Empty | TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => {
                Some(ApInt::zero((layout.size * 8) as u32))
            }
        }
    }

    /// Bit pattern of extra inhabitant `index` of a fixed layout.
    pub fn fixed_extra_inhabitant_value(&self, id: LayoutId, target: &TargetConfig, index: u32) -> Option<ApInt> {
        let layout = self.fixed_layout(id)?;
        assert!(
            index < layout.extra_inhabitants,
            "extra inhabitant {index} of a layout with {}",
            layout.extra_inhabitants
        );
        let endian = target.endianness();
        match self.get(id) {
            TypeLayoutEntry::Scalar { info, .. } | TypeLayoutEntry::TypeInfoBased { info, .. } => {
                Some(info.fixed_extra_inhabitant_value(target, index))
            }
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let (child, offset) = self.static_extra_inhabitant_provider(children)?;
                let value = self.fixed_extra_inhabitant_value(child, target, index)?;
                Some(place_bytes(&value, offset, layout.size, endian))
            }
            TypeLayoutEntry::Array { element, .. } => {
                let value = self.fixed_extra_inhabitant_value(*element, target, index)?;
                Some(place_bytes(&value, 0, layout.size, endian))
            }
            TypeLayoutEntry::Enum {
                num_empty_cases,
                cases,
                ..
            } => {
                let shape = enums::EnumShape::of(self, id)?;
                if let [payload] = cases.as_slice() {
                    let value = self.fixed_extra_inhabitant_value(*payload, target, index + num_empty_cases)?;
                    return Some(place_bytes(&value, 0, layout.size, endian));
                }
                let tag = ApInt::new((shape.tag_bytes * 8) as u32, shape.num_tags + u64::from(index));
                Some(place_bytes(&tag, shape.payload_size, layout.size, endian))
            }
            TypeLayoutEntry::Empty | TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => None,
        }
    }
}

/// Layout of a fixed enum from its payload layouts. Empty cases go into the
/// payload's extra inhabitants when there is one payload, and into tag
/// values after the payload area otherwise.
fn fixed_enum_layout(num_empty_cases: u32, min_align: u64, payloads: &[FixedLayout]) -> FixedLayout {
    let align = payloads.iter().map(|p| p.align).fold(min_align.max(1), u64::max);
    let empty = u64::from(num_empty_cases);
    if let [payload] = payloads {
        let xi = u64::from(payload.extra_inhabitants);
        let counts = enum_tag_counts(payload.size, empty.saturating_sub(xi), 1);
        return FixedLayout {
            size: payload.size + counts.num_tag_bytes,
            align,
            extra_inhabitants: payload.extra_inhabitants.saturating_sub(num_empty_cases),
        };
    }
    let payload_size = payloads.iter().map(|p| p.size).max().unwrap_or(0);
    let counts = enum_tag_counts(payload_size, empty, payloads.len() as u64);
    FixedLayout {
        size: payload_size + counts.num_tag_bytes,
        align,
        extra_inhabitants: tag_value_extra_inhabitants(counts.num_tag_bytes, counts.num_tags),
    }
}

/// Tag values an enum's tag bytes can hold beyond its `num_tags` tags.
fn tag_value_extra_inhabitants(num_tag_bytes: u64, num_tags: u64) -> u32 {
    if num_tag_bytes == 0 {
        return 0;
    }
    if num_tag_bytes >= 4 {
        return MAX_EXTRA_INHABITANTS;
    }
    let values = 1u64 << (num_tag_bytes * 8);
    values.saturating_sub(num_tags).min(u64::from(MAX_EXTRA_INHABITANTS)) as u32
}
