//! Building layout entries from types.

use smallvec::SmallVec;

use super::{LayoutId, ScalarKind, TypeInfoKind, TypeLayoutEntry};
use crate::context::{IrGenFunction, LayoutContext, LayoutState};
use crate::existential::ExistentialRepresentation;
use crate::type_info::FixedTypeInfo;
use crate::types::{Ownership, ReferenceCounting, StorageKind, TypeDesc, TypeRef};

fn scalar(ty: TypeRef, kind: ScalarKind, info: FixedTypeInfo) -> TypeLayoutEntry {
    TypeLayoutEntry::Scalar { ty, kind, info }
}

impl LayoutState {
    /// The layout entry of `ty`, built and cached on first request.
    pub(crate) fn type_layout(&mut self, ty: TypeRef) -> LayoutId {
        if let Some(id) = self.layouts.lookup_type(ty) {
            return id;
        }
        let entry = self.lower(ty);
        let id = self.layouts.intern(entry, &self.target);
        self.layouts.record_type(ty, id);
        id
    }

    fn lower(&mut self, ty: TypeRef) -> TypeLayoutEntry {
        let target = self.target.clone();
        let desc = self.types.get(ty).clone();
        match desc {
            TypeDesc::Int { bits } => scalar(
                ty,
                ScalarKind::TriviallyDestroyable,
                FixedTypeInfo::integer(bits, &target),
            ),
            TypeDesc::RawPointer | TypeDesc::Metatype | TypeDesc::Function { thick: false } => scalar(
                ty,
                ScalarKind::TriviallyDestroyable,
                FixedTypeInfo::heap_pointer(&target, 1, true, true),
            ),
            TypeDesc::Function { thick: true } => scalar(
                ty,
                ScalarKind::ThickFunc,
                FixedTypeInfo::heap_pointer(&target, 2, false, true),
            ),
            TypeDesc::Reference { counting, ownership } => self.lower_reference(ty, counting, ownership),
            TypeDesc::Struct { nominal, fields } => {
                if nominal.resilient {
                    return self.resilient(ty);
                }
                self.group(&fields)
            }
            TypeDesc::Tuple { elements } => self.group(&elements),
            TypeDesc::Enum { nominal, cases } => {
                if nominal.resilient {
                    return self.resilient(ty);
                }
                let num_empty_cases = cases.iter().filter(|c| c.payload.is_none()).count();
                let cases = cases
                    .iter()
                    .filter_map(|c| c.payload)
                    .map(|payload| self.type_layout(payload))
                    .collect();
                TypeLayoutEntry::Enum {
                    num_empty_cases: u32::try_from(num_empty_cases)
                        .unwrap_or_else(|_| panic!("enum with {num_empty_cases} cases")),
                    min_align: 1,
                    cases,
                }
            }
            TypeDesc::Archetype { .. } => TypeLayoutEntry::Archetype { ty },
            TypeDesc::FixedArray { count: 0, .. } => TypeLayoutEntry::Empty,
            TypeDesc::FixedArray { element, count } => TypeLayoutEntry::Array {
                element: self.type_layout(element),
                count,
            },
            TypeDesc::Existential { protocols } => {
                let layout = self.existentials.layout(&protocols);
                let info = layout.type_info(&target);
                match layout.representation {
                    ExistentialRepresentation::Error => scalar(ty, ScalarKind::ErrorReference, info),
                    ExistentialRepresentation::Class => scalar(
                        ty,
                        ScalarKind::ExistentialReference {
                            num_tables: layout.num_tables,
                        },
                        info,
                    ),
                    ExistentialRepresentation::Opaque => TypeLayoutEntry::TypeInfoBased {
                        ty,
                        info,
                        kind: TypeInfoKind::OpaqueExistential {
                            num_tables: layout.num_tables,
                        },
                    },
                }
            }
            TypeDesc::Foreign {
                size, align, trivial, ..
            } => TypeLayoutEntry::TypeInfoBased {
                ty,
                info: FixedTypeInfo::opaque(size, align, trivial, true),
                kind: TypeInfoKind::Foreign,
            },
            TypeDesc::Storage { kind, size, align } => {
                let (scalar_kind, takable) = match kind {
                    StorageKind::Immovable => (ScalarKind::Immovable, false),
                    StorageKind::BlockStorage => (ScalarKind::BlockStorage, true),
                };
                scalar(ty, scalar_kind, FixedTypeInfo::opaque(size, align, true, takable))
            }
        }
    }

    fn lower_reference(&self, ty: TypeRef, counting: ReferenceCounting, ownership: Ownership) -> TypeLayoutEntry {
        let target = &self.target;
        let ptr = target.pointer_size();
        let pointer = || FixedTypeInfo::heap_pointer(target, 1, false, true);
        match ownership {
            Ownership::Strong => {
                let kind = match counting {
                    ReferenceCounting::Native => ScalarKind::NativeStrongReference,
                    ReferenceCounting::Unknown => ScalarKind::UnknownReference,
                    ReferenceCounting::Block => ScalarKind::BlockReference,
                    ReferenceCounting::Bridge => ScalarKind::BridgeReference,
                    ReferenceCounting::ObjC => ScalarKind::ObjCReference,
                    ReferenceCounting::Error => ScalarKind::ErrorReference,
                    ReferenceCounting::Custom => {
                        return scalar(
                            ty,
                            ScalarKind::CustomReference,
                            FixedTypeInfo::opaque(ptr, ptr, false, true),
                        );
                    }
                };
                scalar(ty, kind, pointer())
            }
            Ownership::Unowned if counting == ReferenceCounting::Native => {
                scalar(ty, ScalarKind::NativeUnownedReference, pointer())
            }
            // Unknown unowned references are registered with the runtime
            // and cannot move with a memory copy.
            Ownership::Unowned => scalar(
                ty,
                ScalarKind::UnknownUnownedReference,
                FixedTypeInfo::opaque(ptr, ptr, false, false),
            ),
            Ownership::Weak => {
                let kind = if counting == ReferenceCounting::Native {
                    ScalarKind::NativeWeakReference
                } else {
                    ScalarKind::UnknownWeakReference
                };
                scalar(ty, kind, FixedTypeInfo::opaque(ptr, ptr, false, false))
            }
        }
    }

    fn group(&mut self, fields: &[TypeRef]) -> TypeLayoutEntry {
        if fields.is_empty() {
            return TypeLayoutEntry::Empty;
        }
        let children: SmallVec<[LayoutId; 4]> = fields.iter().map(|f| self.type_layout(*f)).collect();
        TypeLayoutEntry::AlignedGroup { children, min_align: 1 }
    }

    fn resilient(&self, ty: TypeRef) -> TypeLayoutEntry {
        TypeLayoutEntry::Resilient {
            ty,
            dependent: self.types.has_archetype(ty),
        }
    }
}

impl LayoutContext {
    /// The layout entry of `ty`.
    pub fn type_layout(&mut self, ty: TypeRef) -> LayoutId {
        let (_, state) = self.parts();
        state.type_layout(ty)
    }
}

impl IrGenFunction<'_> {
    pub fn type_layout(&mut self, ty: TypeRef) -> LayoutId {
        self.state_mut().type_layout(ty)
    }
}
