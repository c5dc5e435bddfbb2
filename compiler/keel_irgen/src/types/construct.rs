//! Convenience constructors for common type shapes.

use smallvec::SmallVec;

use super::{
    EnumCase, Nominal, Ownership, Protocol, ReferenceCounting, StorageKind, TypeDesc, TypePool,
    TypeRef,
};

impl TypePool {
    pub fn int(&mut self, bits: u32) -> TypeRef {
        assert!(bits > 0, "zero-width integer type");
        self.intern(TypeDesc::Int { bits })
    }

    pub fn bool(&mut self) -> TypeRef {
        self.int(1)
    }

    pub fn raw_pointer(&mut self) -> TypeRef {
        self.intern(TypeDesc::RawPointer)
    }

    pub fn metatype(&mut self) -> TypeRef {
        self.intern(TypeDesc::Metatype)
    }

    /// A strong native class reference.
    pub fn native_ref(&mut self) -> TypeRef {
        self.reference(ReferenceCounting::Native, Ownership::Strong)
    }

    pub fn reference(&mut self, counting: ReferenceCounting, ownership: Ownership) -> TypeRef {
        self.intern(TypeDesc::Reference {
            counting,
            ownership,
        })
    }

    pub fn function(&mut self, thick: bool) -> TypeRef {
        self.intern(TypeDesc::Function { thick })
    }

    pub fn struct_type(&mut self, name: &str, fields: &[TypeRef]) -> TypeRef {
        self.intern(TypeDesc::Struct {
            nominal: nominal(name, false, &[]),
            fields: fields.iter().copied().collect(),
        })
    }

    /// A struct from another resilience domain; `fields` is what this module
    /// knows of it and is never used for layout.
    pub fn resilient_struct(&mut self, name: &str, generic_args: &[TypeRef]) -> TypeRef {
        self.intern(TypeDesc::Struct {
            nominal: nominal(name, true, generic_args),
            fields: SmallVec::new(),
        })
    }

    pub fn tuple(&mut self, elements: &[TypeRef]) -> TypeRef {
        self.intern(TypeDesc::Tuple {
            elements: elements.iter().copied().collect(),
        })
    }

    /// An enum from `(case name, payload)` pairs in declaration order.
    pub fn enum_type(&mut self, name: &str, cases: &[(&str, Option<TypeRef>)]) -> TypeRef {
        self.intern(TypeDesc::Enum {
            nominal: nominal(name, false, &[]),
            cases: enum_cases(cases),
        })
    }

    pub fn resilient_enum(&mut self, name: &str, generic_args: &[TypeRef]) -> TypeRef {
        self.intern(TypeDesc::Enum {
            nominal: nominal(name, true, generic_args),
            cases: Vec::new(),
        })
    }

    /// `Optional<T>`: one payload case and one empty case.
    pub fn optional(&mut self, wrapped: TypeRef) -> TypeRef {
        let name = format!("Optional<{}>", self.display(wrapped));
        self.enum_type(&name, &[("some", Some(wrapped)), ("none", None)])
    }

    pub fn archetype(&mut self, name: &str) -> TypeRef {
        self.intern(TypeDesc::Archetype {
            name: name.to_string(),
        })
    }

    pub fn fixed_array(&mut self, element: TypeRef, count: u64) -> TypeRef {
        self.intern(TypeDesc::FixedArray { element, count })
    }

    pub fn existential(&mut self, protocols: &[Protocol]) -> TypeRef {
        self.intern(TypeDesc::Existential {
            protocols: protocols.to_vec(),
        })
    }

    pub fn foreign(&mut self, name: &str, size: u64, align: u64, trivial: bool) -> TypeRef {
        assert!(align.is_power_of_two(), "foreign type {name} has alignment {align}");
        self.intern(TypeDesc::Foreign {
            name: name.to_string(),
            size,
            align,
            trivial,
        })
    }

    pub fn storage(&mut self, kind: StorageKind, size: u64, align: u64) -> TypeRef {
        assert!(align.is_power_of_two(), "storage alignment {align}");
        self.intern(TypeDesc::Storage { kind, size, align })
    }
}

fn nominal(name: &str, resilient: bool, generic_args: &[TypeRef]) -> Nominal {
    Nominal {
        name: name.to_string(),
        resilient,
        generic_args: generic_args.iter().copied().collect(),
    }
}

fn enum_cases(cases: &[(&str, Option<TypeRef>)]) -> Vec<EnumCase> {
    cases
        .iter()
        .map(|(name, payload)| EnumCase {
            name: (*name).to_string(),
            payload: *payload,
        })
        .collect()
}
