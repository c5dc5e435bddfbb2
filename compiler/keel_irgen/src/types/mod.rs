//! Type descriptors consumed by the layout engine.
//!
//! Upstream lowering hands the layout engine a resolved type graph. This
//! module models exactly the questions layout asks of it: is a type fixed,
//! generic or resilient, what are its fields, cases and elements, and what
//! nominal identity does it have. All types live in one [`TypePool`] and are
//! referenced by [`TypeRef`]; structurally identical types share a handle.

mod construct;

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Handle of an interned [`TypeDesc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeRef(u32);

impl TypeRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The raw index, which is also the type's metadata index at run time.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Refcounting flavor of a reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReferenceCounting {
    /// Native heap object.
    Native,
    /// Object of unknown provenance (native or foreign).
    Unknown,
    /// Block (closure) object.
    Block,
    /// Bridged object that may be a tagged value.
    Bridge,
    /// Foreign object runtime.
    ObjC,
    /// Boxed error value.
    Error,
    /// Retained and released through the type's own value witnesses.
    Custom,
}

/// Ownership of a reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Ownership {
    Strong,
    Unowned,
    Weak,
}

/// Fixed-size storage with special move semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Address-sensitive storage (atomics, locks); never moved bitwise.
    Immovable,
    /// Storage for a captured block; copied by memcpy, never destroyed.
    BlockStorage,
}

/// A protocol an existential may be constrained by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Protocol {
    pub name: String,
    /// Conforming types must be classes.
    pub class_bound: bool,
    /// The error protocol, which has its own boxed representation.
    pub is_error: bool,
    /// Conformances carry a witness table. Objective-C protocols do not.
    pub has_witness_table: bool,
}

impl Protocol {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class_bound: false,
            is_error: false,
            has_witness_table: true,
        }
    }

    /// A class-bound protocol dispatched through the object itself.
    pub fn objc(name: &str) -> Self {
        Self {
            has_witness_table: false,
            ..Self::class_bound(name)
        }
    }

    pub fn class_bound(name: &str) -> Self {
        Self {
            class_bound: true,
            ..Self::new(name)
        }
    }

    pub fn error() -> Self {
        Self {
            is_error: true,
            ..Self::new("Error")
        }
    }
}

/// One case of an enum: a payload type, or none for an empty case.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnumCase {
    pub name: String,
    pub payload: Option<TypeRef>,
}

/// Identity and resilience of a nominal type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Nominal {
    pub name: String,
    /// Defined in another resilience domain: layout is only known at run time.
    pub resilient: bool,
    /// Generic arguments; passed to the metadata accessor of resilient types.
    pub generic_args: SmallVec<[TypeRef; 2]>,
}

/// A type as the layout engine sees it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// Integer of `bits` bits stored in `ceil(bits / 8)` bytes.
    Int { bits: u32 },
    /// Untyped pointer. Trivial; null and low addresses are invalid.
    RawPointer,
    /// Pointer to type metadata.
    Metatype,
    Reference {
        counting: ReferenceCounting,
        ownership: Ownership,
    },
    /// A function value; thick functions carry a refcounted context word.
    Function { thick: bool },
    Struct {
        nominal: Nominal,
        fields: SmallVec<[TypeRef; 4]>,
    },
    Tuple { elements: SmallVec<[TypeRef; 4]> },
    Enum {
        nominal: Nominal,
        cases: Vec<EnumCase>,
    },
    /// Unsubstituted generic parameter.
    Archetype { name: String },
    FixedArray { element: TypeRef, count: u64 },
    Existential { protocols: Vec<Protocol> },
    /// Fixed-size type from a foreign module, manipulated through its value
    /// witnesses.
    Foreign {
        name: String,
        size: u64,
        align: u64,
        trivial: bool,
    },
    Storage {
        kind: StorageKind,
        size: u64,
        align: u64,
    },
}

impl TypeDesc {
    /// Nominal identity, if the type has one.
    pub fn nominal(&self) -> Option<&Nominal> {
        match self {
            TypeDesc::Struct { nominal, .. } | TypeDesc::Enum { nominal, .. } => Some(nominal),
            _ => None,
        }
    }
}

/// Interner for [`TypeDesc`]s.
#[derive(Debug, Default)]
pub struct TypePool {
    types: Vec<TypeDesc>,
    ids: FxHashMap<TypeDesc, TypeRef>,
    by_name: FxHashMap<String, TypeRef>,
}

impl TypePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `desc`, returning the existing handle for an identical type.
    pub fn intern(&mut self, desc: TypeDesc) -> TypeRef {
        if let Some(id) = self.ids.get(&desc) {
            return *id;
        }
        let id = TypeRef(u32::try_from(self.types.len()).unwrap_or_else(|_| panic!("type pool overflow")));
        let name = match &desc {
            TypeDesc::Struct { nominal, .. } | TypeDesc::Enum { nominal, .. }
                if nominal.generic_args.is_empty() =>
            {
                Some(nominal.name.clone())
            }
            TypeDesc::Foreign { name, .. } => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = name {
            self.by_name.entry(name).or_insert(id);
        }
        self.types.push(desc.clone());
        self.ids.insert(desc, id);
        id
    }

    #[inline]
    pub fn get(&self, id: TypeRef) -> &TypeDesc {
        &self.types[id.index()]
    }

    /// Look up a non-generic nominal or foreign type by name.
    pub fn lookup(&self, name: &str) -> Option<TypeRef> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    // -- Structural queries --

    /// True if the type mentions an unsubstituted generic parameter.
    pub fn has_archetype(&self, id: TypeRef) -> bool {
        match self.get(id) {
            TypeDesc::Archetype { .. } => true,
            TypeDesc::Struct { nominal, fields } => {
                fields.iter().any(|f| self.has_archetype(*f))
                    || nominal.generic_args.iter().any(|a| self.has_archetype(*a))
            }
            TypeDesc::Enum { nominal, cases } => {
                cases
                    .iter()
                    .filter_map(|c| c.payload)
                    .any(|p| self.has_archetype(p))
                    || nominal.generic_args.iter().any(|a| self.has_archetype(*a))
            }
            TypeDesc::Tuple { elements } => elements.iter().any(|e| self.has_archetype(*e)),
            TypeDesc::FixedArray { element, .. } => self.has_archetype(*element),
            _ => false,
        }
    }

    /// The archetypes `id` mentions, in order of first appearance. These are
    /// the arguments of its generic metadata request.
    pub fn archetypes_of(&self, id: TypeRef) -> Vec<TypeRef> {
        let mut found = Vec::new();
        self.collect_archetypes(id, &mut found);
        found
    }

    fn collect_archetypes(&self, id: TypeRef, found: &mut Vec<TypeRef>) {
        match self.get(id) {
            TypeDesc::Archetype { .. } => {
                if !found.contains(&id) {
                    found.push(id);
                }
            }
            TypeDesc::Struct { nominal, fields } => {
                for f in fields.iter().chain(&nominal.generic_args) {
                    self.collect_archetypes(*f, found);
                }
            }
            TypeDesc::Enum { nominal, cases } => {
                for p in cases.iter().filter_map(|c| c.payload) {
                    self.collect_archetypes(p, found);
                }
                for a in &nominal.generic_args {
                    self.collect_archetypes(*a, found);
                }
            }
            TypeDesc::Tuple { elements } => {
                for e in elements {
                    self.collect_archetypes(*e, found);
                }
            }
            TypeDesc::FixedArray { element, .. } => self.collect_archetypes(*element, found),
            _ => {}
        }
    }

    /// True if the layout of the type is known at compile time.
    pub fn is_fixed_size(&self, id: TypeRef) -> bool {
        match self.get(id) {
            TypeDesc::Archetype { .. } => false,
            TypeDesc::Struct { nominal, fields } => {
                !nominal.resilient && fields.iter().all(|f| self.is_fixed_size(*f))
            }
            TypeDesc::Enum { nominal, cases } => {
                !nominal.resilient
                    && cases
                        .iter()
                        .filter_map(|c| c.payload)
                        .all(|p| self.is_fixed_size(p))
            }
            TypeDesc::Tuple { elements } => elements.iter().all(|e| self.is_fixed_size(*e)),
            TypeDesc::FixedArray { element, .. } => self.is_fixed_size(*element),
            _ => true,
        }
    }

    /// Human-readable rendering, used in diagnostics and helper names.
    pub fn display(&self, id: TypeRef) -> String {
        let mut out = String::new();
        self.display_into(id, &mut out);
        out
    }

    fn display_into(&self, id: TypeRef, out: &mut String) {
        use std::fmt::Write as _;
        let list = |pool: &Self, items: &[TypeRef], out: &mut String| {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                pool.display_into(*item, out);
            }
        };
        match self.get(id) {
            TypeDesc::Int { bits } => {
                let _ = write!(out, "Int{bits}");
            }
            TypeDesc::RawPointer => out.push_str("RawPointer"),
            TypeDesc::Metatype => out.push_str("Metatype"),
            TypeDesc::Reference {
                counting,
                ownership,
            } => {
                let _ = write!(out, "{ownership:?}{counting:?}Ref");
            }
            TypeDesc::Function { thick } => {
                out.push_str(if *thick { "ThickFunc" } else { "ThinFunc" });
            }
            TypeDesc::Struct { nominal, .. } | TypeDesc::Enum { nominal, .. } => {
                out.push_str(&nominal.name);
                if !nominal.generic_args.is_empty() {
                    out.push('<');
                    list(self, &nominal.generic_args, out);
                    out.push('>');
                }
            }
            TypeDesc::Tuple { elements } => {
                out.push('(');
                list(self, elements, out);
                out.push(')');
            }
            TypeDesc::Archetype { name } => out.push_str(name),
            TypeDesc::FixedArray { element, count } => {
                out.push('[');
                self.display_into(*element, out);
                let _ = write!(out, "; {count}]");
            }
            TypeDesc::Existential { protocols } => {
                out.push_str("any ");
                if protocols.is_empty() {
                    out.push_str("Any");
                }
                for (i, p) in protocols.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" & ");
                    }
                    out.push_str(&p.name);
                }
            }
            TypeDesc::Foreign { name, .. } => out.push_str(name),
            TypeDesc::Storage { kind, size, .. } => {
                let _ = write!(out, "{kind:?}<{size}>");
            }
        }
    }
}

#[cfg(test)]
mod tests;
