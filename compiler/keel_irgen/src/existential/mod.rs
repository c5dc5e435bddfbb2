//! Existential containers.
//!
//! A value of protocol type is stored in one of three shapes, picked from
//! the protocol composition:
//!
//! | Representation | Layout |
//! |----------------|--------|
//! | [`Error`](ExistentialRepresentation::Error) | one boxed error reference |
//! | [`Class`](ExistentialRepresentation::Class) | `{ instance, table * n }` |
//! | [`Opaque`](ExistentialRepresentation::Opaque) | `{ [3 x word] buffer, metadata, table * n }` |
//!
//! Values that do not fit an opaque container's buffer live in a heap box
//! whose pointer occupies the buffer's first word. The operations that
//! depend on inline-ness are emitted once per witness table count as shared
//! helpers; see [`boxed`].

mod boxed;

use keel_ir::{TargetConfig, TypeId, TypeTable, ValueId};
use rustc_hash::FxHashMap;

use crate::context::{Address, IrGenFunction};
use crate::runtime::{RuntimeFn, ValueWitness};
use crate::type_info::{ExtraInhabitants, FixedTypeInfo};
use crate::types::{Protocol, ReferenceCounting};

/// How a protocol composition is stored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExistentialRepresentation {
    Opaque,
    Class,
    Error,
}

/// Shape of an existential container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExistentialLayout {
    pub representation: ExistentialRepresentation,
    /// Witness tables stored after the value.
    pub num_tables: u32,
}

impl ExistentialLayout {
    /// The error protocol alone is boxed; any class bound makes a class
    /// existential; everything else is opaque.
    pub fn for_protocols(protocols: &[Protocol]) -> Self {
        let stored = protocols.iter().filter(|p| p.has_witness_table).count();
        let num_tables = u32::try_from(stored).unwrap_or_else(|_| panic!("too many protocols"));
        if let [only] = protocols {
            if only.is_error {
                return Self {
                    representation: ExistentialRepresentation::Error,
                    num_tables: 0,
                };
            }
        }
        let representation = if protocols.iter().any(|p| p.class_bound) {
            ExistentialRepresentation::Class
        } else {
            ExistentialRepresentation::Opaque
        };
        Self {
            representation,
            num_tables,
        }
    }

    pub fn size(&self, target: &TargetConfig) -> u64 {
        let ptr = target.pointer_size();
        let tables = u64::from(self.num_tables);
        match self.representation {
            ExistentialRepresentation::Error => ptr,
            ExistentialRepresentation::Class => ptr * (tables + 1),
            ExistentialRepresentation::Opaque => OpaqueExistentialLayout::new(self.num_tables).size(target),
        }
    }

    pub fn type_info(&self, target: &TargetConfig) -> FixedTypeInfo {
        match self.representation {
            ExistentialRepresentation::Error => FixedTypeInfo::heap_pointer(target, 1, false, true),
            ExistentialRepresentation::Class => {
                FixedTypeInfo::heap_pointer(target, u64::from(self.num_tables) + 1, false, true)
            }
            ExistentialRepresentation::Opaque => OpaqueExistentialLayout::new(self.num_tables).type_info(target),
        }
    }

    pub fn opaque(&self) -> Option<OpaqueExistentialLayout> {
        (self.representation == ExistentialRepresentation::Opaque)
            .then(|| OpaqueExistentialLayout::new(self.num_tables))
    }
}

/// How the instance of a class existential is reference counted: the
/// unknown-object entry points where foreign objects may appear.
pub fn class_instance_refcounting(target: &TargetConfig) -> ReferenceCounting {
    if target.components().is_darwin() {
        ReferenceCounting::Unknown
    } else {
        ReferenceCounting::Native
    }
}

/// Existential layouts already chosen, by protocol composition.
#[derive(Debug, Default)]
pub(crate) struct ExistentialCache {
    layouts: FxHashMap<Vec<Protocol>, ExistentialLayout>,
}

impl ExistentialCache {
    pub(crate) fn layout(&mut self, protocols: &[Protocol]) -> ExistentialLayout {
        if let Some(layout) = self.layouts.get(protocols) {
            return *layout;
        }
        let layout = ExistentialLayout::for_protocols(protocols);
        tracing::debug!(
            protocols = protocols.len(),
            representation = ?layout.representation,
            tables = layout.num_tables,
            "chose existential representation"
        );
        self.layouts.insert(protocols.to_vec(), layout);
        layout
    }
}

// ---------------------------------------------------------------------------
// Opaque containers
// ---------------------------------------------------------------------------

/// `[words x word]`, the inline value buffer.
pub(crate) fn fixed_buffer_type(types: &mut TypeTable, words: u32) -> TypeId {
    let word = types.size_int();
    types.array(word, u64::from(words))
}

/// `{ [3 x word] buffer, metadata, table * num_tables }`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpaqueExistentialLayout {
    num_tables: u32,
}

impl OpaqueExistentialLayout {
    pub fn new(num_tables: u32) -> Self {
        Self { num_tables }
    }

    pub fn num_tables(&self) -> u32 {
        self.num_tables
    }

    /// The IR struct type of the container, named after the table count.
    pub fn storage_type(&self, types: &mut TypeTable, buffer_words: u32) -> TypeId {
        let ptr = types.ptr();
        let buffer = fixed_buffer_type(types, buffer_words);
        let mut fields = vec![buffer, ptr];
        fields.extend((0..self.num_tables).map(|_| ptr));
        types.named_struct(&format!("__opaque_existential_type_{}", self.num_tables), &fields)
    }

    pub fn size(&self, target: &TargetConfig) -> u64 {
        target.fixed_buffer_size() + target.pointer_size() * (u64::from(self.num_tables) + 1)
    }

    /// Alignment of the fixed buffer.
    pub fn align(&self, target: &TargetConfig) -> u64 {
        target.pointer_size()
    }

    pub fn metadata_ref_offset(&self, target: &TargetConfig) -> u64 {
        target.fixed_buffer_size()
    }

    /// Static layout; the metadata pointer provides the extra inhabitants.
    pub fn type_info(&self, target: &TargetConfig) -> FixedTypeInfo {
        FixedTypeInfo::opaque(self.size(target), self.align(target), false, true).with_extra_inhabitants(
            ExtraInhabitants::HeapPointer {
                offset: self.metadata_ref_offset(target),
            },
        )
    }

    fn field(&self, igf: &mut IrGenFunction<'_>, container: Address, index: u32) -> Address {
        let words = igf.target().fixed_buffer_words();
        let ty = self.storage_type(igf.builder.module_mut().types_mut(), words);
        let ptr = igf.builder.struct_gep(ty, container.ptr, index);
        Address::new(ptr, igf.pointer_size())
    }

    pub fn project_existential_buffer(&self, _igf: &mut IrGenFunction<'_>, container: Address) -> Address {
        container
    }

    pub fn project_metadata_ref(&self, igf: &mut IrGenFunction<'_>, container: Address) -> Address {
        self.field(igf, container, 1)
    }

    pub fn project_witness_table(&self, igf: &mut IrGenFunction<'_>, container: Address, index: u32) -> Address {
        assert!(
            index < self.num_tables,
            "witness table {index} of a container with {}",
            self.num_tables
        );
        self.field(igf, container, 2 + index)
    }

    pub fn load_metadata_ref(&self, igf: &mut IrGenFunction<'_>, container: Address) -> ValueId {
        let slot = self.project_metadata_ref(igf, container);
        let ptr = igf.builder.ptr_type();
        igf.builder.load(ptr, slot.ptr, slot.align)
    }

    pub fn load_witness_table(&self, igf: &mut IrGenFunction<'_>, container: Address, index: u32) -> ValueId {
        let slot = self.project_witness_table(igf, container, index);
        let ptr = igf.builder.ptr_type();
        igf.builder.load(ptr, slot.ptr, slot.align)
    }

    /// Copy the metadata and witness tables of `src` into `dest`.
    pub(crate) fn copy_metadata_and_tables(&self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        let metadata = self.load_metadata_ref(igf, src);
        let slot = self.project_metadata_ref(igf, dest);
        igf.builder.store(metadata, slot.ptr, slot.align);
        for index in 0..self.num_tables {
            let table = self.load_witness_table(igf, src, index);
            let slot = self.project_witness_table(igf, dest, index);
            igf.builder.store(table, slot.ptr, slot.align);
        }
    }

    // -- Value operations --

    pub fn assign_with_copy(&self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        let helper = self.assign_helper(igf);
        igf.builder.call(helper, &[dest.ptr, src.ptr]);
    }

    pub fn assign_with_take(&self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.destroy(igf, dest);
        self.init_with_take(igf, dest, src);
    }

    pub fn init_with_copy(&self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        self.copy_metadata_and_tables(igf, dest, src);
        let metadata = self.load_metadata_ref(igf, src);
        let dest_buffer = self.project_existential_buffer(igf, dest);
        let src_buffer = self.project_existential_buffer(igf, src);
        igf.emit_call_value_witness(
            metadata,
            ValueWitness::InitializeBufferWithCopyOfBuffer,
            &[dest_buffer.ptr, src_buffer.ptr],
        );
    }

    /// Containers are always bitwise takable: boxed values move with their
    /// box pointer.
    pub fn init_with_take(&self, igf: &mut IrGenFunction<'_>, dest: Address, src: Address) {
        let size = self.size(igf.target());
        igf.builder.memcpy_const(dest.ptr, src.ptr, size);
    }

    pub fn destroy(&self, igf: &mut IrGenFunction<'_>, container: Address) {
        let helper = self.destroy_helper(igf);
        igf.builder.call(helper, &[container.ptr]);
    }

    /// Prepare the buffer of `container`, whose metadata is already stored,
    /// to receive a value; returns the address to initialize.
    pub fn allocate_boxed(&self, igf: &mut IrGenFunction<'_>, container: Address) -> Address {
        let helper = self.allocate_helper(igf);
        let ptr = igf.builder.call(helper, &[container.ptr]);
        Address::new(ptr, 1)
    }

    /// Free the box of a container whose value was already destroyed or
    /// moved out.
    pub fn deallocate_boxed(&self, igf: &mut IrGenFunction<'_>, container: Address) {
        let helper = self.deallocate_helper(igf);
        igf.builder.call(helper, &[container.ptr]);
    }

    /// Address of the contained value, for reading.
    pub fn project_boxed(&self, igf: &mut IrGenFunction<'_>, container: Address) -> Address {
        let helper = self.project_helper(igf);
        let ptr = igf.builder.call(helper, &[container.ptr]);
        Address::new(ptr, 1)
    }

    /// Address of the contained value, for writing; a shared box is copied
    /// first.
    pub fn mutable_project_boxed(&self, igf: &mut IrGenFunction<'_>, container: Address) -> Address {
        let helper = self.mutable_project_helper(igf);
        let ptr = igf.builder.call(helper, &[container.ptr]);
        Address::new(ptr, 1)
    }
}

// ---------------------------------------------------------------------------
// Class and error containers
// ---------------------------------------------------------------------------

/// Retain or release entry point for the instance of a class existential.
pub(crate) fn class_instance_runtime_fn(target: &TargetConfig, retain: bool) -> RuntimeFn {
    match (class_instance_refcounting(target), retain) {
        (ReferenceCounting::Unknown, true) => RuntimeFn::UnknownObjectRetain,
        (ReferenceCounting::Unknown, false) => RuntimeFn::UnknownObjectRelease,
        (_, true) => RuntimeFn::Retain,
        (_, false) => RuntimeFn::Release,
    }
}

#[cfg(test)]
mod tests;
