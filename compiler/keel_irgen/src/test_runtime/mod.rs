//! A runtime for executing emitted code in tests.
//!
//! Implements the entry points of [`crate::runtime`] on top of interpreter
//! memory: type metadata records with value witness tables whose function
//! witnesses are host symbols, refcounting that only records what it was
//! asked to do, boxes with real reference counts, and the layout verifier
//! hook.

use keel_bits::{ApInt, Endianness};
use keel_ir::{HostFunctions, InterpError, Memory, TargetConfig};
use rustc_hash::FxHashMap;

use crate::runtime::{RuntimeFn, ValueWitness, ValueWitnessFlags};
use crate::type_info::{enum_tag_counts, fits_inline, heap_pointer_extra_inhabitant_count};
use crate::types::TypeRef;
use crate::verifier::LayoutMismatch;
use crate::LayoutContext;

/// A 64-bit target of the given byte order.
pub(crate) fn target(endian: Endianness) -> TargetConfig {
    let triple = match endian {
        Endianness::Little => "x86_64-unknown-linux-gnu",
        Endianness::Big => "powerpc64-unknown-linux-gnu",
    };
    TargetConfig::from_triple(triple).unwrap_or_else(|e| panic!("{e}"))
}

pub(crate) fn context(endian: Endianness) -> LayoutContext {
    LayoutContext::new("test", target(endian))
}

/// Runtime behavior of a registered type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TestType {
    pub size: u64,
    pub align: u64,
    pub pod: bool,
    pub bitwise_takable: bool,
    /// Offsets of native strong references.
    pub refs: Vec<u64>,
    /// The first word is a heap pointer whose low values are extra
    /// inhabitants.
    pub heap_pointer: bool,
}

impl TestType {
    pub fn pod(size: u64, align: u64) -> Self {
        Self {
            size,
            align,
            pod: true,
            bitwise_takable: true,
            refs: Vec::new(),
            heap_pointer: false,
        }
    }

    pub fn native_ref() -> Self {
        Self {
            size: 8,
            align: 8,
            pod: false,
            bitwise_takable: true,
            refs: vec![0],
            heap_pointer: true,
        }
    }

    pub fn stride(&self) -> u64 {
        self.size.div_ceil(self.align).max(1) * self.align
    }
}

/// One call into the runtime, with its arguments as words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RuntimeCall {
    pub name: String,
    pub args: Vec<u64>,
}

pub(crate) struct TestRuntime {
    target: TargetConfig,
    types: FxHashMap<u32, TestType>,
    metadata: FxHashMap<u32, u64>,
    by_metadata: FxHashMap<u64, u32>,
    /// Live boxes and their reference counts.
    boxes: FxHashMap<u64, u32>,
    pub calls: Vec<RuntimeCall>,
    pub mismatches: Vec<LayoutMismatch>,
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new(&target(Endianness::Little))
    }
}

fn host_error(message: String) -> InterpError {
    InterpError::Host(message)
}

fn word(value: u64) -> Option<ApInt> {
    Some(ApInt::new(64, value))
}

impl TestRuntime {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            target: target.clone(),
            types: FxHashMap::default(),
            metadata: FxHashMap::default(),
            by_metadata: FxHashMap::default(),
            boxes: FxHashMap::default(),
            calls: Vec::new(),
            mismatches: Vec::new(),
        }
    }

    pub fn register(&mut self, ty: TypeRef, behavior: TestType) {
        self.types.insert(ty.raw(), behavior);
    }

    /// Calls made to `name`, in order.
    pub fn calls_to(&self, name: &str) -> Vec<&[u64]> {
        self.calls
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.args.as_slice())
            .collect()
    }

    pub fn box_refcount(&self, addr: u64) -> Option<u32> {
        self.boxes.get(&addr).copied()
    }

    /// Address of the metadata record of `ty`, created on first request.
    pub fn metadata(&mut self, memory: &mut Memory, ty: TypeRef) -> Result<u64, InterpError> {
        self.metadata_for_index(memory, ty.raw())
    }

    fn metadata_for_index(&mut self, memory: &mut Memory, index: u32) -> Result<u64, InterpError> {
        if let Some(addr) = self.metadata.get(&index) {
            return Ok(*addr);
        }
        let ty = self
            .types
            .get(&index)
            .cloned()
            .ok_or_else(|| host_error(format!("no test type registered for t{index}")))?;
        let ptr = memory.pointer_size();
        let table = memory.alloc(ValueWitness::table_size(ptr, false), ptr);
        for witness in ValueWitness::FUNCTIONS {
            if witness.offset(ptr) >= ValueWitness::table_size(ptr, false) {
                continue;
            }
            let symbol = memory.host_symbol(&format!("keel_vw_{}", witness.name()));
            memory.store_word(table + witness.offset(ptr), symbol)?;
        }
        let inline = fits_inline(ty.size, ty.align, ty.bitwise_takable, &self.target);
        let flags = ValueWitnessFlags::for_layout(ty.align - 1, ty.pod, inline, ty.bitwise_takable);
        memory.store_word(table + ValueWitness::Size.offset(ptr), ty.size)?;
        memory.store_word(table + ValueWitness::Stride.offset(ptr), ty.stride())?;
        memory.store_u32(table + ValueWitness::Flags.offset(ptr), flags.bits())?;
        memory.store_u32(
            table + ValueWitness::ExtraInhabitantCount.offset(ptr),
            self.extra_inhabitant_count(&ty),
        )?;
        let record = memory.alloc(ptr, ptr);
        memory.store_word(record, table)?;
        self.metadata.insert(index, record);
        self.by_metadata.insert(record, index);
        Ok(record)
    }

    fn type_of(&self, metadata: u64) -> Result<TestType, InterpError> {
        self.by_metadata
            .get(&metadata)
            .and_then(|index| self.types.get(index))
            .cloned()
            .ok_or_else(|| host_error(format!("{metadata:#x} is not test metadata")))
    }

    fn extra_inhabitant_count(&self, ty: &TestType) -> u32 {
        if ty.heap_pointer {
            heap_pointer_extra_inhabitant_count(&self.target)
        } else {
            0
        }
    }

    fn box_start(&self, ty: &TestType) -> u64 {
        let mask = ty.align - 1;
        (self.target.heap_header_size() + mask) & !mask
    }

    // -- Refcounting --

    fn retain(&mut self, object: u64) {
        if let Some(refcount) = self.boxes.get_mut(&object) {
            *refcount += 1;
        }
    }

    fn release(&mut self, object: u64) {
        if let Some(refcount) = self.boxes.get_mut(&object) {
            *refcount = refcount.saturating_sub(1);
        }
    }

    fn record(&mut self, name: &str, args: Vec<u64>) {
        self.calls.push(RuntimeCall {
            name: name.to_string(),
            args,
        });
    }

    // -- Value semantics of registered types --

    fn init_with_copy(&mut self, memory: &mut Memory, ty: &TestType, dest: u64, src: u64) -> Result<(), InterpError> {
        memory.copy(dest, src, ty.size)?;
        for offset in &ty.refs {
            let object = memory.load_word(dest + offset)?;
            self.record("keel_retain", vec![object]);
            self.retain(object);
        }
        Ok(())
    }

    fn destroy(&mut self, memory: &Memory, ty: &TestType, addr: u64) -> Result<(), InterpError> {
        for offset in &ty.refs {
            let object = memory.load_word(addr + offset)?;
            self.record("keel_release", vec![object]);
            self.release(object);
        }
        Ok(())
    }

    fn alloc_box(&mut self, memory: &mut Memory, ty: &TestType) -> u64 {
        let start = self.box_start(ty);
        let align = ty.align.max(memory.pointer_size());
        let addr = memory.alloc(start + ty.size, align);
        self.boxes.insert(addr, 1);
        addr
    }

    // -- Single-payload enum tags --

    fn get_tag(&self, memory: &Memory, ty: &TestType, addr: u64, num_empty: u32) -> Result<u32, InterpError> {
        let xi = self.extra_inhabitant_count(ty);
        if num_empty > xi {
            let counts = enum_tag_counts(ty.size, u64::from(num_empty - xi), 1);
            let extra = load_uint(memory, addr + ty.size, counts.num_tag_bytes)?;
            if extra != 0 {
                let payload = load_uint(memory, addr, ty.size.min(4))?;
                let case = if ty.size >= 4 {
                    payload
                } else {
                    ((extra - 1) << (ty.size * 8)) | payload
                };
                return Ok(case as u32 + xi + 1);
            }
        }
        if xi == 0 {
            return Ok(0);
        }
        let pointer = memory.load_word(addr)?;
        if pointer < self.target.least_valid_pointer() {
            Ok((pointer >> self.target.reserved_low_bits()) as u32 + 1)
        } else {
            Ok(0)
        }
    }

    fn store_tag(
        &self,
        memory: &mut Memory,
        ty: &TestType,
        addr: u64,
        tag: u32,
        num_empty: u32,
    ) -> Result<(), InterpError> {
        let xi = self.extra_inhabitant_count(ty);
        let extra_cases = u64::from(num_empty.saturating_sub(xi));
        let tag_bytes = enum_tag_counts(ty.size, extra_cases, 1).num_tag_bytes;
        if tag <= xi {
            store_uint(memory, addr + ty.size, 0, tag_bytes)?;
            if tag > 0 {
                let pointer = u64::from(tag - 1) << self.target.reserved_low_bits();
                memory.store_word(addr, pointer)?;
            }
            return Ok(());
        }
        let case = u64::from(tag - xi - 1);
        let (extra, payload) = if ty.size >= 4 {
            (1, case)
        } else {
            let bits = ty.size * 8;
            (1 + (case >> bits), case & ((1 << bits) - 1))
        };
        memory.fill(addr, 0, ty.size)?;
        store_uint(memory, addr, payload, ty.size.min(4))?;
        store_uint(memory, addr + ty.size, extra, tag_bytes)
    }

    // -- Dispatch --

    fn value_witness(&mut self, name: &str, args: &[u64], memory: &mut Memory) -> Result<Option<ApInt>, InterpError> {
        let metadata = *args
            .last()
            .ok_or_else(|| host_error(format!("{name} called without metadata")))?;
        let ty = self.type_of(metadata)?;
        match name {
            "initializeBufferWithCopyOfBuffer" => {
                let (dest, src) = (args[0], args[1]);
                if fits_inline(ty.size, ty.align, ty.bitwise_takable, &self.target) {
                    self.init_with_copy(memory, &ty, dest, src)?;
                    return Ok(word(dest));
                }
                let object = memory.load_word(src)?;
                self.record("keel_retain", vec![object]);
                self.retain(object);
                memory.store_word(dest, object)?;
                Ok(word(object + self.box_start(&ty)))
            }
            "destroy" => {
                self.destroy(memory, &ty, args[0])?;
                Ok(None)
            }
            "initializeWithCopy" => {
                self.init_with_copy(memory, &ty, args[0], args[1])?;
                Ok(word(args[0]))
            }
            "assignWithCopy" => {
                if args[0] != args[1] {
                    self.destroy(memory, &ty, args[0])?;
                    self.init_with_copy(memory, &ty, args[0], args[1])?;
                }
                Ok(word(args[0]))
            }
            "initializeWithTake" => {
                memory.copy(args[0], args[1], ty.size)?;
                Ok(word(args[0]))
            }
            "assignWithTake" => {
                self.destroy(memory, &ty, args[0])?;
                memory.copy(args[0], args[1], ty.size)?;
                Ok(word(args[0]))
            }
            "getEnumTagSinglePayload" => {
                let tag = self.get_tag(memory, &ty, args[0], args[1] as u32)?;
                Ok(Some(ApInt::new(32, u64::from(tag))))
            }
            "storeEnumTagSinglePayload" => {
                self.store_tag(memory, &ty, args[0], args[1] as u32, args[2] as u32)?;
                Ok(None)
            }
            _ => Err(host_error(format!("unsupported value witness {name}"))),
        }
    }
}

fn load_uint(memory: &Memory, addr: u64, bytes: u64) -> Result<u64, InterpError> {
    if bytes == 0 {
        return Ok(0);
    }
    Ok(memory.load_int(addr, (bytes * 8) as u32)?.low_u64())
}

fn store_uint(memory: &mut Memory, addr: u64, value: u64, bytes: u64) -> Result<(), InterpError> {
    if bytes == 0 {
        return Ok(());
    }
    memory.store_int(addr, &ApInt::new((bytes * 8) as u32, value))
}

impl HostFunctions for TestRuntime {
    fn call(&mut self, name: &str, args: &[ApInt], memory: &mut Memory) -> Result<Option<ApInt>, InterpError> {
        let args: Vec<u64> = args.iter().map(ApInt::low_u64).collect();
        self.record(name, args.clone());
        if let Some(witness) = name.strip_prefix("keel_vw_") {
            return self.value_witness(witness, &args, memory);
        }
        match name {
            "keel_getTypeMetadata" | "keel_getGenericMetadata" => {
                let metadata = self.metadata_for_index(memory, args[0] as u32)?;
                Ok(word(metadata))
            }
            "keel_allocBox" => {
                let ty = self.type_of(args[0])?;
                Ok(word(self.alloc_box(memory, &ty)))
            }
            "keel_deallocBox" => {
                self.boxes.remove(&args[0]);
                Ok(None)
            }
            "keel_makeBoxUnique" => {
                let (buffer, metadata) = (args[0], args[1]);
                let ty = self.type_of(metadata)?;
                let object = memory.load_word(buffer)?;
                if self.box_refcount(object) == Some(1) {
                    return Ok(word(object));
                }
                let fresh = self.alloc_box(memory, &ty);
                let start = self.box_start(&ty);
                self.init_with_copy(memory, &ty, fresh + start, object + start)?;
                self.release(object);
                memory.store_word(buffer, fresh)?;
                Ok(word(fresh))
            }
            "keel_verifyTypeLayoutAttribute" => {
                let (runtime, expected, len) = (args[1], args[2], args[3]);
                let description = memory.read_c_string(args[4])?;
                let runtime = memory.read_bytes(runtime, len)?.to_vec();
                let expected = memory.read_bytes(expected, len)?.to_vec();
                if let Some(mismatch) = LayoutMismatch::check(&description, runtime, expected) {
                    self.mismatches.push(mismatch);
                }
                Ok(None)
            }
            _ => {
                match RuntimeFn::from_symbol(name) {
                    Some(f) if f.is_strong_retain() => self.retain(args[0]),
                    Some(f) if f.is_strong_release() => self.release(args[0]),
                    // Unowned and weak entry points only need to be recorded.
                    Some(_) => {}
                    None => return Err(host_error(format!("unknown runtime entry point {name}"))),
                }
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for TestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRuntime")
            .field("types", &self.types.len())
            .field("boxes", &self.boxes)
            .field("calls", &self.calls.len())
            .finish_non_exhaustive()
    }
}
