//! Layout strings: the runtime's bytecode for reference counting a value.
//!
//! A layout string lets the runtime copy and destroy values of a fixed type
//! without calling per-type code. It has a header and a list of records:
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 8 | flags, currently zero |
//! | 8 (4 on 32-bit targets) | byte length of the records, `End` included |
//! | 8 each | `(kind << 56) \| skip`: skip `skip` bytes, then a `kind` reference |
//!
//! The last record is [`RefCountingKind::End`], whose skip is the number of
//! bytes after the last reference. A reference occupies a pointer, except an
//! [`Existential`](RefCountingKind::Existential) which covers its whole
//! container. All fields are in target byte order.
//!
//! Values whose copies need metadata (archetypes, resilient types, custom
//! references) and non-trivial enums cannot be described.

use std::fmt;

use keel_bits::Endianness;
use keel_ir::{GlobalId, TargetConfig};

use super::{LayoutId, ScalarKind, TypeInfoKind, TypeLayoutCache, TypeLayoutEntry};
use crate::context::LayoutContext;
use crate::existential::{class_instance_refcounting, OpaqueExistentialLayout};
use crate::types::ReferenceCounting;

const KIND_SHIFT: u32 = 56;
const SKIP_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Reference kinds of layout string records, numbered as the runtime
/// expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RefCountingKind {
    End = 0x00,
    Error = 0x01,
    NativeStrong = 0x02,
    NativeUnowned = 0x03,
    NativeWeak = 0x04,
    Unknown = 0x05,
    UnknownUnowned = 0x06,
    UnknownWeak = 0x07,
    Bridge = 0x08,
    Block = 0x09,
    ObjC = 0x0a,
    Metatype = 0x0c,
    Generic = 0x0d,
    Existential = 0x0e,
    Resilient = 0x0f,
}

impl RefCountingKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            0x00 => Self::End,
            0x01 => Self::Error,
            0x02 => Self::NativeStrong,
            0x03 => Self::NativeUnowned,
            0x04 => Self::NativeWeak,
            0x05 => Self::Unknown,
            0x06 => Self::UnknownUnowned,
            0x07 => Self::UnknownWeak,
            0x08 => Self::Bridge,
            0x09 => Self::Block,
            0x0a => Self::ObjC,
            0x0c => Self::Metatype,
            0x0d => Self::Generic,
            0x0e => Self::Existential,
            0x0f => Self::Resilient,
            _ => return None,
        };
        Some(kind)
    }

    fn of_scalar(kind: ScalarKind, target: &TargetConfig) -> Option<Self> {
        let kind = match kind {
            ScalarKind::ErrorReference => Self::Error,
            ScalarKind::NativeStrongReference | ScalarKind::ThickFunc => Self::NativeStrong,
            ScalarKind::NativeUnownedReference => Self::NativeUnowned,
            ScalarKind::NativeWeakReference => Self::NativeWeak,
            ScalarKind::UnknownReference => Self::Unknown,
            ScalarKind::UnknownUnownedReference => Self::UnknownUnowned,
            ScalarKind::UnknownWeakReference => Self::UnknownWeak,
            ScalarKind::BridgeReference => Self::Bridge,
            ScalarKind::BlockReference => Self::Block,
            ScalarKind::ObjCReference => Self::ObjC,
            ScalarKind::ExistentialReference { .. } => match class_instance_refcounting(target) {
                ReferenceCounting::Unknown => Self::Unknown,
                _ => Self::NativeStrong,
            },
            ScalarKind::TriviallyDestroyable
            | ScalarKind::Immovable
            | ScalarKind::BlockStorage
            | ScalarKind::CustomReference => return None,
        };
        Some(kind)
    }
}

/// One decoded record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefCountRecord {
    pub kind: RefCountingKind,
    pub skip: u64,
}

/// Records of a layout string under construction.
#[derive(Debug)]
struct RefCountString {
    records: Vec<RefCountRecord>,
    /// End of the last reference.
    cursor: u64,
}

impl RefCountString {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            cursor: 0,
        }
    }

    fn add(&mut self, kind: RefCountingKind, offset: u64, size: u64) {
        assert!(
            offset >= self.cursor,
            "{kind:?} reference at {offset} overlaps the one ending at {}",
            self.cursor
        );
        self.records.push(RefCountRecord {
            kind,
            skip: offset - self.cursor,
        });
        self.cursor = offset + size;
    }

    fn finish(mut self, size: u64) -> Vec<RefCountRecord> {
        self.records.push(RefCountRecord {
            kind: RefCountingKind::End,
            skip: size - self.cursor,
        });
        self.records
    }
}

fn put_uint(out: &mut Vec<u8>, value: u64, bytes: usize, endian: Endianness) {
    match endian {
        Endianness::Little => out.extend_from_slice(&value.to_le_bytes()[..bytes]),
        Endianness::Big => out.extend_from_slice(&value.to_be_bytes()[8 - bytes..]),
    }
}

fn length_field_size(pointer_size: u64) -> usize {
    if pointer_size < 8 {
        4
    } else {
        8
    }
}

impl TypeLayoutCache {
    /// Append the references of the value at `offset` to `string`. False if
    /// the layout cannot be described.
    fn ref_count_string(&self, id: LayoutId, offset: u64, target: &TargetConfig, string: &mut RefCountString) -> bool {
        let pointer_size = target.pointer_size();
        match self.get(id) {
            TypeLayoutEntry::Empty => true,
            TypeLayoutEntry::Scalar { kind, .. } => {
                if kind.is_trivially_destroyable() {
                    return true;
                }
                let Some(record) = RefCountingKind::of_scalar(*kind, target) else {
                    return false;
                };
                let at = if *kind == ScalarKind::ThickFunc {
                    offset + pointer_size
                } else {
                    offset
                };
                string.add(record, at, pointer_size);
                true
            }
            TypeLayoutEntry::Archetype { .. } | TypeLayoutEntry::Resilient { .. } => false,
            TypeLayoutEntry::AlignedGroup { children, .. } => {
                let Some(offsets) = self.fixed_child_offsets(children) else {
                    return false;
                };
                children
                    .iter()
                    .zip(offsets)
                    .all(|(child, child_offset)| self.ref_count_string(*child, offset + child_offset, target, string))
            }
            TypeLayoutEntry::Enum { .. } => self.is_trivially_destroyable(id),
            TypeLayoutEntry::TypeInfoBased { info, kind, .. } => match kind {
                TypeInfoKind::Foreign => info.is_trivially_destroyable(),
                TypeInfoKind::OpaqueExistential { num_tables } => {
                    let size = OpaqueExistentialLayout::new(*num_tables).size(target);
                    string.add(RefCountingKind::Existential, offset, size);
                    true
                }
            },
            TypeLayoutEntry::Array { element, count } => {
                if self.is_trivially_destroyable(*element) {
                    return true;
                }
                let Some(stride) = self.fixed_layout(*element).map(|l| l.stride()) else {
                    return false;
                };
                (0..*count).all(|i| self.ref_count_string(*element, offset + i * stride, target, string))
            }
        }
    }

    /// The layout string of a fixed layout, or `None` if it cannot be
    /// described.
    pub fn layout_string(&self, id: LayoutId, target: &TargetConfig) -> Option<Vec<u8>> {
        let size = self.fixed_size(id)?;
        let mut string = RefCountString::new();
        if !self.ref_count_string(id, 0, target, &mut string) {
            tracing::debug!(layout = %id, kind = self.get(id).kind_name(), "layout has no layout string");
            return None;
        }
        let records = string.finish(size);
        let endian = target.endianness();
        let mut out = Vec::new();
        put_uint(&mut out, 0, 8, endian);
        put_uint(
            &mut out,
            records.len() as u64 * 8,
            length_field_size(target.pointer_size()),
            endian,
        );
        for record in &records {
            put_uint(&mut out, ((record.kind as u64) << KIND_SHIFT) | record.skip, 8, endian);
        }
        Some(out)
    }
}

impl LayoutContext {
    /// A global holding the layout string of `id`, emitted once.
    pub fn layout_string_global(&mut self, id: LayoutId) -> Option<GlobalId> {
        let (module, state) = self.parts();
        if let Some(global) = state.layout_strings.get(&id) {
            return Some(*global);
        }
        let bytes = state.layouts.layout_string(id, &state.target)?;
        let global = module.add_global_bytes(&format!("__keel_layout_string_{id}"), bytes, 8);
        state.layout_strings.insert(id, global);
        Some(global)
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A malformed layout string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutStringError {
    /// The string ends inside a field.
    Truncated { offset: usize, needed: usize },
    UnknownKind { offset: usize, kind: u8 },
    /// The header's length disagrees with the records up to `End`.
    LengthMismatch { declared: u64, actual: u64 },
}

impl fmt::Display for LayoutStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset, needed } => {
                write!(f, "layout string truncated at byte {offset}: {needed} more bytes expected")
            }
            Self::UnknownKind { offset, kind } => {
                write!(f, "unknown reference kind {kind:#04x} at byte {offset}")
            }
            Self::LengthMismatch { declared, actual } => {
                write!(f, "layout string declares {declared} record bytes but has {actual}")
            }
        }
    }
}

impl std::error::Error for LayoutStringError {}

/// Header of a layout string.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutStringHeader {
    pub flags: u64,
    pub ref_count_bytes: u64,
}

/// Sequential decoder of layout strings.
#[derive(Debug)]
pub struct LayoutStringReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    pointer_size: u64,
    endian: Endianness,
}

impl<'a> LayoutStringReader<'a> {
    pub fn new(bytes: &'a [u8], target: &TargetConfig) -> Self {
        Self {
            bytes,
            offset: 0,
            pointer_size: target.pointer_size(),
            endian: target.endianness(),
        }
    }

    fn read_uint(&mut self, size: usize) -> Result<u64, LayoutStringError> {
        let end = self.offset + size;
        let Some(field) = self.bytes.get(self.offset..end) else {
            return Err(LayoutStringError::Truncated {
                offset: self.offset,
                needed: end - self.bytes.len(),
            });
        };
        let mut buf = [0u8; 8];
        let value = match self.endian {
            Endianness::Little => {
                buf[..size].copy_from_slice(field);
                u64::from_le_bytes(buf)
            }
            Endianness::Big => {
                buf[8 - size..].copy_from_slice(field);
                u64::from_be_bytes(buf)
            }
        };
        self.offset = end;
        Ok(value)
    }

    pub fn read_header(&mut self) -> Result<LayoutStringHeader, LayoutStringError> {
        let flags = self.read_uint(8)?;
        let ref_count_bytes = self.read_uint(length_field_size(self.pointer_size))?;
        Ok(LayoutStringHeader { flags, ref_count_bytes })
    }

    pub fn next_record(&mut self) -> Result<RefCountRecord, LayoutStringError> {
        let offset = self.offset;
        let raw = self.read_uint(8)?;
        let code = (raw >> KIND_SHIFT) as u8;
        let kind = RefCountingKind::from_u8(code).ok_or(LayoutStringError::UnknownKind { offset, kind: code })?;
        Ok(RefCountRecord {
            kind,
            skip: raw & SKIP_MASK,
        })
    }

    /// Decode a whole string: its header and its records, `End` included.
    pub fn read_all(mut self) -> Result<(LayoutStringHeader, Vec<RefCountRecord>), LayoutStringError> {
        let header = self.read_header()?;
        let mut records = Vec::new();
        loop {
            let record = self.next_record()?;
            records.push(record);
            if record.kind == RefCountingKind::End {
                break;
            }
        }
        let actual = records.len() as u64 * 8;
        if actual != header.ref_count_bytes {
            return Err(LayoutStringError::LengthMismatch {
                declared: header.ref_count_bytes,
                actual,
            });
        }
        Ok((header, records))
    }
}
