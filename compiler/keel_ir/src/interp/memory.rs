//! Byte-addressed memory for the interpreter.
//!
//! One flat arena starting at [`HEAP_BASE`] serves both stack slots and
//! host allocations; nothing is ever reused, so dangling pointers read stale
//! but valid bytes rather than someone else's data. Functions and host
//! symbols get fake addresses in separate ranges so they can be stored in
//! memory and called through.

use keel_bits::{ApInt, Endianness};
use rustc_hash::FxHashMap;

use super::InterpError;
use crate::types::DataLayout;
use crate::FunctionId;

/// Lowest address handed out by [`Memory::alloc`].
pub const HEAP_BASE: u64 = 0x1_0000;
const FUNCTION_BASE: u64 = 0x4000_0000;
const SYMBOL_BASE: u64 = 0x6000_0000;
const SLOT: u64 = 16;

/// Interpreter memory and symbol address space.
#[derive(Debug)]
pub struct Memory {
    bytes: Vec<u8>,
    endianness: Endianness,
    pointer_width: u32,
    symbols: Vec<String>,
    symbol_ids: FxHashMap<String, u64>,
}

impl Memory {
    pub fn new(layout: &DataLayout) -> Self {
        Self {
            bytes: Vec::new(),
            endianness: layout.endianness,
            pointer_width: layout.pointer_width,
            symbols: Vec::new(),
            symbol_ids: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[inline]
    pub fn pointer_width(&self) -> u32 {
        self.pointer_width
    }

    #[inline]
    pub fn pointer_size(&self) -> u64 {
        u64::from(self.pointer_width / 8)
    }

    // -- Allocation --

    /// Allocate `size` zeroed bytes aligned to `align`.
    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let end = HEAP_BASE + self.bytes.len() as u64;
        let start = end.div_ceil(align) * align;
        let new_len = (start - HEAP_BASE + size.max(1)) as usize;
        self.bytes.resize(new_len, 0);
        start
    }

    fn range(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>, InterpError> {
        let out_of_bounds = InterpError::OutOfBounds { addr, len };
        if addr < HEAP_BASE {
            return Err(out_of_bounds);
        }
        let start = (addr - HEAP_BASE) as usize;
        let end = start.checked_add(len as usize).ok_or(out_of_bounds.clone())?;
        if end > self.bytes.len() {
            return Err(out_of_bounds);
        }
        Ok(start..end)
    }

    pub fn read_bytes(&self, addr: u64, len: u64) -> Result<&[u8], InterpError> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), InterpError> {
        let range = self.range(addr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes; overlapping ranges behave like `memmove`.
    pub fn copy(&mut self, dest: u64, src: u64, len: u64) -> Result<(), InterpError> {
        let data = self.read_bytes(src, len)?.to_vec();
        self.write_bytes(dest, &data)
    }

    pub fn fill(&mut self, dest: u64, byte: u8, len: u64) -> Result<(), InterpError> {
        let range = self.range(dest, len)?;
        self.bytes[range].fill(byte);
        Ok(())
    }

    // -- Typed access --

    /// Load an integer of `bits` bits from its store size in bytes.
    pub fn load_int(&self, addr: u64, bits: u32) -> Result<ApInt, InterpError> {
        let len = bits.div_ceil(8);
        let data = self.read_bytes(addr, u64::from(len))?;
        let mut value = ApInt::zero(len * 8);
        for (i, byte) in data.iter().enumerate() {
            let i = i as u32;
            let position = match self.endianness {
                Endianness::Little => i * 8,
                Endianness::Big => (len - 1 - i) * 8,
            };
            value.insert_bits(&ApInt::new(8, u64::from(*byte)), position);
        }
        Ok(value.trunc(bits))
    }

    /// Store `value` zero-extended to its store size.
    pub fn store_int(&mut self, addr: u64, value: &ApInt) -> Result<(), InterpError> {
        let len = value.width().div_ceil(8);
        let wide = value.zext(len * 8);
        let data: Vec<u8> = (0..len)
            .map(|i| {
                let position = match self.endianness {
                    Endianness::Little => i * 8,
                    Endianness::Big => (len - 1 - i) * 8,
                };
                wide.extract_bits(8, position).low_u64() as u8
            })
            .collect();
        self.write_bytes(addr, &data)
    }

    /// Load a pointer-sized word.
    pub fn load_word(&self, addr: u64) -> Result<u64, InterpError> {
        Ok(self.load_int(addr, self.pointer_width)?.low_u64())
    }

    pub fn store_word(&mut self, addr: u64, value: u64) -> Result<(), InterpError> {
        self.store_int(addr, &ApInt::new(self.pointer_width, value))
    }

    pub fn load_u32(&self, addr: u64) -> Result<u32, InterpError> {
        Ok(self.load_int(addr, 32)?.low_u64() as u32)
    }

    pub fn store_u32(&mut self, addr: u64, value: u32) -> Result<(), InterpError> {
        self.store_int(addr, &ApInt::new(32, u64::from(value)))
    }

    /// Read a NUL-terminated string.
    pub fn read_c_string(&self, addr: u64) -> Result<String, InterpError> {
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            let byte = self.read_bytes(cursor, 1)?[0];
            if byte == 0 {
                break;
            }
            out.push(byte);
            cursor += 1;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    // -- Symbols --

    pub fn function_address(function: FunctionId) -> u64 {
        FUNCTION_BASE + u64::from(function.raw()) * SLOT
    }

    pub fn function_at(addr: u64) -> Option<FunctionId> {
        if !(FUNCTION_BASE..SYMBOL_BASE).contains(&addr) || (addr - FUNCTION_BASE) % SLOT != 0 {
            return None;
        }
        Some(FunctionId::from_index(((addr - FUNCTION_BASE) / SLOT) as usize))
    }

    /// A stable fake address for the host function `name`.
    pub fn host_symbol(&mut self, name: &str) -> u64 {
        if let Some(addr) = self.symbol_ids.get(name) {
            return *addr;
        }
        let addr = SYMBOL_BASE + self.symbols.len() as u64 * SLOT;
        self.symbols.push(name.to_string());
        self.symbol_ids.insert(name.to_string(), addr);
        addr
    }

    pub fn symbol_at(&self, addr: u64) -> Option<&str> {
        if addr < SYMBOL_BASE || (addr - SYMBOL_BASE) % SLOT != 0 {
            return None;
        }
        self.symbols
            .get(((addr - SYMBOL_BASE) / SLOT) as usize)
            .map(String::as_str)
    }
}
