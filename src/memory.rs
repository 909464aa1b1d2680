//! Linear memory management for Spirits.
//!
//! Each Spirit owns one linear memory and one bump allocator. Allocation only
//! advances a cursor; nothing is freed individually and `reset` reclaims the
//! whole heap at once. Addresses issued before a reset are not tracked: a
//! caller holding one afterwards reads whatever was written since. The
//! allocator's generation counter changes on every reset so callers that
//! care can tell.
//!
//! Strings use the Spirit ABI encoding: a little-endian `u32` byte length
//! followed by that many UTF-8 bytes, with no terminator.

use wasmtime::{AsContext, AsContextMut, Memory};

use crate::error::{Error, Result};
use crate::gene::{FieldType, FieldValue, GeneLayout, Record};
use crate::types::SpiritState;

/// Size of one Wasm page in bytes.
pub const PAGE_SIZE: u64 = 65536;

/// Default initial memory size in pages (1 MiB).
pub const DEFAULT_INITIAL_PAGES: u32 = 16;

/// Default maximum memory size in pages (16 MiB).
pub const DEFAULT_MAXIMUM_PAGES: u32 = 256;

/// Default allocator base. The region below it stays reserved so that
/// address 0 can mean "no value".
pub const DEFAULT_HEAP_BASE: u32 = 1024;

pub const DEFAULT_ALIGN: u32 = 8;

/// Highest address a 32-bit linear memory can hold, plus one.
const ADDRESS_SPACE: u64 = 1 << 32;

/// Bump allocator cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocator {
    base: u32,
    cursor: u32,
    generation: u64,
}

impl Allocator {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            cursor: base,
            generation: 0,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Number of resets so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compute the `(address, end)` of the next allocation without taking it.
    ///
    /// Alignments that are not a power of two are rounded up to one.
    pub fn reserve(&self, size: u32, align: u32) -> Result<(u32, u64)> {
        let align = align.max(1).next_power_of_two() as u64;
        let address = (self.cursor as u64 + align - 1) & !(align - 1);
        let end = address + size as u64;
        // The cursor is a u32, so an allocation may not end at 2^32 itself.
        if end >= ADDRESS_SPACE {
            return Err(Error::Allocation {
                requested: size,
                needed: end,
            });
        }
        Ok((address as u32, end))
    }

    /// Move the cursor to the end of a reservation. Never moves it backwards.
    pub(crate) fn commit(&mut self, end: u64) {
        if let Ok(end) = u32::try_from(end) {
            self.cursor = self.cursor.max(end);
        }
    }

    pub fn reset(&mut self) {
        self.cursor = self.base;
        self.generation += 1;
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_BASE)
    }
}

/// Allocation and typed access over one Spirit's linear memory.
///
/// The manager is a handle like [`wasmtime::Memory`]; the allocator cursor
/// lives in the store's [`SpiritState`], so every operation takes the store.
#[derive(Debug, Clone, Copy)]
pub struct MemoryManager {
    memory: Memory,
}

impl MemoryManager {
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Current size of the linear memory in bytes.
    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(&store) as u64
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn alloc(&self, store: impl AsContextMut<Data = SpiritState>, size: u32) -> Result<u32> {
        self.alloc_aligned(store, size, DEFAULT_ALIGN)
    }

    /// Allocate `size` bytes aligned to `align`, growing memory by whole pages
    /// when the allocation ends past the current capacity.
    pub fn alloc_aligned(
        &self,
        mut store: impl AsContextMut<Data = SpiritState>,
        size: u32,
        align: u32,
    ) -> Result<u32> {
        let mut ctx = store.as_context_mut();
        let (address, end) = ctx.data().allocator.reserve(size, align)?;

        let capacity = self.memory.data_size(&ctx) as u64;
        if end > capacity {
            let pages = (end - capacity).div_ceil(PAGE_SIZE);
            self.memory
                .grow(&mut ctx, pages)
                .map_err(|_| Error::Allocation {
                    requested: size,
                    needed: end,
                })?;
            tracing::trace!(pages, "grew spirit memory");
        }

        ctx.data_mut().allocator.commit(end);
        Ok(address)
    }

    /// Individual deallocation is unsupported; memory is reclaimed by `reset`.
    pub fn free(&self, _address: u32) {}

    /// Rewind the cursor to the heap base. Every address issued so far
    /// becomes invalid.
    pub fn reset(&self, mut store: impl AsContextMut<Data = SpiritState>) {
        store.as_context_mut().data_mut().allocator.reset();
    }

    pub fn cursor(&self, store: impl AsContext<Data = SpiritState>) -> u32 {
        store.as_context().data().allocator.cursor()
    }

    pub fn generation(&self, store: impl AsContext<Data = SpiritState>) -> u64 {
        store.as_context().data().allocator.generation()
    }

    pub fn read_bytes(&self, store: impl AsContext, address: u32, len: u32) -> Result<Vec<u8>> {
        // Lengths come from untrusted memory; check bounds before allocating.
        if address as u64 + len as u64 > self.memory.data_size(&store) as u64 {
            return Err(Error::MemoryAccess {
                address,
                len: len as u64,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.memory
            .read(&store, address as usize, &mut buf)
            .map_err(|_| Error::MemoryAccess {
                address,
                len: len as u64,
            })?;
        Ok(buf)
    }

    pub fn write_bytes(&self, mut store: impl AsContextMut, address: u32, bytes: &[u8]) -> Result<()> {
        self.memory
            .write(&mut store, address as usize, bytes)
            .map_err(|_| Error::MemoryAccess {
                address,
                len: bytes.len() as u64,
            })
    }

    fn read_array<const N: usize>(&self, store: impl AsContext, address: u32) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.memory
            .read(&store, address as usize, &mut buf)
            .map_err(|_| Error::MemoryAccess {
                address,
                len: N as u64,
            })?;
        Ok(buf)
    }

    /// Decode `len` raw UTF-8 bytes at `address`. Invalid sequences are
    /// replaced rather than rejected.
    pub fn read_str(&self, store: impl AsContext, address: u32, len: u32) -> Result<String> {
        let bytes = self.read_bytes(store, address, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Allocate and write a length-prefixed string, returning the prefix address.
    pub fn encode_string(
        &self,
        mut store: impl AsContextMut<Data = SpiritState>,
        s: &str,
    ) -> Result<u32> {
        let len = u32::try_from(s.len()).map_err(|_| Error::Allocation {
            requested: u32::MAX,
            needed: s.len() as u64 + 4,
        })?;
        let total = len.checked_add(4).ok_or(Error::Allocation {
            requested: len,
            needed: len as u64 + 4,
        })?;
        let address = self.alloc_aligned(&mut store, total, 4)?;
        let mut encoded = Vec::with_capacity(total as usize);
        encoded.extend_from_slice(&len.to_le_bytes());
        encoded.extend_from_slice(s.as_bytes());
        self.write_bytes(&mut store, address, &encoded)?;
        Ok(address)
    }

    /// Decode a length-prefixed string written by `encode_string` or by the
    /// Spirit itself. There is no sentinel; the address is trusted.
    pub fn decode_string(&self, store: impl AsContext, address: u32) -> Result<String> {
        let len = u32::from_le_bytes(self.read_array::<4>(&store, address)?);
        let start = address.checked_add(4).ok_or(Error::MemoryAccess {
            address,
            len: len as u64 + 4,
        })?;
        self.read_str(&store, start, len)
    }

    /// Read every field of `layout` at `address`. String fields are followed
    /// and decoded; a null string address reads as "".
    pub fn read_record(
        &self,
        store: impl AsContext,
        address: u32,
        layout: &GeneLayout,
    ) -> Result<Record> {
        let mut record = Record::new();
        for field in layout.fields() {
            let at = field_address(layout, &field.name, address, field.offset)?;
            let value = match field.ty {
                FieldType::I32 => FieldValue::I32(i32::from_le_bytes(self.read_array(&store, at)?)),
                FieldType::I64 => FieldValue::I64(i64::from_le_bytes(self.read_array(&store, at)?)),
                FieldType::F32 => FieldValue::F32(f32::from_le_bytes(self.read_array(&store, at)?)),
                FieldType::F64 => FieldValue::F64(f64::from_le_bytes(self.read_array(&store, at)?)),
                FieldType::Bool => {
                    FieldValue::Bool(i32::from_le_bytes(self.read_array(&store, at)?) != 0)
                }
                FieldType::String => {
                    let pointer = u32::from_le_bytes(self.read_array(&store, at)?);
                    if pointer == 0 {
                        FieldValue::Str(String::new())
                    } else {
                        FieldValue::Str(self.decode_string(&store, pointer)?)
                    }
                }
            };
            record.insert(field.name.clone(), value);
        }
        Ok(record)
    }

    /// Write every field of `layout` at `address` from `values`.
    ///
    /// String fields take [`FieldValue::Address`] of a string encoded
    /// beforehand; strings are never encoded implicitly. Every field is
    /// checked before the first byte is written, so a rejected record leaves
    /// memory untouched.
    pub fn write_record(
        &self,
        mut store: impl AsContextMut,
        address: u32,
        values: &Record,
        layout: &GeneLayout,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(layout.fields().len());
        for field in layout.fields() {
            let value = values.get(&field.name).ok_or_else(|| Error::Field {
                gene: layout.name().to_string(),
                field: field.name.clone(),
                reason: "missing value".to_string(),
            })?;
            let at = field_address(layout, &field.name, address, field.offset)?;
            let bytes: Vec<u8> = match (field.ty, value) {
                (FieldType::I32, FieldValue::I32(v)) => v.to_le_bytes().into(),
                (FieldType::I64, FieldValue::I64(v)) => v.to_le_bytes().into(),
                (FieldType::F32, FieldValue::F32(v)) => v.to_le_bytes().into(),
                (FieldType::F64, FieldValue::F64(v)) => v.to_le_bytes().into(),
                (FieldType::Bool, FieldValue::Bool(v)) => i32::from(*v).to_le_bytes().into(),
                (FieldType::String, FieldValue::Address(pointer)) => pointer.to_le_bytes().into(),
                (ty, other) => {
                    return Err(Error::Field {
                        gene: layout.name().to_string(),
                        field: field.name.clone(),
                        reason: format!("expected {ty} value, got {}", other.kind()),
                    });
                }
            };
            encoded.push((at, bytes));
        }

        if address as u64 + layout.size() as u64 > self.size(&store) {
            return Err(Error::MemoryAccess {
                address,
                len: layout.size() as u64,
            });
        }
        for (at, bytes) in encoded {
            self.write_bytes(&mut store, at, &bytes)?;
        }
        Ok(())
    }

    /// Allocate room for one instance of `layout` at its alignment.
    pub fn alloc_record(
        &self,
        store: impl AsContextMut<Data = SpiritState>,
        layout: &GeneLayout,
    ) -> Result<u32> {
        self.alloc_aligned(store, layout.size(), layout.alignment())
    }
}

fn field_address(layout: &GeneLayout, field: &str, base: u32, offset: u32) -> Result<u32> {
    base.checked_add(offset).ok_or_else(|| Error::Field {
        gene: layout.name().to_string(),
        field: field.to_string(),
        reason: format!("address {base} + offset {offset} overflows"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_aligns_forward() {
        let mut allocator = Allocator::new(1024);
        let (first, end) = allocator.reserve(3, 8).unwrap();
        assert_eq!(first, 1024);
        allocator.commit(end);
        let (second, end) = allocator.reserve(16, 8).unwrap();
        assert_eq!(second, 1032);
        allocator.commit(end);
        assert_eq!(allocator.cursor(), 1048);
    }

    #[test]
    fn addresses_never_overlap() {
        let mut allocator = Allocator::new(1024);
        let requests = [(1, 1), (7, 4), (13, 8), (2, 2), (64, 16), (5, 1), (9, 32)];
        let mut previous_end = 0u64;
        let mut previous_address = None;
        for (size, align) in requests {
            let (address, end) = allocator.reserve(size, align).unwrap();
            assert_eq!(address % align, 0);
            assert!(address as u64 >= previous_end);
            if let Some(prev) = previous_address {
                assert!(address > prev);
            }
            allocator.commit(end);
            previous_end = end;
            previous_address = Some(address);
        }
    }

    #[test]
    fn reset_restores_base_and_bumps_generation() {
        let mut allocator = Allocator::new(2048);
        let (_, end) = allocator.reserve(100, 8).unwrap();
        allocator.commit(end);
        allocator.reset();
        assert_eq!(allocator.cursor(), 2048);
        assert_eq!(allocator.generation(), 1);
    }

    #[test]
    fn reserve_ending_at_address_space_limit_fails() {
        let mut allocator = Allocator::new(u32::MAX - 31);
        let (_, end) = allocator.reserve(16, 1).unwrap();
        allocator.commit(end);
        assert!(matches!(
            allocator.reserve(16, 1),
            Err(Error::Allocation { requested: 16, needed }) if needed == 1 << 32
        ));
        assert_eq!(allocator.cursor(), u32::MAX - 15);
    }

    #[test]
    fn reserve_past_address_space_fails() {
        let allocator = Allocator::new(u32::MAX - 3);
        assert!(matches!(
            allocator.reserve(16, 4),
            Err(Error::Allocation { requested: 16, .. })
        ));
    }
}
