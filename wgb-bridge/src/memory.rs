// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Typed view over the guest's linear memory.
//!
//! All multi-byte accessors are little-endian. 64-bit integers are stored as
//! two 32-bit halves: the low word at the base address and the high word at
//! +4, sign-extended on reads and truncated on writes. Every access is
//! bounds-checked against the current buffer length.
//!
//! The view holds the shared buffer handle, not a raw slice, so it stays
//! usable across guest memory growth. The bridge still drops and rebuilds its
//! cached view when the guest reports a memory reallocation, mirroring the
//! contract that a view is only guaranteed stable between reallocations.

use crate::prelude::*;

/// Shared handle to the guest's linear memory buffer.
///
/// The guest module owns the buffer; the bridge and the guest both reach it
/// through this handle. Growth reallocates the `Vec` in place, so the handle
/// itself never dangles.
pub type SharedMemory = Rc<RefCell<Vec<u8>>>;

/// Create a fresh zero-filled linear memory buffer of `len` bytes.
#[must_use]
pub fn new_shared_memory(len: usize) -> SharedMemory {
    Rc::new(RefCell::new(vec![0u8; len]))
}

const OOB: Error = Error::new(
    ErrorCategory::Memory,
    codes::MEMORY_OUT_OF_BOUNDS,
    "Guest memory access out of bounds",
);

const OVERFLOW: Error = Error::new(
    ErrorCategory::Memory,
    codes::ADDRESS_OVERFLOW,
    "Guest memory address arithmetic overflowed",
);

/// Typed little-endian reader/writer over a guest memory buffer.
#[derive(Clone)]
pub struct MemoryView {
    buffer: SharedMemory,
}

impl fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryView").field("len", &self.len()).finish()
    }
}

impl MemoryView {
    /// Create a view over the given shared buffer.
    #[must_use]
    pub fn new(buffer: SharedMemory) -> Self {
        Self { buffer }
    }

    /// Current length of the underlying buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.borrow().len()
    }

    /// Whether the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, addr: u64, len: usize) -> Result<(usize, usize)> {
        let start = usize::try_from(addr).map_err(|_| OVERFLOW)?;
        let end = start.checked_add(len).ok_or(OVERFLOW)?;
        if end > self.buffer.borrow().len() {
            return Err(OOB);
        }
        Ok((start, end))
    }

    /// Read a single byte.
    pub fn get_u8(&self, addr: u64) -> Result<u8> {
        let (start, _) = self.range(addr, 1)?;
        Ok(self.buffer.borrow()[start])
    }

    /// Write a single byte.
    pub fn set_u8(&self, addr: u64, value: u8) -> Result<()> {
        let (start, _) = self.range(addr, 1)?;
        self.buffer.borrow_mut()[start] = value;
        Ok(())
    }

    /// Read a little-endian unsigned 32-bit word.
    pub fn get_u32(&self, addr: u64) -> Result<u32> {
        let (start, end) = self.range(addr, 4)?;
        let buf = self.buffer.borrow();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[start..end]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian unsigned 32-bit word.
    pub fn set_u32(&self, addr: u64, value: u32) -> Result<()> {
        let (start, end) = self.range(addr, 4)?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a little-endian signed 32-bit word.
    pub fn get_i32(&self, addr: u64) -> Result<i32> {
        Ok(self.get_u32(addr)? as i32)
    }

    /// Write a little-endian signed 32-bit word.
    pub fn set_i32(&self, addr: u64, value: i32) -> Result<()> {
        self.set_u32(addr, value as u32)
    }

    /// Read a 64-bit integer stored as two 32-bit halves.
    ///
    /// The low word sits at `addr`, the high word at `addr + 4` and is
    /// sign-extended.
    pub fn get_i64(&self, addr: u64) -> Result<i64> {
        let low = self.get_u32(addr)?;
        let high = self.get_i32(addr + 4)?;
        Ok(i64::from(low) | (i64::from(high) << 32))
    }

    /// Write a 64-bit integer as two 32-bit halves (high word truncated).
    pub fn set_i64(&self, addr: u64, value: i64) -> Result<()> {
        self.set_u32(addr, value as u32)?;
        self.set_u32(addr + 4, (value >> 32) as u32)
    }

    /// Read an IEEE-754 double.
    pub fn get_f64(&self, addr: u64) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64_bits(addr)?))
    }

    /// Write an IEEE-754 double.
    pub fn set_f64(&self, addr: u64, value: f64) -> Result<()> {
        self.set_u64_bits(addr, value.to_bits())
    }

    /// Read the raw bit pattern of an 8-byte slot.
    pub fn get_u64_bits(&self, addr: u64) -> Result<u64> {
        let (start, end) = self.range(addr, 8)?;
        let buf = self.buffer.borrow();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[start..end]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write the raw bit pattern of an 8-byte slot.
    pub fn set_u64_bits(&self, addr: u64, bits: u64) -> Result<()> {
        let (start, end) = self.range(addr, 8)?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(&bits.to_le_bytes());
        Ok(())
    }

    /// Copy `len` bytes out of guest memory.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let (start, end) = self.range(addr, len)?;
        Ok(self.buffer.borrow()[start..end].to_vec())
    }

    /// Copy bytes into guest memory.
    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let (start, end) = self.range(addr, bytes.len())?;
        self.buffer.borrow_mut()[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> MemoryView {
        MemoryView::new(new_shared_memory(64))
    }

    #[test]
    fn u32_round_trip_little_endian() {
        let v = view();
        v.set_u32(8, 0x1234_5678).unwrap();
        assert_eq!(v.get_u32(8).unwrap(), 0x1234_5678);
        assert_eq!(v.read_bytes(8, 4).unwrap(), vec![0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn i64_stored_as_two_halves() {
        let v = view();
        v.set_i64(0, -2).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 0xFFFF_FFFE);
        assert_eq!(v.get_u32(4).unwrap(), 0xFFFF_FFFF);
        assert_eq!(v.get_i64(0).unwrap(), -2);

        let big = (5_i64 << 32) | 7;
        v.set_i64(16, big).unwrap();
        assert_eq!(v.get_u32(16).unwrap(), 7);
        assert_eq!(v.get_u32(20).unwrap(), 5);
        assert_eq!(v.get_i64(16).unwrap(), big);
    }

    #[test]
    fn f64_round_trip() {
        let v = view();
        v.set_f64(24, 6.25).unwrap();
        assert_eq!(v.get_f64(24).unwrap(), 6.25);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let v = view();
        assert!(v.get_u32(61).is_err());
        assert!(v.set_f64(60, 1.0).is_err());
        assert!(v.read_bytes(0, 65).is_err());
        assert!(v.get_u8(u64::MAX).is_err());
    }

    #[test]
    fn view_follows_buffer_growth() {
        let mem = new_shared_memory(8);
        let v = MemoryView::new(mem.clone());
        assert!(v.set_u32(12, 1).is_err());
        mem.borrow_mut().resize(32, 0);
        v.set_u32(12, 1).unwrap();
        assert_eq!(v.get_u32(12).unwrap(), 1);
    }
}
