//! Typed reads over a backend's raw byte reads.
//!
//! The target is x86-64, so every scalar is little-endian and every
//! pointer is eight bytes.

use byteorder::{ByteOrder, LE};
use tracing::trace;

use crate::backend::ProcessControl;
use crate::error::Result;
use crate::types::{Address, ProcessHandle};

/// Pointer width in the target
pub const POINTER_SIZE: u64 = 8;

/// Reads are chunked to this alignment when scanning for a terminator so a
/// short string next to an unmapped page doesn't fail the whole read.
const CSTRING_CHUNK: u64 = 32;

/// Read-only view of one attached process's memory
pub struct RemoteMemory<'a, B: ProcessControl + ?Sized>
{
    backend: &'a B,
    handle: &'a ProcessHandle,
}

impl<B: ProcessControl + ?Sized> Clone for RemoteMemory<'_, B>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<B: ProcessControl + ?Sized> Copy for RemoteMemory<'_, B> {}

impl<'a, B: ProcessControl + ?Sized> RemoteMemory<'a, B>
{
    /// Wrap a backend and the handle of the process to read from
    pub fn new(backend: &'a B, handle: &'a ProcessHandle) -> Self
    {
        Self { backend, handle }
    }

    /// The underlying backend
    pub fn backend(&self) -> &'a B
    {
        self.backend
    }

    /// The handle reads go to
    pub fn handle(&self) -> &'a ProcessHandle
    {
        self.handle
    }

    /// Read exactly `len` bytes
    ///
    /// ## Errors
    ///
    /// Returns `RemoteRead` if any part of the range is unmapped.
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        trace!(%address, len, "remote read");
        Ok(self.backend.read_memory(self.handle, address, len)?)
    }

    /// Read a `u64`
    pub fn read_u64(&self, address: Address) -> Result<u64>
    {
        Ok(LE::read_u64(&self.read_bytes(address, 8)?))
    }

    /// Read an `i64` (`Py_ssize_t`, `long`)
    pub fn read_i64(&self, address: Address) -> Result<i64>
    {
        Ok(LE::read_i64(&self.read_bytes(address, 8)?))
    }

    /// Read a `u32`
    pub fn read_u32(&self, address: Address) -> Result<u32>
    {
        Ok(LE::read_u32(&self.read_bytes(address, 4)?))
    }

    /// Read an `i32` (C `int`)
    pub fn read_i32(&self, address: Address) -> Result<i32>
    {
        Ok(LE::read_i32(&self.read_bytes(address, 4)?))
    }

    /// Read an `f64` (C `double`)
    pub fn read_f64(&self, address: Address) -> Result<f64>
    {
        Ok(LE::read_f64(&self.read_bytes(address, 8)?))
    }

    /// Read a pointer
    pub fn read_ptr(&self, address: Address) -> Result<Address>
    {
        self.read_u64(address).map(Address::new)
    }

    /// Read `count` consecutive pointers in one backend call
    pub fn read_ptrs(&self, address: Address, count: usize) -> Result<Vec<Address>>
    {
        let bytes = self.read_bytes(address, count * POINTER_SIZE as usize)?;
        Ok(bytes.chunks_exact(8).map(|word| Address::new(LE::read_u64(word))).collect())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    ///
    /// Returns the decoded text and whether it was cut at `max_len` before a
    /// terminator was found.
    ///
    /// ## Errors
    ///
    /// Returns `RemoteRead` if the first byte is unreadable or the string
    /// runs into unmapped memory before terminating.
    pub fn read_cstring(&self, address: Address, max_len: usize) -> Result<(String, bool)>
    {
        let mut bytes = Vec::new();
        let mut cursor = address;

        while bytes.len() < max_len {
            let to_boundary = CSTRING_CHUNK - (cursor.value() % CSTRING_CHUNK);
            let want = (to_boundary as usize).min(max_len - bytes.len());
            let chunk = self.read_bytes(cursor, want)?;

            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Ok((String::from_utf8_lossy(&bytes).into_owned(), false));
            }

            bytes.extend_from_slice(&chunk);
            cursor = cursor + want as u64;
        }

        Ok((String::from_utf8_lossy(&bytes).into_owned(), true))
    }
}
