// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing host memory with the device.
//!
//! Shared memory is exposed as a slice of [`AtomicU32`] words, each holding
//! four bytes of memory in little-endian order.
//! The device can observe the memory at any time, so all accesses go through
//! atomics; naturally aligned 32-bit accesses are single-copy atomic, which is
//! what doorbell buffers rely on.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// The 4KB page size used by user-mode devices.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE32: u32 = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;

/// A mapped buffer that can be accessed by the host or the device.
pub trait MappedDmaTarget: Send + Sync {
    /// The memory, starting at the beginning of the first page in
    /// [`Self::pfns`].
    fn words(&self) -> &[AtomicU32];

    /// 4KB page numbers used to refer to the memory when communicating with the
    /// device.
    fn pfns(&self) -> &[u64];
}

/// A DMA target.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn MappedDmaTarget>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new<T: 'static + MappedDmaTarget>(mem: T) -> Self {
        let len = mem.words().len() * 4;
        Self {
            mem: Arc::new(mem),
            offset: 0,
            len,
        }
    }

    /// Returns a view of a subset of the buffer.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(offset <= self.len && self.len - offset >= len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gets the PFNs of the pages spanned by this block.
    pub fn pfns(&self) -> &[u64] {
        let start = self.offset / PAGE_SIZE;
        let end = (self.offset + self.len).div_ceil(PAGE_SIZE);
        &self.mem.pfns()[start..end]
    }

    /// Returns the offset of the beginning of the buffer in the first page
    /// returned by [`Self::pfns`].
    pub fn offset_in_page(&self) -> u32 {
        (self.offset % PAGE_SIZE) as u32
    }

    /// Returns the device-visible address of the byte at `offset`.
    pub fn device_address(&self, offset: usize) -> u64 {
        let abs = self.offset + offset;
        self.mem.pfns()[abs / PAGE_SIZE] * PAGE_SIZE64 + (abs % PAGE_SIZE) as u64
    }

    fn check(&self, offset: usize, len: usize) -> usize {
        assert!(
            offset <= self.len && self.len - offset >= len,
            "access out of bounds: {offset:#x}+{len:#x} > {:#x}",
            self.len
        );
        self.offset + offset
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let offset = self.check(offset, data.len());
        atomic_read(self.mem.words(), offset, data);
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let offset = self.check(offset, data.len());
        atomic_write(self.mem.words(), offset, data);
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    /// Reads the naturally aligned 32-bit value at `offset` with a single
    /// atomic load.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let offset = self.check(offset, 4);
        assert_eq!(offset % 4, 0);
        self.mem.words()[offset / 4].load(Relaxed)
    }

    /// Writes the naturally aligned 32-bit value at `offset` with a single
    /// atomic store.
    pub fn write_u32(&self, offset: usize, value: u32) {
        let offset = self.check(offset, 4);
        assert_eq!(offset % 4, 0);
        self.mem.words()[offset / 4].store(value, Relaxed);
    }

    /// Writes a little-endian 64-bit value at the 8-byte aligned `offset`.
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_at(offset, &value.to_le_bytes());
    }

    /// Reads a little-endian 64-bit value from the 8-byte aligned `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut v = [0; 8];
        self.read_at(offset, &mut v);
        u64::from_le_bytes(v)
    }

    /// Zeroes the whole block.
    pub fn fill_zero(&self) {
        let mut offset = 0;
        let zero = [0; 256];
        while offset < self.len {
            let n = (self.len - offset).min(zero.len());
            self.write_at(offset, &zero[..n]);
            offset += n;
        }
    }
}

/// Reads `data.len()` bytes at byte `offset` of `words`.
pub(crate) fn atomic_read(words: &[AtomicU32], offset: usize, data: &mut [u8]) {
    let mut pos = 0;
    while pos < data.len() {
        let abs = offset + pos;
        let word = words[abs / 4].load(Relaxed).to_le_bytes();
        let start = abs % 4;
        let n = (4 - start).min(data.len() - pos);
        data[pos..pos + n].copy_from_slice(&word[start..start + n]);
        pos += n;
    }
}

/// Writes `data` at byte `offset` of `words`. Partially covered words are
/// merged with a compare-exchange loop so that concurrent writers of adjacent
/// bytes do not clobber each other.
pub(crate) fn atomic_write(words: &[AtomicU32], offset: usize, data: &[u8]) {
    let mut pos = 0;
    while pos < data.len() {
        let abs = offset + pos;
        let start = abs % 4;
        let n = (4 - start).min(data.len() - pos);
        let word = &words[abs / 4];
        if n == 4 {
            let v = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            word.store(v, Relaxed);
        } else {
            let chunk = &data[pos..pos + n];
            let _ = word.fetch_update(Relaxed, Relaxed, |old| {
                let mut bytes = old.to_le_bytes();
                bytes[start..start + n].copy_from_slice(chunk);
                Some(u32::from_le_bytes(bytes))
            });
        }
        pos += n;
    }
}

/// Returns the word range backing pages `start..start + count`.
pub(crate) fn page_words(words: &[AtomicU32], start: usize, count: usize) -> &[AtomicU32] {
    &words[start * WORDS_PER_PAGE..(start + count) * WORDS_PER_PAGE]
}
