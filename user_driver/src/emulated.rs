// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This implements the user-mode driver device traits using an emulated PCI
//! device running in the same process.
//!
//! The emulated device sees host memory through [`DeviceDma`], which
//! optionally translates addresses through an [`EmulatedIommu`].

use crate::interrupt::DeviceInterrupt;
use crate::interrupt::DeviceInterruptSource;
use crate::memory::atomic_read;
use crate::memory::atomic_write;
use crate::memory::page_words;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::memory::PAGE_SIZE64;
use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::HostDmaAllocator;
use crate::IommuDomain;
use crate::IommuError;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// MMIO handling for an emulated device.
pub trait MmioIntercept: Send {
    /// Handles a read of `data.len()` bytes at `addr`.
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);
    /// Handles a write of `data` at `addr`.
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}

/// An emulated device.
pub struct EmulatedDevice<T> {
    device: Arc<Mutex<T>>,
    interrupts: MsiInterruptSet,
    shared_mem: DeviceSharedMemory,
    iommu: Option<Arc<EmulatedIommu>>,
}

impl<T: MmioIntercept> EmulatedDevice<T> {
    /// Creates a new emulated device, wrapping `device`, signaling interrupts
    /// through `interrupts`.
    pub fn new(device: T, interrupts: MsiInterruptSet, shared_mem: DeviceSharedMemory) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            interrupts,
            shared_mem,
            iommu: None,
        }
    }

    /// Routes driver DMA mappings through `iommu`.
    pub fn with_iommu(mut self, iommu: Arc<EmulatedIommu>) -> Self {
        self.iommu = Some(iommu);
        self
    }

    /// Returns the wrapped device, for inspection and fault injection.
    pub fn device(&self) -> Arc<Mutex<T>> {
        self.device.clone()
    }
}

/// The MSI-X vectors of an emulated device.
#[derive(Clone)]
pub struct MsiInterruptSet {
    events: Arc<[DeviceInterruptSource]>,
}

impl MsiInterruptSet {
    pub fn new(count: usize) -> Self {
        Self {
            events: (0..count).map(|_| DeviceInterruptSource::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Signals MSI-X vector `vector`.
    pub fn signal(&self, vector: u16) {
        if let Some(event) = self.events.get(vector as usize) {
            tracing::trace!(vector, "signaling interrupt");
            event.signal();
        } else {
            tracing::info!(vector, "interrupt ignored");
        }
    }
}

/// A memory mapping for an [`EmulatedDevice`].
pub struct Mapping<T> {
    device: Arc<Mutex<T>>,
    addr: u64,
}

/// Memory shared between the driver and an emulated device.
///
/// Addresses handed to the device are byte offsets into this arena. Page zero
/// is never allocated so that a zero address is always invalid.
#[derive(Clone)]
pub struct DeviceSharedMemory {
    inner: Arc<SharedMemoryInner>,
}

struct SharedMemoryInner {
    words: Box<[AtomicU32]>,
    pages: usize,
    state: Mutex<Vec<u64>>,
}

/// An access outside the shared memory arena.
#[derive(Debug, thiserror::Error)]
#[error("address {0:#x} is outside of shared memory")]
pub struct OutOfRange(pub u64);

impl DeviceSharedMemory {
    pub fn new(size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        let pages = size / PAGE_SIZE;
        assert!(pages > 1);
        let mut state = vec![0u64; pages.div_ceil(64)];
        state[0] |= 1;
        Self {
            inner: Arc::new(SharedMemoryInner {
                words: (0..size / 4).map(|_| AtomicU32::new(0)).collect(),
                pages,
                state: Mutex::new(state),
            }),
        }
    }

    /// Allocates `len` bytes, rounded up to whole pages, of physically
    /// contiguous memory.
    pub fn alloc(&self, len: usize) -> Option<DmaBuffer> {
        let count = len.div_ceil(PAGE_SIZE).max(1);

        // Find a contiguous free range by scanning the state bitmap.
        let start_page = {
            let mut state = self.inner.state.lock();
            let mut i = 0;
            let mut contig = 0;
            while contig < count && i < self.inner.pages {
                if state[i / 64] & 1 << (i % 64) != 0 {
                    contig = 0;
                } else {
                    contig += 1;
                }
                i += 1;
            }
            if contig < count {
                return None;
            }
            let start = i - contig;
            for j in start..i {
                state[j / 64] |= 1 << (j % 64);
            }
            start
        };

        let buffer = DmaBuffer {
            mem: self.clone(),
            start: start_page,
            pfns: (start_page..start_page + count).map(|p| p as u64).collect(),
        };
        for word in buffer.words() {
            word.store(0, Ordering::Relaxed);
        }
        Some(buffer)
    }

    /// Returns the number of pages currently allocated, including the reserved
    /// first page.
    pub fn allocated_pages(&self) -> usize {
        self.inner
            .state
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    fn range(&self, addr: u64, len: usize) -> Result<usize, OutOfRange> {
        let end = addr.checked_add(len as u64).ok_or(OutOfRange(addr))?;
        if end > (self.inner.words.len() * 4) as u64 {
            return Err(OutOfRange(addr));
        }
        Ok(addr as usize)
    }

    /// Reads physical memory.
    pub fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), OutOfRange> {
        let offset = self.range(addr, data.len())?;
        atomic_read(&self.inner.words, offset, data);
        Ok(())
    }

    /// Writes physical memory.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), OutOfRange> {
        let offset = self.range(addr, data.len())?;
        atomic_write(&self.inner.words, offset, data);
        Ok(())
    }

    /// Atomically reads the aligned 32-bit value at `addr`.
    pub fn read_u32(&self, addr: u64) -> Result<u32, OutOfRange> {
        let offset = self.range(addr, 4)?;
        if offset % 4 != 0 {
            return Err(OutOfRange(addr));
        }
        Ok(self.inner.words[offset / 4].load(Ordering::Relaxed))
    }

    /// Atomically writes the aligned 32-bit value at `addr`.
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), OutOfRange> {
        let offset = self.range(addr, 4)?;
        if offset % 4 != 0 {
            return Err(OutOfRange(addr));
        }
        self.inner.words[offset / 4].store(value, Ordering::Relaxed);
        Ok(())
    }
}

/// A physically contiguous allocation from [`DeviceSharedMemory`].
pub struct DmaBuffer {
    mem: DeviceSharedMemory,
    start: usize,
    pfns: Vec<u64>,
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut state = self.mem.inner.state.lock();
        for &pfn in &self.pfns {
            state[pfn as usize / 64] &= !(1 << (pfn % 64));
        }
    }
}

impl MappedDmaTarget for DmaBuffer {
    fn words(&self) -> &[AtomicU32] {
        page_words(&self.mem.inner.words, self.start, self.pfns.len())
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

pub struct EmulatedDmaAllocator {
    shared_mem: DeviceSharedMemory,
}

impl HostDmaAllocator for EmulatedDmaAllocator {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        let buffer = self.shared_mem.alloc(len).context("out of memory")?;
        Ok(MemoryBlock::new(buffer).subblock(0, len))
    }
}

/// The first I/O virtual address handed out by [`EmulatedIommu`]. Addresses
/// below this are untranslated physical addresses.
pub const IOVA_BASE: u64 = 1 << 40;

/// An emulated IOMMU with a fixed number of page mapping entries.
pub struct EmulatedIommu {
    table: Mutex<Vec<Option<u64>>>,
    double_unmaps: AtomicUsize,
}

impl EmulatedIommu {
    /// Creates an IOMMU domain with room for `entries` page mappings.
    pub fn new(entries: usize) -> Self {
        Self {
            table: Mutex::new(vec![None; entries]),
            double_unmaps: AtomicUsize::new(0),
        }
    }

    /// Translates an I/O virtual address to a physical address.
    pub fn translate(&self, iova: u64) -> Option<u64> {
        let page = iova.checked_sub(IOVA_BASE)? / PAGE_SIZE64;
        let pfn = (*self.table.lock().get(page as usize)?)?;
        Some(pfn * PAGE_SIZE64 + iova % PAGE_SIZE64)
    }

    /// The number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.table.lock().iter().filter(|e| e.is_some()).count()
    }

    /// The number of pages that were unmapped while not mapped.
    pub fn double_unmaps(&self) -> usize {
        self.double_unmaps.load(Ordering::Relaxed)
    }
}

impl IommuDomain for EmulatedIommu {
    fn map(&self, pfns: &[u64]) -> Result<u64, IommuError> {
        if pfns.is_empty() {
            return Err(IommuError::Invalid);
        }
        let mut table = self.table.lock();
        let mut contig = 0;
        for i in 0..table.len() {
            if table[i].is_some() {
                contig = 0;
                continue;
            }
            contig += 1;
            if contig == pfns.len() {
                let start = i + 1 - contig;
                for (entry, &pfn) in table[start..=i].iter_mut().zip(pfns) {
                    *entry = Some(pfn);
                }
                return Ok(IOVA_BASE + start as u64 * PAGE_SIZE64);
            }
        }
        Err(IommuError::Exhausted)
    }

    fn unmap(&self, iova: u64, page_count: usize) {
        let Some(offset) = iova.checked_sub(IOVA_BASE) else {
            self.double_unmaps.fetch_add(page_count, Ordering::Relaxed);
            return;
        };
        let start = (offset / PAGE_SIZE64) as usize;
        let mut table = self.table.lock();
        for i in start..start + page_count {
            match table.get_mut(i) {
                Some(entry @ Some(_)) => *entry = None,
                _ => {
                    self.double_unmaps.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// An error accessing memory from the device side.
#[derive(Debug, thiserror::Error)]
pub enum DmaError {
    #[error("iova {0:#x} is not mapped")]
    NotMapped(u64),
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
}

/// The device's view of host memory.
#[derive(Clone)]
pub struct DeviceDma {
    mem: DeviceSharedMemory,
    iommu: Option<Arc<EmulatedIommu>>,
}

impl DeviceDma {
    pub fn new(mem: DeviceSharedMemory, iommu: Option<Arc<EmulatedIommu>>) -> Self {
        Self { mem, iommu }
    }

    /// Calls `f` with each physical chunk of `addr..addr + len`, split at page
    /// boundaries.
    fn for_each_chunk(
        &self,
        addr: u64,
        len: usize,
        mut f: impl FnMut(u64, usize, usize) -> Result<(), DmaError>,
    ) -> Result<(), DmaError> {
        let mut done = 0;
        while done < len {
            let cur = addr + done as u64;
            let n = (PAGE_SIZE - (cur % PAGE_SIZE64) as usize).min(len - done);
            let phys = match &self.iommu {
                Some(iommu) if cur >= IOVA_BASE => {
                    iommu.translate(cur).ok_or(DmaError::NotMapped(cur))?
                }
                _ => cur,
            };
            f(phys, done, n)?;
            done += n;
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), DmaError> {
        self.for_each_chunk(addr, data.len(), |phys, pos, n| {
            Ok(self.mem.read_at(phys, &mut data[pos..pos + n])?)
        })
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        self.for_each_chunk(addr, data.len(), |phys, pos, n| {
            Ok(self.mem.write_at(phys, &data[pos..pos + n])?)
        })
    }

    pub fn read_obj<T: zerocopy::FromBytes + zerocopy::IntoBytes>(
        &self,
        addr: u64,
    ) -> Result<T, DmaError> {
        let mut obj = T::new_zeroed();
        self.read(addr, obj.as_mut_bytes())?;
        Ok(obj)
    }

    pub fn write_obj<T: zerocopy::IntoBytes + zerocopy::Immutable>(
        &self,
        addr: u64,
        obj: &T,
    ) -> Result<(), DmaError> {
        self.write(addr, obj.as_bytes())
    }

    /// Memory shared with the driver is never remapped, so 32-bit accesses
    /// to doorbell buffers use physical addresses directly.
    pub fn read_u32(&self, addr: u64) -> Result<u32, DmaError> {
        Ok(self.mem.read_u32(addr)?)
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), DmaError> {
        Ok(self.mem.write_u32(addr, value)?)
    }
}

impl<T: 'static + MmioIntercept> DeviceBacking for EmulatedDevice<T> {
    type Registers = Mapping<T>;
    type DmaAllocator = EmulatedDmaAllocator;

    fn id(&self) -> &str {
        "emulated"
    }

    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers> {
        Ok(Mapping {
            device: self.device.clone(),
            addr: (n as u64) << 32,
        })
    }

    fn host_allocator(&self) -> Self::DmaAllocator {
        EmulatedDmaAllocator {
            shared_mem: self.shared_mem.clone(),
        }
    }

    fn max_interrupt_count(&self) -> u32 {
        self.interrupts.len() as u32
    }

    fn map_interrupt(&mut self, msix: u32, _cpu: u32) -> anyhow::Result<DeviceInterrupt> {
        Ok(self
            .interrupts
            .events
            .get(msix as usize)
            .with_context(|| format!("invalid msix index {msix}"))?
            .new_target())
    }

    fn iommu(&self) -> Option<Arc<dyn IommuDomain>> {
        self.iommu
            .clone()
            .map(|iommu| iommu as Arc<dyn IommuDomain>)
    }
}

impl<T: MmioIntercept> DeviceRegisterIo for Mapping<T> {
    fn read_u32(&self, offset: usize) -> u32 {
        let mut n = [0; 4];
        self.device
            .lock()
            .mmio_read(self.addr + offset as u64, &mut n);
        u32::from_ne_bytes(n)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut n = [0; 8];
        self.device
            .lock()
            .mmio_read(self.addr + offset as u64, &mut n);
        u64::from_ne_bytes(n)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.device
            .lock()
            .mmio_write(self.addr + offset as u64, &data.to_ne_bytes());
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.device
            .lock()
            .mmio_write(self.addr + offset as u64, &data.to_ne_bytes());
    }
}
