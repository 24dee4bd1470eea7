// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure for implementing PCI drivers in user mode.

#![forbid(unsafe_code)]

use interrupt::DeviceInterrupt;
use memory::MemoryBlock;
use std::sync::Arc;

pub mod backoff;
pub mod emulated;
pub mod interrupt;
pub mod memory;

/// An interface to access device hardware.
pub trait DeviceBacking: 'static + Send {
    /// An object for accessing device registers.
    type Registers: 'static + DeviceRegisterIo;
    /// An object for allocating host memory to share with the device.
    type DmaAllocator: 'static + HostDmaAllocator;

    /// Returns a device ID for diagnostics.
    fn id(&self) -> &str;

    /// Maps a BAR.
    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers>;

    /// Returns an object that can allocate host memory to be shared with the device.
    fn host_allocator(&self) -> Self::DmaAllocator;

    /// Returns the maximum number of interrupts that can be mapped.
    fn max_interrupt_count(&self) -> u32;

    /// Maps MSI-X vector `msix` to a new interrupt target, routed to `cpu`.
    fn map_interrupt(&mut self, msix: u32, cpu: u32) -> anyhow::Result<DeviceInterrupt>;

    /// The NUMA node the device is attached to.
    fn numa_node(&self) -> u16 {
        0
    }

    /// Returns the IOMMU domain translating the device's DMA, if there is one.
    ///
    /// Without an IOMMU, host addresses are used directly by the device.
    fn iommu(&self) -> Option<Arc<dyn IommuDomain>> {
        None
    }
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// An allocator of memory that is physically contiguous and visible to the
/// device.
pub trait HostDmaAllocator: Send + Sync {
    /// Allocates a zeroed, page aligned block of `len` bytes.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}

/// An error returned when an IOMMU domain cannot satisfy a mapping.
#[derive(Debug, thiserror::Error)]
pub enum IommuError {
    /// No mapping entries are left in the domain.
    #[error("iommu mapping entries exhausted")]
    Exhausted,
    /// The domain rejected the mapping.
    #[error("invalid iommu mapping request")]
    Invalid,
}

/// An IOMMU translation domain for a device.
pub trait IommuDomain: Send + Sync {
    /// Maps the host pages `pfns`, in order, to a contiguous range of I/O
    /// virtual addresses and returns the base address of that range.
    fn map(&self, pfns: &[u64]) -> Result<u64, IommuError>;

    /// Unmaps `page_count` pages starting at the page aligned `iova`.
    fn unmap(&self, iova: u64, page_count: usize);
}
