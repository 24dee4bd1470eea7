// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shadow doorbells.
//!
//! When the controller supports the Doorbell Buffer Config command, the driver
//! writes new doorbell values into a host memory page that the controller
//! polls, and the controller publishes an event index per doorbell in a second
//! page. An MMIO doorbell write is only needed when the new value moves past
//! the event index.
//!
//! Neither page is protected by a lock: the driver only writes the shadow
//! values and only reads the event indices, and fences order those accesses
//! against the queue entries and each other.

use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::HostDmaAllocator;

/// Returns true if moving a doorbell from `old` to `new` crosses `event_idx`,
/// meaning the controller asked to be notified with an MMIO write.
///
/// All arithmetic wraps at 16 bits.
pub(crate) fn need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}

/// The shadow doorbell and event index of one queue doorbell.
#[derive(Clone)]
pub(crate) struct ShadowDoorbell {
    dbs: MemoryBlock,
    eis: MemoryBlock,
    offset: usize,
}

impl ShadowDoorbell {
    /// Publishes `value` in the shadow doorbell and returns whether the MMIO
    /// doorbell must still be written.
    pub fn update_and_check(&self, value: u32) -> bool {
        // Queue entries must be visible before the new shadow value.
        fence(Ordering::Release);
        let old = self.dbs.read_u32(self.offset);
        self.dbs.write_u32(self.offset, value);
        // The shadow value must be visible before reading the event index.
        fence(Ordering::SeqCst);
        let event_idx = self.eis.read_u32(self.offset);
        need_event(event_idx as u16, value as u16, old as u16)
    }
}

/// The shadow doorbell and event index pages shared with the controller.
pub(crate) struct DoorbellBuffer {
    dbs: MemoryBlock,
    eis: MemoryBlock,
    stride: u32,
}

impl DoorbellBuffer {
    /// Allocates buffers with room for `queue_count` queue pairs at a
    /// doorbell stride of `stride` dwords.
    pub fn alloc(
        allocator: &dyn HostDmaAllocator,
        queue_count: usize,
        stride: u32,
    ) -> anyhow::Result<Self> {
        let size = (queue_count * 8 * stride as usize).next_multiple_of(PAGE_SIZE);
        let dbs = allocator.allocate_dma_buffer(size)?;
        let eis = allocator.allocate_dma_buffer(size)?;
        Ok(Self { dbs, eis, stride })
    }

    /// Zeroes both buffers, for reuse across a controller reset.
    pub fn clear(&self) {
        self.dbs.fill_zero();
        self.eis.fill_zero();
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn dbs_addr(&self) -> u64 {
        self.dbs.device_address(0)
    }

    pub fn eis_addr(&self) -> u64 {
        self.eis.device_address(0)
    }

    /// Returns the shadow for a queue doorbell. The admin queue never uses
    /// shadow doorbells.
    pub fn shadow(&self, qid: u16, completion: bool) -> Option<ShadowDoorbell> {
        if qid == 0 {
            return None;
        }
        let offset = (qid as usize * 2 + completion as usize) * self.stride as usize * 4;
        if offset + 4 > self.dbs.len() {
            return None;
        }
        Some(ShadowDoorbell {
            dbs: self.dbs.clone(),
            eis: self.eis.clone(),
            offset,
        })
    }

    #[cfg(test)]
    pub fn set_event_idx(&self, qid: u16, completion: bool, value: u32) {
        let offset = (qid as usize * 2 + completion as usize) * self.stride as usize * 4;
        self.eis.write_u32(offset, value);
    }

    #[cfg(test)]
    pub fn shadow_value(&self, qid: u16, completion: bool) -> u32 {
        let offset = (qid as usize * 2 + completion as usize) * self.stride as usize * 4;
        self.dbs.read_u32(offset)
    }
}
