// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver tunables.

use std::time::Duration;
use user_driver::memory::PAGE_SIZE;

/// Controller configuration, sampled at every reset.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Requested I/O queue depth, clamped to what the controller supports.
    pub io_queue_depth: u16,
    /// Number of I/O queues to request before adding write and poll queues.
    pub max_io_queues: u16,
    /// Number of queues dedicated to writes. Zero shares queues between reads
    /// and writes.
    pub write_queues: u16,
    /// Number of polled queues, which are created without an interrupt.
    pub poll_queues: u16,
    /// Minimum average segment size for which SGLs are preferred over PRPs.
    /// Zero disables SGLs for data unless they are required.
    pub sgl_threshold: u32,
    pub admin_timeout: Duration,
    pub io_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Use shadow doorbells when the controller supports them.
    pub use_doorbell_buffer: bool,
    /// Preferred host memory buffer size. Zero disables the host memory
    /// buffer.
    pub host_memory_buffer_bytes: u64,
    pub max_segments: usize,
    pub max_transfer_bytes: u32,
}

impl ControllerConfig {
    /// Data segments that fit in one page of SGL descriptors.
    pub const MAX_SEGMENTS: usize = PAGE_SIZE / 16;
    /// Integrity segments that fit in a small descriptor after the segment
    /// descriptor.
    pub const MAX_META_SEGMENTS: usize = 15;
    pub const MAX_TRANSFER_BYTES: u32 = 8 << 20;

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(2..=4095).contains(&self.io_queue_depth) {
            anyhow::bail!("invalid io queue depth {}", self.io_queue_depth);
        }
        if self.max_io_queues == 0 {
            anyhow::bail!("at least one io queue is required");
        }
        if self.max_segments == 0 || self.max_segments > Self::MAX_SEGMENTS {
            anyhow::bail!("invalid segment limit {}", self.max_segments);
        }
        if self.max_transfer_bytes == 0 || self.max_transfer_bytes > Self::MAX_TRANSFER_BYTES {
            anyhow::bail!("invalid transfer limit {:#x}", self.max_transfer_bytes);
        }
        if self.admin_timeout.is_zero() || self.io_timeout.is_zero() {
            anyhow::bail!("timeouts must be non-zero");
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            io_queue_depth: 1024,
            max_io_queues: 4,
            write_queues: 0,
            poll_queues: 0,
            sgl_threshold: 32 * 1024,
            admin_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            use_doorbell_buffer: true,
            host_memory_buffer_bytes: 0,
            max_segments: Self::MAX_SEGMENTS,
            max_transfer_bytes: Self::MAX_TRANSFER_BYTES,
        }
    }
}
