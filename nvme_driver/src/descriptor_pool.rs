// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pools of device-visible descriptor memory, used for PRP lists and SGL
//! segments.
//!
//! Each NUMA node gets a small pool (256 byte slots) and a large pool (one
//! controller page per slot). Pools grow on demand in fixed size chunks up to a
//! byte limit. Allocation never waits: when a pool is at its limit or the host
//! allocator fails, the caller gets [`PoolError`] and is expected to fail the
//! request with a retryable status.

use super::spec;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::HostDmaAllocator;

/// Size of a small pool slot.
pub(crate) const SMALL_POOL_SIZE: usize = 256;
/// Size of a large pool slot, one controller page.
pub(crate) const LARGE_POOL_SIZE: usize = PAGE_SIZE;

const CHUNK_SIZE: usize = 16 * PAGE_SIZE;
const DEFAULT_POOL_LIMIT: usize = 4 << 20;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{0} descriptor pool is at its limit")]
    Exhausted(&'static str),
    #[error("failed to grow {0} descriptor pool")]
    Allocation(&'static str, #[source] anyhow::Error),
}

/// A fixed slot size pool of device-visible memory.
pub(crate) struct Pool {
    name: &'static str,
    slot_size: usize,
    limit: usize,
    allocator: Arc<dyn HostDmaAllocator>,
    core: Mutex<PoolCore>,
}

struct PoolCore {
    chunks: Vec<MemoryBlock>,
    free: Vec<(usize, usize)>,
    outstanding: usize,
}

impl Pool {
    fn new(
        name: &'static str,
        slot_size: usize,
        limit: usize,
        allocator: Arc<dyn HostDmaAllocator>,
    ) -> Self {
        assert!(CHUNK_SIZE % slot_size == 0);
        Self {
            name,
            slot_size,
            limit,
            allocator,
            core: Mutex::new(PoolCore {
                chunks: Vec::new(),
                free: Vec::new(),
                outstanding: 0,
            }),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The number of slots currently handed out.
    pub fn outstanding(&self) -> usize {
        self.core.lock().outstanding
    }

    /// Allocates a zeroed slot.
    pub fn alloc(self: &Arc<Self>) -> Result<Descriptor, PoolError> {
        let mut core = self.core.lock();
        let (chunk, slot) = match core.free.pop() {
            Some(v) => v,
            None => {
                if (core.chunks.len() + 1) * CHUNK_SIZE > self.limit {
                    return Err(PoolError::Exhausted(self.name));
                }
                let mem = self
                    .allocator
                    .allocate_dma_buffer(CHUNK_SIZE)
                    .map_err(|err| PoolError::Allocation(self.name, err))?;
                let chunk = core.chunks.len();
                core.chunks.push(mem);
                let slots = CHUNK_SIZE / self.slot_size;
                core.free.extend((1..slots).rev().map(|slot| (chunk, slot)));
                (chunk, 0)
            }
        };
        core.outstanding += 1;
        let mem = core.chunks[chunk].subblock(slot * self.slot_size, self.slot_size);
        drop(core);
        mem.fill_zero();
        Ok(Descriptor {
            pool: self.clone(),
            chunk,
            slot,
            addr: mem.device_address(0),
            mem,
        })
    }

    fn free(&self, chunk: usize, slot: usize) {
        let mut core = self.core.lock();
        core.outstanding -= 1;
        core.free.push((chunk, slot));
    }
}

/// A slot from a [`Pool`], returned to the pool on drop.
pub(crate) struct Descriptor {
    pool: Arc<Pool>,
    chunk: usize,
    slot: usize,
    addr: u64,
    mem: MemoryBlock,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("pool", &self.pool.name)
            .field("addr", &format_args!("{:#x}", self.addr))
            .finish()
    }
}

impl Descriptor {
    /// The device address of the slot.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_small(&self) -> bool {
        self.pool.slot_size == SMALL_POOL_SIZE
    }

    /// Writes the `index`th 8-byte entry.
    pub fn write_u64(&self, index: usize, value: u64) {
        self.mem.write_u64(index * 8, value);
    }

    /// Reads the `index`th 8-byte entry.
    pub fn read_u64(&self, index: usize) -> u64 {
        self.mem.read_u64(index * 8)
    }

    /// Writes the `index`th SGL descriptor.
    pub fn write_sgl(&self, index: usize, descriptor: &spec::SglDescriptor) {
        self.mem
            .write_obj(index * size_of::<spec::SglDescriptor>(), descriptor);
    }

    #[cfg(test)]
    pub fn read_sgl(&self, index: usize) -> spec::SglDescriptor {
        self.mem
            .read_obj(index * size_of::<spec::SglDescriptor>())
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.pool.free(self.chunk, self.slot);
    }
}

/// The small and large pools of one NUMA node.
pub(crate) struct NodePools {
    pub small: Arc<Pool>,
    pub large: Arc<Pool>,
}

impl NodePools {
    /// Returns the small pool if `bytes` fits in a small slot, otherwise the
    /// large pool.
    pub fn for_size(&self, bytes: usize) -> &Arc<Pool> {
        if bytes <= SMALL_POOL_SIZE {
            &self.small
        } else {
            &self.large
        }
    }
}

/// The per-node descriptor pools of a controller, created on first use.
pub(crate) struct DescriptorPools {
    allocator: Arc<dyn HostDmaAllocator>,
    limit: usize,
    nodes: Mutex<HashMap<u16, Arc<NodePools>>>,
}

impl DescriptorPools {
    pub fn new(allocator: Arc<dyn HostDmaAllocator>) -> Self {
        Self::with_limit(allocator, DEFAULT_POOL_LIMIT)
    }

    /// Creates pools that each grow to at most `limit` bytes.
    pub fn with_limit(allocator: Arc<dyn HostDmaAllocator>, limit: usize) -> Self {
        Self {
            allocator,
            limit,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pools for NUMA node `node`.
    pub fn for_node(&self, node: u16) -> Arc<NodePools> {
        self.nodes
            .lock()
            .entry(node)
            .or_insert_with(|| {
                tracing::debug!(node, "creating descriptor pools");
                Arc::new(NodePools {
                    small: Arc::new(Pool::new(
                        "small",
                        SMALL_POOL_SIZE,
                        self.limit,
                        self.allocator.clone(),
                    )),
                    large: Arc::new(Pool::new(
                        "large",
                        LARGE_POOL_SIZE,
                        self.limit,
                        self.allocator.clone(),
                    )),
                })
            })
            .clone()
    }
}
