// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Block layer requests and the per-command resources built for them.

use super::spec;
use crate::config::ControllerConfig;
use crate::descriptor_pool::Descriptor;
use crate::dma::DmaDirection;
use crate::dma::DmaMapping;
use crate::dma::HostSegment;
use crate::error::RequestError;

/// The maximum number of descriptor pages chained for one request.
pub(crate) const MAX_DESCRIPTORS: usize = 5;

/// A request from the block layer: a command and the memory it transfers.
///
/// The data pointer and metadata pointer of the command are filled in by the
/// driver.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub(crate) command: spec::Command,
    pub(crate) data: Vec<HostSegment>,
    pub(crate) integrity: Vec<HostSegment>,
    pub(crate) direction: DmaDirection,
    pub(crate) user_command: bool,
    pub(crate) polled: bool,
    pub(crate) cpu: u32,
}

impl IoRequest {
    pub fn new(command: spec::Command) -> Self {
        Self {
            command,
            data: Vec::new(),
            integrity: Vec::new(),
            direction: DmaDirection::ToDevice,
            user_command: false,
            polled: false,
            cpu: 0,
        }
    }

    /// Attaches the data buffer, in transfer order.
    pub fn with_data(mut self, direction: DmaDirection, segments: Vec<HostSegment>) -> Self {
        self.direction = direction;
        self.data = segments;
        self
    }

    /// Attaches the integrity (metadata) buffer.
    pub fn with_integrity(mut self, segments: Vec<HostSegment>) -> Self {
        self.integrity = segments;
        self
    }

    /// Marks the request as a passthrough command issued by a user, which
    /// always uses SGLs when the controller has them.
    pub fn user_command(mut self) -> Self {
        self.user_command = true;
        self
    }

    /// Routes the request to a polled queue, if there are any.
    pub fn polled(mut self) -> Self {
        self.polled = true;
        self
    }

    /// Sets the submitting CPU, which selects the queue.
    pub fn on_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn command(&self) -> &spec::Command {
        &self.command
    }

    /// The number of data bytes transferred.
    pub fn payload_len(&self) -> u64 {
        self.data.iter().map(|s| s.len as u64).sum()
    }

    pub(crate) fn validate(&self, config: &ControllerConfig) -> Result<(), RequestError> {
        if self.data.len() > config.max_segments {
            return Err(RequestError::Malformed("too many data segments"));
        }
        if self.integrity.len() > ControllerConfig::MAX_META_SEGMENTS {
            return Err(RequestError::Malformed("too many integrity segments"));
        }
        if self
            .data
            .iter()
            .chain(&self.integrity)
            .any(|s| s.len == 0)
        {
            return Err(RequestError::Malformed("empty segment"));
        }
        if self.payload_len() > config.max_transfer_bytes as u64 {
            return Err(RequestError::Malformed("transfer too large"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct RequestFlags {
    /// An abort was sent for the command after it timed out.
    pub aborted: bool,
    /// The data descriptors came from the small pool.
    pub small_descriptor: bool,
    /// The data was mapped through the single segment fast path.
    pub single_segment: bool,
}

/// Everything a submitted command owns on the host side.
///
/// Dropping this releases the descriptor pages back to their pools and
/// unmaps every DMA mapping. It is owned by the outstanding command table
/// while the command is in flight, so whichever path removes the command
/// from the table is the one that tears it down.
#[derive(Default)]
pub(crate) struct RequestResources {
    pub flags: RequestFlags,
    pub total_len: u64,
    pub descriptors: Vec<Descriptor>,
    pub data_mapping: Option<DmaMapping>,
    pub meta_descriptor: Option<Descriptor>,
    pub meta_mapping: Option<DmaMapping>,
}

impl std::fmt::Debug for RequestResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResources")
            .field("flags", &self.flags)
            .field("total_len", &self.total_len)
            .field("descriptors", &self.descriptors)
            .field("meta_descriptor", &self.meta_descriptor)
            .finish()
    }
}
