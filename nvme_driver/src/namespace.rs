// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe namespace frontend.

use super::spec;
use super::spec::nvm;
use crate::admin;
use crate::controller::ControllerState;
use crate::controller::Inner;
use crate::descriptor_pool::PoolError;
use crate::dma::DmaDirection;
use crate::dma::HostSegment;
use crate::error::RequestError;
use crate::request::IoRequest;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use user_driver::DeviceBacking;
use zerocopy::FromZeros;

/// The number of times a request is resubmitted after a retryable failure.
const MAX_RETRIES: u32 = 5;

/// An error getting a namespace.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace not found")]
    NotFound,
    #[error("formatted lba size invalid")]
    FlbasInvalid,
    #[error("lba format invalid: {0:?}")]
    LbaFormatInvalid(nvm::Lbaf),
    #[error("nvme request failed")]
    Request(#[source] RequestError),
}

/// The part of a namespace the controller updates: liveness and size.
#[derive(Debug)]
pub(crate) struct NamespaceState {
    nsid: u32,
    dead: AtomicBool,
    block_count: AtomicU64,
    resize_event: event_listener::Event,
}

impl NamespaceState {
    pub fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            tracing::info!(nsid = self.nsid, "namespace marked dead");
            self.resize_event.notify(usize::MAX);
        }
    }

    fn update(&self, identify: &nvm::IdentifyNamespace) {
        if identify.nsze == 0 {
            tracing::info!(nsid = self.nsid, "namespace was hot removed");
            self.mark_dead();
            return;
        }
        let old_block_count = self.block_count.swap(identify.nsze, Ordering::SeqCst);
        if old_block_count != identify.nsze {
            tracing::info!(
                nsid = self.nsid,
                old_block_count,
                new_block_count = identify.nsze,
                "nvme disk size changed"
            );
            self.resize_event.notify(usize::MAX);
        } else {
            tracing::debug!(nsid = self.nsid, "rescanned, no change");
        }
    }
}

/// An NVMe namespace.
pub struct Namespace<T: DeviceBacking> {
    inner: Arc<Inner<T>>,
    state: Arc<NamespaceState>,
    block_shift: u32,
}

impl<T: DeviceBacking> Namespace<T> {
    pub(crate) async fn new(inner: Arc<Inner<T>>, nsid: u32) -> Result<Self, NamespaceError> {
        let identify = inner
            .identify_namespace(nsid)
            .await
            .map_err(NamespaceError::Request)?;
        if identify.nsze == 0 {
            return Err(NamespaceError::NotFound);
        }

        let lba_format_index = identify.flbas.low_index();
        if lba_format_index > identify.nlbaf {
            return Err(NamespaceError::FlbasInvalid);
        }
        let lbaf = identify.lbaf[lba_format_index as usize];
        let block_shift = lbaf.lbads();
        if !matches!(block_shift, 9..=16) {
            return Err(NamespaceError::LbaFormatInvalid(lbaf));
        }

        let state = Arc::new(NamespaceState {
            nsid,
            dead: AtomicBool::new(false),
            block_count: identify.nsze.into(),
            resize_event: Default::default(),
        });
        inner.namespaces.lock().push(Arc::downgrade(&state));
        Ok(Self {
            inner,
            state,
            block_shift: block_shift.into(),
        })
    }

    pub fn nsid(&self) -> u32 {
        self.state.nsid
    }

    /// Gets the block size in bytes.
    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    /// Gets the current block count.
    pub fn block_count(&self) -> u64 {
        self.state.block_count.load(Ordering::Relaxed)
    }

    /// Returns true once the controller has given up on the namespace.
    pub fn is_dead(&self) -> bool {
        self.state.dead.load(Ordering::SeqCst)
    }

    /// Wait for the block count to be different from `block_count`, or for
    /// the namespace to die.
    pub async fn wait_resize(&self, block_count: u64) -> u64 {
        loop {
            let listen = self.state.resize_event.listen();
            let current = self.block_count();
            if current != block_count || self.is_dead() {
                break current;
            }
            listen.await;
        }
    }

    /// Issues a request against this namespace, resubmitting it after a
    /// retryable failure. Failures that a controller reset may clear (a
    /// cancelled command, or a status without DNR) are retried once the
    /// controller admits I/O again.
    pub async fn submit(&self, mut req: IoRequest) -> Result<spec::Completion, RequestError> {
        req.command.nsid = self.state.nsid;
        let mut retries = 0;
        loop {
            if self.is_dead() {
                return Err(RequestError::NamespaceDead);
            }
            match self.inner.submit_io(&req).await {
                Err(err) if retries < MAX_RETRIES && self.should_retry(&err) => {
                    retries += 1;
                    tracing::debug!(
                        nsid = self.state.nsid,
                        retries,
                        error = &err as &dyn std::error::Error,
                        "retrying request"
                    );
                }
                result => break result,
            }
        }
    }

    fn should_retry(&self, err: &RequestError) -> bool {
        if self.inner.state() == ControllerState::Dead || self.is_dead() {
            return false;
        }
        match err {
            RequestError::Nvme(err) => !err.dnr(),
            RequestError::Gone => true,
            _ => false,
        }
    }

    /// Issues a list of requests against this namespace without retrying.
    pub async fn submit_batch(
        &self,
        mut reqs: Vec<IoRequest>,
    ) -> Vec<Result<spec::Completion, RequestError>> {
        if self.is_dead() {
            return reqs.iter().map(|_| Err(RequestError::NamespaceDead)).collect();
        }
        for req in &mut reqs {
            req.command.nsid = self.state.nsid;
        }
        self.inner.submit_io_batch(&reqs).await
    }

    fn rw_command(&self, opcode: nvm::NvmOpcode, lba: u64, block_count: u32, fua: bool) -> spec::Command {
        spec::Command {
            cdw10: nvm::Cdw10ReadWrite::new().with_sbla_low(lba as u32).into(),
            cdw11: nvm::Cdw11ReadWrite::new()
                .with_sbla_high((lba >> 32) as u32)
                .into(),
            cdw12: nvm::Cdw12ReadWrite::new()
                .with_nlb_z((block_count - 1) as u16)
                .with_fua(fua)
                .into(),
            ..nvm_cmd(opcode, self.state.nsid)
        }
    }

    fn check_transfer(&self, block_count: u32, segments: &[HostSegment]) -> Result<(), RequestError> {
        if block_count == 0 || block_count > 0x10000 {
            return Err(RequestError::Malformed("invalid block count"));
        }
        let len = (block_count as u64) << self.block_shift;
        if segments.iter().map(|s| s.len as u64).sum::<u64>() != len {
            return Err(RequestError::Malformed("buffer does not match block count"));
        }
        Ok(())
    }

    /// Reads `block_count` blocks at `lba` into `segments`.
    pub async fn read(
        &self,
        target_cpu: u32,
        lba: u64,
        block_count: u32,
        segments: Vec<HostSegment>,
    ) -> Result<(), RequestError> {
        self.check_transfer(block_count, &segments)?;
        let req = IoRequest::new(self.rw_command(nvm::NvmOpcode::READ, lba, block_count, false))
            .with_data(DmaDirection::FromDevice, segments)
            .on_cpu(target_cpu);
        self.submit(req).await?;
        Ok(())
    }

    /// Writes `block_count` blocks at `lba` from `segments`.
    pub async fn write(
        &self,
        target_cpu: u32,
        lba: u64,
        block_count: u32,
        fua: bool,
        segments: Vec<HostSegment>,
    ) -> Result<(), RequestError> {
        self.check_transfer(block_count, &segments)?;
        let req = IoRequest::new(self.rw_command(nvm::NvmOpcode::WRITE, lba, block_count, fua))
            .with_data(DmaDirection::ToDevice, segments)
            .on_cpu(target_cpu);
        self.submit(req).await?;
        Ok(())
    }

    /// Flushes the namespace to persistent media.
    pub async fn flush(&self, target_cpu: u32) -> Result<(), RequestError> {
        let req = IoRequest::new(nvm_cmd(nvm::NvmOpcode::FLUSH, self.state.nsid)).on_cpu(target_cpu);
        self.submit(req).await?;
        Ok(())
    }
}

impl<T: DeviceBacking> Drop for Namespace<T> {
    fn drop(&mut self) {
        self.inner
            .namespaces
            .lock()
            .retain(|ns| !std::ptr::eq(ns.as_ptr(), Arc::as_ptr(&self.state)));
    }
}

impl<T: DeviceBacking> Inner<T> {
    pub(crate) async fn identify_namespace(
        &self,
        nsid: u32,
    ) -> Result<nvm::IdentifyNamespace, RequestError> {
        let buffer = self
            .allocator
            .allocate_dma_buffer(size_of::<nvm::IdentifyNamespace>())
            .map_err(|err| RequestError::Pool(PoolError::Allocation("identify", err)))?;
        self.admin_command_raw(admin::identify_namespace(nsid, buffer.device_address(0)))
            .await?;
        Ok(buffer.read_obj(0))
    }

    /// Re-identifies every open namespace, picking up size changes and hot
    /// removal.
    pub(crate) async fn rescan_namespaces(&self) {
        let namespaces = self
            .namespaces
            .lock()
            .iter()
            .filter_map(|ns| ns.upgrade())
            .collect::<Vec<_>>();
        for ns in namespaces {
            match self.identify_namespace(ns.nsid).await {
                Ok(identify) => ns.update(&identify),
                Err(err) => {
                    tracing::warn!(
                        nsid = ns.nsid,
                        error = &err as &dyn std::error::Error,
                        "failed to query namespace during rescan"
                    );
                }
            }
        }
    }
}

fn nvm_cmd(opcode: nvm::NvmOpcode, nsid: u32) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        nsid,
        ..FromZeros::new_zeroed()
    }
}
