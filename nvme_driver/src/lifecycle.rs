// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller bring-up and queue topology: enabling the controller, sizing
//! and creating the I/O queues, and tearing them down again.

use super::spec;
use crate::admin;
use crate::controller::raw;
use crate::controller::Inner;
use crate::controller::QueueCounts;
use crate::doorbell::DoorbellBuffer;
use crate::error::RequestError;
use crate::queue_pair::QueuePair;
use crate::queue_pair::SubmitError;
use crate::queue_pair::ADMIN_QUEUE_DEPTH;
use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE64;
use user_driver::DeviceBacking;

/// Log2 of the submission and completion queue entry sizes.
const IOSQES: u8 = 6;
const IOCQES: u8 = 4;

#[derive(Debug, Error)]
pub(crate) enum CreateQueueError {
    /// The controller refused to create the queue.
    #[error("controller rejected queue creation")]
    Rejected(#[source] RequestError),
    #[error("queue creation command failed")]
    Admin(#[source] RequestError),
    #[error("failed to set up queue interrupt")]
    Interrupt(#[source] anyhow::Error),
}

/// A host memory buffer handed to the controller.
pub(crate) struct HostMemory {
    buffer: MemoryBlock,
    descs: MemoryBlock,
    size: u64,
}

/// Splits `nrirqs` interrupt vectors between the default and the read queue
/// sets, returning `(default, read)`. With `write_queues` set, that many
/// vectors serve the default (write) queues and the rest serve reads.
pub(crate) fn calc_irq_sets(nrirqs: u16, write_queues: u16) -> (u16, u16) {
    let (nrirqs, read) = if nrirqs == 0 {
        (1, 0)
    } else if nrirqs == 1 || write_queues == 0 {
        (nrirqs, 0)
    } else if write_queues >= nrirqs {
        (nrirqs, 1)
    } else {
        (nrirqs, nrirqs - write_queues)
    };
    (nrirqs - read, read)
}

impl<T: DeviceBacking> Inner<T> {
    /// Reads the controller capabilities and derives the queue parameters
    /// for this reset.
    pub(crate) fn pci_enable(&self) -> anyhow::Result<()> {
        let bar0 = &self.registers.bar0;
        if bar0.is_gone() {
            anyhow::bail!("device is gone");
        }
        let cap = bar0.cap();
        if cap.mpsmin() != 0 {
            anyhow::bail!(
                "minimum memory page size {} not supported",
                1u64 << (12 + cap.mpsmin())
            );
        }

        let q_depth = (cap.mqes_z() as u32 + 1).min(self.config.io_queue_depth as u32) as u16;
        let mut topology = self.topology.lock();
        if topology.q_depth != q_depth && !topology.queues.is_empty() {
            tracing::info!(
                old = topology.q_depth,
                new = q_depth,
                "queue depth changed, reallocating io queues"
            );
            topology.queues.clear();
        }
        topology.q_depth = q_depth;
        topology.db_stride = 1 << cap.dstrd();
        topology.subsystem = cap.nssrs();
        topology.ready_timeout = Duration::from_millis(500 * cap.to().max(1) as u64);
        tracing::debug!(
            q_depth,
            db_stride = topology.db_stride,
            subsystem = topology.subsystem,
            "controller capabilities"
        );
        Ok(())
    }

    /// Disables the controller, programs the admin queue and enables the
    /// controller again.
    pub(crate) async fn configure_admin_queue(&self) -> anyhow::Result<()> {
        let bar0 = &self.registers.bar0;
        let (ready_timeout, stride, admin) = {
            let topology = self.topology.lock();
            (
                topology.ready_timeout,
                topology.db_stride,
                topology.admin.clone(),
            )
        };
        bar0.disable(ready_timeout)
            .await
            .context("failed to disable controller")?;

        let admin = match admin {
            Some(admin) => admin,
            None => {
                let admin = Arc::new(
                    QueuePair::new(
                        self.allocator.as_ref(),
                        self.registers.clone(),
                        0,
                        ADMIN_QUEUE_DEPTH,
                        self.pools.for_node(self.node),
                        Some(self.aen_send.clone()),
                    )
                    .context("failed to create admin queue pair")?,
                );
                self.topology.lock().admin = Some(admin.clone());
                admin
            }
        };

        bar0.set_aqa(
            spec::Aqa::new()
                .with_asqs_z(ADMIN_QUEUE_DEPTH - 1)
                .with_acqs_z(ADMIN_QUEUE_DEPTH - 1),
        );
        bar0.set_asq(admin.sq_addr());
        bar0.set_acq(admin.cq_addr());
        bar0.enable(
            spec::Cc::new().with_iocqes(IOCQES).with_iosqes(IOSQES),
            ready_timeout,
        )
        .await
        .context("failed to enable controller")?;

        admin.prepare_create(false, 0);
        admin.init(stride, None);
        self.topology.lock().online_queues = 1;
        if let Err(err) = self.queue_request_irq(&admin, 0) {
            self.topology.lock().online_queues -= 1;
            return Err(err);
        }
        admin.enable();
        Ok(())
    }

    pub(crate) fn queue_request_irq(
        &self,
        queue: &Arc<QueuePair<T>>,
        vector: u16,
    ) -> anyhow::Result<()> {
        let interrupt = self
            .device
            .lock()
            .map_interrupt(vector.into(), vector.saturating_sub(1).into())
            .with_context(|| format!("failed to map interrupt {vector}"))?;
        queue.request_irq(interrupt);
        Ok(())
    }

    /// Asks the controller for `count` I/O queue pairs and returns how many
    /// it granted. A controller that refuses the request gets none, leaving
    /// it usable for admin commands.
    pub(crate) async fn set_queue_count(&self, count: u16) -> Result<u16, RequestError> {
        match self.admin_command_raw(admin::set_queue_count(count)).await {
            Ok(completion) => {
                let granted = spec::Cdw11FeatureNumberOfQueues::from(completion.dw0);
                let granted = granted.nsq_z().min(granted.ncq_z()) as u32 + 1;
                Ok((count as u32).min(granted) as u16)
            }
            Err(RequestError::Nvme(err)) => {
                tracing::warn!(status = ?err.status(), "could not set queue count");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Sizes the interrupt sets for `nr_io` I/O queues and returns the number
    /// of vectors to use, including the admin vector.
    pub(crate) fn setup_irqs(&self, nr_io: u16) -> u16 {
        let poll = self.config.poll_queues.min(nr_io.saturating_sub(1));
        let irq_queues = 1 + nr_io - poll;
        let max = self.device.lock().max_interrupt_count();
        let vectors = (irq_queues as u32).min(max) as u16;
        if vectors == 0 {
            return 0;
        }
        let (default, read) = calc_irq_sets(vectors - 1, self.config.write_queues);
        self.topology.lock().counts = QueueCounts {
            default,
            read,
            poll,
        };
        vectors
    }

    /// Negotiates and creates the I/O queues, shrinking the request until the
    /// controller creates every queue asked for.
    pub(crate) async fn setup_io_queues(&self) -> anyhow::Result<()> {
        let config = &self.config;
        let requested = config.max_io_queues + config.write_queues + config.poll_queues;
        let mut nr_io = self
            .set_queue_count(requested)
            .await
            .context("failed to set queue count")?;
        if nr_io == 0 {
            return Ok(());
        }
        let admin = self.admin()?;

        loop {
            admin.suspend();
            let vectors = self.setup_irqs(nr_io);
            if vectors == 0 {
                anyhow::bail!("no interrupt vectors available");
            }
            let max_qid = {
                let mut topology = self.topology.lock();
                topology.num_vecs = vectors;
                topology.max_qid = (vectors - 1).max(1) + topology.counts.poll;
                topology.max_qid
            };

            self.queue_request_irq(&admin, 0)?;
            admin.enable();
            self.create_io_queues().await?;

            let (online, counts) = {
                let topology = self.topology.lock();
                (topology.online_queues, topology.counts)
            };
            if online < 2 {
                return Ok(());
            }
            if online - 1 < max_qid {
                tracing::info!(
                    online = online - 1,
                    wanted = max_qid,
                    "fewer io queues created than requested, retrying"
                );
                nr_io = online - 1;
                self.delete_io_queues().await;
                self.suspend_io_queues();
                continue;
            }
            tracing::info!(
                default = counts.default,
                read = counts.read,
                poll = counts.poll,
                "io queues created"
            );
            return Ok(());
        }
    }

    /// Allocates any missing queue pairs and creates queues on the controller
    /// until one fails.
    async fn create_io_queues(&self) -> anyhow::Result<()> {
        let (max_qid, q_depth, allocated) = {
            let topology = self.topology.lock();
            (topology.max_qid, topology.q_depth, topology.queues.len() as u16)
        };
        for qid in allocated + 1..=max_qid {
            match QueuePair::new(
                self.allocator.as_ref(),
                self.registers.clone(),
                qid,
                q_depth,
                self.pools.for_node(self.node),
                None,
            ) {
                Ok(queue) => self.topology.lock().queues.push(Arc::new(queue)),
                Err(err) => {
                    tracing::warn!(
                        qid,
                        error = err.as_ref() as &dyn std::error::Error,
                        "failed to allocate io queue"
                    );
                    break;
                }
            }
        }

        let (online, max, rw_queues) = {
            let topology = self.topology.lock();
            let max = topology.max_qid.min(topology.queues.len() as u16);
            let rw_queues = if max != 1 && topology.counts.poll > 0 {
                topology.counts.default + topology.counts.read
            } else {
                max
            };
            (topology.online_queues, max, rw_queues)
        };

        for qid in online..=max {
            match self.create_queue(qid, qid > rw_queues).await {
                Ok(()) => {}
                Err(CreateQueueError::Admin(err)) => {
                    return Err(err).with_context(|| format!("failed to create io queue {qid}"));
                }
                Err(err) => {
                    tracing::warn!(
                        qid,
                        error = &err as &dyn std::error::Error,
                        "failed to create io queue"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    async fn create_queue(&self, qid: u16, polled: bool) -> Result<(), CreateQueueError> {
        let (queue, num_vecs, stride) = {
            let topology = self.topology.lock();
            (
                topology.queues[qid as usize - 1].clone(),
                topology.num_vecs,
                topology.db_stride,
            )
        };
        let vector = if polled || num_vecs == 1 { 0 } else { qid };
        queue.prepare_create(polled, vector);

        self.admin_command_raw(admin::create_cq(
            qid,
            queue.depth(),
            queue.cq_addr(),
            vector,
            !polled,
        ))
        .await
        .map_err(|err| match err {
            RequestError::Nvme(_) => CreateQueueError::Rejected(err),
            err => CreateQueueError::Admin(err),
        })?;

        if let Err(err) = self
            .admin_command_raw(admin::create_sq(qid, queue.depth(), queue.sq_addr()))
            .await
        {
            if let RequestError::Nvme(_) = err {
                self.delete_queue(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE, qid)
                    .await;
                return Err(CreateQueueError::Rejected(err));
            }
            return Err(CreateQueueError::Admin(err));
        }

        let dbbuf = self.dbbuf.lock().clone();
        queue.init(stride, dbbuf.as_deref());
        self.topology.lock().online_queues += 1;
        if !polled {
            if let Err(err) = self.queue_request_irq(&queue, vector) {
                self.topology.lock().online_queues -= 1;
                self.delete_queue(spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE, qid)
                    .await;
                self.delete_queue(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE, qid)
                    .await;
                return Err(CreateQueueError::Interrupt(err));
            }
        }
        queue.enable();
        tracing::debug!(qid, polled, vector, "created io queue");
        Ok(())
    }

    async fn delete_queue(&self, opcode: spec::AdminOpcode, qid: u16) {
        if let Err(err) = self
            .admin_command_raw(admin::delete_queue(opcode, qid))
            .await
        {
            tracing::warn!(
                qid,
                ?opcode,
                error = &err as &dyn std::error::Error,
                "failed to delete queue"
            );
        }
    }

    /// Deletes every online I/O queue on the controller: submission queues
    /// first, then completion queues if that succeeded.
    pub(crate) async fn delete_io_queues(&self) {
        if self
            .delete_queues(spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE)
            .await
        {
            self.delete_queues(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE)
                .await;
        }
    }

    /// Issues deletions for the online queues, highest queue id first, as
    /// many at a time as the admin queue holds. Returns false if a batch did
    /// not complete within the admin timeout.
    async fn delete_queues(&self, opcode: spec::AdminOpcode) -> bool {
        let Ok(admin) = self.admin() else {
            return false;
        };
        let (mut remaining, queues) = {
            let topology = self.topology.lock();
            let online = topology.online_queues.min(topology.queues.len() as u16 + 1);
            ((1..online).collect::<Vec<_>>(), topology.queues.clone())
        };

        while !remaining.is_empty() {
            let deadline = Instant::now() + self.config.admin_timeout;
            let mut sent = Vec::new();
            while let Some(&qid) = remaining.last() {
                match admin.submit(raw(admin::delete_queue(opcode, qid)), true) {
                    Ok(submitted) => {
                        remaining.pop();
                        sent.push((qid, submitted));
                    }
                    Err((SubmitError::Full, _)) if !sent.is_empty() => break,
                    Err((SubmitError::Full, _)) => admin.wait_for_slot().await,
                    Err((SubmitError::Disabled, _)) => return false,
                }
            }

            for (qid, submitted) in sent {
                let queue = &queues[qid as usize - 1];
                match tokio::time::timeout_at(deadline, submitted.completion).await {
                    Err(_) => {
                        tracing::warn!(qid, ?opcode, "timed out deleting queues");
                        return false;
                    }
                    Ok(Err(_)) => queue.set_delete_error(),
                    Ok(Ok(completion)) => {
                        let status = spec::Status(completion.status.status());
                        if status != spec::Status::SUCCESS {
                            tracing::warn!(qid, ?opcode, ?status, "queue deletion failed");
                            if opcode == spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE {
                                queue.set_delete_error();
                            }
                        }
                    }
                }
            }
        }
        true
    }

    pub(crate) fn suspend_queue(&self, queue: &QueuePair<T>) {
        if queue.suspend() {
            let mut topology = self.topology.lock();
            topology.online_queues = topology.online_queues.saturating_sub(1);
        }
    }

    pub(crate) fn suspend_io_queues(&self) {
        let queues = self.topology.lock().queues.clone();
        for queue in queues.iter().rev() {
            self.suspend_queue(queue);
        }
    }

    /// Reaps whatever the controller posted before it was disabled.
    pub(crate) fn reap_pending(&self) {
        let queues = self.topology.lock().queues.clone();
        for queue in queues.iter().rev() {
            queue.poll_completions();
        }
    }

    /// Allocates (or clears, if reusable) the shadow doorbell buffer when the
    /// controller supports it.
    pub(crate) fn dbbuf_alloc(&self) {
        let (supported, stride) = {
            let topology = self.topology.lock();
            (topology.oacs.doorbell_buffer_config(), topology.db_stride)
        };
        if !self.config.use_doorbell_buffer || !supported {
            return;
        }
        let mut dbbuf = self.dbbuf.lock();
        if let Some(existing) = &*dbbuf {
            if existing.stride() == stride {
                existing.clear();
                return;
            }
        }
        let config = &self.config;
        let queue_count =
            (config.max_io_queues + config.write_queues + config.poll_queues) as usize + 1;
        match DoorbellBuffer::alloc(self.allocator.as_ref(), queue_count, stride) {
            Ok(buffer) => *dbbuf = Some(Arc::new(buffer)),
            Err(err) => {
                tracing::warn!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to allocate doorbell buffer"
                );
                *dbbuf = None;
            }
        }
    }

    /// Tells the controller about the shadow doorbell buffer. On failure the
    /// buffer is dropped and the I/O queues go back to plain doorbells.
    pub(crate) async fn dbbuf_set(&self) {
        let Some(dbbuf) = self.dbbuf.lock().clone() else {
            return;
        };
        if let Err(err) = self
            .admin_command_raw(admin::doorbell_buffer_config(
                dbbuf.dbs_addr(),
                dbbuf.eis_addr(),
            ))
            .await
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "unable to set dbbuf"
            );
            *self.dbbuf.lock() = None;
            let queues = self.topology.lock().queues.clone();
            for queue in &queues {
                queue.set_shadows(None);
            }
        }
    }

    /// Gives the controller its preferred host memory buffer, reusing the
    /// buffer from before a reset when it is still large enough.
    pub(crate) async fn setup_host_mem(&self) -> anyhow::Result<()> {
        let Some(identify) = self.identify.lock().clone() else {
            return Ok(());
        };
        let preferred =
            (identify.hmpre as u64 * PAGE_SIZE64).min(self.config.host_memory_buffer_bytes);
        if preferred == 0 {
            return Ok(());
        }
        let min = identify.hmmin as u64 * PAGE_SIZE64;
        if preferred < min {
            tracing::info!(preferred, min, "host memory buffer below controller minimum");
            return Ok(());
        }

        let mut bits = spec::Cdw11FeatureHostMemoryBuffer::new().with_ehm(true);
        let existing = self.hmb.lock().take();
        let hmb = match existing {
            Some(hmb) if hmb.size >= min => {
                bits.set_mr(true);
                hmb
            }
            _ => {
                let size = preferred.next_multiple_of(PAGE_SIZE64);
                let buffer = self
                    .allocator
                    .allocate_dma_buffer(size as usize)
                    .context("failed to allocate host memory buffer")?;
                let descs = self
                    .allocator
                    .allocate_dma_buffer(size_of::<spec::HostMemoryBufferDescriptor>())
                    .context("failed to allocate host memory descriptors")?;
                descs.write_obj(
                    0,
                    &spec::HostMemoryBufferDescriptor {
                        badd: buffer.device_address(0),
                        bsize: (size / PAGE_SIZE64) as u32,
                        rsvd: 0,
                    },
                );
                HostMemory {
                    buffer,
                    descs,
                    size,
                }
            }
        };

        match self
            .admin_command_raw(admin::set_host_mem(
                bits,
                (hmb.size / PAGE_SIZE64) as u32,
                hmb.descs.device_address(0),
                1,
            ))
            .await
        {
            Ok(_) => {
                tracing::info!(
                    size = hmb.size,
                    addr = hmb.buffer.device_address(0),
                    reused = bits.mr(),
                    "host memory buffer enabled"
                );
                *self.hmb.lock() = Some(hmb);
                Ok(())
            }
            Err(RequestError::Nvme(err)) => {
                tracing::warn!(status = ?err.status(), "failed to enable host memory buffer");
                Ok(())
            }
            Err(err) => Err(err).context("failed to enable host memory buffer"),
        }
    }

    /// Asks the controller to stop using the host memory buffer. The buffer
    /// itself is kept for reuse after a reset.
    pub(crate) async fn disable_host_mem(&self) {
        if self.hmb.lock().is_none() {
            return;
        }
        if let Err(err) = self
            .admin_command_raw(admin::set_host_mem(
                spec::Cdw11FeatureHostMemoryBuffer::new(),
                0,
                0,
                0,
            ))
            .await
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to disable host memory buffer"
            );
        }
    }

    pub(crate) fn free_host_mem(&self) {
        if let Some(hmb) = self.hmb.lock().take() {
            tracing::debug!(size = hmb.size, "freeing host memory buffer");
        }
    }
}
