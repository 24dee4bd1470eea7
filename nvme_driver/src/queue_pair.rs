// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of an admin or IO queue pair.
//!
//! A queue pair owns a submission ring, a completion ring, and the table of
//! commands that have been submitted but not yet completed. The submission
//! ring, the completion ring, and the table each have their own lock, so
//! submitters and the completion reaper only contend when they touch the
//! same structure. Locks are always taken in the order completion ring,
//! command table, submission ring. Suspending a queue and the enabled check
//! on submission both hold the command table, so that nothing enters the
//! table once a suspended queue has been cancelled.

use super::spec;
use crate::admin::admin_cmd;
use crate::descriptor_pool::NodePools;
use crate::doorbell::DoorbellBuffer;
use crate::queues::CompletionQueue;
use crate::queues::SubmissionQueue;
use crate::ratelimit::warn_ratelimited;
use crate::registers::doorbell_offset;
use crate::registers::DeviceRegisters;
use crate::request::RequestResources;
use anyhow::Context;
use event_listener::Event;
use futures::channel::oneshot;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use user_driver::interrupt::DeviceInterrupt;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DeviceBacking;
use user_driver::HostDmaAllocator;

pub(crate) const ADMIN_QUEUE_DEPTH: u16 = 32;
/// The command id of the asynchronous event request. It is never placed in
/// the command table and never times out.
pub(crate) const AEN_CID: u16 = ADMIN_QUEUE_DEPTH - 1;
/// Tags available to ordinary admin commands.
const ADMIN_TAGS: usize = AEN_CID as usize - 1;

const TAG_BITS: u32 = 12;
const TAG_MASK: u16 = (1 << TAG_BITS) - 1;
const GENERATION_MASK: u16 = 0xf;

/// A command with its data and metadata pointers filled in.
pub(crate) struct Prepared {
    pub command: spec::Command,
    pub resources: RequestResources,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubmitError {
    /// The queue is suspended.
    Disabled,
    /// Every tag or ring slot is in use.
    Full,
}

pub(crate) struct Submitted {
    pub cid: u16,
    pub completion: oneshot::Receiver<spec::Completion>,
}

/// Per-queue flags.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct QueueState {
    pub enabled: bool,
    pub polled: bool,
    /// Deleting the completion queue failed during the last teardown.
    pub delete_error: bool,
    pub vector: u16,
}

struct PendingCommand {
    cid: u16,
    // Keep the command around for diagnostics.
    command: spec::Command,
    respond: oneshot::Sender<spec::Completion>,
    resources: RequestResources,
}

impl PendingCommand {
    /// Releases the command's resources, then delivers its completion.
    fn complete(self, completion: spec::Completion) {
        let Self {
            cid: _,
            command: _,
            respond,
            resources,
        } = self;
        drop(resources);
        // The issuer may have stopped waiting.
        respond.send(completion).ok();
    }
}

/// Outstanding commands, keyed by the tag bits of their command id.
struct PendingCommands {
    commands: Slab<PendingCommand>,
    capacity: usize,
    generation: u16,
}

impl PendingCommands {
    fn new(capacity: usize) -> Self {
        Self {
            commands: Slab::with_capacity(capacity),
            capacity,
            generation: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.commands.len() >= self.capacity
    }

    /// The command id the next inserted command will get.
    fn next_cid(&self) -> u16 {
        (self.generation << TAG_BITS) | self.commands.vacant_key() as u16
    }

    fn insert(
        &mut self,
        command: spec::Command,
        respond: oneshot::Sender<spec::Completion>,
        resources: RequestResources,
    ) {
        let cid = command.cdw0.cid();
        let entry = self.commands.vacant_entry();
        debug_assert_eq!(entry.key(), (cid & TAG_MASK) as usize);
        entry.insert(PendingCommand {
            cid,
            command,
            respond,
            resources,
        });
        self.generation = (self.generation + 1) & GENERATION_MASK;
    }

    fn get_mut(&mut self, cid: u16) -> Option<&mut PendingCommand> {
        self.commands
            .get_mut((cid & TAG_MASK) as usize)
            .filter(|pending| pending.cid == cid)
    }

    /// Removes the command with id `cid`. Returns `None` for unknown ids and
    /// for stale ids whose tag has been reused.
    fn remove(&mut self, cid: u16) -> Option<PendingCommand> {
        let key = (cid & TAG_MASK) as usize;
        if self.commands.get(key)?.cid != cid {
            return None;
        }
        Some(self.commands.remove(key))
    }
}

pub(crate) struct QueuePair<T: DeviceBacking> {
    qid: u16,
    depth: u16,
    registers: Arc<DeviceRegisters<T>>,
    sq_mem: MemoryBlock,
    cq_mem: MemoryBlock,
    sq: Mutex<SubmissionQueue>,
    cq: Mutex<CompletionQueue>,
    commands: Mutex<PendingCommands>,
    state: Mutex<QueueState>,
    /// Notified whenever commands leave the table or the queue is suspended.
    slot_event: Event,
    pools: Arc<NodePools>,
    aen: Option<mpsc::UnboundedSender<spec::Completion>>,
    interrupt_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: DeviceBacking> QueuePair<T> {
    /// Allocates the rings for queue `qid`. Asynchronous event completions on
    /// the admin queue are forwarded to `aen`.
    pub fn new(
        allocator: &dyn HostDmaAllocator,
        registers: Arc<DeviceRegisters<T>>,
        qid: u16,
        depth: u16,
        pools: Arc<NodePools>,
        aen: Option<mpsc::UnboundedSender<spec::Completion>>,
    ) -> anyhow::Result<Self> {
        assert!(depth >= 2);
        let sq_mem = allocator
            .allocate_dma_buffer((depth as usize * size_of::<spec::Command>()).next_multiple_of(PAGE_SIZE))
            .context("failed to allocate submission queue")?;
        let cq_mem = allocator
            .allocate_dma_buffer(
                (depth as usize * size_of::<spec::Completion>()).next_multiple_of(PAGE_SIZE),
            )
            .context("failed to allocate completion queue")?;
        let capacity = if qid == 0 {
            ADMIN_TAGS
        } else {
            depth as usize - 1
        };
        Ok(Self {
            qid,
            depth,
            sq: Mutex::new(SubmissionQueue::new(
                qid,
                depth,
                sq_mem.clone(),
                doorbell_offset(qid, false, 1),
            )),
            cq: Mutex::new(CompletionQueue::new(
                qid,
                depth,
                cq_mem.clone(),
                doorbell_offset(qid, true, 1),
            )),
            sq_mem,
            cq_mem,
            registers,
            commands: Mutex::new(PendingCommands::new(capacity)),
            state: Mutex::new(QueueState::default()),
            slot_event: Event::new(),
            pools,
            aen,
            interrupt_task: Mutex::new(None),
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn sq_addr(&self) -> u64 {
        self.sq_mem.device_address(0)
    }

    pub fn cq_addr(&self) -> u64 {
        self.cq_mem.device_address(0)
    }

    pub fn pools(&self) -> &NodePools {
        &self.pools
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// The number of commands waiting for completion.
    pub fn outstanding(&self) -> usize {
        self.commands.lock().commands.len()
    }

    /// Records the interrupt configuration chosen for a queue about to be
    /// created.
    pub fn prepare_create(&self, polled: bool, vector: u16) {
        let mut state = self.state.lock();
        state.delete_error = false;
        state.polled = polled;
        state.vector = vector;
    }

    pub fn set_delete_error(&self) {
        self.state.lock().delete_error = true;
    }

    /// Resets the ring indices and zeroes the completion ring for a queue the
    /// controller just created.
    pub fn init(&self, stride: u32, dbbuf: Option<&DoorbellBuffer>) {
        let shadow = |completion| dbbuf.and_then(|d| d.shadow(self.qid, completion));
        self.sq
            .lock()
            .reset(doorbell_offset(self.qid, false, stride), shadow(false));
        self.cq
            .lock()
            .reset(doorbell_offset(self.qid, true, stride), shadow(true));
    }

    /// Attaches or detaches the shadow doorbells.
    pub fn set_shadows(&self, dbbuf: Option<&DoorbellBuffer>) {
        let shadow = |completion| dbbuf.and_then(|d| d.shadow(self.qid, completion));
        self.sq.lock().set_shadow(shadow(false));
        self.cq.lock().set_shadow(shadow(true));
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    /// Stops new submissions and releases the queue's interrupt. Returns
    /// false if the queue was not enabled.
    pub fn suspend(&self) -> bool {
        let was_enabled = {
            let _commands = self.commands.lock();
            std::mem::replace(&mut self.state.lock().enabled, false)
        };
        if !was_enabled {
            return false;
        }
        if let Some(task) = self.interrupt_task.lock().take() {
            task.abort();
        }
        self.slot_event.notify(usize::MAX);
        true
    }

    /// Starts reaping completions whenever `interrupt` fires.
    pub fn request_irq(self: &Arc<Self>, mut interrupt: DeviceInterrupt) {
        let this = Arc::downgrade(self);
        let qid = self.qid;
        let task = tokio::spawn(
            async move {
                loop {
                    interrupt.wait().await;
                    let Some(this) = this.upgrade() else {
                        break;
                    };
                    this.poll_completions();
                }
            }
            .instrument(tracing::info_span!("nvme_queue", qid)),
        );
        if let Some(old) = self.interrupt_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Submits one command. The doorbell is written if `last` is set or if
    /// the batching rule requires it.
    pub fn submit(&self, prepared: Prepared, last: bool) -> Result<Submitted, (SubmitError, Prepared)> {
        let mut commands = self.commands.lock();
        if !self.is_enabled() {
            return Err((SubmitError::Disabled, prepared));
        }
        let mut sq = self.sq.lock();
        let submitted = Self::submit_locked(&mut commands, &mut sq, prepared)?;
        sq.notify(&self.registers, last);
        Ok(submitted)
    }

    /// Submits a list of commands under one lock acquisition with a single
    /// doorbell write. Commands that do not fit are handed back.
    pub fn submit_batch(&self, batch: Vec<Prepared>) -> (Vec<Submitted>, Vec<Prepared>) {
        let mut commands = self.commands.lock();
        if !self.is_enabled() {
            return (Vec::new(), batch);
        }
        let mut submitted = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();
        let mut sq = self.sq.lock();
        for prepared in batch {
            match Self::submit_locked(&mut commands, &mut sq, prepared) {
                Ok(s) => submitted.push(s),
                Err((_, prepared)) => rejected.push(prepared),
            }
        }
        if !submitted.is_empty() {
            sq.notify(&self.registers, true);
        }
        (submitted, rejected)
    }

    fn submit_locked(
        commands: &mut PendingCommands,
        sq: &mut SubmissionQueue,
        prepared: Prepared,
    ) -> Result<Submitted, (SubmitError, Prepared)> {
        if commands.is_full() || sq.is_full() {
            return Err((SubmitError::Full, prepared));
        }
        let Prepared {
            mut command,
            resources,
        } = prepared;
        command.cdw0.set_cid(commands.next_cid());
        if sq.write(command).is_err() {
            return Err((SubmitError::Full, Prepared { command, resources }));
        }
        let (send, recv) = oneshot::channel();
        let cid = command.cdw0.cid();
        // The device cannot see the entry until the next doorbell write,
        // which happens after this insert.
        commands.insert(command, send, resources);
        Ok(Submitted {
            cid,
            completion: recv,
        })
    }

    /// Writes the submission doorbell, subject to batching unless `force`.
    pub fn notify(&self, force: bool) -> bool {
        self.sq.lock().notify(&self.registers, force)
    }

    /// Publishes any submissions whose doorbell write was deferred.
    pub fn commit(&self) {
        self.sq.lock().commit(&self.registers);
    }

    /// Submits the asynchronous event request on the admin queue.
    pub fn submit_async_event(&self) -> bool {
        assert_eq!(self.qid, 0);
        if !self.is_enabled() {
            return false;
        }
        let mut command = admin_cmd(spec::AdminOpcode::ASYNCHRONOUS_EVENT_REQUEST);
        command.cdw0.set_cid(AEN_CID);
        let mut sq = self.sq.lock();
        if sq.write(command).is_err() {
            return false;
        }
        sq.notify(&self.registers, true);
        true
    }

    /// Drains the completion ring, completing each command it finds.
    ///
    /// Failed commands complete immediately; successful ones are completed
    /// together once the ring is drained and its doorbell written. Returns
    /// true if any entries were found.
    pub fn poll_completions(&self) -> bool {
        let mut cq = self.cq.lock();
        let mut batch = Vec::new();
        let mut sq_head = None;
        while let Some(completion) = cq.read() {
            sq_head = Some(completion.sqhd);
            self.handle_completion(completion, &mut batch);
        }
        let Some(sq_head) = sq_head else {
            return false;
        };
        cq.commit(&self.registers);
        self.sq.lock().update_head(sq_head);
        drop(cq);

        for (pending, completion) in batch {
            pending.complete(completion);
        }
        self.slot_event.notify(usize::MAX);
        true
    }

    fn handle_completion(
        &self,
        completion: spec::Completion,
        batch: &mut Vec<(PendingCommand, spec::Completion)>,
    ) {
        if self.qid == 0 && (completion.cid & TAG_MASK) >= AEN_CID {
            if let Some(aen) = &self.aen {
                aen.send(completion).ok();
            }
            return;
        }
        let Some(pending) = self.commands.lock().remove(completion.cid) else {
            warn_ratelimited!(
                qid = self.qid,
                cid = completion.cid,
                sqid = completion.sqid,
                "invalid id completed on queue"
            );
            return;
        };
        if completion.status.status() != 0 {
            tracing::debug!(
                qid = self.qid,
                cid = completion.cid,
                opcode = pending.command.cdw0.opcode(),
                status = completion.status.status(),
                "command failed"
            );
            pending.complete(completion);
        } else {
            batch.push((pending, completion));
        }
    }

    /// Completes every outstanding command with a host-aborted status. `dnr`
    /// tells the issuer not to retry.
    pub fn cancel_all(&self, dnr: bool) -> usize {
        let cancelled: Vec<_> = self.commands.lock().commands.drain().collect();
        let count = cancelled.len();
        for pending in cancelled {
            let completion = spec::Completion {
                dw0: 0,
                dw1: 0,
                sqhd: 0,
                sqid: self.qid,
                cid: pending.cid,
                status: spec::CompletionStatus::new()
                    .with_status(spec::Status::HOST_ABORTED_COMMAND.0)
                    .with_dnr(dnr),
            };
            pending.complete(completion);
        }
        if count > 0 {
            tracing::debug!(qid = self.qid, count, dnr, "cancelled outstanding commands");
        }
        self.slot_event.notify(usize::MAX);
        count
    }

    /// Marks an outstanding command as aborted, returning whether it already
    /// was. Returns `None` if the command is no longer outstanding.
    pub fn mark_aborted(&self, cid: u16) -> Option<bool> {
        let mut commands = self.commands.lock();
        let pending = commands.get_mut(cid)?;
        Some(std::mem::replace(&mut pending.resources.flags.aborted, true))
    }

    /// Returns whether an abort was already sent for an outstanding command.
    pub fn is_aborted(&self, cid: u16) -> Option<bool> {
        self.commands
            .lock()
            .get_mut(cid)
            .map(|pending| pending.resources.flags.aborted)
    }

    pub fn is_pending(&self, cid: u16) -> bool {
        self.commands.lock().get_mut(cid).is_some()
    }

    /// Waits until a tag is free or the queue is suspended.
    pub async fn wait_for_slot(&self) {
        loop {
            let listener = self.slot_event.listen();
            if !self.commands.lock().is_full() || !self.is_enabled() {
                break;
            }
            listener.await;
        }
    }
}

impl<T: DeviceBacking> Drop for QueuePair<T> {
    fn drop(&mut self) {
        if let Some(task) = self.interrupt_task.get_mut().take() {
            task.abort();
        }
    }
}
