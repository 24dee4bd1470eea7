// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The controller: I/O admission, command timeouts, and the reset and
//! shutdown state machine.

use super::spec;
use crate::admin;
use crate::config::ControllerConfig;
use crate::descriptor_pool::DescriptorPools;
use crate::descriptors;
use crate::descriptors::MapContext;
use crate::dma::DmaDirection;
use crate::dma::DmaMapper;
use crate::dma::IdentityMapper;
use crate::dma::IommuMapper;
use crate::doorbell::DoorbellBuffer;
use crate::error::completion_result;
use crate::error::RequestError;
use crate::lifecycle::HostMemory;
use crate::namespace::Namespace;
use crate::namespace::NamespaceError;
use crate::namespace::NamespaceState;
use crate::queue_pair::Prepared;
use crate::queue_pair::QueuePair;
use crate::queue_pair::SubmitError;
use crate::queue_pair::Submitted;
use crate::ratelimit::warn_ratelimited;
use crate::registers::Bar0;
use crate::registers::DeviceRegisters;
use crate::request::IoRequest;
use crate::request::RequestResources;
use anyhow::Context as _;
use event_listener::Event;
use futures::channel::oneshot;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use user_driver::backoff::Backoff;
use user_driver::DeviceBacking;
use user_driver::HostDmaAllocator;

/// The lifecycle state of a controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControllerState {
    New,
    /// The admin queue is up and the controller is being identified and its
    /// I/O queues created.
    Connecting,
    Live,
    /// I/O is stopped while the controller is disabled and re-enabled.
    Resetting,
    Deleting,
    /// The controller failed or was shut down. Requests fail immediately.
    Dead,
}

impl ControllerState {
    fn can_transition(self, to: Self) -> bool {
        use ControllerState::*;
        match to {
            Live => matches!(self, New | Resetting | Connecting),
            Resetting => matches!(self, New | Live),
            Connecting => matches!(self, New | Resetting),
            Deleting => matches!(self, Live | Resetting | Connecting),
            Dead => matches!(self, Deleting),
            New => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Deleting | ControllerState::Dead)
    }
}

/// An asynchronous event reported by the controller.
#[derive(Debug, Copy, Clone)]
pub struct AsyncEvent {
    pub event_type: spec::AsynchronousEventType,
    pub information: u8,
    pub log_page: u8,
}

/// How many I/O queues of each kind exist. Default queues come first by
/// queue id, then read queues, then polled queues.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct QueueCounts {
    pub default: u16,
    pub read: u16,
    pub poll: u16,
}

/// What a timeout handler decided for the command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TimeoutAction {
    /// Keep waiting for another timeout period.
    ResetTimer,
    /// The command has been completed, possibly by cancellation.
    Done,
}

/// Queue and controller parameters established by the last reset.
pub(crate) struct Topology<T: DeviceBacking> {
    pub admin: Option<Arc<QueuePair<T>>>,
    /// Allocated I/O queues, indexed by queue id minus one.
    pub queues: Vec<Arc<QueuePair<T>>>,
    /// Enabled queues, including the admin queue.
    pub online_queues: u16,
    pub max_qid: u16,
    pub q_depth: u16,
    pub db_stride: u32,
    pub num_vecs: u16,
    pub counts: QueueCounts,
    pub sgls: spec::Sgls,
    pub oacs: spec::OptionalAdminCommandSupport,
    /// The controller supports NVM subsystem reset.
    pub subsystem: bool,
    pub ready_timeout: Duration,
    pub max_transfer_bytes: u32,
}

impl<T: DeviceBacking> Topology<T> {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            admin: None,
            queues: Vec::new(),
            online_queues: 0,
            max_qid: 0,
            q_depth: 0,
            db_stride: 1,
            num_vecs: 0,
            counts: QueueCounts::default(),
            sgls: spec::Sgls::new(),
            oacs: spec::OptionalAdminCommandSupport::new(),
            subsystem: false,
            ready_timeout: Duration::from_millis(500),
            max_transfer_bytes: config.max_transfer_bytes,
        }
    }

    /// The enabled I/O queues.
    pub fn online_io(&self) -> &[Arc<QueuePair<T>>] {
        let n = (self.online_queues.saturating_sub(1) as usize).min(self.queues.len());
        &self.queues[..n]
    }
}

#[derive(Default)]
struct GateState {
    frozen: bool,
    quiesced: bool,
    closed: bool,
    in_flight: usize,
}

/// Admission control for I/O requests.
///
/// Freezing stops new requests from entering so that in-flight ones can
/// drain; quiescing stops them from being dispatched to the hardware queues.
/// Either one makes new requests wait. A closed gate fails them.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    event: Event,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            drop(state);
            self.gate.event.notify(usize::MAX);
        }
    }
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            event: Event::new(),
        }
    }

    pub async fn enter(&self) -> Result<GateGuard<'_>, RequestError> {
        loop {
            let listener = self.event.listen();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(RequestError::ControllerDead);
                }
                if !state.frozen && !state.quiesced {
                    state.in_flight += 1;
                    return Ok(GateGuard { gate: self });
                }
            }
            listener.await;
        }
    }

    fn update(&self, f: impl FnOnce(&mut GateState)) {
        f(&mut self.state.lock());
        self.event.notify(usize::MAX);
    }

    pub fn freeze(&self) {
        self.update(|s| s.frozen = true)
    }

    pub fn unfreeze(&self) {
        self.update(|s| s.frozen = false)
    }

    pub fn quiesce(&self) {
        self.update(|s| s.quiesced = true)
    }

    pub fn unquiesce(&self) {
        self.update(|s| s.quiesced = false)
    }

    pub fn close(&self) {
        self.update(|s| s.closed = true)
    }

    /// Waits for in-flight requests to finish. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let listener = self.event.listen();
                if self.state.lock().in_flight == 0 {
                    break;
                }
                listener.await;
            }
        })
        .await
        .is_ok()
    }
}

#[derive(Default)]
struct Tasks {
    reset: Option<JoinHandle<()>>,
    async_events: Option<JoinHandle<()>>,
}

pub(crate) struct Inner<T: DeviceBacking> {
    pub device_id: String,
    pub device: Mutex<T>,
    pub registers: Arc<DeviceRegisters<T>>,
    pub allocator: Arc<dyn HostDmaAllocator>,
    pub mapper: Arc<dyn DmaMapper>,
    pub pools: DescriptorPools,
    pub node: u16,
    pub config: ControllerConfig,
    state: watch::Sender<ControllerState>,
    /// Serializes disabling and enabling the controller.
    pub shutdown_lock: tokio::sync::Mutex<()>,
    pub topology: Mutex<Topology<T>>,
    pub gate: Gate,
    abort_limit: AtomicI32,
    pub identify: Mutex<Option<Arc<spec::IdentifyController>>>,
    pub dbbuf: Mutex<Option<Arc<DoorbellBuffer>>>,
    pub hmb: Mutex<Option<HostMemory>>,
    pub namespaces: Mutex<Vec<Weak<NamespaceState>>>,
    events: broadcast::Sender<AsyncEvent>,
    pub aen_send: mpsc::UnboundedSender<spec::Completion>,
    tasks: Mutex<Tasks>,
}

/// Submits `prepared`, waiting for a free tag if the queue is full.
pub(crate) async fn submit_waiting<T: DeviceBacking>(
    queue: &QueuePair<T>,
    mut prepared: Prepared,
) -> Result<Submitted, RequestError> {
    loop {
        match queue.submit(prepared, true) {
            Ok(submitted) => return Ok(submitted),
            Err((SubmitError::Full, p)) => {
                prepared = p;
                queue.wait_for_slot().await;
            }
            Err((SubmitError::Disabled, _)) => return Err(RequestError::Gone),
        }
    }
}

/// Reaps a polled queue until `completion` resolves.
async fn poll_until_complete<T: DeviceBacking>(
    queue: &QueuePair<T>,
    completion: &mut oneshot::Receiver<spec::Completion>,
) -> Result<spec::Completion, oneshot::Canceled> {
    let mut backoff = Backoff::new();
    loop {
        if queue.poll_completions() {
            backoff.reset();
        }
        if let Some(c) = completion.try_recv()? {
            return Ok(c);
        }
        backoff.back_off().await;
    }
}

pub(crate) fn raw(command: spec::Command) -> Prepared {
    Prepared {
        command,
        resources: RequestResources::default(),
    }
}

impl<T: DeviceBacking> Inner<T> {
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Moves to state `new` if that is a legal transition from the current
    /// state.
    pub fn change_state(&self, new: ControllerState) -> bool {
        let mut old = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition(new) {
                old = Some(std::mem::replace(state, new));
                true
            } else {
                false
            }
        });
        if let Some(old) = old {
            tracing::info!(pci_id = %self.device_id, ?old, ?new, "controller state change");
        }
        changed
    }

    /// Waits for a reset in progress to finish. Returns true if the
    /// controller is live.
    pub async fn wait_reset(&self) -> bool {
        let mut recv = self.state.subscribe();
        let live = match recv
            .wait_for(|s| !matches!(s, ControllerState::Resetting | ControllerState::Connecting))
            .await
        {
            Ok(state) => *state == ControllerState::Live,
            Err(_) => false,
        };
        live
    }

    pub fn admin(&self) -> Result<Arc<QueuePair<T>>, RequestError> {
        self.topology.lock().admin.clone().ok_or(RequestError::Gone)
    }

    /// Issues an admin command for the driver's own bring-up and teardown
    /// flows. A timeout fails the command without running the timeout
    /// handler; the flow that issued it decides how to recover.
    pub async fn admin_command_raw(
        &self,
        command: spec::Command,
    ) -> Result<spec::Completion, RequestError> {
        let admin = self.admin()?;
        let submitted = submit_waiting(&admin, raw(command)).await?;
        match tokio::time::timeout(self.config.admin_timeout, submitted.completion).await {
            Ok(Ok(completion)) => completion_result(completion),
            Ok(Err(_)) => Err(RequestError::Gone),
            Err(_) => {
                tracing::warn!(
                    opcode = command.cdw0.opcode(),
                    cid = submitted.cid,
                    "admin command timed out"
                );
                Err(RequestError::Timeout)
            }
        }
    }

    /// Issues an admin command on behalf of a caller. Timeouts escalate to a
    /// controller reset.
    pub async fn admin_command(
        self: &Arc<Self>,
        command: spec::Command,
    ) -> Result<spec::Completion, RequestError> {
        if self.state() == ControllerState::Dead {
            return Err(RequestError::ControllerDead);
        }
        let admin = self.admin()?;
        let submitted = submit_waiting(&admin, raw(command)).await?;
        let completion = self
            .wait_for_completion(&admin, submitted, self.config.admin_timeout)
            .await?;
        completion_result(completion)
    }

    /// Waits for a submitted command, running the timeout handler each time
    /// `timeout` elapses.
    async fn wait_for_completion(
        self: &Arc<Self>,
        queue: &Arc<QueuePair<T>>,
        submitted: Submitted,
        timeout: Duration,
    ) -> Result<spec::Completion, RequestError> {
        let Submitted {
            cid,
            mut completion,
        } = submitted;
        let polled = queue.state().polled;
        loop {
            let result = if polled {
                tokio::time::timeout(timeout, poll_until_complete(queue, &mut completion)).await
            } else {
                tokio::time::timeout(timeout, &mut completion).await
            };
            match result {
                Ok(Ok(completion)) => break Ok(completion),
                Ok(Err(_)) => break Err(RequestError::Gone),
                Err(_) => {
                    let action = self.handle_timeout(queue, cid).await;
                    tracing::debug!(qid = queue.qid(), cid, ?action, "timeout handled");
                }
            }
        }
    }

    fn should_reset(&self, csts: spec::Csts, state: ControllerState) -> bool {
        if matches!(
            state,
            ControllerState::Resetting | ControllerState::Connecting
        ) {
            return false;
        }
        let nssro = self.topology.lock().subsystem && csts.nssro();
        csts.cfs() || nssro
    }

    /// Handles a command that did not complete in time.
    ///
    /// A command is aborted at most once. A second timeout resets the
    /// controller, as does a timeout on the admin queue, on a suspended
    /// queue, or on a failed controller.
    pub(crate) async fn handle_timeout(
        self: &Arc<Self>,
        queue: &Arc<QueuePair<T>>,
        cid: u16,
    ) -> TimeoutAction {
        let qid = queue.qid();
        let state = self.state();
        let csts = self.registers.bar0.csts();

        if state.is_terminal() {
            return self.disable_after_timeout().await;
        }
        if self.should_reset(csts, state) {
            tracing::warn!(
                pci_id = %self.device_id,
                csts = u32::from(csts),
                "controller is down; will reset"
            );
            return self.disable_after_timeout().await;
        }

        // Did we miss an interrupt?
        queue.poll_completions();
        if !queue.is_pending(cid) {
            warn_ratelimited!(qid, cid, "timed out command completed after polling");
            return TimeoutAction::Done;
        }

        match state {
            ControllerState::Connecting => {
                self.change_state(ControllerState::Deleting);
                warn_ratelimited!(qid, cid, "command timeout while connecting, disable controller");
                self.disable(true).await;
                return TimeoutAction::Done;
            }
            ControllerState::Resetting => return TimeoutAction::ResetTimer,
            _ => {}
        }

        // A suspended queue is being torn down, so an abort cannot help.
        if qid == 0 || !queue.is_enabled() || queue.is_aborted(cid) == Some(true) {
            warn_ratelimited!(qid, cid, "command timeout, reset controller");
            return self.disable_after_timeout().await;
        }

        if self.abort_limit.fetch_sub(1, Ordering::SeqCst) <= 0 {
            self.abort_limit.fetch_add(1, Ordering::SeqCst);
            return TimeoutAction::ResetTimer;
        }
        if queue.mark_aborted(cid).is_none() {
            self.abort_limit.fetch_add(1, Ordering::SeqCst);
            return TimeoutAction::Done;
        }

        warn_ratelimited!(qid, cid, "command timeout, aborting");
        let this = self.clone();
        tokio::spawn(
            async move {
                let status = match this.admin_command_raw(admin::abort(qid, cid)).await {
                    Ok(_) => spec::Status::SUCCESS,
                    Err(RequestError::Nvme(err)) => err.status(),
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed to issue abort"
                        );
                        spec::Status::HOST_ABORTED_COMMAND
                    }
                };
                tracing::warn!(?status, "abort status");
                this.abort_limit.fetch_add(1, Ordering::SeqCst);
            }
            .instrument(tracing::info_span!("nvme_abort", qid, cid)),
        );
        TimeoutAction::ResetTimer
    }

    async fn disable_after_timeout(self: &Arc<Self>) -> TimeoutAction {
        if !self.change_state(ControllerState::Resetting) {
            if self.state().is_terminal() {
                self.disable(true).await;
            }
            return TimeoutAction::Done;
        }
        self.disable(false).await;
        self.queue_reset();
        TimeoutAction::Done
    }

    /// Starts the reset work. The controller must already be resetting.
    pub fn queue_reset(self: &Arc<Self>) {
        let this = self.clone();
        let span = tracing::info_span!("nvme_reset", pci_id = %self.device_id);
        let task = tokio::spawn(async move { this.reset_work().await }.instrument(span));
        if let Some(old) = self.tasks.lock().reset.replace(task) {
            // The previous reset already left the resetting state.
            drop(old);
        }
    }

    /// Stops I/O, tears down the I/O queues and disables the controller.
    /// Outstanding commands are cancelled. With `shutdown`, the controller is
    /// shut down rather than just disabled, and waiting requests are released
    /// afterwards so that they fail fast.
    pub async fn disable(self: &Arc<Self>, shutdown: bool) {
        let _lock = self.shutdown_lock.lock().await;
        let state = self.state();
        let csts = self.registers.bar0.csts();
        let dead = csts.cfs() || !csts.rdy();
        let freeze = matches!(state, ControllerState::Live | ControllerState::Resetting);
        tracing::debug!(shutdown, dead, ?state, "disabling controller");

        if freeze {
            self.gate.freeze();
            if !dead && shutdown && !self.gate.wait_idle(self.config.io_timeout).await {
                tracing::warn!("timed out waiting for io to drain");
            }
        }
        self.gate.quiesce();

        let admin = self.topology.lock().admin.clone();
        if let Some(admin) = &admin {
            if !dead {
                if shutdown {
                    self.disable_host_mem().await;
                }
                self.delete_io_queues().await;
                if let Err(err) = self.disable_ctrl(shutdown).await {
                    tracing::warn!(
                        error = err.as_ref() as &dyn std::error::Error,
                        "failed to disable controller"
                    );
                }
                admin.poll_completions();
            }
        }

        self.suspend_io_queues();
        if let Some(admin) = &admin {
            self.suspend_queue(admin);
        }
        self.reap_pending();

        let (queues, admin) = {
            let topology = self.topology.lock();
            (topology.queues.clone(), topology.admin.clone())
        };
        let cancelled = queues
            .iter()
            .chain(admin.as_ref())
            .map(|q| q.cancel_all(false))
            .sum::<usize>();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled outstanding commands");
        }

        if shutdown {
            self.gate.unquiesce();
        }
    }

    async fn disable_ctrl(&self, shutdown: bool) -> anyhow::Result<()> {
        if shutdown {
            self.registers
                .bar0
                .shutdown(self.config.shutdown_timeout)
                .await
        } else {
            let timeout = self.topology.lock().ready_timeout;
            self.registers.bar0.disable(timeout).await
        }
    }

    async fn reset_work(self: Arc<Self>) {
        if let Err(err) = self.try_reset().await {
            tracing::error!(
                pci_id = %self.device_id,
                error = err.as_ref() as &dyn std::error::Error,
                "disabling device after reset failure"
            );
            self.change_state(ControllerState::Deleting);
            self.disable(true).await;
            self.mark_namespaces_dead();
            self.change_state(ControllerState::Dead);
            self.gate.close();
        }
    }

    async fn try_reset(self: &Arc<Self>) -> anyhow::Result<()> {
        let state = self.state();
        if state != ControllerState::Resetting {
            anyhow::bail!("controller state {state:?} is not resetting");
        }
        // After a subsystem reset CC.EN already reads clear, but queues may
        // still hold commands.
        if self.registers.bar0.cc().en() || self.topology.lock().online_queues > 0 {
            self.disable(false).await;
        }

        {
            let _lock = self.shutdown_lock.lock().await;
            self.pci_enable()?;
            self.configure_admin_queue()
                .instrument(tracing::info_span!("nvme_ctrl_enable"))
                .await?;
        }

        if !self.change_state(ControllerState::Connecting) {
            anyhow::bail!("failed to mark controller connecting");
        }

        self.identify_controller().await?;
        self.dbbuf_alloc();
        self.setup_host_mem().await?;
        self.setup_io_queues()
            .instrument(tracing::info_span!("nvme_setup_io_queues"))
            .await?;

        if self.topology.lock().online_queues > 1 {
            self.dbbuf_set().await;
        } else {
            tracing::warn!(pci_id = %self.device_id, "io queues lost");
            self.mark_namespaces_dead();
        }
        self.gate.unquiesce();
        self.gate.unfreeze();

        if !self.change_state(ControllerState::Live) {
            anyhow::bail!("failed to mark controller live");
        }
        self.start_ctrl();
        Ok(())
    }

    /// Reads the identify controller structure and derives the limits that
    /// depend on it.
    async fn identify_controller(&self) -> anyhow::Result<()> {
        let buffer = self
            .allocator
            .allocate_dma_buffer(size_of::<spec::IdentifyController>())
            .context("failed to allocate identify buffer")?;
        self.admin_command_raw(admin::identify_controller(buffer.device_address(0)))
            .await
            .context("failed to identify controller")?;
        let identify = buffer.read_obj::<spec::IdentifyController>(0);

        self.abort_limit
            .store(identify.acl as i32 + 1, Ordering::SeqCst);
        {
            let mut topology = self.topology.lock();
            topology.sgls = identify.sgls;
            topology.oacs = identify.oacs;
            topology.max_transfer_bytes = if identify.mdts != 0 {
                let mdts_bytes = (user_driver::memory::PAGE_SIZE as u64) << identify.mdts;
                (self.config.max_transfer_bytes as u64).min(mdts_bytes) as u32
            } else {
                self.config.max_transfer_bytes
            };
        }
        *self.identify.lock() = Some(Arc::new(identify));
        Ok(())
    }

    /// Arms the asynchronous event request.
    fn start_ctrl(&self) {
        if let Ok(admin) = self.admin() {
            if !admin.submit_async_event() {
                tracing::warn!("failed to submit asynchronous event request");
            }
        }
    }

    async fn handle_async_event(self: &Arc<Self>, completion: spec::Completion) {
        let status = spec::Status(completion.status.status());
        if status != spec::Status::SUCCESS {
            // Cancelled requests are re-armed when the controller is started
            // again.
            if !matches!(
                status,
                spec::Status::HOST_ABORTED_COMMAND
                    | spec::Status::COMMAND_ABORTED_DUE_TO_SQ_DELETION
            ) {
                tracing::warn!(?status, "asynchronous event request failed");
            }
            return;
        }

        let dw0 = spec::AsynchronousEventRequestDw0::from(completion.dw0);
        let event = AsyncEvent {
            event_type: spec::AsynchronousEventType(dw0.event_type()),
            information: dw0.information(),
            log_page: dw0.log_page_identifier(),
        };
        if self.state() == ControllerState::Live {
            self.start_ctrl();
        }

        match event.event_type {
            spec::AsynchronousEventType::NOTICE
                if event.information
                    == spec::AsynchronousEventInformationNotice::NAMESPACE_ATTRIBUTE_CHANGED.0 =>
            {
                tracing::info!("namespace attribute change event");
                match self.changed_namespaces().await {
                    Ok(true) => self.rescan_namespaces().await,
                    Ok(false) => {}
                    Err(err) => tracing::warn!(
                        error = err.as_ref() as &dyn std::error::Error,
                        "failed to query changed namespace list"
                    ),
                }
            }
            event_type => {
                tracing::info!(
                    ?event_type,
                    information = event.information,
                    log_page_identifier = event.log_page,
                    "asynchronous event"
                );
            }
        }
        // Nobody may be listening.
        self.events.send(event).ok();
    }

    /// Reads (and so clears) the changed namespace list. Returns true if any
    /// namespace changed.
    async fn changed_namespaces(&self) -> anyhow::Result<bool> {
        let buffer = self.allocator.allocate_dma_buffer(4096)?;
        self.admin_command_raw(admin::get_log_page(
            spec::LogPageIdentifier::CHANGED_NAMESPACE_LIST,
            buffer.device_address(0),
            4096,
        ))
        .await?;
        Ok(buffer.read_u32(0) != 0)
    }

    pub fn mark_namespaces_dead(&self) {
        let mut namespaces = self.namespaces.lock();
        namespaces.retain(|ns| {
            ns.upgrade().is_some_and(|ns| {
                ns.mark_dead();
                true
            })
        });
    }

    /// Picks the queue for a request: polled requests go to the poll queues,
    /// reads to the read queues if there are any, and everything else to the
    /// default queues, spread by CPU.
    fn select_queue(&self, req: &IoRequest) -> Result<Arc<QueuePair<T>>, RequestError> {
        let topology = self.topology.lock();
        let online = topology.online_io();
        if online.is_empty() {
            return Err(RequestError::NoIoQueues);
        }
        let counts = topology.counts;
        let (first, count) = if req.polled && counts.poll > 0 {
            (counts.default + counts.read, counts.poll)
        } else if req.direction == DmaDirection::FromDevice
            && req.data.len() + req.integrity.len() > 0
            && counts.read > 0
        {
            (counts.default, counts.read)
        } else {
            (0, counts.default.max(1))
        };
        let index = first as usize + (req.cpu % count as u32) as usize;
        let queue = online
            .get(index)
            .unwrap_or(&online[req.cpu as usize % online.len()]);
        Ok(queue.clone())
    }

    fn prepare(
        &self,
        queue: &QueuePair<T>,
        req: &IoRequest,
    ) -> Result<Prepared, RequestError> {
        let (sgls, max_transfer_bytes) = {
            let topology = self.topology.lock();
            (topology.sgls, topology.max_transfer_bytes)
        };
        req.validate(&self.config)?;
        if req.payload_len() > max_transfer_bytes as u64 {
            return Err(RequestError::Malformed(
                "transfer exceeds controller limit",
            ));
        }
        let ctx = MapContext {
            qid: queue.qid(),
            pools: queue.pools(),
            mapper: &self.mapper,
            sgls,
            sgl_threshold: self.config.sgl_threshold,
        };
        let (command, resources) = descriptors::prepare(&ctx, req)?;
        Ok(Prepared { command, resources })
    }

    /// Issues one I/O request and waits for its completion.
    pub async fn submit_io(self: &Arc<Self>, req: &IoRequest) -> Result<spec::Completion, RequestError> {
        if self.state() == ControllerState::Dead {
            return Err(RequestError::ControllerDead);
        }
        let _guard = self.gate.enter().await?;
        let queue = self.select_queue(req)?;
        let prepared = self.prepare(&queue, req)?;
        let submitted = submit_waiting(&queue, prepared).await?;
        let completion = self
            .wait_for_completion(&queue, submitted, self.config.io_timeout)
            .await?;
        completion_result(completion)
    }

    /// Issues a list of I/O requests, copying the ones bound for the same
    /// queue into it under a single lock with one doorbell write.
    pub async fn submit_io_batch(
        self: &Arc<Self>,
        reqs: &[IoRequest],
    ) -> Vec<Result<spec::Completion, RequestError>> {
        if self.state() == ControllerState::Dead {
            return reqs.iter().map(|_| Err(RequestError::ControllerDead)).collect();
        }
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(_) => {
                return reqs.iter().map(|_| Err(RequestError::ControllerDead)).collect();
            }
        };

        let mut results: Vec<Option<Result<spec::Completion, RequestError>>> =
            reqs.iter().map(|_| None).collect();
        let mut groups: Vec<(Arc<QueuePair<T>>, Vec<usize>, Vec<Prepared>)> = Vec::new();
        for (i, req) in reqs.iter().enumerate() {
            let prepared = self
                .select_queue(req)
                .and_then(|queue| Ok((self.prepare(&queue, req)?, queue)));
            match prepared {
                Ok((prepared, queue)) => {
                    match groups.iter_mut().find(|(q, _, _)| q.qid() == queue.qid()) {
                        Some((_, indices, batch)) => {
                            indices.push(i);
                            batch.push(prepared);
                        }
                        None => groups.push((queue, vec![i], vec![prepared])),
                    }
                }
                Err(err) => results[i] = Some(Err(err)),
            }
        }

        enum Pending {
            Submitted(Submitted),
            Rejected(Prepared),
        }

        let mut waits = Vec::new();
        for (queue, indices, batch) in groups {
            let (submitted, rejected) = queue.submit_batch(batch);
            // Submission stops at the first command that does not fit, so
            // the submitted commands are a prefix of the batch.
            let pending = submitted
                .into_iter()
                .map(Pending::Submitted)
                .chain(rejected.into_iter().map(Pending::Rejected));
            for (i, pending) in indices.into_iter().zip(pending) {
                let queue = queue.clone();
                waits.push(async move {
                    let result = async {
                        let submitted = match pending {
                            Pending::Submitted(s) => s,
                            Pending::Rejected(prepared) => {
                                submit_waiting(&queue, prepared).await?
                            }
                        };
                        let completion = self
                            .wait_for_completion(&queue, submitted, self.config.io_timeout)
                            .await?;
                        completion_result(completion)
                    }
                    .await;
                    (i, result)
                });
            }
        }
        for (i, result) in join_all(waits).await {
            results[i] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(RequestError::Gone)))
            .collect()
    }
}

/// A handle to an NVMe controller.
///
/// Call [`NvmeController::shutdown`] to shut the controller down cleanly.
/// Dropping the handle without doing so only disables the controller.
pub struct NvmeController<T: DeviceBacking> {
    inner: Arc<Inner<T>>,
}

impl<T: DeviceBacking> NvmeController<T> {
    /// Brings up the controller: enables it, creates the admin and I/O
    /// queues, and arms asynchronous events.
    pub async fn new(mut device: T, config: ControllerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let pci_id = device.id().to_owned();
        let bar0 = Bar0(
            device
                .map_bar(0)
                .context("failed to map device registers")?,
        );
        let allocator: Arc<dyn HostDmaAllocator> = Arc::new(device.host_allocator());
        let mapper: Arc<dyn DmaMapper> = match device.iommu() {
            Some(domain) => Arc::new(IommuMapper::new(domain)),
            None => Arc::new(IdentityMapper),
        };
        let (aen_send, aen_recv) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let inner = Arc::new(Inner {
            device_id: pci_id.clone(),
            node: device.numa_node(),
            device: Mutex::new(device),
            registers: Arc::new(DeviceRegisters::new(bar0)),
            pools: DescriptorPools::new(allocator.clone()),
            allocator,
            mapper,
            topology: Mutex::new(Topology::new(&config)),
            config,
            state: watch::Sender::new(ControllerState::New),
            shutdown_lock: Default::default(),
            gate: Gate::new(),
            abort_limit: AtomicI32::new(1),
            identify: Mutex::new(None),
            dbbuf: Mutex::new(None),
            hmb: Mutex::new(None),
            namespaces: Mutex::new(Vec::new()),
            events,
            aen_send,
            tasks: Mutex::new(Tasks::default()),
        });

        let task = tokio::spawn(
            handle_async_events(Arc::downgrade(&inner), aen_recv)
                .instrument(tracing::info_span!("nvme_async_event", pci_id = %pci_id)),
        );
        inner.tasks.lock().async_events = Some(task);

        if !inner.change_state(ControllerState::Resetting) {
            anyhow::bail!("failed to start controller reset");
        }
        inner.clone().reset_work().await;
        if inner.state() != ControllerState::Live {
            anyhow::bail!("controller failed to initialize");
        }
        Ok(Self { inner })
    }

    pub fn state(&self) -> ControllerState {
        self.inner.state()
    }

    /// Returns a receiver of controller state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    /// Returns a receiver of asynchronous events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AsyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn identify(&self) -> Option<Arc<spec::IdentifyController>> {
        self.inner.identify.lock().clone()
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.inner.topology.lock().counts
    }

    /// The number of enabled queues, including the admin queue.
    pub fn online_queues(&self) -> u16 {
        self.inner.topology.lock().online_queues
    }

    /// Gets the namespace with namespace ID `nsid`.
    pub async fn namespace(&self, nsid: u32) -> Result<Namespace<T>, NamespaceError> {
        Namespace::new(self.inner.clone(), nsid).await
    }

    /// Issues one request, without retrying.
    pub async fn submit(&self, req: IoRequest) -> Result<spec::Completion, RequestError> {
        self.inner.submit_io(&req).await
    }

    /// Issues a list of requests, without retrying.
    pub async fn submit_batch(
        &self,
        reqs: Vec<IoRequest>,
    ) -> Vec<Result<spec::Completion, RequestError>> {
        self.inner.submit_io_batch(&reqs).await
    }

    /// Resets the controller and waits for it to come back.
    pub async fn reset(&self) -> anyhow::Result<()> {
        if !self.inner.change_state(ControllerState::Resetting) {
            anyhow::bail!("controller is busy: {:?}", self.state());
        }
        self.inner.queue_reset();
        if !self.inner.wait_reset().await {
            anyhow::bail!("controller did not come back after reset");
        }
        Ok(())
    }

    /// Waits for a reset in progress to finish. Returns true if the
    /// controller is live.
    pub async fn wait_reset(&self) -> bool {
        self.inner.wait_reset().await
    }

    /// Resets the NVM subsystem, then resets the controller.
    pub async fn subsystem_reset(&self) -> anyhow::Result<()> {
        if !self.inner.topology.lock().subsystem {
            anyhow::bail!("controller does not support subsystem reset");
        }
        let mut recv = self.inner.state.subscribe();
        while !self.inner.change_state(ControllerState::Resetting) {
            if self.state().is_terminal() {
                anyhow::bail!("controller is being deleted");
            }
            recv.changed().await?;
        }
        self.inner
            .registers
            .bar0
            .set_nssr(spec::NSSR_RESET_VALUE);
        self.inner.queue_reset();
        Ok(())
    }

    pub async fn set_power_state(&self, ps: u8) -> Result<(), RequestError> {
        self.inner
            .admin_command(admin::set_features(
                spec::Feature::POWER_MANAGEMENT,
                spec::Cdw11FeaturePowerManagement::new().with_ps(ps).into(),
            ))
            .await?;
        Ok(())
    }

    pub async fn power_state(&self) -> Result<u8, RequestError> {
        let completion = self
            .inner
            .admin_command(admin::get_features(spec::Feature::POWER_MANAGEMENT))
            .await?;
        Ok(spec::Cdw11FeaturePowerManagement::from(completion.dw0).ps())
    }

    /// Drains I/O, deletes the I/O queues and shuts the controller down.
    /// Every namespace is marked dead.
    pub async fn shutdown(self) {
        let inner = &self.inner;
        loop {
            inner.wait_reset().await;
            if inner.change_state(ControllerState::Deleting) || inner.state().is_terminal() {
                break;
            }
        }
        let reset = inner.tasks.lock().reset.take();
        if let Some(reset) = reset {
            reset.await.ok();
        }

        inner.gate.freeze();
        if !inner.gate.wait_idle(inner.config.io_timeout).await {
            tracing::warn!("timed out waiting for io to drain before shutdown");
        }
        inner.disable(true).await;
        inner.mark_namespaces_dead();
        inner.change_state(ControllerState::Dead);
        inner.gate.close();
        inner.free_host_mem();
        *inner.dbbuf.lock() = None;
        if let Some(task) = inner.tasks.lock().async_events.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner<T>> {
        &self.inner
    }
}

impl<T: DeviceBacking> Drop for NvmeController<T> {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(task) = tasks.async_events.take() {
            task.abort();
        }
        if let Some(task) = tasks.reset.take() {
            task.abort();
        }
        drop(tasks);
        if self.inner.state() != ControllerState::Dead {
            tracing::warn!(
                pci_id = %self.inner.device_id,
                "controller dropped without shutdown, disabling"
            );
            let bar0 = &self.inner.registers.bar0;
            if !bar0.is_gone() {
                bar0.set_cc(bar0.cc().with_en(false));
            }
            self.inner.gate.close();
        }
    }
}

async fn handle_async_events<T: DeviceBacking>(
    inner: Weak<Inner<T>>,
    mut recv: mpsc::UnboundedReceiver<spec::Completion>,
) {
    while let Some(completion) = recv.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_async_event(completion).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        use ControllerState::*;
        assert!(New.can_transition(Resetting));
        assert!(Resetting.can_transition(Connecting));
        assert!(Connecting.can_transition(Live));
        assert!(Live.can_transition(Resetting));
        assert!(Resetting.can_transition(Deleting));
        assert!(Deleting.can_transition(Dead));

        assert!(!Live.can_transition(Live));
        assert!(!Connecting.can_transition(Resetting));
        assert!(!Dead.can_transition(Resetting));
        assert!(!Deleting.can_transition(Resetting));
        assert!(!Live.can_transition(Dead));
        assert!(Deleting.is_terminal() && Dead.is_terminal());
    }

    #[tokio::test]
    async fn gate_blocks_while_quiesced() {
        let gate = Arc::new(Gate::new());
        gate.quiesce();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.enter().await.map(drop).is_ok() }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        gate.unquiesce();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn closed_gate_fails_waiters() {
        let gate = Arc::new(Gate::new());
        gate.freeze();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.enter().await.map(drop) }
        });
        tokio::task::yield_now().await;
        gate.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RequestError::ControllerDead)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_tracks_in_flight() {
        let gate = Gate::new();
        let guard = gate.enter().await.unwrap();
        assert!(!gate.wait_idle(Duration::from_secs(1)).await);
        drop(guard);
        assert!(gate.wait_idle(Duration::from_secs(1)).await);
    }
}
