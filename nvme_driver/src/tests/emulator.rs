// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal NVMe controller that runs commands synchronously when a
//! doorbell is written, with knobs for injecting faults.

use crate::spec;
use crate::spec::nvm;
use std::collections::HashMap;
use user_driver::emulated::DeviceDma;
use user_driver::emulated::MmioIntercept;
use user_driver::emulated::MsiInterruptSet;
use user_driver::memory::PAGE_SIZE64;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// I/O queue pairs granted by Set Features (Number of Queues).
    pub max_queues: u16,
    pub mqes_z: u16,
    pub acl: u8,
    pub mdts: u8,
    pub sgls: bool,
    pub doorbell_buffer: bool,
    pub hmpre: u32,
    pub hmmin: u32,
    pub nssrs: bool,
    pub namespace_blocks: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            max_queues: 64,
            mqes_z: 255,
            acl: 3,
            mdts: 5,
            sgls: false,
            doorbell_buffer: false,
            hmpre: 0,
            hmmin: 0,
            nssrs: false,
            namespace_blocks: 2048,
        }
    }
}

/// Injected faults.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// I/O commands are accepted but never completed.
    pub hold_io: bool,
    /// Abort commands report that nothing was aborted.
    pub ignore_aborts: bool,
    /// Creating a submission queue with a higher id fails.
    pub reject_sq_above: Option<u16>,
    pub fail_queue_count: bool,
    pub fail_doorbell_buffer: bool,
    /// Register reads return all ones and writes are dropped.
    pub gone: bool,
}

/// Counters and settings observed by the controller.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub enables: usize,
    pub shutdowns: usize,
    pub aborts: usize,
    pub subsystem_resets: usize,
    pub admin_opcodes: Vec<u8>,
    pub io_commands: usize,
    /// Cdw11 and size in pages of the last host memory buffer feature.
    pub host_memory: Option<(u32, u32)>,
    pub power_state: u8,
    pub polled_cqs: Vec<u16>,
}

struct Sq {
    addr: u64,
    size: u16,
    head: u16,
    tail: u16,
    cqid: u16,
}

struct Cq {
    addr: u64,
    size: u16,
    tail: u16,
    phase: bool,
    vector: u16,
    ien: bool,
}

struct Held {
    sqid: u16,
    cid: u16,
}

pub struct NvmeEmulator {
    dma: DeviceDma,
    interrupts: MsiInterruptSet,
    config: EmulatorConfig,
    pub faults: Faults,
    pub stats: Stats,
    cc: spec::Cc,
    csts: spec::Csts,
    aqa: spec::Aqa,
    asq: u64,
    acq: u64,
    sqs: HashMap<u16, Sq>,
    cqs: HashMap<u16, Cq>,
    held: Vec<Held>,
    aers: Vec<u16>,
    pending_events: Vec<u32>,
    changed_namespaces: Vec<u32>,
    doorbell_buffer: Option<(u64, u64)>,
    data: Vec<u8>,
    blocks: u64,
}

impl NvmeEmulator {
    pub fn new(dma: DeviceDma, interrupts: MsiInterruptSet, config: EmulatorConfig) -> Self {
        let blocks = config.namespace_blocks;
        Self {
            dma,
            interrupts,
            config,
            faults: Faults::default(),
            stats: Stats::default(),
            cc: spec::Cc::new(),
            csts: spec::Csts::new(),
            aqa: spec::Aqa::new(),
            asq: 0,
            acq: 0,
            sqs: HashMap::new(),
            cqs: HashMap::new(),
            held: Vec::new(),
            aers: Vec::new(),
            pending_events: Vec::new(),
            changed_namespaces: Vec::new(),
            doorbell_buffer: None,
            data: vec![0; (blocks * BLOCK_SIZE) as usize],
            blocks,
        }
    }

    pub fn cap(&self) -> spec::Cap {
        spec::Cap::new()
            .with_mqes_z(self.config.mqes_z)
            .with_cqr(true)
            .with_to(2)
            .with_nssrs(self.config.nssrs)
            .with_css_nvm(true)
    }

    pub fn csts(&self) -> spec::Csts {
        self.csts
    }

    pub fn set_fatal(&mut self) {
        self.csts.set_cfs(true);
    }

    /// The number of I/O submission queues the controller has.
    pub fn io_queue_count(&self) -> usize {
        self.sqs.keys().filter(|&&qid| qid != 0).count()
    }

    pub fn doorbell_buffer_configured(&self) -> bool {
        self.doorbell_buffer.is_some()
    }

    pub fn sq_tail(&self, qid: u16) -> Option<u16> {
        self.sqs.get(&qid).map(|sq| sq.tail)
    }

    /// Reads the shadow doorbell the driver keeps for a queue.
    pub fn shadow_doorbell(&self, qid: u16, completion: bool) -> Option<u32> {
        let (dbs, _) = self.doorbell_buffer?;
        self.dma
            .read_u32(dbs + (qid as u64 * 2 + completion as u64) * 4)
            .ok()
    }

    pub fn read_blocks(&self, lba: u64, count: u64) -> &[u8] {
        &self.data[(lba * BLOCK_SIZE) as usize..((lba + count) * BLOCK_SIZE) as usize]
    }

    /// Changes the namespace size and raises a namespace attribute notice.
    pub fn resize_namespace(&mut self, blocks: u64) {
        self.blocks = blocks;
        self.data.resize((blocks * BLOCK_SIZE) as usize, 0);
        self.changed_namespaces.push(1);
        self.raise_event(
            spec::AsynchronousEventRequestDw0::new()
                .with_event_type(spec::AsynchronousEventType::NOTICE.0)
                .with_information(spec::AsynchronousEventInformationNotice::NAMESPACE_ATTRIBUTE_CHANGED.0)
                .with_log_page_identifier(spec::LogPageIdentifier::CHANGED_NAMESPACE_LIST.0)
                .into(),
        );
    }

    /// Completes an outstanding asynchronous event request with `dw0`, or
    /// queues the event until one arrives.
    pub fn raise_event(&mut self, dw0: u32) {
        match self.aers.pop() {
            Some(cid) => self.post(0, cid, spec::Status::SUCCESS, dw0),
            None => self.pending_events.push(dw0),
        }
    }

    fn reset(&mut self) {
        self.sqs.clear();
        self.cqs.clear();
        self.held.clear();
        self.aers.clear();
        self.doorbell_buffer = None;
        self.csts.set_rdy(false);
    }

    fn write_cc(&mut self, cc: spec::Cc) {
        if cc.en() && !self.cc.en() {
            self.stats.enables += 1;
            self.cqs.insert(
                0,
                Cq {
                    addr: self.acq,
                    size: self.aqa.acqs_z() + 1,
                    tail: 0,
                    phase: true,
                    vector: 0,
                    ien: true,
                },
            );
            self.sqs.insert(
                0,
                Sq {
                    addr: self.asq,
                    size: self.aqa.asqs_z() + 1,
                    head: 0,
                    tail: 0,
                    cqid: 0,
                },
            );
            self.csts.set_rdy(true);
            self.csts.set_shst(0);
        } else if !cc.en() && self.cc.en() {
            self.reset();
            self.csts.set_shst(0);
        }
        if cc.shn() != 0 && self.cc.shn() == 0 {
            self.stats.shutdowns += 1;
            self.csts.set_shst(spec::CSTS_SHST_COMPLETE);
        }
        self.cc = cc;
    }

    fn doorbell(&mut self, index: u16, value: u32) {
        let qid = index / 2;
        if index % 2 == 1 {
            // Completion queue head; the queues never fill in these tests.
            return;
        }
        let Some(sq) = self.sqs.get_mut(&qid) else {
            tracing::warn!(qid, "doorbell for missing queue");
            return;
        };
        sq.tail = value as u16;
        if let Some((_, eis)) = self.doorbell_buffer {
            self.dma
                .write_u32(eis + qid as u64 * 8, value)
                .ok();
        }
        self.process(qid);
    }

    fn process(&mut self, qid: u16) {
        loop {
            let Some(sq) = self.sqs.get_mut(&qid) else {
                return;
            };
            if sq.head == sq.tail {
                return;
            }
            let addr = sq.addr + sq.head as u64 * 64;
            sq.head = (sq.head + 1) % sq.size;
            let Ok(command) = self.dma.read_obj::<spec::Command>(addr) else {
                return;
            };
            let cid = command.cdw0.cid();
            let result = if qid == 0 {
                self.admin(command)
            } else {
                self.io(qid, command)
            };
            if let Some((status, dw0)) = result {
                self.post(qid, cid, status, dw0);
            }
        }
    }

    fn post(&mut self, sqid: u16, cid: u16, status: spec::Status, dw0: u32) {
        let Some(sq) = self.sqs.get(&sqid) else {
            return;
        };
        let sqhd = sq.head;
        let Some(cq) = self.cqs.get_mut(&sq.cqid) else {
            return;
        };
        let completion = spec::Completion {
            dw0,
            dw1: 0,
            sqhd,
            sqid,
            cid,
            status: spec::CompletionStatus::new()
                .with_phase(cq.phase)
                .with_status(status.0),
        };
        self.dma
            .write_obj(cq.addr + cq.tail as u64 * 16, &completion)
            .ok();
        cq.tail += 1;
        if cq.tail == cq.size {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
        if cq.ien {
            self.interrupts.signal(cq.vector);
        }
    }

    fn admin(&mut self, command: spec::Command) -> Option<(spec::Status, u32)> {
        let opcode = spec::AdminOpcode(command.cdw0.opcode());
        self.stats.admin_opcodes.push(opcode.0);
        let ok = Some((spec::Status::SUCCESS, 0));
        match opcode {
            spec::AdminOpcode::IDENTIFY => {
                let cns = spec::Cdw10Identify::from(command.cdw10).cns();
                if cns == spec::Cns::CONTROLLER.0 {
                    let mut identify = spec::IdentifyController::new_zeroed();
                    identify.mdts = self.config.mdts;
                    identify.acl = self.config.acl;
                    identify.hmpre = self.config.hmpre;
                    identify.hmmin = self.config.hmmin;
                    identify.nn = 1;
                    identify.oacs = spec::OptionalAdminCommandSupport::new()
                        .with_doorbell_buffer_config(self.config.doorbell_buffer);
                    if self.config.sgls {
                        identify.sgls = spec::Sgls::new().with_support(1);
                    }
                    self.dma.write_obj(command.dptr[0], &identify).ok();
                    ok
                } else if cns == spec::Cns::NAMESPACE.0 {
                    let mut identify = nvm::IdentifyNamespace::new_zeroed();
                    if command.nsid == 1 {
                        identify.nsze = self.blocks;
                        identify.ncap = self.blocks;
                        identify.lbaf[0] = nvm::Lbaf::new().with_lbads(9);
                    }
                    self.dma.write_obj(command.dptr[0], &identify).ok();
                    ok
                } else {
                    Some((spec::Status::INVALID_FIELD_IN_COMMAND, 0))
                }
            }
            spec::AdminOpcode::SET_FEATURES => {
                let fid = spec::Feature(spec::Cdw10SetFeatures::from(command.cdw10).fid());
                match fid {
                    spec::Feature::NUMBER_OF_QUEUES => {
                        if self.faults.fail_queue_count {
                            return Some((spec::Status::INTERNAL_ERROR, 0));
                        }
                        let requested = spec::Cdw11FeatureNumberOfQueues::from(command.cdw11);
                        let granted = requested.nsq_z().min(self.config.max_queues - 1);
                        Some((
                            spec::Status::SUCCESS,
                            spec::Cdw11FeatureNumberOfQueues::new()
                                .with_nsq_z(granted)
                                .with_ncq_z(granted)
                                .into(),
                        ))
                    }
                    spec::Feature::POWER_MANAGEMENT => {
                        self.stats.power_state =
                            spec::Cdw11FeaturePowerManagement::from(command.cdw11).ps();
                        ok
                    }
                    spec::Feature::HOST_MEMORY_BUFFER => {
                        self.stats.host_memory = Some((command.cdw11, command.cdw12));
                        ok
                    }
                    _ => Some((spec::Status::INVALID_FIELD_IN_COMMAND, 0)),
                }
            }
            spec::AdminOpcode::GET_FEATURES => {
                let fid = spec::Feature(spec::Cdw10GetFeatures::from(command.cdw10).fid());
                if fid == spec::Feature::POWER_MANAGEMENT {
                    Some((
                        spec::Status::SUCCESS,
                        spec::Cdw11FeaturePowerManagement::new()
                            .with_ps(self.stats.power_state)
                            .into(),
                    ))
                } else {
                    Some((spec::Status::INVALID_FIELD_IN_COMMAND, 0))
                }
            }
            spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE => {
                let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
                let cdw11 = spec::Cdw11CreateIoCompletionQueue::from(command.cdw11);
                if cdw10.qid() == 0 || self.cqs.contains_key(&cdw10.qid()) {
                    return Some((spec::Status::INVALID_QUEUE_IDENTIFIER, 0));
                }
                if !cdw11.ien() {
                    self.stats.polled_cqs.push(cdw10.qid());
                }
                self.cqs.insert(
                    cdw10.qid(),
                    Cq {
                        addr: command.dptr[0],
                        size: cdw10.qsize_z() + 1,
                        tail: 0,
                        phase: true,
                        vector: cdw11.iv(),
                        ien: cdw11.ien(),
                    },
                );
                ok
            }
            spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE => {
                let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
                let cdw11 = spec::Cdw11CreateIoSubmissionQueue::from(command.cdw11);
                if self
                    .faults
                    .reject_sq_above
                    .is_some_and(|max| cdw10.qid() > max)
                    || !self.cqs.contains_key(&cdw11.cqid())
                {
                    return Some((spec::Status::INVALID_QUEUE_IDENTIFIER, 0));
                }
                self.sqs.insert(
                    cdw10.qid(),
                    Sq {
                        addr: command.dptr[0],
                        size: cdw10.qsize_z() + 1,
                        head: 0,
                        tail: 0,
                        cqid: cdw11.cqid(),
                    },
                );
                ok
            }
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE => {
                let qid = spec::Cdw10DeleteIoQueue::from(command.cdw10).qid();
                if qid == 0 || !self.sqs.contains_key(&qid) {
                    return Some((spec::Status::INVALID_QUEUE_IDENTIFIER, 0));
                }
                let held = std::mem::take(&mut self.held);
                for h in held {
                    if h.sqid == qid {
                        self.post(qid, h.cid, spec::Status::COMMAND_ABORTED_DUE_TO_SQ_DELETION, 0);
                    } else {
                        self.held.push(h);
                    }
                }
                self.sqs.remove(&qid);
                ok
            }
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE => {
                let qid = spec::Cdw10DeleteIoQueue::from(command.cdw10).qid();
                if qid == 0 || self.cqs.remove(&qid).is_none() {
                    return Some((spec::Status::INVALID_QUEUE_IDENTIFIER, 0));
                }
                ok
            }
            spec::AdminOpcode::ABORT => {
                self.stats.aborts += 1;
                let cdw10 = spec::Cdw10Abort::from(command.cdw10);
                let found = self
                    .held
                    .iter()
                    .position(|h| h.sqid == cdw10.sqid() && h.cid == cdw10.cid());
                match found {
                    Some(i) if !self.faults.ignore_aborts => {
                        let held = self.held.remove(i);
                        self.post(
                            held.sqid,
                            held.cid,
                            spec::Status::COMMAND_ABORT_REQUESTED,
                            0,
                        );
                        ok
                    }
                    _ => Some((spec::Status::SUCCESS, 1)),
                }
            }
            spec::AdminOpcode::ASYNCHRONOUS_EVENT_REQUEST => {
                match self.pending_events.pop() {
                    Some(dw0) => Some((spec::Status::SUCCESS, dw0)),
                    None => {
                        self.aers.push(command.cdw0.cid());
                        None
                    }
                }
            }
            spec::AdminOpcode::GET_LOG_PAGE => {
                let lid = spec::Cdw10GetLogPage::from(command.cdw10).lid();
                if lid != spec::LogPageIdentifier::CHANGED_NAMESPACE_LIST.0 {
                    return Some((spec::Status::INVALID_LOG_PAGE, 0));
                }
                let mut list = [0u32; 1024];
                for (slot, nsid) in list.iter_mut().zip(self.changed_namespaces.drain(..)) {
                    *slot = nsid;
                }
                self.dma.write(command.dptr[0], list.as_bytes()).ok();
                ok
            }
            spec::AdminOpcode::DOORBELL_BUFFER_CONFIG => {
                if self.faults.fail_doorbell_buffer || !self.config.doorbell_buffer {
                    return Some((spec::Status::INVALID_FIELD_IN_COMMAND, 0));
                }
                self.doorbell_buffer = Some((command.dptr[0], command.dptr[1]));
                ok
            }
            _ => Some((spec::Status::INVALID_COMMAND_OPCODE, 0)),
        }
    }

    fn io(&mut self, qid: u16, command: spec::Command) -> Option<(spec::Status, u32)> {
        self.stats.io_commands += 1;
        if self.faults.hold_io {
            self.held.push(Held {
                sqid: qid,
                cid: command.cdw0.cid(),
            });
            return None;
        }
        if command.nsid != 1 {
            return Some((spec::Status::INVALID_NAMESPACE_OR_FORMAT, 0));
        }
        let opcode = nvm::NvmOpcode(command.cdw0.opcode());
        let status = match opcode {
            nvm::NvmOpcode::FLUSH => spec::Status::SUCCESS,
            nvm::NvmOpcode::READ | nvm::NvmOpcode::WRITE => self.read_write(&command, opcode),
            _ => spec::Status::INVALID_COMMAND_OPCODE,
        };
        Some((status, 0))
    }

    fn read_write(&mut self, command: &spec::Command, opcode: nvm::NvmOpcode) -> spec::Status {
        let lba = command.cdw10 as u64 | (command.cdw11 as u64) << 32;
        let count = nvm::Cdw12ReadWrite::from(command.cdw12).nlb_z() as u64 + 1;
        if lba + count > self.blocks {
            return spec::Status::LBA_OUT_OF_RANGE;
        }
        let len = count * BLOCK_SIZE;
        let segments = if command.cdw0.psdt() == spec::Psdt::PRP.0 {
            self.prp_segments(command.dptr[0], command.dptr[1], len)
        } else {
            self.sgl_segments(command.sgl())
        };
        let segments = match segments {
            Ok(segments) => segments,
            Err(status) => return status,
        };
        if segments.iter().map(|&(_, n)| n).sum::<u64>() != len {
            return spec::Status::DATA_SGL_LENGTH_INVALID;
        }

        let mut offset = (lba * BLOCK_SIZE) as usize;
        for (addr, n) in segments {
            let range = offset..offset + n as usize;
            let result = if opcode == nvm::NvmOpcode::WRITE {
                self.dma.read(addr, &mut self.data[range])
            } else {
                self.dma.write(addr, &self.data[range])
            };
            if result.is_err() {
                return spec::Status::DATA_TRANSFER_ERROR;
            }
            offset += n as usize;
        }
        spec::Status::SUCCESS
    }

    fn prp_segments(&self, prp1: u64, prp2: u64, len: u64) -> Result<Vec<(u64, u64)>, spec::Status> {
        let first = (PAGE_SIZE64 - prp1 % PAGE_SIZE64).min(len);
        let mut segments = vec![(prp1, first)];
        let mut remaining = len - first;
        if remaining == 0 {
            return Ok(segments);
        }
        if remaining <= PAGE_SIZE64 {
            segments.push((prp2, remaining));
            return Ok(segments);
        }
        let mut list = prp2;
        loop {
            let entries = (PAGE_SIZE64 - list % PAGE_SIZE64) / 8;
            let mut next = None;
            for i in 0..entries {
                let entry = self
                    .dma
                    .read_obj::<u64>(list + i * 8)
                    .map_err(|_| spec::Status::DATA_TRANSFER_ERROR)?;
                if i == entries - 1 && remaining > PAGE_SIZE64 {
                    next = Some(entry);
                    break;
                }
                if entry % PAGE_SIZE64 != 0 {
                    return Err(spec::Status::PRP_OFFSET_INVALID);
                }
                let n = remaining.min(PAGE_SIZE64);
                segments.push((entry, n));
                remaining -= n;
                if remaining == 0 {
                    return Ok(segments);
                }
            }
            list = next.ok_or(spec::Status::DATA_TRANSFER_ERROR)?;
        }
    }

    fn sgl_segments(&self, first: spec::SglDescriptor) -> Result<Vec<(u64, u64)>, spec::Status> {
        let mut segments = Vec::new();
        let mut descriptor = first;
        loop {
            match descriptor.descriptor_type() {
                spec::SglDescriptorType::DATA_BLOCK => {
                    segments.push((descriptor.addr, descriptor.len as u64));
                    return Ok(segments);
                }
                ty @ (spec::SglDescriptorType::SEGMENT | spec::SglDescriptorType::LAST_SEGMENT) => {
                    let count = descriptor.len as u64 / 16;
                    let mut next = None;
                    for i in 0..count {
                        let d = self
                            .dma
                            .read_obj::<spec::SglDescriptor>(descriptor.addr + i * 16)
                            .map_err(|_| spec::Status::DATA_TRANSFER_ERROR)?;
                        match d.descriptor_type() {
                            spec::SglDescriptorType::DATA_BLOCK => {
                                segments.push((d.addr, d.len as u64))
                            }
                            spec::SglDescriptorType::SEGMENT
                            | spec::SglDescriptorType::LAST_SEGMENT
                                if i == count - 1 && ty == spec::SglDescriptorType::SEGMENT =>
                            {
                                next = Some(d)
                            }
                            _ => return Err(spec::Status::SGL_DESCRIPTOR_TYPE_INVALID),
                        }
                    }
                    match next {
                        Some(d) => descriptor = d,
                        None => return Ok(segments),
                    }
                }
                _ => return Err(spec::Status::SGL_DESCRIPTOR_TYPE_INVALID),
            }
        }
    }
}

impl MmioIntercept for NvmeEmulator {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) {
        if self.faults.gone {
            data.fill(0xff);
            return;
        }
        let offset = (addr & 0xffff_ffff) as u16;
        let value: u64 = match spec::Register(offset) {
            spec::Register::CAP => self.cap().into(),
            spec::Register::VS => 0x10400,
            spec::Register::CC => u32::from(self.cc) as u64,
            spec::Register::CSTS => u32::from(self.csts) as u64,
            spec::Register::AQA => u32::from(self.aqa) as u64,
            spec::Register::ASQ => self.asq,
            spec::Register::ACQ => self.acq,
            _ => 0,
        };
        let n = data.len().min(8);
        data[..n].copy_from_slice(&value.to_ne_bytes()[..n]);
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) {
        if self.faults.gone {
            return;
        }
        let offset = (addr & 0xffff_ffff) as usize;
        let mut bytes = [0; 8];
        bytes[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
        let value = u64::from_ne_bytes(bytes);
        if offset >= spec::DOORBELL_BASE {
            self.doorbell(((offset - spec::DOORBELL_BASE) / 4) as u16, value as u32);
            return;
        }
        match spec::Register(offset as u16) {
            spec::Register::CC => self.write_cc(spec::Cc::from(value as u32)),
            spec::Register::AQA => self.aqa = spec::Aqa::from(value as u32),
            spec::Register::ASQ => self.asq = value,
            spec::Register::ACQ => self.acq = value,
            spec::Register::NSSR if value as u32 == spec::NSSR_RESET_VALUE => {
                self.stats.subsystem_resets += 1;
                self.reset();
                self.cc = spec::Cc::new();
                self.csts.set_nssro(true);
            }
            spec::Register::CSTS => {
                // NSSRO is write-one-to-clear.
                if spec::Csts::from(value as u32).nssro() {
                    self.csts.set_nssro(false);
                }
            }
            _ => {}
        }
    }
}
