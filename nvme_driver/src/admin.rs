// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builders for the admin commands the driver issues.

use super::spec;
use zerocopy::FromZeros;

pub(crate) fn admin_cmd(opcode: spec::AdminOpcode) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        ..FromZeros::new_zeroed()
    }
}

pub(crate) fn identify_controller(buffer: u64) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10Identify::new()
            .with_cns(spec::Cns::CONTROLLER.0)
            .into(),
        dptr: [buffer, 0],
        ..admin_cmd(spec::AdminOpcode::IDENTIFY)
    }
}

pub(crate) fn identify_namespace(nsid: u32, buffer: u64) -> spec::Command {
    spec::Command {
        nsid,
        cdw10: spec::Cdw10Identify::new()
            .with_cns(spec::Cns::NAMESPACE.0)
            .into(),
        dptr: [buffer, 0],
        ..admin_cmd(spec::AdminOpcode::IDENTIFY)
    }
}

pub(crate) fn set_features(feature: spec::Feature, cdw11: u32) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10SetFeatures::new().with_fid(feature.0).into(),
        cdw11,
        ..admin_cmd(spec::AdminOpcode::SET_FEATURES)
    }
}

pub(crate) fn get_features(feature: spec::Feature) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10GetFeatures::new().with_fid(feature.0).into(),
        ..admin_cmd(spec::AdminOpcode::GET_FEATURES)
    }
}

/// Requests `count` submission and completion queues.
pub(crate) fn set_queue_count(count: u16) -> spec::Command {
    set_features(
        spec::Feature::NUMBER_OF_QUEUES,
        spec::Cdw11FeatureNumberOfQueues::new()
            .with_nsq_z(count - 1)
            .with_ncq_z(count - 1)
            .into(),
    )
}

/// Creates a physically contiguous completion queue. `vector` is ignored by
/// the controller when interrupts are disabled.
pub(crate) fn create_cq(qid: u16, depth: u16, addr: u64, vector: u16, ien: bool) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10CreateIoQueue::new()
            .with_qid(qid)
            .with_qsize_z(depth - 1)
            .into(),
        cdw11: spec::Cdw11CreateIoCompletionQueue::new()
            .with_pc(true)
            .with_ien(ien)
            .with_iv(if ien { vector } else { 0 })
            .into(),
        dptr: [addr, 0],
        ..admin_cmd(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE)
    }
}

/// Creates a physically contiguous submission queue bound to completion
/// queue `qid`.
pub(crate) fn create_sq(qid: u16, depth: u16, addr: u64) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10CreateIoQueue::new()
            .with_qid(qid)
            .with_qsize_z(depth - 1)
            .into(),
        cdw11: spec::Cdw11CreateIoSubmissionQueue::new()
            .with_pc(true)
            .with_cqid(qid)
            .into(),
        dptr: [addr, 0],
        ..admin_cmd(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE)
    }
}

pub(crate) fn delete_queue(opcode: spec::AdminOpcode, qid: u16) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into(),
        ..admin_cmd(opcode)
    }
}

pub(crate) fn abort(sqid: u16, cid: u16) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10Abort::new().with_sqid(sqid).with_cid(cid).into(),
        ..admin_cmd(spec::AdminOpcode::ABORT)
    }
}

/// Points the controller at the shadow doorbell and event index buffers.
pub(crate) fn doorbell_buffer_config(dbs: u64, eis: u64) -> spec::Command {
    spec::Command {
        dptr: [dbs, eis],
        ..admin_cmd(spec::AdminOpcode::DOORBELL_BUFFER_CONFIG)
    }
}

/// Enables or disables the host memory buffer described by the descriptor
/// list at `descs`.
pub(crate) fn set_host_mem(
    bits: spec::Cdw11FeatureHostMemoryBuffer,
    size_pages: u32,
    descs: u64,
    count: u32,
) -> spec::Command {
    spec::Command {
        cdw12: size_pages,
        cdw13: descs as u32,
        cdw14: (descs >> 32) as u32,
        cdw15: count,
        ..set_features(spec::Feature::HOST_MEMORY_BUFFER, bits.into())
    }
}

/// Reads `len` bytes of log page `lid` into `buffer`. `len` must be a
/// multiple of 4.
pub(crate) fn get_log_page(lid: spec::LogPageIdentifier, buffer: u64, len: usize) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10GetLogPage::new()
            .with_lid(lid.0)
            .with_numdl_z((len / 4 - 1) as u16)
            .into(),
        dptr: [buffer, 0],
        ..admin_cmd(spec::AdminOpcode::GET_LOG_PAGE)
    }
}
