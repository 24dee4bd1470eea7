// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors returned to the block layer.

use super::spec;
use crate::descriptor_pool::PoolError;
use crate::dma::MapError;
use thiserror::Error;

/// The class of a request failure, which determines how the caller should
/// treat it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Descriptor pool or DMA mapping capacity ran out. The request can be
    /// retried immediately.
    ResourceExhausted,
    /// The request could not be described to the device. Not retryable.
    Malformed,
    /// The command did not complete in time and recovery gave up on it.
    Timeout,
    /// The controller or namespace is dead or was removed.
    Fatal,
    /// The controller does not support the operation.
    Unsupported,
}

/// An error issuing an NVMe request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("descriptor pool exhausted")]
    Pool(#[source] PoolError),
    #[error("dma mapping failed")]
    Map(#[source] MapError),
    #[error("no submission slot available")]
    QueueFull,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("command timed out")]
    Timeout,
    #[error("controller is dead")]
    ControllerDead,
    #[error("namespace is dead")]
    NamespaceDead,
    #[error("queue pair is gone")]
    Gone,
    #[error("no io queues are available")]
    NoIoQueues,
    #[error("operation not supported by the controller")]
    Unsupported,
    #[error("nvme error")]
    Nvme(#[source] NvmeError),
}

impl RequestError {
    /// Returns the error class, or `None` for a status reported by the
    /// device.
    pub fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            RequestError::Pool(_) | RequestError::Map(_) | RequestError::QueueFull => {
                ErrorKind::ResourceExhausted
            }
            RequestError::Malformed(_) => ErrorKind::Malformed,
            RequestError::Timeout => ErrorKind::Timeout,
            RequestError::ControllerDead
            | RequestError::NamespaceDead
            | RequestError::Gone
            | RequestError::NoIoQueues => ErrorKind::Fatal,
            RequestError::Unsupported => ErrorKind::Unsupported,
            RequestError::Nvme(_) => return None,
        };
        Some(kind)
    }

    /// Returns true if the request may be resubmitted unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == Some(ErrorKind::ResourceExhausted)
    }

    /// Returns the NVMe status, if the device failed the command.
    pub fn nvme_status(&self) -> Option<spec::Status> {
        match self {
            RequestError::Nvme(err) => Some(err.status()),
            _ => None,
        }
    }
}

impl From<PoolError> for RequestError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<MapError> for RequestError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

/// A status reported by the controller, or synthesized by the driver when it
/// cancels a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError {
    status: spec::Status,
    dnr: bool,
}

impl NvmeError {
    pub(crate) fn new(status: spec::Status, dnr: bool) -> Self {
        Self { status, dnr }
    }

    pub fn status(&self) -> spec::Status {
        self.status
    }

    /// The controller (or driver) asked for the command not to be retried.
    pub fn dnr(&self) -> bool {
        self.dnr
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self::new(value, false)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status;
        match status.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {status:#x?}"),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {status:#x?}")
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {status:#x?}")
            }
            spec::StatusCodeType::PATH_RELATED => {
                write!(f, "path error {status:#x?}")
            }
            _ => write!(f, "{status:#x?}"),
        }
    }
}

/// Converts a completion into a result.
pub(crate) fn completion_result(
    completion: spec::Completion,
) -> Result<spec::Completion, RequestError> {
    match spec::Status(completion.status.status()) {
        spec::Status::SUCCESS => Ok(completion),
        status => Err(RequestError::Nvme(NvmeError::new(
            status,
            completion.status.dnr(),
        ))),
    }
}
