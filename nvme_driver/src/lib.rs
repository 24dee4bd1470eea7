// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe driver core: submission and completion queues, DMA descriptor
//! construction, and controller recovery.

#![forbid(unsafe_code)]

mod admin;
mod config;
mod controller;
mod descriptor_pool;
mod descriptors;
mod dma;
mod doorbell;
mod error;
mod lifecycle;
mod namespace;
mod queue_pair;
mod queues;
mod ratelimit;
mod registers;
mod request;

pub use self::config::ControllerConfig;
pub use self::controller::AsyncEvent;
pub use self::controller::ControllerState;
pub use self::controller::NvmeController;
pub use self::controller::QueueCounts;
pub use self::descriptor_pool::PoolError;
pub use self::dma::DmaDirection;
pub use self::dma::HostSegment;
pub use self::dma::MapError;
pub use self::error::ErrorKind;
pub use self::error::NvmeError;
pub use self::error::RequestError;
pub use self::namespace::Namespace;
pub use self::namespace::NamespaceError;
pub use self::request::IoRequest;

use nvme_spec as spec;
