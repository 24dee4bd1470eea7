// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVM command set definitions
//!
//! NVM Command Set 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-NVM-Command-Set-Specification-1.0c-2022.10.03-Ratified.pdf>

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The identify namespace structure. Fields this driver does not consume are
/// folded into reserved ranges.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: Nsfeat,
    /// Number of LBA formats. Zero based.
    pub nlbaf: u8,
    pub flbas: Flbas,
    /// Metadata capabilities.
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub rsvd1: [u8; 98],
    pub lbaf: [Lbaf; 16],
    pub rsvd2: [u8; 3904],
}

const _: () = assert!(size_of::<IdentifyNamespace>() == 4096);

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Nsfeat {
    /// Thin provisioning
    pub thinp: bool,
    pub nsabp: bool,
    pub dae: bool,
    pub uidreuse: bool,
    pub optperf: bool,
    #[bits(3)]
    _rsvd: u8,
}

/// LBA format
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Lbaf {
    /// Metadata size
    pub ms: u16,
    /// LBA data size (as power of two)
    pub lbads: u8,
    /// Relative performance
    #[bits(2)]
    pub rp: u8,
    #[bits(6)]
    _rsvd: u8,
}

/// Formatted LBA size
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Flbas {
    #[bits(4)]
    pub low_index: u8,
    /// Metadata is transferred at the end of each block rather than through
    /// a separate buffer.
    pub inband_metadata: bool,
    #[bits(2)]
    pub high_index: u8,
    #[bits(1)]
    _rsvd: u8,
}

open_enum! {
    pub enum NvmOpcode: u8 {
        FLUSH = 0x00,
        WRITE = 0x01,
        READ = 0x02,
        /// Dataset management.
        DSM = 0x09,
    }
}

#[bitfield(u32)]
pub struct Cdw10ReadWrite {
    /// Starting LBA, low 32 bits.
    pub sbla_low: u32,
}

#[bitfield(u32)]
pub struct Cdw11ReadWrite {
    /// Starting LBA, high 32 bits.
    pub sbla_high: u32,
}

#[bitfield(u32)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks. Zero-based.
    pub nlb_z: u16,
    #[bits(4)]
    _rsvd: u8,
    /// Directive type (write only).
    #[bits(4)]
    pub dtype: u8,
    /// Storage tag check.
    pub stc: bool,
    _rsvd2: bool,
    /// Protection information
    #[bits(4)]
    pub prinfo: u8,
    /// Force unit access
    pub fua: bool,
    /// Limited retry
    pub lr: bool,
}

#[bitfield(u32)]
pub struct Cdw10Dsm {
    /// Number of ranges. Zero-based.
    pub nr_z: u8,
    #[bits(24)]
    _rsvd: u32,
}

#[bitfield(u32)]
pub struct Cdw11Dsm {
    /// Integral dataset for read.
    pub idr: bool,
    /// Integral dataset for write.
    pub idw: bool,
    /// Deallocate.
    pub ad: bool,
    #[bits(29)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DsmRange {
    pub context_attributes: u32,
    pub lba_count: u32,
    pub starting_lba: u64,
}
