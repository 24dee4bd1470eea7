// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA mapping of request buffers.
//!
//! A request describes its memory as host segments. Before building
//! descriptors the driver maps each segment to a device address. Without an
//! IOMMU that is the identity; with one, each segment gets an I/O virtual
//! address range that must be unmapped exactly once when the request is torn
//! down. An IOMMU can also present page-aligned segments as one contiguous
//! range, which lets the descriptor builder describe the whole transfer with a
//! single entry.

use std::sync::Arc;
use thiserror::Error;
use user_driver::memory::PAGE_SIZE64;
use user_driver::IommuDomain;
use user_driver::IommuError;

/// A physically contiguous range of host memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostSegment {
    pub addr: u64,
    pub len: u32,
}

impl HostSegment {
    pub fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }

    fn end(&self) -> u64 {
        self.addr + self.len as u64
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads the memory.
    ToDevice,
    /// The device writes the memory.
    FromDevice,
}

#[derive(Debug, Error)]
#[error("failed to map {len:#x} bytes at {addr:#x} for dma")]
pub struct MapError {
    addr: u64,
    len: u64,
    #[source]
    source: IommuError,
}

/// A mapped, device-visible range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct DeviceSegment {
    pub addr: u64,
    pub len: u32,
    /// The page aligned IOVA range backing this segment, if it must be
    /// unmapped.
    iova: Option<(u64, usize)>,
}

pub(crate) trait DmaMapper: Send + Sync {
    /// Returns true if mapped segments must be passed to [`Self::unmap`].
    fn needs_unmap(&self) -> bool;

    /// Maps one host segment.
    fn map_segment(
        &self,
        segment: HostSegment,
        direction: DmaDirection,
    ) -> Result<DeviceSegment, MapError>;

    /// Maps all of `segments` as a single device-contiguous range, if the
    /// platform can.
    fn map_coalesced(
        &self,
        segments: &[HostSegment],
        direction: DmaDirection,
    ) -> Result<Option<DeviceSegment>, MapError>;

    fn unmap(&self, segment: &DeviceSegment);

    /// Maps the only segment of a single-segment request.
    fn map_single(
        &self,
        segment: HostSegment,
        direction: DmaDirection,
    ) -> Result<DeviceSegment, MapError> {
        self.map_segment(segment, direction)
    }
}

/// Devices without an IOMMU use host addresses directly.
pub(crate) struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    fn needs_unmap(&self) -> bool {
        false
    }

    fn map_segment(
        &self,
        segment: HostSegment,
        _direction: DmaDirection,
    ) -> Result<DeviceSegment, MapError> {
        Ok(DeviceSegment {
            addr: segment.addr,
            len: segment.len,
            iova: None,
        })
    }

    fn map_coalesced(
        &self,
        _segments: &[HostSegment],
        _direction: DmaDirection,
    ) -> Result<Option<DeviceSegment>, MapError> {
        Ok(None)
    }

    fn unmap(&self, _segment: &DeviceSegment) {}
}

pub(crate) struct IommuMapper {
    domain: Arc<dyn IommuDomain>,
}

impl IommuMapper {
    pub fn new(domain: Arc<dyn IommuDomain>) -> Self {
        Self { domain }
    }

    fn map_pages(&self, pfns: &[u64], addr: u64, len: u64) -> Result<u64, MapError> {
        self.domain.map(pfns).map_err(|source| MapError { addr, len, source })
    }
}

fn pfns_of(segment: &HostSegment) -> impl Iterator<Item = u64> {
    let first = segment.addr / PAGE_SIZE64;
    let last = (segment.end() - 1) / PAGE_SIZE64;
    first..=last
}

impl DmaMapper for IommuMapper {
    fn needs_unmap(&self) -> bool {
        true
    }

    fn map_segment(
        &self,
        segment: HostSegment,
        _direction: DmaDirection,
    ) -> Result<DeviceSegment, MapError> {
        let pfns: Vec<u64> = pfns_of(&segment).collect();
        let iova = self.map_pages(&pfns, segment.addr, segment.len.into())?;
        Ok(DeviceSegment {
            addr: iova + segment.addr % PAGE_SIZE64,
            len: segment.len,
            iova: Some((iova, pfns.len())),
        })
    }

    fn map_coalesced(
        &self,
        segments: &[HostSegment],
        _direction: DmaDirection,
    ) -> Result<Option<DeviceSegment>, MapError> {
        let Some((first, rest)) = segments.split_first() else {
            return Ok(None);
        };
        if rest.is_empty() {
            return Ok(None);
        }
        // Only inner page boundaries can be stitched together.
        let n = segments.len();
        let aligned = segments.iter().enumerate().all(|(i, s)| {
            (i == 0 || s.addr % PAGE_SIZE64 == 0) && (i == n - 1 || s.end() % PAGE_SIZE64 == 0)
        });
        if !aligned {
            return Ok(None);
        }
        let pfns: Vec<u64> = segments.iter().flat_map(pfns_of).collect();
        let len: u64 = segments.iter().map(|s| s.len as u64).sum();
        let Ok(len32) = u32::try_from(len) else {
            return Ok(None);
        };
        let iova = self.map_pages(&pfns, first.addr, len)?;
        Ok(Some(DeviceSegment {
            addr: iova + first.addr % PAGE_SIZE64,
            len: len32,
            iova: Some((iova, pfns.len())),
        }))
    }

    fn unmap(&self, segment: &DeviceSegment) {
        if let Some((iova, pages)) = segment.iova {
            self.domain.unmap(iova, pages);
        }
    }
}

/// The mapped segments of a request, unmapped when dropped.
pub(crate) struct DmaMapping {
    mapper: Arc<dyn DmaMapper>,
    segments: Vec<DeviceSegment>,
}

impl DmaMapping {
    pub fn new(mapper: Arc<dyn DmaMapper>) -> Self {
        Self {
            mapper,
            segments: Vec::new(),
        }
    }

    /// Takes ownership of `segment` if it needs to be unmapped.
    pub fn push(&mut self, segment: DeviceSegment) {
        if segment.iova.is_some() {
            self.segments.push(segment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            self.mapper.unmap(&segment);
        }
    }
}

/// Maps a request's segments one at a time, keeping a running total of the
/// mapped bytes.
pub(crate) struct DmaIter<'a> {
    segments: &'a [HostSegment],
    direction: DmaDirection,
    next: usize,
    coalesced: Option<DeviceSegment>,
    is_coalesced: bool,
    total_len: u64,
    mapping: DmaMapping,
}

impl<'a> DmaIter<'a> {
    /// Starts mapping `segments`, coalescing them if the mapper can.
    pub fn start(
        mapper: &Arc<dyn DmaMapper>,
        segments: &'a [HostSegment],
        direction: DmaDirection,
    ) -> Result<Self, MapError> {
        let coalesced = if segments.len() > 1 {
            mapper.map_coalesced(segments, direction)?
        } else {
            None
        };
        Ok(Self {
            segments,
            direction,
            next: 0,
            is_coalesced: coalesced.is_some(),
            coalesced,
            total_len: 0,
            mapping: DmaMapping::new(mapper.clone()),
        })
    }

    /// Returns true if the whole request was mapped as one segment.
    pub fn is_coalesced(&self) -> bool {
        self.is_coalesced
    }

    /// The number of device segments the request maps to.
    pub fn segment_count(&self) -> usize {
        if self.is_coalesced {
            1
        } else {
            self.segments.len()
        }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Maps the next segment. Returns `Ok(None)` when all segments have been
    /// produced.
    pub fn next(&mut self) -> Result<Option<DeviceSegment>, MapError> {
        let segment = if let Some(segment) = self.coalesced.take() {
            self.next = self.segments.len();
            segment
        } else if self.is_coalesced {
            return Ok(None);
        } else {
            let Some(&host) = self.segments.get(self.next) else {
                return Ok(None);
            };
            self.next += 1;
            self.mapping.mapper.map_segment(host, self.direction)?
        };
        self.total_len += segment.len as u64;
        self.mapping.push(segment);
        Ok(Some(segment))
    }

    /// Ends iteration, returning ownership of the mapped segments.
    pub fn finish(self) -> DmaMapping {
        self.mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::emulated::EmulatedIommu;
    use user_driver::emulated::IOVA_BASE;

    fn iommu(entries: usize) -> (Arc<EmulatedIommu>, Arc<dyn DmaMapper>) {
        let domain = Arc::new(EmulatedIommu::new(entries));
        let mapper: Arc<dyn DmaMapper> = Arc::new(IommuMapper::new(domain.clone()));
        (domain, mapper)
    }

    #[test]
    fn identity_passes_through() {
        let mapper: Arc<dyn DmaMapper> = Arc::new(IdentityMapper);
        let segs = [HostSegment::new(0x1000, 0x1000), HostSegment::new(0x5000, 0x200)];
        let mut iter = DmaIter::start(&mapper, &segs, DmaDirection::ToDevice).unwrap();
        assert!(!iter.is_coalesced());
        assert_eq!(iter.next().unwrap().unwrap().addr, 0x1000);
        assert_eq!(iter.next().unwrap().unwrap().addr, 0x5000);
        assert!(iter.next().unwrap().is_none());
        assert_eq!(iter.total_len(), 0x1200);
        assert!(iter.finish().is_empty());
    }

    #[test]
    fn iommu_keeps_page_offset() {
        let (domain, mapper) = iommu(8);
        let seg = mapper
            .map_single(HostSegment::new(0x3010, 0x1000), DmaDirection::FromDevice)
            .unwrap();
        assert_eq!(seg.addr, IOVA_BASE + 0x10);
        assert_eq!(domain.mapped_pages(), 2);
        mapper.unmap(&seg);
        assert_eq!(domain.mapped_pages(), 0);
    }

    #[test]
    fn iommu_coalesces_aligned_segments() {
        let (domain, mapper) = iommu(8);
        let segs = [
            HostSegment::new(0x7800, 0x800),
            HostSegment::new(0x2000, 0x1000),
            HostSegment::new(0x9000, 0x100),
        ];
        let mut iter = DmaIter::start(&mapper, &segs, DmaDirection::ToDevice).unwrap();
        assert!(iter.is_coalesced());
        assert_eq!(iter.segment_count(), 1);
        let seg = iter.next().unwrap().unwrap();
        assert_eq!(seg.addr, IOVA_BASE + 0x800);
        assert_eq!(seg.len, 0x1900);
        assert!(iter.next().unwrap().is_none());
        assert_eq!(domain.translate(IOVA_BASE + 0x1000), Some(0x2000));
        assert_eq!(domain.translate(IOVA_BASE + 0x2010), Some(0x9010));
        drop(iter.finish());
        assert_eq!(domain.mapped_pages(), 0);
        assert_eq!(domain.double_unmaps(), 0);
    }

    #[test]
    fn misaligned_segments_map_separately() {
        let (domain, mapper) = iommu(8);
        let segs = [HostSegment::new(0x1000, 0x800), HostSegment::new(0x4000, 0x800)];
        let mut iter = DmaIter::start(&mapper, &segs, DmaDirection::ToDevice).unwrap();
        assert!(!iter.is_coalesced());
        while iter.next().unwrap().is_some() {}
        let mapping = iter.finish();
        assert_eq!(domain.mapped_pages(), 2);
        drop(mapping);
        assert_eq!(domain.mapped_pages(), 0);
    }

    #[test]
    fn exhaustion_unmaps_partial_progress() {
        let (domain, mapper) = iommu(2);
        let segs = [
            HostSegment::new(0x1000, 0x800),
            HostSegment::new(0x4000, 0x800),
            HostSegment::new(0x8000, 0x800),
        ];
        let mut iter = DmaIter::start(&mapper, &segs, DmaDirection::ToDevice).unwrap();
        iter.next().unwrap().unwrap();
        iter.next().unwrap().unwrap();
        assert!(iter.next().is_err());
        drop(iter);
        assert_eq!(domain.mapped_pages(), 0);
        assert_eq!(domain.double_unmaps(), 0);
    }
}
