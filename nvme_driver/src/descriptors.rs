// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builds the data and metadata pointers of a command.
//!
//! Data is described either with PRPs (a first page fragment in PRP1, and in
//! PRP2 either the second page or a chain of page lists) or with SGLs (one
//! inline data descriptor, or a last segment descriptor pointing at a list of
//! data descriptors). Every page list or descriptor list comes from the
//! descriptor pools and is owned by the request's [`RequestResources`].

use super::spec;
use crate::descriptor_pool::Descriptor;
use crate::descriptor_pool::NodePools;
use crate::descriptor_pool::SMALL_POOL_SIZE;
use crate::dma::DeviceSegment;
use crate::dma::DmaIter;
use crate::dma::DmaMapper;
use crate::dma::DmaMapping;
use crate::error::RequestError;
use crate::ratelimit::error_ratelimited;
use crate::request::IoRequest;
use crate::request::RequestResources;
use crate::request::MAX_DESCRIPTORS;
use std::sync::Arc;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;

const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;
const SGL_DESCRIPTOR_SIZE: usize = size_of::<spec::SglDescriptor>();

/// Whether a command's data may or must be described with SGLs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SglUse {
    Unsupported,
    Supported,
    Forced,
}

/// What the descriptor builder needs to know about the target queue and
/// controller.
pub(crate) struct MapContext<'a> {
    pub qid: u16,
    pub pools: &'a NodePools,
    pub mapper: &'a Arc<dyn DmaMapper>,
    pub sgls: spec::Sgls,
    pub sgl_threshold: u32,
}

impl MapContext<'_> {
    fn metadata_sgl_supported(&self) -> bool {
        self.sgls.supported() && self.sgls.metadata_sgl()
    }
}

/// Fills in the data and metadata pointers of `req`'s command, returning the
/// command and the resources it owns.
pub(crate) fn prepare(
    ctx: &MapContext<'_>,
    req: &IoRequest,
) -> Result<(spec::Command, RequestResources), RequestError> {
    let mut command = req.command;
    command.cdw0.set_psdt(spec::Psdt::PRP.0);
    command.dptr = [0; 2];
    command.mptr = 0;
    let mut res = RequestResources::default();
    if !req.data.is_empty() {
        map_data(ctx, req, &mut command, &mut res)?;
    }
    if !req.integrity.is_empty() {
        map_metadata(ctx, req, &mut command, &mut res)?;
    }
    Ok((command, res))
}

pub(crate) fn use_sgls(ctx: &MapContext<'_>, req: &IoRequest) -> SglUse {
    if ctx.qid != 0 && ctx.sgls.supported() {
        if req.user_command || req.integrity.len() > 1 {
            return SglUse::Forced;
        }
        return SglUse::Supported;
    }
    SglUse::Unsupported
}

pub(crate) fn map_data(
    ctx: &MapContext<'_>,
    req: &IoRequest,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<(), RequestError> {
    let use_sgl = use_sgls(ctx, req);
    if req.data.len() == 1 {
        match setup_data_simple(ctx, req, use_sgl, command, res)? {
            Simple::Done => return Ok(()),
            Simple::Again => {}
        }
    }

    let mut iter = DmaIter::start(ctx.mapper, &req.data, req.direction)?;
    let sgl = match use_sgl {
        SglUse::Forced => true,
        SglUse::Supported => {
            let nseg = iter.segment_count() as u64;
            let average = req.payload_len().div_ceil(nseg);
            ctx.sgl_threshold != 0 && average >= ctx.sgl_threshold as u64
        }
        SglUse::Unsupported => false,
    };
    if sgl {
        setup_data_sgl(ctx, &mut iter, command, res)?;
    } else {
        setup_data_prp(ctx, req.payload_len(), &mut iter, command, res)?;
    }
    res.total_len = iter.total_len();
    res.data_mapping = Some(iter.finish());
    Ok(())
}

pub(crate) enum Simple {
    Done,
    /// The fast path does not apply; use the general path.
    Again,
}

/// Maps a single segment request without touching the descriptor pools.
pub(crate) fn setup_data_simple(
    ctx: &MapContext<'_>,
    req: &IoRequest,
    use_sgl: SglUse,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<Simple, RequestError> {
    let &[segment] = req.data.as_slice() else {
        return Ok(Simple::Again);
    };
    let offset = segment.addr % PAGE_SIZE64;
    let prp_possible = offset + segment.len as u64 <= PAGE_SIZE64 * 2;
    if use_sgl == SglUse::Unsupported && !prp_possible {
        return Ok(Simple::Again);
    }

    let mapped = ctx.mapper.map_single(segment, req.direction)?;
    let mut mapping = DmaMapping::new(ctx.mapper.clone());
    mapping.push(mapped);
    res.data_mapping = Some(mapping);
    res.total_len = segment.len.into();
    res.flags.single_segment = true;

    if use_sgl == SglUse::Forced || !prp_possible {
        command.cdw0.set_psdt(spec::Psdt::SGL_METABUF.0);
        command.set_sgl(spec::SglDescriptor::data_block(mapped.addr, mapped.len));
    } else {
        let first_prp_len = PAGE_SIZE64 - offset;
        command.dptr[0] = mapped.addr;
        command.dptr[1] = if segment.len as u64 > first_prp_len {
            mapped.addr + first_prp_len
        } else {
            0
        };
    }
    Ok(Simple::Done)
}

fn malformed(payload: u64, entries: usize) -> RequestError {
    error_ratelimited!(payload, entries, "incorrectly formed request");
    RequestError::Malformed("segments do not cover the payload")
}

/// Describes the data with PRPs.
pub(crate) fn setup_data_prp(
    ctx: &MapContext<'_>,
    payload: u64,
    iter: &mut DmaIter<'_>,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<(), RequestError> {
    let entries = iter.segment_count();
    let page = PAGE_SIZE64 as i64;
    let mut length = payload as i64;
    let Some(first) = iter.next()? else {
        return Err(malformed(payload, entries));
    };
    let (mut addr, mut dma_len) = (first.addr, first.len as i64);
    let prp1 = addr;

    let fragment = page - (addr % PAGE_SIZE64) as i64;
    length -= fragment;
    if length <= 0 {
        command.dptr = [prp1, 0];
        return Ok(());
    }
    dma_len -= fragment;
    if dma_len > 0 {
        addr += fragment as u64;
    } else {
        if dma_len < 0 {
            return Err(malformed(payload, entries));
        }
        (addr, dma_len) = next_prp_segment(iter, payload, entries)?;
    }

    if length <= page {
        command.dptr = [prp1, addr];
        return Ok(());
    }

    let nprps = (length as u64).div_ceil(PAGE_SIZE64) as usize;
    let pool = ctx.pools.for_size(nprps * 8);
    res.flags.small_descriptor = pool.slot_size() == SMALL_POOL_SIZE;
    let mut list = pool.alloc()?;
    let prp2 = list.addr();
    let mut i = 0;
    loop {
        if i == PRP_ENTRIES_PER_PAGE {
            // The last slot of a full list becomes the pointer to the next
            // list, and the entry it held moves to the head of that list.
            if res.descriptors.len() + 1 >= MAX_DESCRIPTORS {
                return Err(RequestError::Malformed("too many prp lists"));
            }
            let next = ctx.pools.large.alloc()?;
            next.write_u64(0, list.read_u64(i - 1));
            list.write_u64(i - 1, next.addr());
            res.descriptors.push(std::mem::replace(&mut list, next));
            i = 1;
        }
        list.write_u64(i, addr);
        i += 1;
        length -= page;
        if length <= 0 {
            break;
        }
        dma_len -= page;
        if dma_len > 0 {
            addr += PAGE_SIZE64;
            continue;
        }
        if dma_len < 0 {
            return Err(malformed(payload, entries));
        }
        (addr, dma_len) = next_prp_segment(iter, payload, entries)?;
    }
    res.descriptors.push(list);
    command.dptr = [prp1, prp2];
    Ok(())
}

/// Moves to the next mapped segment of a PRP transfer. Every segment after
/// the first must start on a page boundary.
fn next_prp_segment(
    iter: &mut DmaIter<'_>,
    payload: u64,
    entries: usize,
) -> Result<(u64, i64), RequestError> {
    match iter.next()? {
        Some(DeviceSegment { addr, len, .. }) if addr % PAGE_SIZE64 == 0 => Ok((addr, len as i64)),
        _ => Err(malformed(payload, entries)),
    }
}

/// Describes the data with SGLs.
pub(crate) fn setup_data_sgl(
    ctx: &MapContext<'_>,
    iter: &mut DmaIter<'_>,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<(), RequestError> {
    let entries = iter.segment_count();
    command.cdw0.set_psdt(spec::Psdt::SGL_METABUF.0);
    if entries == 1 || iter.is_coalesced() {
        let Some(segment) = iter.next()? else {
            return Err(malformed(0, entries));
        };
        command.set_sgl(spec::SglDescriptor::data_block(segment.addr, segment.len));
        return Ok(());
    }

    let pool = ctx.pools.for_size(entries * SGL_DESCRIPTOR_SIZE);
    res.flags.small_descriptor = pool.slot_size() == SMALL_POOL_SIZE;
    let capacity = pool.slot_size() / SGL_DESCRIPTOR_SIZE;
    let list = pool.alloc()?;
    let mut mapped = 0;
    while let Some(segment) = iter.next()? {
        if mapped == entries || mapped == capacity {
            return Err(malformed(iter.total_len(), entries));
        }
        list.write_sgl(
            mapped,
            &spec::SglDescriptor::data_block(segment.addr, segment.len),
        );
        mapped += 1;
    }
    command.set_sgl(spec::SglDescriptor::last_segment(list.addr(), mapped as u32));
    res.descriptors.push(list);
    Ok(())
}

/// Maps the integrity buffer, either as a metadata SGL or directly through
/// MPTR.
pub(crate) fn map_metadata(
    ctx: &MapContext<'_>,
    req: &IoRequest,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<(), RequestError> {
    let data_sgl = command.cdw0.psdt() == spec::Psdt::SGL_METABUF.0;
    if data_sgl
        && ctx.metadata_sgl_supported()
        && (req.integrity.len() > 1 || req.user_command)
    {
        return setup_meta_sgls(ctx, req, command, res);
    }
    let &[segment] = req.integrity.as_slice() else {
        return Err(RequestError::Malformed(
            "multiple integrity segments require metadata sgls",
        ));
    };
    let mapped = ctx.mapper.map_single(segment, req.direction)?;
    let mut mapping = DmaMapping::new(ctx.mapper.clone());
    mapping.push(mapped);
    res.meta_mapping = Some(mapping);
    command.mptr = mapped.addr;
    Ok(())
}

fn setup_meta_sgls(
    ctx: &MapContext<'_>,
    req: &IoRequest,
    command: &mut spec::Command,
    res: &mut RequestResources,
) -> Result<(), RequestError> {
    let list: Descriptor = ctx.pools.small.alloc()?;
    let mut mapping = DmaMapping::new(ctx.mapper.clone());
    let mut mapped = Vec::with_capacity(req.integrity.len());
    for &segment in &req.integrity {
        let m = ctx.mapper.map_segment(segment, req.direction)?;
        mapping.push(m);
        mapped.push(m);
    }

    command.cdw0.set_psdt(spec::Psdt::SGL_METASEG.0);
    command.mptr = list.addr();
    if let [m] = mapped.as_slice() {
        list.write_sgl(0, &spec::SglDescriptor::data_block(m.addr, m.len));
    } else {
        list.write_sgl(
            0,
            &spec::SglDescriptor::last_segment(
                list.addr() + SGL_DESCRIPTOR_SIZE as u64,
                mapped.len() as u32,
            ),
        );
        for (i, m) in mapped.iter().enumerate() {
            list.write_sgl(i + 1, &spec::SglDescriptor::data_block(m.addr, m.len));
        }
    }
    res.meta_descriptor = Some(list);
    res.meta_mapping = Some(mapping);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor_pool::tests::test_allocator;
    use crate::descriptor_pool::DescriptorPools;
    use crate::dma::DmaDirection;
    use crate::dma::IdentityMapper;
    use crate::dma::HostSegment;
    use crate::dma::IommuMapper;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use user_driver::emulated::DeviceSharedMemory;
    use user_driver::emulated::EmulatedIommu;
    use user_driver::HostDmaAllocator;
    use zerocopy::FromZeros;

    /// A host address far away from the pools, which never need to back the
    /// data pages themselves.
    const DATA_BASE: u64 = 0x10_0000_0000;

    struct Fixture {
        pools: Arc<NodePools>,
        mapper: Arc<dyn DmaMapper>,
        _allocator: Arc<dyn HostDmaAllocator>,
        _mem: DeviceSharedMemory,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_mapper(Arc::new(IdentityMapper))
        }

        fn with_mapper(mapper: Arc<dyn DmaMapper>) -> Self {
            let (allocator, mem) = test_allocator(256);
            let pools = DescriptorPools::new(allocator.clone()).for_node(0);
            Self {
                pools,
                mapper,
                _allocator: allocator,
                _mem: mem,
            }
        }

        fn ctx(&self, sgls: spec::Sgls) -> MapContext<'_> {
            MapContext {
                qid: 1,
                pools: &self.pools,
                mapper: &self.mapper,
                sgls,
                sgl_threshold: 32 * 1024,
            }
        }
    }

    fn sgl_support() -> spec::Sgls {
        spec::Sgls::new().with_support(1).with_metadata_sgl(true)
    }

    fn read(segments: Vec<HostSegment>) -> IoRequest {
        IoRequest::new(spec::Command::new_zeroed()).with_data(DmaDirection::FromDevice, segments)
    }

    /// Splits `len` bytes at `offset` into page-aligned segments of up to
    /// `pages` pages each.
    fn split(offset: u64, len: u64, pages: u64) -> Vec<HostSegment> {
        let mut segments = Vec::new();
        let mut addr = DATA_BASE + offset;
        let end = addr + len;
        while addr < end {
            let limit = (addr / PAGE_SIZE64 + pages) * PAGE_SIZE64;
            let next = limit.min(end);
            segments.push(HostSegment::new(addr, (next - addr) as u32));
            addr = next;
        }
        segments
    }

    /// Walks a PRP chain the way a controller would, returning the page
    /// addresses and the number of bytes described.
    fn walk_prps(command: &spec::Command, res: &RequestResources, len: u64) -> (Vec<u64>, u64) {
        let lists: HashMap<u64, &Descriptor> =
            res.descriptors.iter().map(|d| (d.addr(), d)).collect();
        let [prp1, prp2] = command.dptr;
        let first = (PAGE_SIZE64 - prp1 % PAGE_SIZE64).min(len);
        let mut pages = vec![prp1 & !(PAGE_SIZE64 - 1)];
        let mut remaining = len - first;
        if remaining == 0 {
            assert_eq!(prp2, 0);
            return (pages, first);
        }
        if remaining <= PAGE_SIZE64 {
            pages.push(prp2);
            return (pages, len);
        }
        let mut list = lists[&prp2];
        let mut i = 0;
        while remaining > 0 {
            if i == PRP_ENTRIES_PER_PAGE - 1 && remaining > PAGE_SIZE64 {
                list = lists[&list.read_u64(i)];
                i = 0;
            }
            pages.push(list.read_u64(i));
            i += 1;
            remaining = remaining.saturating_sub(PAGE_SIZE64);
        }
        (pages, len)
    }

    fn expected_pages(offset: u64, len: u64) -> Vec<u64> {
        let first = (DATA_BASE + offset) / PAGE_SIZE64;
        let last = (DATA_BASE + offset + len - 1) / PAGE_SIZE64;
        (first..=last).map(|p| p * PAGE_SIZE64).collect()
    }

    #[test]
    fn simple_prp2_is_second_page() {
        let f = Fixture::new();
        let req = read(vec![HostSegment::new(DATA_BASE + 0x200, 0x1000)]);
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert!(res.flags.single_segment);
        assert!(res.descriptors.is_empty());
        assert_eq!(command.dptr, [DATA_BASE + 0x200, DATA_BASE + 0x1000]);

        let req = read(vec![HostSegment::new(DATA_BASE + 0x200, 0xe00)]);
        let (command, _res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert_eq!(command.dptr, [DATA_BASE + 0x200, 0]);
    }

    #[test]
    fn simple_uses_inline_sgl_when_prp_does_not_fit() {
        let f = Fixture::new();
        let req = read(vec![HostSegment::new(DATA_BASE + 0x200, 0x2000)]);
        let (command, res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert!(res.flags.single_segment);
        assert_eq!(command.cdw0.psdt(), spec::Psdt::SGL_METABUF.0);
        assert_eq!(
            command.sgl(),
            spec::SglDescriptor::data_block(DATA_BASE + 0x200, 0x2000)
        );
    }

    #[test]
    fn prp2_direct_when_remainder_fits_one_page() {
        let f = Fixture::new();
        let req = read(split(0x800, 0x1800, 1));
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert!(!res.flags.single_segment);
        assert!(res.descriptors.is_empty());
        assert_eq!(command.dptr, [DATA_BASE + 0x800, DATA_BASE + 0x1000]);
        assert_eq!(res.total_len, 0x1800);
    }

    #[test]
    fn prp_list_from_small_pool() {
        let f = Fixture::new();
        let req = read(split(0, 8 * PAGE_SIZE64, 2));
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert!(res.flags.small_descriptor);
        assert_eq!(res.descriptors.len(), 1);
        assert!(res.descriptors[0].is_small());
        assert_eq!(command.dptr[1], res.descriptors[0].addr());
        let (pages, len) = walk_prps(&command, &res, 8 * PAGE_SIZE64);
        assert_eq!(pages, expected_pages(0, 8 * PAGE_SIZE64));
        assert_eq!(len, 8 * PAGE_SIZE64);
    }

    #[test]
    fn full_prp_list_does_not_chain() {
        let f = Fixture::new();
        // One page fragment in PRP1 plus exactly one full list.
        let len = (PRP_ENTRIES_PER_PAGE as u64 + 1) * PAGE_SIZE64;
        let req = read(split(0, len, 64));
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert_eq!(res.descriptors.len(), 1);
        let list = &res.descriptors[0];
        assert_eq!(
            list.read_u64(PRP_ENTRIES_PER_PAGE - 1),
            DATA_BASE + PRP_ENTRIES_PER_PAGE as u64 * PAGE_SIZE64
        );
        let (pages, _) = walk_prps(&command, &res, len);
        assert_eq!(pages, expected_pages(0, len));
    }

    #[test]
    fn prp_list_rolls_over() {
        let f = Fixture::new();
        let len = (PRP_ENTRIES_PER_PAGE as u64 + 2) * PAGE_SIZE64;
        let req = read(split(0, len, 64));
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert_eq!(res.descriptors.len(), 2);
        let (first, second) = (&res.descriptors[0], &res.descriptors[1]);
        assert_eq!(command.dptr[1], first.addr());
        assert_eq!(first.read_u64(PRP_ENTRIES_PER_PAGE - 1), second.addr());
        // The entry displaced by the chain pointer heads the next list.
        assert_eq!(
            second.read_u64(0),
            DATA_BASE + PRP_ENTRIES_PER_PAGE as u64 * PAGE_SIZE64
        );
        assert_eq!(
            second.read_u64(1),
            DATA_BASE + (PRP_ENTRIES_PER_PAGE as u64 + 1) * PAGE_SIZE64
        );
        assert_eq!(second.read_u64(2), 0);
    }

    #[test]
    fn unaligned_inner_segment_without_sgl_is_malformed() {
        let f = Fixture::new();
        let req = read(vec![
            HostSegment::new(DATA_BASE, 0x1000),
            HostSegment::new(DATA_BASE + 0x3000, 0x800),
            HostSegment::new(DATA_BASE + 0x5000, 0x1000),
        ]);
        let err = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Malformed));
        assert_eq!(f.pools.small.outstanding(), 0);
        assert_eq!(f.pools.large.outstanding(), 0);
    }

    #[test]
    fn unaligned_inner_segment_uses_sgl_only_when_forced() {
        let f = Fixture::new();
        let segments = vec![
            HostSegment::new(DATA_BASE, 0x1000),
            HostSegment::new(DATA_BASE + 0x3000, 0x800),
            HostSegment::new(DATA_BASE + 0x5000, 0x1000),
        ];
        // Below the threshold, SGL support alone does not rescue a layout
        // that PRPs cannot describe.
        let err = prepare(&f.ctx(sgl_support()), &read(segments.clone())).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Malformed));
        assert_eq!(f.pools.small.outstanding(), 0);
        assert_eq!(f.pools.large.outstanding(), 0);

        let req = read(segments.clone()).user_command();
        let (command, res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert_eq!(command.cdw0.psdt(), spec::Psdt::SGL_METABUF.0);
        let list = &res.descriptors[0];
        let sgl = command.sgl();
        assert_eq!(
            sgl,
            spec::SglDescriptor::last_segment(list.addr(), segments.len() as u32)
        );
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(list.read_sgl(i), spec::SglDescriptor::data_block(s.addr, s.len));
        }
    }

    #[test]
    fn sgl_threshold_selects_sgl() {
        let f = Fixture::new();
        // Two 64KiB segments average above the 32KiB threshold.
        let req = read(split(0, 128 * 1024, 16));
        let (command, res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert_eq!(command.cdw0.psdt(), spec::Psdt::SGL_METABUF.0);
        assert!(res.flags.small_descriptor);

        // Small segments stay on PRPs.
        let req = read(split(0, 16 * 1024, 1));
        let (command, _res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert_eq!(command.cdw0.psdt(), spec::Psdt::PRP.0);
    }

    #[test]
    fn admin_queue_never_uses_sgl() {
        let f = Fixture::new();
        let mut ctx = f.ctx(sgl_support());
        ctx.qid = 0;
        let req = read(split(0, 128 * 1024, 16)).user_command();
        assert_eq!(use_sgls(&ctx, &req), SglUse::Unsupported);
        let (command, _res) = prepare(&ctx, &req).unwrap();
        assert_eq!(command.cdw0.psdt(), spec::Psdt::PRP.0);
    }

    #[test]
    fn coalesced_mapping_is_one_inline_descriptor() {
        let iommu = Arc::new(EmulatedIommu::new(64));
        let f = Fixture::with_mapper(Arc::new(IommuMapper::new(iommu.clone())));
        let req = read(split(0x800, 64 * 1024, 2)).user_command();
        let (command, res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert!(res.descriptors.is_empty());
        let sgl = command.sgl();
        assert_eq!(sgl.descriptor_type(), spec::SglDescriptorType::DATA_BLOCK);
        assert_eq!(sgl.len, 64 * 1024);
        assert_eq!(iommu.translate(sgl.addr), Some(DATA_BASE + 0x800));
        drop(res);
        assert_eq!(iommu.mapped_pages(), 0);
    }

    #[test]
    fn metadata_sgl_layout() {
        let f = Fixture::new();
        let meta = vec![
            HostSegment::new(DATA_BASE + 0x10, 8),
            HostSegment::new(DATA_BASE + 0x2000, 8),
        ];
        let req = read(split(0, 128 * 1024, 16)).with_integrity(meta.clone());
        let (command, res) = prepare(&f.ctx(sgl_support()), &req).unwrap();
        assert_eq!(command.cdw0.psdt(), spec::Psdt::SGL_METASEG.0);
        let list = res.meta_descriptor.as_ref().unwrap();
        assert!(list.is_small());
        assert_eq!(command.mptr, list.addr());
        assert_eq!(
            list.read_sgl(0),
            spec::SglDescriptor::last_segment(list.addr() + 16, 2)
        );
        assert_eq!(list.read_sgl(1), spec::SglDescriptor::data_block(meta[0].addr, 8));
        assert_eq!(list.read_sgl(2), spec::SglDescriptor::data_block(meta[1].addr, 8));
    }

    #[test]
    fn single_integrity_segment_uses_mptr() {
        let f = Fixture::new();
        let req = read(split(0, 0x1000, 1)).with_integrity(vec![HostSegment::new(DATA_BASE, 8)]);
        let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert_eq!(command.mptr, DATA_BASE);
        assert!(res.meta_descriptor.is_none());

        let req = read(split(0, 0x1000, 1)).with_integrity(vec![
            HostSegment::new(DATA_BASE, 8),
            HostSegment::new(DATA_BASE + 0x1000, 8),
        ]);
        let err = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Malformed));
    }

    #[test]
    fn iommu_exhaustion_is_resource_exhausted() {
        let iommu = Arc::new(EmulatedIommu::new(2));
        let f = Fixture::with_mapper(Arc::new(IommuMapper::new(iommu.clone())));
        let req = read(vec![
            HostSegment::new(DATA_BASE, 0x800),
            HostSegment::new(DATA_BASE + 0x4000, 0x800),
            HostSegment::new(DATA_BASE + 0x8000, 0x800),
        ]);
        let err = prepare(&f.ctx(sgl_support()), &req).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ResourceExhausted));
        assert_eq!(iommu.mapped_pages(), 0);
        assert_eq!(iommu.double_unmaps(), 0);
        assert_eq!(f.pools.small.outstanding(), 0);
    }

    #[test]
    fn resources_return_to_pools_on_drop() {
        let f = Fixture::new();
        let req = read(split(0, 64 * PAGE_SIZE64, 64));
        let (_command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
        assert_eq!(f.pools.large.outstanding(), 1);
        drop(res);
        assert_eq!(f.pools.large.outstanding(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prp_round_trip(
            len in 1u64..=(3 << 20),
            offset in 0u64..PAGE_SIZE64,
            pages_per_segment in 1u64..=32,
        ) {
            let f = Fixture::new();
            let req = read(split(offset, len, pages_per_segment));
            let (command, res) = prepare(&f.ctx(spec::Sgls::new()), &req).unwrap();
            prop_assert_eq!(command.dptr[0], DATA_BASE + offset);
            let (pages, total) = walk_prps(&command, &res, len);
            prop_assert_eq!(total, len);
            prop_assert_eq!(pages, expected_pages(offset, len));
        }
    }
}
