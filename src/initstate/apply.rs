//! Apply: push initial contents onto live resources
//!
//! Resource and descriptor copies are queued and go out with the next flush.
//! Acceleration structures are built immediately so a TLAS can check that
//! the BLASes it references were applied first.

use crate::accel::{patch_instances, AsType, PatchFailure};
use crate::core::{Error, Result};
use crate::device::{CopyLocation, GpuCommand, NativeDescriptor, NativeHandle};
use crate::initstate::contents::{
    AccelContents, CopySource, HeapContents, InitialContents, ResourceContents, SparseState,
};
use crate::initstate::manager::{CaptureState, ResourceManager};
use crate::resource::{AccelStructInfo, Descriptor, ResourceDetails, ResourceId, ResourceInfo};
use crate::sparse::{SparseBind, SparseBinds};

/// Outcome of [`ResourceManager::apply_all_initial_states`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    /// No contents, read-only, or the fatal flag was set
    pub skipped: usize,
    pub failed: usize,
}

/// Rank used to apply plain resources, then BLASes, then TLASes
fn apply_rank(details: &ResourceDetails) -> u8 {
    match details {
        ResourceDetails::AccelerationStructure(info) if info.ty == AsType::BottomLevel => 1,
        ResourceDetails::AccelerationStructure(_) => 2,
        _ => 0,
    }
}

impl ResourceManager {
    /// Bring `id` to its initial state
    ///
    /// Returns whether any work was issued. Does nothing once the fatal flag
    /// is set, or when `id` has no contents. Safe to call again on every
    /// replay loop. A TLAS must be applied after every BLAS it references.
    pub fn apply_initial_state(&self, id: ResourceId) -> Result<bool> {
        if self.has_fatal_error() {
            return Ok(false);
        }
        let Some(contents) = self.take_initial_contents(id) else {
            log::trace!("{} has no initial contents to apply", id);
            return Ok(false);
        };
        let result = self.apply_contents(id, &contents);
        self.set_initial_contents(id, contents);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.report_fatal(err.result_code(), format!("Apply of {id}: {err}"));
            }
        }
        result
    }

    /// Apply every object's contents, BLASes before TLASes, then flush
    pub fn apply_all_initial_states(&self) -> Result<ApplySummary> {
        let mut order: Vec<(u8, ResourceId)> = {
            let mut registry = self.registry();
            registry.reset_applied_structures();
            self.ids_with_initial_contents()
                .into_iter()
                .filter_map(|id| registry.get(id).map(|r| (apply_rank(&r.details), id)))
                .collect()
        };
        order.sort();

        let mut summary = ApplySummary::default();
        for (_, id) in order {
            match self.apply_initial_state(id) {
                Ok(true) => summary.applied += 1,
                Ok(false) => summary.skipped += 1,
                Err(err) => {
                    self.degrade(id, "Apply", &err);
                    summary.failed += 1;
                }
            }
        }
        self.flush_pending_commands()?;
        Ok(summary)
    }

    fn apply_contents(&self, id: ResourceId, contents: &InitialContents) -> Result<bool> {
        let record = self.registry().get(id).cloned().ok_or(Error::UnknownResource(id))?;
        match (&record.details, contents) {
            (ResourceDetails::DescriptorHeap(info), InitialContents::DescriptorHeap(heap)) => {
                self.apply_heap(record.handle, info.descriptors.len(), heap)
            }
            (ResourceDetails::Resource(info), InitialContents::Resource(resource)) => {
                self.apply_resource(id, record.handle, info, resource)
            }
            (ResourceDetails::AccelerationStructure(info), InitialContents::AccelerationStructure(accel)) => {
                self.apply_acceleration_structure(id, record.handle, info, accel)?;
                Ok(true)
            }
            (_, contents) => Err(Error::UnsupportedResourceKind(format!(
                "{:?} contents cannot be applied to {id}, a {:?}",
                contents.resource_type(),
                record.resource_type()
            ))),
        }
    }

    fn apply_heap(&self, live: NativeHandle, live_count: usize, heap: &HeapContents) -> Result<bool> {
        match heap {
            HeapContents::CopyHeap { heap, count } => {
                self.queue_commands([GpuCommand::CopyDescriptors {
                    dst_heap: live,
                    src_heap: heap.handle(),
                    count: *count,
                }]);
            }
            HeapContents::Snapshot { descriptors, .. } => {
                let native: Vec<NativeDescriptor> = {
                    let registry = self.registry();
                    descriptors
                        .iter()
                        .map(|d| d.map_resources(|rid| registry.live_handle(rid).unwrap_or(NativeHandle::NULL)))
                        .collect()
                };
                self.device.write_descriptors(live, 0, &native)?;
            }
            HeapContents::Null => {
                self.device.write_descriptors(live, 0, &vec![Descriptor::Undefined; live_count])?;
            }
        }
        Ok(true)
    }

    fn apply_resource(
        &self,
        id: ResourceId,
        live: NativeHandle,
        info: &ResourceInfo,
        contents: &ResourceContents,
    ) -> Result<bool> {
        if matches!(contents, ResourceContents::AccelerationStructureBuffer) {
            return Ok(false);
        }
        let state = self.state();
        if info.read_only && state == CaptureState::ActiveReplaying {
            log::trace!("{} is read-only; keeping loaded contents", id);
            return Ok(false);
        }

        let sparse = match contents {
            ResourceContents::Copy { sparse, .. } | ResourceContents::ForceCopy { sparse, .. } => sparse,
            _ => &SparseState::None,
        };
        if let Some(binds) = sparse.binds() {
            if state == CaptureState::LoadingReplaying || info.sparse_updated {
                self.apply_sparse_binds(live, binds);
                if let Some(ResourceDetails::Resource(info)) = self.registry().get_mut(id).map(|r| &mut r.details) {
                    info.sparse_updated = false;
                }
            }
        }

        let desc = info.desc;
        match contents {
            ResourceContents::Copy { source: CopySource::Cpu(bytes), subresources, .. } => {
                if desc.is_buffer() {
                    let len = (bytes.len() as u64).min(desc.width) as usize;
                    self.device.write_buffer(live, 0, &bytes[..len]).map_err(|e| Error::map(id, e))?;
                } else {
                    let count = desc.subresource_count(true);
                    let (footprints, _) = desc.copyable_footprints(subresources.indices(count));
                    for fp in footprints {
                        let Some(tight) = tight_rows(bytes, &fp) else {
                            log::warn!("{} contents end before subresource {}", id, fp.subresource);
                            break;
                        };
                        self.device
                            .write_subresource(live, fp.subresource, &tight)
                            .map_err(|e| Error::map(id, e))?;
                    }
                }
            }
            ResourceContents::Copy { source: CopySource::Buffer { buffer, len }, subresources, .. } => {
                if desc.is_buffer() {
                    self.queue_commands([GpuCommand::CopyBufferRegion {
                        dst: live,
                        dst_offset: 0,
                        src: buffer.handle(),
                        src_offset: 0,
                        size: (*len).min(desc.width),
                    }]);
                } else {
                    let count = desc.subresource_count(true);
                    let (footprints, _) = desc.copyable_footprints(subresources.indices(count));
                    let src = buffer.handle();
                    self.queue_commands(footprints.into_iter().filter(|fp| fp.offset + fp.total_bytes() <= *len).map(
                        |fp| GpuCommand::CopyTextureRegion {
                            dst: CopyLocation::Subresource { resource: live, subresource: fp.subresource },
                            src: CopyLocation::Footprint { buffer: src, footprint: fp },
                        },
                    ));
                }
            }
            ResourceContents::Copy { source: CopySource::Resource(resource), .. }
            | ResourceContents::ForceCopy { resource, .. } => {
                self.queue_commands([GpuCommand::CopyResource { dst: live, src: resource.handle() }]);
            }
            ResourceContents::MapDirect { bytes } => {
                let len = (bytes.len() as u64).min(desc.width) as usize;
                self.device.write_buffer(live, 0, &bytes[..len]).map_err(|e| Error::map(id, e))?;
            }
            ResourceContents::AccelerationStructureBuffer => return Ok(false),
        }
        Ok(true)
    }

    fn apply_sparse_binds(&self, live: NativeHandle, binds: &SparseBinds) {
        let mut commands = vec![GpuCommand::UnmapAllTiles { resource: live }];
        if let SparseBinds::Binds(list) = binds {
            let registry = self.registry();
            let native: Vec<SparseBind<NativeHandle>> = list
                .iter()
                .map(|bind| {
                    bind.map_heap(|heap| {
                        if heap.is_null() {
                            return NativeHandle::NULL;
                        }
                        registry.live_handle(heap).unwrap_or_else(|| {
                            log::warn!("Sparse bind references unknown heap {}; unmapping", heap);
                            NativeHandle::NULL
                        })
                    })
                })
                .collect();
            commands.push(GpuCommand::UpdateTileMappings { resource: live, binds: native });
        }
        self.queue_commands(commands);
    }

    fn apply_acceleration_structure(
        &self,
        id: ResourceId,
        buffer: NativeHandle,
        info: &AccelStructInfo,
        contents: &AccelContents,
    ) -> Result<()> {
        let dest = self.device.gpu_address(buffer) + info.offset;
        match contents {
            AccelContents::Blob { buffer, .. } => {
                self.device.execute(vec![GpuCommand::CopyAccelerationStructure {
                    dest,
                    source: buffer.address(),
                    mode: crate::accel::AsCopyMode::Deserialize,
                }])?;
            }
            AccelContents::Build { data } if data.ty() == AsType::BottomLevel => {
                self.rt.apply_bottom_level(id, data, dest)?;
            }
            AccelContents::Build { data } => {
                let mut instances = data.read_bytes()?;
                instances.truncate(data.recipe().instance_bytes() as usize);
                let summary = {
                    let registry = self.registry();
                    patch_instances(&mut instances, |address| {
                        let (owner, offset) =
                            registry.resolve_original_address(address).ok_or(PatchFailure::UnknownResource)?;
                        let blas = registry.structure_at(owner, offset).ok_or(PatchFailure::NoStructureAtOffset)?;
                        if blas > id {
                            return Err(PatchFailure::NewerThanReferrer);
                        }
                        let child = registry
                            .get(blas)
                            .and_then(|r| r.accel_info())
                            .ok_or(PatchFailure::NoStructureAtOffset)?;
                        if child.ty != AsType::BottomLevel {
                            return Err(PatchFailure::NotBottomLevel);
                        }
                        if !child.applied {
                            return Err(PatchFailure::NotYetApplied);
                        }
                        let live = registry.live_handle(child.buffer).ok_or(PatchFailure::UnknownResource)?;
                        let live_address = self.device.gpu_address(live) + child.offset;
                        if self.config.rt_auditing {
                            log::info!("{} instance references {} at {:#x}", id, blas, live_address);
                        }
                        Ok(live_address)
                    })
                };
                if summary.zeroed > 0 {
                    log::warn!("{}: zeroed {} of {} instances", id, summary.zeroed, data.recipe().num_blas);
                }
                self.rt.apply_top_level(data, &instances, dest)?;
            }
        }

        if let Some(ResourceDetails::AccelerationStructure(info)) = self.registry().get_mut(id).map(|r| &mut r.details) {
            info.applied = true;
        }
        Ok(())
    }
}

/// Tightly packed rows of one footprint inside `bytes`
fn tight_rows(bytes: &[u8], fp: &crate::resource::PlacedFootprint) -> Option<Vec<u8>> {
    let rows = u64::from(fp.num_rows) * u64::from(fp.depth);
    let mut out = Vec::with_capacity((rows * fp.row_size) as usize);
    for row in 0..rows {
        let start = (fp.offset + row * fp.row_pitch) as usize;
        out.extend_from_slice(bytes.get(start..start + fp.row_size as usize)?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{EngineConfig, ResultCode};
    use crate::device::{GpuDevice, SoftwareDevice};
    use crate::resource::{DescriptorHeapKind, Format, HeapType, ResourceDesc};
    use crate::serialise::{ReadSerialiser, WriteSerialiser, CURRENT_VERSION};
    use crate::sparse::PageTable;

    fn manager() -> (Arc<SoftwareDevice>, ResourceManager, tempfile::TempDir) {
        let device = Arc::new(SoftwareDevice::new());
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig { disk_cache_dir: Some(dir.path().to_path_buf()), ..Default::default() };
        let mgr = ResourceManager::new(device.clone(), config).unwrap();
        (device, mgr, dir)
    }

    #[test]
    fn test_force_copy_zeroes_live_texture() {
        let (device, mgr, _dir) = manager();
        let desc = ResourceDesc::texture_2d(8, 8, 1, 1, Format::Rgba8Unorm);
        let tex = device.create_resource(&desc, HeapType::Default).unwrap();
        device.fill_subresource(tex, 0, &[9; 256]).unwrap();
        let id = mgr.register_resource(tex, desc, HeapType::Default);

        assert!(mgr.create_initial_state(id).unwrap());
        let summary = mgr.apply_all_initial_states().unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(device.subresource_contents(tex, 0).unwrap(), vec![0; 256]);
    }

    #[test]
    fn test_fatal_flag_turns_apply_into_no_op() {
        let (device, mgr, _dir) = manager();
        let desc = ResourceDesc::buffer(64);
        let buffer = device.create_resource(&desc, HeapType::Default).unwrap();
        device.fill_buffer(buffer, 0, &[4; 64]).unwrap();
        let id = mgr.register_resource(buffer, desc, HeapType::Default);
        assert!(mgr.create_initial_state(id).unwrap());

        mgr.report_fatal(ResultCode::DeviceLost, "test");
        assert!(!mgr.apply_initial_state(id).unwrap());
        mgr.flush_pending_commands().unwrap();
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![4; 64]);
    }

    #[test]
    fn test_read_only_skipped_during_active_replay() {
        let (device, mgr, _dir) = manager();
        let desc = ResourceDesc::buffer(64);
        let buffer = device.create_resource(&desc, HeapType::Default).unwrap();
        let id = mgr.register_resource(buffer, desc, HeapType::Default);
        assert!(mgr.create_initial_state(id).unwrap());
        mgr.mark_read_only(id, true);

        mgr.set_state(CaptureState::LoadingReplaying);
        assert!(mgr.apply_initial_state(id).unwrap());
        mgr.set_state(CaptureState::ActiveReplaying);
        assert!(!mgr.apply_initial_state(id).unwrap());
    }

    #[test]
    fn test_null_heap_contents_clear_descriptors() {
        let (device, mgr, _dir) = manager();
        let heap = device.create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 2).unwrap();
        let cbv = Descriptor::Cbv { buffer_location: 64, size: 16 };
        device.write_descriptors(heap, 0, &[cbv, cbv]).unwrap();
        let id = mgr.register_descriptor_heap(heap, DescriptorHeapKind::CbvSrvUav, 2);

        assert!(mgr.create_initial_state(id).unwrap());
        assert!(mgr.apply_initial_state(id).unwrap());
        assert!(device.descriptors(heap).iter().all(|d| *d == Descriptor::Undefined));
    }

    #[test]
    fn test_sparse_binds_apply_on_load_and_after_updates() {
        let (device, mgr, _dir) = manager();
        let size = 16 * crate::sparse::PAGE_SIZE;
        let desc = ResourceDesc::buffer(size);
        let buffer = device.create_resource(&desc, HeapType::Default).unwrap();
        let id = mgr.register_resource(buffer, desc, HeapType::Default);
        let heap_handle = device.create_resource(&ResourceDesc::buffer(size), HeapType::Default).unwrap();
        let heap = mgr.register_heap(heap_handle, size);
        let mut table = PageTable::for_buffer(size);
        table.map_buffer_pages(0, 16, heap, 0);
        mgr.set_sparse_table(id, table).unwrap();

        assert!(mgr.prepare_initial_state(id));
        mgr.flush_pending_commands().unwrap();
        let mut writer = WriteSerialiser::new(Vec::new());
        mgr.serialise_initial_state(&mut writer, id).unwrap();
        let bytes = writer.into_inner();

        mgr.set_state(CaptureState::LoadingReplaying);
        mgr.serialise_initial_state(&mut ReadSerialiser::new(&bytes, CURRENT_VERSION), id).unwrap();
        mgr.apply_all_initial_states().unwrap();
        let binds = device.tile_binds(buffer);
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].heap, heap_handle);

        mgr.set_state(CaptureState::ActiveReplaying);
        mgr.update_sparse_table(id, |t| t.clear()).unwrap();
        mgr.apply_all_initial_states().unwrap();
        assert_eq!(device.tile_binds(buffer).len(), 1);
        assert!(!mgr.registry().get(id).and_then(|r| r.resource_info()).unwrap().sparse_updated);
    }

    #[test]
    fn test_tight_rows_strip_pitch() {
        let desc = ResourceDesc::texture_2d(2, 2, 1, 1, Format::Rgba8Unorm);
        let fp = desc.footprint(0, 0);
        let mut bytes = vec![0u8; fp.total_bytes() as usize];
        bytes[..8].copy_from_slice(&[1; 8]);
        let row = fp.row_pitch as usize;
        bytes[row..row + 8].copy_from_slice(&[2; 8]);
        let tight = tight_rows(&bytes, &fp).unwrap();
        assert_eq!(tight.len(), 16);
        assert_eq!(&tight[..8], &[1; 8]);
        assert_eq!(&tight[8..], &[2; 8]);
    }
}
