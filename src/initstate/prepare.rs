//! Prepare: snapshot live GPU contents at the start of a capture

use crate::accel::AsCopyMode;
use crate::alloc::{GpuBufferHeapType, GpuBufferMemory};
use crate::core::{Error, Result};
use crate::device::{CopyLocation, GpuCommand};
use crate::initstate::contents::{
    AccelContents, CopySource, HeapContents, InitialContents, MsaaArray, OwnedHandle, ResourceContents,
    SparseState, SubresourceSet,
};
use crate::initstate::manager::ResourceManager;
use crate::resource::{AccelStructInfo, HeapType, ResourceDesc, ResourceDetails, ResourceId, ResourceInfo};

/// Smallest CPU copy kept for host-visible buffers
pub(crate) const MIN_CPU_COPY: u64 = 64;

/// Alignment of serialised acceleration-structure blobs
const AS_SERIALISED_ALIGNMENT: u64 = 256;

impl ResourceManager {
    /// Snapshot the current contents of `id`
    ///
    /// GPU copies are queued and submitted with the next flush. On failure
    /// the error is logged, no contents are installed and `false` is
    /// returned; Apply later skips the resource.
    pub fn prepare_initial_state(&self, id: ResourceId) -> bool {
        match self.prepare(id) {
            Ok(Some(contents)) => {
                log::trace!("Prepared {:?} contents for {}", contents.tag(), id);
                self.set_initial_contents(id, contents);
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.degrade(id, "Prepare", &err);
                false
            }
        }
    }

    /// Prepare every registered object that carries initial state
    ///
    /// Returns how many were prepared.
    pub fn prepare_all_initial_states(&self) -> usize {
        self.ids_with_initial_state()
            .into_iter()
            .filter(|id| self.prepare_initial_state(*id))
            .count()
    }

    fn prepare(&self, id: ResourceId) -> Result<Option<InitialContents>> {
        let record = self.registry().get(id).cloned().ok_or(Error::UnknownResource(id))?;
        match record.details {
            ResourceDetails::DescriptorHeap(info) => Ok(Some(InitialContents::DescriptorHeap(HeapContents::Snapshot {
                descriptors: info.descriptors,
                names: info.names,
            }))),
            ResourceDetails::Resource(info) => {
                self.prepare_resource(id, record.handle, record.resident, &info).map(Some)
            }
            ResourceDetails::AccelerationStructure(info) => self.prepare_acceleration_structure(id, record.handle, &info),
            ResourceDetails::Heap { .. } => Err(Error::UnsupportedResourceKind(format!(
                "{id} is a memory heap and has no initial contents"
            ))),
        }
    }

    fn prepare_resource(
        &self,
        id: ResourceId,
        live: crate::device::NativeHandle,
        resident: bool,
        info: &ResourceInfo,
    ) -> Result<InitialContents> {
        let desc = info.desc;
        if info.is_acceleration_structure_buffer() {
            return Ok(InitialContents::Resource(ResourceContents::AccelerationStructureBuffer));
        }

        if desc.is_buffer() && info.heap == HeapType::Readback {
            let mut bytes = self.device.read_buffer(live, 0, desc.width).map_err(|e| Error::map(id, e))?;
            bytes.resize(desc.width.max(MIN_CPU_COPY) as usize, 0);
            return Ok(InitialContents::Resource(ResourceContents::MapDirect { bytes }));
        }

        if !resident {
            self.device
                .make_resident(live)
                .map_err(|e| Error::creation(id, "residency for snapshot", e))?;
            self.evict_after_flush(live);
        }

        let sparse = match &info.sparse_table {
            Some(table) => SparseState::Table(table.clone()),
            None => SparseState::None,
        };

        if desc.is_buffer() {
            let staging = self.create_owned(id, &ResourceDesc::buffer(desc.width), HeapType::Readback, "readback buffer")?;
            self.queue_commands([GpuCommand::CopyResource { dst: staging.handle(), src: live }]);
            return Ok(InitialContents::Resource(ResourceContents::Copy {
                source: CopySource::Buffer { buffer: staging, len: desc.width },
                subresources: SubresourceSet::All,
                sparse,
                msaa_array: None,
            }));
        }

        // MSAA samples are copied out through a single-sampled array first
        let msaa_array = if desc.is_msaa() {
            let array_desc = desc.msaa_array_desc();
            let texture = self.create_owned(id, &array_desc, HeapType::Default, "MSAA array texture")?;
            self.queue_commands([GpuCommand::ExpandMsaaToArray { dst: texture.handle(), src: live }]);
            Some(MsaaArray { texture, desc: array_desc })
        } else {
            None
        };
        let (copy_desc, copy_src) = match &msaa_array {
            Some(array) => (array.desc, array.texture.handle()),
            None => (desc, live),
        };

        let count = copy_desc.subresource_count(true);
        let subresources = match (&info.sparse_table, &msaa_array) {
            (Some(table), None) => SubresourceSet::List(
                (0..count)
                    .filter(|sub| *sub < table.num_subresources() && table.is_subresource_mapped(*sub))
                    .collect(),
            ),
            _ => SubresourceSet::All,
        };

        let (footprints, total) = copy_desc.copyable_footprints(subresources.indices(count));
        let staging = self.create_owned(id, &ResourceDesc::buffer(total.max(1)), HeapType::Readback, "readback buffer")?;
        self.queue_commands(footprints.iter().map(|fp| GpuCommand::CopyTextureRegion {
            dst: CopyLocation::Footprint { buffer: staging.handle(), footprint: *fp },
            src: CopyLocation::Subresource { resource: copy_src, subresource: fp.subresource },
        }));

        Ok(InitialContents::Resource(ResourceContents::Copy {
            source: CopySource::Buffer { buffer: staging, len: total },
            subresources,
            sparse,
            msaa_array,
        }))
    }

    fn prepare_acceleration_structure(
        &self,
        id: ResourceId,
        buffer: crate::device::NativeHandle,
        info: &AccelStructInfo,
    ) -> Result<Option<InitialContents>> {
        if !self.config.driver_as_serialisation {
            return match &info.build_data {
                Some(data) => Ok(Some(InitialContents::AccelerationStructure(AccelContents::Build {
                    data: data.clone(),
                }))),
                None => {
                    log::warn!("{} has no recorded build; it will not be restored on replay", id);
                    Ok(None)
                }
            };
        }

        let address = self.device.gpu_address(buffer) + info.offset;
        let (size, _) = self.device.serialized_as_size(address).map_err(|e| Error::map(id, e))?;
        let staging = self
            .allocator
            .alloc(GpuBufferHeapType::ReadBack, GpuBufferMemory::Default, size, AS_SERIALISED_ALIGNMENT)
            .map_err(|e| Error::creation(id, "serialised AS buffer", e))?;
        self.queue_commands([GpuCommand::CopyAccelerationStructure {
            dest: staging.address(),
            source: address,
            mode: AsCopyMode::Serialize,
        }]);
        Ok(Some(InitialContents::AccelerationStructure(AccelContents::Blob { buffer: staging, len: size })))
    }

    pub(crate) fn create_owned(
        &self,
        id: ResourceId,
        desc: &ResourceDesc,
        heap: HeapType,
        what: &'static str,
    ) -> Result<OwnedHandle> {
        let handle = self.device.create_resource(desc, heap).map_err(|e| Error::creation(id, what, e))?;
        Ok(OwnedHandle::new(self.device.clone(), handle))
    }
}
