//! Serialise and GetSize: initial contents to and from the capture stream
//!
//! One code path drives both directions. Writing takes the contents out of
//! the manager, emits them and puts them back; reading rebuilds replay-side
//! contents (upload buffers, copy heaps, build data) and installs them.
//!
//! ```text
//! [ResourceId u64][ResourceType u32]
//! DescriptorHeap:  descriptors[] | count u32 | names[] (0x13+)
//! Resource:        subresources[] (0xE+) | Option<PageTable> (0xB+) | length u64 | bytes
//! AS:              opaque bool | blob: length u64, bytes
//!                              | recipe: type, flags, num_blas, geometries[], length u64, bytes
//! ```

use std::io::Write;
use std::sync::Arc;

use crate::accel::{patch_serialized_blob, read_serialized_header, PatchFailure, GEOMETRY_SERIALISED_BOUND};
use crate::alloc::{GpuBufferHeapType, GpuBufferMemory};
use crate::core::{Error, Result};
use crate::device::{CopyLocation, GpuCommand, GpuDevice, NativeDescriptor, NativeHandle};
use crate::initstate::contents::{
    AccelContents, CopySource, HeapContents, InitialContents, OwnedHandle, ResourceContents, SparseState,
    SubresourceSet,
};
use crate::initstate::manager::{CaptureState, ResourceManager};
use crate::initstate::prepare::MIN_CPU_COPY;
use crate::resource::{
    AccelStructInfo, Descriptor, DescriptorHeapInfo, HeapType, ResourceDesc, ResourceDetails, ResourceId,
    ResourceInfo, ResourceRegistry, ResourceType, DESCRIPTOR_SERIALISED_BOUND,
};
use crate::serialise::{
    CaptureReader, CaptureWriter, ChunkType, ReadSerialiser, Serialise, Serialiser, VersionGate, WriteSerialiser,
    INITIAL_STATE_HEADER_SIZE,
};
use crate::sparse::PageTable;

/// Slack added to every size estimate for chunk alignment
const SERIALISE_ALIGNMENT: u64 = 64;

/// Alignment of uploaded AS blobs
const AS_BLOB_ALIGNMENT: u64 = 256;

/// Outcome of loading a capture's initial states
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    /// Chunks whose resource was left without contents
    pub failed: usize,
}

/// Captured address -> live address of the object now at that place
fn live_address(
    registry: &ResourceRegistry,
    device: &dyn GpuDevice,
    address: u64,
) -> std::result::Result<u64, PatchFailure> {
    let (owner, offset) = registry.resolve_original_address(address).ok_or(PatchFailure::UnknownResource)?;
    let handle = registry.live_handle(owner).ok_or(PatchFailure::UnknownResource)?;
    Ok(device.gpu_address(handle) + offset)
}

impl ResourceManager {
    /// Serialise the initial contents of `id` in whichever direction `ser` runs
    ///
    /// When reading, the id comes from the stream; a non-null `id` must match
    /// it. Returns the id that was serialised.
    pub fn serialise_initial_state<S: Serialiser + ?Sized>(&self, ser: &mut S, id: ResourceId) -> Result<ResourceId> {
        let mut contents = if ser.is_writing() {
            Some(self.take_initial_contents(id).ok_or(Error::UnknownResource(id))?)
        } else {
            None
        };

        let mut stream_id = id;
        let result = self.serialise_contents(ser, &mut stream_id, &mut contents);

        if ser.is_reading() && result.is_ok() {
            log::trace!("Loaded initial contents for {}", stream_id);
        }
        if let Some(contents) = contents {
            self.set_initial_contents(stream_id, contents);
        }
        result.map(|_| stream_id)
    }

    fn serialise_contents<S: Serialiser + ?Sized>(
        &self,
        ser: &mut S,
        id: &mut ResourceId,
        contents: &mut Option<InitialContents>,
    ) -> Result<()> {
        let expected = *id;
        id.serialise(ser)?;
        if ser.is_reading() && !expected.is_null() && expected != *id {
            return Err(Error::SerialisationRead(format!("expected contents for {expected}, found {id}")));
        }
        let id = *id;

        let record = self.registry().get(id).cloned().ok_or(Error::UnknownResource(id))?;
        let mut ty = record.resource_type() as u32;
        ser.serialise_u32(&mut ty)?;
        if ResourceType::from_raw(ty) != record.resource_type() {
            return Err(Error::SerialisationRead(format!(
                "{id} is a {:?} but its chunk holds {:?}",
                record.resource_type(),
                ResourceType::from_raw(ty)
            )));
        }

        match &record.details {
            ResourceDetails::DescriptorHeap(info) => self.serialise_heap(ser, id, info, contents),
            ResourceDetails::Resource(info) => self.serialise_resource(ser, id, info, contents),
            ResourceDetails::AccelerationStructure(info) => self.serialise_acceleration_structure(ser, id, info, contents),
            ResourceDetails::Heap { .. } => Err(Error::UnsupportedResourceKind(format!(
                "{id} is a memory heap and has no initial contents"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Descriptor heaps
    // -----------------------------------------------------------------------

    fn serialise_heap<S: Serialiser + ?Sized>(
        &self,
        ser: &mut S,
        id: ResourceId,
        info: &DescriptorHeapInfo,
        contents: &mut Option<InitialContents>,
    ) -> Result<()> {
        let (mut descriptors, mut names) = match contents {
            Some(InitialContents::DescriptorHeap(HeapContents::Snapshot { descriptors, names })) => {
                (descriptors.clone(), names.clone())
            }
            _ => (Vec::new(), Vec::new()),
        };

        ser.serialise_array(&mut descriptors)?;
        let mut count = descriptors.len() as u32;
        ser.serialise_u32(&mut count)?;
        if ser.has(VersionGate::DescriptorNames) {
            ser.serialise_array(&mut names)?;
        }

        if ser.is_reading() {
            let live_count = info.descriptors.len();
            let count = (count as usize).min(descriptors.len());
            if count > live_count {
                log::warn!("{} captured {} descriptors but the live heap holds {}", id, count, live_count);
            }
            descriptors.truncate(count.min(live_count));
            *contents = Some(InitialContents::DescriptorHeap(self.create_copy_heap(id, info, descriptors, names)?));
        }
        Ok(())
    }

    /// CPU heap holding the captured descriptors rewritten to live objects
    fn create_copy_heap(
        &self,
        id: ResourceId,
        info: &DescriptorHeapInfo,
        descriptors: Vec<Descriptor>,
        names: Vec<String>,
    ) -> Result<HeapContents> {
        let count = descriptors.len() as u32;
        let native: Vec<NativeDescriptor> = {
            let registry = self.registry();
            descriptors
                .iter()
                .map(|descriptor| {
                    let mut descriptor = *descriptor;
                    if let Descriptor::Cbv { buffer_location, .. } = &mut descriptor {
                        if *buffer_location != 0 {
                            *buffer_location =
                                live_address(&registry, self.device.as_ref(), *buffer_location).unwrap_or(0);
                        }
                    }
                    let mut native = descriptor.map_resources(|rid| registry.live_handle(rid).unwrap_or(NativeHandle::NULL));
                    if self.config.rt_auditing {
                        native.null_acceleration_structure();
                    }
                    native
                })
                .collect()
        };

        let heap = self
            .device
            .create_descriptor_heap(info.kind, count.max(1))
            .map_err(|e| Error::creation(id, "copy descriptor heap", e))?;
        let heap = OwnedHandle::new(self.device.clone(), heap);
        self.device
            .write_descriptors(heap.handle(), 0, &native)
            .map_err(|e| Error::map(id, e))?;

        if let Some(ResourceDetails::DescriptorHeap(live)) = self.registry().get_mut(id).map(|r| &mut r.details) {
            live.descriptors[..descriptors.len()].copy_from_slice(&descriptors);
            live.names = names;
        }
        Ok(HeapContents::CopyHeap { heap, count })
    }

    // -----------------------------------------------------------------------
    // Buffers and textures
    // -----------------------------------------------------------------------

    fn serialise_resource<S: Serialiser + ?Sized>(
        &self,
        ser: &mut S,
        id: ResourceId,
        info: &ResourceInfo,
        contents: &mut Option<InitialContents>,
    ) -> Result<()> {
        if info.is_acceleration_structure_buffer() {
            if ser.is_reading() {
                *contents = Some(InitialContents::Resource(ResourceContents::AccelerationStructureBuffer));
            }
            return Ok(());
        }

        let (mut subresources, mut table, mut bytes) = match contents {
            Some(InitialContents::Resource(resource)) => self.captured_bytes(id, resource),
            _ => (SubresourceSet::All, None, Vec::new()),
        };

        if ser.has(VersionGate::SubresourceList) {
            subresources.serialise(ser)?;
        }
        if ser.has(VersionGate::SparseTable) {
            ser.serialise_option(&mut table)?;
        }
        let mut len = bytes.len() as u64;
        ser.serialise_u64(&mut len)?;

        if ser.is_writing() {
            return ser.serialise_raw(&mut bytes, len);
        }

        // older captures count only the first plane of planar formats
        if !ser.has(VersionGate::PlaneSubresources) && subresources.is_all() && info.desc.plane_count() > 1 {
            subresources = SubresourceSet::List((0..info.desc.subresource_count(false)).collect());
        }
        *contents = self.read_resource_bytes(ser, id, info, subresources, table, len)?;
        Ok(())
    }

    /// Subresources, page table and bytes a resource snapshot persists
    fn captured_bytes(&self, id: ResourceId, resource: &ResourceContents) -> (SubresourceSet, Option<PageTable>, Vec<u8>) {
        match resource {
            ResourceContents::Copy { source, subresources, sparse, .. } => {
                let bytes = match source {
                    CopySource::Buffer { buffer, len } => match self.device.read_buffer(buffer.handle(), 0, *len) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let err = Error::map(id, e);
                            self.degrade(id, "Serialise", &err);
                            Vec::new()
                        }
                    },
                    CopySource::Cpu(bytes) => bytes.clone(),
                    CopySource::Resource(_) => Vec::new(),
                };
                (subresources.clone(), sparse.table().cloned(), bytes)
            }
            ResourceContents::MapDirect { bytes } => (SubresourceSet::All, None, bytes.clone()),
            ResourceContents::ForceCopy { sparse, .. } => (SubresourceSet::All, sparse.table().cloned(), Vec::new()),
            ResourceContents::AccelerationStructureBuffer => (SubresourceSet::All, None, Vec::new()),
        }
    }

    fn read_resource_bytes<S: Serialiser + ?Sized>(
        &self,
        ser: &mut S,
        id: ResourceId,
        info: &ResourceInfo,
        subresources: SubresourceSet,
        table: Option<PageTable>,
        len: u64,
    ) -> Result<Option<InitialContents>> {
        let desc = info.desc;
        if len == 0 {
            if desc.is_msaa() {
                log::warn!("{} is a legacy MSAA chunk without contents", id);
            } else {
                log::warn!("{} was captured without contents", id);
            }
            return Ok(None);
        }
        let sparse = table.map(SparseState::compiled).unwrap_or_default();

        if info.heap.is_cpu_written() {
            let mut bytes = Vec::new();
            ser.serialise_raw(&mut bytes, len)?;
            bytes.resize(len.max(MIN_CPU_COPY) as usize, 0);
            return Ok(Some(InitialContents::Resource(ResourceContents::Copy {
                source: CopySource::Cpu(bytes),
                subresources,
                sparse,
                msaa_array: None,
            })));
        }

        let upload = match self.create_owned(id, &ResourceDesc::buffer(len), HeapType::Upload, "upload buffer") {
            Ok(upload) => upload,
            Err(err) => {
                // keep the stream aligned for whoever reads past this resource
                ser.skip(len)?;
                return Err(err);
            }
        };
        let mut bytes = Vec::new();
        ser.serialise_raw(&mut bytes, len)?;
        self.device
            .write_buffer(upload.handle(), 0, &bytes)
            .map_err(|e| Error::map(id, e))?;

        if !desc.is_msaa() {
            return Ok(Some(InitialContents::Resource(ResourceContents::Copy {
                source: CopySource::Buffer { buffer: upload, len },
                subresources,
                sparse,
                msaa_array: None,
            })));
        }

        let array_desc = desc.msaa_array_desc();
        let array = self.create_owned(id, &array_desc, HeapType::Default, "MSAA array texture")?;
        let msaa = self.create_owned(id, &desc, HeapType::Default, "MSAA texture")?;
        let count = array_desc.subresource_count(ser.has(VersionGate::PlaneSubresources));
        let (footprints, _) = array_desc.copyable_footprints(0..count);
        let mut commands: Vec<GpuCommand> = footprints
            .iter()
            .map(|fp| GpuCommand::CopyTextureRegion {
                dst: CopyLocation::Subresource { resource: array.handle(), subresource: fp.subresource },
                src: CopyLocation::Footprint { buffer: upload.handle(), footprint: *fp },
            })
            .collect();
        commands.push(GpuCommand::CollapseArrayToMsaa { dst: msaa.handle(), src: array.handle() });
        self.device.execute(commands).map_err(Error::from)?;

        Ok(Some(InitialContents::Resource(ResourceContents::Copy {
            source: CopySource::Resource(msaa),
            subresources: SubresourceSet::All,
            sparse,
            msaa_array: None,
        })))
    }

    // -----------------------------------------------------------------------
    // Acceleration structures
    // -----------------------------------------------------------------------

    fn serialise_acceleration_structure<S: Serialiser + ?Sized>(
        &self,
        ser: &mut S,
        id: ResourceId,
        info: &AccelStructInfo,
        contents: &mut Option<InitialContents>,
    ) -> Result<()> {
        let accel = match contents {
            Some(InitialContents::AccelerationStructure(accel)) => Some(&*accel),
            _ => None,
        };
        let mut opaque = matches!(accel, Some(AccelContents::Blob { .. }));
        ser.serialise_bool(&mut opaque)?;

        if opaque {
            let mut bytes = match accel {
                Some(AccelContents::Blob { buffer, len }) => match buffer.read() {
                    Ok(mut bytes) => {
                        bytes.truncate(*len as usize);
                        bytes
                    }
                    Err(e) => {
                        self.degrade(id, "Serialise", &Error::map(id, e));
                        Vec::new()
                    }
                },
                _ => Vec::new(),
            };
            let mut len = bytes.len() as u64;
            ser.serialise_u64(&mut len)?;
            ser.serialise_raw(&mut bytes, len)?;
            if ser.is_reading() {
                *contents = Some(InitialContents::AccelerationStructure(self.load_blob(id, bytes)?));
            }
            return Ok(());
        }

        let data = match accel {
            Some(AccelContents::Build { data }) => Some(Arc::clone(data)),
            _ => None,
        };
        let mut recipe = data.as_ref().map(|d| d.recipe().clone()).unwrap_or_default();
        recipe.serialise(ser)?;
        if ser.is_reading() && recipe.ty != info.ty {
            log::warn!("{} registered as {:?} but captured as {:?}", id, info.ty, recipe.ty);
        }

        let mut bytes = match &data {
            Some(data) => {
                if !data.is_complete() {
                    self.device.wait_idle().map_err(Error::from)?;
                    self.rt.tick();
                }
                data.read_bytes()?
            }
            None => Vec::new(),
        };
        let mut len = bytes.len() as u64;
        ser.serialise_u64(&mut len)?;
        ser.serialise_raw(&mut bytes, len)?;

        if ser.is_reading() {
            let data = self.rt.load_build_data(recipe, &bytes)?;
            *contents = Some(InitialContents::AccelerationStructure(AccelContents::Build { data }));
        }
        Ok(())
    }

    /// Validate, patch and upload a driver-serialised structure
    fn load_blob(&self, id: ResourceId, mut bytes: Vec<u8>) -> Result<AccelContents> {
        let header = read_serialized_header(&bytes)?;
        if !self.device.check_serialized_compatibility(&header) {
            let err = Error::HardwareIncompatibility(format!("{id} was serialised by a different driver"));
            self.report_fatal(err.result_code(), err.to_string());
            return Err(err);
        }

        let summary = {
            let registry = self.registry();
            patch_serialized_blob(&mut bytes, |address| live_address(&registry, self.device.as_ref(), address))?
        };
        if summary.zeroed > 0 {
            log::warn!("{}: {} BLAS references could not be resolved", id, summary.zeroed);
        }

        let buffer = self
            .allocator
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, bytes.len() as u64, AS_BLOB_ALIGNMENT)
            .map_err(|e| Error::creation(id, "AS blob upload", e))?;
        buffer.write(0, &bytes).map_err(|e| Error::map(id, e))?;
        Ok(AccelContents::Blob { buffer, len: bytes.len() as u64 })
    }

    // -----------------------------------------------------------------------
    // GetSize
    // -----------------------------------------------------------------------

    /// Upper bound on the bytes [`ResourceManager::serialise_initial_state`] writes for `id`
    pub fn get_size_initial_state(&self, id: ResourceId) -> u64 {
        let contents = super::manager::lock(&self.contents);
        let Some(contents) = contents.get(&id) else {
            return 0;
        };
        let header = INITIAL_STATE_HEADER_SIZE + SERIALISE_ALIGNMENT;

        let body = match contents {
            InitialContents::DescriptorHeap(HeapContents::Snapshot { descriptors, names }) => {
                let names: u64 = names.iter().map(|n| 4 + n.len() as u64).sum();
                8 + descriptors.len() as u64 * DESCRIPTOR_SERIALISED_BOUND + 4 + 8 + names
            }
            InitialContents::DescriptorHeap(_) => 8 + 4 + 8,
            InitialContents::Resource(ResourceContents::AccelerationStructureBuffer) => 0,
            InitialContents::Resource(resource) => {
                let (subresources, table, content) = match resource {
                    ResourceContents::Copy { source, subresources, sparse, .. } => {
                        let content = match source {
                            CopySource::Buffer { len, .. } => *len,
                            CopySource::Cpu(bytes) => bytes.len() as u64,
                            CopySource::Resource(_) => 0,
                        };
                        (subresources.serialised_size(), sparse.table(), content)
                    }
                    ResourceContents::MapDirect { bytes } => (SubresourceSet::All.serialised_size(), None, bytes.len() as u64),
                    ResourceContents::ForceCopy { sparse, .. } => (SubresourceSet::All.serialised_size(), sparse.table(), 0),
                    ResourceContents::AccelerationStructureBuffer => (0, None, 0),
                };
                let table = table.map(|t| 16 + t.serialised_size()).unwrap_or(0);
                SERIALISE_ALIGNMENT + subresources + 1 + table + 8 + content
            }
            InitialContents::AccelerationStructure(AccelContents::Blob { len, .. }) => SERIALISE_ALIGNMENT + 1 + 8 + len,
            InitialContents::AccelerationStructure(AccelContents::Build { data }) => {
                SERIALISE_ALIGNMENT
                    + SERIALISE_ALIGNMENT
                    + GEOMETRY_SERIALISED_BOUND * data.recipe().geometries.len() as u64
                    + SERIALISE_ALIGNMENT
                    + data.byte_size()
            }
        };
        header + body
    }

    // -----------------------------------------------------------------------
    // Capture files
    // -----------------------------------------------------------------------

    /// Write one initial-state chunk per resource holding contents
    ///
    /// Pending snapshot copies and AS builds are drained first. Resources
    /// that fail are logged and left out. Returns the number of chunks.
    pub fn write_initial_states<W: Write>(&self, writer: &mut CaptureWriter<W>) -> Result<usize> {
        self.flush_pending_commands()?;
        self.device.wait_idle().map_err(Error::from)?;
        self.rt.tick();
        self.rt.flush();

        let mut written = 0;
        for id in self.ids_with_initial_contents() {
            let estimate = self.get_size_initial_state(id);
            let mut payload = Vec::with_capacity(estimate as usize);
            let mut ser = WriteSerialiser::with_version(&mut payload, writer.version());
            if let Err(err) = self.serialise_initial_state(&mut ser, id) {
                self.degrade(id, "Serialise", &err);
                continue;
            }
            if ser.bytes_written() > estimate {
                log::warn!("{} wrote {} bytes, over its {} byte estimate", id, ser.bytes_written(), estimate);
            }
            writer.write_chunk(ChunkType::InitialContents, &payload)?;
            written += 1;
        }
        log::info!("Wrote {} initial states at version {:#x}", written, writer.version());
        Ok(written)
    }

    /// Read every initial-state chunk of a capture
    ///
    /// A chunk that fails to load leaves its resource without contents. A
    /// fatal error stops loading and is returned.
    pub fn load_initial_states(&self, reader: &CaptureReader) -> Result<LoadSummary> {
        self.set_state(CaptureState::LoadingReplaying);
        let mut summary = LoadSummary::default();
        for chunk in reader.chunks() {
            let chunk = chunk?;
            if chunk.chunk_type() != Some(ChunkType::InitialContents) {
                continue;
            }
            let mut ser = ReadSerialiser::new(chunk.payload, reader.version());
            match self.serialise_initial_state(&mut ser, ResourceId::NULL) {
                Ok(_) => summary.loaded += 1,
                Err(err) if err.is_fatal() => {
                    self.report_fatal(err.result_code(), err.to_string());
                    return Err(err);
                }
                Err(err) => {
                    log::warn!("Skipping initial-state chunk: {}", err);
                    summary.failed += 1;
                }
            }
        }
        log::info!("Loaded {} initial states ({} failed)", summary.loaded, summary.failed);
        Ok(summary)
    }
}
