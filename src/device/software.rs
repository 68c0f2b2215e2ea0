//! In-memory device
//!
//! Executes every command on the CPU against plain byte storage. Buffers get
//! GPU virtual addresses from a bump allocator, textures keep one tightly
//! packed allocation per subresource (all samples back to back), and
//! acceleration structures are recorded as inspectable [`BuiltStructure`]s.
//! Completion is immediate unless paused, which lets tests observe fences
//! in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::accel::{
    is_absent_address, AsCopyMode, AsType, BuildInputs, GeometryKind, InstanceDesc, PrebuildInfo, SerializedAsHeader,
    INSTANCE_DESC_SIZE, SERIALIZED_HEADER_SIZE,
};
use crate::core::{align_up, DeviceError};
use crate::device::{CopyLocation, DeviceResult, GpuCommand, GpuDevice, NativeDescriptor, NativeHandle};
use crate::resource::{Descriptor, DescriptorHeapKind, HeapType, PlacedFootprint, ResourceDesc};
use crate::sparse::SparseBind;

const ADDRESS_BASE: u64 = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 64 * 1024;
const DEFAULT_DRIVER_ID: &[u8] = b"gpusnap software device v1";

/// An acceleration structure as the software device understands it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltStructure {
    pub ty: AsType,
    pub geometry_count: u32,
    /// FNV-1a over every geometry byte the build read
    pub content_hash: u64,
    /// BLAS addresses referenced by a TLAS, in instance order
    pub instances: Vec<u64>,
}

struct SoftResource {
    desc: ResourceDesc,
    heap: HeapType,
    address: u64,
    resident: bool,
    data: Vec<u8>,
    subresources: Vec<Vec<u8>>,
    tile_binds: Vec<SparseBind<NativeHandle>>,
}

struct SoftHeap {
    #[allow(dead_code)]
    kind: DescriptorHeapKind,
    slots: Vec<NativeDescriptor>,
}

enum Object {
    Resource(SoftResource),
    DescriptorHeap(SoftHeap),
}

struct State {
    next_handle: u64,
    next_address: u64,
    objects: HashMap<NativeHandle, Object>,
    addresses: BTreeMap<u64, NativeHandle>,
    structures: BTreeMap<u64, BuiltStructure>,
    submitted: u64,
    completed: u64,
    completion_paused: bool,
    failing_creates: u32,
    failing_maps: bool,
    removed: bool,
    driver_id: [u8; 32],
}

/// CPU-backed [`GpuDevice`]
pub struct SoftwareDevice {
    state: Mutex<State>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(hash, |h, b| (h ^ u64::from(*b)).wrapping_mul(0x100_0000_01b3))
}

fn invalid(msg: impl Into<String>) -> DeviceError {
    DeviceError::InvalidCommand(msg.into())
}

impl State {
    fn resource(&self, handle: NativeHandle) -> DeviceResult<&SoftResource> {
        match self.objects.get(&handle) {
            Some(Object::Resource(res)) => Ok(res),
            _ => Err(DeviceError::InvalidHandle(handle.0)),
        }
    }

    fn resource_mut(&mut self, handle: NativeHandle) -> DeviceResult<&mut SoftResource> {
        match self.objects.get_mut(&handle) {
            Some(Object::Resource(res)) => Ok(res),
            _ => Err(DeviceError::InvalidHandle(handle.0)),
        }
    }

    fn heap_mut(&mut self, handle: NativeHandle) -> DeviceResult<&mut SoftHeap> {
        match self.objects.get_mut(&handle) {
            Some(Object::DescriptorHeap(heap)) => Ok(heap),
            _ => Err(DeviceError::InvalidHandle(handle.0)),
        }
    }

    /// Resource used by a GPU command; must be resident
    fn gpu_resource(&self, handle: NativeHandle) -> DeviceResult<&SoftResource> {
        let res = self.resource(handle)?;
        if !res.resident {
            return Err(invalid(format!("{handle} used by the GPU while evicted")));
        }
        Ok(res)
    }

    fn gpu_resource_mut(&mut self, handle: NativeHandle) -> DeviceResult<&mut SoftResource> {
        let res = self.resource_mut(handle)?;
        if !res.resident {
            return Err(invalid(format!("{handle} used by the GPU while evicted")));
        }
        Ok(res)
    }

    fn locate(&self, address: u64, len: u64) -> DeviceResult<(NativeHandle, u64)> {
        let (base, handle) = self
            .addresses
            .range(..=address)
            .next_back()
            .ok_or_else(|| invalid(format!("address {address:#x} is not in any buffer")))?;
        let offset = address - base;
        let res = self.resource(*handle)?;
        if offset + len > res.data.len() as u64 {
            return Err(invalid(format!("{len} bytes at {address:#x} overrun the buffer")));
        }
        Ok((*handle, offset))
    }

    fn read_address(&self, address: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let (handle, offset) = self.locate(address, len)?;
        let res = self.gpu_resource(handle)?;
        Ok(res.data[offset as usize..(offset + len) as usize].to_vec())
    }

    fn write_address(&mut self, address: u64, bytes: &[u8]) -> DeviceResult<()> {
        let (handle, offset) = self.locate(address, bytes.len() as u64)?;
        let res = self.gpu_resource_mut(handle)?;
        res.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn buffer_range(&self, handle: NativeHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let res = self.gpu_resource(handle)?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= res.data.len() as u64)
            .ok_or_else(|| invalid(format!("{len} bytes at {offset} overrun {handle}")))?;
        Ok(res.data[offset as usize..end as usize].to_vec())
    }

    fn write_buffer_range(&mut self, handle: NativeHandle, offset: u64, bytes: &[u8]) -> DeviceResult<()> {
        let res = self.gpu_resource_mut(handle)?;
        let end = offset as usize + bytes.len();
        if end > res.data.len() {
            return Err(invalid(format!("{} bytes at {offset} overrun {handle}", bytes.len())));
        }
        res.data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn run(&mut self, command: GpuCommand) -> DeviceResult<()> {
        match command {
            GpuCommand::CopyBufferRegion { dst, dst_offset, src, src_offset, size } => {
                let bytes = self.buffer_range(src, src_offset, size)?;
                self.write_buffer_range(dst, dst_offset, &bytes)
            }
            GpuCommand::CopyResource { dst, src } => self.copy_resource(dst, src),
            GpuCommand::CopyTextureRegion { dst, src } => self.copy_texture_region(dst, src),
            GpuCommand::ExpandMsaaToArray { dst, src } => self.expand_msaa(dst, src),
            GpuCommand::CollapseArrayToMsaa { dst, src } => self.collapse_msaa(dst, src),
            GpuCommand::UpdateTileMappings { resource, binds } => {
                self.resource_mut(resource)?.tile_binds.extend(binds);
                Ok(())
            }
            GpuCommand::UnmapAllTiles { resource } => {
                self.resource_mut(resource)?.tile_binds.clear();
                Ok(())
            }
            GpuCommand::CopyDescriptors { dst_heap, src_heap, count } => {
                let slots: Vec<NativeDescriptor> = match self.objects.get(&src_heap) {
                    Some(Object::DescriptorHeap(heap)) => {
                        heap.slots.iter().take(count as usize).copied().collect()
                    }
                    _ => return Err(DeviceError::InvalidHandle(src_heap.0)),
                };
                let dst = self.heap_mut(dst_heap)?;
                if slots.len() > dst.slots.len() {
                    return Err(invalid("descriptor copy overruns destination heap"));
                }
                dst.slots[..slots.len()].copy_from_slice(&slots);
                Ok(())
            }
            GpuCommand::BuildAccelerationStructure { dest, inputs, .. } => {
                self.locate(dest, 1)?;
                let built = self.build(&inputs)?;
                self.structures.insert(dest, built);
                Ok(())
            }
            GpuCommand::CopyAccelerationStructure { dest, source, mode } => match mode {
                AsCopyMode::Clone => {
                    let built = self
                        .structures
                        .get(&source)
                        .cloned()
                        .ok_or_else(|| invalid(format!("no structure at {source:#x}")))?;
                    self.locate(dest, 1)?;
                    self.structures.insert(dest, built);
                    Ok(())
                }
                AsCopyMode::Serialize => {
                    let built = self
                        .structures
                        .get(&source)
                        .cloned()
                        .ok_or_else(|| invalid(format!("no structure at {source:#x}")))?;
                    let blob = serialize_structure(&self.driver_id, &built);
                    self.write_address(dest, &blob)
                }
                AsCopyMode::Deserialize => {
                    let built = self.deserialize_structure(source)?;
                    self.locate(dest, 1)?;
                    self.structures.insert(dest, built);
                    Ok(())
                }
            },
        }
    }

    fn copy_resource(&mut self, dst: NativeHandle, src: NativeHandle) -> DeviceResult<()> {
        let (data, subresources) = {
            let res = self.gpu_resource(src)?;
            (res.data.clone(), res.subresources.clone())
        };
        let dst_res = self.gpu_resource_mut(dst)?;
        if dst_res.desc.is_buffer() {
            let n = data.len().min(dst_res.data.len());
            dst_res.data[..n].copy_from_slice(&data[..n]);
            return Ok(());
        }
        let shapes_match = subresources.len() == dst_res.subresources.len()
            && subresources.iter().zip(&dst_res.subresources).all(|(a, b)| a.len() == b.len());
        if !shapes_match {
            return Err(invalid("copy between textures of different shape"));
        }
        dst_res.subresources = subresources;
        Ok(())
    }

    fn copy_texture_region(&mut self, dst: CopyLocation, src: CopyLocation) -> DeviceResult<()> {
        match (dst, src) {
            (CopyLocation::Subresource { resource, subresource }, CopyLocation::Footprint { buffer, footprint }) => {
                let packed = {
                    let buf = self.gpu_resource(buffer)?;
                    unpack_rows(&buf.data, &footprint)?
                };
                let tex = self.gpu_resource_mut(resource)?;
                let slot = tex
                    .subresources
                    .get_mut(subresource as usize)
                    .ok_or_else(|| invalid(format!("subresource {subresource} out of range")))?;
                if slot.len() != packed.len() {
                    return Err(invalid("footprint does not match destination subresource"));
                }
                *slot = packed;
                Ok(())
            }
            (CopyLocation::Footprint { buffer, footprint }, CopyLocation::Subresource { resource, subresource }) => {
                let packed = self
                    .gpu_resource(resource)?
                    .subresources
                    .get(subresource as usize)
                    .cloned()
                    .ok_or_else(|| invalid(format!("subresource {subresource} out of range")))?;
                let buf = self.gpu_resource_mut(buffer)?;
                pack_rows(&mut buf.data, &footprint, &packed)
            }
            _ => Err(invalid("texture copy needs one footprint and one subresource")),
        }
    }

    fn expand_msaa(&mut self, dst: NativeHandle, src: NativeHandle) -> DeviceResult<()> {
        let (src_desc, src_subs) = {
            let res = self.gpu_resource(src)?;
            (res.desc, res.subresources.clone())
        };
        let samples = src_desc.sample_count.max(1) as usize;
        let dst_res = self.gpu_resource_mut(dst)?;
        let dst_desc = dst_res.desc;
        for (index, data) in src_subs.iter().enumerate() {
            let sub = src_desc.decompose(index as u32);
            let chunk = data.len() / samples;
            for sample in 0..samples {
                let target = dst_desc.subresource_index(sub.mip, sub.array_slice * samples as u32 + sample as u32, sub.plane);
                let slot = dst_res
                    .subresources
                    .get_mut(target as usize)
                    .ok_or_else(|| invalid("array texture too small for MSAA expansion"))?;
                if slot.len() != chunk {
                    return Err(invalid("array slice size does not match sample size"));
                }
                slot.copy_from_slice(&data[sample * chunk..(sample + 1) * chunk]);
            }
        }
        Ok(())
    }

    fn collapse_msaa(&mut self, dst: NativeHandle, src: NativeHandle) -> DeviceResult<()> {
        let (src_desc, src_subs) = {
            let res = self.gpu_resource(src)?;
            (res.desc, res.subresources.clone())
        };
        let dst_res = self.gpu_resource_mut(dst)?;
        let dst_desc = dst_res.desc;
        let samples = dst_desc.sample_count.max(1);
        for (index, slot) in dst_res.subresources.iter_mut().enumerate() {
            let sub = dst_desc.decompose(index as u32);
            let mut gathered = Vec::with_capacity(slot.len());
            for sample in 0..samples {
                let source = src_desc.subresource_index(sub.mip, sub.array_slice * samples + sample, sub.plane);
                let data = src_subs
                    .get(source as usize)
                    .ok_or_else(|| invalid("array texture too small for MSAA collapse"))?;
                gathered.extend_from_slice(data);
            }
            if gathered.len() != slot.len() {
                return Err(invalid("array slices do not match MSAA subresource size"));
            }
            *slot = gathered;
        }
        Ok(())
    }

    fn build(&self, inputs: &BuildInputs) -> DeviceResult<BuiltStructure> {
        match inputs.ty {
            AsType::BottomLevel => {
                let mut hash = 0xcbf2_9ce4_8422_2325u64;
                for geom in &inputs.geometries {
                    match geom.kind {
                        GeometryKind::Triangles(tri) => {
                            let vertex_bytes = u64::from(tri.vertex_count) * tri.vertex_buffer.stride;
                            hash = fnv1a(hash, &self.read_address(tri.vertex_buffer.address, vertex_bytes)?);
                            if !is_absent_address(tri.index_buffer) {
                                let index_bytes = u64::from(tri.index_count) * tri.index_format.size();
                                hash = fnv1a(hash, &self.read_address(tri.index_buffer, index_bytes)?);
                            }
                            if !is_absent_address(tri.transform) {
                                hash = fnv1a(hash, &self.read_address(tri.transform, 48)?);
                            }
                        }
                        GeometryKind::Aabbs(aabbs) => {
                            if !is_absent_address(aabbs.aabbs.address) {
                                let bytes = aabbs.count * aabbs.aabbs.stride;
                                hash = fnv1a(hash, &self.read_address(aabbs.aabbs.address, bytes)?);
                            }
                        }
                    }
                }
                Ok(BuiltStructure {
                    ty: AsType::BottomLevel,
                    geometry_count: inputs.geometries.len() as u32,
                    content_hash: hash,
                    instances: Vec::new(),
                })
            }
            AsType::TopLevel => {
                let bytes = if inputs.num_instances == 0 {
                    Vec::new()
                } else {
                    self.read_address(inputs.instance_descs, u64::from(inputs.num_instances) * INSTANCE_DESC_SIZE)?
                };
                let instances = bytes
                    .chunks_exact(INSTANCE_DESC_SIZE as usize)
                    .map(|chunk| bytemuck::pod_read_unaligned::<InstanceDesc>(chunk).acceleration_structure)
                    .collect();
                Ok(BuiltStructure {
                    ty: AsType::TopLevel,
                    geometry_count: 0,
                    content_hash: fnv1a(0xcbf2_9ce4_8422_2325, &bytes),
                    instances,
                })
            }
        }
    }

    fn deserialize_structure(&self, source: u64) -> DeviceResult<BuiltStructure> {
        let header_bytes = self.read_address(source, SERIALIZED_HEADER_SIZE as u64)?;
        let header: SerializedAsHeader = bytemuck::pod_read_unaligned(&header_bytes);
        if header.driver_id != self.driver_id {
            return Err(invalid("serialised structure was produced by another driver"));
        }
        let body_len = header.num_blas * 8 + 16;
        let body = self.read_address(source + SERIALIZED_HEADER_SIZE as u64, body_len)?;
        let (addresses, tail) = body.split_at(header.num_blas as usize * 8);
        let instances = addresses
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect();
        let ty = if u32::from_le_bytes(tail[0..4].try_into().unwrap_or_default()) == AsType::BottomLevel as u32 {
            AsType::BottomLevel
        } else {
            AsType::TopLevel
        };
        Ok(BuiltStructure {
            ty,
            geometry_count: u32::from_le_bytes(tail[4..8].try_into().unwrap_or_default()),
            content_hash: u64::from_le_bytes(tail[8..16].try_into().unwrap_or_default()),
            instances,
        })
    }
}

fn serialized_size(built: &BuiltStructure) -> u64 {
    SERIALIZED_HEADER_SIZE as u64 + built.instances.len() as u64 * 8 + 16
}

fn serialize_structure(driver_id: &[u8; 32], built: &BuiltStructure) -> Vec<u8> {
    let size = serialized_size(built);
    let header = SerializedAsHeader {
        driver_id: *driver_id,
        serialized_size: size,
        deserialized_size: size,
        num_blas: built.instances.len() as u64,
    };
    let mut blob = Vec::with_capacity(size as usize);
    blob.extend_from_slice(bytemuck::bytes_of(&header));
    for address in &built.instances {
        blob.extend_from_slice(&address.to_le_bytes());
    }
    blob.extend_from_slice(&(built.ty as u32).to_le_bytes());
    blob.extend_from_slice(&built.geometry_count.to_le_bytes());
    blob.extend_from_slice(&built.content_hash.to_le_bytes());
    blob
}

fn unpack_rows(buffer: &[u8], fp: &PlacedFootprint) -> DeviceResult<Vec<u8>> {
    let mut packed = Vec::with_capacity(fp.tight_bytes() as usize);
    for row in 0..u64::from(fp.num_rows) * u64::from(fp.depth) {
        let start = (fp.offset + row * fp.row_pitch) as usize;
        let end = start + fp.row_size as usize;
        let src = buffer
            .get(start..end)
            .ok_or_else(|| invalid("footprint overruns source buffer"))?;
        packed.extend_from_slice(src);
    }
    Ok(packed)
}

fn pack_rows(buffer: &mut [u8], fp: &PlacedFootprint, packed: &[u8]) -> DeviceResult<()> {
    if packed.len() as u64 != fp.tight_bytes() {
        return Err(invalid("footprint does not match source subresource"));
    }
    for (row, src) in packed.chunks_exact(fp.row_size.max(1) as usize).enumerate() {
        let start = (fp.offset + row as u64 * fp.row_pitch) as usize;
        let dst = buffer
            .get_mut(start..start + src.len())
            .ok_or_else(|| invalid("footprint overruns destination buffer"))?;
        dst.copy_from_slice(src);
    }
    Ok(())
}

impl SoftwareDevice {
    pub fn new() -> Self {
        let mut driver_id = [0u8; 32];
        driver_id[..DEFAULT_DRIVER_ID.len()].copy_from_slice(DEFAULT_DRIVER_ID);
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                next_address: ADDRESS_BASE,
                objects: HashMap::new(),
                addresses: BTreeMap::new(),
                structures: BTreeMap::new(),
                submitted: 0,
                completed: 0,
                completion_paused: false,
                failing_creates: 0,
                failing_maps: false,
                removed: false,
                driver_id,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Failure injection ---

    /// Make the next `count` object creations fail with out-of-memory
    pub fn fail_next_creates(&self, count: u32) {
        self.state().failing_creates = count;
    }

    /// Make every map fail
    pub fn fail_maps(&self, fail: bool) {
        self.state().failing_maps = fail;
    }

    /// Simulate device removal
    pub fn remove_device(&self) {
        self.state().removed = true;
    }

    /// Hold the completed fence value while submissions continue
    pub fn pause_completion(&self, paused: bool) {
        let mut state = self.state();
        state.completion_paused = paused;
        if !paused {
            state.completed = state.submitted;
        }
    }

    pub fn set_driver_id(&self, driver_id: [u8; 32]) {
        self.state().driver_id = driver_id;
    }

    pub fn driver_id(&self) -> [u8; 32] {
        self.state().driver_id
    }

    // --- Inspection and direct access ---

    /// Write bytes into any buffer, ignoring heap visibility
    pub fn fill_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state();
        let res = state.resource_mut(handle)?;
        let end = offset as usize + data.len();
        if end > res.data.len() {
            return Err(invalid("fill overruns buffer"));
        }
        res.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn buffer_contents(&self, handle: NativeHandle) -> Option<Vec<u8>> {
        self.state().resource(handle).ok().map(|r| r.data.clone())
    }

    /// Overwrite a texture subresource (all samples, tightly packed)
    pub fn fill_subresource(&self, handle: NativeHandle, subresource: u32, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state();
        let res = state.resource_mut(handle)?;
        let slot = res
            .subresources
            .get_mut(subresource as usize)
            .ok_or_else(|| invalid("subresource out of range"))?;
        if slot.len() != data.len() {
            return Err(invalid(format!("expected {} bytes, got {}", slot.len(), data.len())));
        }
        slot.copy_from_slice(data);
        Ok(())
    }

    pub fn subresource_contents(&self, handle: NativeHandle, subresource: u32) -> Option<Vec<u8>> {
        let state = self.state();
        let res = state.resource(handle).ok()?;
        res.subresources.get(subresource as usize).cloned()
    }

    pub fn resource_desc(&self, handle: NativeHandle) -> Option<ResourceDesc> {
        self.state().resource(handle).ok().map(|r| r.desc)
    }

    pub fn heap_type(&self, handle: NativeHandle) -> Option<HeapType> {
        self.state().resource(handle).ok().map(|r| r.heap)
    }

    pub fn tile_binds(&self, handle: NativeHandle) -> Vec<SparseBind<NativeHandle>> {
        self.state().resource(handle).map(|r| r.tile_binds.clone()).unwrap_or_default()
    }

    pub fn descriptors(&self, heap: NativeHandle) -> Vec<NativeDescriptor> {
        match self.state().objects.get(&heap) {
            Some(Object::DescriptorHeap(heap)) => heap.slots.clone(),
            _ => Vec::new(),
        }
    }

    pub fn built_structure(&self, address: u64) -> Option<BuiltStructure> {
        self.state().structures.get(&address).cloned()
    }

    pub fn is_resident(&self, handle: NativeHandle) -> Option<bool> {
        self.state().resource(handle).ok().map(|r| r.resident)
    }

    /// Number of live objects
    pub fn live_objects(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_alive(&self, handle: NativeHandle) -> bool {
        self.state().objects.contains_key(&handle)
    }
}

impl GpuDevice for SoftwareDevice {
    fn name(&self) -> &str {
        "software"
    }

    fn create_resource(&self, desc: &ResourceDesc, heap: HeapType) -> DeviceResult<NativeHandle> {
        let mut state = self.state();
        if state.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(DeviceError::OutOfMemory);
        }

        let handle = NativeHandle(state.next_handle);
        state.next_handle += 1;

        let mut resource = SoftResource {
            desc: *desc,
            heap,
            address: 0,
            resident: true,
            data: Vec::new(),
            subresources: Vec::new(),
            tile_binds: Vec::new(),
        };

        if desc.is_buffer() {
            resource.data = vec![0; desc.width as usize];
            resource.address = state.next_address;
            state.next_address += align_up(desc.width.max(1), ADDRESS_ALIGNMENT);
            state.addresses.insert(resource.address, handle);
        } else {
            let samples = desc.sample_count.max(1) as usize;
            resource.subresources = (0..desc.subresource_count(true))
                .map(|sub| vec![0; desc.footprint(sub, 0).tight_bytes() as usize * samples])
                .collect();
        }

        state.objects.insert(handle, Object::Resource(resource));
        Ok(handle)
    }

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, count: u32) -> DeviceResult<NativeHandle> {
        let mut state = self.state();
        if state.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(DeviceError::OutOfMemory);
        }
        let handle = NativeHandle(state.next_handle);
        state.next_handle += 1;
        state.objects.insert(
            handle,
            Object::DescriptorHeap(SoftHeap { kind, slots: vec![Descriptor::Undefined; count as usize] }),
        );
        Ok(handle)
    }

    fn release(&self, handle: NativeHandle) {
        let mut state = self.state();
        if let Some(Object::Resource(res)) = state.objects.remove(&handle) {
            if res.desc.is_buffer() {
                state.addresses.remove(&res.address);
                let end = res.address + res.data.len() as u64;
                state.structures.retain(|addr, _| *addr < res.address || *addr >= end);
            }
        }
    }

    fn gpu_address(&self, handle: NativeHandle) -> u64 {
        self.state().resource(handle).map(|r| r.address).unwrap_or(0)
    }

    fn read_buffer(&self, handle: NativeHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let state = self.state();
        let res = state.resource(handle)?;
        if state.failing_maps || res.heap == HeapType::Default || !res.desc.is_buffer() {
            return Err(DeviceError::MapFailed(handle.0));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= res.data.len() as u64)
            .ok_or_else(|| invalid("map range overruns buffer"))?;
        Ok(res.data[offset as usize..end as usize].to_vec())
    }

    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state();
        let failing = state.failing_maps;
        let res = state.resource_mut(handle)?;
        if failing || res.heap == HeapType::Default || !res.desc.is_buffer() {
            return Err(DeviceError::MapFailed(handle.0));
        }
        let end = offset as usize + data.len();
        if end > res.data.len() {
            return Err(invalid("map range overruns buffer"));
        }
        res.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn write_subresource(&self, handle: NativeHandle, subresource: u32, data: &[u8]) -> DeviceResult<()> {
        {
            let state = self.state();
            let res = state.resource(handle)?;
            if state.failing_maps || !res.heap.is_cpu_written() {
                return Err(DeviceError::MapFailed(handle.0));
            }
        }
        self.fill_subresource(handle, subresource, data)
    }

    fn write_descriptors(&self, heap: NativeHandle, first: u32, descriptors: &[NativeDescriptor]) -> DeviceResult<()> {
        let mut state = self.state();
        let heap = state.heap_mut(heap)?;
        let start = first as usize;
        let end = start + descriptors.len();
        if end > heap.slots.len() {
            return Err(invalid("descriptor write overruns heap"));
        }
        heap.slots[start..end].copy_from_slice(descriptors);
        Ok(())
    }

    fn execute(&self, commands: Vec<GpuCommand>) -> DeviceResult<u64> {
        let mut state = self.state();
        if state.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        for command in commands {
            state.run(command)?;
        }
        state.submitted += 1;
        if !state.completion_paused {
            state.completed = state.submitted;
        }
        Ok(state.submitted)
    }

    fn submitted_fence(&self) -> u64 {
        self.state().submitted
    }

    fn completed_fence(&self) -> u64 {
        self.state().completed
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        let mut state = self.state();
        if state.removed {
            return Err(DeviceError::DeviceRemoved);
        }
        state.completed = state.submitted;
        Ok(())
    }

    fn make_resident(&self, handle: NativeHandle) -> DeviceResult<()> {
        self.state().resource_mut(handle)?.resident = true;
        Ok(())
    }

    fn evict(&self, handle: NativeHandle) -> DeviceResult<()> {
        self.state().resource_mut(handle)?.resident = false;
        Ok(())
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo {
        let payload: u64 = match inputs.ty {
            AsType::BottomLevel => inputs
                .geometries
                .iter()
                .map(|g| match g.kind {
                    GeometryKind::Triangles(tri) => u64::from(tri.vertex_count) * 32,
                    GeometryKind::Aabbs(aabbs) => aabbs.count * 32,
                })
                .sum(),
            AsType::TopLevel => u64::from(inputs.num_instances) * INSTANCE_DESC_SIZE,
        };
        let result_max_size = align_up(1024 + payload, 256);
        PrebuildInfo { result_max_size, scratch_size: align_up(result_max_size / 2, 256) }
    }

    fn serialized_as_size(&self, address: u64) -> DeviceResult<(u64, u64)> {
        let state = self.state();
        let built = state
            .structures
            .get(&address)
            .ok_or_else(|| invalid(format!("no structure at {address:#x}")))?;
        Ok((serialized_size(built), built.instances.len() as u64))
    }

    fn check_serialized_compatibility(&self, header: &SerializedAsHeader) -> bool {
        header.driver_id == self.state().driver_id
    }
}
