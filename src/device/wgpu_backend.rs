//! wgpu-backed device
//!
//! Covers buffers and single-sampled 2D textures in uncompressed formats.
//! wgpu has no GPU virtual addresses, reserved resources, descriptor heaps
//! or ray-tracing copies: addresses are assigned from a private range, heaps
//! are shadowed on the CPU, and the rest reports
//! [`DeviceError::Unsupported`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::accel::{BuildInputs, PrebuildInfo, SerializedAsHeader};
use crate::core::{DeviceError, Error, Result};
use crate::device::{CopyLocation, DeviceResult, GpuCommand, GpuDevice, NativeDescriptor, NativeHandle};
use crate::resource::{Descriptor, DescriptorHeapKind, Dimension, Format, HeapType, ResourceDesc};

/// Base of the synthetic address range handed out for buffers
const ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Alignment of synthetic buffer addresses
const ADDRESS_ALIGNMENT: u64 = 64 * 1024;

enum Object {
    Buffer { buffer: wgpu::Buffer, heap: HeapType, size: u64, address: u64 },
    Texture { texture: wgpu::Texture, desc: ResourceDesc },
    DescriptorHeap(Vec<NativeDescriptor>),
}

struct State {
    next_handle: u64,
    next_address: u64,
    objects: HashMap<u64, Object>,
    submitted: u64,
}

/// [`GpuDevice`] on top of a wgpu device and queue
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    state: Mutex<State>,
    completed: Arc<AtomicU64>,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, name: impl Into<String>) -> Self {
        Self {
            device,
            queue,
            name: name.into(),
            state: Mutex::new(State {
                next_handle: 1,
                next_address: ADDRESS_BASE,
                objects: HashMap::new(),
                submitted: 0,
            }),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the first high-performance adapter without a surface
    pub fn headless() -> Result<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Device(DeviceError::Unsupported(format!("no suitable adapter: {e:?}"))))?;
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpusnap_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_buffer_size: adapter.limits().max_buffer_size,
                    ..Default::default()
                },
                memory_hints: wgpu::MemoryHints::Performance,
                experimental_features: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| Error::Device(DeviceError::Unsupported(e.to_string())))?;
        log::info!("Opened {} ({:?})", info.name, info.backend);
        Ok(Self::new(device, queue, info.name))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, object: Object) -> NativeHandle {
        let mut state = self.state();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(handle, object);
        NativeHandle(handle)
    }

    fn create_buffer(&self, size: u64, heap: HeapType) -> NativeHandle {
        let usage = match heap {
            HeapType::Default => {
                wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::STORAGE
            }
            HeapType::Upload | HeapType::CpuVisible => wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            HeapType::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        };
        // wgpu requires sizes in multiples of COPY_BUFFER_ALIGNMENT
        let padded = size.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpusnap_buffer"),
            size: padded,
            usage,
            mapped_at_creation: false,
        });
        let address = {
            let mut state = self.state();
            let address = state.next_address;
            state.next_address += padded.next_multiple_of(ADDRESS_ALIGNMENT);
            address
        };
        self.insert(Object::Buffer { buffer, heap, size, address })
    }

    fn create_texture(&self, desc: &ResourceDesc) -> DeviceResult<NativeHandle> {
        if desc.dimension != Dimension::Texture2D {
            return Err(DeviceError::Unsupported(format!("{:?} textures", desc.dimension)));
        }
        let format = texture_format(desc.format)?;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("gpusnap_texture"),
            size: wgpu::Extent3d {
                width: desc.width as u32,
                height: desc.height,
                depth_or_array_layers: desc.depth_or_array_size.max(1),
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: desc.sample_count.max(1),
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        Ok(self.insert(Object::Texture { texture, desc: *desc }))
    }

    fn map_read(&self, buffer: &wgpu::Buffer, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let slice = buffer.slice(offset..offset + len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|_| DeviceError::DeviceRemoved)?;
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(DeviceError::MapFailed(offset)),
        }
        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn encode(&self, state: &State, encoder: &mut wgpu::CommandEncoder, command: &GpuCommand) -> DeviceResult<()> {
        let buffer = |handle: NativeHandle| match state.objects.get(&handle.0) {
            Some(Object::Buffer { buffer, size, .. }) => Ok((buffer, *size)),
            _ => Err(DeviceError::InvalidHandle(handle.0)),
        };
        let texture = |handle: NativeHandle| match state.objects.get(&handle.0) {
            Some(Object::Texture { texture, desc }) => Ok((texture, *desc)),
            _ => Err(DeviceError::InvalidHandle(handle.0)),
        };

        match command {
            GpuCommand::CopyBufferRegion { dst, dst_offset, src, src_offset, size } => {
                let (dst, _) = buffer(*dst)?;
                let (src, _) = buffer(*src)?;
                encoder.copy_buffer_to_buffer(src, *src_offset, dst, *dst_offset, aligned_copy(*size));
            }
            GpuCommand::CopyResource { dst, src } => match (state.objects.get(&dst.0), state.objects.get(&src.0)) {
                (Some(Object::Buffer { buffer: d, size: ds, .. }), Some(Object::Buffer { buffer: s, size: ss, .. })) => {
                    encoder.copy_buffer_to_buffer(s, 0, d, 0, aligned_copy((*ds).min(*ss)));
                }
                (Some(Object::Texture { texture: d, desc }), Some(Object::Texture { texture: s, .. })) => {
                    for mip in 0..desc.mip_levels.max(1) {
                        encoder.copy_texture_to_texture(
                            texel_copy(s, mip, 0),
                            texel_copy(d, mip, 0),
                            wgpu::Extent3d {
                                width: desc.mip_width(mip),
                                height: desc.mip_height(mip),
                                depth_or_array_layers: desc.array_size(),
                            },
                        );
                    }
                }
                _ => return Err(DeviceError::InvalidCommand(format!("CopyResource {src} -> {dst}"))),
            },
            GpuCommand::CopyTextureRegion { dst, src } => match (dst, src) {
                (CopyLocation::Footprint { buffer: b, footprint }, CopyLocation::Subresource { resource, subresource })
                | (CopyLocation::Subresource { resource, subresource }, CopyLocation::Footprint { buffer: b, footprint }) => {
                    let (buf, _) = buffer(*b)?;
                    let (tex, desc) = texture(*resource)?;
                    let sub = desc.decompose(*subresource);
                    let image = texel_copy(tex, sub.mip, sub.array_slice);
                    let linear = wgpu::TexelCopyBufferInfo {
                        buffer: buf,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: footprint.offset,
                            bytes_per_row: Some(footprint.row_pitch as u32),
                            rows_per_image: Some(footprint.num_rows),
                        },
                    };
                    let extent = wgpu::Extent3d {
                        width: footprint.width,
                        height: footprint.height,
                        depth_or_array_layers: footprint.depth,
                    };
                    if matches!(dst, CopyLocation::Footprint { .. }) {
                        encoder.copy_texture_to_buffer(image, linear, extent);
                    } else {
                        encoder.copy_buffer_to_texture(linear, image, extent);
                    }
                }
                (CopyLocation::Subresource { resource: d, subresource: ds }, CopyLocation::Subresource { resource: s, subresource: ss }) => {
                    let (dt, ddesc) = texture(*d)?;
                    let (st, sdesc) = texture(*s)?;
                    let dsub = ddesc.decompose(*ds);
                    let ssub = sdesc.decompose(*ss);
                    encoder.copy_texture_to_texture(
                        texel_copy(st, ssub.mip, ssub.array_slice),
                        texel_copy(dt, dsub.mip, dsub.array_slice),
                        wgpu::Extent3d {
                            width: sdesc.mip_width(ssub.mip),
                            height: sdesc.mip_height(ssub.mip),
                            depth_or_array_layers: 1,
                        },
                    );
                }
                _ => return Err(DeviceError::InvalidCommand("buffer to buffer texture copy".into())),
            },
            GpuCommand::ExpandMsaaToArray { .. } | GpuCommand::CollapseArrayToMsaa { .. } => {
                return Err(DeviceError::Unsupported("MSAA sample copies".into()));
            }
            GpuCommand::UpdateTileMappings { .. } | GpuCommand::UnmapAllTiles { .. } => {
                return Err(DeviceError::Unsupported("reserved resources".into()));
            }
            GpuCommand::CopyDescriptors { .. } => {}
            GpuCommand::BuildAccelerationStructure { .. } | GpuCommand::CopyAccelerationStructure { .. } => {
                return Err(DeviceError::Unsupported("acceleration structures".into()));
            }
        }
        Ok(())
    }
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_resource(&self, desc: &ResourceDesc, heap: HeapType) -> DeviceResult<NativeHandle> {
        if desc.is_buffer() {
            Ok(self.create_buffer(desc.width, heap))
        } else if heap != HeapType::Default {
            Err(DeviceError::Unsupported("textures in CPU-visible heaps".into()))
        } else {
            self.create_texture(desc)
        }
    }

    fn create_descriptor_heap(&self, _kind: DescriptorHeapKind, count: u32) -> DeviceResult<NativeHandle> {
        Ok(self.insert(Object::DescriptorHeap(vec![Descriptor::Undefined; count as usize])))
    }

    fn release(&self, handle: NativeHandle) {
        match self.state().objects.remove(&handle.0) {
            Some(Object::Buffer { buffer, .. }) => buffer.destroy(),
            Some(Object::Texture { texture, .. }) => texture.destroy(),
            _ => {}
        }
    }

    fn gpu_address(&self, handle: NativeHandle) -> u64 {
        match self.state().objects.get(&handle.0) {
            Some(Object::Buffer { address, .. }) => *address,
            _ => 0,
        }
    }

    fn read_buffer(&self, handle: NativeHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let (buffer, heap, size) = match self.state().objects.get(&handle.0) {
            Some(Object::Buffer { buffer, heap, size, .. }) => (buffer.clone(), *heap, *size),
            _ => return Err(DeviceError::InvalidHandle(handle.0)),
        };
        if offset + len > size {
            return Err(DeviceError::MapFailed(handle.0));
        }
        match heap {
            HeapType::Default => Err(DeviceError::MapFailed(handle.0)),
            HeapType::Readback => self.map_read(&buffer, offset, aligned_copy(len)).map(|mut bytes| {
                bytes.truncate(len as usize);
                bytes
            }),
            HeapType::Upload | HeapType::CpuVisible => {
                // Upload buffers are not mappable for reading; go through a readback copy
                let aligned_offset = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
                let span = aligned_copy(offset + len - aligned_offset);
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("gpusnap_read_staging"),
                    size: span,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpusnap_read_encoder"),
                });
                encoder.copy_buffer_to_buffer(&buffer, aligned_offset, &staging, 0, span);
                self.queue.submit(std::iter::once(encoder.finish()));
                let bytes = self.map_read(&staging, 0, span)?;
                let start = (offset - aligned_offset) as usize;
                Ok(bytes[start..start + len as usize].to_vec())
            }
        }
    }

    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let state = self.state();
        let Some(Object::Buffer { buffer, heap, size, .. }) = state.objects.get(&handle.0) else {
            return Err(DeviceError::InvalidHandle(handle.0));
        };
        if *heap == HeapType::Default || offset + data.len() as u64 > *size {
            return Err(DeviceError::MapFailed(handle.0));
        }
        let mut padded = data.to_vec();
        padded.resize(aligned_copy(data.len() as u64) as usize, 0);
        self.queue.write_buffer(buffer, offset, &padded);
        Ok(())
    }

    fn write_subresource(&self, handle: NativeHandle, _subresource: u32, _data: &[u8]) -> DeviceResult<()> {
        // Textures only live in the default heap here
        Err(DeviceError::MapFailed(handle.0))
    }

    fn write_descriptors(&self, heap: NativeHandle, first: u32, descriptors: &[NativeDescriptor]) -> DeviceResult<()> {
        let mut state = self.state();
        let Some(Object::DescriptorHeap(slots)) = state.objects.get_mut(&heap.0) else {
            return Err(DeviceError::InvalidHandle(heap.0));
        };
        let first = first as usize;
        if first + descriptors.len() > slots.len() {
            return Err(DeviceError::InvalidCommand(format!("descriptor write past the end of {heap}")));
        }
        slots[first..first + descriptors.len()].copy_from_slice(descriptors);
        Ok(())
    }

    fn execute(&self, commands: Vec<GpuCommand>) -> DeviceResult<u64> {
        let mut state = self.state();
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpusnap_encoder"),
        });
        for command in &commands {
            if let GpuCommand::CopyDescriptors { dst_heap, src_heap, count } = command {
                let src = match state.objects.get(&src_heap.0) {
                    Some(Object::DescriptorHeap(slots)) => slots.clone(),
                    _ => return Err(DeviceError::InvalidHandle(src_heap.0)),
                };
                let Some(Object::DescriptorHeap(dst)) = state.objects.get_mut(&dst_heap.0) else {
                    return Err(DeviceError::InvalidHandle(dst_heap.0));
                };
                let count = (*count as usize).min(src.len()).min(dst.len());
                dst[..count].copy_from_slice(&src[..count]);
                continue;
            }
            self.encode(&state, &mut encoder, command)?;
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        state.submitted += 1;
        let fence = state.submitted;
        let completed = self.completed.clone();
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(fence, Ordering::AcqRel);
        });
        Ok(fence)
    }

    fn submitted_fence(&self) -> u64 {
        self.state().submitted
    }

    fn completed_fence(&self) -> u64 {
        self.device.poll(wgpu::PollType::Poll).ok();
        self.completed.load(Ordering::Acquire)
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|_| DeviceError::DeviceRemoved)?;
        let submitted = self.state().submitted;
        self.completed.fetch_max(submitted, Ordering::AcqRel);
        Ok(())
    }

    fn make_resident(&self, _handle: NativeHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn evict(&self, _handle: NativeHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn prebuild_info(&self, _inputs: &BuildInputs) -> PrebuildInfo {
        PrebuildInfo { result_max_size: 0, scratch_size: 0 }
    }

    fn serialized_as_size(&self, _address: u64) -> DeviceResult<(u64, u64)> {
        Err(DeviceError::Unsupported("acceleration structures".into()))
    }

    fn check_serialized_compatibility(&self, _header: &SerializedAsHeader) -> bool {
        false
    }
}

fn aligned_copy(size: u64) -> u64 {
    size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

fn texel_copy(texture: &wgpu::Texture, mip: u32, layer: u32) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: mip,
        origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
        aspect: wgpu::TextureAspect::All,
    }
}

fn texture_format(format: Format) -> DeviceResult<wgpu::TextureFormat> {
    Ok(match format {
        Format::R8Unorm => wgpu::TextureFormat::R8Unorm,
        Format::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        Format::R16Float => wgpu::TextureFormat::R16Float,
        Format::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        Format::R32Float => wgpu::TextureFormat::R32Float,
        Format::R32Uint => wgpu::TextureFormat::R32Uint,
        Format::Rg32Float => wgpu::TextureFormat::Rg32Float,
        Format::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        other => return Err(DeviceError::Unsupported(format!("{other:?} textures"))),
    })
}
