//! GPU device seam
//!
//! The engine never talks to a graphics API directly. Everything it needs
//! (object creation, host mapping, command execution, fences) goes through
//! [`GpuDevice`]. [`SoftwareDevice`] is a complete in-memory backend; the
//! `wgpu-backend` feature adds [`WgpuDevice`] for buffers and 2D textures.

pub mod command;
pub mod software;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

use std::fmt;

use crate::accel::{BuildInputs, PrebuildInfo, SerializedAsHeader};
use crate::core::DeviceError;
use crate::resource::{Descriptor, DescriptorHeapKind, HeapType, ResourceDesc};

pub use command::{CopyLocation, GpuCommand};
pub use software::SoftwareDevice;
#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuDevice;

/// Backend result type
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Opaque native object handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Descriptor referencing native objects
pub type NativeDescriptor = Descriptor<NativeHandle>;

/// A graphics device
pub trait GpuDevice: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn create_resource(&self, desc: &ResourceDesc, heap: HeapType) -> DeviceResult<NativeHandle>;

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, count: u32) -> DeviceResult<NativeHandle>;

    /// Destroy an object; unknown handles are ignored
    fn release(&self, handle: NativeHandle);

    /// GPU virtual address of a buffer, 0 for anything else
    fn gpu_address(&self, handle: NativeHandle) -> u64;

    /// Map a host-visible buffer and read `len` bytes at `offset`
    fn read_buffer(&self, handle: NativeHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;

    /// Map a host-visible buffer and write `data` at `offset`
    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// CPU write of tightly packed rows into a host-visible texture subresource
    fn write_subresource(&self, handle: NativeHandle, subresource: u32, data: &[u8]) -> DeviceResult<()>;

    fn write_descriptors(&self, heap: NativeHandle, first: u32, descriptors: &[NativeDescriptor]) -> DeviceResult<()>;

    /// Execute commands in order; returns the fence value signalled on completion
    fn execute(&self, commands: Vec<GpuCommand>) -> DeviceResult<u64>;

    /// Fence value of the most recent submission
    fn submitted_fence(&self) -> u64;

    /// Last fence value the GPU has reached
    fn completed_fence(&self) -> u64;

    /// Block until all submitted work has completed
    fn wait_idle(&self) -> DeviceResult<()>;

    fn make_resident(&self, handle: NativeHandle) -> DeviceResult<()>;

    fn evict(&self, handle: NativeHandle) -> DeviceResult<()>;

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo;

    /// Serialised size and BLAS reference count of the structure at `address`
    fn serialized_as_size(&self, address: u64) -> DeviceResult<(u64, u64)>;

    /// Whether a serialised structure can be deserialised on this device
    fn check_serialized_compatibility(&self, header: &SerializedAsHeader) -> bool;
}
