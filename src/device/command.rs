//! Recorded GPU work

use crate::accel::{AsCopyMode, BuildInputs};
use crate::device::NativeHandle;
use crate::resource::PlacedFootprint;
use crate::sparse::SparseBind;

/// One side of a texture copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyLocation {
    Subresource { resource: NativeHandle, subresource: u32 },
    Footprint { buffer: NativeHandle, footprint: PlacedFootprint },
}

#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    CopyBufferRegion {
        dst: NativeHandle,
        dst_offset: u64,
        src: NativeHandle,
        src_offset: u64,
        size: u64,
    },
    CopyResource {
        dst: NativeHandle,
        src: NativeHandle,
    },
    CopyTextureRegion {
        dst: CopyLocation,
        src: CopyLocation,
    },
    /// Copy every sample of an MSAA texture into slices of an array texture
    ExpandMsaaToArray {
        dst: NativeHandle,
        src: NativeHandle,
    },
    /// Inverse of [`GpuCommand::ExpandMsaaToArray`]
    CollapseArrayToMsaa {
        dst: NativeHandle,
        src: NativeHandle,
    },
    UpdateTileMappings {
        resource: NativeHandle,
        binds: Vec<SparseBind<NativeHandle>>,
    },
    UnmapAllTiles {
        resource: NativeHandle,
    },
    CopyDescriptors {
        dst_heap: NativeHandle,
        src_heap: NativeHandle,
        count: u32,
    },
    BuildAccelerationStructure {
        dest: u64,
        inputs: BuildInputs,
        scratch: u64,
    },
    CopyAccelerationStructure {
        dest: u64,
        source: u64,
        mode: AsCopyMode,
    },
}
