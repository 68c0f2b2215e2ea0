//! Initial contents of one resource
//!
//! [`InitialContents`] is the snapshot a resource carries between Prepare (or
//! a capture load) and Apply. It owns every staging object it references:
//! native objects are wrapped in [`OwnedHandle`] and pooled buffers in
//! [`GpuBuffer`], so replacing or dropping the contents releases them once.

use std::fmt;
use std::sync::Arc;

use crate::accel::AsBuildData;
use crate::alloc::GpuBuffer;
use crate::core::Result;
use crate::device::{GpuDevice, NativeHandle};
use crate::resource::{Descriptor, ResourceDesc, ResourceType};
use crate::serialise::{Serialise, Serialiser};
use crate::sparse::{PageTable, SparseBinds};

/// Which snapshot strategy a resource's contents use
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentsTag {
    /// Bytes awaiting upload into the live resource
    Copy,
    /// Bytes read straight from host-visible memory
    MapDirect,
    /// No captured bytes; a synthesized default is copied in
    ForceCopy,
    /// Acceleration structure blob or build recipe
    AccelerationStructure,
}

/// A native object released when dropped
pub struct OwnedHandle {
    device: Arc<dyn GpuDevice>,
    handle: NativeHandle,
}

impl OwnedHandle {
    pub fn new(device: Arc<dyn GpuDevice>, handle: NativeHandle) -> Self {
        Self { device, handle }
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedHandle({})", self.handle)
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.device.release(self.handle);
    }
}

/// Subresources a texture snapshot covers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SubresourceSet {
    #[default]
    All,
    List(Vec<u32>),
}

/// Wire form of [`SubresourceSet::All`]
const ALL_SUBRESOURCES: u32 = u32::MAX;

impl SubresourceSet {
    /// Concrete subresource indices out of `count`
    pub fn indices(&self, count: u32) -> Vec<u32> {
        match self {
            SubresourceSet::All => (0..count).collect(),
            SubresourceSet::List(list) => list.iter().copied().filter(|s| *s < count).collect(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, SubresourceSet::All)
    }

    /// Bytes the wire form takes
    pub fn serialised_size(&self) -> u64 {
        let entries = match self {
            SubresourceSet::All => 1,
            SubresourceSet::List(list) => list.len() as u64,
        };
        8 + 4 * entries
    }
}

impl Serialise for SubresourceSet {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        let mut wire = match self {
            SubresourceSet::All => vec![ALL_SUBRESOURCES],
            SubresourceSet::List(list) => list.clone(),
        };
        ser.serialise_array(&mut wire)?;
        if ser.is_reading() {
            *self = if wire.first() == Some(&ALL_SUBRESOURCES) {
                SubresourceSet::All
            } else {
                SubresourceSet::List(wire)
            };
        }
        Ok(())
    }
}

/// Sparse mapping state carried with a resource snapshot
#[derive(Clone, Debug, Default)]
pub enum SparseState {
    #[default]
    None,
    /// Captured page table
    Table(PageTable),
    /// Binds compiled for replay
    Binds {
        table: Option<PageTable>,
        binds: SparseBinds,
    },
}

impl SparseState {
    /// Replay state for a loaded table
    pub fn compiled(table: PageTable) -> Self {
        let binds = SparseBinds::from_page_table(&table);
        SparseState::Binds { table: Some(table), binds }
    }

    pub fn table(&self) -> Option<&PageTable> {
        match self {
            SparseState::None => None,
            SparseState::Table(table) => Some(table),
            SparseState::Binds { table, .. } => table.as_ref(),
        }
    }

    pub fn binds(&self) -> Option<&SparseBinds> {
        match self {
            SparseState::Binds { binds, .. } => Some(binds),
            _ => None,
        }
    }
}

/// Where the bytes of a [`ResourceContents::Copy`] live
#[derive(Debug)]
pub enum CopySource {
    /// Readback (capture) or upload (replay) buffer laid out in copyable footprints
    Buffer { buffer: OwnedHandle, len: u64 },
    /// Texture of the live resource's shape, copied whole
    Resource(OwnedHandle),
    /// Bytes kept on the CPU for host-written heaps
    Cpu(Vec<u8>),
}

/// Non-multisampled array holding every sample of an MSAA snapshot
#[derive(Debug)]
pub struct MsaaArray {
    pub texture: OwnedHandle,
    pub desc: ResourceDesc,
}

#[derive(Debug)]
pub enum ResourceContents {
    Copy {
        source: CopySource,
        subresources: SubresourceSet,
        sparse: SparseState,
        msaa_array: Option<MsaaArray>,
    },
    MapDirect {
        bytes: Vec<u8>,
    },
    ForceCopy {
        resource: OwnedHandle,
        sparse: SparseState,
    },
    /// Buffer holding acceleration structures; the structures carry the state
    AccelerationStructureBuffer,
}

#[derive(Debug)]
pub enum HeapContents {
    Snapshot {
        descriptors: Vec<Descriptor>,
        names: Vec<String>,
    },
    /// CPU descriptor heap copied into the live heap at Apply
    CopyHeap { heap: OwnedHandle, count: u32 },
    /// Empty heap
    Null,
}

#[derive(Debug)]
pub enum AccelContents {
    /// Driver-serialised structure
    Blob { buffer: GpuBuffer, len: u64 },
    /// Build recipe and its bytes
    Build { data: Arc<AsBuildData> },
}

#[derive(Debug)]
pub enum InitialContents {
    DescriptorHeap(HeapContents),
    Resource(ResourceContents),
    AccelerationStructure(AccelContents),
}

impl InitialContents {
    pub fn tag(&self) -> ContentsTag {
        match self {
            InitialContents::DescriptorHeap(_) => ContentsTag::Copy,
            InitialContents::Resource(ResourceContents::Copy { .. }) => ContentsTag::Copy,
            InitialContents::Resource(ResourceContents::MapDirect { .. }) => ContentsTag::MapDirect,
            InitialContents::Resource(ResourceContents::ForceCopy { .. }) => ContentsTag::ForceCopy,
            InitialContents::Resource(ResourceContents::AccelerationStructureBuffer)
            | InitialContents::AccelerationStructure(_) => ContentsTag::AccelerationStructure,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            InitialContents::DescriptorHeap(_) => ResourceType::DescriptorHeap,
            InitialContents::Resource(_) => ResourceType::Resource,
            InitialContents::AccelerationStructure(_) => ResourceType::AccelerationStructure,
        }
    }

    /// Array texture backing an MSAA snapshot
    pub fn msaa_array(&self) -> Option<&MsaaArray> {
        match self {
            InitialContents::Resource(ResourceContents::Copy { msaa_array, .. }) => msaa_array.as_ref(),
            _ => None,
        }
    }

    pub fn sparse(&self) -> Option<&SparseState> {
        match self {
            InitialContents::Resource(
                ResourceContents::Copy { sparse, .. } | ResourceContents::ForceCopy { sparse, .. },
            ) => Some(sparse),
            _ => None,
        }
    }

    pub fn build_data(&self) -> Option<&Arc<AsBuildData>> {
        match self {
            InitialContents::AccelerationStructure(AccelContents::Build { data }) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::resource::HeapType;
    use crate::serialise::{ReadSerialiser, WriteSerialiser, CURRENT_VERSION};

    #[test]
    fn test_owned_handle_releases_once() {
        let device = Arc::new(SoftwareDevice::new());
        let handle = device.create_resource(&ResourceDesc::buffer(64), HeapType::Readback).unwrap();
        let owned = OwnedHandle::new(device.clone(), handle);
        assert!(device.is_alive(handle));
        drop(owned);
        assert!(!device.is_alive(handle));
    }

    #[test]
    fn test_subresource_set_wire_form() {
        for mut set in [SubresourceSet::All, SubresourceSet::List(vec![0, 2, 5])] {
            let expected = set.clone();
            let mut writer = WriteSerialiser::new(Vec::new());
            set.serialise(&mut writer).unwrap();
            assert_eq!(writer.bytes_written(), set.serialised_size());
            let bytes = writer.into_inner();

            let mut decoded = SubresourceSet::List(Vec::new());
            decoded.serialise(&mut ReadSerialiser::new(&bytes, CURRENT_VERSION)).unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_subresource_indices_are_clamped() {
        assert_eq!(SubresourceSet::All.indices(3), vec![0, 1, 2]);
        assert_eq!(SubresourceSet::List(vec![1, 7]).indices(4), vec![1]);
    }

    #[test]
    fn test_tags() {
        let contents = InitialContents::Resource(ResourceContents::MapDirect { bytes: vec![0; 64] });
        assert_eq!(contents.tag(), ContentsTag::MapDirect);
        assert_eq!(contents.resource_type(), ResourceType::Resource);
        let heap = InitialContents::DescriptorHeap(HeapContents::Null);
        assert_eq!(heap.resource_type(), ResourceType::DescriptorHeap);
        assert!(heap.msaa_array().is_none());
    }
}
