//! Registry of live GPU objects
//!
//! Maps ResourceIds to native handles (both ways) and keeps the metadata the
//! initial-state protocol needs for each object. On replay, objects are
//! registered under their captured ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::accel::{AsBuildData, AsType};
use crate::device::NativeHandle;
use crate::resource::{Descriptor, DescriptorHeapKind, HeapType, IdAllocator, ResourceDesc, ResourceId, ResourceType};
use crate::sparse::PageTable;

/// Buffer or texture metadata
#[derive(Clone, Debug)]
pub struct ResourceInfo {
    pub desc: ResourceDesc,
    pub heap: HeapType,
    pub sparse_table: Option<PageTable>,
    /// Contents cannot change after load (e.g. never written during the frame)
    pub read_only: bool,
    /// Tile mappings changed during replay
    pub sparse_updated: bool,
}

impl ResourceInfo {
    pub fn new(desc: ResourceDesc, heap: HeapType) -> Self {
        Self { desc, heap, sparse_table: None, read_only: false, sparse_updated: false }
    }

    pub fn with_sparse_table(mut self, table: PageTable) -> Self {
        self.sparse_table = Some(table);
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse_table.is_some()
    }

    /// Buffers that hold acceleration structures
    pub fn is_acceleration_structure_buffer(&self) -> bool {
        self.desc.is_buffer() && self.desc.flags.acceleration_structure
    }
}

/// Descriptor heap metadata and shadow contents
#[derive(Clone, Debug)]
pub struct DescriptorHeapInfo {
    pub kind: DescriptorHeapKind,
    pub descriptors: Vec<Descriptor>,
    pub names: Vec<String>,
}

impl DescriptorHeapInfo {
    pub fn new(kind: DescriptorHeapKind, count: u32) -> Self {
        Self {
            kind,
            descriptors: vec![Descriptor::Undefined; count as usize],
            names: Vec::new(),
        }
    }
}

/// Acceleration structure placement
#[derive(Clone, Debug)]
pub struct AccelStructInfo {
    pub ty: AsType,
    /// Buffer holding the structure
    pub buffer: ResourceId,
    pub offset: u64,
    pub size: u64,
    /// Recipe of the most recent build
    pub build_data: Option<Arc<AsBuildData>>,
    /// Built or copied during the current replay loop
    pub applied: bool,
}

#[derive(Clone, Debug)]
pub enum ResourceDetails {
    Resource(ResourceInfo),
    DescriptorHeap(DescriptorHeapInfo),
    /// Memory heap backing placed or tiled resources
    Heap { size: u64 },
    AccelerationStructure(AccelStructInfo),
}

#[derive(Clone, Debug)]
pub struct ResourceRecord {
    pub id: ResourceId,
    /// Live native handle; AS records use their buffer's handle
    pub handle: NativeHandle,
    pub resident: bool,
    pub details: ResourceDetails,
}

impl ResourceRecord {
    pub fn resource_type(&self) -> ResourceType {
        match self.details {
            ResourceDetails::Resource(_) => ResourceType::Resource,
            ResourceDetails::DescriptorHeap(_) => ResourceType::DescriptorHeap,
            ResourceDetails::Heap { .. } => ResourceType::Heap,
            ResourceDetails::AccelerationStructure(_) => ResourceType::AccelerationStructure,
        }
    }

    pub fn resource_info(&self) -> Option<&ResourceInfo> {
        match &self.details {
            ResourceDetails::Resource(info) => Some(info),
            _ => None,
        }
    }

    pub fn heap_info(&self) -> Option<&DescriptorHeapInfo> {
        match &self.details {
            ResourceDetails::DescriptorHeap(info) => Some(info),
            _ => None,
        }
    }

    pub fn accel_info(&self) -> Option<&AccelStructInfo> {
        match &self.details {
            ResourceDetails::AccelerationStructure(info) => Some(info),
            _ => None,
        }
    }
}

/// Live/original id table plus captured address ranges
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    ids: IdAllocator,
    records: HashMap<ResourceId, ResourceRecord>,
    by_handle: HashMap<NativeHandle, ResourceId>,
    /// Captured GPU address ranges: start -> (end, owner)
    original_ranges: BTreeMap<u64, (u64, ResourceId)>,
    /// Acceleration structures by (buffer, offset)
    structures: HashMap<(ResourceId, u64), ResourceId>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly encountered object under a fresh id
    pub fn register(&mut self, handle: NativeHandle, details: ResourceDetails) -> ResourceId {
        let id = self.ids.allocate();
        self.insert(id, handle, details);
        id
    }

    /// Register a replay object under its captured id
    pub fn register_with_id(&mut self, id: ResourceId, handle: NativeHandle, details: ResourceDetails) {
        self.ids.reserve_past(id);
        if let Some(old) = self.records.get(&id) {
            log::warn!("{} re-registered, replacing handle {}", id, old.handle);
            self.release(id);
        }
        self.insert(id, handle, details);
    }

    fn insert(&mut self, id: ResourceId, handle: NativeHandle, details: ResourceDetails) {
        if let ResourceDetails::AccelerationStructure(info) = &details {
            self.structures.insert((info.buffer, info.offset), id);
        } else {
            self.by_handle.insert(handle, id);
        }
        self.records.insert(id, ResourceRecord { id, handle, resident: true, details });
    }

    /// Forget an object
    pub fn release(&mut self, id: ResourceId) -> Option<ResourceRecord> {
        let record = self.records.remove(&id)?;
        match &record.details {
            ResourceDetails::AccelerationStructure(info) => {
                self.structures.remove(&(info.buffer, info.offset));
            }
            _ => {
                if self.by_handle.get(&record.handle) == Some(&id) {
                    self.by_handle.remove(&record.handle);
                }
            }
        }
        self.original_ranges.retain(|_, (_, owner)| *owner != id);
        Some(record)
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut ResourceRecord> {
        self.records.get_mut(&id)
    }

    pub fn id_for_handle(&self, handle: NativeHandle) -> Option<ResourceId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn live_handle(&self, id: ResourceId) -> Option<NativeHandle> {
        self.records.get(&id).map(|r| r.handle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record the GPU address range an object occupied at capture
    pub fn register_original_range(&mut self, id: ResourceId, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.original_ranges.insert(base, (base + size, id));
    }

    /// Which object and offset a captured GPU address belonged to
    pub fn resolve_original_address(&self, address: u64) -> Option<(ResourceId, u64)> {
        let (start, (end, id)) = self.original_ranges.range(..=address).next_back()?;
        (address < *end).then(|| (*id, address - start))
    }

    /// Acceleration structure placed at `offset` in `buffer`
    pub fn structure_at(&self, buffer: ResourceId, offset: u64) -> Option<ResourceId> {
        self.structures.get(&(buffer, offset)).copied()
    }

    /// Mark every acceleration structure as not yet applied, at the start of a replay loop
    pub fn reset_applied_structures(&mut self) {
        for record in self.records.values_mut() {
            if let ResourceDetails::AccelerationStructure(info) = &mut record.details {
                info.applied = false;
            }
        }
    }

    /// Ids of every object that carries initial state, in id order
    pub fn ids_with_initial_state(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .records
            .values()
            .filter(|r| r.resource_type().has_initial_state())
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }
}
