//! Create: neutral default contents for resources the capture has no state for

use crate::core::{Error, Result};
use crate::initstate::contents::{
    CopySource, HeapContents, InitialContents, ResourceContents, SparseState, SubresourceSet,
};
use crate::initstate::manager::ResourceManager;
use crate::initstate::prepare::MIN_CPU_COPY;
use crate::resource::{HeapType, ResourceDetails, ResourceId};
use crate::sparse::SparseBinds;

impl ResourceManager {
    /// Install default contents for `id`
    ///
    /// Buffers and textures get zeroed contents, descriptor heaps an empty
    /// heap. Acceleration structures have no meaningful default; `Ok(false)`
    /// is returned and nothing is installed.
    pub fn create_initial_state(&self, id: ResourceId) -> Result<bool> {
        let record = self.registry().get(id).cloned().ok_or(Error::UnknownResource(id))?;
        let contents = match record.details {
            ResourceDetails::DescriptorHeap(_) => InitialContents::DescriptorHeap(HeapContents::Null),
            ResourceDetails::Resource(info) if info.is_acceleration_structure_buffer() => {
                InitialContents::Resource(ResourceContents::AccelerationStructureBuffer)
            }
            ResourceDetails::Resource(info) if info.heap.is_cpu_written() => {
                let desc = info.desc;
                let len = if desc.is_buffer() {
                    desc.width
                } else {
                    desc.copyable_footprints(0..desc.subresource_count(true)).1
                };
                InitialContents::Resource(ResourceContents::Copy {
                    source: CopySource::Cpu(vec![0; len.max(MIN_CPU_COPY) as usize]),
                    subresources: SubresourceSet::All,
                    sparse: SparseState::None,
                    msaa_array: None,
                })
            }
            ResourceDetails::Resource(info) => {
                let resource = self.create_owned(id, &info.desc, HeapType::Default, "default contents")?;
                let sparse = if info.is_sparse() {
                    SparseState::Binds { table: None, binds: SparseBinds::null() }
                } else {
                    SparseState::None
                };
                InitialContents::Resource(ResourceContents::ForceCopy { resource, sparse })
            }
            ResourceDetails::AccelerationStructure(_) => {
                log::trace!("{} has no default contents", id);
                return Ok(false);
            }
            ResourceDetails::Heap { .. } => {
                return Err(Error::UnsupportedResourceKind(format!(
                    "{id} is a memory heap and has no initial contents"
                )));
            }
        };
        log::trace!("Created default {:?} contents for {}", contents.tag(), id);
        self.set_initial_contents(id, contents);
        Ok(true)
    }

    /// Create defaults for every object that still has no contents after a load
    ///
    /// Returns how many defaults were installed.
    pub fn create_missing_initial_states(&self) -> usize {
        let mut created = 0;
        for id in self.ids_with_initial_state() {
            if self.has_initial_contents(id) {
                continue;
            }
            match self.create_initial_state(id) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(err) => self.degrade(id, "Create", &err),
            }
        }
        created
    }
}
