//! Resource manager
//!
//! Owns the registry of live GPU objects, each object's initial contents and
//! the shared services the initial-state protocol needs (buffer allocator,
//! acceleration-structure manager, pending copy list). The protocol phases
//! themselves live in the sibling modules as further `impl` blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::accel::{AsBuildData, AsStats, AsType, BuildInputs, RtManager};
use crate::alloc::{AllocatorStats, GpuBufferAllocator};
use crate::core::{EngineConfig, Error, Result, ResultCode};
use crate::device::{GpuCommand, GpuDevice, NativeHandle};
use crate::initstate::contents::{ContentsTag, InitialContents};
use crate::resource::{
    AccelStructInfo, Descriptor, DescriptorHeapInfo, DescriptorHeapKind, HeapType, ResourceDesc, ResourceDetails,
    ResourceId, ResourceInfo, ResourceRegistry,
};
use crate::sparse::PageTable;

/// What the engine is doing with the frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CaptureState {
    /// Tracking objects between captures
    #[default]
    BackgroundCapturing,
    /// Inside a captured frame
    ActiveCapturing,
    /// Reading a capture and creating its objects
    LoadingReplaying,
    /// Re-executing a loaded frame
    ActiveReplaying,
}

impl CaptureState {
    pub fn is_capturing(self) -> bool {
        matches!(self, CaptureState::BackgroundCapturing | CaptureState::ActiveCapturing)
    }

    pub fn is_replaying(self) -> bool {
        !self.is_capturing()
    }
}

/// Snapshot of manager state for diagnostics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub registered: usize,
    pub initial_contents: usize,
    pub pending_commands: usize,
    pub allocator: AllocatorStats,
    pub accel: AsStats,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ResourceManager {
    pub(crate) device: Arc<dyn GpuDevice>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<CaptureState>,
    pub(crate) registry: Mutex<ResourceRegistry>,
    pub(crate) contents: Mutex<HashMap<ResourceId, InitialContents>>,
    pub(crate) allocator: GpuBufferAllocator,
    pub(crate) rt: RtManager,
    fatal: OnceLock<(ResultCode, String)>,
    pending_commands: Mutex<Vec<GpuCommand>>,
    /// Made resident for a snapshot copy; evicted once the copy completes
    evict_after_flush: Mutex<Vec<NativeHandle>>,
}

impl ResourceManager {
    pub fn new(device: Arc<dyn GpuDevice>, config: EngineConfig) -> Result<Self> {
        let allocator = GpuBufferAllocator::new(device.clone(), config.pool_sizes.clone());
        let rt = RtManager::new(device.clone(), allocator.clone(), &config)?;
        log::info!("Resource manager created on {} device", device.name());
        Ok(Self {
            device,
            config,
            state: Mutex::new(CaptureState::default()),
            registry: Mutex::new(ResourceRegistry::new()),
            contents: Mutex::new(HashMap::new()),
            allocator,
            rt,
            fatal: OnceLock::new(),
            pending_commands: Mutex::new(Vec::new()),
            evict_after_flush: Mutex::new(Vec::new()),
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn allocator(&self) -> &GpuBufferAllocator {
        &self.allocator
    }

    pub fn rt(&self) -> &RtManager {
        &self.rt
    }

    pub fn state(&self) -> CaptureState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: CaptureState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!("Capture state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, ResourceRegistry> {
        lock(&self.registry)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a buffer or texture seen during capture
    ///
    /// Buffers also record their GPU address range so captured addresses can
    /// be traced back to them.
    pub fn register_resource(&self, handle: NativeHandle, desc: ResourceDesc, heap: HeapType) -> ResourceId {
        let address = if desc.is_buffer() { self.device.gpu_address(handle) } else { 0 };
        let mut registry = self.registry();
        let id = registry.register(handle, ResourceDetails::Resource(ResourceInfo::new(desc, heap)));
        if address != 0 {
            registry.register_original_range(id, address, desc.width);
        }
        log::trace!("Registered {} as {}", handle, id);
        id
    }

    pub fn register_descriptor_heap(&self, handle: NativeHandle, kind: DescriptorHeapKind, count: u32) -> ResourceId {
        self.registry()
            .register(handle, ResourceDetails::DescriptorHeap(DescriptorHeapInfo::new(kind, count)))
    }

    /// Register a memory heap backing placed or tiled resources
    pub fn register_heap(&self, handle: NativeHandle, size: u64) -> ResourceId {
        self.registry().register(handle, ResourceDetails::Heap { size })
    }

    /// Register an acceleration structure placed at `offset` in `buffer`
    pub fn register_acceleration_structure(
        &self,
        buffer: ResourceId,
        offset: u64,
        size: u64,
        ty: AsType,
    ) -> Result<ResourceId> {
        let mut registry = self.registry();
        let handle = registry.live_handle(buffer).ok_or(Error::UnknownResource(buffer))?;
        let info = AccelStructInfo { ty, buffer, offset, size, build_data: None, applied: false };
        Ok(registry.register(handle, ResourceDetails::AccelerationStructure(info)))
    }

    /// Register a replay object under its captured id
    pub fn register_live(&self, id: ResourceId, handle: NativeHandle, details: ResourceDetails) {
        self.registry().register_with_id(id, handle, details);
    }

    /// Register a replay acceleration structure under its captured id
    pub fn register_live_acceleration_structure(
        &self,
        id: ResourceId,
        buffer: ResourceId,
        offset: u64,
        size: u64,
        ty: AsType,
    ) -> Result<()> {
        let mut registry = self.registry();
        let handle = registry.live_handle(buffer).ok_or(Error::UnknownResource(buffer))?;
        let info = AccelStructInfo { ty, buffer, offset, size, build_data: None, applied: false };
        registry.register_with_id(id, handle, ResourceDetails::AccelerationStructure(info));
        Ok(())
    }

    /// Record where an object lived at capture time
    pub fn register_original_address(&self, id: ResourceId, base: u64, size: u64) {
        self.registry().register_original_range(id, base, size);
    }

    /// Forget an object and its initial contents
    pub fn release_resource(&self, id: ResourceId) {
        let record = self.registry().release(id);
        let contents = lock(&self.contents).remove(&id);
        self.rt.evict_cached_blas(id);
        if record.is_some() {
            log::trace!("Released {}", id);
        }
        drop(contents);
    }

    pub fn live_handle(&self, id: ResourceId) -> Option<NativeHandle> {
        self.registry().live_handle(id)
    }

    pub fn resource_id(&self, handle: NativeHandle) -> Option<ResourceId> {
        self.registry().id_for_handle(handle)
    }

    /// Ids of every registered object that carries initial state
    pub fn ids_with_initial_state(&self) -> Vec<ResourceId> {
        self.registry().ids_with_initial_state()
    }

    // -----------------------------------------------------------------------
    // Interception notifications
    // -----------------------------------------------------------------------

    pub fn notify_residency(&self, id: ResourceId, resident: bool) {
        if let Some(record) = self.registry().get_mut(id) {
            record.resident = resident;
        }
    }

    /// Mirror descriptor writes into a heap's shadow copy
    pub fn record_descriptor_writes(&self, heap: ResourceId, first: u32, descriptors: &[Descriptor]) -> Result<()> {
        let mut registry = self.registry();
        let info = match registry.get_mut(heap).map(|r| &mut r.details) {
            Some(ResourceDetails::DescriptorHeap(info)) => info,
            _ => return Err(Error::UnknownResource(heap)),
        };
        let start = first as usize;
        let end = start + descriptors.len();
        if end > info.descriptors.len() {
            return Err(Error::UnsupportedResourceKind(format!(
                "descriptor write {start}..{end} overruns heap {heap} of {}",
                info.descriptors.len()
            )));
        }
        info.descriptors[start..end].copy_from_slice(descriptors);
        Ok(())
    }

    pub fn set_descriptor_name(&self, heap: ResourceId, index: u32, name: &str) {
        if let Some(ResourceDetails::DescriptorHeap(info)) = self.registry().get_mut(heap).map(|r| &mut r.details) {
            let index = index as usize;
            if index >= info.descriptors.len() {
                return;
            }
            if info.names.len() <= index {
                info.names.resize(index + 1, String::new());
            }
            info.names[index] = name.to_string();
        }
    }

    /// Change a reserved resource's page table
    ///
    /// Creates the table on first use. During replay the change marks the
    /// resource so Apply restores its captured mappings.
    pub fn update_sparse_table<F>(&self, id: ResourceId, update: F) -> Result<()>
    where
        F: FnOnce(&mut PageTable),
    {
        let replaying = self.state().is_replaying();
        let mut registry = self.registry();
        let info = match registry.get_mut(id).map(|r| &mut r.details) {
            Some(ResourceDetails::Resource(info)) => info,
            _ => return Err(Error::UnknownResource(id)),
        };
        let table = info.sparse_table.get_or_insert_with(PageTable::default);
        update(table);
        if replaying {
            info.sparse_updated = true;
        }
        Ok(())
    }

    /// Attach a page table to a reserved resource
    pub fn set_sparse_table(&self, id: ResourceId, table: PageTable) -> Result<()> {
        self.update_sparse_table(id, move |current| *current = table)
    }

    /// Resources never written during the frame keep their loaded contents
    pub fn mark_read_only(&self, id: ResourceId, read_only: bool) {
        if let Some(ResourceDetails::Resource(info)) = self.registry().get_mut(id).map(|r| &mut r.details) {
            info.read_only = read_only;
        }
    }

    /// Snapshot the inputs of an application AS build into `id`
    pub fn record_as_build(&self, id: ResourceId, inputs: &BuildInputs) -> Result<Arc<AsBuildData>> {
        if self.registry().get(id).and_then(|r| r.accel_info()).is_none() {
            return Err(Error::UnknownResource(id));
        }
        let data = self.rt.record_build(inputs, |address| {
            let registry = self.registry();
            let (owner, offset) = registry.resolve_original_address(address)?;
            Some((registry.live_handle(owner)?, offset))
        })?;
        if let Some(ResourceDetails::AccelerationStructure(info)) = self.registry().get_mut(id).map(|r| &mut r.details) {
            info.build_data = Some(Arc::clone(&data));
        }
        Ok(data)
    }

    // -----------------------------------------------------------------------
    // Fatal errors
    // -----------------------------------------------------------------------

    /// Raise the one-way fatal flag; later reports are ignored
    pub fn report_fatal(&self, code: ResultCode, message: impl Into<String>) {
        let message = message.into();
        if self.fatal.set((code, message.clone())).is_ok() {
            log::error!("Fatal error ({:?}): {}", code, message);
        }
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal.get().is_some()
    }

    pub fn fatal_error(&self) -> Option<ResultCode> {
        self.fatal.get().map(|(code, _)| *code)
    }

    /// Log a per-resource failure, raising the fatal flag if it ends the session
    pub(crate) fn degrade(&self, id: ResourceId, phase: &str, err: &Error) {
        if err.is_fatal() {
            self.report_fatal(err.result_code(), format!("{phase} of {id}: {err}"));
        } else {
            log::error!("{} of {} failed: {}", phase, id, err);
        }
    }

    // -----------------------------------------------------------------------
    // Initial contents
    // -----------------------------------------------------------------------

    /// Install contents for `id`, releasing whatever it had
    pub fn set_initial_contents(&self, id: ResourceId, contents: InitialContents) {
        let previous = lock(&self.contents).insert(id, contents);
        drop(previous);
    }

    pub fn take_initial_contents(&self, id: ResourceId) -> Option<InitialContents> {
        lock(&self.contents).remove(&id)
    }

    pub fn has_initial_contents(&self, id: ResourceId) -> bool {
        lock(&self.contents).contains_key(&id)
    }

    pub fn initial_contents_tag(&self, id: ResourceId) -> Option<ContentsTag> {
        lock(&self.contents).get(&id).map(InitialContents::tag)
    }

    /// Inspect the contents of `id`
    pub fn with_initial_contents<R>(&self, id: ResourceId, f: impl FnOnce(&InitialContents) -> R) -> Option<R> {
        lock(&self.contents).get(&id).map(f)
    }

    /// Ids that currently hold initial contents, in id order
    pub fn ids_with_initial_contents(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = lock(&self.contents).keys().copied().collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // GPU work
    // -----------------------------------------------------------------------

    pub(crate) fn queue_commands(&self, commands: impl IntoIterator<Item = GpuCommand>) {
        lock(&self.pending_commands).extend(commands);
    }

    pub(crate) fn evict_after_flush(&self, handle: NativeHandle) {
        lock(&self.evict_after_flush).push(handle);
    }

    pub fn pending_commands(&self) -> usize {
        lock(&self.pending_commands).len()
    }

    /// Submit queued initial-state copies
    ///
    /// Returns the submission's fence value, or `None` when nothing was queued.
    pub fn flush_pending_commands(&self) -> Result<Option<u64>> {
        let commands = std::mem::take(&mut *lock(&self.pending_commands));
        let evict = std::mem::take(&mut *lock(&self.evict_after_flush));
        if commands.is_empty() && evict.is_empty() {
            return Ok(None);
        }

        let fence = if commands.is_empty() {
            None
        } else {
            log::trace!("Flushing {} initial-state commands", commands.len());
            Some(self.device.execute(commands).map_err(|e| self.device_failure("flush", e))?)
        };

        if !evict.is_empty() {
            self.device.wait_idle().map_err(|e| self.device_failure("flush", e))?;
            for handle in evict {
                if let Err(e) = self.device.evict(handle) {
                    log::warn!("Failed to evict {} after its snapshot: {}", handle, e);
                }
            }
        }
        Ok(fence)
    }

    fn device_failure(&self, what: &str, err: crate::core::DeviceError) -> Error {
        let err = Error::from(err);
        if err.is_fatal() {
            self.report_fatal(err.result_code(), format!("{what}: {err}"));
        }
        err
    }

    /// Command-submission boundary from the interception layer
    pub fn on_submission_boundary(&self) -> Result<()> {
        self.flush_pending_commands().map(|_| ())
    }

    /// Frame boundary: poll AS builds, reclaim buffers and spill old build data
    pub fn tick(&self) {
        self.rt.tick();
    }

    pub fn statistics(&self) -> ManagerStats {
        ManagerStats {
            registered: self.registry().len(),
            initial_contents: lock(&self.contents).len(),
            pending_commands: self.pending_commands(),
            allocator: self.allocator.stats(),
            accel: self.rt.statistics(),
        }
    }
}
