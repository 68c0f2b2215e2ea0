//! Pooled GPU buffer sub-allocation
//!
//! Pool resources are grouped by heap type. Shared allocations are carved
//! out of them first-fit, starting from the range most recently freed;
//! dedicated allocations get their own resource. Handles are refcounted and
//! a dropped handle is only returned to its pool once the GPU has passed the
//! fence that was current when it was dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alloc::intervals::Intervals;
use crate::core::{align_up, DeviceError, PoolSizes};
use crate::device::{DeviceResult, GpuDevice, NativeHandle};
use crate::resource::{HeapType, ResourceDesc, ResourceFlags};

/// Heap and usage class of a pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuBufferHeapType {
    AccStructDefault,
    ReadBack,
    Upload,
    Default,
    DefaultWithUav,
    CustomWithUavCpuAccess,
}

impl GpuBufferHeapType {
    pub const ALL: [GpuBufferHeapType; 6] = [
        GpuBufferHeapType::AccStructDefault,
        GpuBufferHeapType::ReadBack,
        GpuBufferHeapType::Upload,
        GpuBufferHeapType::Default,
        GpuBufferHeapType::DefaultWithUav,
        GpuBufferHeapType::CustomWithUavCpuAccess,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Native heap and resource flags backing this pool
    pub fn native(self) -> (HeapType, ResourceFlags) {
        let uav = ResourceFlags { allow_unordered_access: true, ..Default::default() };
        match self {
            GpuBufferHeapType::AccStructDefault => (
                HeapType::Default,
                ResourceFlags { acceleration_structure: true, ..uav },
            ),
            GpuBufferHeapType::ReadBack => (HeapType::Readback, ResourceFlags::default()),
            GpuBufferHeapType::Upload => (HeapType::Upload, ResourceFlags::default()),
            GpuBufferHeapType::Default => (HeapType::Default, ResourceFlags::default()),
            GpuBufferHeapType::DefaultWithUav => (HeapType::Default, uav),
            GpuBufferHeapType::CustomWithUavCpuAccess => (HeapType::CpuVisible, uav),
        }
    }

    fn default_pool_size(self, sizes: &PoolSizes) -> u64 {
        match self {
            GpuBufferHeapType::AccStructDefault => sizes.acceleration_structure,
            GpuBufferHeapType::ReadBack => sizes.readback,
            GpuBufferHeapType::Upload => sizes.upload,
            GpuBufferHeapType::Default => sizes.default,
            GpuBufferHeapType::DefaultWithUav => sizes.default_with_uav,
            GpuBufferHeapType::CustomWithUavCpuAccess => sizes.custom_with_uav_cpu_access,
        }
    }
}

/// Whether an allocation may share a pool resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GpuBufferMemory {
    #[default]
    Default,
    Dedicated,
}

struct PoolResource {
    handle: NativeHandle,
    base_address: u64,
    ranges: Intervals,
    /// Start of the most recently freed range
    last_free: u64,
}

#[derive(Default)]
struct Pool {
    resources: Vec<PoolResource>,
}

#[derive(Clone, Copy, Debug)]
struct Allocation {
    heap_type: GpuBufferHeapType,
    memory: GpuBufferMemory,
    resource: NativeHandle,
    offset: u64,
    size: u64,
}

struct DeferredFree {
    fence: u64,
    allocation: Allocation,
}

#[derive(Default)]
struct AllocatorState {
    pools: [Pool; 6],
    deferred: Vec<DeferredFree>,
    bytes_in_use: u64,
}

struct AllocatorShared {
    device: Arc<dyn GpuDevice>,
    pool_sizes: PoolSizes,
    state: Mutex<AllocatorState>,
}

impl AllocatorShared {
    fn state(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defer_free(&self, allocation: Allocation) {
        let fence = self.device.submitted_fence();
        self.state().deferred.push(DeferredFree { fence, allocation });
    }

    /// Return every dropped allocation whose fence has completed
    fn reclaim(&self) -> usize {
        let completed = self.device.completed_fence();
        let mut dedicated = Vec::new();
        let reclaimed = {
            let mut state = self.state();
            let (ready, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.deferred).into_iter().partition(|d| d.fence <= completed);
            state.deferred = pending;

            for DeferredFree { allocation, .. } in &ready {
                state.bytes_in_use = state.bytes_in_use.saturating_sub(allocation.size);
                match allocation.memory {
                    GpuBufferMemory::Dedicated => dedicated.push(allocation.resource),
                    GpuBufferMemory::Default => {
                        let pool = &mut state.pools[allocation.heap_type.index()];
                        if let Some(res) = pool.resources.iter_mut().find(|r| r.handle == allocation.resource) {
                            res.last_free = res.ranges.mark_free(allocation.offset);
                        }
                    }
                }
            }
            ready.len()
        };

        for handle in dedicated {
            self.device.release(handle);
        }
        reclaimed
    }
}

impl Drop for AllocatorShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for pool in &state.pools {
            for res in &pool.resources {
                self.device.release(res.handle);
            }
        }
        for deferred in &state.deferred {
            if deferred.allocation.memory == GpuBufferMemory::Dedicated {
                self.device.release(deferred.allocation.resource);
            }
        }
    }
}

struct BufferInner {
    allocator: Arc<AllocatorShared>,
    allocation: Allocation,
    address: u64,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.allocator.defer_free(self.allocation);
    }
}

/// Refcounted handle to a sub-allocated GPU buffer range
#[derive(Clone)]
pub struct GpuBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("resource", &self.resource())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .finish()
    }
}

impl GpuBuffer {
    /// Native resource the range lives in
    pub fn resource(&self) -> NativeHandle {
        self.inner.allocation.resource
    }

    /// Offset of the range inside [`resource`](Self::resource)
    pub fn offset(&self) -> u64 {
        self.inner.allocation.offset
    }

    pub fn size(&self) -> u64 {
        self.inner.allocation.size
    }

    /// GPU virtual address of the start of the range
    pub fn address(&self) -> u64 {
        self.inner.address
    }

    pub fn heap_type(&self) -> GpuBufferHeapType {
        self.inner.allocation.heap_type
    }

    pub fn memory(&self) -> GpuBufferMemory {
        self.inner.allocation.memory
    }

    /// Number of live handles to this range
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Map and read the whole range (host-visible heaps only)
    pub fn read(&self) -> DeviceResult<Vec<u8>> {
        self.inner.allocator.device.read_buffer(self.resource(), self.offset(), self.size())
    }

    /// Map and write `data` at `offset` within the range (host-visible heaps only)
    pub fn write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        if offset + data.len() as u64 > self.size() {
            return Err(DeviceError::InvalidCommand(format!(
                "{} bytes at {offset} overrun a {}-byte allocation",
                data.len(),
                self.size()
            )));
        }
        self.inner
            .allocator
            .device
            .write_buffer(self.resource(), self.offset() + offset, data)
    }
}

/// Snapshot of allocator usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub bytes_in_use: u64,
    pub pool_resources: usize,
    pub pool_bytes: u64,
    pub pool_bytes_free: u64,
    pub deferred_frees: usize,
}

/// Sub-allocator over pooled GPU buffers
#[derive(Clone)]
pub struct GpuBufferAllocator {
    shared: Arc<AllocatorShared>,
}

impl GpuBufferAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, pool_sizes: PoolSizes) -> Self {
        Self {
            shared: Arc::new(AllocatorShared {
                device,
                pool_sizes,
                state: Mutex::new(AllocatorState::default()),
            }),
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (relative to the GPU address)
    pub fn alloc(
        &self,
        heap_type: GpuBufferHeapType,
        memory: GpuBufferMemory,
        size: u64,
        alignment: u64,
    ) -> DeviceResult<GpuBuffer> {
        self.shared.reclaim();
        let size = size.max(1);
        let alignment = alignment.max(1);

        if memory == GpuBufferMemory::Dedicated {
            let handle = self.create_resource(heap_type, size)?;
            let address = self.shared.device.gpu_address(handle);
            self.shared.state().bytes_in_use += size;
            log::trace!("Dedicated {:?} allocation of {} bytes", heap_type, size);
            return Ok(self.wrap(Allocation { heap_type, memory, resource: handle, offset: 0, size }, address));
        }

        if let Some(buffer) = self.try_sub_alloc(heap_type, size, alignment) {
            return Ok(buffer);
        }

        // grow the pool; the device call happens outside the lock
        let default_size = heap_type.default_pool_size(&self.shared.pool_sizes);
        let resource_size = default_size.max(size + alignment - 1);
        let handle = self.create_resource(heap_type, resource_size)?;
        let base_address = self.shared.device.gpu_address(handle);
        log::debug!(
            "New {:?} pool resource {} of {} bytes",
            heap_type,
            handle,
            resource_size
        );

        // claim the request before other allocations can see the new resource
        let mut ranges = Intervals::new(resource_size);
        let offset = ranges.find_fit(size, alignment, base_address, 0);
        if let Some(offset) = offset {
            ranges.mark_used(offset, size);
        }
        {
            let mut state = self.shared.state();
            state.pools[heap_type.index()].resources.push(PoolResource {
                handle,
                base_address,
                ranges,
                last_free: 0,
            });
            if offset.is_some() {
                state.bytes_in_use += size;
            }
        }

        let offset = offset.ok_or(DeviceError::OutOfMemory)?;
        Ok(self.wrap(
            Allocation { heap_type, memory: GpuBufferMemory::Default, resource: handle, offset, size },
            base_address + offset,
        ))
    }

    fn create_resource(&self, heap_type: GpuBufferHeapType, size: u64) -> DeviceResult<NativeHandle> {
        let (heap, flags) = heap_type.native();
        let desc = ResourceDesc::buffer(size).with_flags(flags);
        self.shared.device.create_resource(&desc, heap)
    }

    fn try_sub_alloc(&self, heap_type: GpuBufferHeapType, size: u64, alignment: u64) -> Option<GpuBuffer> {
        let mut state = self.shared.state();
        let pool = &mut state.pools[heap_type.index()];
        let (handle, offset, address) = pool.resources.iter_mut().find_map(|res| {
            let offset = res.ranges.find_fit(size, alignment, res.base_address, res.last_free)?;
            res.ranges.mark_used(offset, size);
            Some((res.handle, offset, res.base_address + offset))
        })?;
        state.bytes_in_use += size;
        drop(state);

        Some(self.wrap(
            Allocation { heap_type, memory: GpuBufferMemory::Default, resource: handle, offset, size },
            address,
        ))
    }

    fn wrap(&self, allocation: Allocation, address: u64) -> GpuBuffer {
        GpuBuffer {
            inner: Arc::new(BufferInner {
                allocator: Arc::clone(&self.shared),
                allocation,
                address,
            }),
        }
    }

    /// Return dropped allocations whose GPU work has completed
    pub fn reclaim(&self) -> usize {
        self.shared.reclaim()
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.shared.state();
        let mut stats = AllocatorStats {
            bytes_in_use: state.bytes_in_use,
            deferred_frees: state.deferred.len(),
            ..Default::default()
        };
        for pool in &state.pools {
            for res in &pool.resources {
                stats.pool_resources += 1;
                stats.pool_bytes += res.ranges.size();
                stats.pool_bytes_free += res.ranges.bytes_free();
            }
        }
        stats
    }

    /// Whether every pool resource is a consistent Free/Used partition
    pub fn is_consistent(&self) -> bool {
        let state = self.shared.state();
        state
            .pools
            .iter()
            .flat_map(|pool| pool.resources.iter())
            .all(|res| res.ranges.is_consistent())
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.shared.device
    }
}

/// Round a size up to the AS storage alignment
pub fn as_aligned(size: u64) -> u64 {
    align_up(size, crate::accel::AS_BYTE_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    fn allocator() -> (Arc<SoftwareDevice>, GpuBufferAllocator) {
        let device = Arc::new(SoftwareDevice::new());
        let alloc = GpuBufferAllocator::new(device.clone(), PoolSizes::default());
        (device, alloc)
    }

    #[test]
    fn test_alloc_free_alloc_reuses_offset() {
        let (_device, alloc) = allocator();
        let first = alloc
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, 4096, 256)
            .expect("alloc");
        let offset = first.offset();
        drop(first);

        let second = alloc
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, 4096, 256)
            .expect("alloc");
        assert!(second.offset() <= offset);
        assert_eq!(alloc.stats().pool_resources, 1);
    }

    #[test]
    fn test_concurrent_growth_never_fails() {
        let (_device, alloc) = allocator();
        let size = 3 << 20;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    alloc
                        .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, size, 256)
                        .expect("alloc")
                })
            })
            .collect();
        let buffers: Vec<GpuBuffer> = handles.into_iter().map(|h| h.join().expect("join")).collect();

        let mut ranges: Vec<(u64, u64)> = buffers.iter().map(|b| (b.address(), b.address() + b.size())).collect();
        ranges.sort_unstable();
        assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
        assert_eq!(alloc.stats().bytes_in_use, 8 * size);
        assert!(alloc.is_consistent());
    }

    #[test]
    fn test_alignment_is_relative_to_gpu_address() {
        let (_device, alloc) = allocator();
        let _pad = alloc
            .alloc(GpuBufferHeapType::AccStructDefault, GpuBufferMemory::Default, 100, 1)
            .expect("pad");
        let aligned = alloc
            .alloc(GpuBufferHeapType::AccStructDefault, GpuBufferMemory::Default, 1000, 256)
            .expect("aligned");
        assert_eq!(aligned.address() % 256, 0);
        assert!(alloc.is_consistent());
    }

    #[test]
    fn test_oversized_request_grows_pool() {
        let (_device, alloc) = allocator();
        let big = alloc
            .alloc(GpuBufferHeapType::DefaultWithUav, GpuBufferMemory::Default, 20_000, 16)
            .expect("big");
        assert_eq!(big.size(), 20_000);
        let small = alloc
            .alloc(GpuBufferHeapType::DefaultWithUav, GpuBufferMemory::Default, 100, 16)
            .expect("small");
        assert_ne!(big.resource(), small.resource());
        assert_eq!(alloc.stats().pool_resources, 2);
    }

    #[test]
    fn test_dedicated_allocation_releases_resource() {
        let (device, alloc) = allocator();
        let before = device.live_objects();
        let dedicated = alloc
            .alloc(GpuBufferHeapType::ReadBack, GpuBufferMemory::Dedicated, 12_345, 1)
            .expect("dedicated");
        assert_eq!(dedicated.offset(), 0);
        assert_eq!(device.resource_desc(dedicated.resource()).map(|d| d.width), Some(12_345));
        assert_eq!(device.live_objects(), before + 1);

        drop(dedicated);
        alloc.reclaim();
        assert_eq!(device.live_objects(), before);
        assert_eq!(alloc.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_reclaim_waits_for_gpu_completion() {
        let (device, alloc) = allocator();
        let buffer = alloc
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, 64, 1)
            .expect("alloc");
        device.pause_completion(true);
        device.execute(Vec::new()).expect("submit");
        drop(buffer);

        assert_eq!(alloc.reclaim(), 0);
        assert_eq!(alloc.stats().deferred_frees, 1);

        device.pause_completion(false);
        assert_eq!(alloc.reclaim(), 1);
        assert_eq!(alloc.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_clones_share_one_allocation() {
        let (_device, alloc) = allocator();
        let a = alloc
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, 128, 1)
            .expect("alloc");
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(a);
        alloc.reclaim();
        assert_eq!(alloc.stats().bytes_in_use, 128);
        drop(b);
        alloc.reclaim();
        assert_eq!(alloc.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_map_round_trip() {
        let (_device, alloc) = allocator();
        let buf = alloc
            .alloc(GpuBufferHeapType::Upload, GpuBufferMemory::Default, 8, 1)
            .expect("alloc");
        buf.write(2, &[5, 6]).expect("write");
        assert_eq!(buf.read().expect("read"), vec![0, 0, 5, 6, 0, 0, 0, 0]);
        assert!(buf.write(7, &[1, 2]).is_err());
    }
}
