//! Acceleration-structure build and cache management
//!
//! Owns everything shared between acceleration structures: the pending
//! builds list, the disk-cache worker, the scratch buffer and the cache of
//! built BLASes used during replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::accel::build_data::{AsBuildData, BuildRecipe, BuildState, BUILD_DATA_ALIGNMENT};
use crate::accel::desc::{
    is_absent_address, AsCopyMode, AsType, BuildInputs, GeometryKind, AS_BYTE_ALIGNMENT, INSTANCE_DESC_SIZE,
    NULL_ADDRESS,
};
use crate::accel::disk_cache::{DiskCache, DiskCacheStats};
use crate::accel::pending::PendingBuilds;
use crate::accel::worker::CacheWorker;
use crate::alloc::{as_aligned, GpuBuffer, GpuBufferAllocator, GpuBufferHeapType, GpuBufferMemory};
use crate::core::{align_up, EngineConfig, Result};
use crate::device::{GpuCommand, GpuDevice, NativeHandle};
use crate::resource::ResourceId;

/// Upper bounds of the build-data age buckets reported by [`RtManager::statistics`]
pub const AGE_BUCKETS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(1000),
    Duration::from_secs(10),
];

/// Snapshot of acceleration-structure memory use
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsStats {
    pub building: usize,
    pub in_memory_count: usize,
    pub in_memory_bytes: u64,
    pub disk_cached_count: usize,
    pub disk_cached_bytes: u64,
    /// Pool padding and partially used cache blocks
    pub overhead_bytes: u64,
    /// Live build data per age bucket; the last bucket is everything older
    pub age_buckets: [usize; 4],
    pub cached_blas: usize,
    pub pending_builds: usize,
    pub disk: DiskCacheStats,
}

struct CachedBlas {
    source: Weak<AsBuildData>,
    buffer: GpuBuffer,
}

/// A range of application memory a build reads
struct SourceRange {
    address: u64,
    len: u64,
}

pub struct RtManager {
    device: Arc<dyn GpuDevice>,
    allocator: GpuBufferAllocator,
    min_scratch_size: u64,
    cache_age: Duration,
    pending: PendingBuilds,
    disk_cache: Arc<DiskCache>,
    worker: CacheWorker,
    tracked: Mutex<Vec<Weak<AsBuildData>>>,
    scratch: Mutex<Option<GpuBuffer>>,
    blas_cache: Mutex<HashMap<ResourceId, CachedBlas>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RtManager {
    pub fn new(device: Arc<dyn GpuDevice>, allocator: GpuBufferAllocator, config: &EngineConfig) -> Result<Self> {
        let disk_cache = Arc::new(DiskCache::new(
            config.disk_cache_dir.as_deref(),
            config.disk_cache_compression,
        ));
        let worker = CacheWorker::new(config.worker_queue_capacity)?;
        Ok(Self {
            device,
            allocator,
            min_scratch_size: config.min_scratch_size,
            cache_age: Duration::from_millis(config.disk_cache_age_ms),
            pending: PendingBuilds::new(),
            disk_cache,
            worker,
            tracked: Mutex::new(Vec::new()),
            scratch: Mutex::new(None),
            blas_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn disk_cache(&self) -> &Arc<DiskCache> {
        &self.disk_cache
    }

    fn track(&self, data: &Arc<AsBuildData>) {
        lock(&self.tracked).push(Arc::downgrade(data));
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Snapshot the inputs of an application build
    ///
    /// Every range the build reads is copied into one readback buffer and the
    /// recipe's addresses become offsets into it. `locate` maps an
    /// application GPU address to the buffer holding it. The returned data is
    /// `Building` until the copy's fence completes and [`RtManager::tick`]
    /// observes it.
    pub fn record_build<F>(&self, inputs: &BuildInputs, locate: F) -> Result<Arc<AsBuildData>>
    where
        F: Fn(u64) -> Option<(NativeHandle, u64)>,
    {
        let mut recipe = BuildRecipe {
            ty: inputs.ty,
            flags: inputs.flags,
            num_blas: if inputs.ty == AsType::TopLevel { inputs.num_instances } else { 0 },
            geometries: Vec::new(),
        };
        let mut ranges = Vec::new();
        let mut cursor = 0u64;
        let mut reserve = |address: u64, len: u64, ranges: &mut Vec<(SourceRange, u64)>| -> u64 {
            if is_absent_address(address) || len == 0 {
                return NULL_ADDRESS;
            }
            let offset = align_up(cursor, BUILD_DATA_ALIGNMENT);
            cursor = offset + len;
            ranges.push((SourceRange { address, len }, offset));
            offset
        };

        match inputs.ty {
            AsType::BottomLevel => {
                for geom in &inputs.geometries {
                    let mut geom = *geom;
                    match &mut geom.kind {
                        GeometryKind::Triangles(tri) => {
                            let vb_len = u64::from(tri.vertex_count) * tri.vertex_buffer.stride;
                            let vb = reserve(tri.vertex_buffer.address, vb_len, &mut ranges);
                            // vertex data is mandatory; an empty range still rebases
                            tri.vertex_buffer.address = if vb == NULL_ADDRESS { 0 } else { vb };
                            let ib_len = u64::from(tri.index_count) * tri.index_format.size();
                            tri.index_buffer = reserve(tri.index_buffer, ib_len, &mut ranges);
                            tri.transform = reserve(tri.transform, 48, &mut ranges);
                        }
                        GeometryKind::Aabbs(aabbs) => {
                            let len = aabbs.count * aabbs.aabbs.stride.max(24);
                            aabbs.aabbs.address = reserve(aabbs.aabbs.address, len, &mut ranges);
                        }
                    }
                    recipe.geometries.push(geom);
                }
            }
            AsType::TopLevel => {
                let len = u64::from(inputs.num_instances) * INSTANCE_DESC_SIZE;
                reserve(inputs.instance_descs, len, &mut ranges);
            }
        }

        let byte_size = cursor;
        if byte_size == 0 {
            let data = AsBuildData::new(recipe, None, 0, true);
            self.track(&data);
            return Ok(data);
        }

        let buffer = self.allocator.alloc(
            GpuBufferHeapType::ReadBack,
            GpuBufferMemory::Default,
            byte_size,
            BUILD_DATA_ALIGNMENT,
        )?;
        let mut commands = Vec::with_capacity(ranges.len());
        for (range, offset) in &ranges {
            match locate(range.address) {
                Some((src, src_offset)) => commands.push(GpuCommand::CopyBufferRegion {
                    dst: buffer.resource(),
                    dst_offset: buffer.offset() + offset,
                    src,
                    src_offset,
                    size: range.len,
                }),
                None => log::warn!(
                    "Build input at {:#x} is not in any known buffer; recording zeros",
                    range.address
                ),
            }
        }
        let fence = self.device.execute(commands)?;

        let data = AsBuildData::new(recipe, Some(buffer), byte_size, false);
        let completing = Arc::clone(&data);
        self.pending.push(fence, Box::new(move || completing.mark_complete()));
        self.track(&data);
        log::trace!("Recorded {:?} build: {} bytes, fence {}", inputs.ty, byte_size, fence);
        Ok(data)
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Build data for a recipe and its bytes read from a capture
    pub fn load_build_data(&self, recipe: BuildRecipe, bytes: &[u8]) -> Result<Arc<AsBuildData>> {
        let buffer = if bytes.is_empty() {
            None
        } else {
            let buffer = self.allocator.alloc(
                GpuBufferHeapType::Upload,
                GpuBufferMemory::Default,
                bytes.len() as u64,
                BUILD_DATA_ALIGNMENT,
            )?;
            buffer.write(0, bytes)?;
            Some(buffer)
        };
        let data = AsBuildData::new(recipe, buffer, bytes.len() as u64, true);
        self.track(&data);
        Ok(data)
    }

    /// Scratch buffer of at least `needed` bytes
    ///
    /// Growing drains the GPU first since in-flight builds may use the old one.
    pub fn scratch(&self, needed: u64) -> Result<GpuBuffer> {
        if let Some(buffer) = lock(&self.scratch).as_ref().filter(|b| b.size() >= needed) {
            return Ok(buffer.clone());
        }

        self.device.wait_idle()?;
        let size = self.min_scratch_size.max(as_aligned(needed));
        let buffer = self.allocator.alloc(
            GpuBufferHeapType::DefaultWithUav,
            GpuBufferMemory::Dedicated,
            size,
            AS_BYTE_ALIGNMENT,
        )?;

        let mut scratch = lock(&self.scratch);
        match scratch.as_ref() {
            // another thread grew it meanwhile
            Some(current) if current.size() >= size => Ok(current.clone()),
            _ => {
                log::debug!("AS scratch buffer resized to {} bytes", size);
                *scratch = Some(buffer.clone());
                Ok(buffer)
            }
        }
    }

    /// Build a BLAS into `dest`, building once into the BLAS cache and cloning from it
    pub fn apply_bottom_level(&self, id: ResourceId, data: &Arc<AsBuildData>, dest: u64) -> Result<()> {
        let cached = {
            let cache = lock(&self.blas_cache);
            cache
                .get(&id)
                .filter(|c| c.source.upgrade().is_some_and(|s| Arc::ptr_eq(&s, data)))
                .map(|c| c.buffer.address())
        };

        let source = match cached {
            Some(address) => address,
            None => {
                let geometry = data.ensure_resident(&self.allocator)?;
                let base = geometry.as_ref().map(GpuBuffer::address).unwrap_or(0);
                let inputs = data.recipe().bottom_level_inputs(base);
                let prebuild = self.device.prebuild_info(&inputs);
                let storage = self.allocator.alloc(
                    GpuBufferHeapType::AccStructDefault,
                    GpuBufferMemory::Default,
                    as_aligned(prebuild.result_max_size),
                    AS_BYTE_ALIGNMENT,
                )?;
                let scratch = self.scratch(prebuild.scratch_size)?;
                self.device.execute(vec![GpuCommand::BuildAccelerationStructure {
                    dest: storage.address(),
                    inputs,
                    scratch: scratch.address(),
                }])?;
                log::trace!("Built {} into the BLAS cache at {:#x}", id, storage.address());
                let address = storage.address();
                lock(&self.blas_cache).insert(id, CachedBlas { source: Arc::downgrade(data), buffer: storage });
                address
            }
        };

        self.device.execute(vec![GpuCommand::CopyAccelerationStructure {
            dest,
            source,
            mode: AsCopyMode::Clone,
        }])?;
        Ok(())
    }

    /// Build a TLAS into `dest` from already patched instance records
    pub fn apply_top_level(&self, data: &AsBuildData, instances: &[u8], dest: u64) -> Result<()> {
        let upload = if instances.is_empty() {
            None
        } else {
            let buffer = self.allocator.alloc(
                GpuBufferHeapType::Upload,
                GpuBufferMemory::Default,
                instances.len() as u64,
                BUILD_DATA_ALIGNMENT,
            )?;
            buffer.write(0, instances)?;
            Some(buffer)
        };
        let inputs = data
            .recipe()
            .top_level_inputs(upload.as_ref().map(GpuBuffer::address).unwrap_or(0));
        let prebuild = self.device.prebuild_info(&inputs);
        let scratch = self.scratch(prebuild.scratch_size)?;
        self.device.execute(vec![GpuCommand::BuildAccelerationStructure {
            dest,
            inputs,
            scratch: scratch.address(),
        }])?;
        // the instance upload is reclaimed once this submission completes
        drop(upload);
        Ok(())
    }

    /// Forget a BLAS's cached build
    pub fn evict_cached_blas(&self, id: ResourceId) {
        lock(&self.blas_cache).remove(&id);
    }

    // -----------------------------------------------------------------------
    // Frame boundary
    // -----------------------------------------------------------------------

    /// Poll pending builds, reclaim finished allocations and spill old build data
    pub fn tick(&self) {
        let completed = self.pending.poll(self.device.completed_fence());
        if completed > 0 {
            log::trace!("{} AS builds completed", completed);
        }
        self.allocator.reclaim();

        let candidates: Vec<Arc<AsBuildData>> = {
            let mut tracked = lock(&self.tracked);
            tracked.retain(|weak| weak.strong_count() > 0);
            tracked
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|data| data.state() == BuildState::Complete && data.byte_size() > 0)
                .filter(|data| data.age() >= self.cache_age)
                .collect()
        };

        for data in candidates {
            if !data.try_queue_spill() {
                continue;
            }
            let cache = Arc::clone(&self.disk_cache);
            let task_data = Arc::clone(&data);
            let queued = self.worker.try_submit(Box::new(move || {
                if let Err(e) = task_data.spill_to(&cache) {
                    log::warn!("Failed to spill {:?} build data to disk: {}", task_data.ty(), e);
                }
            }));
            if !queued {
                // queue full; retried next tick
                data.unqueue_spill();
                log::debug!("Disk cache queue full, deferring {:?} spill", data.ty());
                break;
            }
        }
    }

    /// Wait for every queued disk-cache task
    pub fn flush(&self) {
        self.worker.flush();
    }

    /// Builds whose fence has not completed
    pub fn pending_builds(&self) -> usize {
        self.pending.len()
    }

    pub fn statistics(&self) -> AsStats {
        let live: Vec<Arc<AsBuildData>> = lock(&self.tracked).iter().filter_map(Weak::upgrade).collect();
        let mut stats = AsStats {
            cached_blas: lock(&self.blas_cache).len(),
            pending_builds: self.pending.len(),
            disk: self.disk_cache.stats(),
            ..Default::default()
        };
        for data in live {
            match data.state() {
                BuildState::Building => stats.building += 1,
                BuildState::Complete => {
                    stats.in_memory_count += 1;
                    stats.in_memory_bytes += data.byte_size();
                }
                BuildState::DiskCached => {
                    stats.disk_cached_count += 1;
                    stats.disk_cached_bytes += data.byte_size();
                }
            }
            stats.overhead_bytes += data.overhead_bytes();
            let age = data.age();
            let bucket = AGE_BUCKETS.iter().position(|limit| age < *limit).unwrap_or(AGE_BUCKETS.len());
            stats.age_buckets[bucket] += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::desc::{AddressAndStride, GeometryDesc, TrianglesDesc};
    use crate::device::SoftwareDevice;
    use crate::resource::{HeapType, ResourceDesc};

    fn manager(age_ms: u64) -> (Arc<SoftwareDevice>, RtManager, tempfile::TempDir) {
        let device = Arc::new(SoftwareDevice::new());
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            disk_cache_dir: Some(dir.path().to_path_buf()),
            disk_cache_age_ms: age_ms,
            min_scratch_size: 4096,
            ..Default::default()
        };
        let allocator = GpuBufferAllocator::new(device.clone(), config.pool_sizes.clone());
        let rt = RtManager::new(device.clone(), allocator, &config).unwrap();
        (device, rt, dir)
    }

    fn triangle_inputs(vb_address: u64) -> BuildInputs {
        BuildInputs {
            ty: AsType::BottomLevel,
            geometries: vec![GeometryDesc {
                flags: 1,
                kind: GeometryKind::Triangles(TrianglesDesc {
                    vertex_count: 3,
                    vertex_buffer: AddressAndStride { address: vb_address, stride: 12 },
                    index_buffer: 0,
                    transform: 0,
                    ..Default::default()
                }),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_record_build_relocates_and_completes_on_tick() {
        let (device, rt, _dir) = manager(60_000);
        let vb = device.create_resource(&ResourceDesc::buffer(256), HeapType::Upload).unwrap();
        device.fill_buffer(vb, 0, &[7u8; 36]).unwrap();
        let vb_address = device.gpu_address(vb);

        device.pause_completion(true);
        let data = rt
            .record_build(&triangle_inputs(vb_address), |addr| {
                (addr >= vb_address && addr < vb_address + 256).then(|| (vb, addr - vb_address))
            })
            .unwrap();
        assert_eq!(data.state(), BuildState::Building);
        let GeometryKind::Triangles(tri) = data.recipe().geometries[0].kind else {
            panic!("kind changed");
        };
        assert_eq!(tri.vertex_buffer.address, 0);
        assert_eq!(tri.index_buffer, NULL_ADDRESS);
        assert_eq!(tri.transform, NULL_ADDRESS);

        rt.tick();
        assert_eq!(data.state(), BuildState::Building);
        device.pause_completion(false);
        device.wait_idle().unwrap();
        rt.tick();
        assert_eq!(data.state(), BuildState::Complete);
        assert_eq!(data.read_bytes().unwrap(), vec![7u8; 36]);
    }

    #[test]
    fn test_record_build_from_default_triangles_keeps_absent_addresses() {
        let (device, rt, _dir) = manager(60_000);
        let vb = device.create_resource(&ResourceDesc::buffer(256), HeapType::Upload).unwrap();
        device.fill_buffer(vb, 0, &[5u8; 36]).unwrap();
        let vb_address = device.gpu_address(vb);
        let inputs = BuildInputs {
            ty: AsType::BottomLevel,
            geometries: vec![GeometryDesc {
                flags: 0,
                kind: GeometryKind::Triangles(TrianglesDesc {
                    vertex_count: 3,
                    vertex_buffer: AddressAndStride { address: vb_address, stride: 12 },
                    ..Default::default()
                }),
            }],
            ..Default::default()
        };

        let data = rt
            .record_build(&inputs, |addr| {
                (addr >= vb_address && addr < vb_address + 256).then(|| (vb, addr - vb_address))
            })
            .unwrap();
        assert_eq!(data.byte_size(), 36);
        let GeometryKind::Triangles(tri) = data.recipe().geometries[0].kind else {
            panic!("kind changed");
        };
        assert_eq!(tri.transform, NULL_ADDRESS);
        assert_eq!(tri.index_buffer, NULL_ADDRESS);

        let GeometryKind::Triangles(rebased) = data.recipe().geometries[0].rebased(0x10000).kind else {
            panic!("kind changed");
        };
        assert_eq!(rebased.transform, 0);
        assert_eq!(rebased.index_buffer, 0);
        assert_eq!(rebased.vertex_buffer.address, 0x10000);
    }

    #[test]
    fn test_tick_spills_old_data() {
        let (_device, rt, _dir) = manager(0);
        let recipe = BuildRecipe { ty: AsType::BottomLevel, ..Default::default() };
        let data = rt.load_build_data(recipe, &[3u8; 2000]).unwrap();

        rt.tick();
        rt.flush();
        assert_eq!(data.state(), BuildState::DiskCached);
        let stats = rt.statistics();
        assert_eq!(stats.disk_cached_count, 1);
        assert_eq!(stats.disk_cached_bytes, 2000);
        assert!(stats.disk.blocks_used > 0);
        assert_eq!(data.read_bytes().unwrap(), vec![3u8; 2000]);
    }

    #[test]
    fn test_tick_does_not_wait_for_a_full_queue() {
        let device = Arc::new(SoftwareDevice::new());
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            disk_cache_dir: Some(dir.path().to_path_buf()),
            disk_cache_age_ms: 0,
            worker_queue_capacity: 1,
            ..Default::default()
        };
        let allocator = GpuBufferAllocator::new(device.clone(), config.pool_sizes.clone());
        let rt = RtManager::new(device, allocator, &config).unwrap();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        assert!(rt.worker.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })));
        started_rx.recv().unwrap();

        let recipe = BuildRecipe { ty: AsType::BottomLevel, ..Default::default() };
        let data: Vec<_> = (0..4u8).map(|i| rt.load_build_data(recipe.clone(), &[i; 500]).unwrap()).collect();

        let start = std::time::Instant::now();
        rt.tick();
        assert!(start.elapsed() < Duration::from_millis(50));

        release_tx.send(()).unwrap();
        for _ in 0..data.len() + 1 {
            rt.flush();
            rt.tick();
        }
        rt.flush();
        assert!(data.iter().all(|d| d.state() == BuildState::DiskCached));
        assert_eq!(data[3].read_bytes().unwrap(), vec![3u8; 500]);
    }

    #[test]
    fn test_failed_spill_is_retried() {
        let device = Arc::new(SoftwareDevice::new());
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let config = EngineConfig {
            disk_cache_dir: Some(cache_dir.clone()),
            disk_cache_age_ms: 0,
            ..Default::default()
        };
        let allocator = GpuBufferAllocator::new(device.clone(), config.pool_sizes.clone());
        let rt = RtManager::new(device, allocator, &config).unwrap();
        let recipe = BuildRecipe { ty: AsType::BottomLevel, ..Default::default() };
        let data = rt.load_build_data(recipe, &[8u8; 700]).unwrap();

        // the cache directory does not exist yet
        rt.tick();
        rt.flush();
        assert_eq!(data.state(), BuildState::Complete);

        std::fs::create_dir(&cache_dir).unwrap();
        rt.tick();
        rt.flush();
        assert_eq!(data.state(), BuildState::DiskCached);
        assert_eq!(data.read_bytes().unwrap(), vec![8u8; 700]);
    }

    #[test]
    fn test_blas_built_once_then_cloned() {
        let (device, rt, _dir) = manager(60_000);
        let recipe = BuildRecipe { ty: AsType::BottomLevel, geometries: triangle_inputs(0).geometries, ..Default::default() };
        let data = rt.load_build_data(recipe, &[1u8; 36]).unwrap();

        let dest = device.create_resource(&ResourceDesc::buffer(65536), HeapType::Default).unwrap();
        let dest_address = device.gpu_address(dest);
        rt.apply_bottom_level(ResourceId::new(5), &data, dest_address).unwrap();
        rt.apply_bottom_level(ResourceId::new(5), &data, dest_address + 4096).unwrap();

        assert_eq!(rt.statistics().cached_blas, 1);
        let first = device.built_structure(dest_address).unwrap();
        let second = device.built_structure(dest_address + 4096).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ty, AsType::BottomLevel);
    }

    #[test]
    fn test_scratch_grown_from_many_threads() {
        let (_device, rt, _dir) = manager(60_000);
        let rt = Arc::new(rt);
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let rt = Arc::clone(&rt);
                std::thread::spawn(move || rt.scratch(i * 10_000).unwrap().size())
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert!(handle.join().unwrap() >= (i as u64 + 1) * 10_000);
        }
        assert!(rt.scratch(1).unwrap().size() >= 80_000);
    }

    #[test]
    fn test_scratch_grows_to_minimum() {
        let (_device, rt, _dir) = manager(60_000);
        let small = rt.scratch(100).unwrap();
        assert_eq!(small.size(), 4096);
        let same = rt.scratch(4000).unwrap();
        assert_eq!(same.address(), small.address());
        let big = rt.scratch(10_000).unwrap();
        assert!(big.size() >= 10_000);
    }
}
