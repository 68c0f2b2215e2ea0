//! Shared acceleration-structure build data
//!
//! [`AsBuildData`] pairs an immutable [`BuildRecipe`] with the geometry or
//! instance bytes the build reads. Addresses in the recipe are offsets into
//! those bytes. The bytes live in a pooled GPU buffer until they are spilled
//! to the disk cache; the storage slot is the only mutable part and is
//! guarded by its own lock. Dropping the last reference frees whichever
//! backing store is current, exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::accel::desc::{AsType, BuildFlags, BuildInputs, GeometryDesc, INSTANCE_DESC_SIZE};
use crate::accel::disk_cache::{DiskCache, DiskCachedAs};
use crate::alloc::{GpuBuffer, GpuBufferAllocator, GpuBufferHeapType, GpuBufferMemory};
use crate::core::{Error, Result};
use crate::serialise::{Serialise, Serialiser};

/// Alignment of each copied range inside the build data buffer
pub const BUILD_DATA_ALIGNMENT: u64 = 16;

/// What to build, with relocatable addresses
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildRecipe {
    pub ty: AsType,
    pub flags: BuildFlags,
    /// Instance count of a TLAS
    pub num_blas: u32,
    pub geometries: Vec<GeometryDesc>,
}

impl BuildRecipe {
    /// Build inputs for a BLAS whose data buffer sits at `base`
    pub fn bottom_level_inputs(&self, base: u64) -> BuildInputs {
        BuildInputs {
            ty: AsType::BottomLevel,
            flags: self.flags,
            geometries: self.geometries.iter().map(|g| g.rebased(base)).collect(),
            num_instances: 0,
            instance_descs: 0,
        }
    }

    /// Build inputs for a TLAS reading instances at `instances`
    pub fn top_level_inputs(&self, instances: u64) -> BuildInputs {
        BuildInputs {
            ty: AsType::TopLevel,
            flags: self.flags,
            geometries: Vec::new(),
            num_instances: self.num_blas,
            instance_descs: if self.num_blas == 0 { 0 } else { instances },
        }
    }

    /// Bytes of instance records a TLAS reads
    pub fn instance_bytes(&self) -> u64 {
        u64::from(self.num_blas) * INSTANCE_DESC_SIZE
    }
}

impl Serialise for BuildRecipe {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        let mut ty = self.ty as u32;
        ser.serialise_u32(&mut ty)?;
        self.ty = AsType::from_raw(ty)?;
        ser.serialise_u32(&mut self.flags.0)?;
        ser.serialise_u32(&mut self.num_blas)?;
        ser.serialise_array(&mut self.geometries)
    }
}

/// Lifecycle of one build's data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    /// GPU copy of the source data still in flight
    Building,
    /// Data resident in a GPU buffer
    Complete,
    /// Data spilled to the disk cache
    DiskCached,
}

enum BuildStorage {
    Empty,
    InMemory(GpuBuffer),
    DiskCached { location: DiskCachedAs, cache: Arc<DiskCache> },
}

pub struct AsBuildData {
    recipe: BuildRecipe,
    byte_size: u64,
    created: Instant,
    complete: AtomicBool,
    spill_queued: AtomicBool,
    storage: Mutex<BuildStorage>,
}

impl std::fmt::Debug for AsBuildData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsBuildData")
            .field("ty", &self.recipe.ty)
            .field("geometries", &self.recipe.geometries.len())
            .field("byte_size", &self.byte_size)
            .field("state", &self.state())
            .finish()
    }
}

impl AsBuildData {
    /// Build data backed by `buffer`; `complete` is false while a GPU copy fills it
    pub fn new(recipe: BuildRecipe, buffer: Option<GpuBuffer>, byte_size: u64, complete: bool) -> Arc<Self> {
        let storage = match buffer {
            Some(buffer) => BuildStorage::InMemory(buffer),
            None => BuildStorage::Empty,
        };
        Arc::new(Self {
            recipe,
            byte_size,
            created: Instant::now(),
            complete: AtomicBool::new(complete),
            spill_queued: AtomicBool::new(false),
            storage: Mutex::new(storage),
        })
    }

    fn storage(&self) -> MutexGuard<'_, BuildStorage> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recipe(&self) -> &BuildRecipe {
        &self.recipe
    }

    pub fn ty(&self) -> AsType {
        self.recipe.ty
    }

    /// Length of the geometry or instance bytes
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn state(&self) -> BuildState {
        if !self.is_complete() {
            return BuildState::Building;
        }
        match *self.storage() {
            BuildStorage::DiskCached { .. } => BuildState::DiskCached,
            _ => BuildState::Complete,
        }
    }

    /// GPU bytes held beyond the data itself
    pub fn overhead_bytes(&self) -> u64 {
        match &*self.storage() {
            BuildStorage::InMemory(buffer) => buffer.size().saturating_sub(self.byte_size),
            BuildStorage::DiskCached { location, .. } => {
                location.block_count as u64 * crate::accel::disk_cache::BLOCK_SIZE - location.stored_size
            }
            BuildStorage::Empty => 0,
        }
    }

    /// In-memory buffer, if the data is not spilled
    pub fn buffer(&self) -> Option<GpuBuffer> {
        match &*self.storage() {
            BuildStorage::InMemory(buffer) => Some(buffer.clone()),
            _ => None,
        }
    }

    /// Copy of the data bytes, from memory or disk
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        if self.byte_size == 0 {
            return Ok(Vec::new());
        }
        // clone the store out so no lock is held across device or file I/O
        let source = match &*self.storage() {
            BuildStorage::InMemory(buffer) => Ok(buffer.clone()),
            BuildStorage::DiskCached { location, cache } => Err((*location, Arc::clone(cache))),
            BuildStorage::Empty => return Err(Error::DiskCache("build data has no backing store".into())),
        };
        let mut bytes = match source {
            Ok(buffer) => buffer.read()?,
            Err((location, cache)) => cache.read(&location)?,
        };
        bytes.truncate(self.byte_size as usize);
        Ok(bytes)
    }

    /// GPU buffer holding the data, reloading it from disk if it was spilled
    pub fn ensure_resident(&self, allocator: &GpuBufferAllocator) -> Result<Option<GpuBuffer>> {
        if self.byte_size == 0 {
            return Ok(None);
        }
        if let Some(buffer) = self.buffer() {
            return Ok(Some(buffer));
        }

        let bytes = self.read_bytes()?;
        let buffer = allocator.alloc(
            GpuBufferHeapType::Upload,
            GpuBufferMemory::Default,
            self.byte_size,
            BUILD_DATA_ALIGNMENT,
        )?;
        buffer.write(0, &bytes)?;

        let mut storage = self.storage();
        match &*storage {
            // raced with another reload
            BuildStorage::InMemory(existing) => return Ok(Some(existing.clone())),
            BuildStorage::DiskCached { location, cache } => cache.release(location),
            BuildStorage::Empty => {}
        }
        *storage = BuildStorage::InMemory(buffer.clone());
        self.spill_queued.store(false, Ordering::Release);
        log::debug!("Reloaded {} bytes of {:?} build data from disk", self.byte_size, self.recipe.ty);
        Ok(Some(buffer))
    }

    /// Claim the right to queue a spill; false if one is already queued
    pub(crate) fn try_queue_spill(&self) -> bool {
        !self.spill_queued.swap(true, Ordering::AcqRel)
    }

    /// Give up a claimed spill so a later tick can queue it again
    pub(crate) fn unqueue_spill(&self) {
        self.spill_queued.store(false, Ordering::Release);
    }

    /// Move the data to the disk cache and free the GPU buffer
    ///
    /// Returns false when there was nothing to spill. A failed spill leaves
    /// the data in memory and eligible for another attempt.
    pub fn spill_to(&self, cache: &Arc<DiskCache>) -> Result<bool> {
        let spilled = self.write_to_cache(cache);
        if spilled.is_err() {
            self.unqueue_spill();
        }
        spilled
    }

    fn write_to_cache(&self, cache: &Arc<DiskCache>) -> Result<bool> {
        let Some(buffer) = self.buffer() else {
            return Ok(false);
        };
        let mut bytes = buffer.read()?;
        bytes.truncate(self.byte_size as usize);
        let location = cache.write(&bytes)?;

        let mut storage = self.storage();
        let still_same = matches!(
            &*storage,
            BuildStorage::InMemory(current)
                if current.resource() == buffer.resource() && current.offset() == buffer.offset()
        );
        if !still_same {
            cache.release(&location);
            return Ok(false);
        }
        *storage = BuildStorage::DiskCached { location, cache: Arc::clone(cache) };
        log::debug!(
            "Spilled {} bytes of {:?} build data to disk ({} blocks)",
            self.byte_size,
            self.recipe.ty,
            location.block_count
        );
        Ok(true)
    }
}

impl Drop for AsBuildData {
    fn drop(&mut self) {
        let storage = std::mem::replace(
            self.storage.get_mut().unwrap_or_else(PoisonError::into_inner),
            BuildStorage::Empty,
        );
        if let BuildStorage::DiskCached { location, cache } = storage {
            cache.release(&location);
        }
        // an in-memory buffer returns to its pool when the handle drops
    }
}
