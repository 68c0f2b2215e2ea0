//! GPU buffer allocation

pub mod intervals;
pub mod allocator;

pub use allocator::{
    as_aligned, AllocatorStats, GpuBuffer, GpuBufferAllocator, GpuBufferHeapType, GpuBufferMemory,
};
