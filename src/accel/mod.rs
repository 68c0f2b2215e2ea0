//! Ray-tracing acceleration structures
//!
//! Build recipes with relocatable addresses, their shared build data, the
//! disk cache that spilled data moves to, and TLAS address patching.

pub mod desc;
pub mod build_data;
pub mod disk_cache;
pub mod worker;
pub mod pending;
pub mod patch;
pub mod manager;

pub use desc::{
    AabbsDesc, AddressAndStride, AsCopyMode, AsType, BuildFlags, BuildInputs, GeometryDesc, GeometryKind,
    IndexFormat, InstanceDesc, PrebuildInfo, SerializedAsHeader, TrianglesDesc, AS_BYTE_ALIGNMENT,
    GEOMETRY_SERIALISED_BOUND, INSTANCE_DESC_SIZE, NULL_ADDRESS, SERIALIZED_HEADER_SIZE, is_absent_address,
};
pub use build_data::{AsBuildData, BuildRecipe, BuildState};
pub use disk_cache::{DiskCache, DiskCacheStats, DiskCachedAs};
pub use patch::{patch_instances, patch_serialized_blob, read_serialized_header, PatchFailure, PatchSummary};
pub use manager::{AsStats, RtManager};
