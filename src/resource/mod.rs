//! Resource identity, descriptions and the live-object registry

pub mod id;
pub mod desc;
pub mod descriptor;
pub mod registry;

pub use id::{IdAllocator, ResourceId};
pub use desc::{
    Dimension, Format, HeapType, PlacedFootprint, PlaneInfo, ResourceDesc, ResourceFlags,
    ResourceType, Subresource, TEXTURE_DATA_PITCH_ALIGNMENT, TEXTURE_DATA_PLACEMENT_ALIGNMENT,
};
pub use descriptor::{
    Descriptor, DescriptorHeapKind, SamplerDesc, ViewDesc, ViewDimension, DESCRIPTOR_SERIALISED_BOUND,
};
pub use registry::{
    AccelStructInfo, DescriptorHeapInfo, ResourceDetails, ResourceInfo, ResourceRecord, ResourceRegistry,
};
