//! Descriptor and descriptor-heap model

use crate::core::{Error, Result};
use crate::resource::{Format, ResourceId};
use crate::serialise::{Serialise, Serialiser};

/// Kind of descriptor heap
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DescriptorHeapKind {
    #[default]
    CbvSrvUav = 0,
    Sampler = 1,
    Rtv = 2,
    Dsv = 3,
}

impl DescriptorHeapKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DescriptorHeapKind::Sampler,
            2 => DescriptorHeapKind::Rtv,
            3 => DescriptorHeapKind::Dsv,
            _ => DescriptorHeapKind::CbvSrvUav,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SamplerDesc {
    pub filter: u32,
    pub address_u: u8,
    pub address_v: u8,
    pub address_w: u8,
    pub comparison: u8,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

/// View dimension of an SRV/UAV/RTV/DSV
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum ViewDimension {
    #[default]
    Unknown = 0,
    Buffer = 1,
    Texture1D = 2,
    Texture2D = 3,
    Texture2DArray = 4,
    Texture2DMs = 5,
    Texture3D = 6,
    TextureCube = 7,
    /// `first` holds the structure's GPU address
    AccelerationStructure = 8,
}

impl ViewDimension {
    fn from_raw(raw: u32) -> Self {
        use ViewDimension::*;
        match raw {
            1 => Buffer,
            2 => Texture1D,
            3 => Texture2D,
            4 => Texture2DArray,
            5 => Texture2DMs,
            6 => Texture3D,
            7 => TextureCube,
            8 => AccelerationStructure,
            _ => Unknown,
        }
    }
}

/// View parameters shared by the resource-view descriptor kinds
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViewDesc {
    pub format: Format,
    pub dimension: ViewDimension,
    /// First element (buffers), most detailed mip (textures) or AS address
    pub first: u64,
    /// Element count (buffers) or mip count (textures)
    pub count: u32,
    pub first_slice: u32,
    pub slice_count: u32,
    pub stride: u32,
}

/// One descriptor slot
///
/// Generic over how resources are referenced: captured descriptors name
/// [`ResourceId`]s, descriptors handed to a device name native handles.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Descriptor<R = ResourceId> {
    #[default]
    Undefined,
    Sampler(SamplerDesc),
    Cbv { buffer_location: u64, size: u32 },
    Srv { resource: R, view: ViewDesc },
    Uav { resource: R, counter: R, view: ViewDesc },
    Rtv { resource: R, view: ViewDesc },
    Dsv { resource: R, view: ViewDesc },
}

impl<R: Copy> Descriptor<R> {
    /// Rewrite resource references
    pub fn map_resources<T>(self, mut f: impl FnMut(R) -> T) -> Descriptor<T> {
        match self {
            Descriptor::Undefined => Descriptor::Undefined,
            Descriptor::Sampler(s) => Descriptor::Sampler(s),
            Descriptor::Cbv { buffer_location, size } => Descriptor::Cbv { buffer_location, size },
            Descriptor::Srv { resource, view } => Descriptor::Srv { resource: f(resource), view },
            Descriptor::Uav { resource, counter, view } => Descriptor::Uav {
                resource: f(resource),
                counter: f(counter),
                view,
            },
            Descriptor::Rtv { resource, view } => Descriptor::Rtv { resource: f(resource), view },
            Descriptor::Dsv { resource, view } => Descriptor::Dsv { resource: f(resource), view },
        }
    }

    /// Whether this is an acceleration-structure SRV
    pub fn is_acceleration_structure_view(&self) -> bool {
        matches!(self, Descriptor::Srv { view, .. } if view.dimension == ViewDimension::AccelerationStructure)
    }

    /// Clear the GPU address of an acceleration-structure SRV
    pub fn null_acceleration_structure(&mut self) {
        if let Descriptor::Srv { view, .. } = self {
            if view.dimension == ViewDimension::AccelerationStructure {
                view.first = 0;
            }
        }
    }
}

/// Upper bound on the serialised size of one descriptor
pub const DESCRIPTOR_SERIALISED_BOUND: u64 = 96;

impl Serialise for SamplerDesc {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u32(&mut self.filter)?;
        ser.serialise_u8(&mut self.address_u)?;
        ser.serialise_u8(&mut self.address_v)?;
        ser.serialise_u8(&mut self.address_w)?;
        ser.serialise_u8(&mut self.comparison)?;
        ser.serialise_f32(&mut self.mip_lod_bias)?;
        ser.serialise_u32(&mut self.max_anisotropy)?;
        for c in self.border_color.iter_mut() {
            ser.serialise_f32(c)?;
        }
        ser.serialise_f32(&mut self.min_lod)?;
        ser.serialise_f32(&mut self.max_lod)
    }
}

impl Serialise for ViewDesc {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        let mut format = self.format.raw();
        let mut dimension = self.dimension as u32;
        ser.serialise_u32(&mut format)?;
        ser.serialise_u32(&mut dimension)?;
        self.format = Format::from_raw(format);
        self.dimension = ViewDimension::from_raw(dimension);
        ser.serialise_u64(&mut self.first)?;
        ser.serialise_u32(&mut self.count)?;
        ser.serialise_u32(&mut self.first_slice)?;
        ser.serialise_u32(&mut self.slice_count)?;
        ser.serialise_u32(&mut self.stride)
    }
}

impl Serialise for Descriptor {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        let mut tag: u32 = match self {
            Descriptor::Undefined => 0,
            Descriptor::Sampler(_) => 1,
            Descriptor::Cbv { .. } => 2,
            Descriptor::Srv { .. } => 3,
            Descriptor::Uav { .. } => 4,
            Descriptor::Rtv { .. } => 5,
            Descriptor::Dsv { .. } => 6,
        };
        ser.serialise_u32(&mut tag)?;

        if ser.is_reading() {
            *self = match tag {
                0 => Descriptor::Undefined,
                1 => Descriptor::Sampler(SamplerDesc::default()),
                2 => Descriptor::Cbv { buffer_location: 0, size: 0 },
                3 => Descriptor::Srv { resource: ResourceId::NULL, view: ViewDesc::default() },
                4 => Descriptor::Uav {
                    resource: ResourceId::NULL,
                    counter: ResourceId::NULL,
                    view: ViewDesc::default(),
                },
                5 => Descriptor::Rtv { resource: ResourceId::NULL, view: ViewDesc::default() },
                6 => Descriptor::Dsv { resource: ResourceId::NULL, view: ViewDesc::default() },
                other => {
                    return Err(Error::SerialisationRead(format!("unknown descriptor tag {other}")));
                }
            };
        }

        match self {
            Descriptor::Undefined => Ok(()),
            Descriptor::Sampler(sampler) => sampler.serialise(ser),
            Descriptor::Cbv { buffer_location, size } => {
                ser.serialise_u64(buffer_location)?;
                ser.serialise_u32(size)
            }
            Descriptor::Srv { resource, view }
            | Descriptor::Rtv { resource, view }
            | Descriptor::Dsv { resource, view } => {
                resource.serialise(ser)?;
                view.serialise(ser)
            }
            Descriptor::Uav { resource, counter, view } => {
                resource.serialise(ser)?;
                counter.serialise(ser)?;
                view.serialise(ser)
            }
        }
    }
}
