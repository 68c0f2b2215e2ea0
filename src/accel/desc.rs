//! Acceleration-structure build descriptions
//!
//! Geometry stored in build data uses relocatable addresses (offsets into the
//! build data's own buffer). [`NULL_ADDRESS`] marks an absent address and
//! rebases to 0.

use bytemuck::{Pod, Zeroable};

use crate::core::{Error, Result};
use crate::resource::Format;
use crate::serialise::{Serialise, Serialiser};

/// Relocatable "no address" sentinel
pub const NULL_ADDRESS: u64 = u64::MAX;

/// Whether an application GPU address means "none"
///
/// Applications pass either 0 or [`NULL_ADDRESS`].
#[inline]
pub fn is_absent_address(address: u64) -> bool {
    address == 0 || address == NULL_ADDRESS
}

/// Size of one TLAS instance record
pub const INSTANCE_DESC_SIZE: u64 = std::mem::size_of::<InstanceDesc>() as u64;

/// Required alignment of acceleration structure storage
pub const AS_BYTE_ALIGNMENT: u64 = 256;

/// Upper bound on the serialised size of one geometry description
pub const GEOMETRY_SERIALISED_BOUND: u64 = 96;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AsType {
    #[default]
    TopLevel = 0,
    BottomLevel = 1,
}

impl AsType {
    pub(crate) fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(AsType::TopLevel),
            1 => Ok(AsType::BottomLevel),
            other => Err(Error::SerialisationRead(format!("unknown AS type {other}"))),
        }
    }
}

/// Build flags, stored verbatim
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BuildFlags(pub u32);

impl BuildFlags {
    pub const ALLOW_UPDATE: u32 = 0x1;
    pub const ALLOW_COMPACTION: u32 = 0x2;
    pub const PREFER_FAST_TRACE: u32 = 0x4;
    pub const PREFER_FAST_BUILD: u32 = 0x8;
    pub const MINIMIZE_MEMORY: u32 = 0x10;
    pub const PERFORM_UPDATE: u32 = 0x20;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AddressAndStride {
    pub address: u64,
    pub stride: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IndexFormat {
    #[default]
    None = 0,
    Uint16 = 16,
    Uint32 = 32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::None => 0,
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            16 => IndexFormat::Uint16,
            32 => IndexFormat::Uint32,
            _ => IndexFormat::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrianglesDesc {
    /// 3x4 row-major transform, or [`NULL_ADDRESS`]/0
    pub transform: u64,
    pub index_format: IndexFormat,
    pub vertex_format: Format,
    pub index_count: u32,
    pub vertex_count: u32,
    pub index_buffer: u64,
    pub vertex_buffer: AddressAndStride,
}

impl Default for TrianglesDesc {
    fn default() -> Self {
        Self {
            transform: NULL_ADDRESS,
            index_format: IndexFormat::None,
            vertex_format: Format::Rg32Float,
            index_count: 0,
            vertex_count: 0,
            index_buffer: NULL_ADDRESS,
            vertex_buffer: AddressAndStride::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AabbsDesc {
    pub count: u64,
    pub aabbs: AddressAndStride,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Triangles(TrianglesDesc),
    Aabbs(AabbsDesc),
}

impl Default for GeometryKind {
    fn default() -> Self {
        GeometryKind::Triangles(TrianglesDesc::default())
    }
}

/// One BLAS geometry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GeometryDesc {
    pub flags: u32,
    pub kind: GeometryKind,
}

fn rebase_address(rva: u64, base: u64) -> u64 {
    if rva == NULL_ADDRESS { 0 } else { base + rva }
}

impl GeometryDesc {
    /// Convert relocatable addresses to absolute ones inside a buffer at `base`
    pub fn rebased(&self, base: u64) -> GeometryDesc {
        let kind = match self.kind {
            GeometryKind::Triangles(mut tri) => {
                tri.transform = rebase_address(tri.transform, base);
                tri.index_buffer = rebase_address(tri.index_buffer, base);
                // vertex data is always present
                tri.vertex_buffer.address = base + tri.vertex_buffer.address;
                GeometryKind::Triangles(tri)
            }
            GeometryKind::Aabbs(mut aabbs) => {
                aabbs.aabbs.address = if aabbs.count == 0 {
                    0
                } else {
                    rebase_address(aabbs.aabbs.address, base)
                };
                GeometryKind::Aabbs(aabbs)
            }
        };
        GeometryDesc { flags: self.flags, kind }
    }
}

impl Serialise for AddressAndStride {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u64(&mut self.address)?;
        ser.serialise_u64(&mut self.stride)
    }
}

impl Serialise for GeometryDesc {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        let mut kind: u32 = match self.kind {
            GeometryKind::Triangles(_) => 0,
            GeometryKind::Aabbs(_) => 1,
        };
        ser.serialise_u32(&mut kind)?;
        ser.serialise_u32(&mut self.flags)?;

        if ser.is_reading() {
            self.kind = match kind {
                0 => GeometryKind::Triangles(TrianglesDesc::default()),
                1 => GeometryKind::Aabbs(AabbsDesc::default()),
                other => {
                    return Err(Error::SerialisationRead(format!("unknown geometry kind {other}")));
                }
            };
        }

        match &mut self.kind {
            GeometryKind::Triangles(tri) => {
                let mut index_format = tri.index_format as u32;
                let mut vertex_format = tri.vertex_format.raw();
                ser.serialise_u64(&mut tri.transform)?;
                ser.serialise_u32(&mut index_format)?;
                ser.serialise_u32(&mut vertex_format)?;
                tri.index_format = IndexFormat::from_raw(index_format);
                tri.vertex_format = Format::from_raw(vertex_format);
                ser.serialise_u32(&mut tri.index_count)?;
                ser.serialise_u32(&mut tri.vertex_count)?;
                ser.serialise_u64(&mut tri.index_buffer)?;
                tri.vertex_buffer.serialise(ser)
            }
            GeometryKind::Aabbs(aabbs) => {
                ser.serialise_u64(&mut aabbs.count)?;
                aabbs.aabbs.serialise(ser)
            }
        }
    }
}

/// Inputs of one AS build, with absolute GPU addresses
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildInputs {
    pub ty: AsType,
    pub flags: BuildFlags,
    /// BLAS geometries
    pub geometries: Vec<GeometryDesc>,
    /// TLAS instance count
    pub num_instances: u32,
    /// TLAS instance array address
    pub instance_descs: u64,
}

/// Memory requirements of a build
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_max_size: u64,
    pub scratch_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsCopyMode {
    Clone,
    /// Write a driver-specific blob at the destination
    Serialize,
    /// Rebuild a structure from a blob at the source
    Deserialize,
}

/// One TLAS instance as laid out in GPU memory
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    /// Instance id (24 bits) and mask (8 bits)
    pub instance_id_and_mask: u32,
    /// Hit group contribution (24 bits) and flags (8 bits)
    pub contribution_and_flags: u32,
    pub acceleration_structure: u64,
}

/// Header of a driver-serialised acceleration structure
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SerializedAsHeader {
    pub driver_id: [u8; 32],
    pub serialized_size: u64,
    pub deserialized_size: u64,
    /// Count of BLAS addresses stored right after the header
    pub num_blas: u64,
}

pub const SERIALIZED_HEADER_SIZE: usize = std::mem::size_of::<SerializedAsHeader>();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialise::{ReadSerialiser, WriteSerialiser, CURRENT_VERSION};

    #[test]
    fn test_layout_sizes() {
        assert_eq!(INSTANCE_DESC_SIZE, 64);
        assert_eq!(SERIALIZED_HEADER_SIZE, 56);
    }

    #[test]
    fn test_rebase_triangles() {
        let geom = GeometryDesc {
            flags: 1,
            kind: GeometryKind::Triangles(TrianglesDesc {
                transform: NULL_ADDRESS,
                index_buffer: 0x100,
                vertex_buffer: AddressAndStride { address: 0x200, stride: 12 },
                ..Default::default()
            }),
        };
        let GeometryKind::Triangles(tri) = geom.rebased(0x10_0000).kind else {
            panic!("kind changed");
        };
        assert_eq!(tri.transform, 0);
        assert_eq!(tri.index_buffer, 0x10_0100);
        assert_eq!(tri.vertex_buffer.address, 0x10_0200);
    }

    #[test]
    fn test_rebase_empty_aabbs_is_null() {
        let geom = GeometryDesc {
            flags: 0,
            kind: GeometryKind::Aabbs(AabbsDesc { count: 0, aabbs: AddressAndStride { address: 64, stride: 24 } }),
        };
        let GeometryKind::Aabbs(aabbs) = geom.rebased(0x4000).kind else {
            panic!("kind changed");
        };
        assert_eq!(aabbs.aabbs.address, 0);
    }

    #[test]
    fn test_geometry_serialise_within_bound() {
        let geoms = [
            GeometryDesc { flags: 2, kind: GeometryKind::Triangles(TrianglesDesc { index_format: IndexFormat::Uint32, index_count: 36, vertex_count: 24, ..Default::default() }) },
            GeometryDesc { flags: 0, kind: GeometryKind::Aabbs(AabbsDesc { count: 3, aabbs: AddressAndStride { address: 0, stride: 24 } }) },
        ];
        for mut geom in geoms {
            let mut writer = WriteSerialiser::new(Vec::new());
            geom.serialise(&mut writer).expect("write");
            assert!(writer.bytes_written() <= GEOMETRY_SERIALISED_BOUND);
            let bytes = writer.into_inner();
            let mut decoded = GeometryDesc::default();
            decoded.serialise(&mut ReadSerialiser::new(&bytes, CURRENT_VERSION)).expect("read");
            assert_eq!(decoded, geom);
        }
    }

    #[test]
    fn test_as_type_from_raw() {
        assert_eq!(AsType::from_raw(1).expect("valid"), AsType::BottomLevel);
        assert!(AsType::from_raw(9).is_err());
    }
}
