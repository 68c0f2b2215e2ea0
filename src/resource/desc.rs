//! Resource descriptions, formats and subresource layout math

use crate::core::align_up;

/// Row pitch alignment for buffer<->texture copies
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// Placement alignment of each subresource inside a copy buffer
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// Persisted type tag of a registered object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceType {
    Unknown = 0,
    DescriptorHeap = 1,
    Heap = 2,
    Resource = 3,
    AccelerationStructure = 4,
}

impl ResourceType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ResourceType::DescriptorHeap,
            2 => ResourceType::Heap,
            3 => ResourceType::Resource,
            4 => ResourceType::AccelerationStructure,
            _ => ResourceType::Unknown,
        }
    }

    /// Whether objects of this type carry initial contents
    pub fn has_initial_state(self) -> bool {
        matches!(
            self,
            ResourceType::DescriptorHeap | ResourceType::Resource | ResourceType::AccelerationStructure
        )
    }
}

/// Memory heap a resource lives in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU-local, not CPU visible
    #[default]
    Default,
    /// CPU write-combined, GPU read
    Upload,
    /// GPU write, CPU read
    Readback,
    /// Custom CPU-visible heap usable as a copy source/destination
    CpuVisible,
}

impl HeapType {
    /// Heaps whose replay data stays on the CPU and is written with a CPU copy
    pub fn is_cpu_written(self) -> bool {
        matches!(self, HeapType::Upload | HeapType::CpuVisible)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dimension {
    #[default]
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// Layout of one plane of a format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneInfo {
    pub bytes_per_block: u32,
    pub block_width: u32,
    pub block_height: u32,
    /// Horizontal subsampling relative to plane 0
    pub subsample_x: u32,
    /// Vertical subsampling relative to plane 0
    pub subsample_y: u32,
}

impl PlaneInfo {
    const fn texel(bytes: u32) -> Self {
        Self { bytes_per_block: bytes, block_width: 1, block_height: 1, subsample_x: 1, subsample_y: 1 }
    }

    const fn block(bytes: u32) -> Self {
        Self { bytes_per_block: bytes, block_width: 4, block_height: 4, subsample_x: 1, subsample_y: 1 }
    }
}

/// Texel formats understood by the layout math
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Format {
    #[default]
    Unknown = 0,
    R8Unorm = 1,
    Rg8Unorm = 2,
    Rgba8Unorm = 3,
    Bgra8Unorm = 4,
    R16Float = 5,
    Rgba16Float = 6,
    R32Float = 7,
    R32Uint = 8,
    Rg32Float = 9,
    Rgba32Float = 10,
    D16Unorm = 11,
    D32Float = 12,
    D24UnormS8Uint = 13,
    D32FloatS8X24Uint = 14,
    Bc1Unorm = 15,
    Bc3Unorm = 16,
    Bc7Unorm = 17,
    Nv12 = 18,
}

impl Format {
    pub fn from_raw(raw: u32) -> Self {
        use Format::*;
        const ALL: [Format; 19] = [
            Unknown, R8Unorm, Rg8Unorm, Rgba8Unorm, Bgra8Unorm, R16Float, Rgba16Float, R32Float,
            R32Uint, Rg32Float, Rgba32Float, D16Unorm, D32Float, D24UnormS8Uint,
            D32FloatS8X24Uint, Bc1Unorm, Bc3Unorm, Bc7Unorm, Nv12,
        ];
        ALL.get(raw as usize).copied().unwrap_or(Unknown)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Number of planes; depth-stencil and video formats have two
    pub fn plane_count(self) -> u32 {
        match self {
            Format::D24UnormS8Uint | Format::D32FloatS8X24Uint | Format::Nv12 => 2,
            _ => 1,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8X24Uint
        )
    }

    /// Layout of `plane`
    pub fn plane(self, plane: u32) -> PlaneInfo {
        match (self, plane) {
            (Format::Unknown | Format::R8Unorm, _) => PlaneInfo::texel(1),
            (Format::Rg8Unorm | Format::R16Float | Format::D16Unorm, _) => PlaneInfo::texel(2),
            (Format::Rgba8Unorm | Format::Bgra8Unorm | Format::R32Float | Format::R32Uint
                | Format::D32Float, _) => PlaneInfo::texel(4),
            (Format::Rgba16Float | Format::Rg32Float, _) => PlaneInfo::texel(8),
            (Format::Rgba32Float, _) => PlaneInfo::texel(16),
            (Format::D24UnormS8Uint | Format::D32FloatS8X24Uint, 0) => PlaneInfo::texel(4),
            (Format::D24UnormS8Uint | Format::D32FloatS8X24Uint, _) => PlaneInfo::texel(1),
            (Format::Bc1Unorm, _) => PlaneInfo::block(8),
            (Format::Bc3Unorm | Format::Bc7Unorm, _) => PlaneInfo::block(16),
            (Format::Nv12, 0) => PlaneInfo::texel(1),
            (Format::Nv12, _) => PlaneInfo { subsample_x: 2, subsample_y: 2, ..PlaneInfo::texel(2) },
        }
    }
}

/// Usage flags that affect how a copy of the resource must be created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceFlags {
    pub allow_render_target: bool,
    pub allow_depth_stencil: bool,
    pub allow_unordered_access: bool,
    /// Reserved (sparse) resource
    pub sparse: bool,
    /// Buffer holding acceleration structures
    pub acceleration_structure: bool,
}

/// Decomposed subresource index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subresource {
    pub mip: u32,
    pub array_slice: u32,
    pub plane: u32,
}

/// Placement of one subresource inside a linear copy buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlacedFootprint {
    pub subresource: u32,
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u64,
    pub num_rows: u32,
    pub row_size: u64,
}

impl PlacedFootprint {
    /// Bytes spanned from `offset`, the last row unpadded
    pub fn total_bytes(&self) -> u64 {
        let rows = u64::from(self.num_rows) * u64::from(self.depth);
        if rows == 0 {
            return 0;
        }
        self.row_pitch * (rows - 1) + self.row_size
    }

    /// Size of the subresource with rows packed tightly
    pub fn tight_bytes(&self) -> u64 {
        self.row_size * u64::from(self.num_rows) * u64::from(self.depth)
    }
}

/// Description of a buffer or texture
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub dimension: Dimension,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub sample_count: u32,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: Dimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            sample_count: 1,
            flags: ResourceFlags::default(),
        }
    }

    pub fn texture_2d(width: u32, height: u32, array_size: u32, mip_levels: u32, format: Format) -> Self {
        Self {
            dimension: Dimension::Texture2D,
            width: u64::from(width),
            height,
            depth_or_array_size: array_size,
            mip_levels,
            format,
            sample_count: 1,
            flags: ResourceFlags::default(),
        }
    }

    pub fn texture_3d(width: u32, height: u32, depth: u32, mip_levels: u32, format: Format) -> Self {
        Self {
            dimension: Dimension::Texture3D,
            depth_or_array_size: depth,
            ..Self::texture_2d(width, height, 1, mip_levels, format)
        }
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == Dimension::Buffer
    }

    pub fn is_msaa(&self) -> bool {
        self.sample_count > 1
    }

    pub fn array_size(&self) -> u32 {
        match self.dimension {
            Dimension::Texture3D | Dimension::Buffer => 1,
            _ => self.depth_or_array_size.max(1),
        }
    }

    pub fn mip_width(&self, mip: u32) -> u32 {
        ((self.width >> mip) as u32).max(1)
    }

    pub fn mip_height(&self, mip: u32) -> u32 {
        (self.height >> mip).max(1)
    }

    pub fn mip_depth(&self, mip: u32) -> u32 {
        match self.dimension {
            Dimension::Texture3D => (self.depth_or_array_size >> mip).max(1),
            _ => 1,
        }
    }

    pub fn plane_count(&self) -> u32 {
        if self.is_buffer() { 1 } else { self.format.plane_count() }
    }

    /// Number of subresources; planes only count when `with_planes` is set
    pub fn subresource_count(&self, with_planes: bool) -> u32 {
        if self.is_buffer() {
            return 1;
        }
        let planes = if with_planes { self.plane_count() } else { 1 };
        self.mip_levels.max(1) * self.array_size() * planes
    }

    pub fn subresource_index(&self, mip: u32, array_slice: u32, plane: u32) -> u32 {
        let mips = self.mip_levels.max(1);
        mip + array_slice * mips + plane * mips * self.array_size()
    }

    pub fn decompose(&self, subresource: u32) -> Subresource {
        let mips = self.mip_levels.max(1);
        let arrays = self.array_size();
        Subresource {
            mip: subresource % mips,
            array_slice: (subresource / mips) % arrays,
            plane: subresource / (mips * arrays),
        }
    }

    /// Description of the single-sampled array that holds every sample of an MSAA texture
    pub fn msaa_array_desc(&self) -> Self {
        let mut desc = *self;
        desc.depth_or_array_size = self.array_size() * self.sample_count.max(1);
        desc.sample_count = 1;
        desc
    }

    /// Footprint of `subresource` placed at `offset` in a copy buffer
    pub fn footprint(&self, subresource: u32, offset: u64) -> PlacedFootprint {
        if self.is_buffer() {
            return PlacedFootprint {
                subresource,
                offset,
                width: self.width as u32,
                height: 1,
                depth: 1,
                row_pitch: self.width,
                num_rows: 1,
                row_size: self.width,
            };
        }

        let sub = self.decompose(subresource);
        let info = self.format.plane(sub.plane);
        let width = (self.mip_width(sub.mip) / info.subsample_x).max(1);
        let height = (self.mip_height(sub.mip) / info.subsample_y).max(1);
        let depth = self.mip_depth(sub.mip);

        let blocks_wide = width.div_ceil(info.block_width);
        let num_rows = height.div_ceil(info.block_height);
        let row_size = u64::from(blocks_wide) * u64::from(info.bytes_per_block);

        PlacedFootprint {
            subresource,
            offset,
            width,
            height,
            depth,
            row_pitch: align_up(row_size, TEXTURE_DATA_PITCH_ALIGNMENT),
            num_rows,
            row_size,
        }
    }

    /// Lay out `subresources` back to back in a copy buffer
    ///
    /// Returns the footprints and the buffer size needed to hold them.
    pub fn copyable_footprints(&self, subresources: impl IntoIterator<Item = u32>) -> (Vec<PlacedFootprint>, u64) {
        let mut footprints = Vec::new();
        let mut offset = 0u64;
        for sub in subresources {
            let placed = align_up(offset, TEXTURE_DATA_PLACEMENT_ALIGNMENT);
            let footprint = self.footprint(sub, placed);
            offset = placed + footprint.total_bytes();
            footprints.push(footprint);
        }
        (footprints, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_count_and_planes() {
        let tex = ResourceDesc::texture_2d(64, 64, 3, 4, Format::D24UnormS8Uint);
        assert_eq!(tex.subresource_count(false), 12);
        assert_eq!(tex.subresource_count(true), 24);

        let volume = ResourceDesc::texture_3d(32, 32, 8, 3, Format::Rgba8Unorm);
        assert_eq!(volume.subresource_count(true), 3);
        assert_eq!(volume.mip_depth(2), 2);
    }

    #[test]
    fn test_decompose_round_trips_index() {
        let tex = ResourceDesc::texture_2d(16, 16, 5, 3, Format::Nv12);
        for sub in 0..tex.subresource_count(true) {
            let parts = tex.decompose(sub);
            assert_eq!(tex.subresource_index(parts.mip, parts.array_slice, parts.plane), sub);
        }
    }

    #[test]
    fn test_footprint_pitch_and_placement() {
        let tex = ResourceDesc::texture_2d(100, 10, 1, 2, Format::Rgba8Unorm);
        let (prints, total) = tex.copyable_footprints(0..2);
        assert_eq!(prints[0].row_size, 400);
        assert_eq!(prints[0].row_pitch, 512);
        assert_eq!(prints[0].total_bytes(), 512 * 9 + 400);
        assert_eq!(prints[1].offset % TEXTURE_DATA_PLACEMENT_ALIGNMENT, 0);
        assert_eq!(prints[1].width, 50);
        assert_eq!(total, prints[1].offset + prints[1].total_bytes());
    }

    #[test]
    fn test_block_compressed_and_subsampled_planes() {
        let bc = ResourceDesc::texture_2d(10, 10, 1, 1, Format::Bc1Unorm);
        let fp = bc.footprint(0, 0);
        assert_eq!(fp.num_rows, 3);
        assert_eq!(fp.row_size, 24);

        let nv12 = ResourceDesc::texture_2d(64, 32, 1, 1, Format::Nv12);
        let chroma = nv12.footprint(1, 0);
        assert_eq!((chroma.width, chroma.height), (32, 16));
        assert_eq!(chroma.row_size, 64);
    }

    #[test]
    fn test_small_mips_clamp_to_one() {
        let tex = ResourceDesc::texture_2d(4, 4, 1, 5, Format::R8Unorm);
        let fp = tex.footprint(4, 0);
        assert_eq!((fp.width, fp.height), (1, 1));
    }

    #[test]
    fn test_msaa_array_desc() {
        let rt = ResourceDesc::texture_2d(256, 256, 1, 1, Format::Rgba8Unorm).with_samples(4);
        let array = rt.msaa_array_desc();
        assert_eq!(array.sample_count, 1);
        assert_eq!(array.array_size(), 4);
        assert_eq!((array.width, array.height), (256, 256));
    }

    #[test]
    fn test_format_raw_round_trip() {
        for raw in 0..19 {
            assert_eq!(Format::from_raw(raw).raw(), raw);
        }
        assert_eq!(Format::from_raw(999), Format::Unknown);
    }
}
