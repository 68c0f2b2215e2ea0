//! Sparse page table
//!
//! Tracks which memory page backs every page of a reserved resource. Each
//! subresource (and each array slice of the packed mip tail) holds either a
//! single mapping that covers all of its pages or an explicit per-page list.

use crate::core::{Error, Result};
use crate::resource::ResourceId;
use crate::serialise::{Serialise, Serialiser};

/// Size of one sparse page in bytes
pub const PAGE_SIZE: u64 = 64 * 1024;

/// A page's backing memory. `memory == ResourceId::NULL` means unmapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Page {
    pub memory: ResourceId,
    pub offset: u64,
}

impl Page {
    pub const NULL: Page = Page { memory: ResourceId::NULL, offset: 0 };

    pub fn new(memory: ResourceId, offset: u64) -> Self {
        Self { memory, offset }
    }

    pub fn is_null(&self) -> bool {
        self.memory.is_null()
    }
}

impl Serialise for Page {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        self.memory.serialise(ser)?;
        ser.serialise_u64(&mut self.offset)
    }
}

/// Mapping of a contiguous range of pages
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageRangeMapping {
    /// Mapping applied to the whole range while `pages` is empty
    pub single_mapping: Page,
    /// With a single mapping, every page reuses the same memory page
    pub single_page_reused: bool,
    /// Explicit per-page mappings
    pub pages: Vec<Page>,
}

impl PageRangeMapping {
    pub fn has_single_mapping(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether any page is backed by memory
    pub fn is_mapped(&self) -> bool {
        if self.has_single_mapping() {
            !self.single_mapping.is_null()
        } else {
            self.pages.iter().any(|p| !p.is_null())
        }
    }

    /// Resolve the mapping of page `index`
    pub fn page(&self, index: u32) -> Page {
        if !self.has_single_mapping() {
            return self.pages.get(index as usize).copied().unwrap_or(Page::NULL);
        }
        let single = self.single_mapping;
        if single.is_null() || self.single_page_reused {
            single
        } else {
            Page::new(single.memory, single.offset + u64::from(index) * PAGE_SIZE)
        }
    }

    fn expand(&mut self, page_count: u32) {
        if self.has_single_mapping() {
            self.pages = (0..page_count).map(|i| self.page(i)).collect();
        }
    }

    /// Collapse a uniform per-page list back into a single mapping
    fn compact(&mut self) {
        let Some(&first) = self.pages.first() else {
            return;
        };
        let same_memory = self.pages.iter().all(|p| p.memory == first.memory);
        if !same_memory {
            return;
        }

        if first.is_null() {
            *self = PageRangeMapping { single_mapping: Page::NULL, ..Default::default() };
        } else if self
            .pages
            .iter()
            .enumerate()
            .all(|(i, p)| p.offset == first.offset + i as u64 * PAGE_SIZE)
        {
            *self = PageRangeMapping { single_mapping: first, ..Default::default() };
        } else if self.pages.len() > 1 && self.pages.iter().all(|p| p.offset == first.offset) {
            *self = PageRangeMapping { single_mapping: first, single_page_reused: true, pages: Vec::new() };
        }
    }

    /// Map `count` pages starting at `first_page`
    ///
    /// With `reuse_single_page`, every page maps to the same memory page.
    fn update(&mut self, page_count: u32, first_page: u32, count: u32, memory: ResourceId, offset: u64, reuse_single_page: bool) {
        if first_page == 0 && count >= page_count {
            *self = PageRangeMapping {
                single_mapping: if memory.is_null() { Page::NULL } else { Page::new(memory, offset) },
                single_page_reused: reuse_single_page && !memory.is_null() && page_count > 1,
                pages: Vec::new(),
            };
            return;
        }

        self.expand(page_count);
        let end = first_page.saturating_add(count).min(page_count);
        for (i, index) in (first_page..end).enumerate() {
            self.pages[index as usize] = if memory.is_null() {
                Page::NULL
            } else if reuse_single_page {
                Page::new(memory, offset)
            } else {
                Page::new(memory, offset + i as u64 * PAGE_SIZE)
            };
        }
        self.compact();
    }

    fn serialised_size(&self) -> u64 {
        8 + 8 + 1 + 8 + self.pages.len() as u64 * 16
    }
}

impl Serialise for PageRangeMapping {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        self.single_mapping.serialise(ser)?;
        ser.serialise_bool(&mut self.single_page_reused)?;
        ser.serialise_array(&mut self.pages)
    }
}

/// Three-component extent in texels or pages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Coord {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn volume(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Serialise for Coord {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u32(&mut self.x)?;
        ser.serialise_u32(&mut self.y)?;
        ser.serialise_u32(&mut self.z)
    }
}

/// Page mappings of one reserved resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageTable {
    is_buffer: bool,
    /// Resource extent in texels (bytes for buffers)
    dims: Coord,
    /// Texels covered by one page (bytes for buffers)
    page_shape: Coord,
    mip_count: u32,
    array_size: u32,
    /// First mip packed into the mip tail; `mip_count` when there is no tail
    first_tail_mip: u32,
    /// Bytes of mip tail per array slice
    tail_slice_size: u64,
    subresources: Vec<PageRangeMapping>,
    mip_tail: Vec<PageRangeMapping>,
}

impl PageTable {
    /// Table for a reserved buffer of `size` bytes, initially unmapped
    pub fn for_buffer(size: u64) -> Self {
        let dims = Coord::new(u32::try_from(size.div_ceil(PAGE_SIZE)).unwrap_or(u32::MAX), 1, 1);
        Self {
            is_buffer: true,
            // buffers are tracked in whole pages
            dims,
            page_shape: Coord::new(1, 1, 1),
            mip_count: 1,
            array_size: 1,
            first_tail_mip: 1,
            tail_slice_size: 0,
            subresources: vec![PageRangeMapping::default()],
            mip_tail: Vec::new(),
        }
    }

    /// Table for a reserved texture, initially unmapped
    pub fn for_texture(
        dims: Coord,
        mip_count: u32,
        array_size: u32,
        page_shape: Coord,
        first_tail_mip: u32,
        tail_slice_size: u64,
    ) -> Self {
        let mip_count = mip_count.max(1);
        let array_size = array_size.max(1);
        let first_tail_mip = first_tail_mip.min(mip_count);
        let has_tail = first_tail_mip < mip_count;
        Self {
            is_buffer: false,
            dims,
            page_shape,
            mip_count,
            array_size,
            first_tail_mip,
            tail_slice_size,
            subresources: vec![PageRangeMapping::default(); (mip_count * array_size) as usize],
            mip_tail: if has_tail { vec![PageRangeMapping::default(); array_size as usize] } else { Vec::new() },
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.is_buffer
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    pub fn num_subresources(&self) -> u32 {
        self.mip_count * self.array_size
    }

    pub fn is_subresource_in_mip_tail(&self, subresource: u32) -> bool {
        !self.is_buffer && subresource % self.mip_count >= self.first_tail_mip
    }

    /// Page extent of a subresource outside the mip tail
    pub fn subresource_page_dims(&self, subresource: u32) -> Coord {
        if self.is_buffer {
            return self.dims;
        }
        let mip = subresource % self.mip_count;
        let shape = self.page_shape;
        Coord::new(
            (self.dims.x >> mip).max(1).div_ceil(shape.x.max(1)),
            (self.dims.y >> mip).max(1).div_ceil(shape.y.max(1)),
            (self.dims.z >> mip).max(1).div_ceil(shape.z.max(1)),
        )
    }

    pub fn subresource_page_count(&self, subresource: u32) -> u32 {
        self.subresource_page_dims(subresource).volume()
    }

    /// Pages in the mip tail of one array slice
    pub fn mip_tail_page_count(&self) -> u32 {
        self.tail_slice_size.div_ceil(PAGE_SIZE) as u32
    }

    pub fn subresource(&self, subresource: u32) -> &PageRangeMapping {
        &self.subresources[subresource as usize]
    }

    /// Mip tail mapping of the array slice containing `subresource`
    pub fn mip_tail_mapping(&self, subresource: u32) -> &PageRangeMapping {
        &self.mip_tail[(subresource / self.mip_count) as usize]
    }

    /// First subresource of the array slice after the one holding `subresource`
    pub fn next_slice_start(&self, subresource: u32) -> u32 {
        (subresource / self.mip_count + 1) * self.mip_count
    }

    /// Whether a subresource (or the tail it sits in) has any backing memory
    pub fn is_subresource_mapped(&self, subresource: u32) -> bool {
        if self.is_subresource_in_mip_tail(subresource) {
            self.mip_tail_mapping(subresource).is_mapped()
        } else {
            self.subresource(subresource).is_mapped()
        }
    }

    /// Map `count` buffer pages starting at `first_page`
    pub fn map_buffer_pages(&mut self, first_page: u32, count: u32, memory: ResourceId, offset: u64) {
        self.map_pages(0, first_page, count, memory, offset, false);
    }

    /// Map pages of one subresource in raster order
    pub fn map_pages(&mut self, subresource: u32, first_page: u32, count: u32, memory: ResourceId, offset: u64, reuse_single_page: bool) {
        let page_count = self.subresource_page_count(subresource);
        if let Some(mapping) = self.subresources.get_mut(subresource as usize) {
            mapping.update(page_count, first_page, count, memory, offset, reuse_single_page);
        }
    }

    /// Map the whole mip tail of one array slice
    pub fn map_mip_tail(&mut self, array_slice: u32, memory: ResourceId, offset: u64) {
        let page_count = self.mip_tail_page_count();
        if let Some(mapping) = self.mip_tail.get_mut(array_slice as usize) {
            mapping.update(page_count, 0, page_count, memory, offset, false);
        }
    }

    /// Unmap everything
    pub fn clear(&mut self) {
        for mapping in self.subresources.iter_mut().chain(self.mip_tail.iter_mut()) {
            *mapping = PageRangeMapping::default();
        }
    }

    /// Upper bound of the serialised table size
    pub fn serialised_size(&self) -> u64 {
        let header = 1 + 12 + 12 + 4 + 4 + 4 + 8 + 8 + 8;
        header
            + self
                .subresources
                .iter()
                .chain(self.mip_tail.iter())
                .map(PageRangeMapping::serialised_size)
                .sum::<u64>()
    }
}

impl Serialise for PageTable {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_bool(&mut self.is_buffer)?;
        self.dims.serialise(ser)?;
        self.page_shape.serialise(ser)?;
        ser.serialise_u32(&mut self.mip_count)?;
        ser.serialise_u32(&mut self.array_size)?;
        ser.serialise_u32(&mut self.first_tail_mip)?;
        ser.serialise_u64(&mut self.tail_slice_size)?;
        ser.serialise_array(&mut self.subresources)?;
        ser.serialise_array(&mut self.mip_tail)?;

        if ser.is_reading() && self.subresources.len() != (self.mip_count * self.array_size) as usize {
            return Err(Error::SerialisationRead(format!(
                "page table lists {} subresources, expected {}",
                self.subresources.len(),
                self.mip_count * self.array_size
            )));
        }
        Ok(())
    }
}
