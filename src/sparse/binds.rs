//! Compiles a page table into an ordered list of tile-mapping binds

use crate::resource::ResourceId;
use crate::sparse::page_table::{PageRangeMapping, PageTable, PAGE_SIZE};

/// Start of a tiled region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TiledCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub subresource: u32,
}

/// Extent of a tiled region
///
/// Without a box, `num_tiles` tiles are covered in raster order from the start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileRegion {
    pub num_tiles: u32,
    pub use_box: bool,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RangeFlag {
    #[default]
    None,
    /// Tiles become unmapped
    Null,
    /// Every tile maps to the single page at `range_offset`
    ReuseSingleTile,
}

/// One tile-mapping update, generic over how the backing heap is named
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseBind<H = ResourceId> {
    pub heap: H,
    pub region_start: TiledCoord,
    pub region_size: TileRegion,
    pub range_flag: RangeFlag,
    /// Offset into the heap, in pages
    pub range_offset: u32,
    pub range_count: u32,
}

impl<H> SparseBind<H> {
    pub fn map_heap<T>(self, f: impl FnOnce(H) -> T) -> SparseBind<T> {
        SparseBind {
            heap: f(self.heap),
            region_start: self.region_start,
            region_size: self.region_size,
            range_flag: self.range_flag,
            range_offset: self.range_offset,
            range_count: self.range_count,
        }
    }
}

/// Binds that restore a resource's page mappings
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SparseBinds {
    /// Unmap the whole resource
    Null,
    Binds(Vec<SparseBind>),
}

impl SparseBinds {
    /// Whole-resource null bind
    pub fn null() -> Self {
        SparseBinds::Null
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SparseBinds::Null)
    }

    pub fn binds(&self) -> &[SparseBind] {
        match self {
            SparseBinds::Null => &[],
            SparseBinds::Binds(binds) => binds,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SparseBinds::Null => 1,
            SparseBinds::Binds(binds) => binds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compile `table` into the minimal ordered bind list
    ///
    /// Subresources are walked in index order. A uniformly mapped subresource
    /// becomes one bind; otherwise pages are walked in raster order and a page
    /// joins the previous bind when it shares its heap and continues its heap
    /// range. Unmapped pages coalesce the same way under the null heap.
    pub fn from_page_table(table: &PageTable) -> Self {
        let mut binds: Vec<SparseBind> = Vec::new();
        let num_subresources = table.num_subresources();

        let mut sub = 0;
        while sub < num_subresources {
            if table.is_subresource_in_mip_tail(sub) {
                let mapping = table.mip_tail_mapping(sub);
                let pages = table.mip_tail_page_count();
                if mapping.has_single_mapping() {
                    binds.push(whole_range_bind(mapping, sub, pages, TileRegion {
                        num_tiles: pages,
                        ..Default::default()
                    }));
                } else {
                    push_pages(&mut binds, mapping, sub, pages, (pages.max(1), 1));
                }
                // the tail covers every remaining mip of this slice
                sub = table.next_slice_start(sub);
                continue;
            }

            let mapping = table.subresource(sub);
            let dims = table.subresource_page_dims(sub);
            let pages = dims.volume();
            if mapping.has_single_mapping() {
                binds.push(whole_range_bind(mapping, sub, pages, TileRegion {
                    num_tiles: pages,
                    use_box: !table.is_buffer(),
                    width: dims.x,
                    height: dims.y,
                    depth: dims.z,
                }));
            } else {
                push_pages(&mut binds, mapping, sub, pages, (dims.x.max(1), dims.y.max(1)));
            }
            sub += 1;
        }

        SparseBinds::Binds(binds)
    }
}

fn page_index(offset: u64) -> u32 {
    (offset / PAGE_SIZE) as u32
}

fn whole_range_bind(mapping: &PageRangeMapping, subresource: u32, pages: u32, region_size: TileRegion) -> SparseBind {
    let single = mapping.single_mapping;
    let range_flag = if single.is_null() {
        RangeFlag::Null
    } else if mapping.single_page_reused {
        RangeFlag::ReuseSingleTile
    } else {
        RangeFlag::None
    };
    SparseBind {
        heap: single.memory,
        region_start: TiledCoord { subresource, ..Default::default() },
        region_size,
        range_flag,
        range_offset: page_index(single.offset),
        range_count: pages,
    }
}

fn push_pages(binds: &mut Vec<SparseBind>, mapping: &PageRangeMapping, subresource: u32, pages: u32, (w, h): (u32, u32)) {
    // binds emitted before this call belong to other subresources
    let first_bind = binds.len();

    for index in 0..pages {
        let page = mapping.page(index);

        if binds.len() > first_bind {
            if let Some(last) = binds.last_mut() {
                let contiguous = page.is_null()
                    || last.range_offset + last.range_count == page_index(page.offset);
                if last.heap == page.memory && contiguous {
                    last.region_size.num_tiles += 1;
                    last.range_count += 1;
                    continue;
                }
            }
        }

        binds.push(SparseBind {
            heap: page.memory,
            region_start: TiledCoord {
                x: index % w,
                y: (index / w) % h,
                z: index / (w * h),
                subresource,
            },
            region_size: TileRegion { num_tiles: 1, ..Default::default() },
            range_flag: if page.is_null() { RangeFlag::Null } else { RangeFlag::None },
            range_offset: page_index(page.offset),
            range_count: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::page_table::Coord;

    const HEAP_A: ResourceId = ResourceId::new(21);
    const HEAP_B: ResourceId = ResourceId::new(22);

    #[test]
    fn test_fully_mapped_buffer_is_one_bind() {
        let mut table = PageTable::for_buffer(10_000 * PAGE_SIZE);
        table.map_buffer_pages(0, 10_000, HEAP_A, 0);

        let binds = SparseBinds::from_page_table(&table);
        assert_eq!(binds.len(), 1);
        let bind = binds.binds()[0];
        assert_eq!(bind.heap, HEAP_A);
        assert_eq!(bind.range_count, 10_000);
        assert_eq!(bind.range_flag, RangeFlag::None);
    }

    #[test]
    fn test_half_mapped_buffer_is_one_real_one_null() {
        let mut table = PageTable::for_buffer(10_000 * PAGE_SIZE);
        table.map_buffer_pages(0, 5000, HEAP_A, 0);

        let binds = SparseBinds::from_page_table(&table);
        let list = binds.binds();
        assert_eq!(list.len(), 2);

        assert_eq!(list[0].heap, HEAP_A);
        assert_eq!(list[0].region_size.num_tiles, 5000);
        assert_eq!(list[0].range_flag, RangeFlag::None);

        assert!(list[1].heap.is_null());
        assert_eq!(list[1].region_start.x, 5000);
        assert_eq!(list[1].region_size.num_tiles, 5000);
        assert_eq!(list[1].range_flag, RangeFlag::Null);
    }

    #[test]
    fn test_discontiguous_heap_offsets_split() {
        let mut table = PageTable::for_buffer(6 * PAGE_SIZE);
        table.map_buffer_pages(0, 2, HEAP_A, 0);
        // same heap but jumps ahead in it
        table.map_buffer_pages(2, 2, HEAP_A, 10 * PAGE_SIZE);
        table.map_buffer_pages(4, 2, HEAP_B, 0);

        let binds = SparseBinds::from_page_table(&table);
        let offsets: Vec<(ResourceId, u32, u32)> = binds
            .binds()
            .iter()
            .map(|b| (b.heap, b.range_offset, b.range_count))
            .collect();
        assert_eq!(offsets, vec![(HEAP_A, 0, 2), (HEAP_A, 10, 2), (HEAP_B, 0, 2)]);
    }

    #[test]
    fn test_texture_pages_use_raster_coordinates() {
        let mut table = PageTable::for_texture(Coord::new(512, 512, 1), 2, 1, Coord::new(128, 128, 1), 2, 0);
        // mip 0 is 4x4 pages; map page 6 only
        table.map_pages(0, 6, 1, HEAP_B, 0, false);

        let binds = SparseBinds::from_page_table(&table);
        let list = binds.binds();
        // null pages 0-5, heap page 6, null 7-15, then mip 1 whole
        assert_eq!(list.len(), 4);
        assert_eq!(list[1].region_start, TiledCoord { x: 2, y: 1, z: 0, subresource: 0 });
        assert!(list[2].heap.is_null());
        assert_eq!(list[2].region_size.num_tiles, 9);
        assert_eq!(list[3].region_start.subresource, 1);
        assert!(list[3].region_size.use_box);
    }

    #[test]
    fn test_mip_tail_skips_to_next_slice() {
        let mut table = PageTable::for_texture(Coord::new(256, 256, 1), 5, 2, Coord::new(128, 128, 1), 1, PAGE_SIZE);
        table.map_mip_tail(0, HEAP_A, 0);
        table.map_mip_tail(1, HEAP_A, PAGE_SIZE);

        let binds = SparseBinds::from_page_table(&table);
        let subs: Vec<u32> = binds.binds().iter().map(|b| b.region_start.subresource).collect();
        // slice 0: mip 0, tail at 1; slice 1: mip 0 (sub 5), tail at 6
        assert_eq!(subs, vec![0, 1, 5, 6]);
        assert_eq!(binds.binds()[3].range_offset, 1);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let mut table = PageTable::for_buffer(64 * PAGE_SIZE);
        for page in (0..64).step_by(3) {
            table.map_buffer_pages(page, 1, HEAP_A, u64::from(page) * 2 * PAGE_SIZE);
        }
        let first = SparseBinds::from_page_table(&table);
        let second = SparseBinds::from_page_table(&table.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn test_null_binds() {
        let binds = SparseBinds::null();
        assert!(binds.is_null());
        assert_eq!(binds.len(), 1);
        assert!(binds.binds().is_empty());
    }
}
