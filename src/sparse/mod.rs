//! Sparse (tiled) resource page tracking and bind compilation

pub mod page_table;
pub mod binds;

pub use page_table::{Coord, Page, PageRangeMapping, PageTable, PAGE_SIZE};
pub use binds::{RangeFlag, SparseBind, SparseBinds, TileRegion, TiledCoord};
