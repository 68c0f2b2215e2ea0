//! Capture format versions and the optional-field schema table
//!
//! Every optional field of the initial-state chunks is listed once here with
//! the first format version that carries it. Readers of older captures fall
//! back to the field's default; writers targeting an older version omit it.

/// Version written by default
pub const CURRENT_VERSION: u32 = 0x13;

/// Oldest version this crate can read
pub const OLDEST_READABLE_VERSION: u32 = 0x5;

/// Optional fields gated on the capture format version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VersionGate {
    /// Plane slices count towards a texture's subresources
    PlaneSubresources,
    /// Resources carry a sparse page table
    SparseTable,
    /// Resources carry the list of included subresources
    SubresourceList,
    /// Descriptor heaps carry per-descriptor names
    DescriptorNames,
}

/// Schema table: (field, first version carrying it)
pub const SCHEMA: &[(VersionGate, u32)] = &[
    (VersionGate::PlaneSubresources, 0x6),
    (VersionGate::SparseTable, 0xB),
    (VersionGate::SubresourceList, 0xE),
    (VersionGate::DescriptorNames, 0x13),
];

impl VersionGate {
    /// First version that carries this field
    pub fn since(self) -> u32 {
        SCHEMA
            .iter()
            .find(|(gate, _)| *gate == self)
            .map(|(_, version)| *version)
            .unwrap_or(CURRENT_VERSION)
    }

    /// Whether `version` carries this field
    pub fn present_in(self, version: u32) -> bool {
        version >= self.since()
    }
}

/// Whether `version` can be read at all
pub fn is_readable(version: u32) -> bool {
    (OLDEST_READABLE_VERSION..=CURRENT_VERSION).contains(&version)
}
