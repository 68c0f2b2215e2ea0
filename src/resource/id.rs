//! Stable resource identifiers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::Result;
use crate::serialise::{Serialise, Serialiser};

/// Identifier of a GPU object, stable across capture and replay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    /// The null id; also the "null heap" sentinel in sparse mappings
    pub const NULL: ResourceId = ResourceId(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId::{}", self.0)
    }
}

impl Serialise for ResourceId {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u64(&mut self.0)
    }
}

/// Monotonic id source
///
/// Replay advances it past every id read from the capture so objects the
/// replayer creates for itself never collide with captured ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl IdAllocator {
    pub fn allocate(&self) -> ResourceId {
        ResourceId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ensure future ids are greater than `id`
    pub fn reserve_past(&self, id: ResourceId) {
        self.next.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_never_null() {
        let ids = IdAllocator::default();
        let a = ids.allocate();
        let b = ids.allocate();
        assert!(!a.is_null());
        assert!(b > a);
    }

    #[test]
    fn test_reserve_past_skips_loaded_ids() {
        let ids = IdAllocator::default();
        ids.reserve_past(ResourceId::new(100));
        assert_eq!(ids.allocate(), ResourceId::new(101));

        // reserving an older id never moves backwards
        ids.reserve_past(ResourceId::new(5));
        assert_eq!(ids.allocate(), ResourceId::new(102));
    }
}
