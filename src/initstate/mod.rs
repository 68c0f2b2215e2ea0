//! Initial-state capture and replay
//!
//! [`ResourceManager`] owns the registry of tracked objects and drives the
//! per-object phases: Prepare at capture start, Serialise/GetSize when the
//! capture is written or read, Create for objects the capture has no state
//! for, and Apply at the start of every replay loop.

pub mod contents;
pub mod manager;
mod prepare;
mod serialise;
mod create;
mod apply;

pub use contents::{
    AccelContents, ContentsTag, CopySource, HeapContents, InitialContents, MsaaArray, OwnedHandle,
    ResourceContents, SparseState, SubresourceSet,
};
pub use manager::{CaptureState, ManagerStats, ResourceManager};
pub use serialise::LoadSummary;
pub use apply::ApplySummary;
