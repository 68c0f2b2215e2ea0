//! gpusnap - GPU resource identity and initial-state capture/replay
//!
//! Tracks the GPU objects an application creates, snapshots their contents
//! when a capture starts, writes them into a versioned capture file, and
//! restores them before every replay of the captured frame.

pub mod core;
pub mod resource;
pub mod sparse;
pub mod device;
pub mod alloc;
pub mod serialise;
pub mod accel;
pub mod initstate;

pub use crate::core::{EngineConfig, Error, Result, ResultCode};
pub use device::{GpuDevice, NativeHandle, SoftwareDevice};
pub use initstate::{CaptureState, ContentsTag, InitialContents, ResourceManager};
pub use resource::{ResourceDesc, ResourceId, ResourceType};
pub use serialise::{CaptureReader, CaptureWriter};
