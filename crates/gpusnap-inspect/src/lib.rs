//! Capture inspection for gpusnap
//!
//! Walks a capture container and reports what each chunk holds without
//! creating any GPU objects:
//! ```ignore
//! let report = gpusnap_inspect::inspect_file(Path::new("frame.gsnp"))?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! ```

pub mod report;

pub use report::{inspect, inspect_file, CaptureReport, ChunkReport, InspectError};
