//! Version-gated binary serialisation and the capture container

pub mod version;
pub mod stream;
pub mod chunk;

pub use version::{is_readable, VersionGate, CURRENT_VERSION, OLDEST_READABLE_VERSION, SCHEMA};
pub use stream::{ReadSerialiser, Serialise, Serialiser, WriteSerialiser};
pub use chunk::{
    peek_initial_state_header, CaptureReader, CaptureWriter, Chunk, ChunkType, INITIAL_STATE_HEADER_SIZE,
};
