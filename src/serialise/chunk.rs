//! Capture container
//!
//! A capture is a short header followed by a sequence of chunks:
//!
//! ```text
//! "GSNPCAP\0" | version u32 | reserved u32
//! chunk*:  type u32 | reserved u32 | length u64 | payload (padded to 64 bytes)
//! ```
//!
//! Initial-state chunks carry `[ResourceId u64][ResourceType u32][contents]`.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::core::{Error, Result};
use crate::resource::{ResourceId, ResourceType};
use crate::serialise::version::{is_readable, CURRENT_VERSION, OLDEST_READABLE_VERSION};

pub const CAPTURE_MAGIC: [u8; 8] = *b"GSNPCAP\0";

/// Size of the file header
pub const FILE_HEADER_SIZE: usize = 16;

/// Size of a chunk header
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Chunk payload alignment
pub const CHUNK_ALIGNMENT: usize = 64;

/// Size of the `[ResourceId][ResourceType]` prefix of initial-state chunks
pub const INITIAL_STATE_HEADER_SIZE: u64 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    InitialContents = 1,
}

impl ChunkType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ChunkType::InitialContents),
            _ => None,
        }
    }
}

/// Writes a capture file
pub struct CaptureWriter<W: Write> {
    writer: W,
    version: u32,
    written: u64,
    chunks: usize,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        Self::with_version(writer, CURRENT_VERSION)
    }

    /// Target an older format version
    pub fn with_version(mut writer: W, version: u32) -> Result<Self> {
        if !is_readable(version) {
            return Err(Error::UnsupportedVersion { found: version, oldest: OLDEST_READABLE_VERSION });
        }
        writer.write_all(&CAPTURE_MAGIC)?;
        writer.write_all(&version.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(Self { writer, version, written: FILE_HEADER_SIZE as u64, chunks: 0 })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append one chunk
    pub fn write_chunk(&mut self, ty: ChunkType, payload: &[u8]) -> Result<()> {
        self.writer.write_all(&(ty as u32).to_le_bytes())?;
        self.writer.write_all(&0u32.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        self.writer.write_all(payload)?;
        let padding = padded_len(payload.len()) - payload.len();
        self.writer.write_all(&[0u8; CHUNK_ALIGNMENT][..padding])?;
        self.written += (CHUNK_HEADER_SIZE + payload.len() + padding) as u64;
        self.chunks += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT
}

/// One chunk borrowed from a [`CaptureReader`]
#[derive(Clone, Copy, Debug)]
pub struct Chunk<'a> {
    pub ty: u32,
    pub payload: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_raw(self.ty)
    }
}

/// Reads a capture file fully into memory
pub struct CaptureReader {
    data: Vec<u8>,
    version: u32,
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE || data[..8] != CAPTURE_MAGIC {
            return Err(Error::SerialisationRead("not a capture file".into()));
        }
        let version = read_u32(&data, 8);
        if !is_readable(version) {
            return Err(Error::UnsupportedVersion { found: version, oldest: OLDEST_READABLE_VERSION });
        }
        Ok(Self { data, version })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Iterate chunks in file order
    pub fn chunks(&self) -> ChunkIter<'_> {
        ChunkIter { data: &self.data, pos: FILE_HEADER_SIZE }
    }
}

pub struct ChunkIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < CHUNK_HEADER_SIZE {
            self.pos = self.data.len();
            return Some(Err(Error::SerialisationRead("truncated chunk header".into())));
        }
        let ty = read_u32(self.data, self.pos);
        let len = read_u64(self.data, self.pos + 8);
        let start = self.pos + CHUNK_HEADER_SIZE;
        let end = usize::try_from(len).ok().and_then(|len| start.checked_add(len));
        match end {
            Some(end) if end <= self.data.len() => {
                self.pos = (start + padded_len(end - start)).min(self.data.len());
                Some(Ok(Chunk { ty, payload: &self.data[start..end] }))
            }
            _ => {
                self.pos = self.data.len();
                Some(Err(Error::SerialisationRead(format!("chunk of {len} bytes overruns the file"))))
            }
        }
    }
}

/// Read the `[ResourceId][ResourceType]` prefix of an initial-state payload
pub fn peek_initial_state_header(payload: &[u8]) -> Result<(ResourceId, ResourceType)> {
    if payload.len() < INITIAL_STATE_HEADER_SIZE as usize {
        return Err(Error::SerialisationRead("initial-state chunk too short".into()));
    }
    let id = ResourceId::new(read_u64(payload, 0));
    Ok((id, ResourceType::from_raw(read_u32(payload, 8))))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialise::{Serialise, Serialiser, WriteSerialiser};

    #[test]
    fn test_chunks_are_padded_and_recovered() {
        let mut writer = CaptureWriter::new(Vec::new()).unwrap();
        writer.write_chunk(ChunkType::InitialContents, &[1, 2, 3]).unwrap();
        writer.write_chunk(ChunkType::InitialContents, &[7; 100]).unwrap();
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), FILE_HEADER_SIZE + CHUNK_HEADER_SIZE + 64 + CHUNK_HEADER_SIZE + 128);

        let reader = CaptureReader::from_bytes(bytes).unwrap();
        let chunks: Vec<_> = reader.chunks().collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload, &[1, 2, 3]);
        assert_eq!(chunks[1].payload.len(), 100);
        assert_eq!(chunks[1].chunk_type(), Some(ChunkType::InitialContents));
    }

    #[test]
    fn test_initial_state_header_peek() {
        let mut payload = Vec::new();
        {
            let mut ser = WriteSerialiser::new(&mut payload);
            ResourceId::new(42).serialise(&mut ser).unwrap();
            ser.serialise_u32(&mut (ResourceType::Resource as u32)).unwrap();
            ser.serialise_u32(&mut 0xdead_beef_u32).unwrap();
        }
        let mut writer = CaptureWriter::new(Vec::new()).unwrap();
        writer.write_chunk(ChunkType::InitialContents, &payload).unwrap();
        let reader = CaptureReader::from_bytes(writer.finish().unwrap()).unwrap();
        let chunk = reader.chunks().next().unwrap().unwrap();

        let (id, ty) = peek_initial_state_header(chunk.payload).unwrap();
        assert_eq!(id, ResourceId::new(42));
        assert_eq!(ty, ResourceType::Resource);
        assert_eq!(read_u32(chunk.payload, INITIAL_STATE_HEADER_SIZE as usize), 0xdead_beef);
    }

    #[test]
    fn test_rejects_unreadable_versions() {
        let mut bytes = CAPTURE_MAGIC.to_vec();
        bytes.extend_from_slice(&0x4u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            CaptureReader::from_bytes(bytes),
            Err(Error::UnsupportedVersion { found: 0x4, .. })
        ));
        assert!(CaptureWriter::with_version(Vec::new(), CURRENT_VERSION + 1).is_err());
    }

    #[test]
    fn test_overrunning_chunk_is_an_error() {
        let mut bytes = CaptureWriter::new(Vec::new()).unwrap().finish().unwrap();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1000u64.to_le_bytes());
        bytes.extend_from_slice(&[0; 10]);
        let reader = CaptureReader::from_bytes(bytes).unwrap();
        let mut chunks = reader.chunks();
        assert!(chunks.next().unwrap().is_err());
        assert!(chunks.next().is_none());
    }
}
