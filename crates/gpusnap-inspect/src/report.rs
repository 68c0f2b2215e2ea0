//! Report types - JSON summary of a capture

use std::collections::BTreeMap;
use std::path::Path;

use gpusnap::serialise::{peek_initial_state_header, CaptureReader, ChunkType, SCHEMA};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("cannot read capture: {0}")]
    Capture(#[from] gpusnap::Error),

    #[error("chunk {index}: {source}")]
    Chunk { index: usize, source: gpusnap::Error },
}

/// Summary of a whole capture file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureReport {
    pub version: u32,
    /// Optional fields present at this version
    pub fields: Vec<String>,
    pub chunk_count: usize,
    pub payload_bytes: u64,
    /// Chunk count per resource type
    pub by_resource_type: BTreeMap<String, usize>,
    pub chunks: Vec<ChunkReport>,
}

/// One chunk of the capture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkReport {
    pub index: usize,
    pub chunk_type: String,
    pub length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// Build a report from an opened capture
pub fn inspect(reader: &CaptureReader) -> Result<CaptureReport, InspectError> {
    let version = reader.version();
    let mut report = CaptureReport {
        version,
        fields: SCHEMA
            .iter()
            .filter(|(_, since)| version >= *since)
            .map(|(gate, _)| format!("{gate:?}"))
            .collect(),
        chunk_count: 0,
        payload_bytes: 0,
        by_resource_type: BTreeMap::new(),
        chunks: Vec::new(),
    };

    for (index, chunk) in reader.chunks().enumerate() {
        let chunk = chunk.map_err(|source| InspectError::Chunk { index, source })?;
        let mut entry = ChunkReport {
            index,
            chunk_type: match chunk.chunk_type() {
                Some(ty) => format!("{ty:?}"),
                None => format!("Unknown({})", chunk.ty),
            },
            length: chunk.payload.len() as u64,
            resource_id: None,
            resource_type: None,
        };
        if chunk.chunk_type() == Some(ChunkType::InitialContents) {
            match peek_initial_state_header(chunk.payload) {
                Ok((id, ty)) => {
                    let name = format!("{ty:?}");
                    *report.by_resource_type.entry(name.clone()).or_default() += 1;
                    entry.resource_id = Some(id.raw());
                    entry.resource_type = Some(name);
                }
                Err(err) => log::warn!("Chunk {} has no readable header: {}", index, err),
            }
        }
        report.payload_bytes += entry.length;
        report.chunks.push(entry);
    }
    report.chunk_count = report.chunks.len();
    Ok(report)
}

pub fn inspect_file(path: &Path) -> Result<CaptureReport, InspectError> {
    let reader = CaptureReader::open(path)?;
    inspect(&reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusnap::serialise::{CaptureWriter, Serialise, Serialiser, WriteSerialiser};
    use gpusnap::{ResourceId, ResourceType};

    fn initial_state_chunk(id: u64, ty: ResourceType) -> Vec<u8> {
        let mut payload = Vec::new();
        {
            let mut ser = WriteSerialiser::new(&mut payload);
            ResourceId::new(id).serialise(&mut ser).unwrap();
            ser.serialise_u32(&mut (ty as u32)).unwrap();
            ser.serialise_u64(&mut 0).unwrap();
        }
        payload
    }

    #[test]
    fn test_report_lists_chunks() {
        let mut writer = CaptureWriter::new(Vec::new()).unwrap();
        writer.write_chunk(ChunkType::InitialContents, &initial_state_chunk(3, ResourceType::Resource)).unwrap();
        writer.write_chunk(ChunkType::InitialContents, &initial_state_chunk(4, ResourceType::Resource)).unwrap();
        writer
            .write_chunk(ChunkType::InitialContents, &initial_state_chunk(9, ResourceType::DescriptorHeap))
            .unwrap();
        let reader = CaptureReader::from_bytes(writer.finish().unwrap()).unwrap();

        let report = inspect(&reader).unwrap();
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.payload_bytes, 60);
        assert_eq!(report.by_resource_type.get("Resource"), Some(&2));
        assert_eq!(report.chunks[2].resource_id, Some(9));
        assert_eq!(report.chunks[2].resource_type.as_deref(), Some("DescriptorHeap"));
        assert_eq!(report.fields.len(), SCHEMA.len());
    }

    #[test]
    fn test_old_versions_report_fewer_fields() {
        let writer = CaptureWriter::with_version(Vec::new(), 0xB).unwrap();
        let reader = CaptureReader::from_bytes(writer.finish().unwrap()).unwrap();
        let report = inspect(&reader).unwrap();
        assert_eq!(report.version, 0xB);
        assert_eq!(report.fields, vec!["PlaneSubresources".to_string(), "SparseTable".to_string()]);
        assert!(report.chunks.is_empty());
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let writer = CaptureWriter::new(Vec::new()).unwrap();
        let reader = CaptureReader::from_bytes(writer.finish().unwrap()).unwrap();
        let report = inspect(&reader).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        let back: CaptureReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            inspect_file(&dir.path().join("missing.gsnp")),
            Err(InspectError::Capture(_))
        ));
    }
}
