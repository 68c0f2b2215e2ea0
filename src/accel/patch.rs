//! Rewriting captured BLAS addresses to live ones

use std::fmt;

use crate::accel::desc::{InstanceDesc, SerializedAsHeader, INSTANCE_DESC_SIZE, SERIALIZED_HEADER_SIZE};
use crate::core::{Error, Result};

/// Why a captured BLAS reference could not be resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchFailure {
    /// Address is not inside any known resource
    UnknownResource,
    /// No acceleration structure at that offset of the resource
    NoStructureAtOffset,
    /// Structure was created after the one referencing it
    NewerThanReferrer,
    NotBottomLevel,
    /// Structure has not been built or copied yet in this replay
    NotYetApplied,
}

impl fmt::Display for PatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PatchFailure::UnknownResource => "address is not in a known resource",
            PatchFailure::NoStructureAtOffset => "no acceleration structure at that offset",
            PatchFailure::NewerThanReferrer => "structure is newer than its referrer",
            PatchFailure::NotBottomLevel => "structure is not bottom-level",
            PatchFailure::NotYetApplied => "structure has not been applied",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub patched: usize,
    pub zeroed: usize,
    /// References that were already 0
    pub null: usize,
}

fn patch_address<F>(address: &mut u64, index: usize, resolve: &mut F, summary: &mut PatchSummary)
where
    F: FnMut(u64) -> std::result::Result<u64, PatchFailure>,
{
    if *address == 0 {
        summary.null += 1;
        return;
    }
    match resolve(*address) {
        Ok(live) => {
            *address = live;
            summary.patched += 1;
        }
        Err(failure) => {
            log::warn!("BLAS reference {} ({:#x}): {}; zeroing", index, *address, failure);
            *address = 0;
            summary.zeroed += 1;
        }
    }
}

/// Patch the BLAS address of every TLAS instance record in `bytes`
pub fn patch_instances<F>(bytes: &mut [u8], mut resolve: F) -> PatchSummary
where
    F: FnMut(u64) -> std::result::Result<u64, PatchFailure>,
{
    let mut summary = PatchSummary::default();
    for (index, record) in bytes.chunks_exact_mut(INSTANCE_DESC_SIZE as usize).enumerate() {
        let mut instance: InstanceDesc = bytemuck::pod_read_unaligned(record);
        patch_address(&mut instance.acceleration_structure, index, &mut resolve, &mut summary);
        record.copy_from_slice(bytemuck::bytes_of(&instance));
    }
    summary
}

/// Header of a driver-serialised structure
pub fn read_serialized_header(blob: &[u8]) -> Result<SerializedAsHeader> {
    if blob.len() < SERIALIZED_HEADER_SIZE {
        return Err(Error::SerialisationRead(format!(
            "serialised acceleration structure of {} bytes has no header",
            blob.len()
        )));
    }
    Ok(bytemuck::pod_read_unaligned(&blob[..SERIALIZED_HEADER_SIZE]))
}

/// Patch the BLAS address list that follows a serialised structure's header
pub fn patch_serialized_blob<F>(blob: &mut [u8], mut resolve: F) -> Result<PatchSummary>
where
    F: FnMut(u64) -> std::result::Result<u64, PatchFailure>,
{
    let header = read_serialized_header(blob)?;
    let list_end = u64::try_from(SERIALIZED_HEADER_SIZE)
        .ok()
        .and_then(|start| header.num_blas.checked_mul(8)?.checked_add(start))
        .filter(|end| *end <= blob.len() as u64)
        .ok_or_else(|| Error::SerialisationRead(format!("{} BLAS references overrun the blob", header.num_blas)))?;

    let mut summary = PatchSummary::default();
    let list = &mut blob[SERIALIZED_HEADER_SIZE..list_end as usize];
    for (index, slot) in list.chunks_exact_mut(8).enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slot);
        let mut address = u64::from_le_bytes(raw);
        patch_address(&mut address, index, &mut resolve, &mut summary);
        slot.copy_from_slice(&address.to_le_bytes());
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(addresses: &[u64]) -> Vec<u8> {
        addresses
            .iter()
            .flat_map(|a| {
                let inst = InstanceDesc { acceleration_structure: *a, instance_id_and_mask: 0xff00_0000, ..Default::default() };
                bytemuck::bytes_of(&inst).to_vec()
            })
            .collect()
    }

    fn read_back(bytes: &[u8]) -> Vec<u64> {
        bytes
            .chunks_exact(64)
            .map(|c| bytemuck::pod_read_unaligned::<InstanceDesc>(c).acceleration_structure)
            .collect()
    }

    #[test]
    fn test_patch_instances_zeroes_failures() {
        let mut bytes = instances(&[0x1000, 0x2000, 0, 0x3000]);
        let summary = patch_instances(&mut bytes, |addr| match addr {
            0x1000 => Ok(0xa000),
            0x2000 => Err(PatchFailure::NotYetApplied),
            _ => Ok(addr + 0x10),
        });
        assert_eq!(read_back(&bytes), vec![0xa000, 0, 0, 0x3010]);
        assert_eq!(summary, PatchSummary { patched: 2, zeroed: 1, null: 1 });
        // other fields untouched
        let first: InstanceDesc = bytemuck::pod_read_unaligned(&bytes[..64]);
        assert_eq!(first.instance_id_and_mask, 0xff00_0000);
    }

    #[test]
    fn test_patch_serialized_blob() {
        let header = SerializedAsHeader { num_blas: 2, ..Default::default() };
        let mut blob = bytemuck::bytes_of(&header).to_vec();
        blob.extend_from_slice(&0x100u64.to_le_bytes());
        blob.extend_from_slice(&0x200u64.to_le_bytes());
        blob.extend_from_slice(&[9u8; 16]);

        let summary = patch_serialized_blob(&mut blob, |addr| {
            if addr == 0x100 { Ok(0x9100) } else { Err(PatchFailure::UnknownResource) }
        })
        .unwrap();
        assert_eq!(summary.patched, 1);
        assert_eq!(summary.zeroed, 1);
        assert_eq!(&blob[56..64], &0x9100u64.to_le_bytes());
        assert_eq!(&blob[64..72], &0u64.to_le_bytes());
        assert_eq!(&blob[72..], &[9u8; 16]);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let header = SerializedAsHeader { num_blas: 10, ..Default::default() };
        let mut blob = bytemuck::bytes_of(&header).to_vec();
        assert!(patch_serialized_blob(&mut blob, |a| Ok(a)).is_err());
        assert!(read_serialized_header(&[0u8; 10]).is_err());
    }
}
