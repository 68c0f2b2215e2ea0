//! Error types for the capture/replay engine

use crate::resource::ResourceId;
use thiserror::Error;

/// Result codes surfaced to whoever drives capture or replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Succeeded,
    ResourceCreationFailed,
    MapFailed,
    FileCorrupted,
    UnsupportedResource,
    ApiHardwareUnsupported,
    DeviceLost,
    InternalError,
}

/// Errors reported by a [`GpuDevice`](crate::device::GpuDevice) backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfMemory,

    #[error("invalid native handle {0:#x}")]
    InvalidHandle(u64),

    #[error("failed to map {0:#x}")]
    MapFailed(u64),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    #[error("device removed")]
    DeviceRemoved,
}

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create {what} for {id}: {source}")]
    ResourceCreation {
        id: ResourceId,
        what: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("failed to map {id}: {source}")]
    Map {
        id: ResourceId,
        #[source]
        source: DeviceError,
    },

    #[error("serialisation read error: {0}")]
    SerialisationRead(String),

    #[error("unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),

    #[error("acceleration structure is incompatible with this device: {0}")]
    HardwareIncompatibility(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("unsupported capture version {found:#x} (oldest readable {oldest:#x})")]
    UnsupportedVersion { found: u32, oldest: u32 },

    #[error("disk cache error: {0}")]
    DiskCache(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Result code for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::ResourceCreation { .. } => ResultCode::ResourceCreationFailed,
            Error::Map { .. } => ResultCode::MapFailed,
            Error::SerialisationRead(_) | Error::UnsupportedVersion { .. } => {
                ResultCode::FileCorrupted
            }
            Error::UnsupportedResourceKind(_) => ResultCode::UnsupportedResource,
            Error::HardwareIncompatibility(_) => ResultCode::ApiHardwareUnsupported,
            Error::DeviceLost(_) | Error::Device(DeviceError::DeviceRemoved) => {
                ResultCode::DeviceLost
            }
            _ => ResultCode::InternalError,
        }
    }

    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.result_code(),
            ResultCode::ApiHardwareUnsupported | ResultCode::DeviceLost
        )
    }

    /// Wrap a device error raised while creating an object for `id`
    ///
    /// A removed device is promoted to [`Error::DeviceLost`] so callers can
    /// raise the fatal flag.
    pub fn creation(id: ResourceId, what: &'static str, source: DeviceError) -> Self {
        match source {
            DeviceError::DeviceRemoved => {
                Error::DeviceLost(format!("while creating {what} for {id}"))
            }
            source => Error::ResourceCreation { id, what, source },
        }
    }

    /// Wrap a device error raised while mapping `id`
    pub fn map(id: ResourceId, source: DeviceError) -> Self {
        match source {
            DeviceError::DeviceRemoved => Error::DeviceLost(format!("while mapping {id}")),
            source => Error::Map { id, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes_are_distinct_for_fatal_errors() {
        let hw = Error::HardwareIncompatibility("driver mismatch".into());
        assert_eq!(hw.result_code(), ResultCode::ApiHardwareUnsupported);
        assert!(hw.is_fatal());

        let map = Error::map(ResourceId::new(4), DeviceError::MapFailed(4));
        assert_eq!(map.result_code(), ResultCode::MapFailed);
        assert!(!map.is_fatal());
    }

    #[test]
    fn test_removed_device_promotes_to_device_lost() {
        let err = Error::creation(ResourceId::new(9), "staging buffer", DeviceError::DeviceRemoved);
        assert!(matches!(err, Error::DeviceLost(_)));
        assert!(err.is_fatal());
    }
}
