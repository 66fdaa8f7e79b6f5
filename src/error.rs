use ash::vk;
use thiserror::Error;

use crate::device::AccelerationStructureKind;

/// Everything that can go wrong while building, updating or rendering.
#[derive(Error, Debug)]
pub enum Error {
    /// A device call returned a non-success status
    #[error("{call} failed: {result}")]
    DeviceCallFailure {
        call: &'static str,
        result: vk::Result,
    },

    /// No memory type satisfies both the device mask and the requested properties
    #[error("no memory type in {type_bits:#b} provides {flags:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// A required device feature or extension is absent
    #[error("missing capability: {0}")]
    MissingCapability(String),

    /// Device address requested from a buffer created without `SHADER_DEVICE_ADDRESS`
    #[error("buffer was created without SHADER_DEVICE_ADDRESS usage")]
    MissingDeviceAddressUsage,

    /// Host access to memory that is not host visible
    #[error("buffer memory is not host visible")]
    NotHostVisible,

    /// UPDATE requested on a structure built without `ALLOW_UPDATE`
    #[error("{kind:?} acceleration structure was not built with ALLOW_UPDATE")]
    UpdateNotAllowed { kind: AccelerationStructureKind },

    /// The device reported a zero storage or scratch size
    #[error("device reported unusable build sizes for {kind:?}: {sizes:?}")]
    InvalidBuildSizes {
        kind: AccelerationStructureKind,
        sizes: vk::AccelerationStructureBuildSizesInfoKHR,
    },

    /// Host access outside the buffer
    #[error("range {offset}..{offset}+{len} is outside a buffer of {size} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<vk_utils::Error> for Error {
    fn from(error: vk_utils::Error) -> Self {
        match error {
            vk_utils::Error::Vulkan { call, result } => Error::DeviceCallFailure { call, result },
            vk_utils::Error::NoMatchingMemoryType { type_bits, flags } => {
                Error::NoMatchingMemoryType { type_bits, flags }
            }
            vk_utils::Error::Shader { path, source } => Error::Io(std::io::Error::new(
                source.kind(),
                format!("{}: {}", path.display(), source),
            )),
            other => Error::MissingCapability(other.to_string()),
        }
    }
}

/// Names the device call behind a failed `VkResult`.
pub(crate) trait DeviceCall<T> {
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> DeviceCall<T> for ash::prelude::VkResult<T> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| Error::DeviceCallFailure { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_errors_keep_their_category() {
        let error: Error = vk_utils::Error::Vulkan {
            call: "vkCreateDevice",
            result: vk::Result::ERROR_DEVICE_LOST,
        }
        .into();
        assert!(matches!(
            error,
            Error::DeviceCallFailure {
                call: "vkCreateDevice",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));

        let error: Error = vk_utils::Error::NoSuitableGpu("no ray tracing".into()).into();
        assert!(matches!(error, Error::MissingCapability(message) if message.contains("no ray tracing")));
    }
}
