use std::path::PathBuf;

use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no suitable GPU: {0}")]
    NoSuitableGpu(String),

    #[error("no memory type in {type_bits:#b} provides {flags:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("failed to read SPIR-V from {path}: {source}")]
    Shader {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Names the Vulkan entry point behind a failed `VkResult`.
pub trait VkResultExt<T> {
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| Error::Vulkan { call, result })
    }
}
