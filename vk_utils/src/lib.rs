pub mod device_context;
pub mod error;
pub mod gpu;
pub mod image_resource;
pub mod memory;
pub mod queue;
pub mod shader_library;
pub mod surface;
pub mod swapchain;
pub mod vk_instance;
pub mod wait_handle;

pub use error::{Error, Result};
