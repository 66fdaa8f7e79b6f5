pub mod acceleration_structure;
pub mod buffer_resource;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod ppm;
pub mod scene;
pub mod scratch;
pub mod shader_binding_table;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod updater;
pub mod vulkan;

pub use error::{Error, Result};
