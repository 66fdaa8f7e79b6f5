use std::path::PathBuf;

use ash::vk;

/// Compile-time settings of the demo binaries.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Increment of the animation parameter per frame.
    pub animation_step: f64,
    pub shader_dir: PathBuf,
    pub output_path: PathBuf,
    pub enable_validation: bool,
}

impl RenderConfig {
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            animation_step: 0.001,
            shader_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders"),
            output_path: PathBuf::from("image.ppm"),
            enable_validation: cfg!(debug_assertions),
        }
    }
}
