use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};

use vk_utils::device_context::DeviceContext;

/// Function loaders for the two ray-tracing extensions.
#[derive(Clone)]
pub struct RtxExtensions {
    acceleration_structure_ext: AccelerationStructure,
    ray_tracing_pipeline_ext: RayTracingPipeline,
}

impl RtxExtensions {
    pub fn new(device: &DeviceContext) -> Self {
        let instance = device.vulkan().vk_instance();
        Self {
            acceleration_structure_ext: AccelerationStructure::new(instance, device.handle()),
            ray_tracing_pipeline_ext: RayTracingPipeline::new(instance, device.handle()),
        }
    }

    pub fn pipeline_ext(&self) -> &RayTracingPipeline {
        &self.ray_tracing_pipeline_ext
    }

    pub fn acceleration_structure_ext(&self) -> &AccelerationStructure {
        &self.acceleration_structure_ext
    }
}
