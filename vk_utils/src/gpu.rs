use std::ffi::CStr;

use ash::vk::{
    PhysicalDevice, PhysicalDeviceAccelerationStructureFeaturesKHR,
    PhysicalDeviceAccelerationStructurePropertiesKHR, PhysicalDeviceBufferDeviceAddressFeatures,
    PhysicalDeviceFeatures2, PhysicalDeviceMemoryProperties, PhysicalDeviceProperties,
    PhysicalDeviceProperties2, PhysicalDeviceRayTracingPipelineFeaturesKHR,
    PhysicalDeviceRayTracingPipelinePropertiesKHR, PhysicalDeviceType,
};
use ash::Instance;

use crate::error::{Result, VkResultExt};

#[derive(Clone)]
pub struct Gpu {
    physical_device: PhysicalDevice,
    properties: PhysicalDeviceProperties,
    memory_properties: PhysicalDeviceMemoryProperties,
    ray_tracing_properties: PhysicalDeviceRayTracingPipelinePropertiesKHR,
    acceleration_structure_properties: PhysicalDeviceAccelerationStructurePropertiesKHR,
    queue_family_index: u32,
}

impl Gpu {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: PhysicalDevice,
        queue_family_index: u32,
    ) -> Self {
        let mut ray_tracing_properties = PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration_structure_properties =
            PhysicalDeviceAccelerationStructurePropertiesKHR::default();

        let properties = {
            let mut properties2 = PhysicalDeviceProperties2::builder()
                .push_next(&mut ray_tracing_properties)
                .push_next(&mut acceleration_structure_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
            properties2.properties
        };
        ray_tracing_properties.p_next = std::ptr::null_mut();
        acceleration_structure_properties.p_next = std::ptr::null_mut();

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            physical_device,
            properties,
            memory_properties,
            ray_tracing_properties,
            acceleration_structure_properties,
            queue_family_index,
        }
    }

    pub fn vk_physical_device(&self) -> PhysicalDevice {
        self.physical_device
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn memory_properties(&self) -> &PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn ray_tracing_properties(&self) -> &PhysicalDeviceRayTracingPipelinePropertiesKHR {
        &self.ray_tracing_properties
    }

    pub fn acceleration_structure_properties(
        &self,
    ) -> &PhysicalDeviceAccelerationStructurePropertiesKHR {
        &self.acceleration_structure_properties
    }

    /// Names from `extensions` this device does not advertise.
    pub fn missing_extensions(
        &self,
        instance: &Instance,
        extensions: &[&'static CStr],
    ) -> Result<Vec<&'static CStr>> {
        let available =
            unsafe { instance.enumerate_device_extension_properties(self.physical_device) }
                .call("vkEnumerateDeviceExtensionProperties")?;

        Ok(extensions
            .iter()
            .copied()
            .filter(|wanted| {
                !available
                    .iter()
                    .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *wanted)
            })
            .collect())
    }

    /// Whether buffer device addresses, acceleration structures and ray-tracing
    /// pipelines are all available as features.
    pub fn supports_ray_tracing(&self, instance: &Instance) -> bool {
        let mut buffer_device_address = PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut acceleration_structure = PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing_pipeline = PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        {
            let mut features2 = PhysicalDeviceFeatures2::builder()
                .push_next(&mut buffer_device_address)
                .push_next(&mut acceleration_structure)
                .push_next(&mut ray_tracing_pipeline);
            unsafe { instance.get_physical_device_features2(self.physical_device, &mut features2) };
        }

        buffer_device_address.buffer_device_address != 0
            && acceleration_structure.acceleration_structure != 0
            && ray_tracing_pipeline.ray_tracing_pipeline != 0
    }
}
