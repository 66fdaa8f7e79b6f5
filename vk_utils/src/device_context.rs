use std::ffi::CStr;
use std::os::raw::c_char;
use std::rc::Rc;

use ash::vk::{
    DeviceCreateInfo, DeviceQueueCreateInfo, PhysicalDeviceAccelerationStructureFeaturesKHR,
    PhysicalDeviceBufferDeviceAddressFeatures, PhysicalDeviceRayTracingPipelineFeaturesKHR, Queue,
};
use ash::Device;

use crate::error::{Result, VkResultExt};
use crate::gpu::Gpu;
use crate::vk_instance::Vulkan;

/// Logical device with buffer device address, acceleration structure and ray-tracing
/// pipeline features enabled, plus its single graphics queue.
pub struct DeviceContext {
    vulkan: Rc<Vulkan>,
    gpu: Gpu,
    device: Device,
    queue: Queue,
}

impl DeviceContext {
    pub fn new(vulkan: Rc<Vulkan>, gpu: Gpu, extensions: &[&CStr]) -> Result<Self> {
        let priorities: [f32; 1] = [1.];
        let queue_info = [DeviceQueueCreateInfo::builder()
            .queue_priorities(&priorities)
            .queue_family_index(gpu.queue_family_index())
            .build()];

        let extension_names_raw: Vec<*const c_char> =
            extensions.iter().map(|name| name.as_ptr()).collect();

        let mut buffer_device_address =
            PhysicalDeviceBufferDeviceAddressFeatures::builder().buffer_device_address(true);
        let mut acceleration_structure =
            PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut ray_tracing_pipeline =
            PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = DeviceCreateInfo::builder()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extension_names_raw)
            .push_next(&mut buffer_device_address)
            .push_next(&mut acceleration_structure)
            .push_next(&mut ray_tracing_pipeline);

        let device = unsafe {
            vulkan
                .vk_instance()
                .create_device(gpu.vk_physical_device(), &create_info, None)
        }
        .call("vkCreateDevice")?;
        let queue = unsafe { device.get_device_queue(gpu.queue_family_index(), 0) };

        tracing::info!(gpu = %gpu.name(), "logical device created");

        Ok(Self {
            vulkan,
            gpu,
            device,
            queue,
        })
    }

    pub fn wait(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }

    pub fn handle(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn vulkan(&self) -> &Rc<Vulkan> {
        &self.vulkan
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
