use std::os::raw::c_char;
use std::rc::Rc;

use ash::extensions::khr;
use ash::vk::{PhysicalDevice, SurfaceKHR};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{Result, VkResultExt};
use crate::vk_instance::Vulkan;

/// Instance extensions a surface for `display` needs.
pub fn required_extensions(display: RawDisplayHandle) -> Result<&'static [*const c_char]> {
    ash_window::enumerate_required_extensions(display).call("vkEnumerateInstanceExtensionProperties")
}

pub struct Surface {
    vulkan: Rc<Vulkan>,
    loader: khr::Surface,
    handle: SurfaceKHR,
}

impl Surface {
    pub fn new(
        vulkan: Rc<Vulkan>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let handle = unsafe {
            ash_window::create_surface(vulkan.library(), vulkan.vk_instance(), display, window, None)
        }
        .call("vkCreateSurfaceKHR")?;
        let loader = khr::Surface::new(vulkan.library(), vulkan.vk_instance());

        Ok(Self {
            vulkan,
            loader,
            handle,
        })
    }

    pub fn handle(&self) -> SurfaceKHR {
        self.handle
    }

    pub fn loader(&self) -> &khr::Surface {
        &self.loader
    }

    pub fn vulkan(&self) -> &Rc<Vulkan> {
        &self.vulkan
    }

    pub fn supports_present(&self, pdevice: PhysicalDevice, queue_family_index: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(pdevice, queue_family_index, self.handle)
        }
        .call("vkGetPhysicalDeviceSurfaceSupportKHR")
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) }
    }
}
