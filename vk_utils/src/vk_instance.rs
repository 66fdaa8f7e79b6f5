use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::vk::{
    ApplicationInfo, Bool32, DebugUtilsMessageSeverityFlagsEXT, DebugUtilsMessageTypeFlagsEXT,
    DebugUtilsMessengerCallbackDataEXT, DebugUtilsMessengerCreateInfoEXT, DebugUtilsMessengerEXT,
    InstanceCreateInfo, PhysicalDevice, QueueFlags, API_VERSION_1_2, FALSE,
};
use ash::{Entry, Instance};

use crate::error::{Result, VkResultExt};
use crate::gpu::Gpu;
use crate::surface::Surface;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

/// Message types forwarded by the validation messenger.
const DEBUG_MESSAGE_TYPES: DebugUtilsMessageTypeFlagsEXT = DebugUtilsMessageTypeFlagsEXT::from_raw(
    DebugUtilsMessageTypeFlagsEXT::GENERAL.as_raw()
        | DebugUtilsMessageTypeFlagsEXT::VALIDATION.as_raw()
        | DebugUtilsMessageTypeFlagsEXT::PERFORMANCE.as_raw(),
);

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: DebugUtilsMessageSeverityFlagsEXT,
    message_type: DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> Bool32 {
    let callback_data = *p_callback_data;
    let message_id_number = callback_data.message_id_number;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    if message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(?message_type, %message_id_name, message_id_number, "{}", message);
    } else if message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(?message_type, %message_id_name, message_id_number, "{}", message);
    } else {
        tracing::debug!(?message_type, %message_id_name, message_id_number, "{}", message);
    }

    FALSE
}

pub struct Vulkan {
    debug: Option<(DebugUtils, DebugUtilsMessengerEXT)>,
    library: Entry,
    instance: Instance,
}

impl Vulkan {
    /// Creates a Vulkan 1.2 instance. `validation` enables the Khronos layer and a
    /// debug messenger when the layer is installed.
    pub fn new(name: &str, extensions: &[*const c_char], validation: bool) -> Result<Self> {
        let library = unsafe { Entry::load()? };

        let c_name = CString::new(name).unwrap_or_default();
        let appinfo = ApplicationInfo::builder()
            .application_name(&c_name)
            .application_version(0)
            .engine_name(&c_name)
            .engine_version(0)
            .api_version(API_VERSION_1_2);

        let validation = validation && Self::has_validation_layer(&library)?;
        let layers_names_raw: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr() as *const c_char]
        } else {
            Vec::new()
        };

        let mut extension_names_raw = extensions.to_vec();
        if validation {
            extension_names_raw.push(DebugUtils::name().as_ptr());
        }

        let create_info = InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layers_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance = unsafe { library.create_instance(&create_info, None) }
            .call("vkCreateInstance")?;

        let mut vulkan = Self {
            debug: None,
            library,
            instance,
        };

        if validation {
            let debug_info = DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(DEBUG_MESSAGE_TYPES)
                .pfn_user_callback(Some(vulkan_debug_callback));

            let debug_utils_loader = DebugUtils::new(&vulkan.library, &vulkan.instance);
            let messenger =
                unsafe { debug_utils_loader.create_debug_utils_messenger(&debug_info, None) }
                    .call("vkCreateDebugUtilsMessengerEXT")?;
            vulkan.debug = Some((debug_utils_loader, messenger));
        }

        Ok(vulkan)
    }

    fn has_validation_layer(library: &Entry) -> Result<bool> {
        let wanted = unsafe { CStr::from_ptr(VALIDATION_LAYER.as_ptr() as *const c_char) };
        #[allow(unused_unsafe)]
        let layers = unsafe { library.enumerate_instance_layer_properties() }
            .call("vkEnumerateInstanceLayerProperties")?;
        let present = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == wanted);
        if !present {
            tracing::warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        Ok(present)
    }

    pub fn library(&self) -> &Entry {
        &self.library
    }

    pub fn vk_instance(&self) -> &Instance {
        &self.instance
    }

    /// Every physical device exposing a queue family with `flags` (and presenting to
    /// `surface`, if given), paired with the first such family.
    pub fn hardware_devices_with_queue_support(
        &self,
        flags: QueueFlags,
        surface: Option<&Surface>,
    ) -> Result<Vec<Gpu>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices() }
            .call("vkEnumeratePhysicalDevices")?;

        let mut gpus = Vec::new();
        for pdevice in physical_devices {
            if let Some(index) = self.queue_family(pdevice, flags, surface)? {
                gpus.push(Gpu::new(&self.instance, pdevice, index));
            }
        }
        Ok(gpus)
    }

    fn queue_family(
        &self,
        pdevice: PhysicalDevice,
        flags: QueueFlags,
        surface: Option<&Surface>,
    ) -> Result<Option<u32>> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(pdevice)
        };
        for (index, info) in families.iter().enumerate() {
            if !info.queue_flags.contains(flags) {
                continue;
            }
            let presents = match surface {
                Some(surface) => surface.supports_present(pdevice, index as u32)?,
                None => true,
            };
            if presents {
                return Ok(Some(index as u32));
            }
        }
        Ok(None)
    }
}

impl Drop for Vulkan {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messenger_forwards_every_core_message_type() {
        for kind in [
            DebugUtilsMessageTypeFlagsEXT::GENERAL,
            DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        ] {
            assert!(DEBUG_MESSAGE_TYPES.contains(kind));
        }
    }
}
