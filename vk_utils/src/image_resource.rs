use ash::vk::{
    DeviceMemory, Extent2D, Extent3D, Format, Image, ImageAspectFlags, ImageCreateInfo,
    ImageLayout, ImageSubresourceRange, ImageTiling, ImageType, ImageUsageFlags, ImageView,
    ImageViewCreateInfo, ImageViewType, MemoryAllocateInfo, MemoryPropertyFlags,
    PhysicalDeviceMemoryProperties, SampleCountFlags, SharingMode,
};
use ash::Device;

use crate::error::{Error, Result, VkResultExt};
use crate::memory::memory_type_index;

/// Handles of a single-mip 2D color image with bound memory and a view.
#[derive(Clone, Copy, Debug)]
pub struct Image2DResource {
    pub image: Image,
    pub memory: DeviceMemory,
    pub view: ImageView,
    pub format: Format,
    pub extent: Extent2D,
}

impl Image2DResource {
    /// Creates the image, memory and view. Anything created before a failing call
    /// is destroyed before returning.
    pub fn new(
        device: &Device,
        properties: &PhysicalDeviceMemoryProperties,
        extent: Extent2D,
        format: Format,
        usage: ImageUsageFlags,
        property_flags: MemoryPropertyFlags,
    ) -> Result<Self> {
        let image_info = ImageCreateInfo::builder()
            .image_type(ImageType::TYPE_2D)
            .samples(SampleCountFlags::TYPE_1)
            .sharing_mode(SharingMode::EXCLUSIVE)
            .tiling(ImageTiling::OPTIMAL)
            .initial_layout(ImageLayout::UNDEFINED)
            .format(format)
            .extent(Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .array_layers(1)
            .mip_levels(1)
            .usage(usage);

        let mut resource = Self {
            image: Image::null(),
            memory: DeviceMemory::null(),
            view: ImageView::null(),
            format,
            extent,
        };

        let result = unsafe { resource.create(device, &image_info, properties, property_flags) };
        match result {
            Ok(()) => Ok(resource),
            Err(error) => {
                resource.destroy(device);
                Err(error)
            }
        }
    }

    unsafe fn create(
        &mut self,
        device: &Device,
        image_info: &ImageCreateInfo,
        properties: &PhysicalDeviceMemoryProperties,
        property_flags: MemoryPropertyFlags,
    ) -> Result<()> {
        self.image = device
            .create_image(image_info, None)
            .call("vkCreateImage")?;

        let requirements = device.get_image_memory_requirements(self.image);
        let type_index = memory_type_index(requirements.memory_type_bits, properties, property_flags)
            .ok_or(Error::NoMatchingMemoryType {
                type_bits: requirements.memory_type_bits,
                flags: property_flags,
            })?;

        let allocation_info = MemoryAllocateInfo::builder()
            .memory_type_index(type_index)
            .allocation_size(requirements.size);
        self.memory = device
            .allocate_memory(&allocation_info, None)
            .call("vkAllocateMemory")?;
        device
            .bind_image_memory(self.image, self.memory, 0)
            .call("vkBindImageMemory")?;

        let view_info = ImageViewCreateInfo::builder()
            .format(self.format)
            .view_type(ImageViewType::TYPE_2D)
            .image(self.image)
            .subresource_range(ImageSubresourceRange {
                aspect_mask: ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.view = device
            .create_image_view(&view_info, None)
            .call("vkCreateImageView")?;
        Ok(())
    }

    /// Destroys whatever handles are non-null.
    pub fn destroy(&self, device: &Device) {
        unsafe {
            if self.view != ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            if self.image != Image::null() {
                device.destroy_image(self.image, None);
            }
            if self.memory != DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}
