use std::rc::Rc;

use ash::extensions::khr;
use ash::vk::{
    CompositeAlphaFlagsKHR, Extent2D, Fence, Format, Image, ImageUsageFlags, PresentInfoKHR,
    PresentModeKHR, Semaphore, SemaphoreCreateInfo, SharingMode, SurfaceFormatKHR,
    SurfaceTransformFlagsKHR, SwapchainCreateInfoKHR, SwapchainKHR,
};

use crate::device_context::DeviceContext;
use crate::error::{Error, Result, VkResultExt};
use crate::surface::Surface;

/// Swapchain whose images are written by transfer commands only. One
/// image-available and one render-finished semaphore, since a single frame is
/// ever in flight.
pub struct Swapchain {
    device: Rc<DeviceContext>,
    loader: khr::Swapchain,
    handle: SwapchainKHR,
    images: Vec<Image>,
    format: Format,
    extent: Extent2D,
    image_available: Semaphore,
    render_finished: Semaphore,
    // Destroyed after the swapchain.
    _surface: Surface,
}

fn choose_format(formats: &[SurfaceFormatKHR]) -> Option<SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == Format::R8G8B8A8_UNORM)
        .or_else(|| formats.iter().find(|f| f.format == Format::B8G8R8A8_UNORM))
        .or_else(|| formats.first())
        .copied()
}

impl Swapchain {
    pub fn new(device: Rc<DeviceContext>, surface: Surface, width: u32, height: u32) -> Result<Self> {
        let pdevice = device.gpu().vk_physical_device();
        let surface_loader = surface.loader();

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(pdevice, surface.handle())
        }
        .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let format = choose_format(&formats)
            .ok_or_else(|| Error::NoSuitableGpu("surface reports no formats".into()))?;

        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(pdevice, surface.handle())
        }
        .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        if !capabilities
            .supported_usage_flags
            .contains(ImageUsageFlags::TRANSFER_DST)
        {
            return Err(Error::NoSuitableGpu(
                "surface images cannot be transfer destinations".into(),
            ));
        }

        let mut desired_image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && desired_image_count > capabilities.max_image_count {
            desired_image_count = capabilities.max_image_count;
        }
        let extent = match capabilities.current_extent.width {
            u32::MAX => Extent2D { width, height },
            _ => capabilities.current_extent,
        };
        let pre_transform = if capabilities
            .supported_transforms
            .contains(SurfaceTransformFlagsKHR::IDENTITY)
        {
            SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(pdevice, surface.handle())
        }
        .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        let present_mode = present_modes
            .iter()
            .cloned()
            .find(|&mode| mode == PresentModeKHR::MAILBOX)
            .unwrap_or(PresentModeKHR::FIFO);

        let vulkan = device.vulkan();
        let loader = khr::Swapchain::new(vulkan.vk_instance(), device.handle());
        let create_info = SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(desired_image_count)
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(extent)
            .image_usage(ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .call("vkCreateSwapchainKHR")?;

        let mut swapchain = Self {
            device: device.clone(),
            loader,
            handle,
            images: Vec::new(),
            format: format.format,
            extent,
            image_available: Semaphore::null(),
            render_finished: Semaphore::null(),
            _surface: surface,
        };

        swapchain.images = unsafe { swapchain.loader.get_swapchain_images(handle) }
            .call("vkGetSwapchainImagesKHR")?;
        let semaphore_info = SemaphoreCreateInfo::default();
        swapchain.image_available = unsafe { device.handle().create_semaphore(&semaphore_info, None) }
            .call("vkCreateSemaphore")?;
        swapchain.render_finished = unsafe { device.handle().create_semaphore(&semaphore_info, None) }
            .call("vkCreateSemaphore")?;

        tracing::info!(
            images = swapchain.images.len(),
            format = ?swapchain.format,
            width = extent.width,
            height = extent.height,
            ?present_mode,
            "swapchain created"
        );

        Ok(swapchain)
    }

    /// Index of the next presentable image; `image_available` is signalled once
    /// it may be written.
    pub fn acquire_next_image(&self) -> Result<u32> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, self.image_available, Fence::null())
        }
        .call("vkAcquireNextImageKHR")?;
        if suboptimal {
            tracing::debug!("swapchain is suboptimal");
        }
        Ok(index)
    }

    /// Queues `index` for presentation after `render_finished` is signalled.
    pub fn present(&self, index: u32) -> Result<()> {
        let wait_semaphores = [self.render_finished];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let suboptimal = unsafe { self.loader.queue_present(self.device.queue(), &present_info) }
            .call("vkQueuePresentKHR")?;
        if suboptimal {
            tracing::debug!("swapchain is suboptimal");
        }
        Ok(())
    }

    pub fn image(&self, index: u32) -> Image {
        self.images[index as usize]
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn image_available(&self) -> Semaphore {
        self.image_available
    }

    pub fn render_finished(&self) -> Semaphore {
        self.render_finished
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let device = self.device.handle();
            let _ = device.device_wait_idle();
            if self.image_available != Semaphore::null() {
                device.destroy_semaphore(self.image_available, None);
            }
            if self.render_finished != Semaphore::null() {
                device.destroy_semaphore(self.render_finished, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}
