use ash::vk::{self, AccessFlags, ImageLayout, PipelineStageFlags};
use vk_utils::swapchain::Swapchain;

use crate::device::{CommandRecorder, ImageTransition, StorageImage};
use crate::error::Result;
use crate::frame::{AcquiredImage, PresentTarget};

/// Copies each frame into the next swapchain image and presents it.
pub struct SwapchainTarget {
    swapchain: Swapchain,
}

impl SwapchainTarget {
    pub fn new(swapchain: Swapchain) -> Self {
        Self { swapchain }
    }
}

impl PresentTarget for SwapchainTarget {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        let index = self.swapchain.acquire_next_image()?;
        Ok(AcquiredImage {
            index,
            image: self.swapchain.image(index),
            wait: Some((self.swapchain.image_available(), PipelineStageFlags::TRANSFER)),
        })
    }

    fn signal_semaphore(&self) -> Option<vk::Semaphore> {
        Some(self.swapchain.render_finished())
    }

    fn record_copy(
        &self,
        recorder: &mut dyn CommandRecorder,
        source: &StorageImage,
        acquired: &AcquiredImage,
    ) {
        let target_extent = self.swapchain.extent();
        let extent = vk::Extent2D {
            width: source.extent.width.min(target_extent.width),
            height: source.extent.height.min(target_extent.height),
        };

        recorder.image_barrier(&ImageTransition {
            image: acquired.image,
            old_layout: ImageLayout::UNDEFINED,
            new_layout: ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::TRANSFER_WRITE,
            src_stage: PipelineStageFlags::TRANSFER,
            dst_stage: PipelineStageFlags::TRANSFER,
        });
        recorder.copy_image(source.image, acquired.image, extent);
        recorder.image_barrier(&ImageTransition {
            image: acquired.image,
            old_layout: ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: ImageLayout::PRESENT_SRC_KHR,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::empty(),
            src_stage: PipelineStageFlags::TRANSFER,
            dst_stage: PipelineStageFlags::BOTTOM_OF_PIPE,
        });
    }

    fn present(&mut self, acquired: &AcquiredImage) -> Result<()> {
        self.swapchain.present(acquired.index)?;
        Ok(())
    }
}
