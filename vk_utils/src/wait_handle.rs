use ash::vk::{Fence, FenceCreateFlags, FenceCreateInfo};
use ash::Device;

use crate::error::{Result, VkResultExt};

/// Owned fence. Waits are always unbounded.
pub struct WaitHandle {
    device: Device,
    fence: Fence,
}

impl WaitHandle {
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            FenceCreateFlags::SIGNALED
        } else {
            FenceCreateFlags::empty()
        };
        let info = FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.create_fence(&info, None) }.call("vkCreateFence")?;
        Ok(Self {
            device: device.clone(),
            fence,
        })
    }

    pub fn handle(&self) -> Fence {
        self.fence
    }

    pub fn has_completed(&self) -> bool {
        unsafe { self.device.get_fence_status(self.fence) }.unwrap_or(false)
    }

    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
        }
        .call("vkWaitForFences")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.call("vkResetFences")
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) }
    }
}
