use std::cell::Cell;
use std::rc::Rc;

use ash::vk::{
    CommandBuffer, CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandBufferLevel,
    CommandBufferResetFlags, CommandBufferUsageFlags, CommandPool, CommandPoolCreateFlags,
    CommandPoolCreateInfo, PipelineStageFlags, Semaphore, SubmitInfo,
};

use crate::device_context::DeviceContext;
use crate::error::{Result, VkResultExt};
use crate::wait_handle::WaitHandle;

/// Graphics queue with two reusable command buffers: one for blocking one-shot
/// submissions, one for frames gated by the in-flight fence.
pub struct CommandQueue {
    device: Rc<DeviceContext>,
    command_pool: CommandPool,
    immediate: CommandBuffer,
    frame: CommandBuffer,
    immediate_fence: WaitHandle,
    in_flight: WaitHandle,
    /// Set between a successful frame submission and the wait on its fence.
    frame_pending: Cell<bool>,
}

impl CommandQueue {
    pub fn new(device: Rc<DeviceContext>) -> Result<Self> {
        let immediate_fence = WaitHandle::new(device.handle(), false)?;
        let in_flight = WaitHandle::new(device.handle(), false)?;

        let pool_info = CommandPoolCreateInfo::builder()
            .flags(CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.gpu().queue_family_index());
        let command_pool = unsafe { device.handle().create_command_pool(&pool_info, None) }
            .call("vkCreateCommandPool")?;

        let allocate_info = CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(CommandBufferLevel::PRIMARY)
            .command_buffer_count(2);
        let command_buffers =
            match unsafe { device.handle().allocate_command_buffers(&allocate_info) } {
                Ok(buffers) => buffers,
                Err(result) => {
                    unsafe { device.handle().destroy_command_pool(command_pool, None) };
                    return Err(crate::error::Error::Vulkan {
                        call: "vkAllocateCommandBuffers",
                        result,
                    });
                }
            };

        Ok(Self {
            device,
            command_pool,
            immediate: command_buffers[0],
            frame: command_buffers[1],
            immediate_fence,
            in_flight,
            frame_pending: Cell::new(false),
        })
    }

    /// Records with `f`, submits and blocks until the GPU is done.
    pub fn submit_and_wait<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(CommandBuffer),
    {
        self.record(self.immediate, f)?;

        let command_buffers = [self.immediate];
        let submit_info = SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            self.device.handle().queue_submit(
                self.device.queue(),
                &[submit_info.build()],
                self.immediate_fence.handle(),
            )
        }
        .call("vkQueueSubmit")?;

        self.immediate_fence.wait()?;
        self.immediate_fence.reset()
    }

    /// Blocks until the last frame submission has completed.
    pub fn wait_for_frame(&self) -> Result<()> {
        if self.frame_pending.get() {
            self.in_flight.wait()?;
            self.frame_pending.set(false);
        }
        Ok(())
    }

    /// Re-records the frame command buffer and submits it under the in-flight fence.
    pub fn submit_frame<F>(
        &self,
        wait: Option<(Semaphore, PipelineStageFlags)>,
        signal: Option<Semaphore>,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(CommandBuffer),
    {
        if self.frame_pending.get() && !self.in_flight.has_completed() {
            tracing::trace!("frame command buffer still in flight, waiting");
        }
        self.wait_for_frame()?;

        self.record(self.frame, f)?;
        self.in_flight.reset()?;

        let command_buffers = [self.frame];
        let wait_semaphores: Vec<Semaphore> = wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<PipelineStageFlags> = wait.iter().map(|(_, s)| *s).collect();
        let signal_semaphores: Vec<Semaphore> = signal.into_iter().collect();
        let submit_info = SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.handle().queue_submit(
                self.device.queue(),
                &[submit_info.build()],
                self.in_flight.handle(),
            )
        }
        .call("vkQueueSubmit")?;
        self.frame_pending.set(true);
        Ok(())
    }

    fn record<F>(&self, command_buffer: CommandBuffer, f: F) -> Result<()>
    where
        F: FnOnce(CommandBuffer),
    {
        let device = self.device.handle();
        unsafe {
            device
                .reset_command_buffer(command_buffer, CommandBufferResetFlags::empty())
                .call("vkResetCommandBuffer")?;
            let begin_info =
                CommandBufferBeginInfo::builder().flags(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .call("vkBeginCommandBuffer")?;
        }

        f(command_buffer);

        unsafe { device.end_command_buffer(command_buffer) }.call("vkEndCommandBuffer")
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        unsafe {
            let _ = self.wait_for_frame();
            self.device
                .handle()
                .destroy_command_pool(self.command_pool, None);
        }
    }
}
