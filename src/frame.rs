use std::path::Path;
use std::rc::Rc;

use ash::vk::{self, AccessFlags, ImageLayout, PipelineStageFlags};

use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::{CommandRecorder, ImageTransition, PipelineBinding, RtxDevice, StorageImage};
use crate::error::Result;
use crate::ppm;
use crate::scene::Scene;
use crate::scratch::ScratchAllocator;
use crate::shader_binding_table::ShaderBindingTable;
use crate::updater::{AccelerationStructureUpdater, UpdateReport};

pub const STORAGE_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Updating,
    AcquireImage,
    RecordTrace,
    Submit,
    Present,
}

/// Image the rendered frame is copied into.
#[derive(Clone, Copy, Debug)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    /// Semaphore the frame submission waits on before the copy.
    pub wait: Option<(vk::Semaphore, PipelineStageFlags)>,
}

/// Where finished frames go: a swapchain or host memory.
pub trait PresentTarget {
    fn acquire(&mut self) -> Result<AcquiredImage>;

    /// Semaphore signalled when the frame submission completes.
    fn signal_semaphore(&self) -> Option<vk::Semaphore> {
        None
    }

    /// Records the copy out of `source`, which is in `GENERAL` layout.
    fn record_copy(
        &self,
        recorder: &mut dyn CommandRecorder,
        source: &StorageImage,
        acquired: &AcquiredImage,
    );

    fn present(&mut self, acquired: &AcquiredImage) -> Result<()>;

    /// Called once the frame's fence has signalled.
    fn frame_completed(&mut self, _acquired: &AcquiredImage) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FrameReport {
    pub frame: u64,
    pub image_index: u32,
    pub update: Option<UpdateReport>,
}

/// Owns the storage image and drives update, trace, copy and present for
/// one frame at a time.
pub struct FrameOrchestrator<D: RtxDevice> {
    device: Rc<D>,
    storage_image: StorageImage,
    phase: FramePhase,
    frames: u64,
}

impl<D: RtxDevice> FrameOrchestrator<D> {
    /// Creates the storage image and moves it to `GENERAL`, where it stays.
    pub fn new(device: &Rc<D>, extent: vk::Extent2D) -> Result<Self> {
        let storage_image = device.create_storage_image(extent, STORAGE_IMAGE_FORMAT)?;
        let orchestrator = Self {
            device: device.clone(),
            storage_image,
            phase: FramePhase::Idle,
            frames: 0,
        };

        let transition = ImageTransition {
            image: storage_image.image,
            old_layout: ImageLayout::UNDEFINED,
            new_layout: ImageLayout::GENERAL,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::SHADER_WRITE,
            src_stage: PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        };
        device.submit_and_wait(|recorder| recorder.image_barrier(&transition))?;
        Ok(orchestrator)
    }

    pub fn storage_image(&self) -> &StorageImage {
        &self.storage_image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.storage_image.extent
    }

    /// Phase reached by the current or last frame. Stays put when a frame fails.
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    fn enter(&mut self, phase: FramePhase) {
        tracing::trace!(frame = self.frames + 1, ?phase, "frame phase");
        self.phase = phase;
    }

    /// Renders one frame into `target`. With an updater, the scene is refitted
    /// before anything is recorded. Returns once the frame's fence signalled.
    pub fn render_frame<S, T>(
        &mut self,
        scene: &mut Scene<D>,
        updater: Option<&mut AccelerationStructureUpdater<S>>,
        sbt: &ShaderBindingTable<D>,
        binding: &PipelineBinding,
        target: &mut T,
    ) -> Result<FrameReport>
    where
        S: ScratchAllocator<D>,
        T: PresentTarget,
    {
        self.enter(FramePhase::Idle);
        self.device.wait_for_frame()?;

        let update = match updater {
            Some(updater) => {
                self.enter(FramePhase::Updating);
                Some(updater.update(scene)?)
            }
            None => None,
        };

        self.enter(FramePhase::AcquireImage);
        let acquired = target.acquire()?;

        self.enter(FramePhase::RecordTrace);
        let storage_image = self.storage_image;
        let regions = sbt.regions();
        let signal = target.signal_semaphore();
        let target_ref: &T = target;
        let record = |recorder: &mut dyn CommandRecorder| {
            recorder.bind_ray_tracing(binding);
            recorder.trace_rays(&regions, storage_image.extent);
            recorder.image_barrier(&ImageTransition {
                image: storage_image.image,
                old_layout: ImageLayout::GENERAL,
                new_layout: ImageLayout::GENERAL,
                src_access: AccessFlags::SHADER_WRITE,
                dst_access: AccessFlags::TRANSFER_READ,
                src_stage: PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                dst_stage: PipelineStageFlags::TRANSFER,
            });
            target_ref.record_copy(recorder, &storage_image, &acquired);
        };

        self.enter(FramePhase::Submit);
        self.device.submit_frame(acquired.wait, signal, record)?;

        self.enter(FramePhase::Present);
        target.present(&acquired)?;
        self.device.wait_for_frame()?;
        target.frame_completed(&acquired)?;

        self.frames += 1;
        self.enter(FramePhase::Idle);
        Ok(FrameReport {
            frame: self.frames,
            image_index: acquired.index,
            update,
        })
    }
}

impl<D: RtxDevice> Drop for FrameOrchestrator<D> {
    fn drop(&mut self) {
        let _ = self.device.wait_for_frame();
        self.device.destroy_storage_image(&self.storage_image);
    }
}

/// Copies each frame into host memory and keeps the last one as RGB8.
pub struct OffscreenTarget<D: RtxDevice> {
    readback: Buffer<D>,
    extent: vk::Extent2D,
    pixels: Vec<u8>,
}

impl<D: RtxDevice> OffscreenTarget<D> {
    pub fn new(device: &Rc<D>, extent: vk::Extent2D) -> Result<Self> {
        let size = extent.width as u64 * extent.height as u64 * 4;
        let readback = Buffer::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            HOST_MEMORY,
            None,
        )?;
        Ok(Self {
            readback,
            extent,
            pixels: Vec::new(),
        })
    }

    /// RGB8 pixels of the last completed frame, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn write_ppm(&self, path: &Path) -> Result<()> {
        ppm::save_ppm(path, self.extent.width, self.extent.height, &self.pixels)
    }
}

impl<D: RtxDevice> PresentTarget for OffscreenTarget<D> {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        Ok(AcquiredImage {
            index: 0,
            image: vk::Image::null(),
            wait: None,
        })
    }

    fn record_copy(
        &self,
        recorder: &mut dyn CommandRecorder,
        source: &StorageImage,
        _acquired: &AcquiredImage,
    ) {
        recorder.copy_image_to_buffer(source.image, self.readback.handle(), self.extent);
    }

    fn present(&mut self, _acquired: &AcquiredImage) -> Result<()> {
        Ok(())
    }

    fn frame_completed(&mut self, _acquired: &AcquiredImage) -> Result<()> {
        let rgba = self.readback.read(0, self.readback.size() as usize)?;
        self.pixels = ppm::rgba_to_rgb(&rgba);
        Ok(())
    }
}
