mod application;

use std::rc::Rc;

use application::{Application, ApplicationDelegate};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use rtx_anim::acceleration_structure::BuildPreference;
use rtx_anim::config::RenderConfig;
use rtx_anim::frame::FrameOrchestrator;
use rtx_anim::geometry::TriangleGeometry;
use rtx_anim::logging::install_tracing_subscriber;
use rtx_anim::scene::Scene;
use rtx_anim::scratch::TransientScratch;
use rtx_anim::shader_binding_table::ShaderBindingTable;
use rtx_anim::updater::AccelerationStructureUpdater;
use rtx_anim::vulkan::{open_device, RtxPipeline, SwapchainTarget, VulkanDevice};
use rtx_anim::Result;
use vk_utils::surface::{required_extensions, Surface};
use vk_utils::swapchain::Swapchain;
use vk_utils::vk_instance::Vulkan;
use winit::dpi::PhysicalSize;
use winit::event_loop::EventLoopWindowTarget;
use winit::window::{Window, WindowBuilder};

/// Everything one animated window needs. Fields drop in declaration order,
/// the window last.
struct AnimatedRenderer {
    frames: FrameOrchestrator<VulkanDevice>,
    target: SwapchainTarget,
    updater: AccelerationStructureUpdater<TransientScratch<VulkanDevice>>,
    sbt: ShaderBindingTable<VulkanDevice>,
    pipeline: RtxPipeline,
    scene: Scene<VulkanDevice>,
    _device: Rc<VulkanDevice>,
    _window: Window,
}

impl AnimatedRenderer {
    fn new(config: &RenderConfig, window: Window) -> Result<Self> {
        let display = window.raw_display_handle();
        let vulkan = Rc::new(Vulkan::new(
            "rtx-anim",
            required_extensions(display)?,
            config.enable_validation,
        )?);
        let surface = Surface::new(vulkan.clone(), display, window.raw_window_handle())?;
        let device = open_device(&vulkan, Some(&surface))?;

        let geometry = TriangleGeometry::demo();
        let mut scratch = TransientScratch::new(&device);
        let scene = Scene::new(&device, &geometry, BuildPreference::Animated, &mut scratch)?;
        let updater = AccelerationStructureUpdater::new(config.animation_step, geometry.transform, scratch);

        let pipeline = RtxPipeline::new(device.context().clone(), device.rtx(), &config.shader_dir)?;
        let sbt = ShaderBindingTable::new(&device, pipeline.pipeline())?;
        let frames = FrameOrchestrator::new(&device, config.extent())?;
        pipeline.write_descriptors(scene.tlas().handle(), frames.storage_image().view);

        let swapchain = Swapchain::new(device.context().clone(), surface, config.width, config.height)?;
        tracing::info!(
            images = swapchain.image_count(),
            format = ?swapchain.format(),
            "swapchain created"
        );

        Ok(Self {
            frames,
            target: SwapchainTarget::new(swapchain),
            updater,
            sbt,
            pipeline,
            scene,
            _device: device,
            _window: window,
        })
    }

    fn render(&mut self) -> Result<()> {
        let report = self.frames.render_frame(
            &mut self.scene,
            Some(&mut self.updater),
            &self.sbt,
            &self.pipeline.binding(),
            &mut self.target,
        )?;
        if report.frame % 1000 == 0 {
            tracing::debug!(frame = report.frame, image = report.image_index, "frames rendered");
        }
        Ok(())
    }
}

struct Delegate {
    config: RenderConfig,
    renderer: Option<AnimatedRenderer>,
}

impl Delegate {
    fn new(config: RenderConfig) -> Self {
        Self {
            config,
            renderer: None,
        }
    }
}

impl ApplicationDelegate for Delegate {
    fn application_will_start(&mut self, target: &EventLoopWindowTarget<()>) -> Result<()> {
        let window = WindowBuilder::new()
            .with_title("rtx-anim")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false)
            .build(target)
            .map_err(|error| rtx_anim::Error::MissingCapability(format!("window: {}", error)))?;

        self.renderer = Some(AnimatedRenderer::new(&self.config, window)?);
        Ok(())
    }

    fn application_will_update(&mut self, _: &EventLoopWindowTarget<()>) -> Result<()> {
        match self.renderer.as_mut() {
            Some(renderer) => renderer.render(),
            None => Ok(()),
        }
    }

    fn application_will_quit(&mut self, _: &EventLoopWindowTarget<()>) {
        self.renderer = None;
    }
}

fn main() {
    install_tracing_subscriber();
    let app = Application::new("rtx-anim", Box::new(Delegate::new(RenderConfig::default())));
    app.run();
}
