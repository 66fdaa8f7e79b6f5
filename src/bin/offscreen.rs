//! Renders a single frame of the static scene to `image.ppm`.

use std::rc::Rc;

use rtx_anim::acceleration_structure::BuildPreference;
use rtx_anim::config::RenderConfig;
use rtx_anim::frame::{FrameOrchestrator, OffscreenTarget};
use rtx_anim::geometry::TriangleGeometry;
use rtx_anim::logging::install_tracing_subscriber;
use rtx_anim::scene::Scene;
use rtx_anim::scratch::TransientScratch;
use rtx_anim::shader_binding_table::ShaderBindingTable;
use rtx_anim::updater::AccelerationStructureUpdater;
use rtx_anim::vulkan::{open_device, RtxPipeline, VulkanDevice};
use rtx_anim::Result;
use vk_utils::vk_instance::Vulkan;

fn render(config: &RenderConfig) -> Result<()> {
    let vulkan = Rc::new(Vulkan::new("offscreen", &[], config.enable_validation)?);
    let device = open_device(&vulkan, None)?;

    let mut scratch = TransientScratch::new(&device);
    let mut scene = Scene::new(
        &device,
        &TriangleGeometry::demo(),
        BuildPreference::FastTrace,
        &mut scratch,
    )?;

    let pipeline = RtxPipeline::new(device.context().clone(), device.rtx(), &config.shader_dir)?;
    let sbt = ShaderBindingTable::new(&device, pipeline.pipeline())?;
    let mut frames = FrameOrchestrator::new(&device, config.extent())?;
    pipeline.write_descriptors(scene.tlas().handle(), frames.storage_image().view);

    let mut target = OffscreenTarget::new(&device, config.extent())?;
    frames.render_frame(
        &mut scene,
        None::<&mut AccelerationStructureUpdater<TransientScratch<VulkanDevice>>>,
        &sbt,
        &pipeline.binding(),
        &mut target,
    )?;
    target.write_ppm(&config.output_path)
}

fn main() {
    install_tracing_subscriber();
    if let Err(error) = render(&RenderConfig::default()) {
        tracing::error!(%error, "render failed");
        eprintln!("render failed: {}", error);
        std::process::exit(1);
    }
}
