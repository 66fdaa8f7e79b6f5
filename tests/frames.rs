use std::rc::Rc;

use ash::vk::{self, ImageLayout};
use rtx_anim::acceleration_structure::BuildPreference;
use rtx_anim::device::PipelineBinding;
use rtx_anim::frame::{FrameOrchestrator, FramePhase, OffscreenTarget};
use rtx_anim::geometry::TriangleGeometry;
use rtx_anim::scene::Scene;
use rtx_anim::scratch::TransientScratch;
use rtx_anim::shader_binding_table::ShaderBindingTable;
use rtx_anim::sim::{FailurePoint, LiveObjects, SimulatedDevice};
use rtx_anim::updater::AccelerationStructureUpdater;

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 4,
    height: 3,
};

struct Fixture {
    target: OffscreenTarget<SimulatedDevice>,
    frames: FrameOrchestrator<SimulatedDevice>,
    updater: AccelerationStructureUpdater<TransientScratch<SimulatedDevice>>,
    sbt: ShaderBindingTable<SimulatedDevice>,
    scene: Scene<SimulatedDevice>,
    binding: PipelineBinding,
}

impl Fixture {
    fn new(device: &Rc<SimulatedDevice>) -> Self {
        let geometry = TriangleGeometry::demo();
        let mut scratch = TransientScratch::new(device);
        let scene = Scene::new(device, &geometry, BuildPreference::Animated, &mut scratch).unwrap();
        let pipeline = device.create_pipeline();
        Self {
            target: OffscreenTarget::new(device, EXTENT).unwrap(),
            frames: FrameOrchestrator::new(device, EXTENT).unwrap(),
            updater: AccelerationStructureUpdater::new(0.001, geometry.transform, scratch),
            sbt: ShaderBindingTable::new(device, pipeline).unwrap(),
            scene,
            binding: PipelineBinding {
                pipeline,
                layout: vk::PipelineLayout::null(),
                descriptor_set: vk::DescriptorSet::null(),
            },
        }
    }

    fn animated_frame(&mut self) -> rtx_anim::Result<rtx_anim::frame::FrameReport> {
        self.frames.render_frame(
            &mut self.scene,
            Some(&mut self.updater),
            &self.sbt,
            &self.binding,
            &mut self.target,
        )
    }
}

#[test]
fn storage_image_starts_in_general_layout() {
    let device = Rc::new(SimulatedDevice::new());
    let frames = FrameOrchestrator::new(&device, EXTENT).unwrap();

    assert_eq!(
        device.image_layout(frames.storage_image().image),
        Some(ImageLayout::GENERAL)
    );
    assert_eq!(frames.extent(), EXTENT);
    assert_eq!(frames.phase(), FramePhase::Idle);
}

#[test]
fn static_frame_is_read_back_and_written_as_ppm() {
    let device = Rc::new(SimulatedDevice::new());
    let mut fixture = Fixture::new(&device);
    let builds = device.build_log().len();

    let report = fixture
        .frames
        .render_frame(
            &mut fixture.scene,
            None::<&mut AccelerationStructureUpdater<TransientScratch<SimulatedDevice>>>,
            &fixture.sbt,
            &fixture.binding,
            &mut fixture.target,
        )
        .unwrap();

    assert_eq!(report.frame, 1);
    assert!(report.update.is_none());
    assert_eq!(device.build_log().len(), builds);

    let traces = device.trace_log();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].extent, EXTENT);
    assert_eq!(traces[0].raygen_handle, vec![0x11; 32]);

    let pixels = fixture.target.pixels();
    assert_eq!(pixels.len(), 4 * 3 * 3);
    let last = (2 * 4 + 3) * 3;
    assert_eq!(&pixels[..3], &[0, 0, 1]);
    assert_eq!(&pixels[last..last + 3], &[3, 2, 1]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.ppm");
    fixture.target.write_ppm(&path).unwrap();
    let written = std::fs::read(&path).unwrap();
    let header = b"P6 4 3 255\n";
    assert_eq!(&written[..header.len()], header);
    assert_eq!(&written[header.len()..], pixels);
}

#[test]
fn each_frame_updates_before_tracing() {
    let device = Rc::new(SimulatedDevice::new());
    let mut fixture = Fixture::new(&device);

    for frame in 1..=3u64 {
        let report = fixture.animated_frame().unwrap();
        assert_eq!(report.frame, frame);
        assert_eq!(report.update.unwrap().frame, frame);
        assert!(!device.frame_in_flight());
    }

    assert_eq!(device.frames_submitted(), 3);
    assert_eq!(device.trace_log().len(), 3);
    assert_eq!(fixture.scene.blas().update_count(), 3);
    assert_eq!(fixture.frames.frames_rendered(), 3);
    assert_eq!(fixture.frames.phase(), FramePhase::Idle);
    assert_eq!(fixture.target.pixels()[2], 3);
}

#[test]
fn failed_submission_stops_in_the_submit_phase() {
    let device = Rc::new(SimulatedDevice::new());
    let mut fixture = Fixture::new(&device);

    device.inject_failure(FailurePoint::Submit, 2);
    assert!(fixture.animated_frame().is_err());
    assert_eq!(fixture.frames.phase(), FramePhase::Submit);
    assert_eq!(fixture.frames.frames_rendered(), 0);
    assert!(device.trace_log().is_empty());

    fixture.animated_frame().unwrap();
    assert_eq!(fixture.frames.frames_rendered(), 1);
}

#[test]
fn teardown_releases_every_object() {
    let device = Rc::new(SimulatedDevice::new());
    {
        let mut fixture = Fixture::new(&device);
        fixture.animated_frame().unwrap();
    }

    assert_eq!(device.live_objects(), LiveObjects::default());
}
