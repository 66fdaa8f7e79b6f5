use std::rc::Rc;

use approx::assert_relative_eq;
use ash::vk::{BufferUsageFlags, BuildAccelerationStructureModeKHR, GeometryInstanceFlagsKHR};
use rtx_anim::acceleration_structure::{AccelerationStructure, BuildPreference};
use rtx_anim::device::AccelerationStructureKind;
use rtx_anim::geometry::{GeometryBuffers, TriangleGeometry};
use rtx_anim::scene::Scene;
use rtx_anim::scratch::TransientScratch;
use rtx_anim::sim::{FailurePoint, LiveObjects, SimConfig, SimulatedDevice};
use rtx_anim::updater::AccelerationStructureUpdater;
use rtx_anim::Error;

fn animated_scene(device: &Rc<SimulatedDevice>) -> Scene<SimulatedDevice> {
    let mut scratch = TransientScratch::new(device);
    Scene::new(
        device,
        &TriangleGeometry::demo(),
        BuildPreference::Animated,
        &mut scratch,
    )
    .unwrap()
}

#[test]
fn blas_over_the_demo_triangle_has_an_address() {
    let device = Rc::new(SimulatedDevice::new());
    let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
    let mut scratch = TransientScratch::new(&device);

    let blas = AccelerationStructure::bottom_level(
        &device,
        &geometry,
        BuildPreference::FastTrace,
        &mut scratch,
    )
    .unwrap();

    assert_ne!(blas.device_address(), 0);
    let log = device.build_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, AccelerationStructureKind::BottomLevel);
    assert_eq!(log[0].mode, BuildAccelerationStructureModeKHR::BUILD);
}

#[test]
fn tlas_address_is_stable_between_queries() {
    let device = Rc::new(SimulatedDevice::new());
    let scene = animated_scene(&device);

    let record = scene.instance_record().unwrap();
    assert_eq!(record.mask(), 0xFF);
    assert_eq!(record.custom_index(), 0);
    assert_eq!(record.sbt_record_offset(), 0);
    assert_eq!(
        record.flags(),
        GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
    );
    assert_eq!(record.acceleration_structure_reference(), scene.blas().device_address());

    let first = scene.tlas().query_device_address();
    let second = scene.tlas().query_device_address();
    assert_ne!(first, 0);
    assert_eq!(first, second);
    assert_eq!(first, scene.tlas().device_address());
}

#[test]
fn hundred_updates_follow_the_sine_path() {
    let device = Rc::new(SimulatedDevice::new());
    let mut scene = animated_scene(&device);
    let blas_address = scene.blas().device_address();
    let tlas_address = scene.tlas().device_address();
    let blas_handle = scene.blas().handle();
    let mut updater = AccelerationStructureUpdater::new(
        0.001,
        TriangleGeometry::demo().transform,
        TransientScratch::new(&device),
    );

    for k in 1..=100u64 {
        let report = updater.update(&mut scene).unwrap();
        assert_eq!(report.frame, k);

        let stored = scene.geometry().read_transform().unwrap();
        assert_relative_eq!(stored.translation_x(), (0.001 * k as f64).sin() as f32, epsilon = 1e-6);
    }

    assert_eq!(scene.blas().device_address(), blas_address);
    assert_eq!(scene.tlas().device_address(), tlas_address);
    assert_eq!(scene.blas().handle(), blas_handle);
    assert_eq!(scene.blas().update_count(), 100);
    assert_eq!(scene.tlas().update_count(), 100);

    let updates: Vec<_> = device
        .build_log()
        .into_iter()
        .filter(|record| record.mode == BuildAccelerationStructureModeKHR::UPDATE)
        .collect();
    assert_eq!(updates.len(), 200);
    assert!(updates.iter().all(|record| record.src == record.dst));
}

#[test]
fn blas_update_sees_the_new_transform_before_the_tlas_update() {
    let device = Rc::new(SimulatedDevice::new());
    let mut scene = animated_scene(&device);
    let mut updater = AccelerationStructureUpdater::new(
        0.25,
        TriangleGeometry::demo().transform,
        TransientScratch::new(&device),
    );
    let builds_before = device.build_log().len();

    updater.update(&mut scene).unwrap();
    updater.update(&mut scene).unwrap();

    let log = device.build_log();
    let frame_builds = &log[builds_before..];
    let kinds: Vec<_> = frame_builds.iter().map(|record| record.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AccelerationStructureKind::BottomLevel,
            AccelerationStructureKind::TopLevel,
            AccelerationStructureKind::BottomLevel,
            AccelerationStructureKind::TopLevel,
        ]
    );

    for (frame, blas_update) in frame_builds.iter().step_by(2).enumerate() {
        let seen = blas_update.transform.unwrap().translation_x();
        assert_relative_eq!(seen, (0.25 * (frame + 1) as f64).sin() as f32, epsilon = 1e-6);
    }
    for tlas_update in frame_builds.iter().skip(1).step_by(2) {
        assert_eq!(tlas_update.instance_reference, Some(scene.blas().device_address()));
    }
}

#[test]
fn missing_host_memory_aborts_before_the_structure_exists() {
    let device = Rc::new(SimulatedDevice::with_config(SimConfig {
        usage_memory_type_bits: vec![(BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR, 0b01)],
        ..SimConfig::default()
    }));
    let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
    let before = device.live_objects();
    let mut scratch = TransientScratch::new(&device);

    let result = AccelerationStructure::bottom_level(
        &device,
        &geometry,
        BuildPreference::Animated,
        &mut scratch,
    );

    assert!(matches!(result, Err(Error::NoMatchingMemoryType { .. })));
    assert_eq!(device.live_objects(), before);
    assert_eq!(device.live_objects().acceleration_structures, 0);
    assert!(device.build_log().is_empty());
}

#[test]
fn failed_update_leaves_the_structures_usable() {
    let device = Rc::new(SimulatedDevice::new());
    let mut scene = animated_scene(&device);
    let mut updater = AccelerationStructureUpdater::new(
        0.001,
        TriangleGeometry::demo().transform,
        TransientScratch::new(&device),
    );
    let live = device.live_objects();

    device.inject_failure(FailurePoint::Submit, 0);
    assert!(updater.update(&mut scene).is_err());
    assert_eq!(device.live_objects(), live);

    updater.update(&mut scene).unwrap();
    assert_eq!(updater.frame(), 2);
}

#[test]
fn dropping_the_scene_releases_every_object() {
    let device = Rc::new(SimulatedDevice::new());
    {
        let mut scene = animated_scene(&device);
        let mut updater = AccelerationStructureUpdater::new(
            0.001,
            TriangleGeometry::demo().transform,
            TransientScratch::new(&device),
        );
        for _ in 0..5 {
            updater.update(&mut scene).unwrap();
        }
        let live = device.live_objects();
        // vertices, indices, transform, instances and the two AS storages.
        assert_eq!(live.buffers, 6);
        assert_eq!(live.acceleration_structures, 2);
    }

    assert_eq!(device.live_objects(), LiveObjects::default());
}
