use crate::device::RtxDevice;
use crate::error::Result;
use crate::geometry::TransformMatrix;
use crate::scene::Scene;
use crate::scratch::ScratchAllocator;

/// What one animation step did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateReport {
    pub frame: u64,
    pub parameter: f64,
    pub translation: f32,
}

/// Moves the geometry along x by `sin(step * frame)` and refits both
/// acceleration structures, once per frame.
pub struct AccelerationStructureUpdater<S> {
    step: f64,
    frame: u64,
    base: TransformMatrix,
    scratch: S,
}

impl<S> AccelerationStructureUpdater<S> {
    pub fn new(step: f64, base: TransformMatrix, scratch: S) -> Self {
        Self {
            step,
            frame: 0,
            base,
            scratch,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Transform used for frame `frame`.
    pub fn transform_at(&self, frame: u64) -> TransformMatrix {
        let mut transform = self.base;
        transform.set_translation_x((self.step * frame as f64).sin() as f32);
        transform
    }

    pub fn update<D>(&mut self, scene: &mut Scene<D>) -> Result<UpdateReport>
    where
        D: RtxDevice,
        S: ScratchAllocator<D>,
    {
        self.frame += 1;
        let transform = self.transform_at(self.frame);
        scene.update(&transform, &mut self.scratch)?;

        let report = UpdateReport {
            frame: self.frame,
            parameter: self.step * self.frame as f64,
            translation: transform.translation_x(),
        };
        tracing::trace!(frame = report.frame, translation = report.translation, "scene updated");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use approx::assert_relative_eq;

    use crate::acceleration_structure::BuildPreference;
    use crate::geometry::TriangleGeometry;
    use crate::scratch::TransientScratch;
    use crate::sim::SimulatedDevice;

    #[test]
    fn frames_are_counted_from_one() {
        let device = Rc::new(SimulatedDevice::new());
        let mut scratch = TransientScratch::new(&device);
        let mut scene = Scene::new(
            &device,
            &TriangleGeometry::demo(),
            BuildPreference::Animated,
            &mut scratch,
        )
        .unwrap();
        let mut updater = AccelerationStructureUpdater::new(0.5, TransformMatrix::identity(), scratch);

        let first = updater.update(&mut scene).unwrap();
        let second = updater.update(&mut scene).unwrap();

        assert_eq!(first.frame, 1);
        assert_relative_eq!(first.translation, 0.5f32.sin(), epsilon = 1e-6);
        assert_eq!(second.frame, 2);
        assert_relative_eq!(second.parameter, 1.0);
        assert_relative_eq!(
            scene.geometry().read_transform().unwrap().translation_x(),
            1.0f32.sin(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn only_the_x_translation_moves() {
        let updater = AccelerationStructureUpdater::new(0.001, TransformMatrix::identity(), ());
        let transform = updater.transform_at(250);

        let mut expected = TransformMatrix::identity();
        expected.set_translation_x(0.25f64.sin() as f32);
        assert_eq!(transform, expected);
    }

    #[test]
    fn failed_update_aborts_the_frame() {
        let device = Rc::new(SimulatedDevice::new());
        let mut scratch = TransientScratch::new(&device);
        let mut scene = Scene::new(
            &device,
            &TriangleGeometry::demo(),
            BuildPreference::FastTrace,
            &mut scratch,
        )
        .unwrap();
        let mut updater = AccelerationStructureUpdater::new(0.001, TransformMatrix::identity(), scratch);

        assert!(updater.update(&mut scene).is_err());
    }
}
