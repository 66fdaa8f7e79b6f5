use std::rc::Rc;

use ash::vk::{
    AccelerationStructureBuildSizesInfoKHR, AccelerationStructureKHR, BufferUsageFlags,
    BuildAccelerationStructureFlagsKHR, BuildAccelerationStructureModeKHR, DeviceAddress,
};

use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::{
    AccelerationStructureKind, BuildCommand, BuildDescription, GeometryDescription, RtxDevice,
};
use crate::error::{Error, Result};
use crate::geometry::GeometryBuffers;
use crate::scratch::ScratchAllocator;

/// Progress of a BUILD, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildStage {
    Unbuilt,
    SizeQueried,
    BufferAllocated,
    AccelerationStructureCreated,
    ScratchAllocated,
    Submitted,
    Built,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPreference {
    /// Static geometry: `PREFER_FAST_TRACE`.
    FastTrace,
    /// Geometry refitted every frame: `PREFER_FAST_BUILD | ALLOW_UPDATE`.
    Animated,
}

impl BuildPreference {
    pub fn flags(self) -> BuildAccelerationStructureFlagsKHR {
        match self {
            BuildPreference::FastTrace => BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            BuildPreference::Animated => {
                BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
                    | BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
            }
        }
    }
}

/// Logs stage transitions and reports where a build stopped if it is dropped
/// before reaching `Built`.
struct BuildProgress {
    kind: AccelerationStructureKind,
    stage: BuildStage,
}

impl BuildProgress {
    fn new(kind: AccelerationStructureKind) -> Self {
        Self {
            kind,
            stage: BuildStage::Unbuilt,
        }
    }

    fn advance(&mut self, stage: BuildStage) {
        tracing::debug!(kind = ?self.kind, from = ?self.stage, to = ?stage, "build stage");
        self.stage = stage;
    }
}

impl Drop for BuildProgress {
    fn drop(&mut self) {
        if self.stage != BuildStage::Built {
            tracing::warn!(kind = ?self.kind, stage = ?self.stage, "acceleration structure build aborted");
        }
    }
}

fn check_sizes(
    kind: AccelerationStructureKind,
    sizes: AccelerationStructureBuildSizesInfoKHR,
    scratch: u64,
) -> Result<()> {
    if sizes.acceleration_structure_size == 0 || scratch == 0 {
        return Err(Error::InvalidBuildSizes { kind, sizes });
    }
    Ok(())
}

/// A built acceleration structure and the buffer backing it. The raw handle is
/// destroyed before the buffer.
pub struct AccelerationStructure<D: RtxDevice> {
    device: Rc<D>,
    handle: AccelerationStructureKHR,
    address: DeviceAddress,
    description: BuildDescription,
    storage: Buffer<D>,
    updates: u64,
}

impl<D: RtxDevice> AccelerationStructure<D> {
    /// Builds a BLAS over the triangles in `geometry`.
    pub fn bottom_level<S: ScratchAllocator<D>>(
        device: &Rc<D>,
        geometry: &GeometryBuffers<D>,
        preference: BuildPreference,
        scratch: &mut S,
    ) -> Result<Self> {
        let description = geometry.description(preference.flags())?;
        Self::build(device, description, scratch)
    }

    /// Builds a TLAS over `instance_count` records in `instances`. The buffer
    /// has to outlive the TLAS if it is going to be updated.
    pub fn top_level<S: ScratchAllocator<D>>(
        device: &Rc<D>,
        instances: &Buffer<D>,
        instance_count: u32,
        preference: BuildPreference,
        scratch: &mut S,
    ) -> Result<Self> {
        let description = BuildDescription {
            kind: AccelerationStructureKind::TopLevel,
            flags: preference.flags(),
            mode: BuildAccelerationStructureModeKHR::BUILD,
            geometry: GeometryDescription::Instances {
                data: instances.device_address()?,
            },
            primitive_count: instance_count,
        };
        Self::build(device, description, scratch)
    }

    fn build<S: ScratchAllocator<D>>(
        device: &Rc<D>,
        description: BuildDescription,
        scratch: &mut S,
    ) -> Result<Self> {
        let kind = description.kind;
        let mut progress = BuildProgress::new(kind);

        let sizes = device.acceleration_structure_build_sizes(&description)?;
        check_sizes(kind, sizes, sizes.build_scratch_size)?;
        progress.advance(BuildStage::SizeQueried);

        let storage = Buffer::new(
            device,
            sizes.acceleration_structure_size,
            BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            None,
        )?;
        progress.advance(BuildStage::BufferAllocated);

        let handle = device.create_acceleration_structure(
            kind,
            storage.handle(),
            sizes.acceleration_structure_size,
        )?;
        let mut structure = Self {
            device: device.clone(),
            handle,
            address: 0,
            description,
            storage,
            updates: 0,
        };
        progress.advance(BuildStage::AccelerationStructureCreated);

        let scratch_buffer = scratch.acquire(sizes.build_scratch_size)?;
        progress.advance(BuildStage::ScratchAllocated);

        let command = BuildCommand {
            description,
            src: AccelerationStructureKHR::null(),
            dst: handle,
            scratch: scratch_buffer.device_address(),
        };
        let submitted =
            device.submit_and_wait(|recorder| recorder.build_acceleration_structure(&command));
        scratch.release(scratch_buffer);
        submitted?;
        progress.advance(BuildStage::Submitted);

        structure.address = device.acceleration_structure_address(handle);
        progress.advance(BuildStage::Built);

        tracing::info!(
            ?kind,
            size = structure.storage.size(),
            address = structure.address,
            "acceleration structure built"
        );
        Ok(structure)
    }

    /// Refits the structure in place from the current contents of the buffers
    /// its geometry references. Handle and address stay the same.
    pub fn update<S: ScratchAllocator<D>>(&mut self, scratch: &mut S) -> Result<()> {
        let kind = self.description.kind;
        if !self.description.allows_update() {
            return Err(Error::UpdateNotAllowed { kind });
        }

        let description = self
            .description
            .with_mode(BuildAccelerationStructureModeKHR::UPDATE);
        let sizes = self.device.acceleration_structure_build_sizes(&description)?;
        check_sizes(kind, sizes, sizes.update_scratch_size)?;

        let scratch_buffer = scratch.acquire(sizes.update_scratch_size)?;
        let command = BuildCommand {
            description,
            src: self.handle,
            dst: self.handle,
            scratch: scratch_buffer.device_address(),
        };
        let submitted = self
            .device
            .submit_and_wait(|recorder| recorder.build_acceleration_structure(&command));
        scratch.release(scratch_buffer);
        submitted?;

        let address = self.device.acceleration_structure_address(self.handle);
        if address != self.address {
            tracing::warn!(?kind, old = self.address, new = address, "address changed by update");
            self.address = address;
        }
        self.updates += 1;
        tracing::trace!(?kind, updates = self.updates, "acceleration structure updated");
        Ok(())
    }

    pub fn kind(&self) -> AccelerationStructureKind {
        self.description.kind
    }

    pub fn handle(&self) -> AccelerationStructureKHR {
        self.handle
    }

    /// Address resolved after the last build or update.
    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    /// Asks the device again, without building.
    pub fn query_device_address(&self) -> DeviceAddress {
        self.device.acceleration_structure_address(self.handle)
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }
}

impl<D: RtxDevice> Drop for AccelerationStructure<D> {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{InstanceRecord, TriangleGeometry};
    use crate::scratch::{ScratchBuffer, TransientScratch};
    use crate::sim::{FailurePoint, SimConfig, SimulatedDevice};

    /// Counts scratch buffers handed out and taken back.
    struct CountingScratch {
        inner: TransientScratch<SimulatedDevice>,
        acquired: usize,
        released: usize,
    }

    impl CountingScratch {
        fn new(device: &Rc<SimulatedDevice>) -> Self {
            Self {
                inner: TransientScratch::new(device),
                acquired: 0,
                released: 0,
            }
        }
    }

    impl ScratchAllocator<SimulatedDevice> for CountingScratch {
        fn acquire(&mut self, size: u64) -> Result<ScratchBuffer<SimulatedDevice>> {
            let scratch = self.inner.acquire(size)?;
            self.acquired += 1;
            Ok(scratch)
        }

        fn release(&mut self, scratch: ScratchBuffer<SimulatedDevice>) {
            self.released += 1;
            self.inner.release(scratch);
        }
    }

    fn fixed_sizes(_: &BuildDescription) -> AccelerationStructureBuildSizesInfoKHR {
        AccelerationStructureBuildSizesInfoKHR {
            acceleration_structure_size: 4096,
            build_scratch_size: 2048,
            update_scratch_size: 1024,
            ..Default::default()
        }
    }

    fn no_build_scratch(description: &BuildDescription) -> AccelerationStructureBuildSizesInfoKHR {
        AccelerationStructureBuildSizesInfoKHR {
            build_scratch_size: 0,
            ..fixed_sizes(description)
        }
    }

    fn no_update_scratch(description: &BuildDescription) -> AccelerationStructureBuildSizesInfoKHR {
        AccelerationStructureBuildSizesInfoKHR {
            update_scratch_size: 0,
            ..fixed_sizes(description)
        }
    }

    fn device_with_sizes(
        sizes: fn(&BuildDescription) -> AccelerationStructureBuildSizesInfoKHR,
    ) -> Rc<SimulatedDevice> {
        Rc::new(SimulatedDevice::with_config(SimConfig {
            build_sizes: Some(sizes),
            ..SimConfig::default()
        }))
    }

    fn blas(
        device: &Rc<SimulatedDevice>,
        preference: BuildPreference,
    ) -> (GeometryBuffers<SimulatedDevice>, Result<AccelerationStructure<SimulatedDevice>>) {
        let geometry = GeometryBuffers::new(device, &TriangleGeometry::demo()).unwrap();
        let mut scratch = TransientScratch::new(device);
        let blas = AccelerationStructure::bottom_level(device, &geometry, preference, &mut scratch);
        (geometry, blas)
    }

    #[test]
    fn build_releases_scratch_after_the_wait() {
        let device = Rc::new(SimulatedDevice::new());
        let (_geometry, blas) = blas(&device, BuildPreference::FastTrace);
        let blas = blas.unwrap();

        let live = device.live_objects();
        // vertices, indices, transform and the AS storage.
        assert_eq!(live.buffers, 4);
        assert_eq!(live.acceleration_structures, 1);
        assert_ne!(blas.device_address(), 0);
        assert_eq!(blas.kind(), AccelerationStructureKind::BottomLevel);
        assert_eq!(blas.storage.size(), 1024);
    }

    #[test]
    fn zero_build_scratch_is_rejected_before_allocation() {
        let device = device_with_sizes(no_build_scratch);
        let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
        let before = device.live_objects();

        let mut scratch = TransientScratch::new(&device);
        let result = AccelerationStructure::bottom_level(
            &device,
            &geometry,
            BuildPreference::Animated,
            &mut scratch,
        );

        assert!(matches!(
            &result,
            Err(Error::InvalidBuildSizes {
                kind: AccelerationStructureKind::BottomLevel,
                sizes,
            }) if sizes.build_scratch_size == 0
        ));
        assert_eq!(device.live_objects(), before);
        assert!(device.build_log().is_empty());
    }

    #[test]
    fn zero_update_scratch_is_rejected_without_submitting() {
        let device = device_with_sizes(no_update_scratch);
        let (_geometry, blas) = blas(&device, BuildPreference::Animated);
        let mut blas = blas.unwrap();
        let live = device.live_objects();
        let submissions = device.build_log().len();

        let mut scratch = TransientScratch::new(&device);
        assert!(matches!(
            blas.update(&mut scratch),
            Err(Error::InvalidBuildSizes {
                kind: AccelerationStructureKind::BottomLevel,
                ..
            })
        ));
        assert_eq!(device.live_objects(), live);
        assert_eq!(device.build_log().len(), submissions);
        assert_eq!(blas.update_count(), 0);
    }

    #[test]
    fn failed_submission_returns_scratch_to_the_allocator() {
        let device = Rc::new(SimulatedDevice::new());
        let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
        let mut scratch = CountingScratch::new(&device);

        device.inject_failure(FailurePoint::Submit, 0);
        let result = AccelerationStructure::bottom_level(
            &device,
            &geometry,
            BuildPreference::Animated,
            &mut scratch,
        );
        assert!(result.is_err());
        assert_eq!((scratch.acquired, scratch.released), (1, 1));

        let mut blas = AccelerationStructure::bottom_level(
            &device,
            &geometry,
            BuildPreference::Animated,
            &mut scratch,
        )
        .unwrap();
        device.inject_failure(FailurePoint::Submit, 0);
        assert!(blas.update(&mut scratch).is_err());
        assert_eq!((scratch.acquired, scratch.released), (3, 3));
        assert_eq!(blas.update_count(), 0);
    }

    #[test]
    fn fast_trace_structures_reject_updates() {
        let device = Rc::new(SimulatedDevice::new());
        let (_geometry, blas) = blas(&device, BuildPreference::FastTrace);
        let mut blas = blas.unwrap();
        let mut scratch = TransientScratch::new(&device);
        let submissions = device.build_log().len();

        assert!(matches!(
            blas.update(&mut scratch),
            Err(Error::UpdateNotAllowed {
                kind: AccelerationStructureKind::BottomLevel
            })
        ));
        assert_eq!(device.build_log().len(), submissions);
    }

    #[test]
    fn update_is_in_place() {
        let device = Rc::new(SimulatedDevice::new());
        let (_geometry, blas) = blas(&device, BuildPreference::Animated);
        let mut blas = blas.unwrap();
        let mut scratch = TransientScratch::new(&device);
        let handle = blas.handle();
        let address = blas.device_address();

        blas.update(&mut scratch).unwrap();
        blas.update(&mut scratch).unwrap();

        assert_eq!(blas.handle(), handle);
        assert_eq!(blas.device_address(), address);
        assert_eq!(blas.update_count(), 2);
        let log = device.build_log();
        let last = log.last().unwrap();
        assert_eq!(last.mode, BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(last.src, last.dst);
    }

    #[test]
    fn failed_submission_releases_everything_it_created() {
        let device = Rc::new(SimulatedDevice::new());
        let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
        let before = device.live_objects();
        device.inject_failure(FailurePoint::Submit, 0);

        let mut scratch = TransientScratch::new(&device);
        let result = AccelerationStructure::bottom_level(
            &device,
            &geometry,
            BuildPreference::Animated,
            &mut scratch,
        );

        assert!(matches!(result, Err(Error::DeviceCallFailure { .. })));
        assert_eq!(device.live_objects(), before);
    }

    #[test]
    fn failed_structure_creation_releases_storage() {
        let device = Rc::new(SimulatedDevice::new());
        let geometry = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();
        let before = device.live_objects();
        device.inject_failure(FailurePoint::CreateAccelerationStructure, 0);

        let mut scratch = TransientScratch::new(&device);
        let result = AccelerationStructure::bottom_level(
            &device,
            &geometry,
            BuildPreference::FastTrace,
            &mut scratch,
        );

        assert!(result.is_err());
        assert_eq!(device.live_objects(), before);
    }

    #[test]
    fn top_level_references_blas_instance() {
        let device = Rc::new(SimulatedDevice::new());
        let (_geometry, blas) = blas(&device, BuildPreference::FastTrace);
        let blas = blas.unwrap();
        let record = InstanceRecord::for_blas(blas.device_address());
        let instances = Buffer::new(
            &device,
            std::mem::size_of::<InstanceRecord>() as u64,
            BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            Some(bytemuck::bytes_of(&record)),
        )
        .unwrap();

        let mut scratch = TransientScratch::new(&device);
        let tlas = AccelerationStructure::top_level(
            &device,
            &instances,
            1,
            BuildPreference::FastTrace,
            &mut scratch,
        )
        .unwrap();

        assert_eq!(tlas.kind(), AccelerationStructureKind::TopLevel);
        let log = device.build_log();
        let build = log.last().unwrap();
        assert_eq!(build.instance_reference, Some(blas.device_address()));
    }
}
