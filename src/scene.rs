use std::rc::Rc;

use ash::vk::BufferUsageFlags;

use crate::acceleration_structure::{AccelerationStructure, BuildPreference};
use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::RtxDevice;
use crate::error::Result;
use crate::geometry::{GeometryBuffers, InstanceRecord, TransformMatrix, TriangleGeometry};
use crate::scratch::ScratchAllocator;

/// Geometry buffers, the BLAS over them, the instance buffer and the TLAS over
/// that instance. Fields drop top-down, TLAS first.
pub struct Scene<D: RtxDevice> {
    tlas: AccelerationStructure<D>,
    instances: Buffer<D>,
    blas: AccelerationStructure<D>,
    geometry: GeometryBuffers<D>,
}

impl<D: RtxDevice> Scene<D> {
    pub fn new<S: ScratchAllocator<D>>(
        device: &Rc<D>,
        geometry: &TriangleGeometry,
        preference: BuildPreference,
        scratch: &mut S,
    ) -> Result<Self> {
        let geometry = GeometryBuffers::new(device, geometry)?;
        let blas = AccelerationStructure::bottom_level(device, &geometry, preference, scratch)?;

        let record = InstanceRecord::for_blas(blas.device_address());
        let instances = Buffer::new(
            device,
            std::mem::size_of::<InstanceRecord>() as u64,
            BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            Some(bytemuck::bytes_of(&record)),
        )?;
        let tlas = AccelerationStructure::top_level(device, &instances, 1, preference, scratch)?;

        Ok(Self {
            tlas,
            instances,
            blas,
            geometry,
        })
    }

    pub fn geometry(&self) -> &GeometryBuffers<D> {
        &self.geometry
    }

    pub fn blas(&self) -> &AccelerationStructure<D> {
        &self.blas
    }

    pub fn tlas(&self) -> &AccelerationStructure<D> {
        &self.tlas
    }

    pub fn instance_record(&self) -> Result<InstanceRecord> {
        self.instances.read_pod(0)
    }

    /// Writes `transform` into the transform buffer, then refits BLAS and TLAS
    /// in that order.
    pub fn update<S: ScratchAllocator<D>>(
        &mut self,
        transform: &TransformMatrix,
        scratch: &mut S,
    ) -> Result<()> {
        self.geometry.write_transform(transform)?;
        self.blas.update(scratch)?;
        self.tlas.update(scratch)
    }
}
