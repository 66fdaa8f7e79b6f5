use std::rc::Rc;

use ash::vk::{
    BufferUsageFlags, BuildAccelerationStructureFlagsKHR, BuildAccelerationStructureModeKHR,
    DeviceAddress, GeometryInstanceFlagsKHR,
};
use bytemuck::{Pod, Zeroable};
use nalgebra_glm as glm;

use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::{AccelerationStructureKind, BuildDescription, GeometryDescription, RtxDevice};
use crate::error::Result;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    x: f32,
    y: f32,
    z: f32,
}

impl Vertex {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Row-major 3x4 affine transform, the layout of `VkTransformMatrixKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TransformMatrix {
    pub matrix: [[f32; 4]; 3],
}

impl TransformMatrix {
    pub fn identity() -> Self {
        Self::from_glm(&glm::identity())
    }

    /// Drops the bottom row of `m`.
    pub fn from_glm(m: &glm::Mat4) -> Self {
        let mut matrix = [[0.0; 4]; 3];
        for (row, values) in matrix.iter_mut().enumerate() {
            for (column, value) in values.iter_mut().enumerate() {
                *value = m[(row, column)];
            }
        }
        Self { matrix }
    }

    pub fn translation_x(&self) -> f32 {
        self.matrix[0][3]
    }

    pub fn set_translation_x(&mut self, x: f32) {
        self.matrix[0][3] = x;
    }
}

impl Default for TransformMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: TransformMatrix,
    custom_index_and_mask: u32,
    sbt_offset_and_flags: u32,
    acceleration_structure_reference: u64,
}

impl InstanceRecord {
    pub fn new(
        acceleration_structure_reference: DeviceAddress,
        transform: TransformMatrix,
        custom_index: u32,
        mask: u8,
        sbt_record_offset: u32,
        flags: GeometryInstanceFlagsKHR,
    ) -> Self {
        let custom_index_and_mask = ((mask as u32) << 24) | (custom_index & 0x00ff_ffff);
        let sbt_offset_and_flags =
            ((flags.as_raw() & 0xff) << 24) | (sbt_record_offset & 0x00ff_ffff);
        Self {
            transform,
            custom_index_and_mask,
            sbt_offset_and_flags,
            acceleration_structure_reference,
        }
    }

    /// The single instance of the demo: identity transform, visible to every
    /// ray, first hit group, back faces not culled.
    pub fn for_blas(blas_address: DeviceAddress) -> Self {
        Self::new(
            blas_address,
            TransformMatrix::identity(),
            0,
            0xff,
            0,
            GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        )
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_record_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> GeometryInstanceFlagsKHR {
        GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }

    pub fn acceleration_structure_reference(&self) -> DeviceAddress {
        self.acceleration_structure_reference
    }
}

/// Host-side triangle mesh with one transform.
#[derive(Clone, Debug)]
pub struct TriangleGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub transform: TransformMatrix,
}

impl TriangleGeometry {
    /// One triangle spanning the view, untransformed.
    pub fn demo() -> Self {
        Self {
            vertices: vec![
                Vertex::new(1.0, 1.0, 0.0),
                Vertex::new(-1.0, 1.0, 0.0),
                Vertex::new(0.0, -1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
            transform: TransformMatrix::identity(),
        }
    }

    pub fn primitive_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Device copies of a `TriangleGeometry`. The transform buffer stays host
/// visible so it can be rewritten every frame.
pub struct GeometryBuffers<D: RtxDevice> {
    vertices: Buffer<D>,
    indices: Buffer<D>,
    transform: Buffer<D>,
    vertex_count: u32,
    primitive_count: u32,
}

impl<D: RtxDevice> GeometryBuffers<D> {
    pub fn new(device: &Rc<D>, geometry: &TriangleGeometry) -> Result<Self> {
        let usage = BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | BufferUsageFlags::STORAGE_BUFFER;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&geometry.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&geometry.indices);
        let transform_bytes = bytemuck::bytes_of(&geometry.transform);

        let vertices = Buffer::new(
            device,
            vertex_bytes.len() as u64,
            usage,
            HOST_MEMORY,
            Some(vertex_bytes),
        )?;
        let indices = Buffer::new(
            device,
            index_bytes.len() as u64,
            usage,
            HOST_MEMORY,
            Some(index_bytes),
        )?;
        let transform = Buffer::new(
            device,
            transform_bytes.len() as u64,
            usage,
            HOST_MEMORY,
            Some(transform_bytes),
        )?;

        Ok(Self {
            vertices,
            indices,
            transform,
            vertex_count: geometry.vertices.len() as u32,
            primitive_count: geometry.primitive_count(),
        })
    }

    /// BUILD description of a BLAS over these buffers.
    pub fn description(&self, flags: BuildAccelerationStructureFlagsKHR) -> Result<BuildDescription> {
        Ok(BuildDescription {
            kind: AccelerationStructureKind::BottomLevel,
            flags,
            mode: BuildAccelerationStructureModeKHR::BUILD,
            geometry: GeometryDescription::Triangles {
                vertex_data: self.vertices.device_address()?,
                vertex_stride: std::mem::size_of::<Vertex>() as u64,
                max_vertex: self.vertex_count.saturating_sub(1),
                index_data: self.indices.device_address()?,
                transform_data: self.transform.device_address()?,
            },
            primitive_count: self.primitive_count,
        })
    }

    pub fn write_transform(&self, transform: &TransformMatrix) -> Result<()> {
        self.transform.write_pod(0, transform)
    }

    pub fn read_transform(&self) -> Result<TransformMatrix> {
        self.transform.read_pod(0)
    }

    pub fn transform_buffer(&self) -> &Buffer<D> {
        &self.transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;

    #[test]
    fn instance_record_matches_vulkan_layout() {
        assert_eq!(std::mem::size_of::<TransformMatrix>(), 48);
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        assert_eq!(
            std::mem::size_of::<InstanceRecord>(),
            std::mem::size_of::<ash::vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn instance_record_packs_mask_and_flags() {
        let record = InstanceRecord::for_blas(0xdead_0000);

        assert_eq!(record.mask(), 0xff);
        assert_eq!(record.custom_index(), 0);
        assert_eq!(record.sbt_record_offset(), 0);
        assert_eq!(
            record.flags(),
            GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(record.acceleration_structure_reference(), 0xdead_0000);
        assert_eq!(record.transform, TransformMatrix::identity());
    }

    #[test]
    fn identity_transform_is_row_major() {
        let identity = TransformMatrix::identity();
        assert_eq!(
            identity.matrix,
            [[1., 0., 0., 0.], [0., 1., 0., 0.], [0., 0., 1., 0.]]
        );

        let translated = TransformMatrix::from_glm(&glm::translation(&glm::vec3(0.5, 2.0, 3.0)));
        assert_eq!(translated.translation_x(), 0.5);
        assert_eq!(translated.matrix[1][3], 2.0);
        assert_eq!(translated.matrix[2][3], 3.0);
    }

    #[test]
    fn blas_description_references_uploaded_buffers() {
        let device = Rc::new(SimulatedDevice::new());
        let buffers = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();

        let description = buffers
            .description(BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .unwrap();

        assert_eq!(description.primitive_count, 1);
        match description.geometry {
            GeometryDescription::Triangles {
                vertex_stride,
                max_vertex,
                transform_data,
                ..
            } => {
                assert_eq!(vertex_stride, 12);
                assert_eq!(max_vertex, 2);
                assert_eq!(
                    transform_data,
                    buffers.transform_buffer().device_address().unwrap()
                );
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn transform_round_trips_through_host_memory() {
        let device = Rc::new(SimulatedDevice::new());
        let buffers = GeometryBuffers::new(&device, &TriangleGeometry::demo()).unwrap();

        let mut transform = TransformMatrix::identity();
        transform.set_translation_x(0.25);
        buffers.write_transform(&transform).unwrap();

        assert_eq!(buffers.read_transform().unwrap(), transform);
    }
}
