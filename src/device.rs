//! The device calls the acceleration-structure, binding-table and frame code
//! is written against. `vulkan::VulkanDevice` talks to a real GPU,
//! `sim::SimulatedDevice` (feature `sim`) keeps everything in host memory.

use ash::vk;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

impl AccelerationStructureKind {
    pub fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// Geometry referenced by a build, as device addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryDescription {
    /// `R32G32B32_SFLOAT` vertices, `UINT32` indices and one 3x4 transform.
    Triangles {
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        index_data: vk::DeviceAddress,
        transform_data: vk::DeviceAddress,
    },
    /// Tightly packed `VkAccelerationStructureInstanceKHR` records.
    Instances { data: vk::DeviceAddress },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildDescription {
    pub kind: AccelerationStructureKind,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub geometry: GeometryDescription,
    pub primitive_count: u32,
}

impl BuildDescription {
    pub fn with_mode(mut self, mode: vk::BuildAccelerationStructureModeKHR) -> Self {
        self.mode = mode;
        self
    }

    pub fn allows_update(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }
}

/// One recorded build or update. `src` is null for a BUILD and equal to `dst`
/// for an in-place UPDATE.
#[derive(Clone, Copy, Debug)]
pub struct BuildCommand {
    pub description: BuildDescription,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch: vk::DeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderGroupProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineBinding {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TraceRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Device-local image the ray generation shader writes into.
#[derive(Clone, Copy, Debug)]
pub struct StorageImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Commands recorded into a single submission.
pub trait CommandRecorder {
    fn build_acceleration_structure(&mut self, command: &BuildCommand);
    fn bind_ray_tracing(&mut self, binding: &PipelineBinding);
    fn trace_rays(&mut self, regions: &TraceRegions, extent: vk::Extent2D);
    fn image_barrier(&mut self, transition: &ImageTransition);
    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D);
    fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer, extent: vk::Extent2D);
}

pub trait RtxDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn shader_group_properties(&self) -> ShaderGroupProperties;
    /// `minAccelerationStructureScratchOffsetAlignment`.
    fn scratch_alignment(&self) -> vk::DeviceSize;

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags)
        -> Result<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()>;
    /// Maps, copies `data` to `offset`, flushes when asked, unmaps.
    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
        flush: bool,
    ) -> Result<()>;
    /// Maps, invalidates when asked, copies out of `offset`, unmaps.
    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &mut [u8],
        invalidate: bool,
    ) -> Result<()>;
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn free_memory(&self, memory: vk::DeviceMemory);

    fn acceleration_structure_build_sizes(
        &self,
        description: &BuildDescription,
    ) -> Result<vk::AccelerationStructureBuildSizesInfoKHR>;
    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;
    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;
    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR);

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>>;

    fn create_storage_image(&self, extent: vk::Extent2D, format: vk::Format)
        -> Result<StorageImage>;
    fn destroy_storage_image(&self, image: &StorageImage);

    /// Records with `record`, submits and blocks on a fence until done.
    fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder);

    /// Blocks until the last `submit_frame` has completed.
    fn wait_for_frame(&self) -> Result<()>;

    /// Submits a frame under the in-flight fence without waiting for it.
    fn submit_frame<F>(
        &self,
        wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal: Option<vk::Semaphore>,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder);
}
