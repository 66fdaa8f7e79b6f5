//! `RtxDevice` on top of `ash`.

mod present;
mod rtx_extensions;
mod rtx_pipeline;

pub use present::SwapchainTarget;
pub use rtx_extensions::RtxExtensions;
pub use rtx_pipeline::RtxPipeline;

use std::ffi::CStr;
use std::rc::Rc;

use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Swapchain};
use ash::vk::{
    self, AccelerationStructureBuildGeometryInfoKHR, AccelerationStructureBuildRangeInfoKHR,
    AccelerationStructureBuildTypeKHR, AccelerationStructureCreateInfoKHR,
    AccelerationStructureDeviceAddressInfoKHR, AccelerationStructureGeometryDataKHR,
    AccelerationStructureGeometryInstancesDataKHR, AccelerationStructureGeometryKHR,
    AccelerationStructureGeometryTrianglesDataKHR, BufferCreateInfo, BufferDeviceAddressInfo,
    BufferImageCopy, DeviceOrHostAddressConstKHR, DeviceOrHostAddressKHR, Extent3D, GeometryFlagsKHR,
    GeometryTypeKHR, ImageAspectFlags, ImageCopy, ImageLayout, ImageMemoryBarrier,
    ImageSubresourceLayers, ImageSubresourceRange, ImageUsageFlags, IndexType, MappedMemoryRange,
    MemoryAllocateFlags, MemoryAllocateFlagsInfo, MemoryAllocateInfo, MemoryMapFlags,
    MemoryPropertyFlags, PipelineBindPoint, QueueFlags, SharingMode,
};
use vk_utils::device_context::DeviceContext;
use vk_utils::gpu::Gpu;
use vk_utils::image_resource::Image2DResource;
use vk_utils::queue::CommandQueue;
use vk_utils::surface::Surface;
use vk_utils::vk_instance::Vulkan;

use crate::device::{
    AccelerationStructureKind, BuildCommand, BuildDescription, CommandRecorder, GeometryDescription,
    ImageTransition, PipelineBinding, RtxDevice, ShaderGroupProperties, StorageImage, TraceRegions,
};
use crate::error::{DeviceCall, Error, Result};

/// Device extensions the ray tracer needs, plus the swapchain when presenting.
pub fn ray_tracing_extensions(present: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
        vk::KhrSpirv14Fn::name(),
        vk::KhrShaderFloatControlsFn::name(),
    ];
    if present {
        extensions.push(Swapchain::name());
    }
    extensions
}

/// First GPU with a graphics queue (presenting to `surface`, if given), every
/// extension in `extensions` and the ray-tracing features. Discrete GPUs win.
pub fn pick_gpu(vulkan: &Vulkan, surface: Option<&Surface>, extensions: &[&'static CStr]) -> Result<Gpu> {
    let candidates = vulkan.hardware_devices_with_queue_support(QueueFlags::GRAPHICS, surface)?;
    if candidates.is_empty() {
        return Err(Error::MissingCapability("no GPU with a graphics queue".into()));
    }

    let mut suitable = Vec::new();
    for gpu in candidates {
        let missing = gpu.missing_extensions(vulkan.vk_instance(), extensions)?;
        if !missing.is_empty() {
            tracing::info!(gpu = %gpu.name(), ?missing, "skipping GPU without required extensions");
            continue;
        }
        if !gpu.supports_ray_tracing(vulkan.vk_instance()) {
            tracing::info!(gpu = %gpu.name(), "skipping GPU without ray tracing features");
            continue;
        }
        suitable.push(gpu);
    }

    suitable.sort_by_key(|gpu| !gpu.is_discrete());
    let gpu = suitable.into_iter().next().ok_or_else(|| {
        Error::MissingCapability("no GPU supports ray tracing pipelines".into())
    })?;
    tracing::info!(gpu = %gpu.name(), "selected GPU");
    Ok(gpu)
}

/// Picks a GPU and opens a `VulkanDevice` on it. Presenting to `surface` adds
/// the swapchain extension.
pub fn open_device(vulkan: &Rc<Vulkan>, surface: Option<&Surface>) -> Result<Rc<VulkanDevice>> {
    let extensions = ray_tracing_extensions(surface.is_some());
    let gpu = pick_gpu(vulkan, surface, &extensions)?;
    let context = Rc::new(DeviceContext::new(vulkan.clone(), gpu, &extensions)?);
    Ok(Rc::new(VulkanDevice::new(context)?))
}

fn geometry(description: &BuildDescription) -> AccelerationStructureGeometryKHR {
    match description.geometry {
        GeometryDescription::Triangles {
            vertex_data,
            vertex_stride,
            max_vertex,
            index_data,
            transform_data,
        } => {
            let triangles = AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(DeviceOrHostAddressConstKHR {
                    device_address: vertex_data,
                })
                .vertex_stride(vertex_stride)
                .max_vertex(max_vertex)
                .index_type(IndexType::UINT32)
                .index_data(DeviceOrHostAddressConstKHR {
                    device_address: index_data,
                })
                .transform_data(DeviceOrHostAddressConstKHR {
                    device_address: transform_data,
                })
                .build();
            AccelerationStructureGeometryKHR::builder()
                .geometry_type(GeometryTypeKHR::TRIANGLES)
                .geometry(AccelerationStructureGeometryDataKHR { triangles })
                .flags(GeometryFlagsKHR::OPAQUE)
                .build()
        }
        GeometryDescription::Instances { data } => {
            let instances = AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(DeviceOrHostAddressConstKHR {
                    device_address: data,
                })
                .build();
            AccelerationStructureGeometryKHR::builder()
                .geometry_type(GeometryTypeKHR::INSTANCES)
                .geometry(AccelerationStructureGeometryDataKHR { instances })
                .flags(GeometryFlagsKHR::OPAQUE)
                .build()
        }
    }
}

const COLOR_LAYERS: ImageSubresourceLayers = ImageSubresourceLayers {
    aspect_mask: ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Records into a command buffer of the device's queue.
struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    rtx: &'a RtxExtensions,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRecorder for VulkanRecorder<'a> {
    fn build_acceleration_structure(&mut self, command: &BuildCommand) {
        let description = &command.description;
        let geometries = [geometry(description)];
        let build_info = AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(description.kind.vk_type())
            .flags(description.flags)
            .mode(description.mode)
            .geometries(&geometries)
            .src_acceleration_structure(command.src)
            .dst_acceleration_structure(command.dst)
            .scratch_data(DeviceOrHostAddressKHR {
                device_address: command.scratch,
            })
            .build();
        let ranges = [AccelerationStructureBuildRangeInfoKHR {
            primitive_count: description.primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        }];

        unsafe {
            self.rtx
                .acceleration_structure_ext()
                .cmd_build_acceleration_structures(self.command_buffer, &[build_info], &[&ranges]);
        }
    }

    fn bind_ray_tracing(&mut self, binding: &PipelineBinding) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                PipelineBindPoint::RAY_TRACING_KHR,
                binding.pipeline,
            );
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                PipelineBindPoint::RAY_TRACING_KHR,
                binding.layout,
                0,
                &[binding.descriptor_set],
                &[],
            );
        }
    }

    fn trace_rays(&mut self, regions: &TraceRegions, extent: vk::Extent2D) {
        unsafe {
            self.rtx.pipeline_ext().cmd_trace_rays(
                self.command_buffer,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            );
        }
    }

    fn image_barrier(&mut self, transition: &ImageTransition) {
        let barrier = ImageMemoryBarrier::builder()
            .image(transition.image)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(ImageSubresourceRange {
                aspect_mask: ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let region = ImageCopy {
            src_subresource: COLOR_LAYERS,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYERS,
            dst_offset: vk::Offset3D::default(),
            extent: Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                self.command_buffer,
                src,
                ImageLayout::GENERAL,
                dst,
                ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer, extent: vk::Extent2D) {
        let region = BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: COLOR_LAYERS,
            image_offset: vk::Offset3D::default(),
            image_extent: Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer,
                src,
                ImageLayout::GENERAL,
                dst,
                &[region],
            );
        }
    }
}

pub struct VulkanDevice {
    queue: CommandQueue,
    rtx: RtxExtensions,
    context: Rc<DeviceContext>,
}

impl VulkanDevice {
    pub fn new(context: Rc<DeviceContext>) -> Result<Self> {
        let rtx = RtxExtensions::new(&context);
        let queue = CommandQueue::new(context.clone())?;
        Ok(Self {
            queue,
            rtx,
            context,
        })
    }

    pub fn context(&self) -> &Rc<DeviceContext> {
        &self.context
    }

    pub fn rtx(&self) -> &RtxExtensions {
        &self.rtx
    }

    fn handle(&self) -> &ash::Device {
        self.context.handle()
    }

    fn recorder(&self, command_buffer: vk::CommandBuffer) -> VulkanRecorder<'_> {
        VulkanRecorder {
            device: self.handle(),
            rtx: &self.rtx,
            command_buffer,
        }
    }
}

impl RtxDevice for VulkanDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        *self.context.gpu().memory_properties()
    }

    fn shader_group_properties(&self) -> ShaderGroupProperties {
        let properties = self.context.gpu().ray_tracing_properties();
        ShaderGroupProperties {
            handle_size: properties.shader_group_handle_size,
            handle_alignment: properties.shader_group_handle_alignment,
        }
    }

    fn scratch_alignment(&self) -> vk::DeviceSize {
        self.context
            .gpu()
            .acceleration_structure_properties()
            .min_acceleration_structure_scratch_offset_alignment as vk::DeviceSize
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer_info = BufferCreateInfo::builder()
            .size(size)
            .sharing_mode(SharingMode::EXCLUSIVE)
            .usage(usage);
        unsafe { self.handle().create_buffer(&buffer_info, None) }.call("vkCreateBuffer")
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.handle().get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory> {
        let mut flags = MemoryAllocateFlagsInfo::builder().flags(MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocation_info = MemoryAllocateInfo::builder()
            .memory_type_index(memory_type_index)
            .allocation_size(size);
        if device_address {
            allocation_info = allocation_info.push_next(&mut flags);
        }
        unsafe { self.handle().allocate_memory(&allocation_info, None) }.call("vkAllocateMemory")
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        unsafe { self.handle().bind_buffer_memory(buffer, memory, 0) }.call("vkBindBufferMemory")
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
        flush: bool,
    ) -> Result<()> {
        let device = self.handle();
        unsafe {
            let ptr = device
                .map_memory(memory, 0, vk::WHOLE_SIZE, MemoryMapFlags::empty())
                .call("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (ptr as *mut u8).add(offset as usize),
                data.len(),
            );
            let flushed = if flush {
                let range = MappedMemoryRange::builder()
                    .memory(memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                device
                    .flush_mapped_memory_ranges(&[range])
                    .call("vkFlushMappedMemoryRanges")
            } else {
                Ok(())
            };
            device.unmap_memory(memory);
            flushed
        }
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &mut [u8],
        invalidate: bool,
    ) -> Result<()> {
        let device = self.handle();
        unsafe {
            let ptr = device
                .map_memory(memory, 0, vk::WHOLE_SIZE, MemoryMapFlags::empty())
                .call("vkMapMemory")?;
            if invalidate {
                let range = MappedMemoryRange::builder()
                    .memory(memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                if let Err(error) = device
                    .invalidate_mapped_memory_ranges(&[range])
                    .call("vkInvalidateMappedMemoryRanges")
                {
                    device.unmap_memory(memory);
                    return Err(error);
                }
            }
            std::ptr::copy_nonoverlapping(
                (ptr as *const u8).add(offset as usize),
                data.as_mut_ptr(),
                data.len(),
            );
            device.unmap_memory(memory);
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let address_info = BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.handle().get_buffer_device_address(&address_info) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.handle().destroy_buffer(buffer, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.handle().free_memory(memory, None) }
    }

    fn acceleration_structure_build_sizes(
        &self,
        description: &BuildDescription,
    ) -> Result<vk::AccelerationStructureBuildSizesInfoKHR> {
        let geometries = [geometry(description)];
        let build_info = AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(description.kind.vk_type())
            .flags(description.flags)
            .mode(description.mode)
            .geometries(&geometries);

        let sizes = unsafe {
            self.rtx
                .acceleration_structure_ext()
                .get_acceleration_structure_build_sizes(
                    AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[description.primitive_count],
                )
        };
        Ok(sizes)
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = AccelerationStructureCreateInfoKHR::builder()
            .ty(kind.vk_type())
            .buffer(buffer)
            .size(size);
        unsafe {
            self.rtx
                .acceleration_structure_ext()
                .create_acceleration_structure(&create_info, None)
        }
        .call("vkCreateAccelerationStructureKHR")
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let address_info = AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(acceleration_structure);
        unsafe {
            self.rtx
                .acceleration_structure_ext()
                .get_acceleration_structure_device_address(&address_info)
        }
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR) {
        unsafe {
            self.rtx
                .acceleration_structure_ext()
                .destroy_acceleration_structure(acceleration_structure, None)
        }
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>> {
        unsafe {
            self.rtx.pipeline_ext().get_ray_tracing_shader_group_handles(
                pipeline,
                first_group,
                group_count,
                data_size,
            )
        }
        .call("vkGetRayTracingShaderGroupHandlesKHR")
    }

    fn create_storage_image(&self, extent: vk::Extent2D, format: vk::Format) -> Result<StorageImage> {
        let resource = Image2DResource::new(
            self.handle(),
            self.context.gpu().memory_properties(),
            extent,
            format,
            ImageUsageFlags::STORAGE | ImageUsageFlags::TRANSFER_SRC,
            MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        Ok(StorageImage {
            image: resource.image,
            view: resource.view,
            memory: resource.memory,
            format: resource.format,
            extent: resource.extent,
        })
    }

    fn destroy_storage_image(&self, image: &StorageImage) {
        let resource = Image2DResource {
            image: image.image,
            memory: image.memory,
            view: image.view,
            format: image.format,
            extent: image.extent,
        };
        resource.destroy(self.handle());
    }

    fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder),
    {
        self.queue
            .submit_and_wait(|command_buffer| record(&mut self.recorder(command_buffer)))?;
        Ok(())
    }

    fn wait_for_frame(&self) -> Result<()> {
        self.queue.wait_for_frame()?;
        Ok(())
    }

    fn submit_frame<F>(
        &self,
        wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal: Option<vk::Semaphore>,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder),
    {
        self.queue.submit_frame(wait, signal, |command_buffer| {
            record(&mut self.recorder(command_buffer))
        })?;
        Ok(())
    }
}
