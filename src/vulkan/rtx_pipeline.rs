use std::path::Path;
use std::rc::Rc;

use ash::vk::{
    self, DescriptorPool, DescriptorPoolCreateInfo, DescriptorPoolSize, DescriptorSet,
    DescriptorSetAllocateInfo, DescriptorSetLayout, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, DescriptorType, Pipeline, PipelineLayout, PipelineLayoutCreateInfo,
    PipelineShaderStageCreateInfo, RayTracingPipelineCreateInfoKHR,
    RayTracingShaderGroupCreateInfoKHR, RayTracingShaderGroupTypeKHR, ShaderStageFlags,
    WriteDescriptorSet, WriteDescriptorSetAccelerationStructureKHR,
};
use vk_utils::device_context::DeviceContext;
use vk_utils::shader_library::ShaderLibrary;

use super::RtxExtensions;
use crate::device::PipelineBinding;
use crate::error::{DeviceCall, Error, Result};

/// Shader stages in pipeline order. Group `i` of the binding table uses stage `i`.
const STAGES: [(&str, &str, ShaderStageFlags); 3] = [
    ("ray_gen", "ray_gen.rgen.spv", ShaderStageFlags::RAYGEN_KHR),
    ("ray_miss", "ray_miss.rmiss.spv", ShaderStageFlags::MISS_KHR),
    ("closest_hit", "closest_hit.rchit.spv", ShaderStageFlags::CLOSEST_HIT_KHR),
];

/// Raygen, miss and closest-hit pipeline with one descriptor set:
/// binding 0 is the TLAS, binding 1 the storage image.
pub struct RtxPipeline {
    device: Rc<DeviceContext>,
    descriptor_set_layout: DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_set: DescriptorSet,
    pipeline_layout: PipelineLayout,
    pipeline: Pipeline,
}

impl RtxPipeline {
    pub fn new(device: Rc<DeviceContext>, rtx: &RtxExtensions, shader_dir: &Path) -> Result<Self> {
        let mut shaders = ShaderLibrary::new(device.handle());
        for (name, file, stage) in STAGES {
            shaders.add_file(stage, name, "main", &shader_dir.join(file))?;
        }

        // Handles are filled in as they are created so Drop cleans up a partial pipeline.
        let mut rtx_pipeline = Self {
            device,
            descriptor_set_layout: DescriptorSetLayout::null(),
            descriptor_pool: DescriptorPool::null(),
            descriptor_set: DescriptorSet::null(),
            pipeline_layout: PipelineLayout::null(),
            pipeline: Pipeline::null(),
        };
        let handle = rtx_pipeline.device.handle().clone();

        let bindings = [
            DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(ShaderStageFlags::RAYGEN_KHR)
                .build(),
            DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(ShaderStageFlags::RAYGEN_KHR)
                .build(),
        ];
        let layout_info = DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        rtx_pipeline.descriptor_set_layout = unsafe {
            handle.create_descriptor_set_layout(&layout_info, None)
        }
        .call("vkCreateDescriptorSetLayout")?;

        let pool_sizes = [
            DescriptorPoolSize {
                ty: DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            DescriptorPoolSize {
                ty: DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
            },
        ];
        let pool_info = DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        rtx_pipeline.descriptor_pool = unsafe { handle.create_descriptor_pool(&pool_info, None) }
            .call("vkCreateDescriptorPool")?;

        let set_layouts = [rtx_pipeline.descriptor_set_layout];
        let allocate_info = DescriptorSetAllocateInfo::builder()
            .descriptor_pool(rtx_pipeline.descriptor_pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { handle.allocate_descriptor_sets(&allocate_info) }
            .call("vkAllocateDescriptorSets")?;
        rtx_pipeline.descriptor_set = sets[0];

        let pipeline_layout_info = PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        rtx_pipeline.pipeline_layout = unsafe {
            handle.create_pipeline_layout(&pipeline_layout_info, None)
        }
        .call("vkCreatePipelineLayout")?;

        let mut stages = Vec::with_capacity(STAGES.len());
        for (name, _, _) in STAGES {
            let entry = shaders
                .get(name)
                .ok_or_else(|| Error::MissingCapability(format!("shader {} not loaded", name)))?;
            stages.push(
                PipelineShaderStageCreateInfo::builder()
                    .stage(entry.stage())
                    .module(entry.module())
                    .name(entry.entry_point())
                    .build(),
            );
        }

        let groups = [
            RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
            RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
            RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        ];

        let pipeline_info = RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(rtx_pipeline.pipeline_layout)
            .build();
        let pipelines = unsafe {
            rtx.pipeline_ext().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .call("vkCreateRayTracingPipelinesKHR")?;
        rtx_pipeline.pipeline = pipelines[0];

        tracing::debug!(groups = groups.len(), "ray tracing pipeline created");
        Ok(rtx_pipeline)
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn binding(&self) -> PipelineBinding {
        PipelineBinding {
            pipeline: self.pipeline,
            layout: self.pipeline_layout,
            descriptor_set: self.descriptor_set,
        }
    }

    /// Points the descriptor set at `tlas` and the storage image `view`.
    pub fn write_descriptors(&self, tlas: vk::AccelerationStructureKHR, view: vk::ImageView) {
        let structures = [tlas];
        let mut acceleration_structure_info =
            WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&structures);
        let mut acceleration_structure_write = WriteDescriptorSet::builder()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .descriptor_type(DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut acceleration_structure_info)
            .build();
        acceleration_structure_write.descriptor_count = 1;

        let image_info = [vk::DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL)
            .build()];
        let image_write = WriteDescriptorSet::builder()
            .dst_set(self.descriptor_set)
            .dst_binding(1)
            .descriptor_type(DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info)
            .build();

        unsafe {
            self.device
                .handle()
                .update_descriptor_sets(&[acceleration_structure_write, image_write], &[]);
        }
    }
}

impl Drop for RtxPipeline {
    fn drop(&mut self) {
        let device = self.device.handle();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}
