//! Host-memory stand-in for a ray-tracing capable GPU.
//!
//! Memory is plain byte vectors, device addresses are handed out from a
//! counter, and submissions execute immediately. Build and update commands are
//! checked the way the validation layers would (scratch size and alignment,
//! `ALLOW_UPDATE`, `src == dst` on UPDATE, every referenced address resolving
//! into a live buffer) and logged together with the bytes they read at
//! submission time.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use ash::vk::{
    self, BufferUsageFlags, BuildAccelerationStructureFlagsKHR, BuildAccelerationStructureModeKHR,
    DeviceAddress, Handle, ImageLayout, MemoryPropertyFlags,
};

use crate::device::{
    AccelerationStructureKind, BuildCommand, BuildDescription, CommandRecorder, GeometryDescription,
    ImageTransition, PipelineBinding, RtxDevice, ShaderGroupProperties, StorageImage, TraceRegions,
};
use crate::error::{Error, Result};
use crate::geometry::{InstanceRecord, TransformMatrix};

/// Device calls that can be told to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateBuffer,
    AllocateMemory,
    BindBufferMemory,
    BuildSizes,
    CreateAccelerationStructure,
    ShaderGroupHandles,
    CreateImage,
    Submit,
}

impl FailurePoint {
    fn call(self) -> &'static str {
        match self {
            FailurePoint::CreateBuffer => "vkCreateBuffer",
            FailurePoint::AllocateMemory => "vkAllocateMemory",
            FailurePoint::BindBufferMemory => "vkBindBufferMemory",
            FailurePoint::BuildSizes => "vkGetAccelerationStructureBuildSizesKHR",
            FailurePoint::CreateAccelerationStructure => "vkCreateAccelerationStructureKHR",
            FailurePoint::ShaderGroupHandles => "vkGetRayTracingShaderGroupHandlesKHR",
            FailurePoint::CreateImage => "vkCreateImage",
            FailurePoint::Submit => "vkQueueSubmit",
        }
    }

    fn result(self) -> vk::Result {
        match self {
            FailurePoint::AllocateMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            FailurePoint::Submit => vk::Result::ERROR_DEVICE_LOST,
            _ => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Property flags of each memory type, in index order.
    pub memory_types: Vec<MemoryPropertyFlags>,
    /// Buffers whose usage contains the flags may only use the memory types in
    /// the paired mask.
    pub usage_memory_type_bits: Vec<(BufferUsageFlags, u32)>,
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub scratch_alignment: u64,
    /// Alignment of every buffer device address.
    pub address_granularity: u64,
    /// Replaces the built-in size table for both size queries and the scratch
    /// check at execution.
    pub build_sizes: Option<fn(&BuildDescription) -> vk::AccelerationStructureBuildSizesInfoKHR>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            memory_types: vec![
                MemoryPropertyFlags::DEVICE_LOCAL,
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            ],
            usage_memory_type_bits: Vec::new(),
            handle_size: 32,
            handle_alignment: 64,
            scratch_alignment: 128,
            address_granularity: 256,
            build_sizes: None,
        }
    }
}

/// Count of objects created and not yet destroyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub memories: usize,
    pub acceleration_structures: usize,
    pub images: usize,
}

impl LiveObjects {
    pub fn is_empty(&self) -> bool {
        *self == LiveObjects::default()
    }
}

/// One executed build or update.
#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub kind: AccelerationStructureKind,
    pub mode: BuildAccelerationStructureModeKHR,
    pub flags: BuildAccelerationStructureFlagsKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    /// Scratch bytes available behind the scratch address.
    pub scratch_available: u64,
    /// Transform read from the transform buffer when the build ran.
    pub transform: Option<TransformMatrix>,
    /// BLAS address of the first instance when the build ran.
    pub instance_reference: Option<DeviceAddress>,
}

/// One executed trace dispatch.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
    /// Handle bytes found in the raygen region.
    pub raygen_handle: Vec<u8>,
}

struct SimBuffer {
    size: u64,
    usage: BufferUsageFlags,
    memory: Option<u64>,
    address: Option<DeviceAddress>,
}

struct SimMemory {
    bytes: Vec<u8>,
    type_index: u32,
    device_address: bool,
}

struct SimStructure {
    kind: AccelerationStructureKind,
    address: DeviceAddress,
    built_flags: Option<BuildAccelerationStructureFlagsKHR>,
}

struct SimImage {
    extent: vk::Extent2D,
    layout: ImageLayout,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<u64, SimBuffer>,
    memories: HashMap<u64, SimMemory>,
    structures: HashMap<u64, SimStructure>,
    images: HashMap<u64, SimImage>,
    pipelines: HashSet<u64>,
    failures: HashMap<FailurePoint, usize>,
    builds: Vec<BuildRecord>,
    traces: Vec<TraceRecord>,
    flushes: u64,
    frame_in_flight: bool,
    frames_submitted: u64,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Fails the call when an injected failure has counted down to it.
    fn check(&mut self, point: FailurePoint) -> Result<()> {
        let skip = match self.failures.get_mut(&point) {
            Some(skip) => skip,
            None => return Ok(()),
        };
        if *skip > 0 {
            *skip -= 1;
            return Ok(());
        }
        self.failures.remove(&point);
        Err(Error::DeviceCallFailure {
            call: point.call(),
            result: point.result(),
        })
    }

    /// Buffer whose address range contains `address..address + len`.
    fn resolve(&self, address: DeviceAddress, len: u64) -> Option<(&SimBuffer, u64)> {
        self.buffers.values().find_map(|buffer| {
            let base = buffer.address?;
            if address >= base && address + len <= base + buffer.size {
                Some((buffer, address - base))
            } else {
                None
            }
        })
    }

    fn read_address(&self, address: DeviceAddress, len: u64) -> std::result::Result<Vec<u8>, String> {
        let (buffer, offset) = self
            .resolve(address, len)
            .ok_or_else(|| format!("address {:#x}+{} does not resolve to a buffer", address, len))?;
        let memory = buffer
            .memory
            .and_then(|memory| self.memories.get(&memory))
            .ok_or_else(|| format!("buffer at {:#x} has no memory", address))?;
        let start = offset as usize;
        Ok(memory.bytes[start..start + len as usize].to_vec())
    }

    fn write_buffer(&mut self, buffer: u64, data: &[u8]) -> std::result::Result<(), String> {
        let memory = self
            .buffers
            .get(&buffer)
            .and_then(|buffer| buffer.memory)
            .ok_or_else(|| "copy into unbound buffer".to_string())?;
        let memory = self
            .memories
            .get_mut(&memory)
            .ok_or_else(|| "copy into freed memory".to_string())?;
        if data.len() > memory.bytes.len() {
            return Err("copy overruns buffer memory".into());
        }
        memory.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn build_sizes(description: &BuildDescription) -> vk::AccelerationStructureBuildSizesInfoKHR {
    let count = description.primitive_count.max(1) as u64;
    let (structure, build, update) = match description.geometry {
        GeometryDescription::Triangles { .. } => (1024 * count, 512 * count, 256 * count),
        GeometryDescription::Instances { .. } => (512 + 64 * count, 256 + 64 * count, 128 + 32 * count),
    };
    vk::AccelerationStructureBuildSizesInfoKHR {
        acceleration_structure_size: structure,
        build_scratch_size: build,
        update_scratch_size: update,
        ..Default::default()
    }
}

enum Command {
    Build(BuildCommand),
    Bind(PipelineBinding),
    Trace(TraceRegions, vk::Extent2D),
    Barrier(ImageTransition),
    CopyImage(vk::Image, vk::Image),
    CopyImageToBuffer(vk::Image, vk::Buffer, vk::Extent2D),
}

#[derive(Default)]
struct SimRecorder {
    commands: Vec<Command>,
}

impl CommandRecorder for SimRecorder {
    fn build_acceleration_structure(&mut self, command: &BuildCommand) {
        self.commands.push(Command::Build(*command));
    }

    fn bind_ray_tracing(&mut self, binding: &PipelineBinding) {
        self.commands.push(Command::Bind(*binding));
    }

    fn trace_rays(&mut self, regions: &TraceRegions, extent: vk::Extent2D) {
        self.commands.push(Command::Trace(*regions, extent));
    }

    fn image_barrier(&mut self, transition: &ImageTransition) {
        self.commands.push(Command::Barrier(*transition));
    }

    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, _extent: vk::Extent2D) {
        self.commands.push(Command::CopyImage(src, dst));
    }

    fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer, extent: vk::Extent2D) {
        self.commands.push(Command::CopyImageToBuffer(src, dst, extent));
    }
}

pub struct SimulatedDevice {
    config: SimConfig,
    state: RefCell<State>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let state = State {
            next_address: 0x1_0000,
            ..State::default()
        };
        Self {
            config,
            state: RefCell::new(state),
        }
    }

    /// Makes the call at `point` fail after `skip` successful calls.
    pub fn inject_failure(&self, point: FailurePoint, skip: usize) {
        self.state.borrow_mut().failures.insert(point, skip);
    }

    /// A pipeline with raygen, miss and hit groups.
    pub fn create_pipeline(&self) -> vk::Pipeline {
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.pipelines.insert(handle);
        vk::Pipeline::from_raw(handle)
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.borrow();
        LiveObjects {
            buffers: state.buffers.len(),
            memories: state.memories.len(),
            acceleration_structures: state.structures.len(),
            images: state.images.len(),
        }
    }

    pub fn build_log(&self) -> Vec<BuildRecord> {
        self.state.borrow().builds.clone()
    }

    pub fn trace_log(&self) -> Vec<TraceRecord> {
        self.state.borrow().traces.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.state.borrow().flushes
    }

    pub fn frames_submitted(&self) -> u64 {
        self.state.borrow().frames_submitted
    }

    pub fn frame_in_flight(&self) -> bool {
        self.state.borrow().frame_in_flight
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<ImageLayout> {
        self.state
            .borrow()
            .images
            .get(&image.as_raw())
            .map(|image| image.layout)
    }

    pub fn allocated_with_device_address(&self, memory: vk::DeviceMemory) -> bool {
        self.state
            .borrow()
            .memories
            .get(&memory.as_raw())
            .map_or(false, |memory| memory.device_address)
    }

    fn submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder),
    {
        let mut recorder = SimRecorder::default();
        record(&mut recorder);

        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::Submit)?;
        let mut bound = None;
        for command in &recorder.commands {
            let outcome = match command {
                Command::Build(build) => self.execute_build(&mut state, build),
                Command::Bind(binding) => {
                    if state.pipelines.contains(&binding.pipeline.as_raw()) {
                        bound = Some(binding.pipeline);
                        Ok(())
                    } else {
                        Err("bind of an unknown pipeline".to_string())
                    }
                }
                Command::Trace(regions, extent) => self.execute_trace(&mut state, bound, regions, *extent),
                Command::Barrier(transition) => Self::execute_barrier(&mut state, transition),
                Command::CopyImage(src, dst) => {
                    if *dst == vk::Image::null() {
                        Err("copy into a null image".to_string())
                    } else {
                        Self::check_copy_source(&state, *src)
                    }
                }
                Command::CopyImageToBuffer(src, dst, extent) => {
                    Self::execute_readback(&mut state, *src, *dst, *extent)
                }
            };
            if let Err(reason) = outcome {
                tracing::warn!(%reason, "simulated submission rejected");
                return Err(Error::DeviceCallFailure {
                    call: "vkQueueSubmit",
                    result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
                });
            }
        }
        Ok(())
    }

    fn build_sizes(&self, description: &BuildDescription) -> vk::AccelerationStructureBuildSizesInfoKHR {
        match self.config.build_sizes {
            Some(sizes) => sizes(description),
            None => build_sizes(description),
        }
    }

    fn execute_build(&self, state: &mut State, command: &BuildCommand) -> std::result::Result<(), String> {
        let description = &command.description;
        let dst = state
            .structures
            .get(&command.dst.as_raw())
            .ok_or("build into an unknown acceleration structure")?;
        if dst.kind != description.kind {
            return Err(format!("{:?} build into a {:?} structure", description.kind, dst.kind));
        }

        let sizes = self.build_sizes(description);
        let required = if description.mode == BuildAccelerationStructureModeKHR::UPDATE {
            if command.src != command.dst {
                return Err("UPDATE with src != dst".into());
            }
            let built_flags = dst.built_flags.ok_or("UPDATE of a structure never built")?;
            if !built_flags.contains(BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
                || !description.allows_update()
            {
                return Err("UPDATE without ALLOW_UPDATE".into());
            }
            sizes.update_scratch_size
        } else {
            if command.src != vk::AccelerationStructureKHR::null() {
                return Err("BUILD with a source structure".into());
            }
            sizes.build_scratch_size
        };

        if command.scratch % self.config.scratch_alignment != 0 {
            return Err(format!("scratch address {:#x} is misaligned", command.scratch));
        }
        let (scratch_buffer, offset) = state
            .resolve(command.scratch, 1)
            .ok_or("scratch address does not resolve to a buffer")?;
        if !scratch_buffer.usage.contains(BufferUsageFlags::STORAGE_BUFFER) {
            return Err("scratch buffer lacks STORAGE_BUFFER usage".into());
        }
        let scratch_available = scratch_buffer.size - offset;
        if scratch_available < required {
            return Err(format!("scratch of {} bytes, {} required", scratch_available, required));
        }

        let mut transform = None;
        let mut instance_reference = None;
        match description.geometry {
            GeometryDescription::Triangles {
                vertex_data,
                vertex_stride,
                max_vertex,
                index_data,
                transform_data,
            } => {
                state.read_address(vertex_data, (max_vertex as u64 + 1) * vertex_stride)?;
                state.read_address(index_data, description.primitive_count as u64 * 12)?;
                let bytes =
                    state.read_address(transform_data, std::mem::size_of::<TransformMatrix>() as u64)?;
                transform = Some(bytemuck::pod_read_unaligned::<TransformMatrix>(&bytes));
            }
            GeometryDescription::Instances { data } => {
                let record_size = std::mem::size_of::<InstanceRecord>() as u64;
                let bytes = state.read_address(data, record_size * description.primitive_count as u64)?;
                let first = bytemuck::pod_read_unaligned::<InstanceRecord>(&bytes[..record_size as usize]);
                let reference = first.acceleration_structure_reference();
                let referenced_blas = state.structures.values().any(|structure| {
                    structure.kind == AccelerationStructureKind::BottomLevel
                        && structure.address == reference
                        && structure.built_flags.is_some()
                });
                if !referenced_blas {
                    return Err(format!("instance references {:#x}, not a built BLAS", reference));
                }
                instance_reference = Some(reference);
            }
        }

        if let Some(dst) = state.structures.get_mut(&command.dst.as_raw()) {
            dst.built_flags = Some(description.flags);
        }
        state.builds.push(BuildRecord {
            kind: description.kind,
            mode: description.mode,
            flags: description.flags,
            src: command.src,
            dst: command.dst,
            scratch_available,
            transform,
            instance_reference,
        });
        Ok(())
    }

    fn execute_trace(
        &self,
        state: &mut State,
        bound: Option<vk::Pipeline>,
        regions: &TraceRegions,
        extent: vk::Extent2D,
    ) -> std::result::Result<(), String> {
        let pipeline = bound.ok_or("trace without a bound pipeline")?;
        if regions.raygen.size != regions.raygen.stride {
            return Err("raygen region size must equal its stride".into());
        }
        for region in [&regions.raygen, &regions.miss, &regions.hit] {
            let (buffer, _) = state
                .resolve(region.device_address, 1)
                .ok_or("binding table region does not resolve to a buffer")?;
            if !buffer.usage.contains(BufferUsageFlags::SHADER_BINDING_TABLE_KHR) {
                return Err("binding table buffer lacks SHADER_BINDING_TABLE usage".into());
            }
        }
        let raygen_handle =
            state.read_address(regions.raygen.device_address, self.config.handle_size as u64)?;
        state.traces.push(TraceRecord {
            pipeline,
            extent,
            raygen_handle,
        });
        Ok(())
    }

    fn execute_barrier(state: &mut State, transition: &ImageTransition) -> std::result::Result<(), String> {
        // Images the device did not create (swapchain images) are not tracked.
        if let Some(image) = state.images.get_mut(&transition.image.as_raw()) {
            if transition.old_layout != ImageLayout::UNDEFINED && transition.old_layout != image.layout {
                return Err(format!(
                    "barrier from {:?} but image is in {:?}",
                    transition.old_layout, image.layout
                ));
            }
            image.layout = transition.new_layout;
        }
        Ok(())
    }

    fn check_copy_source(state: &State, src: vk::Image) -> std::result::Result<(), String> {
        let image = state
            .images
            .get(&src.as_raw())
            .ok_or("copy from an unknown image")?;
        match image.layout {
            ImageLayout::GENERAL | ImageLayout::TRANSFER_SRC_OPTIMAL => Ok(()),
            layout => Err(format!("copy from an image in {:?}", layout)),
        }
    }

    /// Fills the destination with a gradient: R = x, G = y, B = trace count.
    fn execute_readback(
        state: &mut State,
        src: vk::Image,
        dst: vk::Buffer,
        extent: vk::Extent2D,
    ) -> std::result::Result<(), String> {
        Self::check_copy_source(state, src)?;
        let image_extent = state.images[&src.as_raw()].extent;
        if image_extent != extent {
            return Err("copy extent differs from the image".into());
        }
        let buffer = state.buffers.get(&dst.as_raw()).ok_or("copy into an unknown buffer")?;
        if !buffer.usage.contains(BufferUsageFlags::TRANSFER_DST) {
            return Err("copy into a buffer without TRANSFER_DST usage".into());
        }

        let shade = state.traces.len() as u8;
        let mut pixels = Vec::with_capacity((extent.width * extent.height * 4) as usize);
        for y in 0..extent.height {
            for x in 0..extent.width {
                pixels.extend_from_slice(&[x as u8, y as u8, shade, 255]);
            }
        }
        state.write_buffer(dst.as_raw(), &pixels)
    }
}

impl RtxDevice for SimulatedDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: self.config.memory_types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, flags) in properties
            .memory_types
            .iter_mut()
            .zip(&self.config.memory_types)
        {
            *slot = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        properties
    }

    fn shader_group_properties(&self) -> ShaderGroupProperties {
        ShaderGroupProperties {
            handle_size: self.config.handle_size,
            handle_alignment: self.config.handle_alignment,
        }
    }

    fn scratch_alignment(&self) -> vk::DeviceSize {
        self.config.scratch_alignment
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: BufferUsageFlags) -> Result<vk::Buffer> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::CreateBuffer)?;
        let handle = state.handle();
        state.buffers.insert(
            handle,
            SimBuffer {
                size,
                usage,
                memory: None,
                address: None,
            },
        );
        Ok(vk::Buffer::from_raw(handle))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.borrow();
        let (size, usage) = state
            .buffers
            .get(&buffer.as_raw())
            .map_or((0, BufferUsageFlags::empty()), |buffer| (buffer.size, buffer.usage));

        let mut memory_type_bits = (1u32 << self.config.memory_types.len()) - 1;
        for (restricted, bits) in &self.config.usage_memory_type_bits {
            if usage.contains(*restricted) {
                memory_type_bits &= bits;
            }
        }
        vk::MemoryRequirements {
            size: (size + 15) / 16 * 16,
            alignment: self.config.address_granularity,
            memory_type_bits,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::AllocateMemory)?;
        if memory_type_index as usize >= self.config.memory_types.len() {
            return Err(Error::DeviceCallFailure {
                call: "vkAllocateMemory",
                result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
            });
        }
        let handle = state.handle();
        state.memories.insert(
            handle,
            SimMemory {
                bytes: vec![0; size as usize],
                type_index: memory_type_index,
                device_address,
            },
        );
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::BindBufferMemory)?;
        let invalid = Error::DeviceCallFailure {
            call: "vkBindBufferMemory",
            result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
        };

        let (memory_size, memory_device_address) = match state.memories.get(&memory.as_raw()) {
            Some(memory) => (memory.bytes.len() as u64, memory.device_address),
            None => return Err(invalid),
        };
        let (size, usage) = match state.buffers.get(&buffer.as_raw()) {
            Some(buffer) if buffer.memory.is_none() => (buffer.size, buffer.usage),
            _ => return Err(invalid),
        };
        if memory_size < size {
            return Err(invalid);
        }

        let address = if usage.contains(BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            if !memory_device_address {
                return Err(invalid);
            }
            let granularity = self.config.address_granularity.max(1);
            let address = (state.next_address + granularity - 1) / granularity * granularity;
            state.next_address = address + size.max(1);
            Some(address)
        } else {
            None
        };

        if let Some(buffer) = state.buffers.get_mut(&buffer.as_raw()) {
            buffer.memory = Some(memory.as_raw());
            buffer.address = address;
        }
        Ok(())
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
        flush: bool,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let map_failed = Error::DeviceCallFailure {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        };
        let memory = state.memories.get_mut(&memory.as_raw()).ok_or(map_failed)?;
        let host_visible = self.config.memory_types[memory.type_index as usize]
            .contains(MemoryPropertyFlags::HOST_VISIBLE);
        let start = offset as usize;
        let end = start + data.len();
        if !host_visible || end > memory.bytes.len() {
            return Err(Error::DeviceCallFailure {
                call: "vkMapMemory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        }
        memory.bytes[start..end].copy_from_slice(data);
        if flush {
            state.flushes += 1;
        }
        Ok(())
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &mut [u8],
        _invalidate: bool,
    ) -> Result<()> {
        let state = self.state.borrow();
        let map_failed = Error::DeviceCallFailure {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        };
        let memory = state.memories.get(&memory.as_raw()).ok_or(map_failed)?;
        let host_visible = self.config.memory_types[memory.type_index as usize]
            .contains(MemoryPropertyFlags::HOST_VISIBLE);
        let start = offset as usize;
        let end = start + data.len();
        if !host_visible || end > memory.bytes.len() {
            return Err(Error::DeviceCallFailure {
                call: "vkMapMemory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        }
        data.copy_from_slice(&memory.bytes[start..end]);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceAddress {
        self.state
            .borrow()
            .buffers
            .get(&buffer.as_raw())
            .and_then(|buffer| buffer.address)
            .unwrap_or(0)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.state.borrow_mut().buffers.remove(&buffer.as_raw()).is_none() {
            tracing::warn!(?buffer, "destroy of an unknown buffer");
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        if self.state.borrow_mut().memories.remove(&memory.as_raw()).is_none() {
            tracing::warn!(?memory, "free of unknown memory");
        }
    }

    fn acceleration_structure_build_sizes(
        &self,
        description: &BuildDescription,
    ) -> Result<vk::AccelerationStructureBuildSizesInfoKHR> {
        self.state.borrow_mut().check(FailurePoint::BuildSizes)?;
        Ok(self.build_sizes(description))
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::CreateAccelerationStructure)?;
        let address = match state.buffers.get(&buffer.as_raw()) {
            Some(backing)
                if backing
                    .usage
                    .contains(BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR)
                    && backing.memory.is_some()
                    && backing.size >= size =>
            {
                backing.address
            }
            _ => None,
        };
        let address = address.ok_or(Error::DeviceCallFailure {
            call: "vkCreateAccelerationStructureKHR",
            result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
        })?;

        let handle = state.handle();
        state.structures.insert(
            handle,
            SimStructure {
                kind,
                address,
                built_flags: None,
            },
        );
        Ok(vk::AccelerationStructureKHR::from_raw(handle))
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> DeviceAddress {
        self.state
            .borrow()
            .structures
            .get(&acceleration_structure.as_raw())
            .map_or(0, |structure| structure.address)
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR) {
        let removed = self
            .state
            .borrow_mut()
            .structures
            .remove(&acceleration_structure.as_raw());
        if removed.is_none() {
            tracing::warn!(?acceleration_structure, "destroy of an unknown acceleration structure");
        }
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::ShaderGroupHandles)?;
        let handle_size = self.config.handle_size as usize;
        if !state.pipelines.contains(&pipeline.as_raw())
            || first_group + group_count > 3
            || data_size < group_count as usize * handle_size
        {
            return Err(Error::DeviceCallFailure {
                call: "vkGetRayTracingShaderGroupHandlesKHR",
                result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
            });
        }

        let mut data = vec![0; data_size];
        for group in 0..group_count {
            let value = 0x11 * (first_group + group + 1) as u8;
            let start = group as usize * handle_size;
            data[start..start + handle_size].fill(value);
        }
        Ok(data)
    }

    fn create_storage_image(&self, extent: vk::Extent2D, format: vk::Format) -> Result<StorageImage> {
        let mut state = self.state.borrow_mut();
        state.check(FailurePoint::CreateImage)?;
        let image = state.handle();
        let view = state.handle();
        let memory = state.handle();
        state.images.insert(
            image,
            SimImage {
                extent,
                layout: ImageLayout::UNDEFINED,
            },
        );
        Ok(StorageImage {
            image: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
            memory: vk::DeviceMemory::from_raw(memory),
            format,
            extent,
        })
    }

    fn destroy_storage_image(&self, image: &StorageImage) {
        if self
            .state
            .borrow_mut()
            .images
            .remove(&image.image.as_raw())
            .is_none()
        {
            tracing::warn!(image = ?image.image, "destroy of an unknown image");
        }
    }

    fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder),
    {
        self.submit(record)
    }

    fn wait_for_frame(&self) -> Result<()> {
        self.state.borrow_mut().frame_in_flight = false;
        Ok(())
    }

    fn submit_frame<F>(
        &self,
        _wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        _signal: Option<vk::Semaphore>,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder),
    {
        if self.state.borrow().frame_in_flight {
            tracing::warn!("frame submitted before the previous one was waited for");
            return Err(Error::DeviceCallFailure {
                call: "vkQueueSubmit",
                result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
            });
        }
        self.submit(record)?;
        let mut state = self.state.borrow_mut();
        state.frame_in_flight = true;
        state.frames_submitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_restrictions_narrow_the_type_mask() {
        let device = SimulatedDevice::with_config(SimConfig {
            usage_memory_type_bits: vec![(
                BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
                0b01,
            )],
            ..SimConfig::default()
        });
        let storage = device
            .create_buffer(
                64,
                BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )
            .unwrap();
        let plain = device
            .create_buffer(64, BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        assert_eq!(device.buffer_memory_requirements(storage).memory_type_bits, 0b01);
        assert_eq!(device.buffer_memory_requirements(plain).memory_type_bits, 0b11);
    }

    #[test]
    fn injected_failures_count_down() {
        let device = SimulatedDevice::new();
        device.inject_failure(FailurePoint::CreateBuffer, 1);

        assert!(device.create_buffer(4, BufferUsageFlags::STORAGE_BUFFER).is_ok());
        assert!(matches!(
            device.create_buffer(4, BufferUsageFlags::STORAGE_BUFFER),
            Err(Error::DeviceCallFailure {
                call: "vkCreateBuffer",
                ..
            })
        ));
        assert!(device.create_buffer(4, BufferUsageFlags::STORAGE_BUFFER).is_ok());
    }

    #[test]
    fn second_frame_needs_a_wait() {
        let device = SimulatedDevice::new();
        device.submit_frame(None, None, |_| {}).unwrap();
        assert!(device.frame_in_flight());
        assert!(device.submit_frame(None, None, |_| {}).is_err());

        device.wait_for_frame().unwrap();
        device.submit_frame(None, None, |_| {}).unwrap();
        assert_eq!(device.frames_submitted(), 2);
    }
}
