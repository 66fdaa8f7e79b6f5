use std::rc::Rc;

use ash::vk::{self, BufferUsageFlags, DeviceAddress};

use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::{RtxDevice, TraceRegions};
use crate::error::Result;

/// Rounds `size` up to a multiple of `alignment`.
pub fn align_up(size: u32, alignment: u32) -> u32 {
    if alignment == 0 || size % alignment == 0 {
        size
    } else {
        (size / alignment + 1) * alignment
    }
}

/// Shader groups in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderGroup {
    RayGen = 0,
    Miss = 1,
    ClosestHit = 2,
}

impl ShaderGroup {
    pub const ALL: [ShaderGroup; 3] = [ShaderGroup::RayGen, ShaderGroup::Miss, ShaderGroup::ClosestHit];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderBindingRegion {
    pub address: DeviceAddress,
    pub stride: u64,
    pub size: u64,
}

impl ShaderBindingRegion {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(self.address)
            .stride(self.stride)
            .size(self.size)
            .build()
    }
}

/// One buffer per shader group holding that group's handle.
pub struct ShaderBindingTable<D: RtxDevice> {
    buffers: Vec<Buffer<D>>,
    regions: [ShaderBindingRegion; 3],
    handle_size: u32,
    aligned_handle_size: u32,
}

impl<D: RtxDevice> ShaderBindingTable<D> {
    pub fn new(device: &Rc<D>, pipeline: vk::Pipeline) -> Result<Self> {
        let properties = device.shader_group_properties();
        let handle_size = properties.handle_size;
        let aligned_handle_size = align_up(handle_size, properties.handle_alignment);
        let aligned = aligned_handle_size as usize;

        let group_count = ShaderGroup::ALL.len();
        let mut table = vec![0u8; group_count * aligned];
        for group in ShaderGroup::ALL {
            let index = group as usize;
            let handle =
                device.shader_group_handles(pipeline, index as u32, 1, handle_size as usize)?;
            table[index * aligned..index * aligned + handle_size as usize]
                .copy_from_slice(&handle[..handle_size as usize]);
        }

        let mut buffers = Vec::with_capacity(group_count);
        let mut regions = [ShaderBindingRegion::empty(); 3];
        for group in ShaderGroup::ALL {
            let index = group as usize;
            let record = &table[index * aligned..index * aligned + handle_size as usize];
            let buffer = Buffer::new(
                device,
                handle_size as u64,
                BufferUsageFlags::SHADER_BINDING_TABLE_KHR | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                HOST_MEMORY,
                Some(record),
            )?;
            regions[index] = ShaderBindingRegion {
                address: buffer.device_address()?,
                stride: aligned_handle_size as u64,
                size: aligned_handle_size as u64,
            };
            buffers.push(buffer);
        }

        tracing::info!(handle_size, aligned_handle_size, "shader binding table created");
        Ok(Self {
            buffers,
            regions,
            handle_size,
            aligned_handle_size,
        })
    }

    pub fn region(&self, group: ShaderGroup) -> ShaderBindingRegion {
        self.regions[group as usize]
    }

    pub fn buffer(&self, group: ShaderGroup) -> &Buffer<D> {
        &self.buffers[group as usize]
    }

    /// Regions as passed to `vkCmdTraceRaysKHR`, with an empty callable region.
    pub fn regions(&self) -> TraceRegions {
        TraceRegions {
            raygen: self.region(ShaderGroup::RayGen).raw(),
            miss: self.region(ShaderGroup::Miss).raw(),
            hit: self.region(ShaderGroup::ClosestHit).raw(),
            callable: ShaderBindingRegion::empty().raw(),
        }
    }

    pub fn handle_size(&self) -> u32 {
        self.handle_size
    }

    pub fn aligned_handle_size(&self) -> u32 {
        self.aligned_handle_size
    }

    pub fn total_size(&self) -> u64 {
        ShaderGroup::ALL.len() as u64 * self.aligned_handle_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedDevice};

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(12, 0), 12);

        for size in 1..200 {
            for alignment in [1, 2, 8, 32, 64] {
                let aligned = align_up(size, alignment);
                assert!(aligned >= size);
                assert_eq!(aligned % alignment, 0);
                assert!(aligned - size < alignment);
            }
        }
    }

    #[test]
    fn regions_hold_each_group_handle() {
        let device = Rc::new(SimulatedDevice::new());
        let pipeline = device.create_pipeline();
        let sbt = ShaderBindingTable::new(&device, pipeline).unwrap();
        let properties = device.shader_group_properties();

        assert_eq!(sbt.handle_size(), properties.handle_size);
        assert_eq!(
            sbt.aligned_handle_size(),
            align_up(properties.handle_size, properties.handle_alignment)
        );
        assert_eq!(sbt.total_size(), 3 * sbt.aligned_handle_size() as u64);

        for group in ShaderGroup::ALL {
            let region = sbt.region(group);
            assert_ne!(region.address, 0);
            assert_eq!(region.stride, sbt.aligned_handle_size() as u64);
            assert_eq!(region.size, sbt.aligned_handle_size() as u64);

            let handle = device
                .shader_group_handles(pipeline, group as u32, 1, properties.handle_size as usize)
                .unwrap();
            let stored = sbt
                .buffer(group)
                .read(0, properties.handle_size as usize)
                .unwrap();
            assert_eq!(stored, handle);
        }

        let regions = sbt.regions();
        assert_eq!(regions.callable.size, 0);
        assert_eq!(regions.callable.device_address, 0);
    }

    #[test]
    fn already_aligned_handles_are_not_padded() {
        let device = Rc::new(SimulatedDevice::with_config(SimConfig {
            handle_size: 64,
            handle_alignment: 32,
            ..SimConfig::default()
        }));
        let sbt = ShaderBindingTable::new(&device, device.create_pipeline()).unwrap();

        assert_eq!(sbt.aligned_handle_size(), 64);
        assert_eq!(sbt.total_size(), 192);
    }
}
