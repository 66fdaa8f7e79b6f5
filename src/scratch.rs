use std::rc::Rc;

use ash::vk::{BufferUsageFlags, DeviceAddress};

use crate::buffer_resource::{Buffer, HOST_MEMORY};
use crate::device::RtxDevice;
use crate::error::Result;

/// Working memory for one acceleration structure build or update.
pub struct ScratchBuffer<D: RtxDevice> {
    buffer: Buffer<D>,
    address: DeviceAddress,
    size: u64,
}

impl<D: RtxDevice> ScratchBuffer<D> {
    /// Scratch address, aligned to the device's scratch offset alignment.
    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    /// Usable bytes starting at `device_address`.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> &Buffer<D> {
        &self.buffer
    }
}

/// Hands out scratch buffers to builders and takes them back once the build's
/// fence wait has returned.
pub trait ScratchAllocator<D: RtxDevice> {
    fn acquire(&mut self, size: u64) -> Result<ScratchBuffer<D>>;

    fn release(&mut self, scratch: ScratchBuffer<D>) {
        drop(scratch);
    }
}

/// Allocates a fresh buffer per request and frees it on release.
pub struct TransientScratch<D: RtxDevice> {
    device: Rc<D>,
    alignment: u64,
}

impl<D: RtxDevice> TransientScratch<D> {
    pub fn new(device: &Rc<D>) -> Self {
        let alignment = device.scratch_alignment().max(1);
        Self {
            device: device.clone(),
            alignment,
        }
    }
}

impl<D: RtxDevice> ScratchAllocator<D> for TransientScratch<D> {
    fn acquire(&mut self, size: u64) -> Result<ScratchBuffer<D>> {
        // Over-allocate so the address can be rounded up.
        let buffer = Buffer::new(
            &self.device,
            size + self.alignment - 1,
            BufferUsageFlags::SHADER_DEVICE_ADDRESS | BufferUsageFlags::STORAGE_BUFFER,
            HOST_MEMORY,
            None,
        )?;
        let base = buffer.device_address()?;
        let address = (base + self.alignment - 1) / self.alignment * self.alignment;
        tracing::trace!(size, address, "scratch acquired");

        Ok(ScratchBuffer {
            buffer,
            address,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedDevice};

    #[test]
    fn scratch_address_is_aligned_and_covers_the_request() {
        let device = Rc::new(SimulatedDevice::with_config(SimConfig {
            scratch_alignment: 128,
            address_granularity: 16,
            ..SimConfig::default()
        }));
        let mut allocator = TransientScratch::new(&device);

        // Misalign the next address first.
        let _pad = Buffer::new(
            &device,
            8,
            BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            None,
        )
        .unwrap();

        let scratch = allocator.acquire(300).unwrap();
        let base = scratch.buffer().device_address().unwrap();

        assert_eq!(scratch.device_address() % 128, 0);
        assert!(scratch.device_address() >= base);
        assert!(scratch.device_address() + 300 <= base + scratch.buffer().size());
        assert_eq!(scratch.size(), 300);
    }

    #[test]
    fn release_frees_the_buffer() {
        let device = Rc::new(SimulatedDevice::new());
        let mut allocator = TransientScratch::new(&device);

        let scratch = allocator.acquire(64).unwrap();
        assert_eq!(device.live_objects().buffers, 1);
        allocator.release(scratch);
        assert!(device.live_objects().is_empty());
    }
}
