use std::rc::Rc;

use ash::vk::{self, BufferUsageFlags, DeviceAddress, DeviceMemory, MemoryPropertyFlags};
use bytemuck::Pod;
use vk_utils::memory::memory_type_index;

use crate::device::RtxDevice;
use crate::error::{Error, Result};

/// Memory every buffer of the demo lives in.
pub const HOST_MEMORY: MemoryPropertyFlags = MemoryPropertyFlags::from_raw(
    MemoryPropertyFlags::HOST_VISIBLE.as_raw() | MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A buffer bound at offset 0 to its own allocation. Both are released on drop.
pub struct Buffer<D: RtxDevice> {
    device: Rc<D>,
    handle: vk::Buffer,
    memory: DeviceMemory,
    size: u64,
    memory_properties: MemoryPropertyFlags,
    address: Option<DeviceAddress>,
}

impl<D: RtxDevice> Buffer<D> {
    /// Creates the buffer, picks the lowest memory type allowed by the device
    /// that has every bit of `memory_flags`, binds, uploads `initial_data` and
    /// resolves the device address when `usage` asks for one. `initial_data`
    /// has to be exactly `size` bytes long.
    pub fn new(
        device: &Rc<D>,
        size: u64,
        usage: BufferUsageFlags,
        memory_flags: MemoryPropertyFlags,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        if let Some(data) = initial_data {
            if data.len() as u64 != size {
                return Err(Error::OutOfRange {
                    offset: 0,
                    len: data.len() as u64,
                    size,
                });
            }
        }

        let handle = device.create_buffer(size, usage)?;
        let mut buffer = Self {
            device: device.clone(),
            handle,
            memory: DeviceMemory::null(),
            size,
            memory_properties: MemoryPropertyFlags::empty(),
            address: None,
        };

        let requirements = device.buffer_memory_requirements(handle);
        let properties = device.memory_properties();
        let type_index =
            memory_type_index(requirements.memory_type_bits, &properties, memory_flags).ok_or(
                Error::NoMatchingMemoryType {
                    type_bits: requirements.memory_type_bits,
                    flags: memory_flags,
                },
            )?;

        let device_address = usage.contains(BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        buffer.memory = device.allocate_memory(requirements.size, type_index, device_address)?;
        buffer.memory_properties = properties.memory_types[type_index as usize].property_flags;
        device.bind_buffer_memory(handle, buffer.memory)?;

        if let Some(data) = initial_data {
            buffer.write(0, data)?;
        }

        if device_address {
            buffer.address = Some(device.buffer_device_address(handle));
        }

        tracing::trace!(size, ?usage, memory_type = type_index, "buffer created");
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Property flags of the memory type actually chosen.
    pub fn memory_properties(&self) -> MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn device_address(&self) -> Result<DeviceAddress> {
        self.address.ok_or(Error::MissingDeviceAddressUsage)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_host_range(offset, data.len() as u64)?;
        let flush = !self
            .memory_properties
            .contains(MemoryPropertyFlags::HOST_COHERENT);
        self.device.write_memory(self.memory, offset, data, flush)
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_host_range(offset, len as u64)?;
        let invalidate = !self
            .memory_properties
            .contains(MemoryPropertyFlags::HOST_COHERENT);
        let mut data = vec![0; len];
        self.device
            .read_memory(self.memory, offset, &mut data, invalidate)?;
        Ok(data)
    }

    pub fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    pub fn read_pod<T: Pod>(&self, offset: u64) -> Result<T> {
        let bytes = self.read(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn check_host_range(&self, offset: u64, len: u64) -> Result<()> {
        if !self
            .memory_properties
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(Error::NotHostVisible);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl<D: RtxDevice> Drop for Buffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
        if self.memory != DeviceMemory::null() {
            self.device.free_memory(self.memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedDevice};

    fn device() -> Rc<SimulatedDevice> {
        Rc::new(SimulatedDevice::new())
    }

    #[test]
    fn uploads_initial_data_and_resolves_address() {
        let device = device();
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let buffer = Buffer::new(
            &device,
            data.len() as u64,
            BufferUsageFlags::STORAGE_BUFFER | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            HOST_MEMORY,
            Some(&data),
        )
        .unwrap();

        assert_eq!(buffer.read(0, data.len()).unwrap(), data);
        assert_ne!(buffer.device_address().unwrap(), 0);
        assert!(device.allocated_with_device_address(buffer.memory));
    }

    #[test]
    fn address_requires_device_address_usage() {
        let device = device();
        let buffer =
            Buffer::new(&device, 16, BufferUsageFlags::TRANSFER_DST, HOST_MEMORY, None).unwrap();

        assert!(matches!(
            buffer.device_address(),
            Err(Error::MissingDeviceAddressUsage)
        ));
        assert!(!device.allocated_with_device_address(buffer.memory));
    }

    #[test]
    fn no_matching_memory_type_releases_the_buffer() {
        let device = Rc::new(SimulatedDevice::with_config(SimConfig {
            memory_types: vec![MemoryPropertyFlags::DEVICE_LOCAL],
            ..SimConfig::default()
        }));

        let result = Buffer::new(&device, 64, BufferUsageFlags::STORAGE_BUFFER, HOST_MEMORY, None);

        assert!(matches!(result, Err(Error::NoMatchingMemoryType { .. })));
        assert!(device.live_objects().is_empty());
    }

    #[test]
    fn failed_upload_releases_buffer_and_memory() {
        let device = device();
        let result = Buffer::new(
            &device,
            4,
            BufferUsageFlags::STORAGE_BUFFER,
            HOST_MEMORY,
            Some(&[0u8; 8]),
        );

        assert!(matches!(result, Err(Error::OutOfRange { len: 8, size: 4, .. })));
        assert!(device.live_objects().is_empty());
    }

    #[test]
    fn short_initial_data_is_rejected() {
        let device = device();
        let result = Buffer::new(
            &device,
            16,
            BufferUsageFlags::STORAGE_BUFFER,
            HOST_MEMORY,
            Some(&[1u8; 4]),
        );

        assert!(matches!(
            result,
            Err(Error::OutOfRange {
                offset: 0,
                len: 4,
                size: 16
            })
        ));
        assert!(device.live_objects().is_empty());
    }

    #[test]
    fn device_local_memory_rejects_host_access() {
        let device = device();
        let buffer = Buffer::new(
            &device,
            16,
            BufferUsageFlags::STORAGE_BUFFER,
            MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        )
        .unwrap();

        assert!(matches!(buffer.write(0, &[0; 4]), Err(Error::NotHostVisible)));
        assert!(matches!(buffer.read(0, 4), Err(Error::NotHostVisible)));
    }

    #[test]
    fn non_coherent_memory_is_flushed_on_write() {
        let device = Rc::new(SimulatedDevice::with_config(SimConfig {
            memory_types: vec![MemoryPropertyFlags::HOST_VISIBLE],
            ..SimConfig::default()
        }));
        let buffer = Buffer::new(
            &device,
            8,
            BufferUsageFlags::STORAGE_BUFFER,
            MemoryPropertyFlags::HOST_VISIBLE,
            Some(&[9; 8]),
        )
        .unwrap();

        assert_eq!(device.flush_count(), 1);
        buffer.write_pod(4, &7u32).unwrap();
        assert_eq!(device.flush_count(), 2);
        assert_eq!(buffer.read_pod::<u32>(4).unwrap(), 7);
    }

    #[test]
    fn drop_releases_everything() {
        let device = device();
        {
            let _buffer = Buffer::new(
                &device,
                32,
                BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                HOST_MEMORY,
                None,
            )
            .unwrap();
            assert_eq!(device.live_objects().buffers, 1);
            assert_eq!(device.live_objects().memories, 1);
        }
        assert!(device.live_objects().is_empty());
    }
}
