use ash::vk::{MemoryPropertyFlags, PhysicalDeviceMemoryProperties};

/// Lowest memory type index allowed by `type_bits` whose properties contain `flags`.
pub fn memory_type_index(
    type_bits: u32,
    properties: &PhysicalDeviceMemoryProperties,
    flags: MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (type_bits & (1 << index)) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::MemoryType;

    fn properties(types: &[MemoryPropertyFlags]) -> PhysicalDeviceMemoryProperties {
        let mut properties = PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in properties.memory_types.iter_mut().zip(types) {
            *slot = MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn picks_first_type_matching_mask_and_flags() {
        let properties = properties(&[
            MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPropertyFlags::HOST_VISIBLE,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(memory_type_index(0b111, &properties, host), Some(2));
        assert_eq!(
            memory_type_index(0b111, &properties, MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(memory_type_index(0b011, &properties, host), None);
    }

    #[test]
    fn ignores_bits_beyond_type_count() {
        let properties = properties(&[MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            memory_type_index(0b10, &properties, MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
