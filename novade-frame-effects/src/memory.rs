//! Image sets backed by a single device-memory allocation.

use crate::error::{EffectsError, Result};
use crate::resources::{OwnedHandle, ResourceArena};
use crate::utils::color_subresource_range;
use ash::vk;

/// Picks the first memory type allowed by `type_bits` that has all of `flags`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Offsets of each requirement when packed back to back into one allocation,
/// plus the total size and the memory types every image accepts.
pub fn pack_requirements(
    requirements: &[vk::MemoryRequirements],
) -> (Vec<vk::DeviceSize>, vk::DeviceSize, u32) {
    let mut offsets = Vec::with_capacity(requirements.len());
    let mut size = 0;
    let mut type_bits = u32::MAX;
    for req in requirements {
        let offset = align_up(size, req.alignment);
        offsets.push(offset);
        size = offset + req.size;
        type_bits &= req.memory_type_bits;
    }
    (offsets, size, type_bits)
}

/// Shape of the color images in one set.
#[derive(Debug, Clone, Copy)]
pub struct ImageSpec {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
}

/// Creates `count` images sharing one device-local allocation.
///
/// The memory is pushed to `arena` before the images, so teardown destroys the
/// images first. On failure nothing created here is leaked.
pub fn create_image_set(
    arena: &mut ResourceArena,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    spec: ImageSpec,
    count: usize,
) -> Result<Vec<vk::Image>> {
    let device = arena.device().clone();
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(spec.format)
        .extent(vk::Extent3D {
            width: spec.extent.width,
            height: spec.extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(spec.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let mut images = Vec::with_capacity(count);
    let destroy_images = |images: &[vk::Image]| {
        for image in images {
            unsafe { device.destroy_image(*image, None) };
        }
    };

    for _ in 0..count {
        match unsafe { device.create_image(&create_info, None) } {
            Ok(image) => images.push(image),
            Err(err) => {
                destroy_images(&images);
                return Err(err.into());
            }
        }
    }

    let requirements: Vec<vk::MemoryRequirements> = images
        .iter()
        .map(|image| unsafe { device.get_image_memory_requirements(*image) })
        .collect();
    let (offsets, size, type_bits) = pack_requirements(&requirements);

    let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    let Some(memory_type_index) = find_memory_type(memory_properties, type_bits, flags) else {
        destroy_images(&images);
        return Err(EffectsError::NoSuitableMemoryType { type_bits, flags });
    };

    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
        Ok(memory) => memory,
        Err(err) => {
            destroy_images(&images);
            return Err(err.into());
        }
    };

    arena.push(OwnedHandle::Memory(memory));
    for image in &images {
        arena.push(OwnedHandle::Image(*image));
    }

    for (image, offset) in images.iter().zip(offsets) {
        unsafe { device.bind_image_memory(*image, memory, offset)? };
    }

    tracing::debug!(
        "allocated {} images of {}x{} {:?} in {} bytes",
        count,
        spec.extent.width,
        spec.extent.height,
        spec.format,
        size
    );
    Ok(images)
}

/// Creates one 2D color view per image, owned by `arena`.
pub fn create_image_views(
    arena: &mut ResourceArena,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>> {
    let device = arena.device().clone();
    let mut views = Vec::with_capacity(images.len());
    for image in images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(*image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());
        let view = unsafe { device.create_image_view(&create_info, None)? };
        arena.push(OwnedHandle::ImageView(view));
        views.push(view);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn finds_first_matching_memory_type() {
        let props = properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
    }

    #[test]
    fn no_memory_type_when_bits_exclude_all_candidates() {
        let props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn packing_respects_alignment_and_intersects_type_bits() {
        let reqs = [
            vk::MemoryRequirements { size: 100, alignment: 256, memory_type_bits: 0b0111 },
            vk::MemoryRequirements { size: 300, alignment: 256, memory_type_bits: 0b0110 },
            vk::MemoryRequirements { size: 10, alignment: 1, memory_type_bits: 0b1110 },
        ];
        let (offsets, size, bits) = pack_requirements(&reqs);
        assert_eq!(offsets, vec![0, 256, 556]);
        assert_eq!(size, 566);
        assert_eq!(bits, 0b0110);
    }
}
