use crate::error::{EffectsError, Result};
use ash::{util::read_spv, vk, Device};
use std::fs::File;
use std::path::Path;

/// Loads a SPIR-V shader module from disk.
///
/// # Errors
///
/// [`EffectsError::ShaderRead`] if the file is missing or is not a whole number
/// of SPIR-V words, [`EffectsError::Vk`] if the driver rejects the module.
pub fn load_shader_module(device: &Device, path: &Path) -> Result<vk::ShaderModule> {
    let read_error = |source| EffectsError::ShaderRead {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(read_error)?;
    let code = read_spv(&mut file).map_err(read_error)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Whole-image copy region for a single-mip, single-layer color image.
pub fn full_image_copy(extent: vk::Extent2D) -> vk::ImageCopy {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    vk::ImageCopy {
        src_subresource: layers,
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

/// One layout change of a color image, with the accesses it orders.
#[derive(Debug, Clone, Copy)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl LayoutTransition {
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .build()
    }
}

/// Records one pipeline barrier for several images at once.
///
/// # Safety
/// `cmd` must be in the recording state and every image must belong to `device`.
pub unsafe fn record_transitions(
    device: &Device,
    cmd: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    transitions: &[(vk::Image, LayoutTransition)],
) {
    let barriers: Vec<vk::ImageMemoryBarrier> = transitions
        .iter()
        .map(|(image, transition)| transition.barrier(*image))
        .collect();
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &barriers,
    );
}
