use super::Effect;
use crate::utils::{full_image_copy, record_transitions, LayoutTransition};
use ash::{vk, Device};
use std::sync::Arc;

/// Whole-image copy from one image set into another.
///
/// Used for the pass-through sequence, for the final write into the
/// presentable image and around mid-frame injection.
pub struct TransferEffect {
    device: Arc<Device>,
    extent: vk::Extent2D,
    src_images: Vec<vk::Image>,
    dst_images: Vec<vk::Image>,
    /// Layout the source is found in and restored to.
    src_layout: vk::ImageLayout,
    /// Layout the destination is left in.
    dst_layout: vk::ImageLayout,
}

impl TransferEffect {
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent2D,
        src_images: Vec<vk::Image>,
        src_layout: vk::ImageLayout,
        dst_images: Vec<vk::Image>,
        dst_layout: vk::ImageLayout,
    ) -> Self {
        debug_assert_eq!(src_images.len(), dst_images.len());
        Self {
            device,
            extent,
            src_images,
            dst_images,
            src_layout,
            dst_layout,
        }
    }
}

impl Effect for TransferEffect {
    fn name(&self) -> &str {
        "transfer"
    }

    fn apply(&mut self, image_index: usize, cmd: vk::CommandBuffer) {
        let src = self.src_images.get(image_index);
        let dst = self.dst_images.get(image_index);
        let (Some(&src), Some(&dst)) = (src, dst) else {
            tracing::error!("transfer: image index {} out of range", image_index);
            return;
        };

        let acquire = [
            (
                src,
                LayoutTransition {
                    old_layout: self.src_layout,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_access: vk::AccessFlags::MEMORY_WRITE,
                    dst_access: vk::AccessFlags::TRANSFER_READ,
                },
            ),
            (
                dst,
                LayoutTransition {
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                },
            ),
        ];
        let release = [
            (
                src,
                LayoutTransition {
                    old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    new_layout: self.src_layout,
                    src_access: vk::AccessFlags::TRANSFER_READ,
                    dst_access: vk::AccessFlags::MEMORY_READ,
                },
            ),
            (
                dst,
                LayoutTransition {
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: self.dst_layout,
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                },
            ),
        ];

        unsafe {
            record_transitions(
                &self.device,
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &acquire,
            );
            self.device.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[full_image_copy(self.extent)],
            );
            record_transitions(
                &self.device,
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &release,
            );
        }
    }
}
