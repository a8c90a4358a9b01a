//! The effect contract and the stages this crate implements itself.
//!
//! An effect reads one image per swapchain image and writes another. It records
//! its work into a command buffer it is handed and never submits anything.
//!
//! Layout contract between stages: an effect finds its input images in
//! [`EffectContext::input_layout`] and must leave them there; it leaves its
//! output images in [`vk::ImageLayout::GENERAL`].

pub mod depth_composite;
pub mod params;
pub mod registry;
pub mod transfer;

use crate::config::LayerConfig;
use ash::vk;

pub use depth_composite::{
    CompositeImages, CompositeMode, CompositeSource, DepthCompositeEffect, DepthDebugInfo,
};
pub use params::{EffectParam, ParamValue};
pub use registry::{EffectConstructor, EffectRegistry};
pub use transfer::TransferEffect;

/// Layout every stage leaves its output images in.
pub const STAGE_OUTPUT_LAYOUT: vk::ImageLayout = vk::ImageLayout::GENERAL;

/// What an effect can do beyond a plain image-to-image transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectCapabilities {
    /// Consumes a depth view through [`Effect::use_depth_image`].
    pub accepts_depth: bool,
    /// Blends pre-effect and post-effect images; runs after every other stage.
    pub is_compositor: bool,
}

pub trait Effect: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> EffectCapabilities {
        EffectCapabilities::default()
    }

    /// Records the work for swapchain image `image_index` into `cmd`.
    fn apply(&mut self, image_index: usize, cmd: vk::CommandBuffer);

    fn use_depth_image(&mut self, _depth_view: vk::ImageView) {}

    fn parameters(&self) -> Vec<EffectParam> {
        Vec::new()
    }

    /// Diagnostics of a depth compositor. `None` for every other stage.
    fn depth_debug(&self) -> Option<DepthDebugInfo> {
        None
    }

    /// Moves the depth threshold of a compositor. Returns `false` when the
    /// stage has none. Recorded commands keep the old value until re-recorded.
    fn set_depth_threshold(&mut self, _threshold: f32) -> bool {
        false
    }

    /// Depth values read back by a diagnostics collaborator.
    fn record_depth_samples(&mut self, _samples: &[f32]) {}
}

/// Everything a constructor needs to know about the stage it fills.
#[derive(Debug, Clone)]
pub struct EffectContext<'a> {
    pub effect_name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub input_images: &'a [vk::Image],
    pub input_layout: vk::ImageLayout,
    pub output_images: &'a [vk::Image],
    pub config: &'a LayerConfig,
}
