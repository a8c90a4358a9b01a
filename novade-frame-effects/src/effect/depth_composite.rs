//! Depth-aware blend of pre-effect and post-effect images.
//!
//! Pixels whose depth is at or beyond the threshold (sky, HUD drawn without
//! depth) keep the original color; everything closer takes the effected color.
//! Until a depth view is supplied the stage copies the effected image through.

use super::{Effect, EffectCapabilities, TransferEffect, STAGE_OUTPUT_LAYOUT};
use crate::config::LayerConfig;
use crate::error::Result;
use crate::memory::create_image_views;
use crate::pipeline::{create_fullscreen_pipeline, create_pipeline_layout, set_full_viewport};
use crate::render_pass::{create_stage_framebuffers, create_stage_render_pass};
use crate::resources::{OwnedHandle, ResourceArena};
use crate::utils::{load_shader_module, record_transitions, LayoutTransition};
use ash::{vk, Device};
use std::sync::Arc;

pub const VERTEX_SHADER_FILE: &str = "depth_composite.vert.spv";
pub const FRAGMENT_SHADER_FILE: &str = "depth_composite.frag.spv";

/// Layout the application's depth image is sampled in.
pub const DEPTH_SAMPLE_LAYOUT: vk::ImageLayout = vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;

const BINDING_ORIGINAL: u32 = 0;
const BINDING_EFFECTED: u32 = 1;
const BINDING_DEPTH: u32 = 2;

/// Which image a pixel is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeSource {
    Original,
    Effected,
}

impl CompositeSource {
    /// The per-pixel rule the fragment shader implements.
    ///
    /// A depth equal to the threshold keeps the original color. NaN depth
    /// compares false and takes the effected color.
    pub fn resolve(depth: f32, threshold: f32) -> Self {
        if depth >= threshold {
            CompositeSource::Original
        } else {
            CompositeSource::Effected
        }
    }
}

/// How the stage currently records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositeMode {
    /// No depth view yet; the effected image is copied to the output.
    #[default]
    PassThrough,
    Blend,
}

/// State of one composite stage, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthDebugInfo {
    pub mode: CompositeMode,
    pub threshold: f32,
    pub depth_view: Option<vk::ImageView>,
    /// Number of times the descriptor sets were rewritten.
    pub descriptor_updates: u32,
    pub center_depth: f32,
    pub min_depth: f32,
    pub max_depth: f32,
    pub sample_count: u32,
    /// Every sample had the same value; usually a depth buffer that is never written.
    pub all_same: bool,
}

impl Default for DepthDebugInfo {
    fn default() -> Self {
        Self {
            mode: CompositeMode::PassThrough,
            threshold: 1.0,
            depth_view: None,
            descriptor_updates: 0,
            center_depth: 0.0,
            min_depth: 1.0,
            max_depth: 0.0,
            sample_count: 0,
            all_same: true,
        }
    }
}

impl DepthDebugInfo {
    pub fn has_depth_image(&self) -> bool {
        self.depth_view.is_some()
    }

    /// Replaces the sample statistics with those of `samples`, whose middle
    /// element is taken as the screen center.
    pub fn record_samples(&mut self, samples: &[f32]) {
        self.sample_count = samples.len() as u32;
        self.center_depth = samples.get(samples.len() / 2).copied().unwrap_or(0.0);
        self.min_depth = samples.iter().copied().fold(1.0, f32::min);
        self.max_depth = samples.iter().copied().fold(0.0, f32::max);
        self.all_same = samples.windows(2).all(|pair| pair[0] == pair[1]);
    }
}

/// Image sets the composite stage reads and writes, one entry per swapchain image.
#[derive(Debug, Clone)]
pub struct CompositeImages {
    /// Pre-effect images and the layout they rest in.
    pub original: Vec<vk::Image>,
    pub original_layout: vk::ImageLayout,
    /// Output of the last effect, in [`STAGE_OUTPUT_LAYOUT`].
    pub effected: Vec<vk::Image>,
    pub output: Vec<vk::Image>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PushConstants {
    threshold: f32,
}

pub struct DepthCompositeEffect {
    device: Arc<Device>,
    arena: ResourceArena,
    extent: vk::Extent2D,
    images: CompositeImages,
    original_views: Vec<vk::ImageView>,
    effected_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    sampler: vk::Sampler,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    passthrough: TransferEffect,
    depth_view: Option<vk::ImageView>,
    descriptors_dirty: bool,
    debug: DepthDebugInfo,
}

impl DepthCompositeEffect {
    pub fn new(
        device: Arc<Device>,
        format: vk::Format,
        extent: vk::Extent2D,
        images: CompositeImages,
        config: &LayerConfig,
    ) -> Result<Self> {
        let count = images.output.len();
        debug_assert!(images.original.len() == count && images.effected.len() == count);
        let mut arena = ResourceArena::new(device.clone());

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0);
        let sampler = unsafe { device.create_sampler(&sampler_info, None)? };
        arena.push(OwnedHandle::Sampler(sampler));

        let bindings = [BINDING_ORIGINAL, BINDING_EFFECTED, BINDING_DEPTH].map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build()
        });
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None)? };
        arena.push(OwnedHandle::DescriptorSetLayout(set_layout));

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: (bindings.len() * count) as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(count as u32)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };
        arena.push(OwnedHandle::DescriptorPool(descriptor_pool));

        let set_layouts = vec![set_layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info)? };

        let original_views = create_image_views(&mut arena, &images.original, format)?;
        let effected_views = create_image_views(&mut arena, &images.effected, format)?;
        let output_views = create_image_views(&mut arena, &images.output, format)?;

        let render_pass = create_stage_render_pass(&device, format)?;
        arena.push(OwnedHandle::RenderPass(render_pass));

        let framebuffers = create_stage_framebuffers(&device, render_pass, &output_views, extent)?;
        for framebuffer in &framebuffers {
            arena.push(OwnedHandle::Framebuffer(*framebuffer));
        }

        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: std::mem::size_of::<PushConstants>() as u32,
        }];
        let pipeline_layout =
            create_pipeline_layout(&device, &[set_layout], &push_constant_ranges)?;
        arena.push(OwnedHandle::PipelineLayout(pipeline_layout));

        let vertex_module = load_shader_module(&device, &config.shader_path(VERTEX_SHADER_FILE))?;
        let fragment_path = config.shader_path(FRAGMENT_SHADER_FILE);
        let fragment_module = match load_shader_module(&device, &fragment_path) {
            Ok(module) => module,
            Err(err) => {
                unsafe { device.destroy_shader_module(vertex_module, None) };
                return Err(err);
            }
        };
        let pipeline = create_fullscreen_pipeline(
            &device,
            render_pass,
            pipeline_layout,
            vertex_module,
            fragment_module,
        );
        unsafe {
            device.destroy_shader_module(vertex_module, None);
            device.destroy_shader_module(fragment_module, None);
        }
        let pipeline = pipeline?;
        arena.push(OwnedHandle::Pipeline(pipeline));

        let passthrough = TransferEffect::new(
            device.clone(),
            extent,
            images.effected.clone(),
            STAGE_OUTPUT_LAYOUT,
            images.output.clone(),
            STAGE_OUTPUT_LAYOUT,
        );

        let threshold = config.depth.threshold;
        tracing::debug!("depth composite ready for {} images, threshold {}", count, threshold);

        Ok(Self {
            device,
            arena,
            extent,
            images,
            original_views,
            effected_views,
            framebuffers,
            descriptor_sets,
            sampler,
            render_pass,
            pipeline_layout,
            pipeline,
            passthrough,
            depth_view: None,
            descriptors_dirty: false,
            debug: DepthDebugInfo {
                threshold,
                ..DepthDebugInfo::default()
            },
        })
    }

    fn update_descriptor_sets(&mut self, depth_view: vk::ImageView) {
        for (i, set) in self.descriptor_sets.iter().enumerate() {
            let original = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: self.original_views[i],
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let effected = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: self.effected_views[i],
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let depth = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: depth_view,
                image_layout: DEPTH_SAMPLE_LAYOUT,
            }];
            let writes = [
                (BINDING_ORIGINAL, &original),
                (BINDING_EFFECTED, &effected),
                (BINDING_DEPTH, &depth),
            ]
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
                    .build()
            });
            unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        }
        self.descriptors_dirty = false;
        self.debug.descriptor_updates += 1;
    }

    fn record_blend(&self, image_index: usize, cmd: vk::CommandBuffer) {
        let original = self.images.original[image_index];
        let effected = self.images.effected[image_index];
        let to_read = [
            (
                original,
                LayoutTransition {
                    old_layout: self.images.original_layout,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src_access: vk::AccessFlags::MEMORY_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                },
            ),
            (
                effected,
                LayoutTransition {
                    old_layout: STAGE_OUTPUT_LAYOUT,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src_access: vk::AccessFlags::MEMORY_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                },
            ),
        ];
        let restore = [
            (
                original,
                LayoutTransition {
                    old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    new_layout: self.images.original_layout,
                    src_access: vk::AccessFlags::SHADER_READ,
                    dst_access: vk::AccessFlags::MEMORY_READ,
                },
            ),
            (
                effected,
                LayoutTransition {
                    old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    new_layout: STAGE_OUTPUT_LAYOUT,
                    src_access: vk::AccessFlags::SHADER_READ,
                    dst_access: vk::AccessFlags::MEMORY_READ,
                },
            ),
        ];

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            });
        let push = PushConstants {
            threshold: self.debug.threshold,
        };

        unsafe {
            record_transitions(
                &self.device,
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                &to_read,
            );
            self.device
                .cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            set_full_viewport(&self.device, cmd, self.extent);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.descriptor_sets[image_index]],
                &[],
            );
            self.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                &push.threshold.to_ne_bytes(),
            );
            self.device.cmd_draw(cmd, 3, 1, 0, 0);
            self.device.cmd_end_render_pass(cmd);
            record_transitions(
                &self.device,
                cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &restore,
            );
        }
    }
}

impl Effect for DepthCompositeEffect {
    fn name(&self) -> &str {
        "depth_composite"
    }

    fn capabilities(&self) -> EffectCapabilities {
        EffectCapabilities {
            accepts_depth: true,
            is_compositor: true,
        }
    }

    fn apply(&mut self, image_index: usize, cmd: vk::CommandBuffer) {
        if image_index >= self.framebuffers.len() {
            tracing::error!("depth composite: image index {} out of range", image_index);
            return;
        }
        let Some(depth_view) = self.depth_view else {
            self.passthrough.apply(image_index, cmd);
            return;
        };
        if self.descriptors_dirty {
            self.update_descriptor_sets(depth_view);
        }
        self.record_blend(image_index, cmd);
    }

    fn use_depth_image(&mut self, depth_view: vk::ImageView) {
        if depth_view == vk::ImageView::null() {
            self.depth_view = None;
            self.debug.mode = CompositeMode::PassThrough;
        } else {
            self.depth_view = Some(depth_view);
            self.debug.mode = CompositeMode::Blend;
        }
        self.debug.depth_view = self.depth_view;
        self.descriptors_dirty = self.depth_view.is_some();
    }

    fn depth_debug(&self) -> Option<DepthDebugInfo> {
        Some(self.debug)
    }

    fn set_depth_threshold(&mut self, threshold: f32) -> bool {
        if self.debug.threshold != threshold {
            tracing::debug!("depth composite threshold {} -> {}", self.debug.threshold, threshold);
        }
        self.debug.threshold = threshold;
        true
    }

    fn record_depth_samples(&mut self, samples: &[f32]) {
        self.debug.record_samples(samples);
        if self.debug.sample_count > 1 && self.debug.all_same {
            tracing::debug!(
                "depth composite: all {} depth samples equal {}",
                self.debug.sample_count,
                self.debug.center_depth
            );
        }
    }
}

impl Drop for DepthCompositeEffect {
    fn drop(&mut self) {
        // Descriptor sets go with their pool.
        self.descriptor_sets.clear();
        self.arena.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.5, 1.0, CompositeSource::Effected)]
    #[case(1.0, 1.0, CompositeSource::Original)]
    #[case(0.9991, 0.999, CompositeSource::Original)]
    #[case(0.0, 0.0, CompositeSource::Original)]
    #[case(f32::NAN, 1.0, CompositeSource::Effected)]
    fn resolves_by_threshold(
        #[case] depth: f32,
        #[case] threshold: f32,
        #[case] expected: CompositeSource,
    ) {
        assert_eq!(CompositeSource::resolve(depth, threshold), expected);
    }

    #[test]
    fn debug_info_starts_in_pass_through() {
        let info = DepthDebugInfo::default();
        assert_eq!(info.mode, CompositeMode::PassThrough);
        assert!(!info.has_depth_image());
        assert_eq!(info.descriptor_updates, 0);
        assert_eq!(info.sample_count, 0);
    }

    #[test]
    fn sample_statistics() {
        let mut info = DepthDebugInfo::default();
        info.record_samples(&[0.2, 0.9, 0.5, 1.0, 0.7]);
        assert_eq!(info.sample_count, 5);
        assert_eq!(info.center_depth, 0.5);
        assert_eq!(info.min_depth, 0.2);
        assert_eq!(info.max_depth, 1.0);
        assert!(!info.all_same);

        info.record_samples(&[1.0; 4]);
        assert!(info.all_same);
        assert_eq!(info.min_depth, 1.0);
    }

    #[test]
    fn push_constants_are_one_float() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 4);
    }
}
