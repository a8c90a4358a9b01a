//! Mid-frame injection: running effects right after a chosen render pass.
//!
//! The gate is evaluated after every intercepted `vkCmdEndRenderPass`. When it
//! fires, the shadow image being rendered is copied into a temp image, the
//! injection effects run over temp sets, and the result is copied back. All of
//! it is recorded into the application's command buffer.

use crate::chain::{ChainImages, EffectChain};
use crate::config::LayerConfig;
use crate::effect::{Effect, EffectRegistry, TransferEffect, STAGE_OUTPUT_LAYOUT};
use crate::error::Result;
use crate::memory::{create_image_set, ImageSpec};
use crate::resources::ResourceArena;
use crate::tracker::{InjectionStatus, RenderPassTracker};
use ash::{vk, Device};
use std::sync::Arc;

/// Layout the shadow image is assumed to be in when a render pass that wrote
/// it has just ended.
pub const INJECTION_ATTACHMENT_LAYOUT: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// `vkCmdEndRenderPass` without a matching tracked begin.
    NoPassEnded,
    NotTarget { ended: u32, target: u32 },
    AlreadyPerformed,
    FramebufferMismatch { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionDecision {
    Fire { pass_index: u32 },
    Skip(SkipReason),
}

/// Inputs of the injection gate for one ended render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInput {
    pub enabled: bool,
    pub ended: Option<u32>,
    pub target: u32,
    pub performed: bool,
    /// Size of the ended pass's framebuffer, when it was registered.
    pub framebuffer_extent: Option<vk::Extent2D>,
    pub surface_extent: vk::Extent2D,
}

impl GateInput {
    pub fn decide(&self) -> InjectionDecision {
        if !self.enabled {
            return InjectionDecision::Skip(SkipReason::Disabled);
        }
        let Some(ended) = self.ended else {
            return InjectionDecision::Skip(SkipReason::NoPassEnded);
        };
        if ended != self.target {
            return InjectionDecision::Skip(SkipReason::NotTarget {
                ended,
                target: self.target,
            });
        }
        if self.performed {
            return InjectionDecision::Skip(SkipReason::AlreadyPerformed);
        }
        if let Some(extent) = self.framebuffer_extent {
            if extent != self.surface_extent {
                return InjectionDecision::Skip(SkipReason::FramebufferMismatch {
                    width: extent.width,
                    height: extent.height,
                });
            }
        }
        InjectionDecision::Fire { pass_index: ended }
    }
}

/// Evaluates the gate against `tracker` for the pass that just ended, marking
/// injection as performed when it fires.
pub fn evaluate(
    tracker: &RenderPassTracker,
    ended: Option<u32>,
    enabled: bool,
    surface_extent: vk::Extent2D,
) -> InjectionDecision {
    let framebuffer_extent = ended
        .and_then(|index| tracker.pass(index))
        .and_then(|pass| tracker.framebuffer_info(pass.framebuffer))
        .map(|info| vk::Extent2D {
            width: info.width,
            height: info.height,
        });

    let decision = GateInput {
        enabled,
        ended,
        target: tracker.target_pass_index(),
        performed: tracker.was_injection_performed(),
        framebuffer_extent,
        surface_extent,
    }
    .decide();

    match decision {
        InjectionDecision::Fire { pass_index } => {
            tracker.set_injection_performed(true);
            tracing::trace!("injecting after render pass {}", pass_index);
        }
        InjectionDecision::Skip(SkipReason::FramebufferMismatch { width, height }) => {
            tracing::debug!(
                "injection target pass renders {}x{}, surface is {}x{}; skipped",
                width,
                height,
                surface_extent.width,
                surface_extent.height
            );
        }
        InjectionDecision::Skip(SkipReason::AlreadyPerformed) => {
            tracing::debug!(
                "target pass {} recurred after injection this frame; skipped",
                tracker.target_pass_index()
            );
        }
        InjectionDecision::Skip(_) => {}
    }
    decision
}

/// Reports a frame that ended without reaching the injection target.
///
/// Called before the tracker starts the next frame. Returns the status when
/// the target lay past the frame's last pass.
pub fn report_missed_target(tracker: &RenderPassTracker, enabled: bool) -> Option<InjectionStatus> {
    if !enabled || tracker.was_injection_performed() {
        return None;
    }
    let status = tracker.injection_status();
    match status {
        InjectionStatus::InvalidTarget { target, max_valid } => {
            tracing::debug!(
                "injection target pass {} out of range, last pass this frame was {}",
                target,
                max_valid
            );
            Some(status)
        }
        _ => None,
    }
}

/// Temp images and the effect chain run at the injection point.
pub struct InjectionStage {
    chain: EffectChain,
    copy_in: TransferEffect,
    copy_out: TransferEffect,
    arena: ResourceArena,
}

impl InjectionStage {
    /// Allocates one temp set plus one working set per injection effect.
    pub fn new(
        device: Arc<Device>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        registry: &EffectRegistry,
        config: &LayerConfig,
        format: vk::Format,
        extent: vk::Extent2D,
        shadow_images: &[vk::Image],
    ) -> Result<Self> {
        let count = shadow_images.len();
        let mut arena = ResourceArena::new(device.clone());
        let spec = ImageSpec {
            format,
            extent,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        };
        let mut sets = Vec::with_capacity(config.injection.effects.len() + 1);
        for _ in 0..=config.injection.effects.len() {
            sets.push(create_image_set(&mut arena, memory_properties, spec, count)?);
        }

        let images = ChainImages {
            format,
            extent,
            input_layout: STAGE_OUTPUT_LAYOUT,
            sets,
        };
        let chain = EffectChain::build(registry, config, &config.injection.effects, &images);
        let result_set = images.sets[chain.len()].clone();

        let copy_in = TransferEffect::new(
            device.clone(),
            extent,
            shadow_images.to_vec(),
            INJECTION_ATTACHMENT_LAYOUT,
            images.sets[0].clone(),
            STAGE_OUTPUT_LAYOUT,
        );
        let copy_out = TransferEffect::new(
            device,
            extent,
            result_set,
            STAGE_OUTPUT_LAYOUT,
            shadow_images.to_vec(),
            INJECTION_ATTACHMENT_LAYOUT,
        );

        tracing::info!(
            "injection ready after pass {} with [{}]",
            config.injection.pass_index,
            chain.effect_names().join(", ")
        );
        Ok(Self {
            chain,
            copy_in,
            copy_out,
            arena,
        })
    }

    pub fn chain(&self) -> &EffectChain {
        &self.chain
    }

    /// Records copy-in, the injection effects and copy-back for `image_index`.
    pub fn record(&mut self, image_index: usize, cmd: vk::CommandBuffer) {
        self.copy_in.apply(image_index, cmd);
        for stage in 0..self.chain.len() {
            self.chain.apply_effect(stage, image_index, cmd);
        }
        self.copy_out.apply(image_index, cmd);
    }
}

impl Drop for InjectionStage {
    fn drop(&mut self) {
        self.chain = EffectChain::empty();
        self.arena.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{FramebufferInfo, PassBegin};
    use ash::vk::Handle;

    const SURFACE: vk::Extent2D = vk::Extent2D {
        width: 1920,
        height: 1080,
    };

    fn begin(framebuffer: u64) -> PassBegin {
        PassBegin {
            render_pass: vk::RenderPass::from_raw(1),
            framebuffer: vk::Framebuffer::from_raw(framebuffer),
            width: SURFACE.width,
            height: SURFACE.height,
        }
    }

    fn input() -> GateInput {
        GateInput {
            enabled: true,
            ended: Some(2),
            target: 2,
            performed: false,
            framebuffer_extent: None,
            surface_extent: SURFACE,
        }
    }

    #[test]
    fn fires_on_the_target_pass() {
        assert_eq!(input().decide(), InjectionDecision::Fire { pass_index: 2 });
    }

    #[test]
    fn skip_reasons() {
        let disabled = GateInput { enabled: false, ..input() };
        assert_eq!(disabled.decide(), InjectionDecision::Skip(SkipReason::Disabled));

        let unpaired = GateInput { ended: None, ..input() };
        assert_eq!(unpaired.decide(), InjectionDecision::Skip(SkipReason::NoPassEnded));

        let other = GateInput { ended: Some(1), ..input() };
        assert_eq!(
            other.decide(),
            InjectionDecision::Skip(SkipReason::NotTarget { ended: 1, target: 2 })
        );

        let done = GateInput { performed: true, ..input() };
        assert_eq!(done.decide(), InjectionDecision::Skip(SkipReason::AlreadyPerformed));

        let shadow_map = GateInput {
            framebuffer_extent: Some(vk::Extent2D { width: 2048, height: 2048 }),
            ..input()
        };
        assert_eq!(
            shadow_map.decide(),
            InjectionDecision::Skip(SkipReason::FramebufferMismatch { width: 2048, height: 2048 })
        );
    }

    #[test]
    fn fires_at_most_once_per_frame() {
        let tracker = RenderPassTracker::new();
        tracker.set_target_pass_index(0);

        let mut fired = 0;
        for _ in 0..3 {
            tracker.record_pass(begin(10));
            let ended = tracker.end_pass();
            if let InjectionDecision::Fire { .. } = evaluate(&tracker, ended, true, SURFACE) {
                fired += 1;
            }
        }
        // Only pass 0 matches; a second frame may fire again.
        assert_eq!(fired, 1);
        assert!(tracker.was_injection_performed());

        tracker.begin_frame();
        tracker.record_pass(begin(10));
        let ended = tracker.end_pass();
        assert_eq!(
            evaluate(&tracker, ended, true, SURFACE),
            InjectionDecision::Fire { pass_index: 0 }
        );
        let again = evaluate(&tracker, ended, true, SURFACE);
        assert_eq!(again, InjectionDecision::Skip(SkipReason::AlreadyPerformed));
    }

    #[test]
    fn registered_framebuffer_size_is_checked() {
        let tracker = RenderPassTracker::new();
        tracker.register_framebuffer(
            vk::Framebuffer::from_raw(20),
            FramebufferInfo {
                attachments: vec![vk::ImageView::from_raw(5)],
                width: 1024,
                height: 1024,
            },
        );
        tracker.record_pass(begin(20));
        let ended = tracker.end_pass();
        assert!(matches!(
            evaluate(&tracker, ended, true, SURFACE),
            InjectionDecision::Skip(SkipReason::FramebufferMismatch { .. })
        ));
        assert!(!tracker.was_injection_performed());
    }

    #[test]
    fn target_past_the_last_pass_is_reported() {
        let tracker = RenderPassTracker::new();
        tracker.set_target_pass_index(3);
        tracker.begin_frame();
        for id in 0..2 {
            tracker.record_pass(begin(id));
            let ended = tracker.end_pass();
            evaluate(&tracker, ended, true, SURFACE);
        }
        assert_eq!(
            report_missed_target(&tracker, true),
            Some(InjectionStatus::InvalidTarget { target: 3, max_valid: 1 })
        );
        assert_eq!(report_missed_target(&tracker, false), None);

        tracker.set_target_pass_index(1);
        tracker.begin_frame();
        for id in 0..2 {
            tracker.record_pass(begin(id));
            let ended = tracker.end_pass();
            evaluate(&tracker, ended, true, SURFACE);
        }
        assert_eq!(report_missed_target(&tracker, true), None);
    }
}
