//! The per-swapchain effect pipeline.
//!
//! The application renders into shadow images; at present time one of two
//! pre-recorded command buffers turns the shadow image into the presentable
//! image, either through the effect chain or as a plain copy.

use crate::chain::{working_sets_for, ChainImages, EffectChain, SequencePlan, SequenceStep};
use crate::config::LayerConfig;
use crate::device::LayerDevice;
use crate::effect::{
    CompositeImages, DepthCompositeEffect, DepthDebugInfo, Effect, EffectParam, TransferEffect,
};
use crate::error::Result;
use crate::injection::InjectionStage;
use crate::memory::{create_image_set, ImageSpec};
use crate::resources::{OwnedHandle, ResourceArena};
use crate::utils::{record_transitions, LayoutTransition};
use ash::vk;
use std::sync::Arc;

/// Layout the application leaves its frame in before presenting.
pub const SHADOW_PRESENT_LAYOUT: vk::ImageLayout = vk::ImageLayout::PRESENT_SRC_KHR;

/// Records extra content (an overlay) into the presentable image.
pub trait OverlayHook: Send {
    /// `image` is in `PRESENT_SRC_KHR` and must be left there.
    fn record(
        &mut self,
        image_index: usize,
        image: vk::Image,
        extent: vk::Extent2D,
        cmd: vk::CommandBuffer,
    );
}

/// Which of the two pre-recorded sequences present submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    WithEffects,
    WithoutEffects,
}

/// Work requested off the render thread, carried out by the next present.
#[derive(Debug, Default)]
pub struct PendingWork {
    config: Option<Arc<LayerConfig>>,
    rerecord: bool,
}

impl PendingWork {
    /// A later request replaces an earlier one that was not yet applied.
    pub fn request_reload(&mut self, config: Arc<LayerConfig>) {
        self.config = Some(config);
    }

    pub fn request_rerecord(&mut self) {
        self.rerecord = true;
    }

    pub fn is_pending(&self) -> bool {
        self.config.is_some() || self.rerecord
    }

    /// Clears the request and returns the configuration to rebuild with and
    /// whether the sequences must be re-recorded.
    pub fn take(&mut self) -> (Option<Arc<LayerConfig>>, bool) {
        (self.config.take(), std::mem::take(&mut self.rerecord))
    }
}

pub struct SwapchainPipeline {
    device: Arc<LayerDevice>,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    real_images: Vec<vk::Image>,
    shadow_images: Vec<vk::Image>,
    stage_sets: Vec<Vec<vk::Image>>,
    chain: EffectChain,
    injection: Option<InjectionStage>,
    effect_cmds: Vec<vk::CommandBuffer>,
    passthrough_cmds: Vec<vk::CommandBuffer>,
    semaphores: Vec<vk::Semaphore>,
    effects_enabled: bool,
    depth_view: Option<vk::ImageView>,
    pending: PendingWork,
    overlay: Option<Box<dyn OverlayHook>>,
    config: LayerConfig,
    stage_arena: ResourceArena,
    base_arena: ResourceArena,
}

impl SwapchainPipeline {
    /// Creates the shadow images and per-image sync objects, then builds the
    /// configured chain.
    ///
    /// Only the shadow images and command buffers are required; effect and
    /// injection failures leave a pass-through pipeline.
    pub fn new(
        device: Arc<LayerDevice>,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
        extent: vk::Extent2D,
        real_images: Vec<vk::Image>,
        app_usage: vk::ImageUsageFlags,
        config: &LayerConfig,
    ) -> Result<Self> {
        let count = real_images.len();
        let mut base_arena = ResourceArena::new(device.device.clone());

        let shadow_spec = ImageSpec {
            format,
            extent,
            usage: app_usage
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        };
        let shadow_images =
            create_image_set(&mut base_arena, &device.memory_properties, shadow_spec, count)?;

        let command_buffers = device.allocate_command_buffers(count * 2)?;
        base_arena.push(OwnedHandle::CommandBuffers {
            pool: device.command_pool,
            buffers: command_buffers.clone(),
        });
        let (effect_cmds, passthrough_cmds) = command_buffers.split_at(count);

        let mut semaphores = Vec::with_capacity(count);
        for _ in 0..count {
            let semaphore = device.create_semaphore()?;
            base_arena.push(OwnedHandle::Semaphore(semaphore));
            semaphores.push(semaphore);
        }

        tracing::info!(
            "swapchain {:?}: {} images, {}x{} {:?}",
            swapchain,
            count,
            extent.width,
            extent.height,
            format
        );

        let mut pipeline = Self {
            stage_arena: ResourceArena::new(device.device.clone()),
            device,
            swapchain,
            format,
            extent,
            real_images,
            shadow_images,
            stage_sets: Vec::new(),
            chain: EffectChain::empty(),
            injection: None,
            effect_cmds: effect_cmds.to_vec(),
            passthrough_cmds: passthrough_cmds.to_vec(),
            semaphores,
            effects_enabled: config.enable_on_launch,
            depth_view: None,
            pending: PendingWork::default(),
            overlay: None,
            config: config.clone(),
            base_arena,
        };
        pipeline.reload_effects(config);
        Ok(pipeline)
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.real_images.len()
    }

    /// The images the application renders into.
    pub fn shadow_images(&self) -> &[vk::Image] {
        &self.shadow_images
    }

    pub fn chain(&self) -> &EffectChain {
        &self.chain
    }

    pub fn parameters(&self) -> &[EffectParam] {
        self.chain.parameters()
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn effects_enabled(&self) -> bool {
        self.effects_enabled
    }

    pub fn set_effects_enabled(&mut self, enabled: bool) {
        if self.effects_enabled != enabled {
            tracing::info!("effects {}", if enabled { "enabled" } else { "disabled" });
        }
        self.effects_enabled = enabled;
    }

    pub fn mode(&self) -> SequenceMode {
        if self.effects_enabled {
            SequenceMode::WithEffects
        } else {
            SequenceMode::WithoutEffects
        }
    }

    pub fn injection_enabled(&self) -> bool {
        self.injection.is_some()
    }

    /// Installs or removes the overlay hook; both sequences are re-recorded on
    /// the next present.
    pub fn set_overlay(&mut self, overlay: Option<Box<dyn OverlayHook>>) {
        self.overlay = overlay;
        self.pending.request_rerecord();
    }

    /// Schedules a rebuild of the chain from `config` at the next present.
    pub fn request_reload(&mut self, config: Arc<LayerConfig>) {
        self.pending.request_reload(config);
    }

    pub fn reload_pending(&self) -> bool {
        self.pending.is_pending()
    }

    /// Rebuilds the effect chain and injection stage from `config` while the
    /// swapchain stays live. Waits for the device to go idle, so it runs only
    /// at creation and on the present path.
    fn reload_effects(&mut self, config: &LayerConfig) {
        self.device.wait_idle();
        self.chain = EffectChain::empty();
        self.injection = None;
        self.config = config.clone();

        let names = config.active_effects();
        let needed = working_sets_for(names.len(), config.depth.composite);
        match self.ensure_stage_sets(needed) {
            Ok(()) => self.chain = self.build_chain(config, &names, needed),
            Err(err) => {
                tracing::warn!("effect images unavailable, presenting without effects: {}", err)
            }
        }

        if config.injection.enabled {
            self.injection = self.build_injection(config);
        }
        self.device.tracker.set_target_pass_index(config.injection.pass_index);

        self.record_all();
    }

    fn ensure_stage_sets(&mut self, needed: usize) -> Result<()> {
        let spec = ImageSpec {
            format: self.format,
            extent: self.extent,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        };
        while self.stage_sets.len() < needed {
            let set = create_image_set(
                &mut self.stage_arena,
                &self.device.memory_properties,
                spec,
                self.real_images.len(),
            )?;
            self.stage_sets.push(set);
        }
        Ok(())
    }

    fn chain_images(&self, working_sets: usize) -> ChainImages {
        let mut sets = Vec::with_capacity(working_sets + 1);
        sets.push(self.shadow_images.clone());
        sets.extend(self.stage_sets.iter().take(working_sets).cloned());
        ChainImages {
            format: self.format,
            extent: self.extent,
            input_layout: SHADOW_PRESENT_LAYOUT,
            sets,
        }
    }

    fn build_chain(
        &self,
        config: &LayerConfig,
        names: &[String],
        working_sets: usize,
    ) -> EffectChain {
        let images = self.chain_images(working_sets);
        let mut chain = EffectChain::build(&self.device.registry, config, names, &images);
        if !config.depth.composite || chain.is_empty() {
            return chain;
        }

        let composite_images = CompositeImages {
            original: self.shadow_images.clone(),
            original_layout: SHADOW_PRESENT_LAYOUT,
            effected: images.sets[chain.len()].clone(),
            output: images.sets[chain.len() + 1].clone(),
        };
        match DepthCompositeEffect::new(
            self.device.device.clone(),
            self.format,
            self.extent,
            composite_images,
            config,
        ) {
            Ok(mut compositor) => {
                if let Some(view) = self.depth_view {
                    compositor.use_depth_image(view);
                }
                chain.attach_compositor(Box::new(compositor));
            }
            Err(err) => tracing::warn!("depth composite disabled: {}", err),
        }
        chain
    }

    fn build_injection(&self, config: &LayerConfig) -> Option<InjectionStage> {
        let stage = InjectionStage::new(
            self.device.device.clone(),
            &self.device.memory_properties,
            &self.device.registry,
            config,
            self.format,
            self.extent,
            &self.shadow_images,
        );
        match stage {
            Ok(stage) if !stage.chain().is_empty() => Some(stage),
            Ok(_) => {
                tracing::warn!(
                    "none of the injection effects could be created; injection disabled"
                );
                None
            }
            Err(err) => {
                tracing::warn!("injection disabled: {}", err);
                None
            }
        }
    }

    /// Supplies the depth view used by the compositor and depth-aware effects.
    ///
    /// The command sequences are re-recorded at the next present.
    pub fn use_depth_image(&mut self, view: vk::ImageView) {
        self.depth_view = Some(view);
        self.chain.use_depth_image(view);
        self.pending.request_rerecord();
    }

    pub fn depth_debug(&self) -> Option<DepthDebugInfo> {
        self.chain.depth_debug()
    }

    /// Moves the compositor threshold; the sequences are re-recorded at the
    /// next present since the threshold is a push constant.
    pub fn set_depth_threshold(&mut self, threshold: f32) {
        if self.chain.set_depth_threshold(threshold) {
            self.pending.request_rerecord();
        }
    }

    pub fn record_depth_samples(&mut self, samples: &[f32]) {
        self.chain.record_depth_samples(samples);
    }

    /// Records the injection work for `image_index` into the application's `cmd`.
    pub fn record_injection(&mut self, image_index: usize, cmd: vk::CommandBuffer) {
        if let Some(stage) = self.injection.as_mut() {
            if image_index < self.shadow_images.len() {
                stage.record(image_index, cmd);
            }
        }
    }

    /// Command buffer and signal semaphore to submit before presenting `image_index`.
    ///
    /// Applies pending reloads and re-recording first.
    pub fn prepare_present(
        &mut self,
        image_index: u32,
    ) -> Option<(vk::CommandBuffer, vk::Semaphore)> {
        let index = image_index as usize;
        if index >= self.real_images.len() {
            tracing::error!(
                "present of image {} on a swapchain with {}",
                index,
                self.real_images.len()
            );
            return None;
        }
        match self.pending.take() {
            (Some(config), _) => self.reload_effects(&config),
            (None, true) => {
                self.device.wait_idle();
                self.record_all();
            }
            (None, false) => {}
        }
        let cmd = match self.mode() {
            SequenceMode::WithEffects => self.effect_cmds[index],
            SequenceMode::WithoutEffects => self.passthrough_cmds[index],
        };
        Some((cmd, self.semaphores[index]))
    }

    fn record_all(&mut self) {
        let overlay = self.overlay.is_some();
        let with_effects = self.chain.plan(overlay);
        let without_effects = SequencePlan::without_effects(overlay);
        let effect_cmds = self.effect_cmds.clone();
        let passthrough_cmds = self.passthrough_cmds.clone();

        let recorded = self
            .record_sequence(&with_effects, &effect_cmds)
            .and_then(|()| self.record_sequence(&without_effects, &passthrough_cmds));
        match recorded {
            Ok(()) => {
                tracing::debug!("recorded sequences: {:?}", with_effects.steps());
            }
            Err(err) => {
                tracing::error!("failed to record present sequences: {}", err);
                self.effects_enabled = false;
                self.pending.request_rerecord();
            }
        }
    }

    fn record_sequence(&mut self, plan: &SequencePlan, cmds: &[vk::CommandBuffer]) -> Result<()> {
        let images = self.chain_images(plan.working_sets());
        let from = plan.final_set();
        let mut copy_out = TransferEffect::new(
            self.device.device.clone(),
            self.extent,
            images.sets[from].clone(),
            images.layout_of(from),
            self.real_images.clone(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        let device = self.device.device.clone();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        for (index, &cmd) in cmds.iter().enumerate() {
            unsafe { device.begin_command_buffer(cmd, &begin_info)? };
            for step in plan.steps() {
                match *step {
                    SequenceStep::AcquireShadow => unsafe {
                        record_transitions(
                            &device,
                            cmd,
                            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                            vk::PipelineStageFlags::ALL_COMMANDS,
                            &[(
                                self.shadow_images[index],
                                LayoutTransition {
                                    old_layout: SHADOW_PRESENT_LAYOUT,
                                    new_layout: SHADOW_PRESENT_LAYOUT,
                                    src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                                    dst_access: vk::AccessFlags::MEMORY_READ,
                                },
                            )],
                        );
                    },
                    SequenceStep::Effect(stage) => self.chain.apply_effect(stage, index, cmd),
                    SequenceStep::DepthComposite { .. } => self.chain.apply_compositor(index, cmd),
                    SequenceStep::CopyToPresent { .. } => copy_out.apply(index, cmd),
                    SequenceStep::Overlay => {
                        if let Some(overlay) = self.overlay.as_mut() {
                            overlay.record(index, self.real_images[index], self.extent, cmd);
                        }
                    }
                }
            }
            unsafe { device.end_command_buffer(cmd)? };
        }
        Ok(())
    }
}

impl Drop for SwapchainPipeline {
    fn drop(&mut self) {
        self.device.wait_idle();
        self.chain = EffectChain::empty();
        self.injection = None;
        self.stage_arena.release_all();
        self.base_arena.release_all();
        tracing::debug!("swapchain {:?} pipeline released", self.swapchain);
    }
}
