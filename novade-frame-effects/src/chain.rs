//! Ordered effect chains and the command sequences built from them.

use crate::config::LayerConfig;
use crate::effect::params::collect_effect_parameters;
use crate::effect::{
    DepthDebugInfo, Effect, EffectContext, EffectParam, EffectRegistry, STAGE_OUTPUT_LAYOUT,
};
use ash::vk;

/// Image sets a chain runs over.
///
/// `sets[0]` is the chain input, resting in `input_layout`; every later set is
/// a working set in [`STAGE_OUTPUT_LAYOUT`]. Effect `k` reads `sets[k]` and
/// writes `sets[k + 1]`.
#[derive(Debug, Clone)]
pub struct ChainImages {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub input_layout: vk::ImageLayout,
    pub sets: Vec<Vec<vk::Image>>,
}

impl ChainImages {
    pub fn layout_of(&self, set: usize) -> vk::ImageLayout {
        if set == 0 {
            self.input_layout
        } else {
            STAGE_OUTPUT_LAYOUT
        }
    }

    /// Number of effects the sets can hold.
    pub fn capacity(&self) -> usize {
        self.sets.len().saturating_sub(1)
    }
}

/// The effects of one chain, in order, and the parameters they expose.
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
    compositor: Option<Box<dyn Effect>>,
    parameters: Vec<EffectParam>,
}

impl std::fmt::Debug for EffectChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectChain")
            .field("effects", &self.effect_names())
            .field("compositor", &self.compositor.as_ref().map(|c| c.name().to_string()))
            .field("parameters", &self.parameters.len())
            .finish()
    }
}

impl EffectChain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Instantiates `names` in order over `images`.
    ///
    /// Unknown identifiers and failing constructors are skipped, as are names
    /// for which no working set is left; the next effect then takes the slot.
    pub fn build(
        registry: &EffectRegistry,
        config: &LayerConfig,
        names: &[String],
        images: &ChainImages,
    ) -> Self {
        let mut effects: Vec<Box<dyn Effect>> = Vec::with_capacity(names.len());
        let mut created = Vec::with_capacity(names.len());

        for name in names {
            let slot = effects.len();
            if slot >= images.capacity() {
                tracing::warn!("no working images left for effect '{}', skipping", name);
                continue;
            }
            let context = EffectContext {
                effect_name: name,
                format: images.format,
                extent: images.extent,
                input_images: &images.sets[slot],
                input_layout: images.layout_of(slot),
                output_images: &images.sets[slot + 1],
                config,
            };
            match registry.create(&context) {
                Ok(effect) => {
                    tracing::debug!("effect '{}' created in stage {}", name, slot);
                    effects.push(effect);
                    created.push(name.clone());
                }
                Err(err) => tracing::warn!("skipping effect '{}': {}", name, err),
            }
        }

        let parameters = collect_effect_parameters(config, &created, &effects);
        tracing::info!("effect chain built: [{}]", created.join(", "));
        Self {
            effects,
            compositor: None,
            parameters,
        }
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect_names(&self) -> Vec<&str> {
        self.effects.iter().map(|effect| effect.name()).collect()
    }

    pub fn parameters(&self) -> &[EffectParam] {
        &self.parameters
    }

    /// Installs the stage that runs after every effect of the chain.
    pub fn attach_compositor(&mut self, compositor: Box<dyn Effect>) {
        debug_assert!(compositor.capabilities().is_compositor);
        self.compositor = Some(compositor);
    }

    pub fn has_compositor(&self) -> bool {
        self.compositor.is_some()
    }

    pub fn compositor_mut(&mut self) -> Option<&mut (dyn Effect + 'static)> {
        self.compositor.as_deref_mut()
    }

    pub fn depth_debug(&self) -> Option<DepthDebugInfo> {
        self.compositor.as_ref().and_then(|compositor| compositor.depth_debug())
    }

    /// Returns whether a compositor took the threshold.
    pub fn set_depth_threshold(&mut self, threshold: f32) -> bool {
        self.compositor
            .as_mut()
            .map_or(false, |compositor| compositor.set_depth_threshold(threshold))
    }

    pub fn record_depth_samples(&mut self, samples: &[f32]) {
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.record_depth_samples(samples);
        }
    }

    /// Hands `view` to every stage that consumes depth.
    pub fn use_depth_image(&mut self, view: vk::ImageView) {
        for effect in self.effects.iter_mut().chain(self.compositor.iter_mut()) {
            if effect.capabilities().accepts_depth {
                effect.use_depth_image(view);
            }
        }
    }

    pub fn plan(&self, overlay: bool) -> SequencePlan {
        SequencePlan::with_effects(self.effects.len(), self.compositor.is_some(), overlay)
    }

    /// Records `effect` stage `index` for swapchain image `image_index`.
    pub fn apply_effect(&mut self, index: usize, image_index: usize, cmd: vk::CommandBuffer) {
        if let Some(effect) = self.effects.get_mut(index) {
            effect.apply(image_index, cmd);
        }
    }

    pub fn apply_compositor(&mut self, image_index: usize, cmd: vk::CommandBuffer) {
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.apply(image_index, cmd);
        }
    }
}

/// One step of a per-image command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStep {
    /// Make the application's writes to the shadow image visible to the layer.
    AcquireShadow,
    /// Run chain effect `k`: set `k` → set `k + 1`.
    Effect(usize),
    /// Blend the shadow image and `effected` into `output`.
    DepthComposite { effected: usize, output: usize },
    /// Copy `from` into the presentable image, leaving it in `PRESENT_SRC_KHR`.
    CopyToPresent { from: usize },
    Overlay,
}

/// The command sequence recorded for every swapchain image.
///
/// Set indices follow [`ChainImages`]: `0` is the shadow image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePlan {
    steps: Vec<SequenceStep>,
}

impl SequencePlan {
    /// Effects in order, the compositor after them, then the copy to the
    /// presentable image and the overlay.
    ///
    /// A compositor without effects has nothing to blend and is left out.
    pub fn with_effects(effect_count: usize, compositor: bool, overlay: bool) -> Self {
        let mut steps = vec![SequenceStep::AcquireShadow];
        steps.extend((0..effect_count).map(SequenceStep::Effect));
        let mut last = effect_count;
        if compositor && effect_count > 0 {
            steps.push(SequenceStep::DepthComposite {
                effected: last,
                output: last + 1,
            });
            last += 1;
        }
        steps.push(SequenceStep::CopyToPresent { from: last });
        if overlay {
            steps.push(SequenceStep::Overlay);
        }
        Self { steps }
    }

    /// Pass-through copy of the shadow image.
    pub fn without_effects(overlay: bool) -> Self {
        Self::with_effects(0, false, overlay)
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    /// Set the presentable image is copied from.
    pub fn final_set(&self) -> usize {
        self.steps
            .iter()
            .find_map(|step| match step {
                SequenceStep::CopyToPresent { from } => Some(*from),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Working sets (beyond the shadow set) the plan writes.
    pub fn working_sets(&self) -> usize {
        self.final_set()
    }
}

/// Working sets needed to run `effect_count` effects plus an optional compositor.
pub fn working_sets_for(effect_count: usize, compositor: bool) -> usize {
    effect_count + usize::from(compositor && effect_count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectCapabilities;
    use crate::error::{EffectsError, Result};
    use ash::vk::Handle;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: String,
        input: vk::Image,
        output: vk::Image,
        log: Log,
        depth: Option<vk::ImageView>,
        depth_aware: bool,
    }

    impl Effect for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> EffectCapabilities {
            EffectCapabilities {
                accepts_depth: self.depth_aware,
                is_compositor: false,
            }
        }

        fn apply(&mut self, image_index: usize, _cmd: vk::CommandBuffer) {
            self.log.lock().unwrap().push(format!(
                "{}[{}] {}->{}",
                self.name,
                image_index,
                self.input.as_raw(),
                self.output.as_raw()
            ));
        }

        fn use_depth_image(&mut self, view: vk::ImageView) {
            self.depth = Some(view);
            self.log.lock().unwrap().push(format!("{} depth", self.name));
        }

        fn parameters(&self) -> Vec<EffectParam> {
            vec![EffectParam {
                effect_name: self.name.clone(),
                name: "strength".into(),
                label: "Strength".into(),
                value: crate::effect::ParamValue::Float(1.0),
                default: crate::effect::ParamValue::Float(1.0),
                range: Some((0.0, 2.0)),
            }]
        }
    }

    #[derive(Default)]
    struct Compositor {
        debug: DepthDebugInfo,
    }

    impl Effect for Compositor {
        fn name(&self) -> &str {
            "depth_composite"
        }

        fn capabilities(&self) -> EffectCapabilities {
            EffectCapabilities {
                accepts_depth: true,
                is_compositor: true,
            }
        }

        fn apply(&mut self, _image_index: usize, _cmd: vk::CommandBuffer) {}

        fn depth_debug(&self) -> Option<DepthDebugInfo> {
            Some(self.debug)
        }

        fn set_depth_threshold(&mut self, threshold: f32) -> bool {
            self.debug.threshold = threshold;
            true
        }

        fn record_depth_samples(&mut self, samples: &[f32]) {
            self.debug.record_samples(samples);
        }
    }

    fn registry(log: &Log) -> EffectRegistry {
        let mut registry = EffectRegistry::new();
        for name in ["bloom", "grain", "fog"] {
            let log = log.clone();
            registry.register(name, move |ctx: &EffectContext<'_>| {
                Ok(Box::new(Recording {
                    name: ctx.effect_name.to_string(),
                    input: ctx.input_images[0],
                    output: ctx.output_images[0],
                    log: log.clone(),
                    depth: None,
                    depth_aware: ctx.effect_name == "fog",
                }) as Box<dyn Effect>)
            });
        }
        registry.register("broken", |ctx: &EffectContext<'_>| {
            Err(EffectsError::EffectCreation {
                name: ctx.effect_name.to_string(),
                reason: "no pipeline".into(),
            })
        });
        registry
    }

    fn images(sets: usize) -> ChainImages {
        ChainImages {
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent2D { width: 32, height: 32 },
            input_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            sets: (0..sets)
                .map(|set| vec![vk::Image::from_raw(100 + set as u64)])
                .collect(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn effects_chain_through_consecutive_sets() {
        let log = Log::default();
        let mut chain = EffectChain::build(
            &registry(&log),
            &LayerConfig::default(),
            &names(&["bloom", "grain"]),
            &images(3),
        );
        assert_eq!(chain.effect_names(), ["bloom", "grain"]);
        chain.apply_effect(0, 0, vk::CommandBuffer::null());
        chain.apply_effect(1, 0, vk::CommandBuffer::null());
        assert_eq!(*log.lock().unwrap(), ["bloom[0] 100->101", "grain[0] 101->102"]);
    }

    #[test]
    fn unknown_and_failing_effects_are_skipped() {
        let log = Log::default();
        let chain = EffectChain::build(
            &registry(&log),
            &LayerConfig::default(),
            &names(&["bloom", "vignette", "broken", "grain"]),
            &images(5),
        );
        assert_eq!(chain.effect_names(), ["bloom", "grain"]);
    }

    #[test]
    fn effects_beyond_the_working_sets_are_skipped() {
        let log = Log::default();
        let chain = EffectChain::build(
            &registry(&log),
            &LayerConfig::default(),
            &names(&["bloom", "grain", "fog"]),
            &images(2),
        );
        assert_eq!(chain.effect_names(), ["bloom"]);
    }

    #[test]
    fn reloading_replaces_the_parameter_set() {
        let log = Log::default();
        let mut registry = registry(&log);
        let cas_log = log.clone();
        registry.register("cas", move |ctx: &EffectContext<'_>| -> Result<Box<dyn Effect>> {
            Ok(Box::new(Recording {
                name: ctx.effect_name.to_string(),
                input: ctx.input_images[0],
                output: ctx.output_images[0],
                log: cas_log.clone(),
                depth: None,
                depth_aware: false,
            }))
        });
        let mut config = LayerConfig::default();
        config.params.insert("casSharpness".into(), toml::Value::Float(0.8));

        let first = EffectChain::build(&registry, &config, &names(&["cas", "bloom"]), &images(3));
        let first_keys: Vec<_> = first
            .parameters()
            .iter()
            .map(|p| format!("{}.{}", p.effect_name, p.name))
            .collect();
        assert_eq!(first_keys, ["cas.casSharpness", "bloom.strength"]);

        let second = EffectChain::build(&registry, &config, &names(&["grain"]), &images(3));
        let second_keys: Vec<_> = second
            .parameters()
            .iter()
            .map(|p| format!("{}.{}", p.effect_name, p.name))
            .collect();
        assert_eq!(second_keys, ["grain.strength"]);
    }

    #[test]
    fn depth_view_reaches_only_depth_aware_effects() {
        let log = Log::default();
        let mut chain = EffectChain::build(
            &registry(&log),
            &LayerConfig::default(),
            &names(&["bloom", "fog"]),
            &images(3),
        );
        chain.use_depth_image(vk::ImageView::from_raw(7));
        assert_eq!(*log.lock().unwrap(), ["fog depth"]);
    }

    #[test]
    fn plan_runs_compositor_last_and_overlay_after_the_copy() {
        let plan = SequencePlan::with_effects(2, true, true);
        assert_eq!(
            plan.steps(),
            [
                SequenceStep::AcquireShadow,
                SequenceStep::Effect(0),
                SequenceStep::Effect(1),
                SequenceStep::DepthComposite { effected: 2, output: 3 },
                SequenceStep::CopyToPresent { from: 3 },
                SequenceStep::Overlay,
            ]
        );
        assert_eq!(plan.working_sets(), working_sets_for(2, true));
    }

    #[test]
    fn pass_through_plan_copies_the_shadow_image() {
        let plan = SequencePlan::without_effects(false);
        assert_eq!(
            plan.steps(),
            [SequenceStep::AcquireShadow, SequenceStep::CopyToPresent { from: 0 }]
        );
        assert_eq!(plan.final_set(), 0);
    }

    #[test]
    fn compositor_without_effects_is_dropped_from_the_plan() {
        assert_eq!(
            SequencePlan::with_effects(0, true, false),
            SequencePlan::without_effects(false)
        );
        assert_eq!(working_sets_for(0, true), 0);
    }

    #[test]
    fn depth_diagnostics_belong_to_each_chain() {
        let mut first = EffectChain::empty();
        first.attach_compositor(Box::new(Compositor::default()));
        let mut second = EffectChain::empty();
        second.attach_compositor(Box::new(Compositor::default()));

        assert!(first.set_depth_threshold(0.5));
        first.record_depth_samples(&[0.25, 0.5, 0.75]);

        let first_info = first.depth_debug().unwrap();
        assert_eq!(first_info.threshold, 0.5);
        assert_eq!(first_info.sample_count, 3);
        assert_eq!(second.depth_debug(), Some(DepthDebugInfo::default()));

        let mut bare = EffectChain::empty();
        assert!(!bare.set_depth_threshold(0.5));
        bare.record_depth_samples(&[0.5]);
        assert_eq!(bare.depth_debug(), None);
    }
}
