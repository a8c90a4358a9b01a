//! Lookup of effect constructors by identifier.
//!
//! Effect kernels live outside this crate; they register a constructor under
//! the identifier used in the configuration's `effects` list.

use super::{Effect, EffectContext};
use crate::error::{EffectsError, Result};
use std::collections::BTreeMap;
use std::fmt;

pub type EffectConstructor =
    Box<dyn Fn(&EffectContext<'_>) -> Result<Box<dyn Effect>> + Send + Sync>;

#[derive(Default)]
pub struct EffectRegistry {
    constructors: BTreeMap<String, EffectConstructor>,
}

impl fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("effects", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `name`, replacing an earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&EffectContext<'_>) -> Result<Box<dyn Effect>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.insert(name.clone(), Box::new(constructor)).is_some() {
            tracing::debug!("effect '{}' re-registered", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(&self, context: &EffectContext<'_>) -> Result<Box<dyn Effect>> {
        let constructor = self
            .constructors
            .get(context.effect_name)
            .ok_or_else(|| EffectsError::UnknownEffect(context.effect_name.to_string()))?;
        constructor(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerConfig;
    use ash::vk;

    struct Noop(String);

    impl Effect for Noop {
        fn name(&self) -> &str {
            &self.0
        }

        fn apply(&mut self, _image_index: usize, _cmd: vk::CommandBuffer) {}
    }

    fn context<'a>(name: &'a str, config: &'a LayerConfig) -> EffectContext<'a> {
        EffectContext {
            effect_name: name,
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent2D { width: 64, height: 64 },
            input_images: &[],
            input_layout: vk::ImageLayout::GENERAL,
            output_images: &[],
            config,
        }
    }

    #[test]
    fn creates_registered_effects_by_name() {
        let mut registry = EffectRegistry::new();
        registry.register("noop", |ctx: &EffectContext<'_>| {
            Ok(Box::new(Noop(ctx.effect_name.to_string())) as Box<dyn Effect>)
        });
        let config = LayerConfig::default();
        let effect = registry.create(&context("noop", &config)).unwrap();
        assert_eq!(effect.name(), "noop");
        assert!(registry.contains("noop"));
        assert_eq!(registry.names().collect::<Vec<_>>(), ["noop"]);
    }

    #[test]
    fn unknown_names_are_an_error() {
        let registry = EffectRegistry::new();
        let config = LayerConfig::default();
        let err = registry.create(&context("bloom", &config)).err().unwrap();
        assert!(matches!(err, EffectsError::UnknownEffect(name) if name == "bloom"));
    }
}
