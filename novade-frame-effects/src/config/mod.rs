//! Layer configuration.
//!
//! - [`types`]: the [`LayerConfig`] schema.
//! - [`defaults`]: default values used by `serde` when keys are missing.
//! - [`loader`]: [`ConfigLoader`], which finds and validates the TOML file.
//!
//! The configuration is consumed when a swapchain pipeline is created and
//! whenever its effects are reloaded.

mod defaults;
pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{DepthConfig, InjectionConfig, LayerConfig, LoggingConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_runs_nothing() {
        let config = LayerConfig::default();
        assert!(config.effects.is_empty());
        assert!(!config.depth.composite);
        assert!(!config.injection.enabled);
        assert!(config.enable_on_launch);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_take_defaults() {
        let config: LayerConfig = toml::from_str("[depth]\ncomposite = true\n").unwrap();
        assert!(config.depth.composite);
        assert_eq!(config.depth.threshold, 1.0);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn shader_paths_fall_back_to_install_dir() {
        let mut config = LayerConfig::default();
        assert!(config
            .shader_path("depth_composite.frag.spv")
            .starts_with("/usr/share/novade/frame-effects/shaders"));
        config.shader_dir = Some("/tmp/shaders".into());
        assert_eq!(
            config.shader_path("depth_composite.frag.spv"),
            std::path::PathBuf::from("/tmp/shaders/depth_composite.frag.spv")
        );
    }
}
