//! Default configuration values.
//!
//! Used by `serde`'s `default` attributes in [`super::types`] so that a partial
//! configuration file still yields a complete [`super::LayerConfig`].

use super::types::{DepthConfig, InjectionConfig, LoggingConfig};
use std::path::PathBuf;

/// Default log level (`"info"`).
pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file_path: None,
    }
}

/// Pixels at or beyond this depth keep their pre-effect color.
///
/// `1.0` is the far plane of a conventional depth range, which is where most
/// engines leave the HUD.
pub(super) fn default_depth_threshold() -> f32 {
    1.0
}

pub(super) fn default_depth_config() -> DepthConfig {
    DepthConfig {
        composite: false,
        threshold: default_depth_threshold(),
    }
}

pub(super) fn default_injection_config() -> InjectionConfig {
    InjectionConfig {
        enabled: false,
        pass_index: 0,
        effects: Vec::new(),
    }
}

pub(super) fn default_true() -> bool {
    true
}

/// Install location of the compiled built-in shaders.
pub(super) fn default_shader_dir() -> PathBuf {
    PathBuf::from("/usr/share/novade/frame-effects/shaders")
}
