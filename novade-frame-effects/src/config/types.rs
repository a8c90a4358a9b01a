//! Configuration schema of the frame-effects layer.
//!
//! ```toml
//! effects = ["cas", "smaa"]
//! disabled_effects = ["smaa"]
//! shader_dir = "/usr/share/novade/frame-effects/shaders"
//!
//! [params]
//! casSharpness = 0.6
//! "smaa.smaaMaxSearchSteps" = 48
//!
//! [depth]
//! composite = true
//! threshold = 0.999
//!
//! [injection]
//! enabled = true
//! pass_index = 3
//! effects = ["cas"]
//! ```

use super::defaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration of the layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Ordered effect identifiers of the present-time chain.
    #[serde(default)]
    pub effects: Vec<String>,

    /// Identifiers kept in `effects` (for ordering and persistence) but not run.
    #[serde(default)]
    pub disabled_effects: Vec<String>,

    /// Parameter overrides, keyed either `name` or `effect.name`.
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,

    #[serde(default = "defaults::default_depth_config")]
    pub depth: DepthConfig,

    #[serde(default = "defaults::default_injection_config")]
    pub injection: InjectionConfig,

    /// Directory holding the compiled SPIR-V of the built-in stages.
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,

    /// Whether the effect sequence is submitted from the first frame on.
    #[serde(default = "defaults::default_true")]
    pub enable_on_launch: bool,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            effects: Vec::new(),
            disabled_effects: Vec::new(),
            params: BTreeMap::new(),
            depth: defaults::default_depth_config(),
            injection: defaults::default_injection_config(),
            shader_dir: None,
            enable_on_launch: true,
            logging: defaults::default_logging_config(),
        }
    }
}

impl LayerConfig {
    /// Effects of the present-time chain, in order, minus the disabled ones.
    pub fn active_effects(&self) -> Vec<String> {
        self.effects
            .iter()
            .filter(|name| !self.disabled_effects.contains(name))
            .cloned()
            .collect()
    }

    /// Looks up a parameter override, preferring the qualified `effect.name` key.
    pub fn param(&self, effect_name: &str, name: &str) -> Option<&toml::Value> {
        self.params
            .get(&format!("{effect_name}.{name}"))
            .or_else(|| self.params.get(name))
    }

    /// The configured shader directory, or the install location.
    pub fn resolved_shader_dir(&self) -> PathBuf {
        self.shader_dir.clone().unwrap_or_else(defaults::default_shader_dir)
    }

    pub fn shader_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.resolved_shader_dir().join(file_name)
    }

    pub fn param_f32(&self, effect_name: &str, name: &str) -> Option<f32> {
        match self.param(effect_name, name)? {
            toml::Value::Float(v) => Some(*v as f32),
            toml::Value::Integer(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn param_i32(&self, effect_name: &str, name: &str) -> Option<i32> {
        match self.param(effect_name, name)? {
            toml::Value::Integer(v) => i32::try_from(*v).ok(),
            toml::Value::Float(v) => Some(v.round() as i32),
            _ => None,
        }
    }

    pub fn param_bool(&self, effect_name: &str, name: &str) -> Option<bool> {
        match self.param(effect_name, name)? {
            toml::Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn param_str(&self, effect_name: &str, name: &str) -> Option<&str> {
        self.param(effect_name, name)?.as_str()
    }
}

/// Depth-aware compositing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthConfig {
    /// Append the depth composite stage to the chain.
    #[serde(default)]
    pub composite: bool,

    #[serde(default = "defaults::default_depth_threshold")]
    pub threshold: f32,
}

/// Mid-frame injection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Sequence index of the render pass after which the injection effects run.
    #[serde(default)]
    pub pass_index: u32,

    /// Effects run at the injection point.
    #[serde(default)]
    pub effects: Vec<String>,
}

/// Logging settings. `NOVADE_EFFECTS_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    /// Optional log file; console output goes to stderr either way.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        defaults::default_logging_config()
    }
}
