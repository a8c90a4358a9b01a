//! Locating, reading and validating the layer configuration.
//!
//! The file is looked up in this order:
//! 1. the path in `NOVADE_EFFECTS_CONFIG`,
//! 2. `$XDG_CONFIG_HOME/novade/frame-effects.toml`,
//! 3. `$HOME/.config/novade/frame-effects.toml`.
//!
//! A missing file is not an error: the default configuration (an empty chain)
//! is a normal state for the layer.

use super::types::LayerConfig;
use crate::error::ConfigError;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "NOVADE_EFFECTS_CONFIG";
const CONFIG_FILE_NAME: &str = "frame-effects.toml";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Namespace for configuration loading.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the first candidate location.
    ///
    /// Returns the default configuration when no file exists.
    pub fn load() -> Result<LayerConfig, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Ok(LayerConfig::default()),
        }
    }

    /// Reads, parses and validates one configuration file.
    pub fn load_from_path(path: &Path) -> Result<LayerConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<LayerConfig, ConfigError> {
        let mut config: LayerConfig = if content.trim().is_empty() {
            LayerConfig::default()
        } else {
            toml::from_str(content)?
        };
        Self::validate_config(&mut config)?;
        Ok(config)
    }

    /// Resolves the configuration path without touching the filesystem.
    pub fn config_path() -> Option<PathBuf> {
        if let Some(explicit) = env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(explicit));
        }
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(xdg).join("novade").join(CONFIG_FILE_NAME));
        }
        env::var_os("HOME")
            .filter(|v| !v.is_empty())
            .map(|home| PathBuf::from(home).join(".config").join("novade").join(CONFIG_FILE_NAME))
    }

    /// Normalises values in place; rejects what cannot be normalised.
    fn validate_config(config: &mut LayerConfig) -> Result<(), ConfigError> {
        let level = config.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "invalid log level '{}', expected one of {:?}",
                config.logging.level, VALID_LOG_LEVELS
            )));
        }
        config.logging.level = level;

        if !config.depth.threshold.is_finite() {
            return Err(ConfigError::ValidationError(
                "depth.threshold must be a finite number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&config.depth.threshold) {
            tracing::warn!(
                "depth.threshold {} is outside [0, 1], clamping",
                config.depth.threshold
            );
            config.depth.threshold = config.depth.threshold.clamp(0.0, 1.0);
        }

        config.effects.retain(|name| !name.trim().is_empty());
        config.injection.effects.retain(|name| !name.trim().is_empty());
        if config.injection.enabled && config.injection.effects.is_empty() {
            tracing::warn!("injection is enabled without injection effects, disabling it");
            config.injection.enabled = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_content_yields_default_config() {
        let config = ConfigLoader::load_from_str("   \n").unwrap();
        assert_eq!(config, LayerConfig::default());
        assert!(config.active_effects().is_empty());
    }

    #[test]
    fn parses_full_config() {
        let config = ConfigLoader::load_from_str(
            r#"
            effects = ["cas", "smaa", "deband"]
            disabled_effects = ["smaa"]
            shader_dir = "/opt/shaders"

            [params]
            casSharpness = 0.6
            "smaa.smaaMaxSearchSteps" = 48

            [depth]
            composite = true
            threshold = 0.5

            [injection]
            enabled = true
            pass_index = 3
            effects = ["cas"]

            [logging]
            level = "DEBUG"
            "#,
        )
        .unwrap();

        assert_eq!(config.active_effects(), vec!["cas".to_string(), "deband".to_string()]);
        assert_eq!(config.param_f32("cas", "casSharpness"), Some(0.6));
        assert_eq!(config.param_i32("smaa", "smaaMaxSearchSteps"), Some(48));
        assert!(config.depth.composite);
        assert_eq!(config.depth.threshold, 0.5);
        assert_eq!(config.injection.pass_index, 3);
        assert!(config.injection.enabled);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.shader_dir, Some(PathBuf::from("/opt/shaders")));
    }

    #[test]
    fn qualified_param_key_wins_over_bare_key() {
        let config = ConfigLoader::load_from_str(
            r#"
            [params]
            sharpness = 0.1
            "cas.sharpness" = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.param_f32("cas", "sharpness"), Some(0.9));
        assert_eq!(config.param_f32("dls", "sharpness"), Some(0.1));
    }

    #[test]
    fn out_of_range_threshold_is_clamped() {
        let config = ConfigLoader::load_from_str("[depth]\nthreshold = 4.0\n").unwrap();
        assert_eq!(config.depth.threshold, 1.0);
    }

    #[test]
    fn injection_without_effects_is_disabled() {
        let config =
            ConfigLoader::load_from_str("[injection]\nenabled = true\npass_index = 2\n").unwrap();
        assert!(!config.injection.enabled);
        assert_eq!(config.injection.pass_index, 2);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = ConfigLoader::load_from_str("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ConfigLoader::load_from_str("effects = [cas").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "effects = [\"fxaa\"]").unwrap();
        let config = ConfigLoader::load_from_path(file.path()).unwrap();
        assert_eq!(config.effects, vec!["fxaa".to_string()]);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
