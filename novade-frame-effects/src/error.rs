//! Error types for the frame-effects layer.
//!
//! Library code returns [`EffectsError`]; the layer entry points log these and
//! degrade the affected feature instead of failing the host's call.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or running the effect pipeline of a swapchain.
#[derive(Debug, Error)]
pub enum EffectsError {
    /// A raw Vulkan call failed.
    #[error("Vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    /// No memory type satisfies the requirements of an image allocation.
    #[error("No memory type matches type bits {type_bits:#x} with flags {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// A SPIR-V module could not be read from disk.
    #[error("Failed to read shader {path:?}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An effect identifier has no registered constructor.
    #[error("Unknown effect '{0}'")]
    UnknownEffect(String),

    /// An effect constructor reported a failure of its own.
    #[error("Effect '{name}' could not be created: {reason}")]
    EffectCreation { name: String, reason: String },

    /// `vkCreateGraphicsPipelines` returned without a pipeline.
    #[error("Graphics pipeline creation returned no pipeline")]
    EmptyPipelineResult,
}

/// Errors raised while locating, reading or validating the layer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file from {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, EffectsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_result_converts_into_effects_error() {
        let err: EffectsError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(err, EffectsError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)));
        assert!(err.to_string().contains("Vulkan call failed"));
    }

    #[test]
    fn unknown_effect_names_the_identifier() {
        let err = EffectsError::UnknownEffect("vignette".to_string());
        assert_eq!(err.to_string(), "Unknown effect 'vignette'");
    }
}
