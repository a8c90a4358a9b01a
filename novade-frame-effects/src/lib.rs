//! NovaDE frame effects: a Vulkan implicit layer that runs a chain of
//! post-processing effects over an application's frames.
//!
//! The application renders into shadow images owned by the layer. At present
//! time the layer runs the configured [`EffectChain`] over them and copies the
//! result into the real swapchain image. Effects can also be injected right
//! after a chosen render pass, before UI passes are drawn.
//!
//! Collaborators (effect implementations, overlays) plug in through
//! [`register_effects`], [`OverlayHook`] and [`apply_config`].

pub mod chain;
pub mod config;
pub mod device;
pub mod effect;
pub mod error;
pub mod injection;
pub mod layer;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod resources;
pub mod swapchain;
pub mod tracker;
pub mod utils;

pub use chain::{EffectChain, SequencePlan, SequenceStep};
pub use config::{ConfigLoader, LayerConfig};
pub use effect::{
    DepthDebugInfo, Effect, EffectCapabilities, EffectContext, EffectParam, EffectRegistry,
    ParamValue,
};
pub use error::{ConfigError, EffectsError, Result};
pub use layer::{
    apply_config, depth_debug, register_effects, reload_config, set_depth_threshold,
    set_effects_enabled, use_depth_image,
};
pub use swapchain::{OverlayHook, PendingWork, SequenceMode, SwapchainPipeline};
pub use tracker::{InjectionStatus, RenderPassTracker};
