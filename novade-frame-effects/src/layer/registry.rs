//! Process-wide state of the layer: configuration, live instances, devices
//! and swapchain pipelines, and the effect registrars of collaborators.

use crate::config::{ConfigLoader, LayerConfig};
use crate::device::LayerDevice;
use crate::effect::{DepthDebugInfo, EffectContext, EffectRegistry, TransferEffect};
use crate::logging::init_logging;
use crate::swapchain::SwapchainPipeline;
use ash::vk::{self, Handle};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Adds effect constructors for a newly created device.
pub type EffectRegistrar =
    Arc<dyn Fn(&Arc<ash::Device>, &mut EffectRegistry) + Send + Sync>;

pub struct LayerInstance {
    pub handle: vk::Instance,
    pub instance: ash::Instance,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
}

struct SwapchainEntry {
    device_key: usize,
    pipeline: Arc<Mutex<SwapchainPipeline>>,
}

static CONFIG: Lazy<Mutex<Arc<LayerConfig>>> =
    Lazy::new(|| Mutex::new(Arc::new(load_initial_config())));
static INSTANCES: Lazy<Mutex<HashMap<usize, Arc<LayerInstance>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static DEVICES: Lazy<Mutex<HashMap<usize, Arc<LayerDevice>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static SWAPCHAINS: Lazy<Mutex<HashMap<u64, SwapchainEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static EFFECT_REGISTRARS: Lazy<Mutex<Vec<EffectRegistrar>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn load_initial_config() -> LayerConfig {
    let loaded = ConfigLoader::load();
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => LayerConfig::default(),
    };
    init_logging(&config.logging);
    match loaded {
        Ok(_) => tracing::info!(
            "configuration loaded: effects [{}], injection {}",
            config.active_effects().join(", "),
            if config.injection.enabled { "on" } else { "off" }
        ),
        Err(err) => tracing::warn!("configuration not loaded, using defaults: {}", err),
    }
    config
}

/// The configuration new swapchains are built with. Loaded on first use.
pub fn config() -> Arc<LayerConfig> {
    lock(&CONFIG).clone()
}

/// Replaces the configuration. Every live swapchain rebuilds its chain at its
/// next present, on the thread that presents.
pub fn apply_config(config: LayerConfig) {
    let config = Arc::new(config);
    *lock(&CONFIG) = config.clone();
    for_each_swapchain(|pipeline| pipeline.request_reload(config.clone()));
    tracing::debug!("configuration applied; swapchains rebuild at their next present");
}

/// Re-reads the configuration file and applies it.
///
/// A missing or invalid file keeps the current configuration.
pub fn reload_config() {
    match ConfigLoader::load() {
        Ok(config) => apply_config(config),
        Err(err) => {
            tracing::warn!("configuration reload failed, keeping the current one: {}", err)
        }
    }
}

/// Registers constructors for every device created from now on.
pub fn register_effects<F>(registrar: F)
where
    F: Fn(&Arc<ash::Device>, &mut EffectRegistry) + Send + Sync + 'static,
{
    lock(&EFFECT_REGISTRARS).push(Arc::new(registrar));
}

/// Registry for a new device: the built-in `copy` effect plus every registrar.
pub fn build_effect_registry(device: &Arc<ash::Device>) -> EffectRegistry {
    let mut registry = EffectRegistry::new();
    let copy_device = device.clone();
    registry.register("copy", move |ctx: &EffectContext<'_>| {
        Ok(Box::new(TransferEffect::new(
            copy_device.clone(),
            ctx.extent,
            ctx.input_images.to_vec(),
            ctx.input_layout,
            ctx.output_images.to_vec(),
            crate::effect::STAGE_OUTPUT_LAYOUT,
        )) as Box<dyn crate::effect::Effect>)
    });
    let registrars: Vec<EffectRegistrar> = lock(&EFFECT_REGISTRARS).clone();
    for registrar in registrars {
        registrar(device, &mut registry);
    }
    registry
}

pub fn insert_instance(key: usize, instance: LayerInstance) {
    lock(&INSTANCES).insert(key, Arc::new(instance));
}

pub fn instance(key: usize) -> Option<Arc<LayerInstance>> {
    lock(&INSTANCES).get(&key).cloned()
}

pub fn remove_instance(key: usize) -> Option<Arc<LayerInstance>> {
    lock(&INSTANCES).remove(&key)
}

pub fn insert_device(key: usize, device: LayerDevice) {
    lock(&DEVICES).insert(key, Arc::new(device));
}

pub fn device(key: usize) -> Option<Arc<LayerDevice>> {
    lock(&DEVICES).get(&key).cloned()
}

/// Removes the device and every swapchain pipeline created on it.
pub fn remove_device(key: usize) -> Option<Arc<LayerDevice>> {
    let pipelines: Vec<SwapchainEntry> = {
        let mut swapchains = lock(&SWAPCHAINS);
        let handles: Vec<u64> = swapchains
            .iter()
            .filter(|(_, entry)| entry.device_key == key)
            .map(|(handle, _)| *handle)
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| swapchains.remove(&handle))
            .collect()
    };
    if !pipelines.is_empty() {
        tracing::warn!("device destroyed with {} live swapchains", pipelines.len());
    }
    drop(pipelines);
    lock(&DEVICES).remove(&key)
}

pub fn insert_swapchain(
    device_key: usize,
    swapchain: vk::SwapchainKHR,
    pipeline: SwapchainPipeline,
) {
    lock(&SWAPCHAINS).insert(
        swapchain.as_raw(),
        SwapchainEntry {
            device_key,
            pipeline: Arc::new(Mutex::new(pipeline)),
        },
    );
}

/// The effect pipeline of `swapchain`, if the layer runs one for it.
pub fn swapchain(swapchain: vk::SwapchainKHR) -> Option<Arc<Mutex<SwapchainPipeline>>> {
    lock(&SWAPCHAINS)
        .get(&swapchain.as_raw())
        .map(|entry| entry.pipeline.clone())
}

pub fn remove_swapchain(swapchain: vk::SwapchainKHR) -> Option<Arc<Mutex<SwapchainPipeline>>> {
    lock(&SWAPCHAINS)
        .remove(&swapchain.as_raw())
        .map(|entry| entry.pipeline)
}

/// Runs `f` on every live swapchain pipeline, outside the registry lock.
pub fn for_each_swapchain(mut f: impl FnMut(&mut SwapchainPipeline)) {
    let pipelines: Vec<_> = lock(&SWAPCHAINS)
        .values()
        .map(|entry| entry.pipeline.clone())
        .collect();
    for pipeline in pipelines {
        f(&mut lock(&pipeline));
    }
}

/// Toggles between the effect and pass-through sequences on every swapchain.
pub fn set_effects_enabled(enabled: bool) {
    for_each_swapchain(|pipeline| pipeline.set_effects_enabled(enabled));
}

/// Hands a depth view to every swapchain pipeline of `device`.
pub fn use_depth_image(device: vk::Device, view: vk::ImageView) {
    // SAFETY: callers pass a live device handle.
    let key = unsafe { super::loader::dispatch_key(device) };
    let pipelines: Vec<_> = lock(&SWAPCHAINS)
        .values()
        .filter(|entry| entry.device_key == key)
        .map(|entry| entry.pipeline.clone())
        .collect();
    for pipeline in pipelines {
        lock(&pipeline).use_depth_image(view);
    }
}

/// Diagnostics of the depth compositor of `swapchain`, if it runs one.
pub fn depth_debug(swapchain: vk::SwapchainKHR) -> Option<DepthDebugInfo> {
    self::swapchain(swapchain).and_then(|pipeline| lock(&pipeline).depth_debug())
}

/// Moves the depth threshold of every compositor; applied from the next present.
pub fn set_depth_threshold(threshold: f32) {
    if !threshold.is_finite() {
        tracing::warn!("ignoring non-finite depth threshold {}", threshold);
        return;
    }
    let threshold = threshold.clamp(0.0, 1.0);
    for_each_swapchain(|pipeline| pipeline.set_depth_threshold(threshold));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisoned_locks_are_recovered() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }

    #[test]
    fn unknown_handles_are_absent() {
        assert!(instance(0x1234).is_none());
        assert!(device(0x1234).is_none());
        assert!(swapchain(vk::SwapchainKHR::from_raw(0x1234)).is_none());
        assert!(remove_device(0x1234).is_none());
    }

    #[test]
    fn applied_config_is_served_to_new_swapchains() {
        let config = LayerConfig {
            effects: vec!["copy".to_string()],
            ..LayerConfig::default()
        };
        apply_config(config.clone());
        assert_eq!(*super::config(), config);
        assert!(depth_debug(vk::SwapchainKHR::from_raw(0x1234)).is_none());
    }
}
