//! The Vulkan layer surface: loader negotiation, process-wide registries and
//! the intercepted entry points.
//!
//! The loader resolves the two exported functions below through the layer
//! manifest; every other hook is handed out by them.

pub mod hooks;
pub mod loader;
pub mod registry;

use ash::vk;
use std::os::raw::c_char;

pub use registry::{
    apply_config, config, depth_debug, register_effects, reload_config, set_depth_threshold,
    set_effects_enabled, use_depth_image, EffectRegistrar,
};

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn novade_frame_effects_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    hooks::get_instance_proc_addr(instance, p_name)
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn novade_frame_effects_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    hooks::get_device_proc_addr(device, p_name)
}
