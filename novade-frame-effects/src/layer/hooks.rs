//! The intercepted Vulkan entry points.
//!
//! Each hook has the exact signature of the function it replaces, performs
//! its side effects and delegates to the next layer. Return values are passed
//! through unmodified.

use super::loader::{dispatch_key, take_device_link, take_instance_link};
use super::registry::{self, lock, LayerInstance};
use crate::device::LayerDevice;
use crate::injection::{self, InjectionDecision};
use crate::swapchain::SwapchainPipeline;
use crate::tracker::{FramebufferInfo, PassBegin};
use ash::vk::{self, Handle};
use std::ffi::CStr;
use std::os::raw::c_char;

macro_rules! hook {
    ($f:expr, $pfn:ty) => {
        Some(std::mem::transmute::<$pfn, unsafe extern "system" fn()>($f))
    };
}

fn name_ptr(name: &'static [u8]) -> *const c_char {
    debug_assert_eq!(name.last(), Some(&0));
    name.as_ptr() as *const c_char
}

/// Hooks resolvable through `vkGetDeviceProcAddr`.
unsafe fn device_hook(name: &CStr) -> vk::PFN_vkVoidFunction {
    match name.to_bytes() {
        b"vkGetDeviceProcAddr" => hook!(get_device_proc_addr, vk::PFN_vkGetDeviceProcAddr),
        b"vkDestroyDevice" => hook!(destroy_device, vk::PFN_vkDestroyDevice),
        b"vkCreateSwapchainKHR" => hook!(create_swapchain_khr, vk::PFN_vkCreateSwapchainKHR),
        b"vkGetSwapchainImagesKHR" => {
            hook!(get_swapchain_images_khr, vk::PFN_vkGetSwapchainImagesKHR)
        }
        b"vkAcquireNextImageKHR" => hook!(acquire_next_image_khr, vk::PFN_vkAcquireNextImageKHR),
        b"vkQueuePresentKHR" => hook!(queue_present_khr, vk::PFN_vkQueuePresentKHR),
        b"vkDestroySwapchainKHR" => hook!(destroy_swapchain_khr, vk::PFN_vkDestroySwapchainKHR),
        b"vkCmdBeginRenderPass" => hook!(cmd_begin_render_pass, vk::PFN_vkCmdBeginRenderPass),
        b"vkCmdEndRenderPass" => hook!(cmd_end_render_pass, vk::PFN_vkCmdEndRenderPass),
        b"vkCreateFramebuffer" => hook!(create_framebuffer, vk::PFN_vkCreateFramebuffer),
        b"vkDestroyFramebuffer" => hook!(destroy_framebuffer, vk::PFN_vkDestroyFramebuffer),
        _ => None,
    }
}

unsafe fn instance_hook(name: &CStr) -> vk::PFN_vkVoidFunction {
    match name.to_bytes() {
        b"vkGetInstanceProcAddr" => hook!(get_instance_proc_addr, vk::PFN_vkGetInstanceProcAddr),
        b"vkCreateInstance" => hook!(create_instance, vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => hook!(destroy_instance, vk::PFN_vkDestroyInstance),
        b"vkCreateDevice" => hook!(create_device, vk::PFN_vkCreateDevice),
        _ => device_hook(name),
    }
}

pub unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let hooked = instance_hook(CStr::from_ptr(p_name));
    if hooked.is_some() {
        return hooked;
    }
    if instance == vk::Instance::null() {
        return None;
    }
    registry::instance(dispatch_key(instance))
        .and_then(|layer_instance| (layer_instance.next_get_instance_proc_addr)(instance, p_name))
}

pub unsafe extern "system" fn get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() || device == vk::Device::null() {
        return None;
    }
    let layer_device = registry::device(dispatch_key(device))?;
    let hooked = device_hook(CStr::from_ptr(p_name));
    if hooked.is_some() {
        return hooked;
    }
    (layer_device.next_get_device_proc_addr)(device, p_name)
}

unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    // Loads the configuration and installs logging on first use.
    let _ = registry::config();

    let Some(chain) = take_instance_link(p_create_info) else {
        tracing::error!("vkCreateInstance: loader link info missing");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let next_get_instance_proc_addr = chain.next_get_instance_proc_addr;
    let Some(next_create) =
        next_get_instance_proc_addr(vk::Instance::null(), name_ptr(b"vkCreateInstance\0"))
    else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let next_create: vk::PFN_vkCreateInstance = std::mem::transmute(next_create);

    let result = next_create(p_create_info, p_allocator, p_instance);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let handle = *p_instance;
    let instance = ash::Instance::load(
        &vk::StaticFn {
            get_instance_proc_addr: next_get_instance_proc_addr,
        },
        handle,
    );
    registry::insert_instance(
        dispatch_key(handle),
        LayerInstance {
            handle,
            instance,
            next_get_instance_proc_addr,
        },
    );
    tracing::debug!("instance {:#x} created", handle.as_raw());
    result
}

unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let Some(layer_instance) = registry::remove_instance(dispatch_key(instance)) else {
        return;
    };
    (layer_instance.instance.fp_v1_0().destroy_instance)(instance, p_allocator);
    tracing::debug!("instance {:#x} destroyed", instance.as_raw());
}

unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    let Some(chain) = take_device_link(p_create_info) else {
        tracing::error!("vkCreateDevice: loader link info missing");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    // Physical devices share their instance's dispatch table.
    let Some(layer_instance) = registry::instance(dispatch_key(physical_device)) else {
        tracing::error!("vkCreateDevice: physical device of an unknown instance");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(next_create) =
        (chain.next_get_instance_proc_addr)(layer_instance.handle, name_ptr(b"vkCreateDevice\0"))
    else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let next_create: vk::PFN_vkCreateDevice = std::mem::transmute(next_create);

    let result = next_create(physical_device, p_create_info, p_allocator, p_device);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let handle = *p_device;
    let create_info = &*p_create_info;
    let requested_families: Vec<u32> = if create_info.queue_create_info_count == 0 {
        Vec::new()
    } else {
        let count = create_info.queue_create_info_count as usize;
        std::slice::from_raw_parts(create_info.p_queue_create_infos, count)
            .iter()
            .map(|info| info.queue_family_index)
            .collect()
    };

    let mut layer_device = LayerDevice::new(
        &layer_instance.instance,
        physical_device,
        handle,
        chain.next_get_device_proc_addr,
        chain.set_device_loader_data,
        &requested_families,
    );
    layer_device.registry = registry::build_effect_registry(&layer_device.device);
    tracing::debug!(
        "device {:#x} created, effects available: [{}]",
        handle.as_raw(),
        layer_device.registry.names().collect::<Vec<_>>().join(", ")
    );
    registry::insert_device(dispatch_key(handle), layer_device);
    result
}

unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if device == vk::Device::null() {
        return;
    }
    let Some(layer_device) = registry::remove_device(dispatch_key(device)) else {
        return;
    };
    let next_destroy = layer_device.device.fp_v1_0().destroy_device;
    // Last reference: releases the command pool while the device is alive.
    drop(layer_device);
    next_destroy(device, p_allocator);
    tracing::debug!("device {:#x} destroyed", device.as_raw());
}

/// Two-call enumeration into `p_items`, as `vkGetSwapchainImagesKHR` specifies.
pub(crate) unsafe fn write_enumeration<T: Copy>(
    items: &[T],
    p_count: *mut u32,
    p_items: *mut T,
) -> vk::Result {
    if p_items.is_null() {
        *p_count = items.len() as u32;
        return vk::Result::SUCCESS;
    }
    let written = (*p_count as usize).min(items.len());
    std::ptr::copy_nonoverlapping(items.as_ptr(), p_items, written);
    *p_count = written as u32;
    if written < items.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

unsafe fn real_swapchain_images(
    layer_device: &LayerDevice,
    swapchain: vk::SwapchainKHR,
) -> Option<Vec<vk::Image>> {
    let get_images = layer_device.swapchain_fn.get_swapchain_images_khr;
    let device = layer_device.handle;
    let mut count = 0u32;
    if get_images(device, swapchain, &mut count, std::ptr::null_mut()) != vk::Result::SUCCESS {
        return None;
    }
    let mut images = vec![vk::Image::null(); count as usize];
    if get_images(device, swapchain, &mut count, images.as_mut_ptr()) != vk::Result::SUCCESS {
        return None;
    }
    images.truncate(count as usize);
    Some(images)
}

unsafe extern "system" fn create_swapchain_khr(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let device_key = dispatch_key(device);
    let Some(layer_device) = registry::device(device_key) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    // The layer writes the presentable images with a transfer.
    let mut create_info = *p_create_info;
    create_info.image_usage |= vk::ImageUsageFlags::TRANSFER_DST;
    let result = (layer_device.swapchain_fn.create_swapchain_khr)(
        device,
        &create_info,
        p_allocator,
        p_swapchain,
    );
    if result != vk::Result::SUCCESS || !layer_device.can_record() {
        return result;
    }

    let swapchain = *p_swapchain;
    let Some(real_images) = real_swapchain_images(&layer_device, swapchain) else {
        tracing::warn!(
            "swapchain {:#x}: images not retrievable, running without effects",
            swapchain.as_raw()
        );
        return result;
    };
    let config = registry::config();
    match SwapchainPipeline::new(
        layer_device.clone(),
        swapchain,
        create_info.image_format,
        create_info.image_extent,
        real_images,
        (*p_create_info).image_usage,
        &config,
    ) {
        Ok(pipeline) => registry::insert_swapchain(device_key, swapchain, pipeline),
        Err(err) => {
            tracing::warn!("swapchain {:#x} runs without effects: {}", swapchain.as_raw(), err)
        }
    }
    result
}

unsafe extern "system" fn get_swapchain_images_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_swapchain_image_count: *mut u32,
    p_swapchain_images: *mut vk::Image,
) -> vk::Result {
    if let Some(pipeline) = registry::swapchain(swapchain) {
        let pipeline = lock(&pipeline);
        return write_enumeration(
            pipeline.shadow_images(),
            p_swapchain_image_count,
            p_swapchain_images,
        );
    }
    let Some(layer_device) = registry::device(dispatch_key(device)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    (layer_device.swapchain_fn.get_swapchain_images_khr)(
        device,
        swapchain,
        p_swapchain_image_count,
        p_swapchain_images,
    )
}

unsafe extern "system" fn acquire_next_image_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(layer_device) = registry::device(dispatch_key(device)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = (layer_device.swapchain_fn.acquire_next_image_khr)(
        device,
        swapchain,
        timeout,
        semaphore,
        fence,
        p_image_index,
    );
    if matches!(result, vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR) {
        layer_device.tracker.set_acquired_image_index(swapchain, *p_image_index);
        layer_device.set_active_swapchain(Some(swapchain));
    }
    result
}

unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    // Queues share their device's dispatch table.
    let Some(layer_device) = registry::device(dispatch_key(queue)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let present_info = &*p_present_info;
    let count = present_info.swapchain_count as usize;
    let swapchains = std::slice::from_raw_parts(present_info.p_swapchains, count);
    let image_indices = std::slice::from_raw_parts(present_info.p_image_indices, count);

    let mut command_buffers = Vec::with_capacity(count);
    let mut signal_semaphores = Vec::with_capacity(count);
    let mut injection_enabled = false;
    for (swapchain, image_index) in swapchains.iter().zip(image_indices) {
        let Some(pipeline) = registry::swapchain(*swapchain) else {
            continue;
        };
        let prepared = {
            let mut pipeline = lock(&pipeline);
            injection_enabled |= pipeline.injection_enabled();
            pipeline.prepare_present(*image_index)
        };
        if let Some((cmd, semaphore)) = prepared {
            command_buffers.push(cmd);
            signal_semaphores.push(semaphore);
        }
    }

    let result = if command_buffers.is_empty() {
        (layer_device.swapchain_fn.queue_present_khr)(queue, p_present_info)
    } else {
        let wait_semaphores = if present_info.wait_semaphore_count == 0 {
            &[][..]
        } else {
            let count = present_info.wait_semaphore_count as usize;
            std::slice::from_raw_parts(present_info.p_wait_semaphores, count)
        };
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        let queue_submit = layer_device.device.fp_v1_0().queue_submit;
        let submitted = queue_submit(queue, 1, &submit_info, vk::Fence::null());
        if submitted == vk::Result::SUCCESS {
            let mut layered = *present_info;
            layered.wait_semaphore_count = signal_semaphores.len() as u32;
            layered.p_wait_semaphores = signal_semaphores.as_ptr();
            (layer_device.swapchain_fn.queue_present_khr)(queue, &layered)
        } else {
            tracing::error!("effect submission failed: {:?}; presenting unprocessed", submitted);
            (layer_device.swapchain_fn.queue_present_khr)(queue, p_present_info)
        }
    };

    injection::report_missed_target(&layer_device.tracker, injection_enabled);
    layer_device.tracker.begin_frame();
    result
}

unsafe extern "system" fn destroy_swapchain_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(layer_device) = registry::device(dispatch_key(device)) else {
        return;
    };
    // Dropping the pipeline drains the device before releasing its images.
    drop(registry::remove_swapchain(swapchain));
    layer_device.tracker.forget_swapchain(swapchain);
    if layer_device.active_swapchain() == Some(swapchain) {
        layer_device.set_active_swapchain(None);
    }
    (layer_device.swapchain_fn.destroy_swapchain_khr)(device, swapchain, p_allocator);
}

unsafe extern "system" fn cmd_begin_render_pass(
    command_buffer: vk::CommandBuffer,
    p_render_pass_begin: *const vk::RenderPassBeginInfo,
    contents: vk::SubpassContents,
) {
    // Command buffers share their device's dispatch table.
    let Some(layer_device) = registry::device(dispatch_key(command_buffer)) else {
        return;
    };
    layer_device
        .tracker
        .record_pass(PassBegin::from_begin_info(&*p_render_pass_begin));
    (layer_device.device.fp_v1_0().cmd_begin_render_pass)(
        command_buffer,
        p_render_pass_begin,
        contents,
    );
}

unsafe extern "system" fn cmd_end_render_pass(command_buffer: vk::CommandBuffer) {
    let Some(layer_device) = registry::device(dispatch_key(command_buffer)) else {
        return;
    };
    (layer_device.device.fp_v1_0().cmd_end_render_pass)(command_buffer);

    let ended = layer_device.tracker.end_pass();
    let Some(swapchain) = layer_device.active_swapchain() else {
        return;
    };
    let Some(pipeline) = registry::swapchain(swapchain) else {
        return;
    };
    let mut pipeline = lock(&pipeline);
    let decision = injection::evaluate(
        &layer_device.tracker,
        ended,
        pipeline.injection_enabled(),
        pipeline.extent(),
    );
    if let InjectionDecision::Fire { .. } = decision {
        let image_index = layer_device.tracker.acquired_image_index(swapchain);
        pipeline.record_injection(image_index as usize, command_buffer);
    }
}

unsafe extern "system" fn create_framebuffer(
    device: vk::Device,
    p_create_info: *const vk::FramebufferCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_framebuffer: *mut vk::Framebuffer,
) -> vk::Result {
    let Some(layer_device) = registry::device(dispatch_key(device)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = (layer_device.device.fp_v1_0().create_framebuffer)(
        device,
        p_create_info,
        p_allocator,
        p_framebuffer,
    );
    if result == vk::Result::SUCCESS {
        let info = FramebufferInfo::from_create_info(&*p_create_info);
        layer_device.tracker.register_framebuffer(*p_framebuffer, info);
    }
    result
}

unsafe extern "system" fn destroy_framebuffer(
    device: vk::Device,
    framebuffer: vk::Framebuffer,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(layer_device) = registry::device(dispatch_key(device)) else {
        return;
    };
    layer_device.tracker.unregister_framebuffer(framebuffer);
    (layer_device.device.fp_v1_0().destroy_framebuffer)(device, framebuffer, p_allocator);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use pretty_assertions::assert_eq;

    fn images(n: u64) -> Vec<vk::Image> {
        (1..=n).map(vk::Image::from_raw).collect()
    }

    #[test]
    fn enumeration_reports_count_without_output() {
        let mut count = 0;
        let result = unsafe { write_enumeration(&images(3), &mut count, std::ptr::null_mut()) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
    }

    #[test]
    fn enumeration_truncates_with_incomplete() {
        let mut count = 2;
        let mut out = vec![vk::Image::null(); 2];
        let result = unsafe { write_enumeration(&images(3), &mut count, out.as_mut_ptr()) };
        assert_eq!(result, vk::Result::INCOMPLETE);
        assert_eq!(count, 2);
        assert_eq!(out, images(2));
    }

    #[test]
    fn enumeration_fills_everything() {
        let mut count = 5;
        let mut out = vec![vk::Image::null(); 5];
        let result = unsafe { write_enumeration(&images(3), &mut count, out.as_mut_ptr()) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
        assert_eq!(&out[..3], &images(3)[..]);
    }

    #[test]
    fn intercepted_names_resolve_to_hooks() {
        for name in [
            &b"vkCreateInstance\0"[..],
            b"vkCreateDevice\0",
            b"vkQueuePresentKHR\0",
            b"vkCmdEndRenderPass\0",
            b"vkCreateFramebuffer\0",
        ] {
            let name = CStr::from_bytes_with_nul(name).unwrap();
            assert!(unsafe { instance_hook(name) }.is_some(), "{:?}", name);
        }
        let other = CStr::from_bytes_with_nul(b"vkCmdDraw\0").unwrap();
        assert!(unsafe { instance_hook(other) }.is_none());
        let instance_only = CStr::from_bytes_with_nul(b"vkCreateInstance\0").unwrap();
        assert!(unsafe { device_hook(instance_only) }.is_none());
    }
}
