//! Per-device state of the layer.

use crate::effect::EffectRegistry;
use crate::error::{EffectsError, Result};
use crate::layer::loader::SetDeviceLoaderDataFn;
use crate::tracker::RenderPassTracker;
use anyhow::Context;
use ash::vk::{self, Handle};
use std::sync::{Arc, Mutex};

/// First requested queue family that supports graphics work.
pub fn pick_graphics_family(
    families: &[vk::QueueFamilyProperties],
    requested: &[u32],
) -> Option<u32> {
    requested.iter().copied().find(|&index| {
        families
            .get(index as usize)
            .map_or(false, |family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
    })
}

/// A device the application created with the layer active.
///
/// Every such device gets one; when the layer cannot record for it (no
/// graphics queue, no command pool) its swapchains are forwarded untouched.
pub struct LayerDevice {
    pub handle: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub device: Arc<ash::Device>,
    pub swapchain_fn: vk::KhrSwapchainFn,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub graphics_family: Option<u32>,
    pub command_pool: vk::CommandPool,
    pub registry: EffectRegistry,
    pub tracker: RenderPassTracker,
    set_device_loader_data: Option<SetDeviceLoaderDataFn>,
    active_swapchain: Mutex<Option<vk::SwapchainKHR>>,
}

fn create_command_pool(
    device: &ash::Device,
    families: &[vk::QueueFamilyProperties],
    requested_families: &[u32],
) -> anyhow::Result<(u32, vk::CommandPool)> {
    let graphics_family = pick_graphics_family(families, requested_families)
        .context("no graphics queue family among the requested queues")?;
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(graphics_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
        .context("failed to create the layer command pool")?;
    Ok((graphics_family, command_pool))
}

impl LayerDevice {
    /// Loads the next layer's device functions and creates the layer's command pool.
    ///
    /// `requested_families` are the queue families the application asked for;
    /// the layer only records for a graphics one among them.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        handle: vk::Device,
        next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
        set_device_loader_data: Option<SetDeviceLoaderDataFn>,
        requested_families: &[u32],
    ) -> Self {
        let mut instance_fn = instance.fp_v1_0().clone();
        instance_fn.get_device_proc_addr = next_get_device_proc_addr;
        let device = unsafe { ash::Device::load(&instance_fn, handle) };
        let swapchain_fn = vk::KhrSwapchainFn::load(|name| unsafe {
            std::mem::transmute(next_get_device_proc_addr(handle, name.as_ptr()))
        });

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let pool = create_command_pool(&device, &families, requested_families);
        let (graphics_family, command_pool) = match pool {
            Ok((family, pool)) => {
                tracing::info!(
                    "device {:#x}: recording on queue family {}",
                    handle.as_raw(),
                    family
                );
                (Some(family), pool)
            }
            Err(err) => {
                tracing::warn!("device {:#x}: effects unavailable: {:#}", handle.as_raw(), err);
                (None, vk::CommandPool::null())
            }
        };

        Self {
            handle,
            physical_device,
            device: Arc::new(device),
            swapchain_fn,
            next_get_device_proc_addr,
            memory_properties,
            graphics_family,
            command_pool,
            registry: EffectRegistry::new(),
            tracker: RenderPassTracker::new(),
            set_device_loader_data,
            active_swapchain: Mutex::new(None),
        }
    }

    /// Whether swapchains of this device can run effects.
    pub fn can_record(&self) -> bool {
        self.command_pool != vk::CommandPool::null()
    }

    /// Gives a dispatchable object created by the layer the device's dispatch table.
    pub fn set_loader_data<T: Handle>(&self, object: T) -> Result<()> {
        let Some(set_loader_data) = self.set_device_loader_data else {
            return Ok(());
        };
        let object = object.as_raw() as *mut std::ffi::c_void;
        let result = unsafe { set_loader_data(self.handle, object) };
        result.result()?;
        Ok(())
    }

    /// Primary command buffers from the layer's pool, ready to be recorded.
    pub fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        if !self.can_record() {
            return Err(EffectsError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        for buffer in &buffers {
            if let Err(err) = self.set_loader_data(*buffer) {
                unsafe { self.device.free_command_buffers(self.command_pool, &buffers) };
                return Err(err);
            }
        }
        Ok(buffers)
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    pub fn wait_idle(&self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            tracing::warn!("vkDeviceWaitIdle failed: {:?}", err);
        }
    }

    /// Swapchain whose image was acquired most recently.
    pub fn active_swapchain(&self) -> Option<vk::SwapchainKHR> {
        *self.active_swapchain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_active_swapchain(&self, swapchain: Option<vk::SwapchainKHR>) {
        *self.active_swapchain.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = swapchain;
    }
}

impl Drop for LayerDevice {
    fn drop(&mut self) {
        if self.can_record() {
            unsafe { self.device.destroy_command_pool(self.command_pool, None) };
        }
        tracing::debug!("device {:#x} state released", self.handle.as_raw());
    }
}
