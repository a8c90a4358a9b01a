//! Ownership of the Vulkan handles a pipeline or stage creates.
//!
//! Handles are pushed in creation order and released in exactly the reverse
//! order by a single routine, which also runs from `Drop`. Releasing twice is
//! a no-op, so a partially built owner can always be torn down.

use ash::vk::{self, Handle};
use ash::Device;
use std::sync::Arc;

/// One owned handle (or batch of command buffers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedHandle {
    Memory(vk::DeviceMemory),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Semaphore(vk::Semaphore),
    CommandBuffers {
        pool: vk::CommandPool,
        buffers: Vec<vk::CommandBuffer>,
    },
    Sampler(vk::Sampler),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
}

impl OwnedHandle {
    fn is_null(&self) -> bool {
        match self {
            OwnedHandle::Memory(h) => h.as_raw() == 0,
            OwnedHandle::Image(h) => h.as_raw() == 0,
            OwnedHandle::ImageView(h) => h.as_raw() == 0,
            OwnedHandle::Semaphore(h) => h.as_raw() == 0,
            OwnedHandle::CommandBuffers { pool, buffers } => {
                pool.as_raw() == 0 || buffers.is_empty()
            }
            OwnedHandle::Sampler(h) => h.as_raw() == 0,
            OwnedHandle::DescriptorSetLayout(h) => h.as_raw() == 0,
            OwnedHandle::DescriptorPool(h) => h.as_raw() == 0,
            OwnedHandle::RenderPass(h) => h.as_raw() == 0,
            OwnedHandle::Framebuffer(h) => h.as_raw() == 0,
            OwnedHandle::PipelineLayout(h) => h.as_raw() == 0,
            OwnedHandle::Pipeline(h) => h.as_raw() == 0,
        }
    }

    /// # Safety
    /// The handle must have been created from `device` and be unused by the GPU.
    unsafe fn destroy(self, device: &Device) {
        match self {
            OwnedHandle::Memory(h) => device.free_memory(h, None),
            OwnedHandle::Image(h) => device.destroy_image(h, None),
            OwnedHandle::ImageView(h) => device.destroy_image_view(h, None),
            OwnedHandle::Semaphore(h) => device.destroy_semaphore(h, None),
            OwnedHandle::CommandBuffers { pool, buffers } => {
                device.free_command_buffers(pool, &buffers)
            }
            OwnedHandle::Sampler(h) => device.destroy_sampler(h, None),
            OwnedHandle::DescriptorSetLayout(h) => device.destroy_descriptor_set_layout(h, None),
            OwnedHandle::DescriptorPool(h) => device.destroy_descriptor_pool(h, None),
            OwnedHandle::RenderPass(h) => device.destroy_render_pass(h, None),
            OwnedHandle::Framebuffer(h) => device.destroy_framebuffer(h, None),
            OwnedHandle::PipelineLayout(h) => device.destroy_pipeline_layout(h, None),
            OwnedHandle::Pipeline(h) => device.destroy_pipeline(h, None),
        }
    }
}

/// Creation-ordered list of handles, independent of any device.
#[derive(Debug, Default)]
pub struct HandleStack {
    handles: Vec<OwnedHandle>,
}

impl HandleStack {
    /// Null handles are never recorded.
    pub fn push(&mut self, handle: OwnedHandle) {
        if !handle.is_null() {
            self.handles.push(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Empties the stack, yielding handles newest first.
    pub fn drain_release_order(&mut self) -> Vec<OwnedHandle> {
        let mut drained = std::mem::take(&mut self.handles);
        drained.reverse();
        drained
    }
}

/// A [`HandleStack`] bound to the device that created its handles.
pub struct ResourceArena {
    device: Arc<Device>,
    stack: HandleStack,
}

impl ResourceArena {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            stack: HandleStack::default(),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn push(&mut self, handle: OwnedHandle) {
        self.stack.push(handle);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Destroys every handle, newest first. Callers drain the GPU beforehand.
    pub fn release_all(&mut self) {
        let handles = self.stack.drain_release_order();
        if handles.is_empty() {
            return;
        }
        tracing::trace!("releasing {} owned handles", handles.len());
        for handle in handles {
            // SAFETY: every handle was created from `self.device` and the owner
            // has waited for the work that referenced it.
            unsafe { handle.destroy(&self.device) };
        }
    }
}

impl Drop for ResourceArena {
    fn drop(&mut self) {
        self.release_all();
    }
}
