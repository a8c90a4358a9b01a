//! Per-device bookkeeping of the render passes an application issues.
//!
//! The render path mutates the tracker from intercepted calls while an
//! observer (the overlay) may read snapshots concurrently. Every method takes
//! the single lock for a bounded copy or field access.

use ash::vk::{self, Handle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Passes kept per frame. A device that never presents through the layer
/// never starts a new frame, so later passes are numbered but not stored.
pub const MAX_TRACKED_PASSES: usize = 4096;

/// Attachments and size of a framebuffer created by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
}

impl FramebufferInfo {
    pub fn from_create_info(info: &vk::FramebufferCreateInfo) -> Self {
        let attachments = if info.attachment_count == 0 || info.p_attachments.is_null() {
            Vec::new()
        } else {
            // SAFETY: the application guarantees `attachment_count` valid views.
            let count = info.attachment_count as usize;
            unsafe { std::slice::from_raw_parts(info.p_attachments, count) }.to_vec()
        };
        Self {
            attachments,
            width: info.width,
            height: info.height,
        }
    }
}

/// A render pass recorded during the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassInfo {
    /// Position within the frame, starting at 0.
    pub index: u32,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub width: u32,
    pub height: u32,
}

/// What the application passed to `vkCmdBeginRenderPass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub width: u32,
    pub height: u32,
}

impl PassBegin {
    pub fn from_begin_info(info: &vk::RenderPassBeginInfo) -> Self {
        Self {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            width: info.render_area.extent.width,
            height: info.render_area.extent.height,
        }
    }
}

/// Overlay-facing summary of whether the injection target can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionStatus {
    /// No pass has been recorded yet this frame.
    WaitingForPasses,
    /// The target index exists in the current frame.
    Ready { target: u32 },
    /// The target index is past the last recorded pass.
    InvalidTarget { target: u32, max_valid: u32 },
}

#[derive(Debug, Default)]
struct TrackerState {
    passes: Vec<RenderPassInfo>,
    next_index: u32,
    current: Option<RenderPassInfo>,
    overflow_reported: bool,
    framebuffers: HashMap<u64, FramebufferInfo>,
    acquired_image_index: HashMap<u64, u32>,
    injection_performed: bool,
    target_pass_index: u32,
}

/// Render-pass, framebuffer and acquisition tracking for one device.
#[derive(Debug, Default)]
pub struct RenderPassTracker {
    state: Mutex<TrackerState>,
}

impl RenderPassTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panic elsewhere must not take the host application down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a new frame: forgets the previous frame's passes and injection.
    pub fn begin_frame(&self) {
        let mut state = self.lock();
        state.passes.clear();
        state.next_index = 0;
        state.current = None;
        state.overflow_reported = false;
        state.injection_performed = false;
    }

    /// Records a pass and makes it current, returning its sequence index.
    ///
    /// Nested passes are not modelled: a pass begun while another one is open
    /// replaces it as current and the open one is never reported as ended.
    pub fn record_pass(&self, begin: PassBegin) -> u32 {
        let mut state = self.lock();
        if let Some(open) = state.current {
            tracing::warn!(
                "render pass begun while pass {} is still open, abandoning it",
                open.index
            );
        }
        let info = RenderPassInfo {
            index: state.next_index,
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            width: begin.width,
            height: begin.height,
        };
        if state.passes.len() < MAX_TRACKED_PASSES {
            state.passes.push(info);
        } else if !state.overflow_reported {
            state.overflow_reported = true;
            tracing::warn!(
                "{} render passes without a present, no longer storing pass metadata",
                MAX_TRACKED_PASSES
            );
        }
        state.current = Some(info);
        state.next_index += 1;
        info.index
    }

    /// Closes the current pass and returns its index, or `None` if no pass is open.
    pub fn end_pass(&self) -> Option<u32> {
        self.lock().current.take().map(|pass| pass.index)
    }

    pub fn current_pass(&self) -> Option<RenderPassInfo> {
        self.lock().current
    }

    /// Stored metadata of the pass numbered `index` in this frame.
    pub fn pass(&self, index: u32) -> Option<RenderPassInfo> {
        self.lock().passes.get(index as usize).copied()
    }

    /// Snapshot of every pass recorded since the last [`Self::begin_frame`].
    pub fn passes(&self) -> Vec<RenderPassInfo> {
        self.lock().passes.clone()
    }

    pub fn set_acquired_image_index(&self, swapchain: vk::SwapchainKHR, image_index: u32) {
        self.lock().acquired_image_index.insert(swapchain.as_raw(), image_index);
    }

    /// Last image acquired from `swapchain`; 0 for a swapchain never seen.
    pub fn acquired_image_index(&self, swapchain: vk::SwapchainKHR) -> u32 {
        self.lock()
            .acquired_image_index
            .get(&swapchain.as_raw())
            .copied()
            .unwrap_or(0)
    }

    pub fn forget_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.lock().acquired_image_index.remove(&swapchain.as_raw());
    }

    pub fn set_injection_performed(&self, performed: bool) {
        self.lock().injection_performed = performed;
    }

    pub fn was_injection_performed(&self) -> bool {
        self.lock().injection_performed
    }

    pub fn set_target_pass_index(&self, index: u32) {
        self.lock().target_pass_index = index;
    }

    pub fn target_pass_index(&self) -> u32 {
        self.lock().target_pass_index
    }

    pub fn injection_status(&self) -> InjectionStatus {
        let state = self.lock();
        let target = state.target_pass_index;
        match state.passes.len() as u32 {
            0 => InjectionStatus::WaitingForPasses,
            count if target < count => InjectionStatus::Ready { target },
            count => InjectionStatus::InvalidTarget {
                target,
                max_valid: count - 1,
            },
        }
    }

    pub fn register_framebuffer(&self, framebuffer: vk::Framebuffer, info: FramebufferInfo) {
        self.lock().framebuffers.insert(framebuffer.as_raw(), info);
    }

    pub fn unregister_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.lock().framebuffers.remove(&framebuffer.as_raw());
    }

    pub fn framebuffer_info(&self, framebuffer: vk::Framebuffer) -> Option<FramebufferInfo> {
        self.lock().framebuffers.get(&framebuffer.as_raw()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pass(id: u64) -> PassBegin {
        PassBegin {
            render_pass: vk::RenderPass::from_raw(id),
            framebuffer: vk::Framebuffer::from_raw(id + 100),
            width: 1280,
            height: 720,
        }
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(17)]
    fn indices_count_up_from_zero(#[case] count: u32) {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        let indices: Vec<u32> = (0..count)
            .map(|i| {
                let index = tracker.record_pass(pass(u64::from(i) + 1));
                tracker.end_pass();
                index
            })
            .collect();
        assert_eq!(indices, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn begin_frame_resets_sequence_and_current_pass() {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        tracker.record_pass(pass(1));
        tracker.set_injection_performed(true);

        tracker.begin_frame();
        assert!(tracker.passes().is_empty());
        assert!(tracker.current_pass().is_none());
        assert!(!tracker.was_injection_performed());
        assert_eq!(tracker.record_pass(pass(2)), 0);
    }

    #[test]
    fn end_pass_without_open_pass_is_absent() {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        assert_eq!(tracker.end_pass(), None);
        tracker.record_pass(pass(1));
        assert_eq!(tracker.end_pass(), Some(0));
        assert_eq!(tracker.end_pass(), None);
    }

    #[test]
    fn current_pass_follows_begin_and_end() {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        assert!(tracker.current_pass().is_none());
        tracker.record_pass(pass(7));
        let current = tracker.current_pass().unwrap();
        assert_eq!(current.index, 0);
        assert_eq!(current.render_pass, vk::RenderPass::from_raw(7));
        tracker.end_pass();
        assert!(tracker.current_pass().is_none());
    }

    #[test]
    fn nested_pass_abandons_the_open_one() {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        assert_eq!(tracker.record_pass(pass(1)), 0);
        assert_eq!(tracker.record_pass(pass(2)), 1);
        assert_eq!(tracker.passes().len(), 2);
        assert_eq!(tracker.current_pass().unwrap().render_pass, vk::RenderPass::from_raw(2));
        assert_eq!(tracker.end_pass(), Some(1));
        assert_eq!(tracker.end_pass(), None);
    }

    #[test]
    fn pass_storage_is_bounded_without_presents() {
        let tracker = RenderPassTracker::new();
        tracker.begin_frame();
        let total = MAX_TRACKED_PASSES as u32 + 100;
        for i in 0..total {
            assert_eq!(tracker.record_pass(pass(u64::from(i) + 1)), i);
            assert_eq!(tracker.end_pass(), Some(i));
        }
        assert_eq!(tracker.passes().len(), MAX_TRACKED_PASSES);
        assert_eq!(tracker.pass(7).map(|p| p.index), Some(7));
        assert!(tracker.pass(total - 1).is_none());

        tracker.begin_frame();
        assert!(tracker.passes().is_empty());
        assert_eq!(tracker.record_pass(pass(1)), 0);
    }

    #[test]
    fn acquired_index_is_per_swapchain_and_defaults_to_zero() {
        let tracker = RenderPassTracker::new();
        let a = vk::SwapchainKHR::from_raw(0xa);
        let b = vk::SwapchainKHR::from_raw(0xb);
        tracker.set_acquired_image_index(a, 2);
        assert_eq!(tracker.acquired_image_index(a), 2);
        assert_eq!(tracker.acquired_image_index(b), 0);

        tracker.begin_frame();
        assert_eq!(tracker.acquired_image_index(a), 2);
        tracker.forget_swapchain(a);
        assert_eq!(tracker.acquired_image_index(a), 0);
    }

    #[test]
    fn target_index_survives_frames() {
        let tracker = RenderPassTracker::new();
        tracker.set_target_pass_index(5);
        tracker.begin_frame();
        assert_eq!(tracker.target_pass_index(), 5);
    }

    #[test]
    fn injection_status_reports_target_validity() {
        let tracker = RenderPassTracker::new();
        tracker.set_target_pass_index(1);
        tracker.begin_frame();
        assert_eq!(tracker.injection_status(), InjectionStatus::WaitingForPasses);

        tracker.record_pass(pass(1));
        tracker.end_pass();
        assert_eq!(
            tracker.injection_status(),
            InjectionStatus::InvalidTarget { target: 1, max_valid: 0 }
        );

        tracker.record_pass(pass(2));
        assert_eq!(tracker.injection_status(), InjectionStatus::Ready { target: 1 });
    }

    #[test]
    fn framebuffer_info_is_copied_from_create_info() {
        let views = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)];
        let create_info = vk::FramebufferCreateInfo::builder()
            .attachments(&views)
            .width(800)
            .height(600)
            .layers(1)
            .build();
        let info = FramebufferInfo::from_create_info(&create_info);
        assert_eq!(info.attachments, views.to_vec());
        assert_eq!((info.width, info.height), (800, 600));
    }
}
