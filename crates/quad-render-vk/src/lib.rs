// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the textured quad.
//!
//! `VkRenderer` only sequences its components: it creates them in dependency order, drives the
//! `FrameScheduler` once per `render` call and tears everything down in reverse on drop.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use quad_math::UniformBlock;
use quad_render::{Drawable, RenderPrefs, RenderSize, Renderer, SceneAssets};

pub mod context;
mod error;
pub mod frame;
pub mod memory;
pub mod pipeline;
pub mod resources;
pub mod swapchain;
pub mod transfer;

pub use context::{GpuContext, QueueFamilies};
pub use error::RenderError;
pub use frame::{
    AcquireOutcome, FrameBackend, FrameScheduler, FrameSlot, PresentOutcome, RecreateReasons,
    TickOutcome, MAX_FRAMES_IN_FLIGHT,
};
pub use memory::{find_memory_type, GpuBuffer, GpuImage, MemoryAllocator};
pub use resources::ResourceSet;
pub use swapchain::{RecreateOutcome, SwapchainManager, SwapchainState};
pub use transfer::{barrier_for, plan_transitions, TransferEngine, TransitionMasks};

/// Opaque black until `set_clear_color` says otherwise.
const DEFAULT_CLEAR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

pub struct VkRenderer {
    scheduler: FrameScheduler,
    slots: Vec<FrameSlot>,
    resources: ResourceSet,
    transfer: TransferEngine,
    swapchain: SwapchainManager,
    ctx: GpuContext,
    clear: vk::ClearValue,
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle, so no slot fence still references anything
// - frame slot sync objects before the resource set (their command buffers die with its pool)
// - resource set, then the transfer pool
// - swapchain: framebuffers, views, swapchain, render pass
// - device, then surface and debug messenger; instance last
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            d.device_wait_idle().ok();

            for slot in self.slots.drain(..) {
                slot.destroy(d);
            }
            self.resources.destroy(d);
            self.transfer.destroy();
            self.swapchain.destroy();
            self.ctx.destroy();
        }
        info!(
            "Vulkan renderer destroyed after {} frames",
            self.scheduler.frames_presented()
        );
    }
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    prefs: &RenderPrefs,
    assets: &SceneAssets,
) -> Result<VkRenderer> {
    let ctx = GpuContext::new(window, display, prefs.validation)?;
    let swapchain = SwapchainManager::new(&ctx, size, prefs.present)?;

    let allocator = MemoryAllocator::new(ctx.device.clone(), ctx.memory_props);
    let transfer = TransferEngine::new(ctx.device.clone(), ctx.graphics_queue, ctx.queues.graphics, allocator)?;

    let scheduler = FrameScheduler::new(prefs.frames_in_flight);
    let slot_count = scheduler.slot_count();
    let resources = ResourceSet::new(
        &ctx.device,
        &transfer,
        ctx.queues.graphics,
        swapchain.render_pass(),
        ctx.max_anisotropy,
        assets,
        slot_count,
    )?;
    let slots = frame::create_frame_slots(&ctx.device, resources.command_pool(), slot_count)?;

    info!("Vulkan renderer ready ({slot_count} frames in flight)");
    Ok(VkRenderer {
        scheduler,
        slots,
        resources,
        transfer,
        swapchain,
        ctx,
        clear: clear_value(DEFAULT_CLEAR),
    })
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        prefs: &RenderPrefs,
        assets: &SceneAssets,
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, prefs, assets) }
    }

    fn render(&mut self, drawable: &mut dyn Drawable) -> Result<()> {
        if drawable.close_requested() {
            return Ok(());
        }
        let mut frame = VkFrame {
            ctx: &self.ctx,
            swapchain: &mut self.swapchain,
            resources: &mut self.resources,
            slots: &self.slots,
            clear: self.clear,
            drawable,
        };
        match self.scheduler.tick(&mut frame)? {
            TickOutcome::Presented { recreated, .. } if !recreated.is_empty() => {
                debug!(?recreated, "frame presented, swapchain rebuilt");
            }
            TickOutcome::Skipped { slot, .. } => debug!("frame on slot {slot} skipped"),
            TickOutcome::Presented { .. } => {}
        }
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = clear_value(rgba);
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle() }.context("device_wait_idle")
    }
}

/// One tick's view of the renderer, handed to the scheduler.
struct VkFrame<'a> {
    ctx: &'a GpuContext,
    swapchain: &'a mut SwapchainManager,
    resources: &'a mut ResourceSet,
    slots: &'a [FrameSlot],
    clear: vk::ClearValue,
    drawable: &'a mut dyn Drawable,
}

impl VkFrame<'_> {
    fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.slots
            .get(slot)
            .with_context(|| format!("frame slot {slot} out of range"))
    }
}

impl FrameBackend for VkFrame<'_> {
    fn take_resized(&mut self) -> bool {
        self.drawable.take_resized()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        unsafe {
            self.ctx
                .device
                .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        }
        .context("wait_for_fences")
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let sem = self.slot(slot)?.image_available;
        match unsafe { self.swapchain.acquire_next_image(sem) } {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("acquire_next_image"),
        }
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        unsafe { self.ctx.device.reset_fences(std::slice::from_ref(&fence)) }.context("reset_fences")
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let cmd = self.slot(slot)?.cmd;
        let state = self.swapchain.state();
        let framebuffer = *state
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("no framebuffer for image {image_index}"))?;
        unsafe {
            self.resources.record_draw(
                &self.ctx.device,
                cmd,
                slot,
                self.swapchain.render_pass(),
                framebuffer,
                state.extent,
                self.clear,
            )
        }
    }

    fn write_uniforms(&mut self, slot: usize) -> Result<()> {
        let extent = self.swapchain.extent();
        let block = UniformBlock::animated(
            self.drawable.elapsed().as_secs_f32(),
            extent.width,
            extent.height,
        );
        unsafe { self.resources.write_uniforms(slot, &block) }
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let s = self.slot(slot)?;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &s.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &s.render_finished,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, std::slice::from_ref(&si), s.in_flight)
        }
        .context("queue_submit")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait = self.slot(slot)?.render_finished;
        match unsafe { self.swapchain.present(self.ctx.present_queue, wait, image_index) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("queue_present"),
        }
    }

    fn recreate(&mut self, reasons: RecreateReasons) -> Result<()> {
        info!(?reasons, "recreating swapchain");
        let Some(outcome) = (unsafe { self.swapchain.recreate(&mut *self.drawable) })? else {
            return Ok(());
        };
        if outcome.format_changed {
            unsafe {
                self.resources
                    .rebuild_pipeline(&self.ctx.device, self.swapchain.render_pass())
            }?;
        }
        let extent = self.swapchain.extent();
        info!("swapchain now {}x{}", extent.width, extent.height);
        Ok(())
    }
}
