// SPDX-License-Identifier: CEPL-1.0
//! Surface negotiation and the swapchain with its views, render pass and framebuffers.

use anyhow::{Context, Result};
use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::vk;
use quad_render::{Drawable, PresentPreference, RenderSize};
use tracing::{debug, info};

use crate::context::{GpuContext, QueueFamilies};
use crate::RenderError;

const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];

/// sRGB 8-bit formats in the sRGB color space first, else whatever the driver listed first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, RenderError> {
    let first = *formats.first().ok_or(RenderError::NoSurfaceFormat)?;
    Ok(PREFERRED_FORMATS
        .iter()
        .find_map(|&want| {
            formats
                .iter()
                .copied()
                .find(|f| f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        })
        .unwrap_or(first))
}

/// FIFO support is mandatory, so it backs every preference.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    pref: PresentPreference,
) -> Result<vk::PresentModeKHR, RenderError> {
    if modes.is_empty() {
        return Err(RenderError::NoPresentMode);
    }
    let wanted: &[vk::PresentModeKHR] = match pref {
        PresentPreference::Mailbox => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        PresentPreference::Fifo => &[vk::PresentModeKHR::FIFO],
        PresentPreference::Immediate => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
    };
    Ok(wanted
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO))
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

/// What a successful recreate changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecreateOutcome {
    /// The render pass was rebuilt; pipelines built against the old one are stale.
    pub format_changed: bool,
}

/// The chain and everything sized or formatted by it. Built and destroyed as a unit.
#[derive(Debug, Default)]
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

/// What the surface queries settled on for the next chain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChainParams {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Creates and destroys the handles a chain rebuild touches.
pub(crate) trait ChainOps {
    unsafe fn create_swapchain(&mut self, params: &ChainParams, old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR>;
    unsafe fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    unsafe fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);
    unsafe fn create_render_pass(&mut self, format: vk::Format) -> Result<vk::RenderPass>;
    unsafe fn destroy_render_pass(&mut self, render_pass: vk::RenderPass);
    unsafe fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    unsafe fn destroy_image_view(&mut self, view: vk::ImageView);
    unsafe fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    unsafe fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);
}

unsafe fn release_views_and_framebuffers<O: ChainOps + ?Sized>(ops: &mut O, state: &mut SwapchainState) {
    for fb in state.framebuffers.drain(..) {
        ops.destroy_framebuffer(fb);
    }
    for view in state.image_views.drain(..) {
        ops.destroy_image_view(view);
    }
}

/// Replaces the chain in `state` with one built from `params`. Returns whether the render pass
/// was (re)built.
///
/// The old chain is handed to the new one as `old_swapchain` and destroyed right after, whether
/// or not creation succeeded. Whatever was built before a failure stays in `state`, so
/// `teardown_chain` still releases it.
pub(crate) unsafe fn rebuild_chain<O: ChainOps + ?Sized>(
    ops: &mut O,
    state: &mut SwapchainState,
    render_pass: &mut vk::RenderPass,
    params: &ChainParams,
) -> Result<bool> {
    release_views_and_framebuffers(ops, state);
    state.images.clear();

    let old = std::mem::take(&mut state.swapchain);
    let created = ops.create_swapchain(params, old);
    if old != vk::SwapchainKHR::null() {
        ops.destroy_swapchain(old);
    }
    state.swapchain = created?;
    state.images = ops.swapchain_images(state.swapchain)?;

    let format_changed = *render_pass == vk::RenderPass::null() || state.format.format != params.format.format;
    state.format = params.format;
    state.present_mode = params.present_mode;
    state.extent = params.extent;

    if format_changed {
        let stale = std::mem::take(render_pass);
        if stale != vk::RenderPass::null() {
            ops.destroy_render_pass(stale);
        }
        *render_pass = ops.create_render_pass(params.format.format)?;
    }
    for &image in &state.images {
        state.image_views.push(ops.create_image_view(image, params.format.format)?);
    }
    for &view in &state.image_views {
        state
            .framebuffers
            .push(ops.create_framebuffer(*render_pass, view, params.extent)?);
    }
    Ok(format_changed)
}

/// Framebuffers, views, swapchain, render pass.
pub(crate) unsafe fn teardown_chain<O: ChainOps + ?Sized>(
    ops: &mut O,
    state: &mut SwapchainState,
    render_pass: &mut vk::RenderPass,
) {
    release_views_and_framebuffers(ops, state);
    let sc = std::mem::take(&mut state.swapchain);
    if sc != vk::SwapchainKHR::null() {
        ops.destroy_swapchain(sc);
    }
    state.images.clear();
    let rp = std::mem::take(render_pass);
    if rp != vk::RenderPass::null() {
        ops.destroy_render_pass(rp);
    }
}

/// `ChainOps` on a real device.
struct VkChainOps {
    device: ash::Device,
    swap_d: swapchain::Device,
    surface: vk::SurfaceKHR,
    queues: QueueFamilies,
}

impl ChainOps for VkChainOps {
    unsafe fn create_swapchain(&mut self, params: &ChainParams, old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR> {
        let family_indices = [self.queues.graphics, self.queues.present];
        let (sharing_mode, qf_count, qf_ptr) = if self.queues.is_shared() {
            (vk::SharingMode::EXCLUSIVE, 0, std::ptr::null())
        } else {
            (vk::SharingMode::CONCURRENT, 2, family_indices.as_ptr())
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count: params.min_image_count,
            image_format: params.format.format,
            image_color_space: params.format.color_space,
            image_extent: params.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: qf_count,
            p_queue_family_indices: qf_ptr,
            pre_transform: params.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: params.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        self.swap_d
            .create_swapchain(&swap_info, None)
            .context("create_swapchain")
    }

    unsafe fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.swap_d
            .get_swapchain_images(swapchain)
            .context("get_swapchain_images")
    }

    unsafe fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.swap_d.destroy_swapchain(swapchain, None);
    }

    unsafe fn create_render_pass(&mut self, format: vk::Format) -> Result<vk::RenderPass> {
        create_render_pass(&self.device, format)
    }

    unsafe fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.device.destroy_render_pass(render_pass, None);
    }

    unsafe fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            components: vk::ComponentMapping::default(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        self.device
            .create_image_view(&iv_info, None)
            .context("create_image_view(swapchain)")
    }

    unsafe fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: 1,
            p_attachments: &view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        self.device
            .create_framebuffer(&fb_info, None)
            .context("create_framebuffer")
    }

    unsafe fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.device.destroy_framebuffer(framebuffer, None);
    }
}

pub struct SwapchainManager {
    ops: VkChainOps,
    surf_i: surface::Instance,
    phys: vk::PhysicalDevice,
    present_pref: PresentPreference,
    render_pass: vk::RenderPass,
    state: SwapchainState,
}

impl SwapchainManager {
    pub unsafe fn new(ctx: &GpuContext, drawable: RenderSize, present_pref: PresentPreference) -> Result<Self> {
        let mut mgr = Self {
            ops: VkChainOps {
                device: ctx.device.clone(),
                swap_d: swapchain::Device::new(&ctx.instance, &ctx.device),
                surface: ctx.surface,
                queues: ctx.queues,
            },
            surf_i: ctx.surface_loader.clone(),
            phys: ctx.phys,
            present_pref,
            render_pass: vk::RenderPass::null(),
            state: SwapchainState::default(),
        };
        mgr.build(drawable)?;
        Ok(mgr)
    }

    pub fn state(&self) -> &SwapchainState {
        &self.state
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.state.extent
    }

    pub unsafe fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.ops
            .swap_d
            .acquire_next_image(self.state.swapchain, u64::MAX, signal, vk::Fence::null())
    }

    /// `Ok(true)` means suboptimal.
    pub unsafe fn present(&self, queue: vk::Queue, wait: vk::Semaphore, image_index: u32) -> VkResult<bool> {
        let present_info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.state.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        self.ops.swap_d.queue_present(queue, &present_info)
    }

    /// Waits out a zero-sized drawable, then rebuilds the chain against the new size.
    /// `Ok(None)` means the window closed while minimized and nothing was touched.
    pub unsafe fn recreate(&mut self, drawable: &mut dyn Drawable) -> Result<Option<RecreateOutcome>> {
        drawable.pump_events();
        let size = loop {
            if drawable.close_requested() {
                debug!("close requested while waiting for a drawable; skipping recreate");
                return Ok(None);
            }
            let size = drawable.drawable_size();
            if !size.is_empty() {
                break size;
            }
            drawable.wait_events();
        };
        // the size above already reflects any pending resize
        drawable.take_resized();

        self.ops
            .device
            .device_wait_idle()
            .context("device_wait_idle(recreate)")?;

        let format_changed = self.build(size)?;
        Ok(Some(RecreateOutcome { format_changed }))
    }

    /// Queries the surface and rebuilds the chain from it. Returns whether the render pass was
    /// (re)built.
    unsafe fn build(&mut self, drawable: RenderSize) -> Result<bool> {
        let caps = self
            .surf_i
            .get_physical_device_surface_capabilities(self.phys, self.ops.surface)
            .context("get_physical_device_surface_capabilities")?;
        let formats = self
            .surf_i
            .get_physical_device_surface_formats(self.phys, self.ops.surface)
            .context("get_physical_device_surface_formats")?;
        let modes = self
            .surf_i
            .get_physical_device_surface_present_modes(self.phys, self.ops.surface)
            .context("get_physical_device_surface_present_modes")?;

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };
        let params = ChainParams {
            format: choose_surface_format(&formats)?,
            present_mode: choose_present_mode(&modes, self.present_pref)?,
            extent: extent_from_caps(&caps, drawable),
            min_image_count: image_count(&caps),
            pre_transform,
        };

        let format_changed = rebuild_chain(&mut self.ops, &mut self.state, &mut self.render_pass, &params)?;
        info!(
            "swapchain: {:?} / {:?}, {:?}, {}x{}, images {} (min {})",
            params.format.format,
            params.format.color_space,
            params.present_mode,
            params.extent.width,
            params.extent.height,
            self.state.images.len(),
            caps.min_image_count
        );
        Ok(format_changed)
    }

    /// Framebuffers, views, swapchain, render pass. The device must be idle.
    pub unsafe fn destroy(&mut self) {
        teardown_chain(&mut self.ops, &mut self.state, &mut self.render_pass);
    }
}

unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    // the acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT; hold the layout change until then
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&rp_info, None)
        .context("create_render_pass")
}
