// SPDX-License-Identifier: CEPL-1.0
//! Everything the quad draw binds: pipeline, geometry, texture and per-slot uniforms.

use anyhow::{bail, Context, Result};
use ash::vk;
use quad_math::UniformBlock;
use quad_render::{SceneAssets, QUAD_INDICES, QUAD_VERTICES};
use tracing::info;

use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::{create_pipeline, GraphicsPipeline, ShaderCode};
use crate::transfer::TransferEngine;

/// Texture format for decoded RGBA8 pixels.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// A host-visible uniform buffer mapped once for its lifetime.
struct MappedUniform {
    buffer: GpuBuffer,
    ptr: *mut u8,
}

pub struct ResourceSet {
    set_layout: vk::DescriptorSetLayout,
    shaders: ShaderCode,
    pipeline: GraphicsPipeline,
    cmd_pool: vk::CommandPool,
    texture: GpuImage,
    texture_view: vk::ImageView,
    sampler: vk::Sampler,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    uniforms: Vec<MappedUniform>,
    desc_pool: vk::DescriptorPool,
    desc_sets: Vec<vk::DescriptorSet>,
}

unsafe fn create_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: bindings.len() as u32,
        p_bindings: bindings.as_ptr(),
        ..Default::default()
    };
    Ok(device
        .create_descriptor_set_layout(&ci, None)
        .context("create_descriptor_set_layout")?)
}

unsafe fn create_texture_view(device: &ash::Device, texture: &GpuImage) -> Result<vk::ImageView> {
    let ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image: texture.image,
        view_type: vk::ImageViewType::TYPE_2D,
        format: texture.format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    Ok(device
        .create_image_view(&ci, None)
        .context("create_image_view(texture)")?)
}

unsafe fn create_sampler(device: &ash::Device, max_anisotropy: f32) -> Result<vk::Sampler> {
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        mip_lod_bias: 0.0,
        anisotropy_enable: vk::TRUE,
        max_anisotropy,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: 0.0,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    };
    Ok(device.create_sampler(&ci, None).context("create_sampler")?)
}

impl ResourceSet {
    /// Builds in dependency order. A failure part way leaks what was built; setup errors are fatal.
    pub unsafe fn new(
        device: &ash::Device,
        transfer: &TransferEngine,
        graphics_family: u32,
        render_pass: vk::RenderPass,
        max_anisotropy: f32,
        assets: &SceneAssets,
        slot_count: usize,
    ) -> Result<Self> {
        if slot_count == 0 {
            bail!("resource set needs at least one frame slot");
        }
        let shaders = ShaderCode::from_bytes(&assets.vertex_spirv, &assets.fragment_spirv)?;

        let set_layout = create_set_layout(device)?;
        let pipeline = create_pipeline(device, render_pass, set_layout, &shaders)?;

        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: graphics_family,
            ..Default::default()
        };
        let cmd_pool = device
            .create_command_pool(&pool_ci, None)
            .context("create_command_pool(frames)")?;

        let tex = &assets.texture;
        let texture = transfer
            .upload_image(&tex.pixels, tex.width, tex.height, TEXTURE_FORMAT)
            .context("upload texture")?;
        let texture_view = create_texture_view(device, &texture)?;
        let sampler = create_sampler(device, max_anisotropy)?;

        let vertex_buffer = transfer
            .upload_to_device_local(bytemuck::cast_slice(&QUAD_VERTICES), vk::BufferUsageFlags::VERTEX_BUFFER)
            .context("upload vertices")?;
        let index_buffer = transfer
            .upload_to_device_local(bytemuck::cast_slice(&QUAD_INDICES), vk::BufferUsageFlags::INDEX_BUFFER)
            .context("upload indices")?;

        let ubo_size = UniformBlock::SIZE as vk::DeviceSize;
        let allocator = transfer.allocator();
        let mut uniforms = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let buffer = allocator.create_buffer(
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let ptr = allocator.map(buffer.memory, ubo_size)?;
            uniforms.push(MappedUniform { buffer, ptr });
        }

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: slot_count as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: slot_count as u32,
            },
        ];
        let dp_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: slot_count as u32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let desc_pool = device
            .create_descriptor_pool(&dp_ci, None)
            .context("create_descriptor_pool")?;

        let layouts = vec![set_layout; slot_count];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: desc_pool,
            descriptor_set_count: slot_count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let desc_sets = device
            .allocate_descriptor_sets(&alloc)
            .context("allocate_descriptor_sets")?;

        // infos are fully built before any write points into them
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = uniforms
            .iter()
            .map(|u| vk::DescriptorBufferInfo {
                buffer: u.buffer.buffer,
                offset: 0,
                range: ubo_size,
            })
            .collect();
        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view: texture_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let mut writes = Vec::with_capacity(slot_count * 2);
        for (set, info) in desc_sets.iter().zip(&buffer_infos) {
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: *set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            });
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: *set,
                dst_binding: 1,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: &image_info,
                ..Default::default()
            });
        }
        device.update_descriptor_sets(&writes, &[]);

        info!(
            "resources ready: {}x{} texture, {} vertices, {} indices, {} frame slots",
            tex.width,
            tex.height,
            QUAD_VERTICES.len(),
            QUAD_INDICES.len(),
            slot_count
        );

        Ok(Self {
            set_layout,
            shaders,
            pipeline,
            cmd_pool,
            texture,
            texture_view,
            sampler,
            vertex_buffer,
            index_buffer,
            index_count: QUAD_INDICES.len() as u32,
            uniforms,
            desc_pool,
            desc_sets,
        })
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.cmd_pool
    }

    /// Rebuilds the pipeline against a new render pass. The device must be idle.
    pub unsafe fn rebuild_pipeline(&mut self, device: &ash::Device, render_pass: vk::RenderPass) -> Result<()> {
        self.pipeline.destroy(device);
        self.pipeline = create_pipeline(device, render_pass, self.set_layout, &self.shaders)?;
        info!("pipeline rebuilt for new render pass");
        Ok(())
    }

    /// Caller guarantees the slot's fence has signaled.
    pub unsafe fn write_uniforms(&mut self, slot: usize, block: &UniformBlock) -> Result<()> {
        let Some(u) = self.uniforms.get(slot) else {
            bail!("no uniform buffer for slot {slot}");
        };
        let bytes = block.as_bytes();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), u.ptr, bytes.len());
        Ok(())
    }

    /// Records the whole frame: clear, bind everything for `slot`, draw the quad.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn record_draw(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        slot: usize,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: vk::ClearValue,
    ) -> Result<()> {
        let set = *self
            .desc_sets
            .get(slot)
            .with_context(|| format!("no descriptor set for slot {slot}"))?;

        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("reset_command_buffer")?;
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        device.begin_command_buffer(cmd, &bi).context("begin_command_buffer")?;

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass,
            framebuffer,
            render_area: area,
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
        device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));

        let offsets = [0_u64];
        device.cmd_bind_vertex_buffers(cmd, 0, std::slice::from_ref(&self.vertex_buffer.buffer), &offsets);
        device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.layout,
            0,
            std::slice::from_ref(&set),
            &[],
        );
        device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);

        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd).context("end_command_buffer")?;
        Ok(())
    }

    /// Strict reverse of `new`. Frame slots must already be destroyed and the device idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        // frees the sets with it
        device.destroy_descriptor_pool(self.desc_pool, None);
        self.desc_sets.clear();
        for u in self.uniforms.drain(..) {
            device.unmap_memory(u.buffer.memory);
            u.buffer.destroy(device);
        }
        self.index_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
        device.destroy_sampler(self.sampler, None);
        device.destroy_image_view(self.texture_view, None);
        self.texture.destroy(device);
        device.destroy_command_pool(self.cmd_pool, None);
        self.pipeline.destroy(device);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}
