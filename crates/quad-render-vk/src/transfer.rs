// SPDX-License-Identifier: CEPL-1.0
//! Staging uploads, image layout transitions and the debug readback path.
//!
//! Every operation records into a one-shot command buffer from a dedicated transient pool,
//! submits to the graphics queue and waits for the queue to drain before returning. Staging
//! memory is released before the call returns.

use anyhow::{Context, Result};
use ash::vk;
use tracing::debug;

use crate::memory::{rgba8_len, GpuBuffer, GpuImage, MemoryAllocator};
use crate::RenderError;

/// Access and stage masks for one image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Layouts a freshly created texture passes through on upload.
pub const TEXTURE_UPLOAD_PATH: [vk::ImageLayout; 2] = [
    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
];

/// The closed barrier table. Pairs not listed here are rejected.
pub fn barrier_for(from: vk::ImageLayout, to: vk::ImageLayout) -> Result<TransitionMasks, RenderError> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (from, to) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        // readback round trip
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_READ, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        _ => return Err(RenderError::UnsupportedTransition { from, to }),
    };
    Ok(TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// One step of a planned transition chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedTransition {
    pub from: vk::ImageLayout,
    pub to: vk::ImageLayout,
    pub masks: TransitionMasks,
}

/// Resolves the barriers that walk an image from `current` through `targets`.
/// Fails before anything is recorded if any hop is outside the table.
pub fn plan_transitions(
    current: vk::ImageLayout,
    targets: &[vk::ImageLayout],
) -> Result<Vec<PlannedTransition>, RenderError> {
    let mut from = current;
    let mut plan = Vec::with_capacity(targets.len());
    for &to in targets {
        plan.push(PlannedTransition {
            from,
            to,
            masks: barrier_for(from, to)?,
        });
        from = to;
    }
    Ok(plan)
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn full_image_copy(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

/// Byte count `pixels` must have for a `width` x `height` RGBA8 upload.
/// `expected` saturates at `usize::MAX` when the dimensions overflow.
fn check_rgba8(pixels: &[u8], width: u32, height: u32) -> Result<usize, RenderError> {
    let mismatch = |expected| RenderError::PixelSizeMismatch {
        width,
        height,
        expected,
        actual: pixels.len(),
    };
    let expected = rgba8_len(width, height).ok_or_else(|| mismatch(usize::MAX))?;
    if expected == 0 {
        return Err(RenderError::EmptyUpload);
    }
    if pixels.len() != expected {
        return Err(mismatch(expected));
    }
    Ok(expected)
}

pub struct TransferEngine {
    device: ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    allocator: MemoryAllocator,
}

impl TransferEngine {
    pub unsafe fn new(
        device: ash::Device,
        queue: vk::Queue,
        queue_family: u32,
        allocator: MemoryAllocator,
    ) -> Result<Self> {
        let pci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: queue_family,
            ..Default::default()
        };
        let pool = device
            .create_command_pool(&pci, None)
            .context("create_command_pool(transfer)")?;
        Ok(Self {
            device,
            queue,
            pool,
            allocator,
        })
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Records `record` into a fresh primary buffer, submits it and blocks until the queue is idle.
    unsafe fn one_shot(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = self
            .device
            .allocate_command_buffers(&ai)
            .context("allocate_command_buffers(one-shot)")?[0];
        let res = self.submit_and_wait(cmd, record);
        self.device.free_command_buffers(self.pool, std::slice::from_ref(&cmd));
        res
    }

    unsafe fn submit_and_wait(&self, cmd: vk::CommandBuffer, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        self.device.begin_command_buffer(cmd, &bi).context("begin_command_buffer")?;
        record(cmd);
        self.device.end_command_buffer(cmd).context("end_command_buffer")?;

        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        self.device
            .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())
            .context("queue_submit(one-shot)")?;
        self.device.queue_wait_idle(self.queue).context("queue_wait_idle")?;
        Ok(())
    }

    /// Host-visible TRANSFER_SRC buffer holding a copy of `data`.
    unsafe fn stage(&self, data: &[u8]) -> Result<GpuBuffer> {
        let size = data.len() as vk::DeviceSize;
        let staging = self.allocator.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        match self.allocator.map(staging.memory, size) {
            Ok(ptr) => {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
                self.allocator.unmap(staging.memory);
                Ok(staging)
            }
            Err(e) => {
                staging.destroy(&self.device);
                Err(e)
            }
        }
    }

    unsafe fn record_transition(&self, cmd: vk::CommandBuffer, image: vk::Image, step: &PlannedTransition) {
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: step.masks.src_access,
            dst_access_mask: step.masks.dst_access,
            old_layout: step.from,
            new_layout: step.to,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: color_range(),
            ..Default::default()
        };
        self.device.cmd_pipeline_barrier(
            cmd,
            step.masks.src_stage,
            step.masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }

    /// Copies `data` into a new DEVICE_LOCAL buffer. The buffer also carries TRANSFER_SRC so it
    /// can be read back.
    pub unsafe fn upload_to_device_local(&self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        if data.is_empty() {
            return Err(RenderError::EmptyUpload.into());
        }
        let staging = self.stage(data)?;
        let res = self.copy_into_new_buffer(&staging, usage);
        staging.destroy(&self.device);
        if let Ok(buf) = &res {
            debug!("uploaded {} bytes to device-local buffer {:?}", buf.size, buf.buffer);
        }
        res
    }

    unsafe fn copy_into_new_buffer(&self, staging: &GpuBuffer, usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        let dst = self.allocator.create_buffer(
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging.size,
        };
        let copied = self.one_shot(|cmd| {
            self.device
                .cmd_copy_buffer(cmd, staging.buffer, dst.buffer, std::slice::from_ref(&region));
        });
        if let Err(e) = copied {
            dst.destroy(&self.device);
            return Err(e);
        }
        Ok(dst)
    }

    /// Uploads tightly packed RGBA8 pixels into a new sampled image left in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub unsafe fn upload_image(&self, pixels: &[u8], width: u32, height: u32, format: vk::Format) -> Result<GpuImage> {
        check_rgba8(pixels, width, height)?;

        let plan = plan_transitions(vk::ImageLayout::UNDEFINED, &TEXTURE_UPLOAD_PATH)?;
        let staging = self.stage(pixels)?;
        let res = self.copy_into_new_image(&staging, vk::Extent2D { width, height }, format, &plan);
        staging.destroy(&self.device);
        if res.is_ok() {
            debug!("uploaded {width}x{height} {format:?} texture");
        }
        res
    }

    unsafe fn copy_into_new_image(
        &self,
        staging: &GpuBuffer,
        extent: vk::Extent2D,
        format: vk::Format,
        plan: &[PlannedTransition],
    ) -> Result<GpuImage> {
        let mut image = self.allocator.create_image(
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let region = full_image_copy(extent);

        // plan = [UNDEFINED -> TRANSFER_DST, TRANSFER_DST -> SHADER_READ_ONLY]
        let copied = self.one_shot(|cmd| {
            self.record_transition(cmd, image.image, &plan[0]);
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            for step in &plan[1..] {
                self.record_transition(cmd, image.image, step);
            }
        });
        if let Err(e) = copied {
            image.destroy(&self.device);
            return Err(e);
        }
        if let Some(last) = plan.last() {
            image.layout = last.to;
        }
        Ok(image)
    }

    /// Host-visible TRANSFER_DST buffer of `size` bytes, filled by `record`, copied out to a Vec.
    unsafe fn read_into_host(
        &self,
        size: vk::DeviceSize,
        record: impl FnOnce(vk::CommandBuffer, vk::Buffer),
    ) -> Result<Vec<u8>> {
        let host = self.allocator.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let res = self.one_shot(|cmd| record(cmd, host.buffer)).and_then(|()| {
            let ptr = self.allocator.map(host.memory, size)?;
            let out = std::slice::from_raw_parts(ptr, size as usize).to_vec();
            self.allocator.unmap(host.memory);
            Ok(out)
        });
        host.destroy(&self.device);
        res
    }

    /// Debug path: copies a device-local buffer back to host memory.
    pub unsafe fn read_back_buffer(&self, src: &GpuBuffer) -> Result<Vec<u8>> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        self.read_into_host(src.size, |cmd, host| {
            self.device
                .cmd_copy_buffer(cmd, src.buffer, host, std::slice::from_ref(&region));
        })
    }

    /// Debug path: copies a sampled image back to host memory and returns it to its prior layout.
    pub unsafe fn read_back_image(&self, image: &mut GpuImage) -> Result<Vec<u8>> {
        let restore = image.layout;
        let plan = plan_transitions(restore, &[vk::ImageLayout::TRANSFER_SRC_OPTIMAL, restore])?;
        let region = full_image_copy(image.extent);
        let handle = image.image;
        let len = image
            .byte_len()
            .with_context(|| format!("{}x{} image too large to read back", image.extent.width, image.extent.height))?;

        let bytes = self.read_into_host(len as vk::DeviceSize, |cmd, host| {
            self.record_transition(cmd, handle, &plan[0]);
            self.device.cmd_copy_image_to_buffer(
                cmd,
                handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                host,
                std::slice::from_ref(&region),
            );
            self.record_transition(cmd, handle, &plan[1]);
        })?;
        image.layout = restore;
        Ok(bytes)
    }

    pub unsafe fn destroy(&mut self) {
        if self.pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.pool, None);
            self.pool = vk::CommandPool::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn undefined_to_transfer_dst() {
        let m = barrier_for(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::empty());
        assert_eq!(m.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn transfer_dst_to_shader_read() {
        let m = barrier_for(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(m.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn pairs_outside_the_table_are_rejected() {
        for (from, to) in [
            (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL),
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::UNDEFINED),
            (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL),
        ] {
            match barrier_for(from, to) {
                Err(RenderError::UnsupportedTransition { from: f, to: t }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("{from:?} -> {to:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn texture_upload_walks_exactly_two_transitions() {
        let plan = plan_transitions(L::UNDEFINED, &TEXTURE_UPLOAD_PATH).unwrap();
        let hops: Vec<_> = plan.iter().map(|p| (p.from, p.to)).collect();
        assert_eq!(
            hops,
            vec![
                (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
                (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            ]
        );
    }

    #[test]
    fn a_third_undefined_hop_fails_the_whole_plan() {
        let err = plan_transitions(
            L::UNDEFINED,
            &[
                L::TRANSFER_DST_OPTIMAL,
                L::SHADER_READ_ONLY_OPTIMAL,
                L::COLOR_ATTACHMENT_OPTIMAL,
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnsupportedTransition {
                from: L::SHADER_READ_ONLY_OPTIMAL,
                to: L::COLOR_ATTACHMENT_OPTIMAL
            }
        ));
    }

    #[test]
    fn readback_round_trip_is_in_the_table() {
        let plan = plan_transitions(
            L::SHADER_READ_ONLY_OPTIMAL,
            &[L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL],
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].to, L::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn pixel_buffers_are_checked_before_any_gpu_work() {
        assert_eq!(check_rgba8(&[0; 16], 2, 2).unwrap(), 16);
        assert!(matches!(
            check_rgba8(&[0; 12], 2, 2),
            Err(RenderError::PixelSizeMismatch {
                expected: 16,
                actual: 12,
                ..
            })
        ));
        assert!(matches!(check_rgba8(&[], 0, 16), Err(RenderError::EmptyUpload)));
    }

    #[test]
    fn absurd_dimensions_are_a_mismatch_not_a_panic() {
        match check_rgba8(&[0; 4], u32::MAX, u32::MAX) {
            Err(RenderError::PixelSizeMismatch {
                width,
                height,
                expected,
                actual,
            }) => {
                assert_eq!((width, height), (u32::MAX, u32::MAX));
                assert_eq!(expected, usize::MAX);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
