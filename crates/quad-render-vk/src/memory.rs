// SPDX-License-Identifier: CEPL-1.0
//! Memory type lookup and the allocate / map / bind primitives everything else builds on.

use anyhow::{Context, Result};
use ash::vk;

use crate::RenderError;

/// First memory type whose bit is set in `type_bits` and whose flags contain `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize].property_flags.contains(required)
        })
        .ok_or(RenderError::NoSuitableMemoryType { type_bits, required })
}

/// Byte count of a tightly packed RGBA8 image, `None` if it does not fit in `usize`.
pub fn rgba8_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(4))
}

/// A buffer and the dedicated allocation backing it.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

/// A single-mip 2D color image, its allocation and the layout it was last transitioned to.
#[derive(Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub(crate) layout: vk::ImageLayout,
}

impl GpuImage {
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// RGBA8 byte count of the full image.
    pub fn byte_len(&self) -> Option<usize> {
        rgba8_len(self.extent.width, self.extent.height)
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

/// Dedicated-allocation adapter: one `vkAllocateMemory` per resource.
#[derive(Clone)]
pub struct MemoryAllocator {
    device: ash::Device,
    props: vk::PhysicalDeviceMemoryProperties,
}

impl MemoryAllocator {
    pub fn new(device: ash::Device, props: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { device, props }
    }

    pub fn memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Result<u32, RenderError> {
        find_memory_type(&self.props, type_bits, required)
    }

    pub unsafe fn allocate(
        &self,
        req: vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: self.memory_type(req.memory_type_bits, props)?,
            ..Default::default()
        };
        Ok(self.device.allocate_memory(&mai, None).context("allocate_memory")?)
    }

    /// Maps `[0, size)` of a host-visible allocation.
    pub unsafe fn map(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<*mut u8> {
        let ptr = self
            .device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            .context("map_memory")?;
        Ok(ptr.cast())
    }

    pub unsafe fn unmap(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory);
    }

    pub unsafe fn bind_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        self.device
            .bind_buffer_memory(buffer, memory, 0)
            .context("bind_buffer_memory")
    }

    pub unsafe fn bind_image(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()> {
        self.device
            .bind_image_memory(image, memory, 0)
            .context("bind_image_memory")
    }

    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<GpuBuffer> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = self.device.create_buffer(&bci, None).context("create_buffer")?;
        let req = self.device.get_buffer_memory_requirements(buffer);

        let memory = match self.allocate(req, props) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        let out = GpuBuffer { buffer, memory, size };
        if let Err(e) = self.bind_buffer(buffer, memory) {
            out.destroy(&self.device);
            return Err(e);
        }
        Ok(out)
    }

    /// Optimal-tiling 2D image in `UNDEFINED` layout.
    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<GpuImage> {
        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = self.device.create_image(&ici, None).context("create_image")?;
        let req = self.device.get_image_memory_requirements(image);

        let memory = match self.allocate(req, props) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_image(image, None);
                return Err(e);
            }
        };
        let out = GpuImage {
            image,
            memory,
            extent,
            format,
            layout: vk::ImageLayout::UNDEFINED,
        };
        if let Err(e) = self.bind_image(image, memory) {
            out.destroy(&self.device);
            return Err(e);
        }
        Ok(out)
    }
}
