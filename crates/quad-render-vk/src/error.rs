// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Conditions callers and tests need to tell apart. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type in bits {type_bits:#034b} has properties {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("image layout transition {from:?} -> {to:?} is not in the barrier table")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("surface reports no present modes")]
    NoPresentMode,

    #[error("no physical device with graphics + present queues, VK_KHR_swapchain and sampler anisotropy")]
    NoSuitableDevice,

    #[error("instance layer {0} is not available")]
    MissingLayer(String),

    #[error("{width}x{height} RGBA8 image needs {expected} bytes, got {actual}")]
    PixelSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("cannot upload zero bytes")]
    EmptyUpload,
}
