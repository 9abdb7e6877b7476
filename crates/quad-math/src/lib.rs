// SPDX-License-Identifier: CEPL-1.0
//! Per-frame transform data shared between the host and the vertex shader.

use glam::{Mat4, Vec3};

/// Degrees the quad turns per second of elapsed time.
pub const SPIN_DEG_PER_SEC: f32 = 90.0;
pub const FOV_Y_DEG: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 10.0;

const EYE: Vec3 = Vec3::new(2.0, 2.0, 2.0);
const UP: Vec3 = Vec3::Z;

/// Matches `layout(binding = 0) uniform UniformBufferObject { mat4 model; mat4 view; mat4 proj; }`.
/// Matrices are column-major, the same as GLSL expects.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UniformBlock {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl UniformBlock {
    pub const SIZE: usize = std::mem::size_of::<UniformBlock>();

    pub fn from_matrices(model: Mat4, view: Mat4, proj: Mat4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
        }
    }

    /// Spinning quad seen from above at an angle.
    ///
    /// `width`/`height` are the current swapchain extent; a zero height (minimized)
    /// falls back to a square aspect instead of dividing by zero.
    pub fn animated(elapsed_secs: f32, width: u32, height: u32) -> Self {
        let model = Mat4::from_rotation_z(elapsed_secs * SPIN_DEG_PER_SEC.to_radians());
        let view = Mat4::look_at_rh(EYE, Vec3::ZERO, UP);
        let proj = vulkan_perspective(aspect_ratio(width, height));
        Self::from_matrices(model, view, proj)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    if width == 0 || height == 0 {
        1.0
    } else {
        width as f32 / height as f32
    }
}

/// Right-handed perspective with 0..1 depth and the Y axis flipped for Vulkan clip space.
pub fn vulkan_perspective(aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(FOV_Y_DEG.to_radians(), aspect, Z_NEAR, Z_FAR);
    proj.y_axis.y *= -1.0;
    proj
}
