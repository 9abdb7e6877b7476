// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod geometry;

pub use geometry::{Vertex, QUAD_INDICES, QUAD_VERTICES};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Minimized windows report a zero-sized drawable on most platforms.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    /// Low-latency triple buffering when available.
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPrefs {
    pub present: PresentPreference,
    pub frames_in_flight: usize,
    pub validation: bool,
}

impl Default for RenderPrefs {
    fn default() -> Self {
        Self {
            present: PresentPreference::Mailbox,
            frames_in_flight: 2,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Decoded RGBA8 pixels, row-major, no padding.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Everything the renderer reads from disk, already loaded by the caller.
#[derive(Clone, Debug)]
pub struct SceneAssets {
    pub vertex_spirv: Vec<u8>,
    pub fragment_spirv: Vec<u8>,
    pub texture: TextureData,
}

/// The window as seen by a renderer after creation.
pub trait Drawable {
    /// Current drawable size in pixels. Call `pump_events` first for a fresh value.
    fn drawable_size(&self) -> RenderSize;
    fn pump_events(&mut self);
    /// Like `pump_events`, but blocks briefly until something arrives. Used while minimized.
    fn wait_events(&mut self);
    fn elapsed(&self) -> Duration;
    /// Returns whether a resize was reported since the last call, and clears it.
    fn take_resized(&mut self) -> bool;
    fn close_requested(&self) -> bool;
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        prefs: &RenderPrefs,
        assets: &SceneAssets,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Runs one frame. Stale or minimized surfaces are handled internally.
    fn render(&mut self, drawable: &mut dyn Drawable) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    /// Drains all GPU work; call before dropping the window.
    fn wait_idle(&mut self) -> Result<()>;
}
