// SPDX-License-Identifier: CEPL-1.0
//! Window ownership and event pumping.
//!
//! The app drives its own tick loop, so events are pulled with
//! `pump_app_events` instead of handing control to `run_app`.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use quad_render::{Drawable, RenderSize};
use tracing::{debug, info};

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

/// Upper bound on pumps spent waiting for the platform to hand us a window.
const MAX_STARTUP_PUMPS: usize = 1_000;
/// Longest a minimized-window wait blocks before re-checking the drawable.
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "quadlight".to_owned(),
            width: 800,
            height: 600,
        }
    }
}

struct WindowState {
    attrs: WindowAttributes,
    window: Option<Window>,
    window_id: Option<WindowId>,
    create_error: Option<OsError>,
    resized: bool,
    close_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window_id.is_some() {
            return;
        }
        match event_loop.create_window(self.attrs.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                info!("window created ({}x{})", size.width, size.height);
                self.window_id = Some(window.id());
                self.window = Some(window);
            }
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window_id != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                debug!("Resized → {}x{}", size.width, size.height);
                self.resized = true;
            }
            _ => {}
        }
    }
}

pub struct Platform {
    window: Window,
    state: WindowState,
    event_loop: EventLoop<()>,
    started: Instant,
}

impl Platform {
    /// Opens the window and pumps until the platform has delivered it.
    pub fn new(cfg: &WindowConfig) -> Result<Self> {
        let mut event_loop: EventLoop<()> = EventLoop::new().context("EventLoop::new")?;
        let mut state = WindowState {
            attrs: Window::default_attributes()
                .with_title(cfg.title.clone())
                .with_inner_size(PhysicalSize::new(cfg.width, cfg.height))
                .with_resizable(true),
            window: None,
            window_id: None,
            create_error: None,
            resized: false,
            close_requested: false,
        };

        for _ in 0..MAX_STARTUP_PUMPS {
            if let PumpStatus::Exit(code) = event_loop.pump_app_events(Some(Duration::ZERO), &mut state) {
                return Err(anyhow!("event loop exited during startup (code {code})"));
            }
            if let Some(e) = state.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if let Some(window) = state.window.take() {
                return Ok(Self {
                    window,
                    state,
                    event_loop,
                    started: Instant::now(),
                });
            }
        }
        Err(anyhow!("no window after {MAX_STARTUP_PUMPS} event pumps"))
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    fn pump(&mut self, timeout: Duration) {
        if let PumpStatus::Exit(_) = self.event_loop.pump_app_events(Some(timeout), &mut self.state) {
            self.state.close_requested = true;
        }
    }
}

impl Drawable for Platform {
    fn drawable_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize::new(size.width, size.height)
    }

    fn pump_events(&mut self) {
        self.pump(Duration::ZERO);
    }

    fn wait_events(&mut self) {
        self.pump(IDLE_WAIT);
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }
}
