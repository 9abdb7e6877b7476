// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use quad_core::init_tracing;
use quad_platform::Platform;
use quad_render::{Drawable, RenderSize, Renderer};
use quad_render_vk::VkRenderer;
use tracing::info;

mod assets;
mod config;

use assets::load_assets;
use config::load_cfg;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; defaults apply when it does not exist
    #[arg(long, default_value = "quadlight.toml")]
    config: PathBuf,
    /// Initial window width, overrides the config
    #[arg(long)]
    width: Option<u32>,
    /// Initial window height, overrides the config
    #[arg(long)]
    height: Option<u32>,
}

/// Pump, render, repeat until the window asks to close.
fn run(renderer: &mut impl Renderer, platform: &mut Platform) -> Result<()> {
    let mut frames: u32 = 0;
    let mut last_fps_instant = Instant::now();
    loop {
        platform.pump_events();
        if platform.close_requested() {
            info!("close requested, leaving render loop");
            return Ok(());
        }
        renderer.render(platform)?;
        frames = frames.saturating_add(1);

        let now = Instant::now();
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", frames);
            frames = 0;
            last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    if let Some(w) = args.width {
        cfg.window.width = w;
    }
    if let Some(h) = args.height {
        cfg.window.height = h;
    }

    // fail on missing files before a window flashes up
    let assets = load_assets(&cfg.assets)?;

    let window_cfg = cfg.window.to_window_config();
    let mut platform = Platform::new(&window_cfg)?;
    let size = match platform.drawable_size() {
        s if s.is_empty() => RenderSize::new(window_cfg.width, window_cfg.height),
        s => s,
    };

    let prefs = cfg.render.to_prefs();
    info!(
        "present = {:?}, frames in flight = {}, validation = {}",
        prefs.present, prefs.frames_in_flight, prefs.validation
    );
    let mut renderer = VkRenderer::new(platform.window(), platform.window(), size, &prefs, &assets)?;
    renderer.set_clear_color(cfg.render.clear_color);

    run(&mut renderer, &mut platform)?;

    renderer.wait_idle()?;
    // surface goes before the window it was created from
    drop(renderer);
    drop(platform);
    info!("clean shutdown");
    Ok(())
}
