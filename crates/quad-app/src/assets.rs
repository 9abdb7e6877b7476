// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use quad_render::{SceneAssets, TextureData};
use tracing::info;

use crate::config::AssetCfg;

pub fn load_assets(cfg: &AssetCfg) -> Result<SceneAssets> {
    let vertex_spirv =
        fs::read(&cfg.vertex_shader).with_context(|| format!("read {}", cfg.vertex_shader.display()))?;
    let fragment_spirv =
        fs::read(&cfg.fragment_shader).with_context(|| format!("read {}", cfg.fragment_shader.display()))?;
    let texture = load_texture(&cfg.texture)?;
    Ok(SceneAssets {
        vertex_spirv,
        fragment_spirv,
        texture,
    })
}

/// Decodes any supported image to tightly packed RGBA8.
pub fn load_texture(path: &Path) -> Result<TextureData> {
    let img = image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .to_rgba8();
    let (width, height) = img.dimensions();
    info!("texture {}: {width}x{height}", path.display());
    Ok(TextureData {
        pixels: img.into_raw(),
        width,
        height,
    })
}
