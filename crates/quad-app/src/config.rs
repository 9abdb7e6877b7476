// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use quad_platform::WindowConfig;
use quad_render::{PresentPreference, RenderPrefs};
use quad_render_vk::MAX_FRAMES_IN_FLIGHT;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
    pub assets: AssetCfg,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowCfg {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub present_mode: PresentPreference,
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// Only honoured in debug builds.
    #[serde(default = "default_validation")]
    pub validation: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AssetCfg {
    #[serde(default = "default_vertex_shader")]
    pub vertex_shader: PathBuf,
    #[serde(default = "default_fragment_shader")]
    pub fragment_shader: PathBuf,
    #[serde(default = "default_texture")]
    pub texture: PathBuf,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            width: default_width(),
            height: default_height(),
            title: default_title(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            present_mode: PresentPreference::default(),
            frames_in_flight: default_frames_in_flight(),
            validation: default_validation(),
        }
    }
}

impl Default for AssetCfg {
    fn default() -> Self {
        AssetCfg {
            vertex_shader: default_vertex_shader(),
            fragment_shader: default_fragment_shader(),
            texture: default_texture(),
        }
    }
}

fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_title() -> String {
    "quadlight".to_owned()
}
fn default_clear() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}
fn default_frames_in_flight() -> usize {
    2
}
fn default_validation() -> bool {
    true
}
fn default_vertex_shader() -> PathBuf {
    PathBuf::from("shaders/quad.vert.spv")
}
fn default_fragment_shader() -> PathBuf {
    PathBuf::from("shaders/quad.frag.spv")
}
fn default_texture() -> PathBuf {
    PathBuf::from("textures/texture.png")
}

impl WindowCfg {
    pub fn to_window_config(&self) -> WindowConfig {
        WindowConfig {
            title: self.title.clone(),
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }
}

impl RenderCfg {
    pub fn to_prefs(&self) -> RenderPrefs {
        let frames = self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if frames != self.frames_in_flight {
            warn!(
                "frames_in_flight = {} out of range, using {frames}",
                self.frames_in_flight
            );
        }
        RenderPrefs {
            present: self.present_mode,
            frames_in_flight: frames,
            validation: self.validation && cfg!(debug_assertions),
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg> {
    Ok(toml::from_str::<AppCfg>(text)?)
}

/// Missing file means defaults; an unreadable or malformed one is reported and ignored.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("ignoring {}: {e:#}", path.display());
            AppCfg::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no {}, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("cannot read {}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!((cfg.window.width, cfg.window.height), (800, 600));
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.render.present_mode, PresentPreference::Mailbox);
        assert_eq!(cfg.render.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.assets.texture, PathBuf::from("textures/texture.png"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [window]
            width = 1280

            [render]
            present_mode = "fifo"
            clear_color = [0.1, 0.2, 0.3, 1.0]

            [assets]
            texture = "textures/other.jpg"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.window.height, 600);
        assert_eq!(cfg.window.title, "quadlight");
        assert_eq!(cfg.render.present_mode, PresentPreference::Fifo);
        assert_eq!(cfg.render.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.assets.texture, PathBuf::from("textures/other.jpg"));
        assert_eq!(cfg.assets.vertex_shader, PathBuf::from("shaders/quad.vert.spv"));
    }

    #[test]
    fn unknown_present_mode_is_a_parse_error() {
        assert!(parse_cfg("[render]\npresent_mode = \"vsync\"\n").is_err());
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut r = RenderCfg {
            frames_in_flight: 0,
            ..RenderCfg::default()
        };
        assert_eq!(r.to_prefs().frames_in_flight, 1);
        r.frames_in_flight = 9;
        assert_eq!(r.to_prefs().frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        r.frames_in_flight = 3;
        assert_eq!(r.to_prefs().frames_in_flight, 3);
    }

    #[test]
    fn validation_needs_a_debug_build() {
        let r = RenderCfg::default();
        assert_eq!(r.to_prefs().validation, cfg!(debug_assertions));
        let off = RenderCfg {
            validation: false,
            ..RenderCfg::default()
        };
        assert!(!off.to_prefs().validation);
    }

    #[test]
    fn zero_window_size_is_bumped() {
        let w = WindowCfg {
            width: 0,
            height: 0,
            ..WindowCfg::default()
        };
        let wc = w.to_window_config();
        assert_eq!((wc.width, wc.height), (1, 1));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("quadlight-missing-config.toml");
        assert_eq!(load_cfg(&path), AppCfg::default());
    }

    #[test]
    fn unreadable_path_gives_defaults() {
        let dir = std::env::temp_dir().join(format!("quadlight-cfg-dir-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let err = fs::read_to_string(&dir).unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(load_cfg(&dir), AppCfg::default());
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("quadlight-bad-{}.toml", std::process::id()));
        fs::write(&path, "[window\nwidth = ").unwrap();
        let cfg = load_cfg(&path);
        let _ = fs::remove_file(&path);
        assert_eq!(cfg, AppCfg::default());
    }
}
