// SPDX-License-Identifier: CEPL-1.0
//! Writes the build-time compiled shaders to where `quadlight` loads them from.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use quad_core::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output directory
    #[arg(long, default_value = "shaders")]
    out: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    fs::create_dir_all(&args.out).with_context(|| format!("create {}", args.out.display()))?;
    for (name, spv) in quad_shaders::OUTPUTS {
        let path = args.out.join(name);
        fs::write(&path, spv).with_context(|| format!("write {}", path.display()))?;
        info!("wrote {} ({} bytes)", path.display(), spv.len());
    }
    Ok(())
}
