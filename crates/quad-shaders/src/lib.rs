// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V for the quad, compiled from `shaders/*.vert|frag` at build time.

pub const VERTEX_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv"));
pub const FRAGMENT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv"));

/// File names the app looks for, paired with their contents.
pub const OUTPUTS: [(&str, &[u8]); 2] = [("quad.vert.spv", VERTEX_SPV), ("quad.frag.spv", FRAGMENT_SPV)];

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = 0x0723_0203_u32.to_le_bytes();

    #[test]
    fn both_stages_are_spirv_modules() {
        for (name, spv) in OUTPUTS {
            assert!(spv.len() > 20, "{name} is too short");
            assert_eq!(spv.len() % 4, 0, "{name} is not word aligned");
            assert_eq!(spv[..4], MAGIC, "{name} has no SPIR-V magic");
        }
    }
}
