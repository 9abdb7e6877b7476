// SPDX-License-Identifier: CEPL-1.0

/// One vertex of the textured quad. Field order and packing are the vertex-buffer layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { pos: [-0.5, -0.5], color: [1.0, 0.0, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [0.5, -0.5], color: [0.0, 1.0, 0.0], uv: [0.0, 0.0] },
    Vertex { pos: [0.5, 0.5], color: [0.0, 0.0, 1.0], uv: [0.0, 1.0] },
    Vertex { pos: [-0.5, 0.5], color: [1.0, 1.0, 1.0], uv: [1.0, 1.0] },
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 28);
        assert_eq!(offset_of!(Vertex, pos), 0);
        assert_eq!(offset_of!(Vertex, color), 8);
        assert_eq!(offset_of!(Vertex, uv), 20);
    }

    #[test]
    fn quad_bytes_match_counts() {
        assert_eq!(bytemuck::cast_slice::<_, u8>(&QUAD_VERTICES).len(), 4 * 28);
        assert_eq!(bytemuck::cast_slice::<_, u8>(&QUAD_INDICES).len(), 12);
    }

    #[test]
    fn indices_reference_existing_vertices() {
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn both_triangles_share_winding() {
        let area = |a: u16, b: u16, c: u16| {
            let [ax, ay] = QUAD_VERTICES[a as usize].pos;
            let [bx, by] = QUAD_VERTICES[b as usize].pos;
            let [cx, cy] = QUAD_VERTICES[c as usize].pos;
            (bx - ax) * (cy - ay) - (by - ay) * (cx - ax)
        };
        let first = area(QUAD_INDICES[0], QUAD_INDICES[1], QUAD_INDICES[2]);
        let second = area(QUAD_INDICES[3], QUAD_INDICES[4], QUAD_INDICES[5]);
        assert!(first * second > 0.0);
    }
}
