use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::gfx::{VertexAttribFormat, VertexFormatDesc, VertexSemantic};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct BillboardVertex {
    pub position: [f32; 3],
    /// Corner u, corner v, animation time, unused.
    pub texcoord: [u8; 4],
    /// Width, height, rotation angle.
    pub size_angle: [f32; 3],
    pub color: [u8; 4],
}

impl BillboardVertex {
    pub fn format() -> VertexFormatDesc {
        VertexFormatDesc::new()
            .with(VertexSemantic::Position, VertexAttribFormat::Float3)
            .with(VertexSemantic::TexCoord(0), VertexAttribFormat::UByte4N)
            .with(VertexSemantic::TexCoord(1), VertexAttribFormat::Float3)
            .with(VertexSemantic::Color, VertexAttribFormat::Color)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct DecalVertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 4],
    pub color: [u8; 4],
}

impl DecalVertex {
    pub fn format() -> VertexFormatDesc {
        VertexFormatDesc::new()
            .with(VertexSemantic::Position, VertexAttribFormat::Float3)
            .with(VertexSemantic::TexCoord(0), VertexAttribFormat::Float4)
            .with(VertexSemantic::Color, VertexAttribFormat::Color)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct WaterVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub padding: [u8; 12],
}

impl WaterVertex {
    pub fn format() -> VertexFormatDesc {
        VertexFormatDesc::new()
            .with(VertexSemantic::Position, VertexAttribFormat::Float3)
            .with(VertexSemantic::TexCoord(0), VertexAttribFormat::Float2)
            .with_padding(12)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct ScreenVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

impl ScreenVertex {
    pub fn format() -> VertexFormatDesc {
        VertexFormatDesc::new()
            .with(VertexSemantic::Position, VertexAttribFormat::Float2)
            .with(VertexSemantic::TexCoord(0), VertexAttribFormat::Float2)
    }
}

/// Packs a `[0, 1]` float into a normalized byte.
#[inline]
pub fn pack_unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
pub fn pack_color(color: Vec4) -> [u8; 4] {
    [
        pack_unorm8(color.x),
        pack_unorm8(color.y),
        pack_unorm8(color.z),
        pack_unorm8(color.w),
    ]
}

/// Indices of `quad_count` quads laid out as (0,1,2, 0,2,3) + 4i.
pub fn quad_indices(quad_count: usize) -> Vec<u16> {
    let mut indices = Vec::with_capacity(quad_count * 6);
    for quad in 0..quad_count {
        let base = (quad * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    indices
}

/// Flat XZ plane centred on the origin, `subdivisions` cells per side.
pub fn plane_mesh(half_extent: f32, subdivisions: u16) -> (Vec<WaterVertex>, Vec<u16>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let cells = subdivisions.max(1);
    let row = cells + 1;

    for iz in 0..=cells {
        let tz = iz as f32 / cells as f32;
        for ix in 0..=cells {
            let tx = ix as f32 / cells as f32;
            vertices.push(WaterVertex {
                position: [
                    -half_extent + 2.0 * half_extent * tx,
                    0.0,
                    -half_extent + 2.0 * half_extent * tz,
                ],
                uv: [tx, tz],
                padding: [0; 12],
            });
        }
    }

    for iz in 0..cells {
        for ix in 0..cells {
            let current = iz * row + ix;
            let next = current + row;

            // Two triangles per cell
            indices.extend_from_slice(&[current, next, current + 1]);
            indices.extend_from_slice(&[current + 1, next, next + 1]);
        }
    }

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_strides_match_struct_sizes() {
        assert_eq!(BillboardVertex::format().stride() as usize, std::mem::size_of::<BillboardVertex>());
        assert_eq!(DecalVertex::format().stride() as usize, std::mem::size_of::<DecalVertex>());
        assert_eq!(WaterVertex::format().stride() as usize, std::mem::size_of::<WaterVertex>());
        assert_eq!(ScreenVertex::format().stride() as usize, std::mem::size_of::<ScreenVertex>());
        assert_eq!(std::mem::size_of::<WaterVertex>(), 32);
    }

    #[test]
    fn quad_indices_follow_four_vertex_stride() {
        assert_eq!(quad_indices(2), vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7]);
    }

    #[test]
    fn plane_covers_its_extent() {
        let (vertices, indices) = plane_mesh(0.5, 20);
        assert_eq!(vertices.len(), 21 * 21);
        assert_eq!(indices.len(), 20 * 20 * 6);
        assert_eq!(vertices[0].position, [-0.5, 0.0, -0.5]);
        assert_eq!(vertices[vertices.len() - 1].position, [0.5, 0.0, 0.5]);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }
}
