//! Scene-side data of the primitives drawn by the command executors.

use std::cmp::Ordering;

use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::gfx::TextureId;

use super::vertex::{pack_color, pack_unorm8, BillboardVertex, DecalVertex};

/// Largest number of billboards a group, or a frame, may hold.
pub const MAX_BILLBOARD_COUNT: usize = 10_000;

bitflags! {
    /// Shader permutation bits shared by billboards and decals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrimitiveFlags: u32 {
        const SPRITE = 1 << 0;
    }
}

impl PrimitiveFlags {
    pub const COUNT: usize = 2;
}

/// Texture atlas layout: `u * v` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpriteLayout {
    pub u: u32,
    pub v: u32,
}

impl Default for SpriteLayout {
    fn default() -> Self {
        Self { u: 1, v: 1 }
    }
}

impl SpriteLayout {
    pub fn is_sprite(&self) -> bool {
        self.u > 1 || self.v > 1
    }

    pub fn count(&self) -> f32 {
        (self.u.max(1) * self.v.max(1)) as f32
    }

    pub fn count_u(&self) -> f32 {
        self.u.max(1) as f32
    }

    pub fn uv_size(&self) -> Vec2 {
        Vec2::new(1.0 / self.u.max(1) as f32, 1.0 / self.v.max(1) as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillboardMode {
    Add,
    Lerp,
    Refrac,
    AddLerp,
}

impl BillboardMode {
    pub const ALL: [BillboardMode; 4] = [
        BillboardMode::Add,
        BillboardMode::Lerp,
        BillboardMode::Refrac,
        BillboardMode::AddLerp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Alpha-blended groups whose billboards are depth sorted.
    pub fn sorts_by_depth(self) -> bool {
        matches!(self, Self::Lerp | Self::AddLerp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Billboard {
    /// Centre of the quad, in group space.
    pub position: Vec3,
    pub color: Vec4,
    pub width: f32,
    pub height: f32,
    /// Rotation around the view axis.
    pub angle: f32,
    /// Animation time in `[0, 1]`.
    pub time: f32,
}

impl Billboard {
    pub fn new(position: Vec3, size: f32) -> Self {
        Self {
            position,
            color: Vec4::ONE,
            width: size,
            height: size,
            angle: 0.0,
            time: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillboardGroup {
    mode: BillboardMode,
    world: Mat4,
    world_inv: Mat4,
    max_size: usize,
    billboards: Vec<Billboard>,
    pub texture: Option<TextureId>,
    pub color_factor: f32,
    pub glow_factor: f32,
    pub sprite: SpriteLayout,
}

impl BillboardGroup {
    pub fn new(mode: BillboardMode, max_size: usize) -> Self {
        Self {
            mode,
            world: Mat4::IDENTITY,
            world_inv: Mat4::IDENTITY,
            max_size: max_size.min(MAX_BILLBOARD_COUNT),
            billboards: Vec::new(),
            texture: None,
            color_factor: 1.0,
            glow_factor: 0.0,
            sprite: SpriteLayout::default(),
        }
    }

    pub fn mode(&self) -> BillboardMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BillboardMode) {
        self.mode = mode;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.world = world;
        self.world_inv = world.inverse();
    }

    /// World translation of the group.
    pub fn position(&self) -> Vec3 {
        self.world.w_axis.truncate()
    }

    pub fn billboards(&self) -> &[Billboard] {
        &self.billboards
    }

    /// Replaces the content, keeping at most `max_size` billboards.
    pub fn set_billboards(&mut self, mut billboards: Vec<Billboard>) {
        billboards.truncate(self.max_size);
        self.billboards = billboards;
    }

    pub fn flags(&self) -> PrimitiveFlags {
        if self.sprite.is_sprite() {
            PrimitiveFlags::SPRITE
        } else {
            PrimitiveFlags::empty()
        }
    }

    /// Billboard indices, farthest first, measured along the view direction
    /// in group space.
    pub fn depth_order(&self, eye_position: Vec3, eye_direction: Vec3) -> Vec<usize> {
        let local_eye = self.world_inv.transform_point3(eye_position);
        let local_dir = self.world_inv.transform_vector3(eye_direction);

        let mut dists: Vec<(f32, usize)> = self
            .billboards
            .iter()
            .enumerate()
            .map(|(index, bill)| ((bill.position - local_eye).dot(local_dir), index))
            .collect();
        dists.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        dists.into_iter().map(|(_, index)| index).collect()
    }

    pub fn sort_by_dist(&mut self, eye_position: Vec3, eye_direction: Vec3) {
        let order = self.depth_order(eye_position, eye_direction);
        self.billboards = order.into_iter().map(|index| self.billboards[index]).collect();
    }

    /// Four corner vertices per billboard, visited in `order`.
    pub fn append_vertices(&self, order: impl Iterator<Item = usize>, out: &mut Vec<BillboardVertex>) {
        const CORNERS: [[u8; 2]; 4] = [[0x00, 0xFF], [0xFF, 0xFF], [0xFF, 0x00], [0x00, 0x00]];

        for bill in order.filter_map(|index| self.billboards.get(index)) {
            let time = pack_unorm8(bill.time);
            let color = pack_color(bill.color);
            for [u, v] in CORNERS {
                out.push(BillboardVertex {
                    position: bill.position.to_array(),
                    texcoord: [u, v, time, 0],
                    size_angle: [bill.width, bill.height, bill.angle],
                    color,
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecalMode {
    Add,
    Lerp,
    Refrac,
}

impl DecalMode {
    pub const ALL: [DecalMode; 3] = [DecalMode::Add, DecalMode::Lerp, DecalMode::Refrac];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Camera-independent textured quad placed in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct Decal {
    pub mode: DecalMode,
    pub world: Mat4,
    pub width: f32,
    pub height: f32,
    pub color: Vec4,
    pub glow: Vec4,
    pub texture: Option<TextureId>,
    pub sprite: SpriteLayout,
    pub time_key: f32,
}

impl Decal {
    pub fn new(mode: DecalMode, world: Mat4, width: f32, height: f32) -> Self {
        Self {
            mode,
            world,
            width,
            height,
            color: Vec4::ONE,
            glow: Vec4::ZERO,
            texture: None,
            sprite: SpriteLayout::default(),
            time_key: 0.0,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.world.w_axis.truncate()
    }

    pub fn flags(&self) -> PrimitiveFlags {
        if self.sprite.is_sprite() {
            PrimitiveFlags::SPRITE
        } else {
            PrimitiveFlags::empty()
        }
    }

    /// Quad in the decal's local XY plane; the glow variant carries the glow
    /// colour instead of the base colour.
    pub fn vertices(&self, glow: bool) -> [DecalVertex; 4] {
        let hw = 0.5 * self.width;
        let hh = 0.5 * self.height;
        let color = pack_color(if glow { self.glow } else { self.color });
        let corner = |x: f32, y: f32, u: f32, v: f32| DecalVertex {
            position: [x, y, 0.0],
            texcoord: [u, v, self.time_key, 0.0],
            color,
        };

        [
            corner(-hw, -hh, 0.0, 1.0),
            corner(hw, -hh, 1.0, 1.0),
            corner(hw, hh, 1.0, 0.0),
            corner(-hw, hh, 0.0, 0.0),
        ]
    }
}

/// Rectangle of water at the context's water level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterPatch {
    /// Centre on the horizontal plane, `(x, z)`.
    pub position: Vec2,
    pub width: f32,
    pub height: f32,
    pub diffuse: Vec4,
}

impl WaterPatch {
    pub fn new(position: Vec2, width: f32, height: f32) -> Self {
        Self {
            position,
            width,
            height,
            diffuse: Vec4::new(0.2, 0.35, 0.45, 0.8),
        }
    }

    pub fn world_matrix(&self, water_level: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(self.position.x, water_level, self.position.y))
            * Mat4::from_scale(Vec3::new(self.width, 1.0, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprite_layout_clamps_to_one() {
        let layout = SpriteLayout { u: 0, v: 4 };
        assert_eq!(layout.count(), 4.0);
        assert_eq!(layout.count_u(), 1.0);
        assert_eq!(layout.uv_size(), Vec2::new(1.0, 0.25));
        assert!(layout.is_sprite());
        assert!(!SpriteLayout::default().is_sprite());
    }

    #[test]
    fn depth_order_is_local_and_farthest_first() {
        let mut group = BillboardGroup::new(BillboardMode::Lerp, 16);
        group.set_world_matrix(Mat4::from_translation(Vec3::new(0.0, 0.0, 100.0)));
        group.set_billboards(vec![
            Billboard::new(Vec3::new(0.0, 0.0, -5.0), 1.0),
            Billboard::new(Vec3::new(0.0, 0.0, 5.0), 1.0),
            Billboard::new(Vec3::new(0.0, 0.0, 0.0), 1.0),
        ]);

        let order = group.depth_order(Vec3::ZERO, Vec3::Z);
        assert_eq!(order, vec![1, 2, 0]);

        group.sort_by_dist(Vec3::ZERO, Vec3::Z);
        assert_eq!(group.billboards()[0].position.z, 5.0);
    }

    #[test]
    fn groups_truncate_to_max_size() {
        let mut group = BillboardGroup::new(BillboardMode::Add, 2);
        group.set_billboards(vec![Billboard::new(Vec3::ZERO, 1.0); 5]);
        assert_eq!(group.billboards().len(), 2);
    }

    #[test]
    fn billboard_corners_carry_packed_time() {
        let mut group = BillboardGroup::new(BillboardMode::Add, 1);
        let mut bill = Billboard::new(Vec3::ONE, 2.0);
        bill.time = 1.0;
        group.set_billboards(vec![bill]);

        let mut vertices = Vec::new();
        group.append_vertices(0..1, &mut vertices);
        assert_eq!(vertices.len(), 4);
        assert_eq!(vertices[0].texcoord, [0x00, 0xFF, 0xFF, 0]);
        assert_eq!(vertices[2].texcoord, [0xFF, 0x00, 0xFF, 0]);
        assert_eq!(vertices[3].size_angle, [2.0, 2.0, 0.0]);
    }

    #[test]
    fn water_world_places_patch_at_water_level() {
        let patch = WaterPatch::new(Vec2::new(3.0, -4.0), 10.0, 20.0);
        let world = patch.world_matrix(1.5);
        assert_eq!(world.transform_point3(Vec3::ZERO), Vec3::new(3.0, 1.5, -4.0));
        assert_eq!(
            world.transform_point3(Vec3::new(0.5, 0.0, 0.5)),
            Vec3::new(8.0, 1.5, 6.0)
        );
    }
}
