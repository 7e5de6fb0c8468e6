use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::settings::{FogSettings, MainLightSettings, PostFxSettings};

use super::primitives::{BillboardGroup, Decal, WaterPatch};

/// Read-only snapshot of what a frame shows and from where.
#[derive(Debug, Clone)]
pub struct RenderContext {
    view: Mat4,
    proj: Mat4,
    view_proj: Mat4,
    eye_position: Vec3,
    eye_direction: Vec3,
    pub fog: FogSettings,
    pub main_light: MainLightSettings,
    pub post_fx: PostFxSettings,
    pub billboards: Vec<Arc<BillboardGroup>>,
    pub decals: Vec<Decal>,
    pub water_patches: Vec<WaterPatch>,
    pub water_level: f32,
    /// Seconds since the scene started.
    pub time: f32,
    pub render_reflection: bool,
    pub render_static_shadow: bool,
    /// Far distance of the two dynamic shadow cascades.
    pub shadow_splits: [f32; 2],
    /// Weight of the new frame in the accumulation trail, `None` when off.
    pub accumulation: Option<f32>,
}

impl RenderContext {
    pub fn new(view: Mat4, proj: Mat4) -> Self {
        let mut context = Self {
            view: Mat4::IDENTITY,
            proj,
            view_proj: proj,
            eye_position: Vec3::ZERO,
            eye_direction: Vec3::NEG_Z,
            fog: FogSettings::default(),
            main_light: MainLightSettings::default(),
            post_fx: PostFxSettings::default(),
            billboards: Vec::new(),
            decals: Vec::new(),
            water_patches: Vec::new(),
            water_level: 0.0,
            time: 0.0,
            render_reflection: false,
            render_static_shadow: false,
            shadow_splits: [20.0, 80.0],
            accumulation: None,
        };
        context.set_camera(view, proj);
        context
    }

    /// Right-handed camera looking from `eye` at `target`.
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, aspect: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let proj = Mat4::perspective_rh(fov_y, aspect, 0.1, 1000.0);
        Self::new(view, proj)
    }

    /// Derives the eye position and direction from the inverse view matrix.
    pub fn set_camera(&mut self, view: Mat4, proj: Mat4) {
        let camera = view.inverse();
        self.view = view;
        self.proj = proj;
        self.view_proj = proj * view;
        self.eye_position = camera.w_axis.truncate();
        self.eye_direction = camera.transform_vector3(Vec3::NEG_Z).normalize_or_zero();
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn proj(&self) -> Mat4 {
        self.proj
    }

    pub fn view_proj(&self) -> Mat4 {
        self.view_proj
    }

    pub fn eye_position(&self) -> Vec3 {
        self.eye_position
    }

    pub fn eye_direction(&self) -> Vec3 {
        self.eye_direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eye_follows_the_view_matrix() {
        let context = RenderContext::look_at(
            Vec3::new(0.0, 2.0, 10.0),
            Vec3::new(0.0, 2.0, 0.0),
            1.0,
            1.0,
        );

        assert!((context.eye_position() - Vec3::new(0.0, 2.0, 10.0)).length() < 1e-4);
        assert!((context.eye_direction() - Vec3::NEG_Z).length() < 1e-4);
        assert_eq!(context.view_proj(), context.proj() * context.view());
    }
}
