use glam::{Vec2, Vec3, Vec4};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::gfx::SamplerFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl GlobalLevel {
    pub const ALL: [GlobalLevel; 5] = [
        GlobalLevel::VeryLow,
        GlobalLevel::Low,
        GlobalLevel::Medium,
        GlobalLevel::High,
        GlobalLevel::VeryHigh,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefractionLevel {
    None,
    Low,
    Medium,
    High,
}

impl RefractionLevel {
    /// How many times per frame the light buffer may be copied for refraction.
    pub fn max_layers(self) -> u32 {
        match self {
            RefractionLevel::None => 0,
            RefractionLevel::Low => 1,
            RefractionLevel::Medium => 2,
            RefractionLevel::High => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterLevel {
    Bilinear,
    Trilinear,
    Aniso2x,
    Aniso4x,
    Aniso8x,
}

impl FilterLevel {
    pub fn sampler_filter(self) -> SamplerFilter {
        match self {
            FilterLevel::Bilinear => SamplerFilter::Bilinear,
            FilterLevel::Trilinear => SamplerFilter::Trilinear,
            FilterLevel::Aniso2x => SamplerFilter::Anisotropic(2),
            FilterLevel::Aniso4x => SamplerFilter::Anisotropic(4),
            FilterLevel::Aniso8x => SamplerFilter::Anisotropic(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsaaLevel {
    None,
    X2,
    X4,
    X8,
}

impl MsaaLevel {
    pub fn sample_count(self) -> u32 {
        match self {
            MsaaLevel::None => 1,
            MsaaLevel::X2 => 2,
            MsaaLevel::X4 => 4,
            MsaaLevel::X8 => 8,
        }
    }
}

/// Quality switches and output size shared by every renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererSettings {
    #[serde(default = "RendererSettings::default_width")]
    pub width: u32,
    #[serde(default = "RendererSettings::default_height")]
    pub height: u32,
    pub shader_level: ShaderLevel,
    pub shadow_level: ShadowLevel,
    pub texture_level: TextureLevel,
    pub reflection_level: ReflectionLevel,
    pub refraction_level: RefractionLevel,
    pub filter_level: FilterLevel,
    pub msaa_level: MsaaLevel,
    pub glow_on: bool,
    pub post_fx_on: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self::with_level(GlobalLevel::Medium)
    }
}

impl RendererSettings {
    pub fn with_level(level: GlobalLevel) -> Self {
        let mut settings = Self {
            width: Self::default_width(),
            height: Self::default_height(),
            shader_level: ShaderLevel::None,
            shadow_level: ShadowLevel::None,
            texture_level: TextureLevel::Low,
            reflection_level: ReflectionLevel::None,
            refraction_level: RefractionLevel::None,
            filter_level: FilterLevel::Bilinear,
            msaa_level: MsaaLevel::None,
            glow_on: false,
            post_fx_on: false,
        };
        settings.set_global_level(level);
        settings
    }

    /// Overwrites every quality switch from the global level table.
    pub fn set_global_level(&mut self, level: GlobalLevel) {
        use FilterLevel as F;

        let (shader, shadow, texture, reflection, refraction, filter, msaa, glow, post_fx) =
            match level {
                GlobalLevel::VeryLow => (
                    ShaderLevel::None,
                    ShadowLevel::None,
                    TextureLevel::Low,
                    ReflectionLevel::None,
                    RefractionLevel::None,
                    F::Bilinear,
                    MsaaLevel::None,
                    false,
                    false,
                ),
                GlobalLevel::Low => (
                    ShaderLevel::Low,
                    ShadowLevel::None,
                    TextureLevel::Low,
                    ReflectionLevel::Low,
                    RefractionLevel::Low,
                    F::Trilinear,
                    MsaaLevel::None,
                    true,
                    true,
                ),
                GlobalLevel::Medium => (
                    ShaderLevel::Medium,
                    ShadowLevel::Low,
                    TextureLevel::Medium,
                    ReflectionLevel::Medium,
                    RefractionLevel::Medium,
                    F::Aniso2x,
                    MsaaLevel::None,
                    true,
                    true,
                ),
                GlobalLevel::High => (
                    ShaderLevel::High,
                    ShadowLevel::Medium,
                    TextureLevel::High,
                    ReflectionLevel::High,
                    RefractionLevel::Medium,
                    F::Aniso4x,
                    MsaaLevel::X2,
                    true,
                    true,
                ),
                GlobalLevel::VeryHigh => (
                    ShaderLevel::High,
                    ShadowLevel::High,
                    TextureLevel::High,
                    ReflectionLevel::High,
                    RefractionLevel::High,
                    F::Aniso8x,
                    MsaaLevel::X4,
                    true,
                    true,
                ),
            };

        self.shader_level = shader;
        self.shadow_level = shadow;
        self.texture_level = texture;
        self.reflection_level = reflection;
        self.refraction_level = refraction;
        self.filter_level = filter;
        self.msaa_level = msaa;
        self.glow_on = glow;
        self.post_fx_on = post_fx;
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RendererSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded renderer settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default renderer settings.",
                        path, err
                    );
                    RendererSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Renderer settings file {:?} not found. Using default settings.",
                    path
                );
                RendererSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default renderer settings.",
                    path, err
                );
                RendererSettings::default()
            }
        }
    }

    fn validate(mut self) -> Self {
        if self.width == 0 {
            warn!("Width must be greater than zero. Using 1 instead.");
            self.width = 1;
        }

        if self.height == 0 {
            warn!("Height must be greater than zero. Using 1 instead.");
            self.height = 1;
        }

        self
    }

    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        720
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FogSettings {
    pub color: Vec4,
    pub start: f32,
    pub end: f32,
    pub sky_fog_opacity: f32,
}

impl Default for FogSettings {
    fn default() -> Self {
        Self {
            color: Vec4::ZERO,
            start: 0.0,
            end: 1000.0,
            sky_fog_opacity: 0.0,
        }
    }
}

impl FogSettings {
    pub fn inv_range(&self) -> f32 {
        let range = self.end - self.start;
        if range.abs() <= f32::EPSILON {
            0.0
        } else {
            1.0 / range
        }
    }

    /// `(start, 1 / range, opacity)`, the layout the vertex shaders expect.
    pub fn range_constant(&self) -> Vec3 {
        Vec3::new(self.start, self.inv_range(), self.color.w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainLightSettings {
    pub global_fade: f32,
    pub sun_angle_to_zenith: f32,
    pub sun_angle_to_north: f32,
    pub ambient: Vec4,
    pub diffuse0: Vec4,
    pub diffuse1: Vec4,
    pub diffuse2: Vec4,
    pub specular: Vec4,
    pub mul_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_factor: f32,
}

impl Default for MainLightSettings {
    fn default() -> Self {
        Self {
            global_fade: 1.0,
            sun_angle_to_zenith: 0.25 * std::f32::consts::FRAC_PI_2,
            sun_angle_to_north: 0.125 * std::f32::consts::PI,
            ambient: Vec4::splat(0.05),
            diffuse0: Vec4::new(0.8, 0.8, 0.8, 1.0),
            diffuse1: Vec4::new(0.0, 0.0, 0.0, 1.0),
            diffuse2: Vec4::new(0.2, 0.2, 0.4, 1.0),
            specular: Vec4::new(0.8, 0.8, 0.8, 1.0),
            mul_intensity: 1.0,
            bloom_threshold: 0.0,
            bloom_factor: 0.0,
        }
    }
}

impl MainLightSettings {
    pub fn light_direction(&self) -> Vec3 {
        let teta = std::f32::consts::FRAC_PI_2 + self.sun_angle_to_north;
        let phi = self.sun_angle_to_zenith;
        let (sin_phi, cos_phi) = phi.sin_cos();
        let (sin_teta, cos_teta) = teta.sin_cos();

        -Vec3::new(sin_phi * cos_teta, cos_phi, sin_phi * sin_teta)
    }
}

/// Full-screen effects requested by gameplay for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostFxSettings {
    pub blur_dir1: Vec2,
    pub blur_dir2: Vec2,
    pub radial_blur_center: Vec2,
    pub radial_blur_factor: f32,
    pub saturation: f32,
    pub fade_color: Vec4,
}

impl Default for PostFxSettings {
    fn default() -> Self {
        Self {
            blur_dir1: Vec2::ZERO,
            blur_dir2: Vec2::ZERO,
            radial_blur_center: Vec2::splat(0.5),
            radial_blur_factor: 0.0,
            saturation: 1.0,
            fade_color: Vec4::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let invalid = RendererSettings {
            width: 0,
            height: 0,
            ..RendererSettings::default()
        };

        let validated = invalid.validate();

        assert_eq!(validated.width, 1);
        assert_eq!(validated.height, 1);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RendererSettings {
            width: 1920,
            height: 1080,
            ..RendererSettings::with_level(GlobalLevel::High)
        };

        let validated = valid.clone().validate();

        assert_eq!(validated, valid);
    }

    #[test]
    fn every_global_level_assigns_a_full_row() {
        for level in GlobalLevel::ALL {
            // Start from the opposite end of the table so every field must change.
            let mut from_low = RendererSettings::with_level(GlobalLevel::VeryLow);
            let mut from_high = RendererSettings::with_level(GlobalLevel::VeryHigh);
            from_low.set_global_level(level);
            from_high.set_global_level(level);

            assert_eq!(from_low, from_high, "level {:?} left a field unassigned", level);
        }
    }

    #[test]
    fn table_matches_known_rows() {
        let very_low = RendererSettings::with_level(GlobalLevel::VeryLow);
        assert_eq!(very_low.shader_level, ShaderLevel::None);
        assert!(!very_low.glow_on && !very_low.post_fx_on);

        let high = RendererSettings::with_level(GlobalLevel::High);
        assert_eq!(high.shadow_level, ShadowLevel::Medium);
        assert_eq!(high.refraction_level, RefractionLevel::Medium);
        assert_eq!(high.msaa_level.sample_count(), 2);
        assert_eq!(high.filter_level.sampler_filter(), SamplerFilter::Anisotropic(4));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RendererSettings::load_from_path(dir.path().join("renderer.json"));
        assert_eq!(settings, RendererSettings::default());
    }

    #[test]
    fn loaded_settings_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renderer.json");
        let mut stored = RendererSettings::with_level(GlobalLevel::Low);
        stored.width = 0;
        std::fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        let loaded = RendererSettings::load_from_path(&path);
        assert_eq!(loaded.width, 1);
        assert_eq!(loaded.shader_level, ShaderLevel::Low);
    }

    #[test]
    fn fog_range_constant_packs_start_inverse_range_and_opacity() {
        let fog = FogSettings {
            color: Vec4::new(0.5, 0.5, 0.5, 0.25),
            start: 10.0,
            end: 110.0,
            sky_fog_opacity: 0.0,
        };
        assert_eq!(fog.range_constant(), Vec3::new(10.0, 0.01, 0.25));
    }
}
