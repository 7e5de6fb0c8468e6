//! Cascaded dynamic shadow maps and the large static shadow map.

use glam::{Vec2, Vec4};
use log::{debug, error};

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, ClearFlags, ConstantIndex, Device, SamplerDesc, SamplerFilter, SamplerId, ShaderId,
    ShaderMacro, StateId, Texture2dDesc, TextureFormat, TextureId,
};
use crate::resource::GpuResource;
use crate::settings::{RendererSettings, ShadowLevel};

use super::permutation::screen_state;
use super::screen_quad::ScreenQuad;
use super::shader_lib::{ShaderLib, ShaderVersion};

pub const DYNAMIC_SPLIT_COUNT: usize = 2;
pub const STATIC_SHADOW_MAP_SIZE: u32 = 8192;

/// Index of the dynamic map used as blur scratch space.
const SCRATCH_MAP: usize = 2;

#[derive(Debug, Clone, Copy)]
struct BlurShader {
    pixel_shader: ShaderId,
    sampler_image: Option<ConstantIndex>,
    direction_scale: Option<ConstantIndex>,
    state: StateId,
    sampler: SamplerId,
}

#[derive(Debug, Clone, Copy)]
struct DynamicMaps {
    maps: [TextureId; 3],
    depth: TextureId,
}

#[derive(Debug, Clone, Copy)]
struct StaticMap {
    map: TextureId,
    depth: TextureId,
}

/// Shadow textures handed to the lighting shaders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowContext {
    pub dynamic_maps: [Option<TextureId>; DYNAMIC_SPLIT_COUNT],
    pub static_map: Option<TextureId>,
    /// Width of the second cascade relative to the first, 0 when it is empty.
    pub width_mul1: f32,
    pub dynamic_size: u32,
}

pub struct ShadowRenderer {
    dynamic_size: u32,
    blur_pass_count: u32,
    blur: Option<BlurShader>,
    dynamic: Option<DynamicMaps>,
    static_map: Option<StaticMap>,
    current_split: Option<usize>,
}

impl ShadowRenderer {
    pub fn new(settings: &RendererSettings) -> Self {
        let (dynamic_size, blur_pass_count) = match settings.shadow_level {
            ShadowLevel::None | ShadowLevel::Low => (512, 0),
            ShadowLevel::Medium => (512, 1),
            ShadowLevel::High => (1024, 1),
        };
        Self {
            dynamic_size,
            blur_pass_count,
            blur: None,
            dynamic: None,
            static_map: None,
            current_split: None,
        }
    }

    pub fn dynamic_size(&self) -> u32 {
        self.dynamic_size
    }

    pub fn blur_pass_count(&self) -> u32 {
        self.blur_pass_count
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match self.load_blur(device, shader_lib) {
            Ok(blur) => {
                self.blur = Some(blur);
                true
            }
            Err(err) => {
                error!("Failed to initialise the shadow renderer: {}", err);
                false
            }
        }
    }

    fn load_blur(&self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<BlurShader, RenderError> {
        let kernel = if self.dynamic_size >= 1024 {
            "blur-5.psh"
        } else {
            "blur-3.psh"
        };
        let pixel_shader = shader_lib.get_pshader(
            device,
            kernel,
            ShaderVersion::Ps2_0,
            "ps_main",
            &[ShaderMacro::new("GAUSSIAN_FLAG", "1")],
        )?;

        Ok(BlurShader {
            pixel_shader,
            sampler_image: device.constant_index(pixel_shader, "SamplerImage"),
            direction_scale: device.constant_index(pixel_shader, "DirectionScale"),
            state: device.create_state(&screen_state(BlendDesc::OPAQUE))?,
            sampler: device.create_sampler(&SamplerDesc::clamp(SamplerFilter::Point))?,
        })
    }

    /// Binds the map of cascade `split` with the shared depth target and
    /// clears both.
    pub fn start_dynamic_shadow_map_rendering(
        &mut self,
        device: &mut dyn Device,
        split: usize,
    ) -> Result<(), RenderError> {
        debug_assert!(split < DYNAMIC_SPLIT_COUNT, "invalid shadow split {split}");
        if split >= DYNAMIC_SPLIT_COUNT {
            error!("Dynamic shadow split {} is out of range", split);
            return Err(RenderError::InvariantViolation(format!(
                "dynamic shadow split {split} is out of range"
            )));
        }

        let maps = self.dynamic_maps(device)?;
        device.set_render_target(Some(maps.maps[split]), Some(maps.depth))?;
        device.clear_render_target(ClearFlags::COLOR | ClearFlags::DEPTH, Vec4::ONE, 1.0, 0)?;
        self.current_split = Some(split);
        Ok(())
    }

    /// Blurs the current cascade through the scratch map.
    pub fn end_dynamic_shadow_map_rendering(
        &mut self,
        device: &mut dyn Device,
        quad: &ScreenQuad,
    ) -> Result<(), RenderError> {
        let Some(split) = self.current_split.take() else {
            return Err(RenderError::InvariantViolation(
                "dynamic shadow rendering was not started".to_string(),
            ));
        };
        if self.blur_pass_count == 0 {
            return Ok(());
        }

        let (Some(blur), Some(maps)) = (self.blur, self.dynamic) else {
            return Err(RenderError::InvariantViolation(
                "shadow blur used before initialisation".to_string(),
            ));
        };

        let size = self.dynamic_size;
        let step = 1.0 / size.max(1) as f32;
        let ps = blur.pixel_shader;
        device.set_state(blur.state);
        device.set_pixel_shader(Some(ps));

        for _ in 0..self.blur_pass_count {
            device.set_render_target(Some(maps.maps[SCRATCH_MAP]), Some(maps.depth))?;
            device.set_sampler_safe(ps, blur.sampler_image, blur.sampler, Some(maps.maps[split]))?;
            device.set_constant_safe(ps, blur.direction_scale, Vec2::new(step, 0.0).into())?;
            quad.send(device, size, size)?;

            device.set_render_target(Some(maps.maps[split]), Some(maps.depth))?;
            device.set_sampler_safe(ps, blur.sampler_image, blur.sampler, Some(maps.maps[SCRATCH_MAP]))?;
            device.set_constant_safe(ps, blur.direction_scale, Vec2::new(0.0, step).into())?;
            quad.send(device, size, size)?;
        }
        Ok(())
    }

    pub fn dynamic_shadow_map(&self, split: usize) -> Option<TextureId> {
        debug_assert!(split < DYNAMIC_SPLIT_COUNT, "invalid shadow split {split}");
        self.dynamic
            .as_ref()
            .filter(|_| split < DYNAMIC_SPLIT_COUNT)
            .map(|maps| maps.maps[split])
    }

    pub fn start_static_shadow_map_rendering(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        let target = match self.static_map {
            Some(target) => target,
            None => {
                let target = Self::create_static_map(device)?;
                self.static_map = Some(target);
                target
            }
        };
        device.set_render_target(Some(target.map), Some(target.depth))?;
        Ok(())
    }

    /// The static map is never blurred.
    pub fn end_static_shadow_map_rendering(&mut self) {}

    pub fn static_shadow_map(&self) -> Option<TextureId> {
        self.static_map.map(|target| target.map)
    }

    pub fn shadow_context(&self, split0: f32, split1: f32) -> ShadowContext {
        let width_mul1 = if split1.abs() <= f32::EPSILON {
            0.0
        } else {
            split0 / split1
        };
        ShadowContext {
            dynamic_maps: [self.dynamic_shadow_map(0), self.dynamic_shadow_map(1)],
            static_map: self.static_shadow_map(),
            width_mul1,
            dynamic_size: self.dynamic_size,
        }
    }

    fn dynamic_maps(&mut self, device: &mut dyn Device) -> Result<DynamicMaps, RenderError> {
        if let Some(maps) = self.dynamic {
            return Ok(maps);
        }

        let size = self.dynamic_size;
        debug!("Allocating {}x{} dynamic shadow maps", size, size);
        let map = Texture2dDesc::render_target("dynamic-shadow", size, size, TextureFormat::Argb8);
        let descs = [map, map, map, Texture2dDesc::depth_stencil("dynamic-shadow-depth", size, size)];
        let mut created = Vec::with_capacity(descs.len());
        for desc in &descs {
            match device.create_texture_2d(desc) {
                Ok(texture) => created.push(texture),
                Err(err) => {
                    for texture in created {
                        device.release_texture(texture);
                    }
                    return Err(err.into());
                }
            }
        }

        let maps = DynamicMaps {
            maps: [created[0], created[1], created[2]],
            depth: created[3],
        };
        self.dynamic = Some(maps);
        Ok(maps)
    }

    fn create_static_map(device: &mut dyn Device) -> Result<StaticMap, RenderError> {
        let size = STATIC_SHADOW_MAP_SIZE;
        debug!("Allocating {}x{} static shadow map", size, size);
        let map = device.create_texture_2d(&Texture2dDesc::render_target("static-shadow", size, size, TextureFormat::R32F))?;
        match device.create_texture_2d(&Texture2dDesc::depth_stencil("static-shadow-depth", size, size)) {
            Ok(depth) => Ok(StaticMap { map, depth }),
            Err(err) => {
                device.release_texture(map);
                Err(err.into())
            }
        }
    }
}

impl GpuResource for ShadowRenderer {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        if let Some(maps) = self.dynamic.take() {
            for texture in maps.maps {
                device.release_texture(texture);
            }
            device.release_texture(maps.depth);
        }
        // The static map is baked once and kept for the whole session.
        self.current_split = None;
    }

    /// Targets are re-allocated on their next use.
    fn on_device_reset(&mut self, _device: &mut dyn Device) -> Result<(), RenderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{DeviceEvent, RecordingDevice};
    use crate::renderer::test_support;
    use crate::settings::GlobalLevel;

    fn settings(level: ShadowLevel) -> RendererSettings {
        let mut settings = RendererSettings::with_level(GlobalLevel::High);
        settings.shadow_level = level;
        settings
    }

    fn ready(device: &mut RecordingDevice, level: ShadowLevel) -> (ShadowRenderer, ScreenQuad) {
        let mut shader_lib = test_support::shader_lib();
        let mut shadow = ShadowRenderer::new(&settings(level));
        assert!(shadow.initialise(device, &mut shader_lib));
        let mut quad = ScreenQuad::new();
        assert!(quad.initialise(device, &mut shader_lib));
        quad.on_device_reset(device).unwrap();
        (shadow, quad)
    }

    #[test]
    fn level_selects_size_and_blur_passes() {
        let cases = [
            (ShadowLevel::None, 512, 0),
            (ShadowLevel::Low, 512, 0),
            (ShadowLevel::Medium, 512, 1),
            (ShadowLevel::High, 1024, 1),
        ];
        for (level, size, passes) in cases {
            let shadow = ShadowRenderer::new(&settings(level));
            assert_eq!((shadow.dynamic_size(), shadow.blur_pass_count()), (size, passes), "{level:?}");
        }
    }

    #[test]
    fn maps_are_allocated_once_on_first_use() {
        let mut device = RecordingDevice::new();
        let (mut shadow, _) = ready(&mut device, ShadowLevel::Medium);
        assert_eq!(shadow.dynamic_shadow_map(0), None);

        shadow.start_dynamic_shadow_map_rendering(&mut device, 0).unwrap();
        shadow.start_dynamic_shadow_map_rendering(&mut device, 1).unwrap();

        let shadow_textures: Vec<_> = device
            .live_textures()
            .into_iter()
            .filter(|desc| desc.label.starts_with("dynamic-shadow"))
            .collect();
        assert_eq!(shadow_textures.len(), 4);
        assert!(shadow_textures.iter().all(|desc| desc.width == 512));
        assert_eq!(
            shadow_textures.iter().filter(|desc| desc.format == TextureFormat::D24S8).count(),
            1
        );
    }

    #[test]
    fn start_binds_the_split_and_clears_it() {
        let mut device = RecordingDevice::new();
        let (mut shadow, _) = ready(&mut device, ShadowLevel::Low);
        shadow.start_dynamic_shadow_map_rendering(&mut device, 1).unwrap();

        let split1 = shadow.dynamic_shadow_map(1);
        let events = device.events();
        assert!(matches!(
            events[events.len() - 2],
            DeviceEvent::SetRenderTarget { color, depth: Some(_) } if color == split1
        ));
        assert!(matches!(
            events[events.len() - 1],
            DeviceEvent::Clear { flags, .. } if flags == ClearFlags::COLOR | ClearFlags::DEPTH
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid shadow split")]
    fn out_of_range_split_asserts() {
        let mut device = RecordingDevice::new();
        let (mut shadow, _) = ready(&mut device, ShadowLevel::Low);
        let _ = shadow.start_dynamic_shadow_map_rendering(&mut device, 2);
    }

    #[test]
    fn blur_ping_pongs_through_the_scratch_map() {
        let mut device = RecordingDevice::new();
        let (mut shadow, quad) = ready(&mut device, ShadowLevel::Medium);
        shadow.start_dynamic_shadow_map_rendering(&mut device, 0).unwrap();
        device.clear_events();
        shadow.end_dynamic_shadow_map_rendering(&mut device, &quad).unwrap();

        let split0 = shadow.dynamic_shadow_map(0);
        let draws: Vec<_> = device.draws().collect();
        assert_eq!(draws.len(), 2);

        let step = 1.0 / 512.0;
        assert_ne!(draws[0].color_target, split0);
        assert_eq!(draws[0].pixel_texture("SamplerImage"), split0);
        assert_eq!(draws[0].pixel_constant("DirectionScale"), Some(Vec2::new(step, 0.0).into()));
        assert_eq!(draws[1].color_target, split0);
        assert_eq!(draws[1].pixel_texture("SamplerImage"), draws[0].color_target);
        assert_eq!(draws[1].pixel_constant("DirectionScale"), Some(Vec2::new(0.0, step).into()));

        let state = device.state_desc(draws[0].state).unwrap();
        assert!(!state.depth.depth_test);
    }

    #[test]
    fn low_level_does_not_blur() {
        let mut device = RecordingDevice::new();
        let (mut shadow, quad) = ready(&mut device, ShadowLevel::Low);
        shadow.start_dynamic_shadow_map_rendering(&mut device, 0).unwrap();
        shadow.end_dynamic_shadow_map_rendering(&mut device, &quad).unwrap();
        assert_eq!(device.draw_count(), 0);
    }

    #[test]
    fn ending_without_start_is_rejected() {
        let mut device = RecordingDevice::new();
        let (mut shadow, quad) = ready(&mut device, ShadowLevel::Medium);
        assert!(matches!(
            shadow.end_dynamic_shadow_map_rendering(&mut device, &quad),
            Err(RenderError::InvariantViolation(_))
        ));
    }

    #[test]
    fn static_map_is_large_and_single_channel() {
        let mut device = RecordingDevice::new();
        let (mut shadow, _) = ready(&mut device, ShadowLevel::Low);
        shadow.start_static_shadow_map_rendering(&mut device).unwrap();
        shadow.end_static_shadow_map_rendering();

        let desc = device.texture_desc(shadow.static_shadow_map().unwrap()).unwrap();
        assert_eq!((desc.width, desc.height), (STATIC_SHADOW_MAP_SIZE, STATIC_SHADOW_MAP_SIZE));
        assert_eq!(desc.format, TextureFormat::R32F);
    }

    #[test]
    fn context_reports_cascade_ratio() {
        let shadow = ShadowRenderer::new(&settings(ShadowLevel::High));
        assert_eq!(shadow.shadow_context(20.0, 80.0).width_mul1, 0.25);
        assert_eq!(shadow.shadow_context(20.0, 0.0).width_mul1, 0.0);
        assert_eq!(shadow.shadow_context(20.0, 80.0).static_map, None);
    }

    #[test]
    fn device_loss_frees_dynamic_maps_only() {
        let mut device = RecordingDevice::new();
        let (mut shadow, _) = ready(&mut device, ShadowLevel::High);
        shadow.start_dynamic_shadow_map_rendering(&mut device, 0).unwrap();
        shadow.start_static_shadow_map_rendering(&mut device).unwrap();
        let static_map = shadow.static_shadow_map();

        shadow.on_device_lost(&mut device);
        let labels: Vec<_> = device.live_textures().iter().map(|desc| desc.label).collect();
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|label| label.starts_with("static-shadow")));
        assert_eq!(shadow.dynamic_shadow_map(0), None);
        assert_eq!(shadow.static_shadow_map(), static_map);

        shadow.on_device_reset(&mut device).unwrap();
        shadow.start_dynamic_shadow_map_rendering(&mut device, 1).unwrap();
        assert_eq!(device.live_textures().len(), 6);
        assert_eq!(shadow.static_shadow_map(), static_map);
    }
}
