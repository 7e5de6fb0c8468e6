//! Bloom and glow halo built from the glow buffer chain.

use glam::Vec4;
use log::error;

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, ClearFlags, ConstantIndex, Device, SamplerDesc, SamplerFilter, SamplerId, TextureId,
};
use crate::settings::MainLightSettings;

use super::render_view::{RenderTargetBuffer, RenderView};
use super::screen_quad::{ScreenQuad, ScreenShader};
use super::shader_lib::ShaderLib;

/// Blur pairs run on the quarter-size buffers after the first one.
const EXTRA_BLUR_PAIRS: usize = 2;

#[derive(Debug, Clone, Copy)]
struct BloomPass {
    shader: ScreenShader,
    threshold: Option<ConstantIndex>,
    factor: Option<ConstantIndex>,
    texture: Option<ConstantIndex>,
}

#[derive(Debug, Clone, Copy)]
struct BlurPass {
    shader: ScreenShader,
    image: Option<ConstantIndex>,
    scale: Option<ConstantIndex>,
}

#[derive(Debug, Clone, Copy)]
struct CompositePass {
    shader: ScreenShader,
    scene: Option<ConstantIndex>,
    glow: Option<ConstantIndex>,
}

#[derive(Debug, Clone, Copy)]
struct GlowShaders {
    bloom: BloomPass,
    passthru: ScreenShader,
    passthru_texture: Option<ConstantIndex>,
    blur_h: BlurPass,
    blur_v: BlurPass,
    composite: CompositePass,
    sampler: SamplerId,
}

#[derive(Default)]
pub struct GlowRenderer {
    shaders: Option<GlowShaders>,
}

impl GlowRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match Self::load_shaders(device, shader_lib) {
            Ok(shaders) => {
                self.shaders = Some(shaders);
                true
            }
            Err(err) => {
                error!("Failed to initialise the glow renderer: {}", err);
                false
            }
        }
    }

    fn load_shaders(device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<GlowShaders, RenderError> {
        let bloom = ScreenShader::load(device, shader_lib, "bloom.psh", &[], BlendDesc::ONE_ONE)?;
        let passthru = ScreenShader::load(device, shader_lib, "passthru-tex.psh", &[], BlendDesc::OPAQUE)?;
        let blur_h = ScreenShader::load(device, shader_lib, "blur-h.psh", &[], BlendDesc::OPAQUE)?;
        let blur_v = ScreenShader::load(device, shader_lib, "blur-v.psh", &[], BlendDesc::OPAQUE)?;
        let composite = ScreenShader::load(device, shader_lib, "glow.psh", &[], BlendDesc::OPAQUE)?;

        Ok(GlowShaders {
            bloom: BloomPass {
                shader: bloom,
                threshold: bloom.constant(device, "BloomThreshold"),
                factor: bloom.constant(device, "BloomFactor"),
                texture: bloom.constant(device, "SamplerTexture"),
            },
            passthru,
            passthru_texture: passthru.constant(device, "SamplerTexture"),
            blur_h: BlurPass {
                shader: blur_h,
                image: blur_h.constant(device, "SamplerImage"),
                scale: blur_h.constant(device, "Scale"),
            },
            blur_v: BlurPass {
                shader: blur_v,
                image: blur_v.constant(device, "SamplerImage"),
                scale: blur_v.constant(device, "Scale"),
            },
            composite: CompositePass {
                shader: composite,
                scene: composite.constant(device, "SamplerTexture1"),
                glow: composite.constant(device, "SamplerTexture2"),
            },
            sampler: device.create_sampler(&SamplerDesc::clamp(SamplerFilter::Bilinear))?,
        })
    }

    /// Snapshots the lit scene into REFRACTION and starts a clean GLOW0.
    pub fn start_glow_pass(&mut self, device: &mut dyn Device, view: &mut RenderView) -> Result<(), RenderError> {
        view.update_refraction_buffer(device, true)?;
        view.bind(device, RenderTargetBuffer::Glow0)?;
        device.clear_render_target(ClearFlags::COLOR, Vec4::ZERO, 1.0, 0)?;
        Ok(())
    }

    /// Adds the bloom, blurs it down the glow chain and composites the
    /// result over the light buffer.
    pub fn end_glow_pass(
        &mut self,
        device: &mut dyn Device,
        view: &mut RenderView,
        quad: &ScreenQuad,
        main_light: &MainLightSettings,
    ) -> Result<(), RenderError> {
        use RenderTargetBuffer as B;

        let Some(shaders) = self.shaders else {
            return Err(RenderError::InvariantViolation(
                "glow pass used before initialisation".to_string(),
            ));
        };
        let texture = |buffer: RenderTargetBuffer| {
            view.texture(buffer).ok_or_else(|| {
                RenderError::InvariantViolation(format!("{buffer} is not allocated"))
            })
        };
        let refraction = texture(B::Refraction)?;
        let glow0 = texture(B::Glow0)?;
        let glow_half = texture(B::GlowHalf)?;
        let glow1 = texture(B::Glow1)?;
        let glow2 = texture(B::Glow2)?;
        let sampler = shaders.sampler;

        let bloom = shaders.bloom;
        let ps = bloom.shader.pixel_shader;
        bloom.shader.bind(device);
        device.set_constant_safe(ps, bloom.threshold, main_light.bloom_threshold.into())?;
        device.set_constant_safe(ps, bloom.factor, main_light.bloom_factor.into())?;
        device.set_sampler_safe(ps, bloom.texture, sampler, Some(refraction))?;
        quad.send_to(device, view, B::Glow0)?;

        let ps = shaders.passthru.pixel_shader;
        shaders.passthru.bind(device);
        device.set_sampler_safe(ps, shaders.passthru_texture, sampler, Some(glow0))?;
        quad.send_to(device, view, B::GlowHalf)?;
        device.set_sampler_safe(ps, shaders.passthru_texture, sampler, Some(glow_half))?;
        quad.send_to(device, view, B::Glow1)?;

        let scale_h = 1.0 / view.viewport_width(B::Glow2).max(1) as f32;
        let scale_v = 1.0 / view.viewport_height(B::Glow1).max(1) as f32;
        let blur = |device: &mut dyn Device,
                    view: &mut RenderView,
                    source: TextureId,
                    pass: BlurPass,
                    scale: f32,
                    target: RenderTargetBuffer|
         -> Result<(), RenderError> {
            pass.shader.bind(device);
            device.set_sampler_safe(pass.shader.pixel_shader, pass.image, sampler, Some(source))?;
            device.set_constant_safe(pass.shader.pixel_shader, pass.scale, scale.into())?;
            quad.send_to(device, view, target)
        };

        blur(device, view, glow_half, shaders.blur_h, scale_h, B::Glow2)?;
        blur(device, view, glow2, shaders.blur_v, scale_v, B::Glow1)?;
        for _ in 0..EXTRA_BLUR_PAIRS {
            blur(device, view, glow1, shaders.blur_h, scale_h, B::Glow2)?;
            blur(device, view, glow2, shaders.blur_v, scale_v, B::Glow1)?;
        }

        let composite = shaders.composite;
        let ps = composite.shader.pixel_shader;
        composite.shader.bind(device);
        device.set_sampler_safe(ps, composite.scene, sampler, Some(refraction))?;
        device.set_sampler_safe(ps, composite.glow, sampler, Some(glow1))?;
        quad.send_to(device, view, B::Light)
    }
}
