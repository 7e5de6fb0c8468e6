//! Screen-space post effects: directional and radial blur, saturation, fade
//! and the accumulation trail.

use glam::Vec2;
use log::{debug, error};

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, ConstantIndex, Device, SamplerDesc, SamplerFilter, SamplerId, ShaderMacro,
    Texture2dDesc, TextureFormat, TextureId,
};
use crate::resource::GpuResource;
use crate::settings::{PostFxSettings, RendererSettings};

use super::render_view::{RenderTargetBuffer, RenderView};
use super::screen_quad::{ScreenQuad, ScreenShader};
use super::shader_lib::ShaderLib;

/// Which parts of the post-FX chain a frame runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostFxPlan {
    pub blur_factor: f32,
    pub dir_blur_on: bool,
    pub radial_on: bool,
    pub do_post_fx: bool,
}

impl PostFxPlan {
    pub fn new(fx: &PostFxSettings, post_fx_on: bool) -> Self {
        let blur_factor = fx
            .radial_blur_factor
            .max(fx.blur_dir1.length().max(fx.blur_dir2.length()))
            .min(1.0);
        let dir_blur_on = post_fx_on && (fx.blur_dir1 != Vec2::ZERO || fx.blur_dir2 != Vec2::ZERO);
        let radial_on = post_fx_on && fx.radial_blur_factor > 0.0;
        let do_post_fx = blur_factor > 0.0 || fx.saturation < 1.0 || fx.fade_color.w > 0.0;

        Self {
            blur_factor: if post_fx_on { blur_factor } else { 0.0 },
            dir_blur_on,
            radial_on,
            do_post_fx,
        }
    }

    pub fn blur_on(&self) -> bool {
        self.dir_blur_on || self.radial_on
    }
}

#[derive(Debug, Clone, Copy)]
struct PostFxShaders {
    scale: ScreenShader,
    scale_texture: Option<ConstantIndex>,
    blur: ScreenShader,
    blur_direction: Option<ConstantIndex>,
    blur_image: Option<ConstantIndex>,
    radial: ScreenShader,
    radial_center: Option<ConstantIndex>,
    radial_scale: Option<ConstantIndex>,
    radial_image: Option<ConstantIndex>,
    final_pass: ScreenShader,
    blur_factor: Option<ConstantIndex>,
    saturation: Option<ConstantIndex>,
    fade: Option<ConstantIndex>,
    final_texture: Option<ConstantIndex>,
    final_blur: Option<ConstantIndex>,
    accum: ScreenShader,
    accum_factor: Option<ConstantIndex>,
    accum_texture: Option<ConstantIndex>,
    sampler: SamplerId,
}

pub struct PostFxRenderer {
    post_fx_on: bool,
    shaders: Option<PostFxShaders>,
    accum: Option<TextureId>,
}

impl PostFxRenderer {
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            post_fx_on: settings.post_fx_on,
            shaders: None,
            accum: None,
        }
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match Self::load_shaders(device, shader_lib) {
            Ok(shaders) => {
                self.shaders = Some(shaders);
                true
            }
            Err(err) => {
                error!("Failed to initialise the post-FX renderer: {}", err);
                false
            }
        }
    }

    fn load_shaders(device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<PostFxShaders, RenderError> {
        let opaque = BlendDesc::OPAQUE;
        let radial = ScreenShader::load(device, shader_lib, "radialblur-9.psh", &[], opaque)?;
        let scale = ScreenShader::load(device, shader_lib, "passthru-tex.psh", &[], opaque)?;
        let accum = ScreenShader::load(device, shader_lib, "accum.psh", &[], BlendDesc::LERP)?;
        let final_pass = ScreenShader::load(device, shader_lib, "postfx.psh", &[], opaque)?;
        let gaussian = [ShaderMacro::new("GAUSSIAN_FLAG", "1")];
        let blur = ScreenShader::load(device, shader_lib, "blur-9.psh", &gaussian, opaque)?;

        Ok(PostFxShaders {
            scale,
            scale_texture: scale.constant(device, "SamplerTexture"),
            blur,
            blur_direction: blur.constant(device, "DirectionScale"),
            blur_image: blur.constant(device, "SamplerImage"),
            radial,
            radial_center: radial.constant(device, "Center"),
            radial_scale: radial.constant(device, "Scale"),
            radial_image: radial.constant(device, "SamplerImage"),
            final_pass,
            blur_factor: final_pass.constant(device, "BlurFactor"),
            saturation: final_pass.constant(device, "Saturation"),
            fade: final_pass.constant(device, "Fade"),
            final_texture: final_pass.constant(device, "SamplerTexture"),
            final_blur: final_pass.constant(device, "SamplerBlur"),
            accum,
            accum_factor: accum.constant(device, "SourceFactor"),
            accum_texture: accum.constant(device, "SamplerTexture"),
            sampler: device.create_sampler(&SamplerDesc::clamp(SamplerFilter::Bilinear))?,
        })
    }

    fn shaders(&self) -> Result<PostFxShaders, RenderError> {
        self.shaders.ok_or_else(|| {
            RenderError::InvariantViolation("post-FX used before initialisation".to_string())
        })
    }

    /// Runs the effects `fx` asks for over the light buffer. When nothing is
    /// requested the light buffer is left untouched.
    pub fn post_fx(
        &mut self,
        device: &mut dyn Device,
        view: &mut RenderView,
        quad: &ScreenQuad,
        fx: &PostFxSettings,
    ) -> Result<PostFxPlan, RenderError> {
        use RenderTargetBuffer as B;

        let plan = PostFxPlan::new(fx, self.post_fx_on);
        if !plan.do_post_fx && !plan.blur_on() {
            return Ok(plan);
        }
        let shaders = self.shaders()?;
        let sampler = shaders.sampler;

        if plan.do_post_fx {
            view.update_refraction_buffer(device, true)?;
        }
        let refraction = buffer_texture(view, B::Refraction)?;
        let glow1 = buffer_texture(view, B::Glow1)?;

        if plan.blur_on() {
            let ps = shaders.scale.pixel_shader;
            shaders.scale.bind(device);
            device.set_sampler_safe(ps, shaders.scale_texture, sampler, Some(refraction))?;
            quad.send_to(device, view, B::GlowHalf)?;
            let glow_half = buffer_texture(view, B::GlowHalf)?;
            device.set_sampler_safe(ps, shaders.scale_texture, sampler, Some(glow_half))?;
            quad.send_to(device, view, B::Glow1)?;

            if plan.dir_blur_on {
                self.blur(device, view, quad, fx.blur_dir1, B::Glow1, B::Glow2)?;
                self.blur(device, view, quad, fx.blur_dir2, B::Glow2, B::Glow1)?;
            }
            if plan.radial_on {
                let (center, factor) = (fx.radial_blur_center, fx.radial_blur_factor);
                self.radial_blur(device, view, quad, center, factor, B::Glow1, B::Glow2)?;
                self.radial_blur(device, view, quad, center, factor, B::Glow2, B::Glow1)?;
            }
        }

        if plan.do_post_fx {
            let ps = shaders.final_pass.pixel_shader;
            shaders.final_pass.bind(device);
            device.set_constant_safe(ps, shaders.blur_factor, plan.blur_factor.into())?;
            device.set_constant_safe(ps, shaders.saturation, fx.saturation.into())?;
            device.set_constant_safe(ps, shaders.fade, fx.fade_color.into())?;
            device.set_sampler_safe(ps, shaders.final_texture, sampler, Some(refraction))?;
            device.set_sampler_safe(ps, shaders.final_blur, sampler, Some(glow1))?;
            quad.send_to(device, view, B::Light)?;
        }
        Ok(plan)
    }

    /// Directional blur with `dir` expressed in destination pixels.
    fn blur(
        &self,
        device: &mut dyn Device,
        view: &mut RenderView,
        quad: &ScreenQuad,
        dir: Vec2,
        src: RenderTargetBuffer,
        dst: RenderTargetBuffer,
    ) -> Result<(), RenderError> {
        let shaders = self.shaders()?;
        let source = buffer_texture(view, src)?;
        let step = dir / destination_size(view, dst);

        let ps = shaders.blur.pixel_shader;
        shaders.blur.bind(device);
        device.set_sampler_safe(ps, shaders.blur_image, shaders.sampler, Some(source))?;
        device.set_constant_safe(ps, shaders.blur_direction, step.into())?;
        quad.send_to(device, view, dst)
    }

    #[allow(clippy::too_many_arguments)]
    fn radial_blur(
        &self,
        device: &mut dyn Device,
        view: &mut RenderView,
        quad: &ScreenQuad,
        center: Vec2,
        factor: f32,
        src: RenderTargetBuffer,
        dst: RenderTargetBuffer,
    ) -> Result<(), RenderError> {
        let shaders = self.shaders()?;
        let source = buffer_texture(view, src)?;
        let scale = Vec2::splat(factor * 5.0) / destination_size(view, dst);

        let ps = shaders.radial.pixel_shader;
        shaders.radial.bind(device);
        device.set_sampler_safe(ps, shaders.radial_image, shaders.sampler, Some(source))?;
        device.set_constant_safe(ps, shaders.radial_center, center.into())?;
        device.set_constant_safe(ps, shaders.radial_scale, scale.into())?;
        quad.send_to(device, view, dst)
    }

    /// Blends the previous accumulated frame over the light buffer with weight
    /// `1 - source_factor`, then keeps the result for the next frame. The
    /// first frame only seeds the history.
    pub fn accumulate(
        &mut self,
        device: &mut dyn Device,
        view: &mut RenderView,
        quad: &ScreenQuad,
        source_factor: f32,
    ) -> Result<(), RenderError> {
        let shaders = self.shaders()?;
        let light = buffer_texture(view, RenderTargetBuffer::Light)?;
        let (width, height) = (view.width(), view.height());

        let stale = self
            .accum
            .and_then(|accum| device.texture_desc(accum))
            .map_or(true, |desc| desc.width != width || desc.height != height);
        if stale {
            if let Some(accum) = self.accum.take() {
                device.release_texture(accum);
            }
            debug!("Allocating {}x{} accumulation buffer", width, height);
            let accum = device.create_texture_2d(&Texture2dDesc::render_target(
                "accum",
                width,
                height,
                TextureFormat::Argb8,
            ))?;
            self.accum = Some(accum);
            device.copy_render_target(light, accum)?;
            return Ok(());
        }

        let Some(accum) = self.accum else {
            return Ok(());
        };
        let ps = shaders.accum.pixel_shader;
        shaders.accum.bind(device);
        device.set_constant_safe(ps, shaders.accum_factor, source_factor.clamp(0.0, 1.0).into())?;
        device.set_sampler_safe(ps, shaders.accum_texture, shaders.sampler, Some(accum))?;
        quad.send_to(device, view, RenderTargetBuffer::Light)?;
        device.copy_render_target(light, accum)?;
        Ok(())
    }

    pub fn reset_accumulation(&mut self, device: &mut dyn Device) {
        if let Some(accum) = self.accum.take() {
            device.release_texture(accum);
        }
    }
}

fn buffer_texture(view: &RenderView, buffer: RenderTargetBuffer) -> Result<TextureId, RenderError> {
    view.texture(buffer)
        .ok_or_else(|| RenderError::InvariantViolation(format!("{buffer} is not allocated")))
}

fn destination_size(view: &RenderView, buffer: RenderTargetBuffer) -> Vec2 {
    Vec2::new(
        view.viewport_width(buffer).max(1) as f32,
        view.viewport_height(buffer).max(1) as f32,
    )
}

impl GpuResource for PostFxRenderer {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        self.reset_accumulation(device);
    }

    fn on_device_reset(&mut self, _device: &mut dyn Device) -> Result<(), RenderError> {
        Ok(())
    }
}
