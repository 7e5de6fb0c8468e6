//! Render-target chain of one view: light, refraction, reflection and the
//! glow ping-pong buffers.

use std::fmt;

use log::debug;

use crate::error::RenderError;
use crate::gfx::{Device, Texture2dDesc, TextureFormat, TextureId};
use crate::resource::GpuResource;
use crate::settings::{ReflectionLevel, RendererSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTargetBuffer {
    Light,
    Reflection,
    Refraction,
    Glow0,
    GlowHalf,
    Glow1,
    Glow2,
}

impl RenderTargetBuffer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "LIGHT",
            Self::Reflection => "REFLECTION",
            Self::Refraction => "REFRACTION",
            Self::Glow0 => "GLOW0",
            Self::GlowHalf => "GLOW_HALF",
            Self::Glow1 => "GLOW1",
            Self::Glow2 => "GLOW2",
        }
    }
}

impl fmt::Display for RenderTargetBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct ViewBuffers {
    light: TextureId,
    depth: TextureId,
    refraction: TextureId,
    reflection: TextureId,
    reflection_depth: TextureId,
    glow0: TextureId,
    glow_half: TextureId,
    glow1: TextureId,
    glow2: TextureId,
}

impl ViewBuffers {
    fn all(&self) -> [TextureId; 9] {
        [
            self.light,
            self.depth,
            self.refraction,
            self.reflection,
            self.reflection_depth,
            self.glow0,
            self.glow_half,
            self.glow1,
            self.glow2,
        ]
    }
}

/// Refraction usage and bind order of the last frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewStats {
    pub refraction_layers: u32,
    pub max_refraction_layers: u32,
    pub forced_refraction_layers: u32,
    pub history: Vec<RenderTargetBuffer>,
}

impl fmt::Display for ViewStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "views{{refrac:{}/{} ({})",
            self.refraction_layers, self.max_refraction_layers, self.forced_refraction_layers
        )?;
        for buffer in &self.history {
            write!(f, " {}", buffer)?;
        }
        f.write_str("}")
    }
}

pub struct RenderView {
    width: u32,
    height: u32,
    reflection_level: ReflectionLevel,
    glow_on: bool,
    post_fx_on: bool,
    buffers: Option<ViewBuffers>,
    current: Option<RenderTargetBuffer>,
    history: Vec<RenderTargetBuffer>,
    refraction_layer: u32,
    forced_refraction_layer: u32,
    max_refraction_layer: u32,
}

impl RenderView {
    /// Buffers are created on the first device reset.
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            width: settings.width.max(1),
            height: settings.height.max(1),
            reflection_level: settings.reflection_level,
            glow_on: settings.glow_on,
            post_fx_on: settings.post_fx_on,
            buffers: None,
            current: None,
            history: Vec::new(),
            refraction_layer: 0,
            forced_refraction_layer: 0,
            max_refraction_layer: settings.refraction_level.max_layers(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Starts a frame: forgets the bind history and refraction usage.
    pub fn begin(&mut self) {
        self.history.clear();
        self.current = None;
        self.refraction_layer = 0;
        self.forced_refraction_layer = 0;
    }

    pub fn current(&self) -> Option<RenderTargetBuffer> {
        self.current
    }

    /// Makes `buffer` the render target. Binding the current buffer again does
    /// nothing; the refraction buffer is only ever a copy destination.
    pub fn bind(&mut self, device: &mut dyn Device, buffer: RenderTargetBuffer) -> Result<(), RenderError> {
        if self.current == Some(buffer) {
            return Ok(());
        }
        let buffers = self.buffers()?;

        let (color, depth) = match buffer {
            RenderTargetBuffer::Refraction => {
                return Err(RenderError::InvariantViolation(
                    "the refraction buffer cannot be bound as a render target".to_string(),
                ))
            }
            RenderTargetBuffer::Light => (buffers.light, Some(buffers.depth)),
            RenderTargetBuffer::Glow0 => {
                // A reduced GLOW0 cannot share the full-size depth buffer.
                let depth = self.glow_on.then_some(buffers.depth);
                (buffers.glow0, depth)
            }
            RenderTargetBuffer::Reflection => (buffers.reflection, Some(buffers.reflection_depth)),
            RenderTargetBuffer::GlowHalf => (buffers.glow_half, None),
            RenderTargetBuffer::Glow1 => (buffers.glow1, None),
            RenderTargetBuffer::Glow2 => (buffers.glow2, None),
        };

        device.set_render_target(Some(color), depth)?;
        self.history.push(buffer);
        self.current = Some(buffer);
        Ok(())
    }

    /// Copies the light buffer into the refraction buffer. Forced copies always
    /// happen; others only while the per-frame layer budget lasts. Returns
    /// whether a copy was made.
    pub fn update_refraction_buffer(&mut self, device: &mut dyn Device, force: bool) -> Result<bool, RenderError> {
        if !force && self.refraction_layer >= self.max_refraction_layer {
            return Ok(false);
        }

        let buffers = self.buffers()?;
        device.copy_render_target(buffers.light, buffers.refraction)?;
        if force {
            self.forced_refraction_layer += 1;
        } else {
            self.refraction_layer += 1;
        }
        Ok(true)
    }

    /// Re-creates the buffers for a new size. Zero or unchanged sizes are ignored.
    pub fn resize(&mut self, device: &mut dyn Device, width: u32, height: u32) -> Result<(), RenderError> {
        if width == 0 || height == 0 || (width == self.width && height == self.height) {
            return Ok(());
        }

        let allocated = self.buffers.is_some();
        self.release_buffers(device);
        self.width = width;
        self.height = height;
        if allocated {
            self.create_buffers(device)?;
        }
        Ok(())
    }

    pub fn viewport_width(&self, buffer: RenderTargetBuffer) -> u32 {
        self.buffer_size(buffer).0
    }

    pub fn viewport_height(&self, buffer: RenderTargetBuffer) -> u32 {
        self.buffer_size(buffer).1
    }

    pub fn texture(&self, buffer: RenderTargetBuffer) -> Option<TextureId> {
        let buffers = self.buffers.as_ref()?;
        Some(match buffer {
            RenderTargetBuffer::Light => buffers.light,
            RenderTargetBuffer::Reflection => buffers.reflection,
            RenderTargetBuffer::Refraction => buffers.refraction,
            RenderTargetBuffer::Glow0 => buffers.glow0,
            RenderTargetBuffer::GlowHalf => buffers.glow_half,
            RenderTargetBuffer::Glow1 => buffers.glow1,
            RenderTargetBuffer::Glow2 => buffers.glow2,
        })
    }

    pub fn stats(&self) -> ViewStats {
        ViewStats {
            refraction_layers: self.refraction_layer,
            max_refraction_layers: self.max_refraction_layer,
            forced_refraction_layers: self.forced_refraction_layer,
            history: self.history.clone(),
        }
    }

    fn buffers(&self) -> Result<ViewBuffers, RenderError> {
        self.buffers.ok_or_else(|| {
            RenderError::InvariantViolation("view buffers used while the device is lost".to_string())
        })
    }

    fn buffer_size(&self, buffer: RenderTargetBuffer) -> (u32, u32) {
        let (w, h) = (self.width, self.height);
        match buffer {
            RenderTargetBuffer::Light | RenderTargetBuffer::Refraction => (w, h),
            RenderTargetBuffer::Reflection => match self.reflection_level {
                ReflectionLevel::None => (1, 1),
                ReflectionLevel::Low => ((w / 4).max(1), (h / 4).max(1)),
                ReflectionLevel::Medium => ((w / 2).max(1), (h / 2).max(1)),
                ReflectionLevel::High => (w, h),
            },
            RenderTargetBuffer::Glow0 if !self.glow_on => (1, 1),
            RenderTargetBuffer::Glow0 => (w, h),
            RenderTargetBuffer::GlowHalf => ((w / 2).max(1), (h / 2).max(1)),
            RenderTargetBuffer::Glow1 | RenderTargetBuffer::Glow2 => {
                if !self.glow_on && !self.post_fx_on {
                    (1, 1)
                } else {
                    ((w / 4).max(1), (h / 4).max(1))
                }
            }
        }
    }

    fn create_buffers(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        use RenderTargetBuffer as B;

        let reflection = self.buffer_size(B::Reflection);
        let buffers = ViewBuffers {
            light: color_target(device, "light", self.buffer_size(B::Light))?,
            depth: device.create_texture_2d(&Texture2dDesc::depth_stencil("depth", self.width, self.height))?,
            refraction: color_target(device, "refraction", self.buffer_size(B::Refraction))?,
            reflection: color_target(device, "reflection", reflection)?,
            reflection_depth: device.create_texture_2d(&Texture2dDesc::depth_stencil(
                "reflection-depth",
                reflection.0,
                reflection.1,
            ))?,
            glow0: color_target(device, "glow0", self.buffer_size(B::Glow0))?,
            glow_half: color_target(device, "glow-half", self.buffer_size(B::GlowHalf))?,
            glow1: color_target(device, "glow1", self.buffer_size(B::Glow1))?,
            glow2: color_target(device, "glow2", self.buffer_size(B::Glow2))?,
        };
        debug!("Created view buffers {}x{}", self.width, self.height);
        self.buffers = Some(buffers);
        Ok(())
    }

    fn release_buffers(&mut self, device: &mut dyn Device) {
        if let Some(buffers) = self.buffers.take() {
            for texture in buffers.all() {
                device.release_texture(texture);
            }
        }
        self.current = None;
    }
}

fn color_target(device: &mut dyn Device, label: &'static str, size: (u32, u32)) -> Result<TextureId, RenderError> {
    Ok(device.create_texture_2d(&Texture2dDesc::render_target(
        label,
        size.0,
        size.1,
        TextureFormat::Argb8,
    ))?)
}

impl GpuResource for RenderView {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        self.release_buffers(device);
    }

    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.release_buffers(device);
        self.create_buffers(device)
    }
}
