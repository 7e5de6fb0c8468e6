//! Full-screen quad shared by the image-space passes.

use log::error;

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, BufferDesc, BufferId, BufferUsage, ConstantIndex, Device, ShaderId, ShaderMacro,
    StateId, Topology, VertexFormatId, Viewport,
};
use crate::resource::GpuResource;

use super::permutation::screen_state;
use super::render_view::{RenderTargetBuffer, RenderView};
use super::shader_lib::{ShaderLib, ShaderVersion};
use super::vertex::ScreenVertex;

const QUAD_VERTICES: [ScreenVertex; 4] = [
    ScreenVertex {
        position: [-1.0, 1.0],
        uv: [0.0, 0.0],
    },
    ScreenVertex {
        position: [1.0, 1.0],
        uv: [1.0, 0.0],
    },
    ScreenVertex {
        position: [-1.0, -1.0],
        uv: [0.0, 1.0],
    },
    ScreenVertex {
        position: [1.0, -1.0],
        uv: [1.0, 1.0],
    },
];

#[derive(Debug, Clone, Copy)]
struct QuadShader {
    vertex_shader: ShaderId,
    format: VertexFormatId,
}

/// Draws a textured quad covering the whole viewport. The caller binds the
/// pixel shader, its constants and the pipeline state first.
#[derive(Default)]
pub struct ScreenQuad {
    shader: Option<QuadShader>,
    vertex_buffer: Option<BufferId>,
}

impl ScreenQuad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match Self::load_shader(device, shader_lib) {
            Ok(shader) => {
                self.shader = Some(shader);
                true
            }
            Err(err) => {
                error!("Failed to initialise the screen quad: {}", err);
                false
            }
        }
    }

    fn load_shader(device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<QuadShader, RenderError> {
        let vertex_shader =
            shader_lib.get_vshader(device, "screenquad.vsh", ShaderVersion::Vs1_1, "vs_main", &[])?;
        let format = device.create_vertex_format(&ScreenVertex::format(), vertex_shader)?;
        Ok(QuadShader {
            vertex_shader,
            format,
        })
    }

    /// Sets a `width` x `height` viewport and draws the quad as a strip.
    pub fn send(&self, device: &mut dyn Device, width: u32, height: u32) -> Result<(), RenderError> {
        let (Some(shader), Some(vertex_buffer)) = (self.shader, self.vertex_buffer) else {
            return Err(RenderError::InvariantViolation(
                "screen quad drawn before initialisation or device reset".to_string(),
            ));
        };

        device.set_viewport(Viewport::sized(width, height));
        device.set_vertex_format(shader.format);
        device.set_vertex_shader(Some(shader.vertex_shader));
        device.set_fixed_texture(None, None);
        device.set_vertex_buffer(vertex_buffer);
        device.set_index_buffer(None);
        device.draw(Topology::TriangleStrip, 0, 2)?;
        Ok(())
    }

    /// Binds `target` and covers its whole viewport.
    pub fn send_to(
        &self,
        device: &mut dyn Device,
        view: &mut RenderView,
        target: RenderTargetBuffer,
    ) -> Result<(), RenderError> {
        view.bind(device, target)?;
        self.send(device, view.viewport_width(target), view.viewport_height(target))
    }
}

/// Pixel shader of an image-space pass and the state it draws with.
#[derive(Debug, Clone, Copy)]
pub struct ScreenShader {
    pub pixel_shader: ShaderId,
    pub state: StateId,
}

impl ScreenShader {
    pub fn load(
        device: &mut dyn Device,
        shader_lib: &mut ShaderLib,
        name: &str,
        macros: &[ShaderMacro],
        blend: BlendDesc,
    ) -> Result<Self, RenderError> {
        let pixel_shader = shader_lib.get_pshader(device, name, ShaderVersion::Ps2_0, "ps_main", macros)?;
        let state = device.create_state(&screen_state(blend))?;
        Ok(Self { pixel_shader, state })
    }

    pub fn constant(&self, device: &dyn Device, name: &str) -> Option<ConstantIndex> {
        device.constant_index(self.pixel_shader, name)
    }

    pub fn bind(&self, device: &mut dyn Device) {
        device.set_state(self.state);
        device.set_pixel_shader(Some(self.pixel_shader));
    }
}

impl GpuResource for ScreenQuad {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        if let Some(buffer) = self.vertex_buffer.take() {
            device.release_buffer(buffer);
        }
    }

    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.on_device_lost(device);
        let data: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let desc = BufferDesc::vertex(BufferUsage::Immutable, data.len() as u64);
        self.vertex_buffer = Some(device.create_buffer(&desc, Some(data))?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::RecordingDevice;

    #[test]
    fn sending_before_reset_is_rejected() {
        let mut device = RecordingDevice::new();
        let quad = ScreenQuad::new();
        assert!(matches!(
            quad.send(&mut device, 4, 4),
            Err(RenderError::InvariantViolation(_))
        ));
    }

    #[test]
    fn reset_replaces_the_vertex_buffer() {
        let mut device = RecordingDevice::new();
        let mut quad = ScreenQuad::new();
        quad.on_device_reset(&mut device).unwrap();
        quad.on_device_reset(&mut device).unwrap();
        assert_eq!(device.live_buffers().len(), 1);

        quad.on_device_lost(&mut device);
        assert!(device.live_buffers().is_empty());
    }
}
