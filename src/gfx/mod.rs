//! Graphics device abstraction consumed by the renderers.
//!
//! Renderers never talk to a graphics API directly: they create resources and
//! issue state changes and draws through [`Device`]. Two implementations ship
//! with the crate: [`RecordingDevice`], a headless device that validates every
//! call and keeps a log of the frame, and [`WgpuDevice`], which renders
//! offscreen with wgpu.

pub mod recording;
pub mod shader;
pub mod types;
pub mod wgpu_backend;

use glam::Vec4;
use thiserror::Error;

pub use recording::{DeviceEvent, DrawRecord, RecordingDevice};
pub use shader::{
    preprocess, ConstantEntry, ConstantSlot, ConstantTable, NoIncludes, ShaderBinary,
    ShaderIncluder, ShaderMacro,
};
pub use types::*;
pub use wgpu_backend::WgpuDevice;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("unknown {kind} handle {id}")]
    UnknownResource { kind: &'static str, id: u32 },
    #[error("resource creation failed: {0}")]
    Creation(String),
    #[error("{0}")]
    Compile(String),
    #[error("invalid shader binary: {0}")]
    InvalidBinary(String),
    #[error("invalid draw call: {0}")]
    InvalidDraw(String),
    #[error("texture {0:?} is sampled while bound as the render target")]
    FeedbackLoop(TextureId),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Immediate-mode graphics device.
///
/// State set through the `set_*` methods stays bound until changed. Shader
/// constants are persistent per shader object, the way a constant table
/// behaves: values written once are seen by every later draw using that shader.
pub trait Device {
    fn backend_name(&self) -> &'static str;

    fn create_buffer(&mut self, desc: &BufferDesc, initial: Option<&[u8]>)
        -> Result<BufferId, DeviceError>;
    fn write_buffer(
        &mut self,
        buffer: BufferId,
        lock: LockType,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError>;
    fn release_buffer(&mut self, buffer: BufferId);

    fn create_texture_2d(&mut self, desc: &Texture2dDesc) -> Result<TextureId, DeviceError>;
    fn release_texture(&mut self, texture: TextureId);
    fn texture_desc(&self, texture: TextureId) -> Option<Texture2dDesc>;

    /// Compiles `source` for `stage`, resolving includes through `includer`.
    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry: &str,
        macros: &[ShaderMacro],
        includer: &mut dyn ShaderIncluder,
    ) -> Result<ShaderBinary, DeviceError>;
    fn create_shader(&mut self, binary: &ShaderBinary) -> Result<ShaderId, DeviceError>;
    fn constant_index(&self, shader: ShaderId, name: &str) -> Option<ConstantIndex>;
    fn set_constant(
        &mut self,
        shader: ShaderId,
        index: ConstantIndex,
        value: ConstantValue,
    ) -> Result<(), DeviceError>;
    fn set_sampler(
        &mut self,
        shader: ShaderId,
        index: ConstantIndex,
        sampler: SamplerId,
        texture: Option<TextureId>,
    ) -> Result<(), DeviceError>;

    fn create_state(&mut self, desc: &PipelineStateDesc) -> Result<StateId, DeviceError>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError>;
    fn create_vertex_format(
        &mut self,
        desc: &VertexFormatDesc,
        shader: ShaderId,
    ) -> Result<VertexFormatId, DeviceError>;

    fn set_state(&mut self, state: StateId);
    fn set_vertex_format(&mut self, format: VertexFormatId);
    fn set_vertex_shader(&mut self, shader: Option<ShaderId>);
    fn set_pixel_shader(&mut self, shader: Option<ShaderId>);
    fn set_vertex_buffer(&mut self, buffer: BufferId);
    fn set_index_buffer(&mut self, buffer: Option<BufferId>);
    /// Texture stage used when no pixel shader is bound.
    fn set_fixed_texture(&mut self, texture: Option<TextureId>, sampler: Option<SamplerId>);

    fn set_render_target(
        &mut self,
        color: Option<TextureId>,
        depth: Option<TextureId>,
    ) -> Result<(), DeviceError>;
    fn set_viewport(&mut self, viewport: Viewport);
    fn clear_render_target(
        &mut self,
        flags: ClearFlags,
        color: Vec4,
        depth: f32,
        stencil: u8,
    ) -> Result<(), DeviceError>;
    fn copy_render_target(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError>;

    fn draw(
        &mut self,
        topology: Topology,
        start_vertex: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError>;
    fn draw_indexed(
        &mut self,
        topology: Topology,
        base_vertex: i32,
        vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError>;

    /// Submits the work recorded since the last flush.
    fn flush(&mut self) -> Result<(), DeviceError>;

    /// Writes `value` when the shader declares the constant, ignores it otherwise.
    fn set_constant_safe(
        &mut self,
        shader: ShaderId,
        index: Option<ConstantIndex>,
        value: ConstantValue,
    ) -> Result<(), DeviceError> {
        match index {
            Some(index) => self.set_constant(shader, index, value),
            None => Ok(()),
        }
    }

    fn set_sampler_safe(
        &mut self,
        shader: ShaderId,
        index: Option<ConstantIndex>,
        sampler: SamplerId,
        texture: Option<TextureId>,
    ) -> Result<(), DeviceError> {
        match index {
            Some(index) => self.set_sampler(shader, index, sampler, texture),
            None => Ok(()),
        }
    }
}
