//! Headless device that validates every call and records what a frame did.

use std::collections::{BTreeMap, HashMap};

use glam::Vec4;

use super::shader::{preprocess, ConstantSlot, ConstantTable, ShaderBinary, ShaderIncluder, ShaderMacro};
use super::types::*;
use super::{Device, DeviceError};

/// Snapshot of the pipeline at the moment a draw was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub color_target: Option<TextureId>,
    pub depth_target: Option<TextureId>,
    pub viewport: Viewport,
    pub state: StateId,
    pub vertex_format: VertexFormatId,
    pub vertex_shader: ShaderId,
    pub pixel_shader: Option<ShaderId>,
    pub vertex_buffer: BufferId,
    pub index_buffer: Option<BufferId>,
    pub fixed_texture: Option<TextureId>,
    pub topology: Topology,
    pub base_vertex: i32,
    pub primitive_count: u32,
    pub vertex_constants: BTreeMap<String, ConstantValue>,
    pub pixel_constants: BTreeMap<String, ConstantValue>,
    pub pixel_textures: BTreeMap<String, Option<TextureId>>,
}

impl DrawRecord {
    pub fn vertex_constant(&self, name: &str) -> Option<ConstantValue> {
        self.vertex_constants.get(name).copied()
    }

    pub fn pixel_constant(&self, name: &str) -> Option<ConstantValue> {
        self.pixel_constants.get(name).copied()
    }

    pub fn pixel_texture(&self, name: &str) -> Option<TextureId> {
        self.pixel_textures.get(name).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    SetRenderTarget {
        color: Option<TextureId>,
        depth: Option<TextureId>,
    },
    Clear {
        flags: ClearFlags,
        color: Vec4,
    },
    Copy {
        src: TextureId,
        dst: TextureId,
    },
    BufferWrite {
        buffer: BufferId,
        lock: LockType,
        bytes: usize,
    },
    Draw(DrawRecord),
}

struct RecordedBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct RecordedShader {
    stage: ShaderStage,
    table: ConstantTable,
    constants: HashMap<ConstantIndex, ConstantValue>,
    samplers: HashMap<ConstantIndex, (SamplerId, Option<TextureId>)>,
}

#[derive(Default)]
struct Bindings {
    state: Option<StateId>,
    vertex_format: Option<VertexFormatId>,
    vertex_shader: Option<ShaderId>,
    pixel_shader: Option<ShaderId>,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    fixed_texture: Option<TextureId>,
    color_target: Option<TextureId>,
    depth_target: Option<TextureId>,
    viewport: Viewport,
}

#[derive(Default)]
pub struct RecordingDevice {
    next_id: u32,
    buffers: HashMap<u32, RecordedBuffer>,
    textures: HashMap<u32, Texture2dDesc>,
    shaders: HashMap<u32, RecordedShader>,
    states: HashMap<u32, PipelineStateDesc>,
    samplers: HashMap<u32, SamplerDesc>,
    formats: HashMap<u32, VertexFormatDesc>,
    bound: Bindings,
    events: Vec<DeviceEvent>,
    compile_count: usize,
    flush_count: usize,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn events(&self) -> &[DeviceEvent] {
        &self.events
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.events.iter().filter_map(|event| match event {
            DeviceEvent::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    pub fn draw_count(&self) -> usize {
        self.draws().count()
    }

    /// Forgets the recorded events, keeping resources and bindings.
    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Descriptors of every live texture, sorted for structural comparison.
    pub fn live_textures(&self) -> Vec<Texture2dDesc> {
        let mut textures: Vec<_> = self.textures.values().copied().collect();
        textures.sort_by(|a, b| {
            (a.label, a.width, a.height).cmp(&(b.label, b.width, b.height))
        });
        textures
    }

    pub fn live_buffers(&self) -> Vec<BufferDesc> {
        let mut buffers: Vec<_> = self.buffers.values().map(|b| b.desc).collect();
        buffers.sort_by_key(|desc| (desc.size, desc.kind == BufferKind::Index16));
        buffers
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn state_desc(&self, state: StateId) -> Option<PipelineStateDesc> {
        self.states.get(&state.0).copied()
    }

    pub fn sampler_desc(&self, sampler: SamplerId) -> Option<SamplerDesc> {
        self.samplers.get(&sampler.0).copied()
    }

    pub fn vertex_format_desc(&self, format: VertexFormatId) -> Option<&VertexFormatDesc> {
        self.formats.get(&format.0)
    }

    fn shader(&self, shader: ShaderId) -> Result<&RecordedShader, DeviceError> {
        self.shaders.get(&shader.0).ok_or(DeviceError::UnknownResource {
            kind: "shader",
            id: shader.0,
        })
    }

    fn shader_mut(&mut self, shader: ShaderId) -> Result<&mut RecordedShader, DeviceError> {
        self.shaders.get_mut(&shader.0).ok_or(DeviceError::UnknownResource {
            kind: "shader",
            id: shader.0,
        })
    }

    fn check_texture(&self, texture: TextureId) -> Result<&Texture2dDesc, DeviceError> {
        self.textures.get(&texture.0).ok_or(DeviceError::UnknownResource {
            kind: "texture",
            id: texture.0,
        })
    }

    fn named_constants(&self, shader: Option<ShaderId>) -> BTreeMap<String, ConstantValue> {
        let Some(recorded) = shader.and_then(|id| self.shaders.get(&id.0)) else {
            return BTreeMap::new();
        };
        recorded
            .constants
            .iter()
            .filter_map(|(index, value)| {
                recorded
                    .table
                    .entry(*index)
                    .map(|entry| (entry.name.clone(), *value))
            })
            .collect()
    }

    fn named_textures(&self, shader: Option<ShaderId>) -> BTreeMap<String, Option<TextureId>> {
        let Some(recorded) = shader.and_then(|id| self.shaders.get(&id.0)) else {
            return BTreeMap::new();
        };
        recorded
            .samplers
            .iter()
            .filter_map(|(index, (_, texture))| {
                recorded
                    .table
                    .entry(*index)
                    .map(|entry| (entry.name.clone(), *texture))
            })
            .collect()
    }

    fn record_draw(
        &mut self,
        topology: Topology,
        base_vertex: i32,
        primitive_count: u32,
        indexed: bool,
    ) -> Result<(), DeviceError> {
        let missing = |what: &str| DeviceError::InvalidDraw(format!("no {what} bound"));

        let state = self.bound.state.ok_or_else(|| missing("state"))?;
        let vertex_format = self.bound.vertex_format.ok_or_else(|| missing("vertex format"))?;
        let vertex_shader = self.bound.vertex_shader.ok_or_else(|| missing("vertex shader"))?;
        let vertex_buffer = self.bound.vertex_buffer.ok_or_else(|| missing("vertex buffer"))?;
        if self.bound.color_target.is_none() && self.bound.depth_target.is_none() {
            return Err(missing("render target"));
        }
        if indexed && self.bound.index_buffer.is_none() {
            return Err(missing("index buffer"));
        }

        let vertex_textures = self.named_textures(Some(vertex_shader));
        let pixel_textures = self.named_textures(self.bound.pixel_shader);
        if let Some(target) = self.bound.color_target {
            let sampled = vertex_textures
                .values()
                .chain(pixel_textures.values())
                .copied()
                .chain(std::iter::once(self.bound.fixed_texture));
            for texture in sampled.flatten() {
                if texture == target {
                    return Err(DeviceError::FeedbackLoop(texture));
                }
            }
        }

        let record = DrawRecord {
            color_target: self.bound.color_target,
            depth_target: self.bound.depth_target,
            viewport: self.bound.viewport,
            state,
            vertex_format,
            vertex_shader,
            pixel_shader: self.bound.pixel_shader,
            vertex_buffer,
            index_buffer: if indexed { self.bound.index_buffer } else { None },
            fixed_texture: self.bound.fixed_texture,
            topology,
            base_vertex,
            primitive_count,
            vertex_constants: self.named_constants(Some(vertex_shader)),
            pixel_constants: self.named_constants(self.bound.pixel_shader),
            pixel_textures,
        };
        self.events.push(DeviceEvent::Draw(record));
        Ok(())
    }
}

impl Device for RecordingDevice {
    fn backend_name(&self) -> &'static str {
        "recording"
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::Creation("zero-sized buffer".to_string()));
        }
        let mut data = vec![0u8; desc.size as usize];
        if let Some(initial) = initial {
            if initial.len() > data.len() {
                return Err(DeviceError::Creation(format!(
                    "initial data ({} bytes) exceeds buffer size ({} bytes)",
                    initial.len(),
                    desc.size
                )));
            }
            data[..initial.len()].copy_from_slice(initial);
        } else if desc.usage == BufferUsage::Immutable {
            return Err(DeviceError::Creation(
                "immutable buffer created without contents".to_string(),
            ));
        }

        let id = self.allocate_id();
        self.buffers.insert(id, RecordedBuffer { desc: *desc, data });
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        lock: LockType,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let recorded = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::UnknownResource {
                kind: "buffer",
                id: buffer.0,
            })?;
        if recorded.desc.usage == BufferUsage::Immutable {
            return Err(DeviceError::InvalidDraw("write to an immutable buffer".to_string()));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > recorded.data.len() {
            return Err(DeviceError::InvalidDraw(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                recorded.data.len()
            )));
        }
        if lock == LockType::WriteDiscard {
            recorded.data.fill(0);
        }
        recorded.data[start..end].copy_from_slice(data);
        self.events.push(DeviceEvent::BufferWrite {
            buffer,
            lock,
            bytes: data.len(),
        });
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
        if self.bound.vertex_buffer == Some(buffer) {
            self.bound.vertex_buffer = None;
        }
        if self.bound.index_buffer == Some(buffer) {
            self.bound.index_buffer = None;
        }
    }

    fn create_texture_2d(&mut self, desc: &Texture2dDesc) -> Result<TextureId, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::Creation(format!(
                "texture '{}' has an empty extent",
                desc.label
            )));
        }
        if desc.format.is_depth() != desc.bind.contains(TextureBind::DEPTH_STENCIL) {
            return Err(DeviceError::Creation(format!(
                "texture '{}' format and bind flags disagree",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.textures.insert(id, *desc);
        Ok(TextureId(id))
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
        if self.bound.color_target == Some(texture) {
            self.bound.color_target = None;
        }
        if self.bound.depth_target == Some(texture) {
            self.bound.depth_target = None;
        }
    }

    fn texture_desc(&self, texture: TextureId) -> Option<Texture2dDesc> {
        self.textures.get(&texture.0).copied()
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry: &str,
        macros: &[ShaderMacro],
        includer: &mut dyn ShaderIncluder,
    ) -> Result<ShaderBinary, DeviceError> {
        self.compile_count += 1;
        let expanded = preprocess(source, macros, includer).map_err(DeviceError::Compile)?;
        if !expanded.contains(&format!("fn {entry}")) {
            return Err(DeviceError::Compile(format!(
                "entry point '{entry}' not found"
            )));
        }
        Ok(ShaderBinary {
            stage,
            entry: entry.to_string(),
            code: expanded.into_bytes(),
        })
    }

    fn create_shader(&mut self, binary: &ShaderBinary) -> Result<ShaderId, DeviceError> {
        let table = ConstantTable::parse(binary.source()?);
        let id = self.allocate_id();
        self.shaders.insert(
            id,
            RecordedShader {
                stage: binary.stage,
                table,
                constants: HashMap::new(),
                samplers: HashMap::new(),
            },
        );
        Ok(ShaderId(id))
    }

    fn constant_index(&self, shader: ShaderId, name: &str) -> Option<ConstantIndex> {
        self.shaders.get(&shader.0)?.table.index_of(name)
    }

    fn set_constant(
        &mut self,
        shader: ShaderId,
        index: ConstantIndex,
        value: ConstantValue,
    ) -> Result<(), DeviceError> {
        let recorded = self.shader_mut(shader)?;
        match recorded.table.entry(index).map(|entry| entry.slot) {
            Some(ConstantSlot::Register(_)) => {
                recorded.constants.insert(index, value);
                Ok(())
            }
            Some(ConstantSlot::Texture(_)) => Err(DeviceError::InvalidDraw(
                "value written to a texture slot".to_string(),
            )),
            None => Err(DeviceError::UnknownResource {
                kind: "constant",
                id: index.0,
            }),
        }
    }

    fn set_sampler(
        &mut self,
        shader: ShaderId,
        index: ConstantIndex,
        sampler: SamplerId,
        texture: Option<TextureId>,
    ) -> Result<(), DeviceError> {
        if !self.samplers.contains_key(&sampler.0) {
            return Err(DeviceError::UnknownResource {
                kind: "sampler",
                id: sampler.0,
            });
        }
        if let Some(texture) = texture {
            self.check_texture(texture)?;
        }
        let recorded = self.shader_mut(shader)?;
        match recorded.table.entry(index).map(|entry| entry.slot) {
            Some(ConstantSlot::Texture(_)) => {
                recorded.samplers.insert(index, (sampler, texture));
                Ok(())
            }
            _ => Err(DeviceError::UnknownResource {
                kind: "sampler slot",
                id: index.0,
            }),
        }
    }

    fn create_state(&mut self, desc: &PipelineStateDesc) -> Result<StateId, DeviceError> {
        let id = self.allocate_id();
        self.states.insert(id, *desc);
        Ok(StateId(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError> {
        let id = self.allocate_id();
        self.samplers.insert(id, *desc);
        Ok(SamplerId(id))
    }

    fn create_vertex_format(
        &mut self,
        desc: &VertexFormatDesc,
        shader: ShaderId,
    ) -> Result<VertexFormatId, DeviceError> {
        if self.shader(shader)?.stage != ShaderStage::Vertex {
            return Err(DeviceError::Creation(
                "vertex formats must be validated against a vertex shader".to_string(),
            ));
        }
        if desc.elements.is_empty() {
            return Err(DeviceError::Creation("empty vertex format".to_string()));
        }
        let id = self.allocate_id();
        self.formats.insert(id, desc.clone());
        Ok(VertexFormatId(id))
    }

    fn set_state(&mut self, state: StateId) {
        self.bound.state = Some(state);
    }

    fn set_vertex_format(&mut self, format: VertexFormatId) {
        self.bound.vertex_format = Some(format);
    }

    fn set_vertex_shader(&mut self, shader: Option<ShaderId>) {
        self.bound.vertex_shader = shader;
    }

    fn set_pixel_shader(&mut self, shader: Option<ShaderId>) {
        self.bound.pixel_shader = shader;
    }

    fn set_vertex_buffer(&mut self, buffer: BufferId) {
        self.bound.vertex_buffer = Some(buffer);
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferId>) {
        self.bound.index_buffer = buffer;
    }

    fn set_fixed_texture(&mut self, texture: Option<TextureId>, _sampler: Option<SamplerId>) {
        self.bound.fixed_texture = texture;
    }

    fn set_render_target(
        &mut self,
        color: Option<TextureId>,
        depth: Option<TextureId>,
    ) -> Result<(), DeviceError> {
        let mut viewport = None;
        if let Some(color) = color {
            let desc = self.check_texture(color)?;
            if !desc.bind.contains(TextureBind::RENDER_TARGET) {
                return Err(DeviceError::InvalidDraw(format!(
                    "texture '{}' is not a render target",
                    desc.label
                )));
            }
            viewport = Some(Viewport::sized(desc.width, desc.height));
        }
        if let Some(depth) = depth {
            let desc = self.check_texture(depth)?;
            if !desc.bind.contains(TextureBind::DEPTH_STENCIL) {
                return Err(DeviceError::InvalidDraw(format!(
                    "texture '{}' is not a depth-stencil surface",
                    desc.label
                )));
            }
            let size = Viewport::sized(desc.width, desc.height);
            if viewport.is_some_and(|color_size| color_size != size) {
                return Err(DeviceError::InvalidDraw(format!(
                    "depth surface '{}' does not match the colour target size",
                    desc.label
                )));
            }
            viewport.get_or_insert(size);
        }

        self.bound.color_target = color;
        self.bound.depth_target = depth;
        if let Some(viewport) = viewport {
            self.bound.viewport = viewport;
        }
        self.events.push(DeviceEvent::SetRenderTarget { color, depth });
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.bound.viewport = viewport;
    }

    fn clear_render_target(
        &mut self,
        flags: ClearFlags,
        color: Vec4,
        _depth: f32,
        _stencil: u8,
    ) -> Result<(), DeviceError> {
        if flags.contains(ClearFlags::COLOR) && self.bound.color_target.is_none() {
            return Err(DeviceError::InvalidDraw("clearing colour without a target".to_string()));
        }
        if flags.intersects(ClearFlags::DEPTH | ClearFlags::STENCIL)
            && self.bound.depth_target.is_none()
        {
            return Err(DeviceError::InvalidDraw("clearing depth without a target".to_string()));
        }
        self.events.push(DeviceEvent::Clear { flags, color });
        Ok(())
    }

    fn copy_render_target(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError> {
        let src_desc = *self.check_texture(src)?;
        let dst_desc = *self.check_texture(dst)?;
        if src == dst {
            return Err(DeviceError::FeedbackLoop(src));
        }
        if src_desc.format != dst_desc.format {
            return Err(DeviceError::InvalidDraw(format!(
                "cannot copy '{}' into '{}': formats differ",
                src_desc.label, dst_desc.label
            )));
        }
        self.events.push(DeviceEvent::Copy { src, dst });
        Ok(())
    }

    fn draw(
        &mut self,
        topology: Topology,
        start_vertex: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError> {
        self.record_draw(topology, start_vertex as i32, primitive_count, false)
    }

    fn draw_indexed(
        &mut self,
        topology: Topology,
        base_vertex: i32,
        vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError> {
        if let Some(buffer) = self.bound.index_buffer.and_then(|id| self.buffers.get(&id.0)) {
            let available = (buffer.desc.size / 2) as u32;
            let needed = start_index + topology.index_count(primitive_count);
            if needed > available {
                return Err(DeviceError::InvalidDraw(format!(
                    "draw reads {needed} indices, buffer holds {available}"
                )));
            }
        }
        if vertex_count == 0 {
            return Err(DeviceError::InvalidDraw("indexed draw over zero vertices".to_string()));
        }
        self.record_draw(topology, base_vertex, primitive_count, true)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.flush_count += 1;
        Ok(())
    }
}
