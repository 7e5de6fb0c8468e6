//! Offscreen wgpu implementation of [`Device`].
//!
//! The immediate-mode calls are translated lazily: draws are queued against
//! the bound render target and encoded into one render pass when the target
//! changes, a copy or buffer write needs the encoder, or the device is
//! flushed. Shader constants live in a per-stage register file of
//! [`REGISTER_COUNT`] vec4s that is uploaded with every draw, so later
//! constant writes never leak into earlier draws.

mod pipeline_builder;

use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;

use glam::Vec4;
use wgpu::util::DeviceExt;

use super::shader::{preprocess, ConstantSlot, ConstantTable, ShaderBinary, ShaderIncluder, ShaderMacro};
use super::types::*;
use super::{Device, DeviceError};
use pipeline_builder::PipelineBuilder;

pub const REGISTER_COUNT: usize = 64;

/// Texture name a vertex shader declares to receive the fixed-function texture.
const FIXED_TEXTURE_NAME: &str = "FixedTexture";
/// Fragment entry point used from the vertex module when no pixel shader is bound.
const FIXED_FRAGMENT_ENTRY: &str = "ps_fixed";

struct GpuBuffer {
    buffer: wgpu::Buffer,
    desc: BufferDesc,
    padded_size: u64,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: Texture2dDesc,
}

struct GpuShader {
    module: wgpu::ShaderModule,
    stage: ShaderStage,
    entry: String,
    table: ConstantTable,
    registers: Vec<[f32; 4]>,
    samplers: HashMap<ConstantIndex, (SamplerId, Option<TextureId>)>,
}

struct GpuSampler {
    sampler: wgpu::Sampler,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextureSlotKey {
    binding: u32,
    filterable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    vertex_shader: u32,
    pixel_shader: Option<u32>,
    vertex_format: u32,
    state: u32,
    topology: Topology,
    color_format: Option<TextureFormat>,
    depth_format: Option<TextureFormat>,
    sample_count: u32,
    texture_slots: Vec<TextureSlotKey>,
}

struct CachedPipeline {
    pipeline: wgpu::RenderPipeline,
    registers_layout: wgpu::BindGroupLayout,
    textures_layout: wgpu::BindGroupLayout,
}

struct ResolvedSlot {
    key: TextureSlotKey,
    texture: Option<TextureId>,
    sampler: Option<SamplerId>,
}

enum DrawCall {
    Direct { vertices: Range<u32> },
    Indexed { indices: Range<u32>, base_vertex: i32 },
}

struct PendingDraw {
    pipeline: wgpu::RenderPipeline,
    registers: wgpu::BindGroup,
    textures: wgpu::BindGroup,
    vertex_buffer: wgpu::Buffer,
    index_buffer: Option<wgpu::Buffer>,
    viewport: Viewport,
    call: DrawCall,
}

struct PendingClear {
    flags: ClearFlags,
    color: Vec4,
    depth: f32,
    stencil: u8,
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
    fixed_sampler: Option<SamplerId>,
    color_target: Option<TextureId>,
    depth_target: Option<TextureId>,
    viewport: Viewport,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u32,
    buffers: HashMap<u32, GpuBuffer>,
    textures: HashMap<u32, GpuTexture>,
    shaders: HashMap<u32, GpuShader>,
    states: HashMap<u32, PipelineStateDesc>,
    samplers: HashMap<u32, GpuSampler>,
    formats: HashMap<u32, VertexFormatDesc>,
    pipelines: HashMap<PipelineKey, CachedPipeline>,
    bound: Bindings,
    pending: Vec<PendingDraw>,
    pending_clear: Option<PendingClear>,
    fallback_view: wgpu::TextureView,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
}

impl WgpuDevice {
    /// Requests an adapter without a surface and wraps it.
    pub fn new_headless() -> Result<Self, DeviceError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|err| DeviceError::Backend(format!("no adapter: {err}")))?;

            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("AnimaDevice"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await
                .map_err(|err| DeviceError::Backend(format!("device request failed: {err}")))?;

            log::info!("Created wgpu device on {:?}", adapter.get_info().backend);
            Ok(Self::from_parts(device, queue))
        })
    }

    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        device.on_uncaptured_error(std::sync::Arc::new(|err| {
            log::error!("wgpu uncaptured error: {err}");
        }));

        let fallback = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("FallbackWhite"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );
        let fallback_view = fallback.create_view(&wgpu::TextureViewDescriptor::default());

        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("FallbackLinear"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("FallbackNearest"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            device,
            queue,
            encoder: None,
            next_id: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            states: HashMap::new(),
            samplers: HashMap::new(),
            formats: HashMap::new(),
            pipelines: HashMap::new(),
            bound: Bindings::default(),
            pending: Vec::new(),
            pending_clear: None,
            fallback_view,
            linear_sampler,
            nearest_sampler,
        }
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The wgpu texture behind a handle, e.g. to present the light buffer.
    pub fn wgpu_texture(&self, texture: TextureId) -> Option<&wgpu::Texture> {
        self.textures.get(&texture.0).map(|t| &t.texture)
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("AnimaFrameEncoder"),
            })
        })
    }

    fn texture(&self, texture: TextureId) -> Result<&GpuTexture, DeviceError> {
        self.textures.get(&texture.0).ok_or(DeviceError::UnknownResource {
            kind: "texture",
            id: texture.0,
        })
    }

    fn shader(&self, shader: ShaderId) -> Result<&GpuShader, DeviceError> {
        self.shaders.get(&shader.0).ok_or(DeviceError::UnknownResource {
            kind: "shader",
            id: shader.0,
        })
    }

    fn create_module(&self, label: &str, source: &str) -> wgpu::ShaderModule {
        self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
        })
    }

    /// Encodes the queued draws (and pending clear) for the bound target.
    fn flush_pass(&mut self) -> Result<(), DeviceError> {
        if self.pending.is_empty() && self.pending_clear.is_none() {
            return Ok(());
        }

        let clear = self.pending_clear.take();
        let draws = std::mem::take(&mut self.pending);

        let color_view = match self.bound.color_target {
            Some(id) => Some(self.texture(id)?.view.clone()),
            None => None,
        };
        let depth_view = match self.bound.depth_target {
            Some(id) => Some(self.texture(id)?.view.clone()),
            None => None,
        };
        if color_view.is_none() && depth_view.is_none() {
            return Err(DeviceError::InvalidDraw("no render target bound".to_string()));
        }

        let flags = clear.as_ref().map_or(ClearFlags::empty(), |c| c.flags);
        let color_load = match &clear {
            Some(c) if flags.contains(ClearFlags::COLOR) => wgpu::LoadOp::Clear(wgpu::Color {
                r: c.color.x as f64,
                g: c.color.y as f64,
                b: c.color.z as f64,
                a: c.color.w as f64,
            }),
            _ => wgpu::LoadOp::Load,
        };
        let depth_load = match &clear {
            Some(c) if flags.contains(ClearFlags::DEPTH) => wgpu::LoadOp::Clear(c.depth),
            _ => wgpu::LoadOp::Load,
        };
        let stencil_load = match &clear {
            Some(c) if flags.contains(ClearFlags::STENCIL) => wgpu::LoadOp::Clear(c.stencil as u32),
            _ => wgpu::LoadOp::Load,
        };

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_view
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("AnimaPass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_view.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: Some(wgpu::Operations {
                        load: stencil_load,
                        store: wgpu::StoreOp::Store,
                    }),
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for draw in &draws {
            pass.set_pipeline(&draw.pipeline);
            pass.set_bind_group(0, &draw.registers, &[]);
            pass.set_bind_group(1, &draw.textures, &[]);
            pass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
            pass.set_viewport(
                draw.viewport.x as f32,
                draw.viewport.y as f32,
                draw.viewport.width as f32,
                draw.viewport.height as f32,
                0.0,
                1.0,
            );
            match &draw.call {
                DrawCall::Direct { vertices } => pass.draw(vertices.clone(), 0..1),
                DrawCall::Indexed {
                    indices,
                    base_vertex,
                } => {
                    if let Some(index_buffer) = &draw.index_buffer {
                        pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                        pass.draw_indexed(indices.clone(), *base_vertex, 0..1);
                    }
                }
            }
        }

        Ok(())
    }

    fn resolve_texture_slots(
        &self,
        vertex: &GpuShader,
        pixel: Option<&GpuShader>,
    ) -> Result<Vec<ResolvedSlot>, DeviceError> {
        let mut slots = Vec::new();

        let stages = std::iter::once(vertex).chain(pixel);
        for shader in stages {
            for (index, binding) in shader.table.texture_bindings() {
                let is_fixed = shader.stage == ShaderStage::Vertex
                    && shader
                        .table
                        .entry(index)
                        .is_some_and(|entry| entry.name == FIXED_TEXTURE_NAME);
                let (sampler, texture) = if is_fixed {
                    (self.bound.fixed_sampler, self.bound.fixed_texture)
                } else {
                    shader
                        .samplers
                        .get(&index)
                        .map_or((None, None), |(sampler, texture)| (Some(*sampler), *texture))
                };

                if let Some(texture) = texture {
                    if Some(texture) == self.bound.color_target {
                        return Err(DeviceError::FeedbackLoop(texture));
                    }
                }

                let filterable = match texture {
                    Some(id) => {
                        let format = self.texture(id)?.desc.format;
                        if format.is_depth() {
                            return Err(DeviceError::InvalidDraw(
                                "depth textures cannot be sampled".to_string(),
                            ));
                        }
                        format != TextureFormat::R32F
                    }
                    None => true,
                };

                if slots.iter().any(|s: &ResolvedSlot| s.key.binding == binding) {
                    return Err(DeviceError::InvalidDraw(format!(
                        "texture binding {binding} declared by both stages"
                    )));
                }
                slots.push(ResolvedSlot {
                    key: TextureSlotKey {
                        binding,
                        filterable,
                    },
                    texture,
                    sampler,
                });
            }
        }

        slots.sort_by_key(|slot| slot.key.binding);
        Ok(slots)
    }

    fn build_pipeline(&self, key: &PipelineKey) -> Result<CachedPipeline, DeviceError> {
        let vertex = self.shader(ShaderId(key.vertex_shader))?;
        let pixel = match key.pixel_shader {
            Some(id) => Some(self.shader(ShaderId(id))?),
            None => None,
        };
        let state = self.states.get(&key.state).ok_or(DeviceError::UnknownResource {
            kind: "state",
            id: key.state,
        })?;
        let format = self
            .formats
            .get(&key.vertex_format)
            .ok_or(DeviceError::UnknownResource {
                kind: "vertex format",
                id: key.vertex_format,
            })?;

        let visibility = wgpu::ShaderStages::VERTEX_FRAGMENT;
        let register_entries: Vec<wgpu::BindGroupLayoutEntry> = register_bindings(vertex, pixel)?
            .into_iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let registers_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("RegistersLayout"),
                entries: &register_entries,
            });

        let texture_entries: Vec<wgpu::BindGroupLayoutEntry> = key
            .texture_slots
            .iter()
            .flat_map(|slot| {
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: slot.binding,
                        visibility,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float {
                                filterable: slot.filterable,
                            },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: slot.binding + 1,
                        visibility,
                        ty: wgpu::BindingType::Sampler(if slot.filterable {
                            wgpu::SamplerBindingType::Filtering
                        } else {
                            wgpu::SamplerBindingType::NonFiltering
                        }),
                        count: None,
                    },
                ]
            })
            .collect();
        let textures_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("TexturesLayout"),
                entries: &texture_entries,
            });

        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("AnimaPipelineLayout"),
                bind_group_layouts: &[&registers_layout, &textures_layout],
                push_constant_ranges: &[],
            });

        let attributes: Vec<wgpu::VertexAttribute> = format
            .elements
            .iter()
            .enumerate()
            .map(|(location, element)| wgpu::VertexAttribute {
                format: to_wgpu_vertex_format(element.format),
                offset: element.offset as wgpu::BufferAddress,
                shader_location: location as u32,
            })
            .collect();

        let (fragment_module, fragment_entry) = match pixel {
            Some(pixel) => (&pixel.module, pixel.entry.as_str()),
            None => (&vertex.module, FIXED_FRAGMENT_ENTRY),
        };

        let mut builder = PipelineBuilder::new(&self.device, &layout, &vertex.module, &vertex.entry)
            .with_label("AnimaPipeline")
            .with_fragment(fragment_module, fragment_entry)
            .with_vertex_buffer(wgpu::VertexBufferLayout {
                array_stride: format.stride() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            })
            .with_cull_mode(match state.raster.cull {
                CullMode::None => None,
                CullMode::Back => Some(wgpu::Face::Back),
                CullMode::Front => Some(wgpu::Face::Front),
            })
            .with_topology(match key.topology {
                Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
            })
            .with_multisample(key.sample_count);

        if let Some(color_format) = key.color_format {
            builder = builder.with_color_target(
                to_wgpu_texture_format(color_format),
                to_wgpu_blend(&state.blend),
            );
        }
        if let Some(depth_format) = key.depth_format {
            let (depth_write, compare) = if state.depth.depth_test {
                (state.depth.depth_write, to_wgpu_compare(state.depth.depth_func))
            } else {
                (false, wgpu::CompareFunction::Always)
            };
            builder = builder.with_depth_stencil(
                to_wgpu_texture_format(depth_format),
                depth_write,
                compare,
            );
        }

        Ok(CachedPipeline {
            pipeline: builder.build(),
            registers_layout,
            textures_layout,
        })
    }

    fn register_group(
        &self,
        layout: &wgpu::BindGroupLayout,
        vertex: &GpuShader,
        pixel: Option<&GpuShader>,
    ) -> wgpu::BindGroup {
        let buffers: Vec<(u32, wgpu::Buffer)> = std::iter::once(vertex)
            .chain(pixel)
            .filter_map(|shader| {
                let binding = shader.table.register_binding()?;
                let buffer = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("ShaderRegisters"),
                        contents: bytemuck::cast_slice(&shader.registers),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });
                Some((binding, buffer))
            })
            .collect();

        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("RegistersGroup"),
            layout,
            entries: &entries,
        })
    }

    fn texture_group(
        &self,
        layout: &wgpu::BindGroupLayout,
        slots: &[ResolvedSlot],
    ) -> Result<wgpu::BindGroup, DeviceError> {
        let mut resources: Vec<(u32, wgpu::TextureView, wgpu::Sampler)> = Vec::new();
        for slot in slots {
            let view = match slot.texture {
                Some(id) => self.texture(id)?.view.clone(),
                None => self.fallback_view.clone(),
            };
            let sampler = match (slot.key.filterable, slot.sampler) {
                (false, _) => self.nearest_sampler.clone(),
                (true, Some(id)) => self
                    .samplers
                    .get(&id.0)
                    .map(|s| s.sampler.clone())
                    .ok_or(DeviceError::UnknownResource {
                        kind: "sampler",
                        id: id.0,
                    })?,
                (true, None) => self.linear_sampler.clone(),
            };
            resources.push((slot.key.binding, view, sampler));
        }

        let entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .flat_map(|(binding, view, sampler)| {
                [
                    wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: *binding + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TexturesGroup"),
            layout,
            entries: &entries,
        }))
    }

    fn queue_draw(&mut self, topology: Topology, call: DrawCall) -> Result<(), DeviceError> {
        let missing = |what: &str| DeviceError::InvalidDraw(format!("no {what} bound"));
        let state = self.bound.state.ok_or_else(|| missing("state"))?;
        let vertex_format = self.bound.vertex_format.ok_or_else(|| missing("vertex format"))?;
        let vertex_shader = self.bound.vertex_shader.ok_or_else(|| missing("vertex shader"))?;
        let vertex_buffer = self.bound.vertex_buffer.ok_or_else(|| missing("vertex buffer"))?;

        let (target_size, color_format, sample_count) = match self.bound.color_target {
            Some(id) => {
                let desc = self.texture(id)?.desc;
                ((desc.width, desc.height), Some(desc.format), desc.sample_count)
            }
            None => {
                let id = self.bound.depth_target.ok_or_else(|| missing("render target"))?;
                let desc = self.texture(id)?.desc;
                ((desc.width, desc.height), None, desc.sample_count)
            }
        };
        let depth_format = match self.bound.depth_target {
            Some(id) => Some(self.texture(id)?.desc.format),
            None => None,
        };

        let vertex = self.shader(vertex_shader)?;
        let pixel = match self.bound.pixel_shader {
            Some(id) => Some(self.shader(id)?),
            None => None,
        };
        let slots = self.resolve_texture_slots(vertex, pixel)?;

        let key = PipelineKey {
            vertex_shader: vertex_shader.0,
            pixel_shader: self.bound.pixel_shader.map(|id| id.0),
            vertex_format: vertex_format.0,
            state: state.0,
            topology,
            color_format,
            depth_format,
            sample_count,
            texture_slots: slots.iter().map(|slot| slot.key.clone()).collect(),
        };

        if !self.pipelines.contains_key(&key) {
            let cached = self.build_pipeline(&key)?;
            self.pipelines.insert(key.clone(), cached);
        }
        let cached = self
            .pipelines
            .get(&key)
            .ok_or_else(|| DeviceError::Backend("pipeline cache miss".to_string()))?;

        let vertex = self.shader(vertex_shader)?;
        let pixel = match self.bound.pixel_shader {
            Some(id) => Some(self.shader(id)?),
            None => None,
        };
        let registers = self.register_group(&cached.registers_layout, vertex, pixel);
        let textures = self.texture_group(&cached.textures_layout, &slots)?;
        let pipeline = cached.pipeline.clone();

        let vertex_buffer = self
            .buffers
            .get(&vertex_buffer.0)
            .map(|b| b.buffer.clone())
            .ok_or(DeviceError::UnknownResource {
                kind: "buffer",
                id: vertex_buffer.0,
            })?;
        let index_buffer = match (&call, self.bound.index_buffer) {
            (DrawCall::Indexed { .. }, Some(id)) => Some(
                self.buffers
                    .get(&id.0)
                    .map(|b| b.buffer.clone())
                    .ok_or(DeviceError::UnknownResource {
                        kind: "buffer",
                        id: id.0,
                    })?,
            ),
            (DrawCall::Indexed { .. }, None) => return Err(missing("index buffer")),
            _ => None,
        };

        let viewport = clamp_viewport(self.bound.viewport, target_size);
        self.pending.push(PendingDraw {
            pipeline,
            registers,
            textures,
            vertex_buffer,
            index_buffer,
            viewport,
            call,
        });
        Ok(())
    }
}

impl Device for WgpuDevice {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        initial: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::Creation("zero-sized buffer".to_string()));
        }
        let padded_size = align_to_copy(desc.size);
        let usage = match desc.kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index16 => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;

        let buffer = match initial {
            Some(data) => {
                if data.len() as u64 > desc.size {
                    return Err(DeviceError::Creation(
                        "initial data exceeds buffer size".to_string(),
                    ));
                }
                let mut contents = data.to_vec();
                contents.resize(padded_size as usize, 0);
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("AnimaBuffer"),
                        contents: &contents,
                        usage,
                    })
            }
            None if desc.usage == BufferUsage::Immutable => {
                return Err(DeviceError::Creation(
                    "immutable buffer created without contents".to_string(),
                ))
            }
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("AnimaBuffer"),
                size: padded_size,
                usage,
                mapped_at_creation: false,
            }),
        };

        let id = self.allocate_id();
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                desc: *desc,
                padded_size,
            },
        );
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        _lock: LockType,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(DeviceError::InvalidDraw(format!(
                "buffer write offset {offset} is not 4-byte aligned"
            )));
        }
        let (target, padded_size, usage) = {
            let gpu = self.buffers.get(&buffer.0).ok_or(DeviceError::UnknownResource {
                kind: "buffer",
                id: buffer.0,
            })?;
            (gpu.buffer.clone(), gpu.padded_size, gpu.desc.usage)
        };
        if usage == BufferUsage::Immutable {
            return Err(DeviceError::InvalidDraw("write to an immutable buffer".to_string()));
        }

        let mut contents = data.to_vec();
        contents.resize(align_to_copy(data.len() as u64) as usize, 0);
        if offset + contents.len() as u64 > padded_size {
            return Err(DeviceError::InvalidDraw("buffer write overflows".to_string()));
        }
        if contents.is_empty() {
            return Ok(());
        }

        // Draws queued so far must read the old contents.
        self.flush_pass()?;
        let staging = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("AnimaStaging"),
                contents: &contents,
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        let size = contents.len() as u64;
        self.encoder()
            .copy_buffer_to_buffer(&staging, 0, &target, offset, size);
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(gpu) = self.buffers.remove(&buffer.0) {
            gpu.buffer.destroy();
        }
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

        let mut usage = wgpu::TextureUsages::empty();
        if desc.bind.intersects(TextureBind::RENDER_TARGET | TextureBind::DEPTH_STENCIL) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.sample_count <= 1 && !desc.format.is_depth() {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
            if desc.bind.contains(TextureBind::SHADER_RESOURCE) {
                usage |= wgpu::TextureUsages::TEXTURE_BINDING;
            }
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: desc.sample_count.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: to_wgpu_texture_format(desc.format),
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.allocate_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                desc: *desc,
            },
        );
        Ok(TextureId(id))
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(gpu) = self.textures.remove(&texture.0) {
            gpu.texture.destroy();
        }
        if self.bound.color_target == Some(texture) {
            self.bound.color_target = None;
        }
        if self.bound.depth_target == Some(texture) {
            self.bound.depth_target = None;
        }
    }

    fn texture_desc(&self, texture: TextureId) -> Option<Texture2dDesc> {
        self.textures.get(&texture.0).map(|t| t.desc)
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry: &str,
        macros: &[ShaderMacro],
        includer: &mut dyn ShaderIncluder,
    ) -> Result<ShaderBinary, DeviceError> {
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
        let source = binary.source()?;
        let table = ConstantTable::parse(source);
        let module = self.create_module(&binary.entry, source);

        let id = self.allocate_id();
        self.shaders.insert(
            id,
            GpuShader {
                module,
                stage: binary.stage,
                entry: binary.entry.clone(),
                table,
                registers: vec![[0.0; 4]; REGISTER_COUNT],
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
        let gpu = self.shaders.get_mut(&shader.0).ok_or(DeviceError::UnknownResource {
            kind: "shader",
            id: shader.0,
        })?;
        match gpu.table.entry(index).map(|entry| entry.slot) {
            Some(ConstantSlot::Register(base)) => {
                let base = base as usize;
                let end = base + value.register_count();
                if end > REGISTER_COUNT {
                    return Err(DeviceError::InvalidDraw(format!(
                        "constant at register {base} overflows the register file"
                    )));
                }
                value.write_registers(&mut gpu.registers[base..end]);
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
        let gpu = self.shaders.get_mut(&shader.0).ok_or(DeviceError::UnknownResource {
            kind: "shader",
            id: shader.0,
        })?;
        match gpu.table.entry(index).map(|entry| entry.slot) {
            Some(ConstantSlot::Texture(_)) => {
                gpu.samplers.insert(index, (sampler, texture));
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
        let address = match desc.address {
            AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
            AddressMode::Wrap => wgpu::AddressMode::Repeat,
        };
        let (filter, mipmap_filter, anisotropy_clamp) = match desc.filter {
            SamplerFilter::Point => (wgpu::FilterMode::Nearest, wgpu::FilterMode::Nearest, 1),
            SamplerFilter::Bilinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Nearest, 1),
            SamplerFilter::Trilinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear, 1),
            SamplerFilter::Anisotropic(level) => {
                (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear, level.clamp(1, 16))
            }
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("AnimaSampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter,
            anisotropy_clamp,
            ..Default::default()
        });

        let id = self.allocate_id();
        self.samplers.insert(
            id,
            GpuSampler { sampler },
        );
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

    fn set_fixed_texture(&mut self, texture: Option<TextureId>, sampler: Option<SamplerId>) {
        self.bound.fixed_texture = texture;
        self.bound.fixed_sampler = sampler;
    }

    fn set_render_target(
        &mut self,
        color: Option<TextureId>,
        depth: Option<TextureId>,
    ) -> Result<(), DeviceError> {
        let mut size = None;
        for id in color.iter().chain(depth.iter()) {
            let desc = self.texture(*id)?.desc;
            size.get_or_insert((desc.width, desc.height));
        }

        self.flush_pass()?;
        self.bound.color_target = color;
        self.bound.depth_target = depth;
        if let Some((width, height)) = size {
            self.bound.viewport = Viewport::sized(width, height);
        }
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.bound.viewport = viewport;
    }

    fn clear_render_target(
        &mut self,
        flags: ClearFlags,
        color: Vec4,
        depth: f32,
        stencil: u8,
    ) -> Result<(), DeviceError> {
        if flags.contains(ClearFlags::COLOR) && self.bound.color_target.is_none() {
            return Err(DeviceError::InvalidDraw("clearing colour without a target".to_string()));
        }
        if flags.intersects(ClearFlags::DEPTH | ClearFlags::STENCIL)
            && self.bound.depth_target.is_none()
        {
            return Err(DeviceError::InvalidDraw("clearing depth without a target".to_string()));
        }

        // A clear must land after the draws queued before it.
        if !self.pending.is_empty() {
            self.flush_pass()?;
        }
        let merged = match self.pending_clear.take() {
            Some(previous) => PendingClear {
                flags: previous.flags | flags,
                color: if flags.contains(ClearFlags::COLOR) { color } else { previous.color },
                depth: if flags.contains(ClearFlags::DEPTH) { depth } else { previous.depth },
                stencil: if flags.contains(ClearFlags::STENCIL) { stencil } else { previous.stencil },
            },
            None => PendingClear {
                flags,
                color,
                depth,
                stencil,
            },
        };
        self.pending_clear = Some(merged);
        Ok(())
    }

    fn copy_render_target(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError> {
        if src == dst {
            return Err(DeviceError::FeedbackLoop(src));
        }
        let (src_texture, src_desc) = {
            let t = self.texture(src)?;
            (t.texture.clone(), t.desc)
        };
        let (dst_texture, dst_desc) = {
            let t = self.texture(dst)?;
            (t.texture.clone(), t.desc)
        };
        if src_desc.format != dst_desc.format {
            return Err(DeviceError::InvalidDraw(format!(
                "cannot copy '{}' into '{}': formats differ",
                src_desc.label, dst_desc.label
            )));
        }

        self.flush_pass()?;
        self.encoder().copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &src_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &dst_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: src_desc.width.min(dst_desc.width),
                height: src_desc.height.min(dst_desc.height),
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn draw(
        &mut self,
        topology: Topology,
        start_vertex: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError> {
        let count = topology.index_count(primitive_count);
        self.queue_draw(
            topology,
            DrawCall::Direct {
                vertices: start_vertex..start_vertex + count,
            },
        )
    }

    fn draw_indexed(
        &mut self,
        topology: Topology,
        base_vertex: i32,
        _vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    ) -> Result<(), DeviceError> {
        let count = topology.index_count(primitive_count);
        self.queue_draw(
            topology,
            DrawCall::Indexed {
                indices: start_index..start_index + count,
                base_vertex,
            },
        )
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.flush_pass()?;
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        Ok(())
    }
}

fn register_bindings(vertex: &GpuShader, pixel: Option<&GpuShader>) -> Result<Vec<u32>, DeviceError> {
    let mut bindings: Vec<u32> = Vec::new();
    for shader in std::iter::once(vertex).chain(pixel) {
        if let Some(binding) = shader.table.register_binding() {
            if bindings.contains(&binding) {
                return Err(DeviceError::InvalidDraw(format!(
                    "register binding {binding} is used by both stages"
                )));
            }
            bindings.push(binding);
        }
    }
    Ok(bindings)
}

fn align_to_copy(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    size.div_ceil(align) * align
}

fn clamp_viewport(viewport: Viewport, (width, height): (u32, u32)) -> Viewport {
    let x = viewport.x.min(width.saturating_sub(1));
    let y = viewport.y.min(height.saturating_sub(1));
    let w = if viewport.width == 0 { width } else { viewport.width };
    let h = if viewport.height == 0 { height } else { viewport.height };
    Viewport {
        x,
        y,
        width: w.min(width - x).max(1),
        height: h.min(height - y).max(1),
    }
}

fn to_wgpu_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Argb8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R32F => wgpu::TextureFormat::R32Float,
        TextureFormat::D24S8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn to_wgpu_vertex_format(format: VertexAttribFormat) -> wgpu::VertexFormat {
    match format {
        VertexAttribFormat::Float2 => wgpu::VertexFormat::Float32x2,
        VertexAttribFormat::Float3 => wgpu::VertexFormat::Float32x3,
        VertexAttribFormat::Float4 => wgpu::VertexFormat::Float32x4,
        VertexAttribFormat::UByte4N | VertexAttribFormat::Color => wgpu::VertexFormat::Unorm8x4,
    }
}

fn to_wgpu_compare(func: CompareFunc) -> wgpu::CompareFunction {
    match func {
        CompareFunc::Never => wgpu::CompareFunction::Never,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Always => wgpu::CompareFunction::Always,
    }
}

fn to_wgpu_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::DestColor => wgpu::BlendFactor::Dst,
    }
}

fn to_wgpu_blend(blend: &BlendDesc) -> Option<wgpu::BlendState> {
    if !blend.enabled {
        return None;
    }
    let component = wgpu::BlendComponent {
        src_factor: to_wgpu_blend_factor(blend.src),
        dst_factor: to_wgpu_blend_factor(blend.dst),
        operation: match blend.op {
            BlendOp::Add => wgpu::BlendOperation::Add,
            BlendOp::Subtract => wgpu::BlendOperation::Subtract,
            BlendOp::Min => wgpu::BlendOperation::Min,
            BlendOp::Max => wgpu::BlendOperation::Max,
        },
    };
    Some(wgpu::BlendState {
        color: component,
        alpha: component,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_blend_maps_to_src_alpha_one() {
        let blend = to_wgpu_blend(&BlendDesc::ADD).unwrap();
        assert_eq!(blend.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::One);
        assert!(to_wgpu_blend(&BlendDesc::OPAQUE).is_none());
    }

    #[test]
    fn viewport_is_clamped_to_target() {
        let clamped = clamp_viewport(Viewport::sized(2048, 2048), (512, 256));
        assert_eq!(clamped, Viewport::sized(512, 256));

        let whole = clamp_viewport(Viewport::default(), (64, 32));
        assert_eq!(whole, Viewport::sized(64, 32));
    }

    #[test]
    fn buffer_sizes_round_up_to_copy_alignment() {
        assert_eq!(align_to_copy(6), 8);
        assert_eq!(align_to_copy(32), 32);
    }

    // Needs a GPU adapter.
    #[test]
    #[ignore]
    fn headless_device_clears_and_copies_targets() {
        let mut device = WgpuDevice::new_headless().expect("adapter");
        let desc = Texture2dDesc::render_target("Light", 16, 16, TextureFormat::Argb8);
        let light = device.create_texture_2d(&desc).unwrap();
        let copy = device.create_texture_2d(&desc).unwrap();

        device.set_render_target(Some(light), None).unwrap();
        device
            .clear_render_target(ClearFlags::COLOR, Vec4::new(1.0, 0.0, 0.0, 1.0), 1.0, 0)
            .unwrap();
        device.copy_render_target(light, copy).unwrap();
        device.flush().unwrap();

        assert_eq!(device.texture_desc(copy), Some(desc));
    }
}
