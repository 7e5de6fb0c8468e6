//! Camera-facing quads, batched per group into one dynamic vertex buffer
//! that grows to hold every visible group of a pass.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use log::{debug, error};
use rayon::prelude::*;

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, BufferDesc, BufferId, BufferUsage, CompareFunc, ConstantIndex, Device, LockType,
    SamplerDesc, SamplerFilter, SamplerId, ShaderId, Topology,
};
use crate::resource::GpuResource;
use crate::settings::RendererSettings;

use super::command::{camera_distance, Command, CommandExecutor, CommandMode, RenderPass};
use super::context::RenderContext;
use super::parallel::ParallelUpdate;
use super::permutation::{blended_state, permutation_macros, PermutationTable, ShaderParams};
use super::primitives::{BillboardGroup, BillboardMode, MAX_BILLBOARD_COUNT};
use super::shader_lib::{ShaderLib, ShaderVersion};
use super::vertex::{quad_indices, BillboardVertex};

const MAX_VERTEX_COUNT: usize = MAX_BILLBOARD_COUNT * 4;

#[derive(Debug, Clone, Copy)]
struct BillboardConstants {
    world_view: Option<ConstantIndex>,
    proj: Option<ConstantIndex>,
    fog_range: Option<ConstantIndex>,
    factor: Option<ConstantIndex>,
    sprite_count: Option<ConstantIndex>,
    sprite_count_u: Option<ConstantIndex>,
    sprite_uv_size: Option<ConstantIndex>,
}

impl BillboardConstants {
    fn resolve(device: &dyn Device, shader: ShaderId) -> Self {
        Self {
            world_view: device.constant_index(shader, "WorldView"),
            proj: device.constant_index(shader, "Proj"),
            fog_range: device.constant_index(shader, "FogRange"),
            factor: device.constant_index(shader, "Factor"),
            sprite_count: device.constant_index(shader, "SpriteCount"),
            sprite_count_u: device.constant_index(shader, "SpriteCountU"),
            sprite_uv_size: device.constant_index(shader, "SpriteUVSize"),
        }
    }
}

type BillboardParams = ShaderParams<BillboardConstants>;

struct BillboardBatch {
    group: Arc<BillboardGroup>,
    first_vertex: u32,
    count: u32,
    factor: f32,
    cam_dist: f32,
}

struct BillboardFrame {
    pass: RenderPass,
    view: Mat4,
    proj: Mat4,
    fog_range: Vec3,
    batches: Vec<BillboardBatch>,
    vertex_count: usize,
    vertices: ParallelUpdate<Vec<BillboardVertex>>,
    uploaded: bool,
}

pub struct BillboardRenderer {
    filter: SamplerFilter,
    params: Option<PermutationTable<BillboardParams>>,
    sampler: Option<SamplerId>,
    vertex_buffer: Option<BufferId>,
    /// Vertices the current vertex buffer holds.
    vertex_capacity: usize,
    index_buffer: Option<BufferId>,
    frame: Option<BillboardFrame>,
}

impl BillboardRenderer {
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            filter: settings.filter_level.sampler_filter(),
            params: None,
            sampler: None,
            vertex_buffer: None,
            vertex_capacity: 0,
            index_buffer: None,
            frame: None,
        }
    }

    /// Compiles the `mode x flags` permutations. All or nothing.
    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match self.build_permutations(device, shader_lib) {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to initialise the billboard renderer: {}", err);
                false
            }
        }
    }

    fn build_permutations(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<(), RenderError> {
        let params = PermutationTable::build(BillboardMode::ALL, |mode, flags| {
            let macros = permutation_macros(mode == BillboardMode::Refrac, flags);
            let vertex_shader =
                shader_lib.get_vshader(device, "billboard.vsh", ShaderVersion::Vs1_1, "vs_main", &macros)?;
            let format = device.create_vertex_format(&BillboardVertex::format(), vertex_shader)?;
            let blend = match mode {
                BillboardMode::Add => BlendDesc::ADD,
                _ => BlendDesc::LERP,
            };
            let state = device.create_state(&blended_state(blend, CompareFunc::LessEqual))?;
            Ok::<_, RenderError>(BillboardParams {
                vertex_shader,
                format,
                state,
                constants: BillboardConstants::resolve(device, vertex_shader),
            })
        })?;

        self.sampler = Some(device.create_sampler(&SamplerDesc::clamp(self.filter))?);
        self.params = Some(params);
        Ok(())
    }

    /// Billboards queued for the current pass.
    pub fn billboard_count(&self) -> usize {
        self.frame.as_ref().map_or(0, |frame| frame.vertex_count / 4)
    }

    pub fn vertex_capacity(&self) -> usize {
        self.vertex_capacity
    }

    /// Waits for the vertices of the current context and writes them once.
    fn upload_vertices(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        if frame.uploaded {
            return Ok(());
        }
        frame.uploaded = true;
        let vertices = frame.vertices.end_parallel_update()?;
        if vertices.is_empty() {
            return Ok(());
        }

        let buffer = self.reserve_vertices(device, vertices.len())?;
        device.write_buffer(buffer, LockType::WriteDiscard, 0, bytemuck::cast_slice(&vertices))?;
        Ok(())
    }

    /// Grows the dynamic vertex buffer so a pass never drops a group.
    fn reserve_vertices(&mut self, device: &mut dyn Device, count: usize) -> Result<BufferId, RenderError> {
        match self.vertex_buffer {
            Some(buffer) if count <= self.vertex_capacity => return Ok(buffer),
            Some(buffer) => device.release_buffer(buffer),
            None => {
                return Err(RenderError::InvariantViolation(
                    "billboard vertices uploaded before device reset".to_string(),
                ))
            }
        }
        self.vertex_buffer = None;
        self.vertex_capacity = 0;

        let capacity = count.next_power_of_two().max(MAX_VERTEX_COUNT);
        let buffer = device.create_buffer(&BufferDesc::vertex(BufferUsage::Dynamic, vertex_bytes(capacity)), None)?;
        debug!("Billboard vertex buffer grown to {} billboards", capacity / 4);
        self.vertex_buffer = Some(buffer);
        self.vertex_capacity = capacity;
        Ok(buffer)
    }
}

/// Intensity a group is drawn with in `pass`; `None` when the pass ignores
/// billboards.
fn pass_factor(pass: RenderPass, group: &BillboardGroup) -> Option<f32> {
    match pass {
        RenderPass::Glow => Some(group.glow_factor),
        RenderPass::Lighting | RenderPass::Reflection => Some(group.color_factor),
        RenderPass::StaticShadow | RenderPass::DynamicShadow => None,
    }
}

fn vertex_bytes(count: usize) -> u64 {
    (count * std::mem::size_of::<BillboardVertex>()) as u64
}

/// Vertices of one group; blended groups are emitted farthest first.
fn group_vertices(group: &BillboardGroup, eye_position: Vec3, eye_direction: Vec3) -> Vec<BillboardVertex> {
    let mut vertices = Vec::with_capacity(group.billboards().len() * 4);
    if group.mode().sorts_by_depth() {
        let order = group.depth_order(eye_position, eye_direction);
        group.append_vertices(order.into_iter(), &mut vertices);
    } else {
        group.append_vertices(0..group.billboards().len(), &mut vertices);
    }
    vertices
}

impl CommandExecutor for BillboardRenderer {
    fn start_context(&mut self, context: &RenderContext, pass: RenderPass) {
        self.frame = None;
        if pass.is_shadow() {
            return;
        }

        let groups: Vec<(Arc<BillboardGroup>, f32)> = context
            .billboards
            .iter()
            .filter_map(|group| Some((Arc::clone(group), pass_factor(pass, group)?)))
            .filter(|(group, factor)| *factor > 0.0 && !group.billboards().is_empty())
            .collect();

        let eye_position = context.eye_position();
        let eye_direction = context.eye_direction();
        let mut batches = Vec::with_capacity(groups.len());
        let mut vertex_count = 0;
        for (group, factor) in &groups {
            let count = group.billboards().len();
            batches.push(BillboardBatch {
                cam_dist: camera_distance(group.position(), eye_position, eye_direction),
                group: Arc::clone(group),
                first_vertex: vertex_count as u32,
                count: count as u32,
                factor: *factor,
            });
            vertex_count += count * 4;
        }

        // Vertices are built on the pool while the other executors prepare,
        // and collected by the first exec.
        let sources: Vec<Arc<BillboardGroup>> = groups.into_iter().map(|(group, _)| group).collect();
        let mut vertices = ParallelUpdate::new();
        vertices.start_parallel_update(move || {
            sources
                .par_iter()
                .map(|group| group_vertices(group, eye_position, eye_direction))
                .collect::<Vec<_>>()
                .concat()
        });

        self.frame = Some(BillboardFrame {
            pass,
            view: context.view(),
            proj: context.proj(),
            fog_range: context.fog.range_constant(),
            batches,
            vertex_count,
            vertices,
            uploaded: false,
        });
    }

    fn enqueue_commands(&self, commands: &mut Vec<Command>) {
        let Some(frame) = &self.frame else {
            return;
        };
        for (index, batch) in frame.batches.iter().enumerate() {
            commands.push(
                Command::new(frame.pass, CommandMode::Trans, index, batch.cam_dist)
                    .with_flags(batch.group.flags().bits()),
            );
        }
    }

    fn exec(&mut self, device: &mut dyn Device, commands: &[Command]) -> Result<(), RenderError> {
        if self.params.is_none() || self.sampler.is_none() || self.vertex_buffer.is_none() || self.index_buffer.is_none() {
            return Err(RenderError::InvariantViolation(
                "billboards executed before initialisation or device reset".to_string(),
            ));
        }
        self.upload_vertices(device)?;

        let (Some(params), Some(sampler), Some(vertex_buffer), Some(index_buffer)) =
            (self.params.as_ref(), self.sampler, self.vertex_buffer, self.index_buffer)
        else {
            return Err(RenderError::InvariantViolation(
                "billboard buffers lost during upload".to_string(),
            ));
        };
        let Some(frame) = self.frame.as_ref() else {
            return Err(RenderError::InvariantViolation(
                "billboard commands executed outside a context".to_string(),
            ));
        };

        for command in commands {
            let batch = frame.batches.get(command.data_index).ok_or_else(|| {
                RenderError::InvariantViolation(format!("no billboard batch {}", command.data_index))
            })?;
            let group = &batch.group;
            let shader = params.get(group.mode().index(), group.flags()).ok_or_else(|| {
                RenderError::InvariantViolation(format!("no billboard permutation for {:?}", group.mode()))
            })?;

            shader.bind(device);
            device.set_vertex_buffer(vertex_buffer);
            device.set_index_buffer(Some(index_buffer));
            device.set_fixed_texture(group.texture, Some(sampler));

            let vs = shader.vertex_shader;
            let constants = &shader.constants;
            device.set_constant_safe(vs, constants.world_view, (frame.view * group.world_matrix()).into())?;
            device.set_constant_safe(vs, constants.proj, frame.proj.into())?;
            device.set_constant_safe(vs, constants.fog_range, frame.fog_range.into())?;
            device.set_constant_safe(vs, constants.factor, batch.factor.into())?;
            if group.sprite.is_sprite() {
                device.set_constant_safe(vs, constants.sprite_count, group.sprite.count().into())?;
                device.set_constant_safe(vs, constants.sprite_count_u, group.sprite.count_u().into())?;
                device.set_constant_safe(vs, constants.sprite_uv_size, group.sprite.uv_size().into())?;
            }

            device.draw_indexed(
                Topology::TriangleList,
                batch.first_vertex as i32,
                batch.count * 4,
                0,
                batch.count * 2,
            )?;
        }
        Ok(())
    }

    fn end_context(&mut self) {
        self.frame = None;
    }
}

impl GpuResource for BillboardRenderer {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        for buffer in [self.vertex_buffer.take(), self.index_buffer.take()].into_iter().flatten() {
            device.release_buffer(buffer);
        }
        self.vertex_capacity = 0;
    }

    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.on_device_lost(device);

        let desc = BufferDesc::vertex(BufferUsage::Dynamic, vertex_bytes(MAX_VERTEX_COUNT));
        self.vertex_buffer = Some(device.create_buffer(&desc, None)?);
        self.vertex_capacity = MAX_VERTEX_COUNT;

        let indices = quad_indices(MAX_BILLBOARD_COUNT);
        let desc = BufferDesc::index16(BufferUsage::Immutable, indices.len() as u64);
        self.index_buffer = Some(device.create_buffer(&desc, Some(bytemuck::cast_slice(&indices)))?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{ConstantValue, RecordingDevice};
    use crate::renderer::primitives::{Billboard, SpriteLayout};
    use crate::renderer::test_support;

    fn ready_renderer(device: &mut RecordingDevice) -> BillboardRenderer {
        let mut renderer = BillboardRenderer::new(&RendererSettings::default());
        let mut shader_lib = test_support::shader_lib();
        assert!(renderer.initialise(device, &mut shader_lib));
        renderer.on_device_reset(device).unwrap();
        renderer
    }

    fn group(mode: BillboardMode, z: f32, count: usize) -> BillboardGroup {
        let mut group = BillboardGroup::new(mode, MAX_BILLBOARD_COUNT);
        group.set_world_matrix(Mat4::from_translation(Vec3::new(0.0, 0.0, z)));
        group.set_billboards(vec![Billboard::new(Vec3::ZERO, 1.0); count]);
        group
    }

    #[test]
    fn initialise_builds_every_permutation() {
        let mut device = RecordingDevice::new();
        let mut renderer = BillboardRenderer::new(&RendererSettings::default());
        let mut shader_lib = test_support::shader_lib();

        assert!(renderer.initialise(&mut device, &mut shader_lib));
        assert_eq!(renderer.params.as_ref().unwrap().len(), 8);
        // Add, Lerp and AddLerp share their shaders and differ by state only.
        assert_eq!(shader_lib.vertex_shader_count(), 4);
    }

    #[test]
    fn initialise_fails_without_sources() {
        let mut device = RecordingDevice::new();
        let mut renderer = BillboardRenderer::new(&RendererSettings::default());
        let vfs = std::rc::Rc::new(crate::vfs::MemoryVfs::new());
        let mut shader_lib = ShaderLib::new(vfs, "shaders", "bin");

        assert!(!renderer.initialise(&mut device, &mut shader_lib));
        assert!(renderer.params.is_none());
    }

    #[test]
    fn shadow_passes_produce_nothing() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        let mut context = test_support::context();
        context.billboards.push(Arc::new(group(BillboardMode::Add, -5.0, 3)));

        renderer.start_context(&context, RenderPass::DynamicShadow);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        assert!(commands.is_empty());
    }

    #[test]
    fn groups_without_factor_are_skipped() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        let mut context = test_support::context();
        let mut dark = group(BillboardMode::Add, -5.0, 3);
        dark.color_factor = 0.0;
        dark.glow_factor = 1.0;
        context.billboards.push(Arc::new(dark));

        renderer.start_context(&context, RenderPass::Lighting);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        assert!(commands.is_empty());

        renderer.start_context(&context, RenderPass::Glow);
        renderer.enqueue_commands(&mut commands);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].pass, RenderPass::Glow);
        assert_eq!(commands[0].cam_dist, 5.0);
    }

    #[test]
    fn vertices_upload_once_per_context() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        let color = test_support::bind_target(&mut device, 8);
        let texture = test_support::scene_texture(&mut device);
        let mut context = test_support::context();
        let mut first = group(BillboardMode::Lerp, -5.0, 2);
        first.texture = Some(texture);
        context.billboards.push(Arc::new(first));
        context.billboards.push(Arc::new(group(BillboardMode::Add, -9.0, 3)));

        renderer.start_context(&context, RenderPass::Lighting);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        renderer.exec(&mut device, &commands[..1]).unwrap();
        renderer.exec(&mut device, &commands[1..]).unwrap();
        renderer.end_context();

        let writes = device
            .events()
            .iter()
            .filter(|event| matches!(event, crate::gfx::DeviceEvent::BufferWrite { .. }))
            .count();
        assert_eq!(writes, 1);

        let draws: Vec<_> = device.draws().collect();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].base_vertex, 0);
        assert_eq!(draws[0].primitive_count, 4);
        assert_eq!(draws[0].fixed_texture, Some(texture));
        assert_eq!(draws[0].color_target, Some(color));
        assert_eq!(draws[1].base_vertex, 8);
        assert_eq!(draws[1].primitive_count, 6);
        assert_eq!(draws[1].vertex_constant("Factor"), Some(ConstantValue::Float(1.0)));
    }

    #[test]
    fn sprite_groups_set_sprite_constants() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        test_support::bind_target(&mut device, 8);
        let mut context = test_support::context();
        let mut sprite = group(BillboardMode::Refrac, -2.0, 1);
        sprite.sprite = SpriteLayout { u: 4, v: 2 };
        context.billboards.push(Arc::new(sprite));

        renderer.start_context(&context, RenderPass::Reflection);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        renderer.exec(&mut device, &commands).unwrap();

        let draw = device.draws().next().unwrap();
        assert_eq!(draw.vertex_constant("SpriteCount"), Some(ConstantValue::Float(8.0)));
        assert_eq!(draw.vertex_constant("SpriteCountU"), Some(ConstantValue::Float(4.0)));
        assert_eq!(
            draw.vertex_constant("SpriteUVSize"),
            Some(ConstantValue::Float2(glam::Vec2::new(0.25, 0.5)))
        );
    }

    #[test]
    fn full_groups_grow_the_vertex_buffer() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        test_support::bind_target(&mut device, 8);
        let mut context = test_support::context();
        context.billboards.push(Arc::new(group(BillboardMode::Add, -1.0, MAX_BILLBOARD_COUNT)));
        context.billboards.push(Arc::new(group(BillboardMode::Add, -2.0, 10)));

        renderer.start_context(&context, RenderPass::Lighting);
        assert_eq!(renderer.billboard_count(), MAX_BILLBOARD_COUNT + 10);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        assert_eq!(commands.len(), 2);

        renderer.exec(&mut device, &commands).unwrap();
        assert!(renderer.vertex_capacity() >= (MAX_BILLBOARD_COUNT + 10) * 4);

        let written = device
            .events()
            .iter()
            .find_map(|event| match event {
                crate::gfx::DeviceEvent::BufferWrite { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .unwrap();
        let expected = (MAX_BILLBOARD_COUNT + 10) * 4 * std::mem::size_of::<BillboardVertex>();
        assert_eq!(written, expected);

        let draws: Vec<_> = device.draws().collect();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[1].base_vertex, (MAX_BILLBOARD_COUNT * 4) as i32);
        assert_eq!(draws[1].primitive_count, 20);
        assert_eq!(device.live_buffers().len(), 2);
    }

    #[test]
    fn device_reset_shrinks_a_grown_buffer() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        test_support::bind_target(&mut device, 8);
        let mut context = test_support::context();
        context.billboards.push(Arc::new(group(BillboardMode::Add, -1.0, MAX_BILLBOARD_COUNT)));
        context.billboards.push(Arc::new(group(BillboardMode::Lerp, -2.0, MAX_BILLBOARD_COUNT)));

        renderer.start_context(&context, RenderPass::Lighting);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        renderer.exec(&mut device, &commands).unwrap();
        renderer.end_context();
        assert!(renderer.vertex_capacity() > MAX_VERTEX_COUNT);

        renderer.on_device_lost(&mut device);
        renderer.on_device_reset(&mut device).unwrap();
        assert_eq!(renderer.vertex_capacity(), MAX_VERTEX_COUNT);
    }

    #[test]
    fn exec_before_reset_is_rejected() {
        let mut device = RecordingDevice::new();
        let mut renderer = BillboardRenderer::new(&RendererSettings::default());
        let command = Command::new(RenderPass::Lighting, CommandMode::Trans, 0, 0.0);
        assert!(renderer.exec(&mut device, &[command]).is_err());
    }
}
