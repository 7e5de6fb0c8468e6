use glam::{Mat4, Vec3, Vec4};
use log::error;

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, BufferDesc, BufferId, BufferUsage, CompareFunc, ConstantIndex, Device, LockType,
    SamplerDesc, SamplerFilter, SamplerId, ShaderId, Topology,
};
use crate::resource::GpuResource;
use crate::settings::RendererSettings;

use super::command::{camera_distance, Command, CommandExecutor, CommandMode, RenderPass};
use super::context::RenderContext;
use super::permutation::{blended_state, permutation_macros, PermutationTable, ShaderParams};
use super::primitives::{Decal, DecalMode};
use super::shader_lib::{ShaderLib, ShaderVersion};
use super::vertex::{quad_indices, DecalVertex};

#[derive(Debug, Clone, Copy)]
struct DecalConstants {
    world_view_proj: Option<ConstantIndex>,
    world_view: Option<ConstantIndex>,
    fog_range: Option<ConstantIndex>,
    sprite_count: Option<ConstantIndex>,
    sprite_count_u: Option<ConstantIndex>,
    sprite_uv_size: Option<ConstantIndex>,
}

impl DecalConstants {
    fn resolve(device: &dyn Device, shader: ShaderId) -> Self {
        Self {
            world_view_proj: device.constant_index(shader, "WorldViewProj"),
            world_view: device.constant_index(shader, "WorldView"),
            fog_range: device.constant_index(shader, "FogRange"),
            sprite_count: device.constant_index(shader, "SpriteCount"),
            sprite_count_u: device.constant_index(shader, "SpriteCountU"),
            sprite_uv_size: device.constant_index(shader, "SpriteUVSize"),
        }
    }
}

type DecalParams = ShaderParams<DecalConstants>;

struct DecalFrame {
    pass: RenderPass,
    glow: bool,
    view: Mat4,
    view_proj: Mat4,
    fog_range: Vec3,
    decals: Vec<(Decal, f32)>,
}

/// World-space quads, each drawn from a shared four-vertex buffer that is
/// rewritten per decal.
pub struct DecalRenderer {
    filter: SamplerFilter,
    params: Option<PermutationTable<DecalParams>>,
    sampler: Option<SamplerId>,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    frame: Option<DecalFrame>,
}

impl DecalRenderer {
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            filter: settings.filter_level.sampler_filter(),
            params: None,
            sampler: None,
            vertex_buffer: None,
            index_buffer: None,
            frame: None,
        }
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match self.build_permutations(device, shader_lib) {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to initialise the decal renderer: {}", err);
                false
            }
        }
    }

    fn build_permutations(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<(), RenderError> {
        let params = PermutationTable::build(DecalMode::ALL, |mode, flags| {
            let macros = permutation_macros(false, flags);
            let vertex_shader =
                shader_lib.get_vshader(device, "decal.vsh", ShaderVersion::Vs1_1, "vs_main", &macros)?;
            let format = device.create_vertex_format(&DecalVertex::format(), vertex_shader)?;
            let blend = match mode {
                DecalMode::Add => BlendDesc::ADD,
                DecalMode::Lerp | DecalMode::Refrac => BlendDesc::LERP,
            };
            let state = device.create_state(&blended_state(blend, CompareFunc::LessEqual))?;
            Ok::<_, RenderError>(DecalParams {
                vertex_shader,
                format,
                state,
                constants: DecalConstants::resolve(device, vertex_shader),
            })
        })?;

        self.sampler = Some(device.create_sampler(&SamplerDesc::clamp(self.filter))?);
        self.params = Some(params);
        Ok(())
    }
}

impl CommandExecutor for DecalRenderer {
    fn start_context(&mut self, context: &RenderContext, pass: RenderPass) {
        self.frame = None;
        let glow = match pass {
            RenderPass::Glow => true,
            RenderPass::Lighting | RenderPass::Reflection => false,
            RenderPass::StaticShadow | RenderPass::DynamicShadow => return,
        };

        let eye_position = context.eye_position();
        let eye_direction = context.eye_direction();
        let decals = context
            .decals
            .iter()
            .filter(|decal| {
                let color = if glow { decal.glow } else { decal.color };
                color != Vec4::ZERO
            })
            .map(|decal| {
                let dist = camera_distance(decal.position(), eye_position, eye_direction);
                (decal.clone(), dist)
            })
            .collect();

        self.frame = Some(DecalFrame {
            pass,
            glow,
            view: context.view(),
            view_proj: context.view_proj(),
            fog_range: context.fog.range_constant(),
            decals,
        });
    }

    fn enqueue_commands(&self, commands: &mut Vec<Command>) {
        let Some(frame) = &self.frame else {
            return;
        };
        for (index, (decal, dist)) in frame.decals.iter().enumerate() {
            commands.push(
                Command::new(frame.pass, CommandMode::Trans, index, *dist).with_flags(decal.flags().bits()),
            );
        }
    }

    fn exec(&mut self, device: &mut dyn Device, commands: &[Command]) -> Result<(), RenderError> {
        let (Some(params), Some(sampler), Some(vertex_buffer), Some(index_buffer)) =
            (self.params.as_ref(), self.sampler, self.vertex_buffer, self.index_buffer)
        else {
            return Err(RenderError::InvariantViolation(
                "decals executed before initialisation or device reset".to_string(),
            ));
        };
        let Some(frame) = self.frame.as_ref() else {
            return Err(RenderError::InvariantViolation(
                "decal commands executed outside a context".to_string(),
            ));
        };

        for command in commands {
            let (decal, _) = frame.decals.get(command.data_index).ok_or_else(|| {
                RenderError::InvariantViolation(format!("no decal {}", command.data_index))
            })?;
            // Glow always accumulates additively.
            let mode = if frame.glow { DecalMode::Add } else { decal.mode };
            let shader = params.get(mode.index(), decal.flags()).ok_or_else(|| {
                RenderError::InvariantViolation(format!("no decal permutation for {:?}", mode))
            })?;

            let vertices = decal.vertices(frame.glow);
            device.write_buffer(vertex_buffer, LockType::WriteDiscard, 0, bytemuck::cast_slice(&vertices))?;

            shader.bind(device);
            device.set_vertex_buffer(vertex_buffer);
            device.set_index_buffer(Some(index_buffer));
            device.set_fixed_texture(decal.texture, Some(sampler));

            let vs = shader.vertex_shader;
            let constants = &shader.constants;
            device.set_constant_safe(vs, constants.world_view_proj, (frame.view_proj * decal.world).into())?;
            device.set_constant_safe(vs, constants.world_view, (frame.view * decal.world).into())?;
            device.set_constant_safe(vs, constants.fog_range, frame.fog_range.into())?;
            if decal.sprite.is_sprite() {
                device.set_constant_safe(vs, constants.sprite_count, decal.sprite.count().into())?;
                device.set_constant_safe(vs, constants.sprite_count_u, decal.sprite.count_u().into())?;
                device.set_constant_safe(vs, constants.sprite_uv_size, decal.sprite.uv_size().into())?;
            }

            device.draw_indexed(Topology::TriangleList, 0, 4, 0, 2)?;
        }
        Ok(())
    }

    fn end_context(&mut self) {
        self.frame = None;
    }
}

impl GpuResource for DecalRenderer {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        for buffer in [self.vertex_buffer.take(), self.index_buffer.take()].into_iter().flatten() {
            device.release_buffer(buffer);
        }
    }

    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.on_device_lost(device);

        let vertex_bytes = (4 * std::mem::size_of::<DecalVertex>()) as u64;
        self.vertex_buffer = Some(device.create_buffer(&BufferDesc::vertex(BufferUsage::Dynamic, vertex_bytes), None)?);

        let indices = quad_indices(1);
        let desc = BufferDesc::index16(BufferUsage::Immutable, indices.len() as u64);
        self.index_buffer = Some(device.create_buffer(&desc, Some(bytemuck::cast_slice(&indices)))?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{DeviceEvent, RecordingDevice};
    use crate::renderer::test_support;

    fn ready_renderer(device: &mut RecordingDevice) -> DecalRenderer {
        let mut renderer = DecalRenderer::new(&RendererSettings::default());
        let mut shader_lib = test_support::shader_lib();
        assert!(renderer.initialise(device, &mut shader_lib));
        renderer.on_device_reset(device).unwrap();
        renderer
    }

    fn decal_at(mode: DecalMode, z: f32) -> Decal {
        Decal::new(mode, Mat4::from_translation(Vec3::new(0.0, 0.0, z)), 2.0, 2.0)
    }

    fn run(renderer: &mut DecalRenderer, device: &mut RecordingDevice, context: &RenderContext, pass: RenderPass) -> Vec<Command> {
        renderer.start_context(context, pass);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        renderer.exec(device, &commands).unwrap();
        renderer.end_context();
        commands
    }

    #[test]
    fn glow_pass_keeps_glowing_decals_only() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        test_support::bind_target(&mut device, 8);
        let mut context = test_support::context();
        let mut glowing = decal_at(DecalMode::Lerp, -4.0);
        glowing.glow = Vec4::new(1.0, 0.5, 0.0, 1.0);
        context.decals.push(glowing);
        context.decals.push(decal_at(DecalMode::Lerp, -6.0));

        let commands = run(&mut renderer, &mut device, &context, RenderPass::Glow);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].pass, RenderPass::Glow);
        assert_eq!(commands[0].cam_dist, 4.0);

        let draw = device.draws().next().unwrap();
        let state = device.state_desc(draw.state).unwrap();
        assert_eq!(state.blend, BlendDesc::ADD);

        // The vertices carry the glow colour.
        let data = device.buffer_data(draw.vertex_buffer).unwrap();
        let vertices: &[DecalVertex] = bytemuck::cast_slice(&data[..4 * std::mem::size_of::<DecalVertex>()]);
        assert_eq!(vertices[0].color, [255, 128, 0, 255]);
    }

    #[test]
    fn each_decal_rewrites_the_shared_buffer() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        test_support::bind_target(&mut device, 8);
        let mut context = test_support::context();
        context.decals.push(decal_at(DecalMode::Add, -1.0));
        context.decals.push(decal_at(DecalMode::Refrac, -2.0));
        let mut hidden = decal_at(DecalMode::Lerp, -3.0);
        hidden.color = Vec4::ZERO;
        context.decals.push(hidden);

        let commands = run(&mut renderer, &mut device, &context, RenderPass::Lighting);
        assert_eq!(commands.len(), 2);

        let discards = device
            .events()
            .iter()
            .filter(|event| matches!(event, DeviceEvent::BufferWrite { lock: LockType::WriteDiscard, .. }))
            .count();
        assert_eq!(discards, 2);

        let draws: Vec<_> = device.draws().collect();
        assert_eq!(device.state_desc(draws[1].state).unwrap().blend, BlendDesc::LERP);
        let expected = context.view_proj() * context.decals[1].world;
        assert_eq!(draws[1].vertex_constant("WorldViewProj"), Some(expected.into()));
    }

    #[test]
    fn shadow_passes_produce_nothing() {
        let mut device = RecordingDevice::new();
        let mut renderer = ready_renderer(&mut device);
        let mut context = test_support::context();
        context.decals.push(decal_at(DecalMode::Add, -1.0));

        renderer.start_context(&context, RenderPass::StaticShadow);
        let mut commands = Vec::new();
        renderer.enqueue_commands(&mut commands);
        assert!(commands.is_empty());
    }
}
