use glam::{Mat4, Vec3};
use log::error;

use crate::error::RenderError;
use crate::gfx::{
    BlendDesc, BufferDesc, BufferId, BufferUsage, CompareFunc, ConstantIndex, Device, ShaderId,
    Topology,
};
use crate::resource::GpuResource;

use super::command::{Command, CommandExecutor, CommandMode, RenderPass};
use super::context::RenderContext;
use super::permutation::{blended_state, ShaderParams};
use super::primitives::WaterPatch;
use super::shader_lib::{ShaderLib, ShaderVersion};
use super::vertex::{plane_mesh, WaterVertex};

/// Number of water shader configurations. Every patch uses config 0.
pub const WATER_CONFIG_COUNT: usize = 1;

const PLANE_HALF_EXTENT: f32 = 0.5;
const PLANE_SUBDIVISIONS: u16 = 20;

#[derive(Debug, Clone, Copy)]
struct WaterConstants {
    world_view_proj: Option<ConstantIndex>,
    world: Option<ConstantIndex>,
    eye_position: Option<ConstantIndex>,
    fog_range: Option<ConstantIndex>,
    water_diffuse: Option<ConstantIndex>,
}

impl WaterConstants {
    fn resolve(device: &dyn Device, shader: ShaderId) -> Self {
        Self {
            world_view_proj: device.constant_index(shader, "WorldViewProj"),
            world: device.constant_index(shader, "World"),
            eye_position: device.constant_index(shader, "EyePosition"),
            fog_range: device.constant_index(shader, "FogRange"),
            water_diffuse: device.constant_index(shader, "WaterDiffuse"),
        }
    }
}

type WaterParams = ShaderParams<WaterConstants>;

struct WaterMesh {
    vertex_buffer: BufferId,
    index_buffer: BufferId,
    vertex_count: u32,
    triangle_count: u32,
}

struct WaterFrame {
    view_proj: Mat4,
    eye_position: Vec3,
    fog_range: Vec3,
    water_level: f32,
    configs: [Vec<WaterPatch>; WATER_CONFIG_COUNT],
}

/// Water patches of the lighting pass, all drawn by a single command.
#[derive(Default)]
pub struct WaterRenderer {
    params: Vec<WaterParams>,
    mesh: Option<WaterMesh>,
    frame: Option<WaterFrame>,
}

impl WaterRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialise(&mut self, device: &mut dyn Device, shader_lib: &mut ShaderLib) -> bool {
        match Self::build_configs(device, shader_lib) {
            Ok(params) => {
                self.params = params;
                true
            }
            Err(err) => {
                error!("Failed to initialise the water renderer: {}", err);
                false
            }
        }
    }

    fn build_configs(device: &mut dyn Device, shader_lib: &mut ShaderLib) -> Result<Vec<WaterParams>, RenderError> {
        let mut params = Vec::with_capacity(WATER_CONFIG_COUNT);
        for _ in 0..WATER_CONFIG_COUNT {
            let vertex_shader = shader_lib.get_vshader(
                device,
                "water-final-fixed.vsh",
                ShaderVersion::Vs2_0,
                "vs_main",
                &[],
            )?;
            let format = device.create_vertex_format(&WaterVertex::format(), vertex_shader)?;
            let state = device.create_state(&blended_state(BlendDesc::LERP, CompareFunc::Less))?;
            params.push(WaterParams {
                vertex_shader,
                format,
                state,
                constants: WaterConstants::resolve(device, vertex_shader),
            });
        }
        Ok(params)
    }

    fn config_of(_patch: &WaterPatch) -> usize {
        0
    }

    fn draw_patches(&self, device: &mut dyn Device, frame: &WaterFrame) -> Result<(), RenderError> {
        let Some(mesh) = &self.mesh else {
            return Err(RenderError::InvariantViolation(
                "water drawn before device reset".to_string(),
            ));
        };

        for (config, patches) in frame.configs.iter().enumerate() {
            if patches.is_empty() {
                continue;
            }
            let shader = self.params.get(config).ok_or_else(|| {
                RenderError::InvariantViolation(format!("water config {config} is not initialised"))
            })?;

            shader.bind(device);
            device.set_vertex_buffer(mesh.vertex_buffer);
            device.set_index_buffer(Some(mesh.index_buffer));
            device.set_fixed_texture(None, None);

            let vs = shader.vertex_shader;
            let constants = &shader.constants;
            device.set_constant_safe(vs, constants.eye_position, frame.eye_position.into())?;
            device.set_constant_safe(vs, constants.fog_range, frame.fog_range.into())?;
            for patch in patches {
                let world = patch.world_matrix(frame.water_level);
                device.set_constant_safe(vs, constants.world_view_proj, (frame.view_proj * world).into())?;
                device.set_constant_safe(vs, constants.world, world.into())?;
                device.set_constant_safe(vs, constants.water_diffuse, patch.diffuse.into())?;
                device.draw_indexed(Topology::TriangleList, 0, mesh.vertex_count, 0, mesh.triangle_count)?;
            }
        }
        Ok(())
    }
}

impl CommandExecutor for WaterRenderer {
    fn start_context(&mut self, context: &RenderContext, pass: RenderPass) {
        self.frame = None;
        if pass != RenderPass::Lighting {
            return;
        }

        let mut configs: [Vec<WaterPatch>; WATER_CONFIG_COUNT] = Default::default();
        for patch in &context.water_patches {
            if let Some(patches) = configs.get_mut(Self::config_of(patch)) {
                patches.push(*patch);
            }
        }

        self.frame = Some(WaterFrame {
            view_proj: context.view_proj(),
            eye_position: context.eye_position(),
            fog_range: context.fog.range_constant(),
            water_level: context.water_level,
            configs,
        });
    }

    /// Always exactly one command, whatever the pass and patch count.
    fn enqueue_commands(&self, commands: &mut Vec<Command>) {
        commands.push(Command::new(RenderPass::Lighting, CommandMode::Water, 0, 0.0));
    }

    fn exec(&mut self, device: &mut dyn Device, commands: &[Command]) -> Result<(), RenderError> {
        debug_assert_eq!(commands.len(), 1, "water expects a single command per exec");
        if commands.len() != 1 {
            return Err(RenderError::InvariantViolation(format!(
                "water exec received {} commands instead of 1",
                commands.len()
            )));
        }

        match &self.frame {
            Some(frame) => self.draw_patches(device, frame),
            None => Ok(()),
        }
    }

    fn end_context(&mut self) {
        self.frame = None;
    }
}

impl GpuResource for WaterRenderer {
    fn on_device_lost(&mut self, device: &mut dyn Device) {
        if let Some(mesh) = self.mesh.take() {
            device.release_buffer(mesh.vertex_buffer);
            device.release_buffer(mesh.index_buffer);
        }
    }

    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.on_device_lost(device);

        let (vertices, indices) = plane_mesh(PLANE_HALF_EXTENT, PLANE_SUBDIVISIONS);
        let vertex_data: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = device.create_buffer(
            &BufferDesc::vertex(BufferUsage::Immutable, vertex_data.len() as u64),
            Some(vertex_data),
        )?;
        let index_buffer = match device.create_buffer(
            &BufferDesc::index16(BufferUsage::Immutable, indices.len() as u64),
            Some(bytemuck::cast_slice(&indices)),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.release_buffer(vertex_buffer);
                return Err(err.into());
            }
        };

        self.mesh = Some(WaterMesh {
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            triangle_count: (indices.len() / 3) as u32,
        });
        Ok(())
    }
}
