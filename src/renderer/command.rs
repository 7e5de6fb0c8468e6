use glam::Vec3;

use crate::error::RenderError;
use crate::gfx::Device;

use super::context::RenderContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderPass {
    StaticShadow,
    DynamicShadow,
    Reflection,
    Lighting,
    Glow,
}

impl RenderPass {
    pub const ALL: [RenderPass; 5] = [
        RenderPass::StaticShadow,
        RenderPass::DynamicShadow,
        RenderPass::Reflection,
        RenderPass::Lighting,
        RenderPass::Glow,
    ];

    pub fn is_shadow(self) -> bool {
        matches!(self, Self::StaticShadow | Self::DynamicShadow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandMode {
    /// Opaque geometry, no ordering guarantee.
    Solid,
    /// Alpha blended, drawn back to front.
    Trans,
    Water,
}

impl CommandMode {
    pub const ALL: [CommandMode; 3] = [CommandMode::Solid, CommandMode::Trans, CommandMode::Water];

    /// Rank of the mode inside a pass: opaque first, water over it, then
    /// blended geometry on top.
    pub fn draw_order(self) -> u8 {
        match self {
            Self::Solid => 0,
            Self::Water => 1,
            Self::Trans => 2,
        }
    }

    pub fn requires_back_to_front_sort(self) -> bool {
        matches!(self, Self::Trans)
    }
}

/// Slot of an executor inside the array handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ExecutorId(pub u16);

/// Deferred draw of one primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub pass: RenderPass,
    pub mode: CommandMode,
    /// Stamped by the scheduler when the command is collected.
    pub executor: ExecutorId,
    /// Index into the executor's own per-frame data.
    pub data_index: usize,
    /// Signed distance along the view direction, see [`camera_distance`].
    pub cam_dist: f32,
    pub flags: u32,
}

impl Command {
    pub fn new(pass: RenderPass, mode: CommandMode, data_index: usize, cam_dist: f32) -> Self {
        Self {
            pass,
            mode,
            executor: ExecutorId::default(),
            data_index,
            cam_dist,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// `dot(position - eye, eye_dir)`: negative behind the camera, and not the
/// Euclidean distance.
pub fn camera_distance(position: Vec3, eye_position: Vec3, eye_direction: Vec3) -> f32 {
    (position - eye_position).dot(eye_direction)
}

/// Renderer of one primitive kind, driven in four phases each frame.
///
/// `start_context` selects and prepares the primitives for a pass,
/// `enqueue_commands` emits one [`Command`] per draw, `exec` receives
/// contiguous runs of those commands back from the scheduler, and
/// `end_context` drops the per-pass data.
pub trait CommandExecutor {
    fn start_context(&mut self, context: &RenderContext, pass: RenderPass);
    fn enqueue_commands(&self, commands: &mut Vec<Command>);
    fn exec(&mut self, device: &mut dyn Device, commands: &[Command]) -> Result<(), RenderError>;
    fn end_context(&mut self);
}
