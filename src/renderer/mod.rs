pub mod billboard;
pub mod builtin_shaders;
pub mod command;
pub mod context;
pub mod decal;
pub mod glow;
pub mod parallel;
pub mod permutation;
pub mod postfx;
pub mod primitives;
pub mod render_view;
pub mod renderer;
pub mod scheduler;
pub mod screen_quad;
pub mod shader_lib;
pub mod shadow;
pub mod vertex;
pub mod water;

#[cfg(test)]
pub(crate) mod test_support;

pub use billboard::BillboardRenderer;
pub use builtin_shaders::{install_shader_sources, shader_source};
pub use command::{camera_distance, Command, CommandExecutor, CommandMode, RenderPass};
pub use context::RenderContext;
pub use decal::DecalRenderer;
pub use glow::GlowRenderer;
pub use parallel::ParallelUpdate;
pub use postfx::{PostFxPlan, PostFxRenderer};
pub use primitives::{Billboard, BillboardGroup, BillboardMode, Decal, DecalMode, WaterPatch};
pub use render_view::{RenderTargetBuffer, RenderView, ViewStats};
pub use renderer::{FrameStats, PassStats, Renderer};
pub use scheduler::{CommandScheduler, PassCounts, PreparedCommands};
pub use screen_quad::{ScreenQuad, ScreenShader};
pub use shader_lib::{ShaderLib, ShaderVersion};
pub use shadow::{ShadowContext, ShadowRenderer};
pub use water::WaterRenderer;
