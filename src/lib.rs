//! Render-command pipeline: shader library, command scheduling and the
//! billboard, decal, water, shadow, glow and post-FX renderers, all drawing
//! through an abstract graphics [`gfx::Device`].

pub mod error;
pub mod gfx;
pub mod renderer;
pub mod resource;
pub mod settings;
pub mod vfs;

pub use error::RenderError;
pub use renderer::{FrameStats, RenderContext, Renderer};
pub use settings::RendererSettings;

/// Installs the `env_logger` backend, `info` unless `RUST_LOG` says otherwise.
/// Calling it twice is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
