//! Error types for the render pipeline.

use thiserror::Error;

use crate::gfx::DeviceError;
use crate::vfs::VfsError;

/// Errors produced while initialising or driving the renderers.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// A shader failed to compile and no retry was requested.
    #[error("failed to compile shader '{shader}': {message}")]
    ShaderCompile { shader: String, message: String },

    /// Neither a precompiled binary nor the source could be used.
    #[error("{message}")]
    ShaderIo { path: String, message: String },

    /// The graphics device refused to create or use a resource.
    #[error(transparent)]
    DeviceResource(#[from] DeviceError),

    /// A caller broke a usage contract (split index, command range shape).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl RenderError {
    pub(crate) fn shader_not_found(path: &str) -> Self {
        RenderError::ShaderIo {
            path: path.to_string(),
            message: format!("File '{path}' not found."),
        }
    }

    pub(crate) fn from_vfs(path: &str, err: VfsError) -> Self {
        RenderError::ShaderIo {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}
