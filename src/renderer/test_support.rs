use std::rc::Rc;

use glam::{Mat4, Vec3};

use crate::gfx::{Device, RecordingDevice, Texture2dDesc, TextureFormat, TextureId};
use crate::vfs::MemoryVfs;

use super::builtin_shaders::install_shader_sources;
use super::context::RenderContext;
use super::shader_lib::ShaderLib;

pub(crate) fn shader_lib() -> ShaderLib {
    let vfs = Rc::new(MemoryVfs::new());
    install_shader_sources(&vfs, "shaders", 10);
    ShaderLib::new(vfs, "shaders", "shaders/bin")
}

/// Camera at the origin looking down -Z.
pub(crate) fn context() -> RenderContext {
    RenderContext::new(Mat4::IDENTITY, Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0))
}

pub(crate) fn looking_at(eye: Vec3, target: Vec3) -> RenderContext {
    RenderContext::look_at(eye, target, 1.0, 1.0)
}

/// Colour target plus matching depth buffer, bound.
pub(crate) fn bind_target(device: &mut RecordingDevice, size: u32) -> TextureId {
    let color = device
        .create_texture_2d(&Texture2dDesc::render_target("target", size, size, TextureFormat::Argb8))
        .unwrap();
    let depth = device
        .create_texture_2d(&Texture2dDesc::depth_stencil("target-depth", size, size))
        .unwrap();
    device.set_render_target(Some(color), Some(depth)).unwrap();
    color
}

pub(crate) fn scene_texture(device: &mut RecordingDevice) -> TextureId {
    device
        .create_texture_2d(&Texture2dDesc::render_target("scene", 16, 16, TextureFormat::Argb8))
        .unwrap()
}
