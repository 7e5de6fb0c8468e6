use std::rc::Rc;
use std::sync::Arc;

use anima_render::gfx::{RecordingDevice, Topology};
use anima_render::renderer::{
    install_shader_sources, Billboard, BillboardGroup, BillboardMode, CommandMode, Decal,
    DecalMode, RenderContext, RenderPass, RenderTargetBuffer, Renderer, WaterPatch,
};
use anima_render::settings::{GlobalLevel, RendererSettings};
use anima_render::vfs::MemoryVfs;
use glam::{Mat4, Vec2, Vec3, Vec4};

fn renderer(level: GlobalLevel) -> Renderer<RecordingDevice> {
    let vfs = Rc::new(MemoryVfs::new());
    install_shader_sources(&vfs, "shaders", 1);
    let mut settings = RendererSettings::with_level(level);
    settings.width = 128;
    settings.height = 96;
    let mut renderer = Renderer::new(RecordingDevice::new(), settings, vfs, "shaders", "shaders/bin");
    assert!(renderer.initialise());
    renderer
}

fn camera() -> RenderContext {
    RenderContext::look_at(Vec3::ZERO, Vec3::NEG_Z, 1.0, 4.0 / 3.0)
}

fn group_at(z: f32, glow_factor: f32) -> Arc<BillboardGroup> {
    let mut group = BillboardGroup::new(BillboardMode::Add, 8);
    group.set_world_matrix(Mat4::from_translation(Vec3::new(0.0, 0.0, z)));
    group.set_billboards(vec![Billboard::new(Vec3::ZERO, 1.0)]);
    group.glow_factor = glow_factor;
    Arc::new(group)
}

/// Base vertex of every single-billboard draw, in submission order.
fn billboard_draws(device: &RecordingDevice) -> Vec<i32> {
    device
        .draws()
        .filter(|draw| draw.topology == Topology::TriangleList && draw.primitive_count == 2)
        .map(|draw| draw.base_vertex)
        .collect()
}

#[test]
fn glow_pass_keeps_only_glowing_groups() {
    let mut renderer = renderer(GlobalLevel::High);
    let mut context = camera();
    context.billboards = vec![group_at(-10.0, 0.0), group_at(-5.0, 0.5), group_at(-20.0, 1.0)];

    let stats = renderer.render_scene(&context).unwrap();

    assert_eq!(stats.pass(RenderPass::Lighting).unwrap().trans, 3);
    assert_eq!(stats.pass(RenderPass::Glow).unwrap().trans, 2);
    assert_eq!(stats.failed_execs(), 0);
}

#[test]
fn lighting_draws_billboards_back_to_front() {
    let mut renderer = renderer(GlobalLevel::Medium);
    let mut context = camera();
    context.billboards = vec![group_at(-10.0, 0.0), group_at(-5.0, 0.0), group_at(-20.0, 0.0)];

    renderer.render_scene(&context).unwrap();

    // Groups are packed in submission order, four vertices each.
    assert_eq!(billboard_draws(renderer.device()), [8, 0, 4]);
}

#[test]
fn water_is_a_single_command_whatever_the_patch_count() {
    let mut renderer = renderer(GlobalLevel::Medium);
    let mut context = camera();
    context.water_patches = (0..4)
        .map(|index| WaterPatch::new(Vec2::new(index as f32 * 16.0, 0.0), 16.0, 16.0))
        .collect();

    let stats = renderer.render_scene(&context).unwrap();

    assert_eq!(stats.pass(RenderPass::Lighting).unwrap().water, 1);
    assert_eq!(stats.command_count(CommandMode::Water), 1);
}

#[test]
fn decals_without_glow_stay_out_of_the_glow_pass() {
    let mut renderer = renderer(GlobalLevel::High);
    let mut context = camera();
    let world = Mat4::from_translation(Vec3::new(0.0, 0.0, -4.0));
    let plain = Decal::new(DecalMode::Lerp, world, 1.0, 1.0);
    let mut glowing = Decal::new(DecalMode::Add, world, 1.0, 1.0);
    glowing.glow = Vec4::ONE;
    context.decals = vec![plain, glowing];

    let stats = renderer.render_scene(&context).unwrap();

    assert_eq!(stats.pass(RenderPass::Lighting).unwrap().trans, 2);
    assert_eq!(stats.pass(RenderPass::Glow).unwrap().trans, 1);
}

#[test]
fn refraction_is_copied_once_per_frame_for_glow() {
    let mut renderer = renderer(GlobalLevel::High);
    let stats = renderer.render_scene(&camera()).unwrap();

    assert_eq!(stats.refraction_copies, 1);
    assert!(stats.bind_history.contains(&RenderTargetBuffer::Glow0));
    assert_eq!(stats.bind_history.last(), Some(&RenderTargetBuffer::Light));
}

#[test]
fn saturation_runs_the_post_fx_shader() {
    let mut renderer = renderer(GlobalLevel::Medium);
    let mut context = camera();
    context.post_fx.saturation = 0.25;

    let stats = renderer.render_scene(&context).unwrap();
    let plan = stats.post_fx.unwrap();

    assert!(plan.do_post_fx);
    assert!(!plan.blur_on());
}

#[test]
fn accumulation_keeps_a_trail_texture_while_enabled() {
    let mut renderer = renderer(GlobalLevel::Medium);
    let mut context = camera();
    context.accumulation = Some(0.5);

    renderer.render_scene(&context).unwrap();
    renderer.render_scene(&context).unwrap();
    let trail = |renderer: &Renderer<RecordingDevice>| {
        renderer
            .device()
            .live_textures()
            .iter()
            .filter(|desc| desc.label == "accum")
            .count()
    };
    assert_eq!(trail(&renderer), 1);

    context.accumulation = None;
    renderer.render_scene(&context).unwrap();
    assert_eq!(trail(&renderer), 0);
}

#[test]
fn every_frame_is_flushed_once() {
    let mut renderer = renderer(GlobalLevel::Low);
    for _ in 0..3 {
        renderer.render_scene(&camera()).unwrap();
    }
    assert_eq!(renderer.device().flush_count(), 3);
}
