use std::rc::Rc;
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use log::{error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use anima_render::error::RenderError;
use anima_render::gfx::{Device, RecordingDevice, WgpuDevice};
use anima_render::renderer::{
    install_shader_sources, Billboard, BillboardGroup, BillboardMode, CommandMode, Decal, DecalMode,
    RenderContext, Renderer, WaterPatch,
};
use anima_render::settings::RendererSettings;
use anima_render::vfs::MemoryVfs;

const SETTINGS_FILE: &str = "renderer_settings.json";
const FRAME_COUNT: u32 = 3;
const SCENE_SEED: u64 = 0x5eed;

fn build_scene(rng: &mut SmallRng) -> RenderContext {
    let mut context = RenderContext::look_at(Vec3::new(0.0, 6.0, 24.0), Vec3::ZERO, 1.0, 16.0 / 9.0);
    context.fog.color = Vec4::new(0.55, 0.62, 0.7, 1.0);
    context.water_level = -0.5;
    context.render_reflection = true;

    for mode in [BillboardMode::Add, BillboardMode::Lerp, BillboardMode::AddLerp] {
        let mut group = BillboardGroup::new(mode, 256);
        let billboards = (0..rng.gen_range(16..64))
            .map(|_| {
                let position = Vec3::new(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(0.0..5.0),
                    rng.gen_range(-10.0..10.0),
                );
                Billboard::new(position, rng.gen_range(0.2..1.5))
            })
            .collect();
        group.set_billboards(billboards);
        group.glow_factor = if mode == BillboardMode::Add { 1.0 } else { 0.0 };
        context.billboards.push(Arc::new(group));
    }

    for index in 0..4 {
        let world = Mat4::from_translation(Vec3::new(index as f32 * 3.0 - 4.5, 0.01, 2.0));
        let mut decal = Decal::new(DecalMode::Lerp, world, 2.0, 2.0);
        decal.glow = Vec4::new(1.0, 0.5, 0.1, rng.gen_range(0.0..1.0));
        context.decals.push(decal);
    }

    context.water_patches.push(WaterPatch::new(Vec2::new(0.0, -6.0), 30.0, 12.0));
    context
}

fn render_frames<D: Device>(
    renderer: &mut Renderer<D>,
    context: &mut RenderContext,
) -> Result<(), RenderError> {
    for frame in 0..FRAME_COUNT {
        context.time = frame as f32 / 30.0;
        context.post_fx.saturation = 1.0 - frame as f32 * 0.2;

        let stats = renderer.render_scene(context)?;
        info!(
            "frame {}: {} solid / {} water / {} trans commands, {} refraction copies, binds {:?}",
            frame,
            stats.command_count(CommandMode::Solid),
            stats.command_count(CommandMode::Water),
            stats.command_count(CommandMode::Trans),
            stats.refraction_copies,
            stats.bind_history
        );
    }

    renderer.on_device_lost();
    renderer.on_device_reset()?;
    info!("Device reset survived");
    Ok(())
}

fn run<D: Device>(device: D, vfs: Rc<MemoryVfs>) -> Result<Renderer<D>, RenderError> {
    let settings = RendererSettings::load_from_path(SETTINGS_FILE);
    let mut renderer = Renderer::new(device, settings, vfs, "shaders", "shaders/bin");
    if !renderer.initialise() {
        return Err(RenderError::InvariantViolation("renderer failed to initialise".into()));
    }

    let mut rng = SmallRng::seed_from_u64(SCENE_SEED);
    let mut context = build_scene(&mut rng);
    render_frames(&mut renderer, &mut context)?;
    Ok(renderer)
}

fn main() {
    anima_render::init_logging();

    let vfs = Rc::new(MemoryVfs::new());
    install_shader_sources(&vfs, "shaders", 0);

    let result = if std::env::args().any(|arg| arg == "--wgpu") {
        match WgpuDevice::new_headless() {
            Ok(device) => run(device, vfs).map(|_| ()),
            Err(err) => {
                error!("No wgpu device: {}", err);
                std::process::exit(1);
            }
        }
    } else {
        run(RecordingDevice::new(), vfs).map(|renderer| {
            let device = renderer.device();
            info!(
                "Recorded {} draws, {} shaders compiled in total",
                device.draw_count(),
                device.compile_count()
            );
        })
    };

    if let Err(err) = result {
        error!("Render failed: {}", err);
        std::process::exit(1);
    }
}
