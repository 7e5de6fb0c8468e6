use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error, info};

use crate::error::RenderError;
use crate::gfx::{ClearFlags, Device};
use crate::resource::GpuResourceLib;
use crate::settings::{ReflectionLevel, RendererSettings, ShaderLevel, ShadowLevel};
use crate::vfs::Vfs;

use super::billboard::BillboardRenderer;
use super::command::{CommandExecutor, CommandMode, RenderPass};
use super::context::RenderContext;
use super::decal::DecalRenderer;
use super::glow::GlowRenderer;
use super::postfx::{PostFxPlan, PostFxRenderer};
use super::render_view::{RenderTargetBuffer, RenderView};
use super::scheduler::{CommandScheduler, PassCounts};
use super::screen_quad::ScreenQuad;
use super::shader_lib::ShaderLib;
use super::shadow::{ShadowContext, ShadowRenderer, DYNAMIC_SPLIT_COUNT};
use super::water::WaterRenderer;

/// Command counts of one scheduled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub pass: RenderPass,
    pub counts: PassCounts,
}

/// What a call to [`Renderer::render_scene`] did.
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub passes: Vec<PassStats>,
    pub bind_history: Vec<RenderTargetBuffer>,
    pub refraction_copies: u32,
    pub shadow: Option<ShadowContext>,
    pub post_fx: Option<PostFxPlan>,
}

impl FrameStats {
    /// Counts of the last run of `pass`.
    pub fn pass(&self, pass: RenderPass) -> Option<PassCounts> {
        self.passes.iter().rev().find(|stats| stats.pass == pass).map(|stats| stats.counts)
    }

    pub fn command_count(&self, mode: CommandMode) -> usize {
        self.passes
            .iter()
            .map(|stats| match mode {
                CommandMode::Solid => stats.counts.solid,
                CommandMode::Trans => stats.counts.trans,
                CommandMode::Water => stats.counts.water,
            })
            .sum()
    }

    pub fn exec_calls(&self) -> usize {
        self.passes.iter().map(|stats| stats.counts.exec_calls).sum()
    }

    pub fn failed_execs(&self) -> usize {
        self.passes.iter().map(|stats| stats.counts.failed_execs).sum()
    }
}

/// Owns the device and every sub-renderer, and drives a frame through the
/// engine's pass order.
pub struct Renderer<D: Device> {
    device: D,
    settings: RendererSettings,
    shader_lib: ShaderLib,
    resources: GpuResourceLib,
    scheduler: CommandScheduler,
    view: Rc<RefCell<RenderView>>,
    quad: Rc<RefCell<ScreenQuad>>,
    billboards: Rc<RefCell<BillboardRenderer>>,
    decals: Rc<RefCell<DecalRenderer>>,
    water: Rc<RefCell<WaterRenderer>>,
    shadow: Rc<RefCell<ShadowRenderer>>,
    post_fx: Rc<RefCell<PostFxRenderer>>,
    glow: GlowRenderer,
    initialised: bool,
}

impl<D: Device> Renderer<D> {
    pub fn new(
        device: D,
        settings: RendererSettings,
        vfs: Rc<dyn Vfs>,
        source_dir: &str,
        binary_dir: &str,
    ) -> Self {
        let mut resources = GpuResourceLib::new();
        let view = Rc::new(RefCell::new(RenderView::new(&settings)));
        let quad = Rc::new(RefCell::new(ScreenQuad::new()));
        let billboards = Rc::new(RefCell::new(BillboardRenderer::new(&settings)));
        let decals = Rc::new(RefCell::new(DecalRenderer::new(&settings)));
        let water = Rc::new(RefCell::new(WaterRenderer::new()));
        let shadow = Rc::new(RefCell::new(ShadowRenderer::new(&settings)));
        let post_fx = Rc::new(RefCell::new(PostFxRenderer::new(&settings)));

        resources.register(&view);
        resources.register(&quad);
        resources.register(&billboards);
        resources.register(&decals);
        resources.register(&water);
        resources.register(&shadow);
        resources.register(&post_fx);

        Self {
            device,
            settings,
            shader_lib: ShaderLib::new(vfs, source_dir, binary_dir),
            resources,
            scheduler: CommandScheduler::new(),
            view,
            quad,
            billboards,
            decals,
            water,
            shadow,
            post_fx,
            glow: GlowRenderer::new(),
            initialised: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn shader_lib(&self) -> &ShaderLib {
        &self.shader_lib
    }

    pub fn is_device_lost(&self) -> bool {
        self.resources.is_device_lost()
    }

    /// Loads every shader and allocates the device resources. Every
    /// component is initialised even when an earlier one fails.
    pub fn initialise(&mut self) -> bool {
        let device = &mut self.device;
        let lib = &mut self.shader_lib;
        let results = [
            ("screen quad", self.quad.borrow_mut().initialise(device, lib)),
            ("billboards", self.billboards.borrow_mut().initialise(device, lib)),
            ("decals", self.decals.borrow_mut().initialise(device, lib)),
            ("water", self.water.borrow_mut().initialise(device, lib)),
            ("shadows", self.shadow.borrow_mut().initialise(device, lib)),
            ("glow", self.glow.initialise(device, lib)),
            ("post-FX", self.post_fx.borrow_mut().initialise(device, lib)),
        ];

        let failed: Vec<_> = results.iter().filter(|(_, ok)| !ok).map(|(name, _)| *name).collect();
        if !failed.is_empty() {
            error!("Renderer initialisation failed for: {}", failed.join(", "));
            return false;
        }

        if let Err(err) = self.on_device_reset() {
            error!("Failed to allocate renderer resources: {}", err);
            return false;
        }

        info!(
            "Renderer initialised on {} ({} vertex / {} pixel shaders)",
            self.device.backend_name(),
            self.shader_lib.vertex_shader_count(),
            self.shader_lib.pixel_shader_count()
        );
        self.initialised = true;
        true
    }

    pub fn on_device_lost(&mut self) {
        debug!("Device lost, releasing renderer resources");
        self.resources.on_device_lost(&mut self.device);
    }

    pub fn on_device_reset(&mut self) -> Result<(), RenderError> {
        debug!("Device reset, restoring renderer resources");
        self.resources.on_device_reset(&mut self.device)
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.settings.width = width;
        self.settings.height = height;
        self.view.borrow_mut().resize(&mut self.device, width, height)
    }

    pub fn shadow_context(&self, context: &RenderContext) -> ShadowContext {
        let [split0, split1] = context.shadow_splits;
        self.shadow.borrow().shadow_context(split0, split1)
    }

    fn shadows_on(&self) -> bool {
        self.settings.shadow_level != ShadowLevel::None && self.settings.shader_level >= ShaderLevel::Low
    }

    fn glow_on(&self) -> bool {
        self.settings.glow_on && self.settings.shader_level >= ShaderLevel::Low
    }

    fn run_pass(&mut self, context: &RenderContext, pass: RenderPass, stats: &mut FrameStats) {
        let mut billboards = self.billboards.borrow_mut();
        let mut decals = self.decals.borrow_mut();
        let mut water = self.water.borrow_mut();
        let mut executors: [&mut dyn CommandExecutor; 3] = [&mut *billboards, &mut *decals, &mut *water];

        let counts = self.scheduler.run_pass(&mut self.device, &mut executors, context, pass);
        debug!(
            "{:?} pass: {} solid, {} water, {} trans",
            pass, counts.solid, counts.water, counts.trans
        );
        stats.passes.push(PassStats { pass, counts });
    }

    /// Renders one frame of `context` into the light buffer.
    pub fn render_scene(&mut self, context: &RenderContext) -> Result<FrameStats, RenderError> {
        use RenderTargetBuffer as B;

        if !self.initialised {
            return Err(RenderError::InvariantViolation(
                "render_scene called before initialise".to_string(),
            ));
        }
        if self.resources.is_device_lost() {
            return Err(RenderError::InvariantViolation(
                "render_scene called while the device is lost".to_string(),
            ));
        }

        let mut stats = FrameStats::default();
        self.view.borrow_mut().begin();

        if context.render_static_shadow {
            self.shadow.borrow_mut().start_static_shadow_map_rendering(&mut self.device)?;
            self.run_pass(context, RenderPass::StaticShadow, &mut stats);
            self.shadow.borrow_mut().end_static_shadow_map_rendering();
        }

        if self.shadows_on() {
            for split in 0..DYNAMIC_SPLIT_COUNT {
                self.shadow
                    .borrow_mut()
                    .start_dynamic_shadow_map_rendering(&mut self.device, split)?;
                self.run_pass(context, RenderPass::DynamicShadow, &mut stats);
                self.shadow
                    .borrow_mut()
                    .end_dynamic_shadow_map_rendering(&mut self.device, &self.quad.borrow())?;
            }
            stats.shadow = Some(self.shadow_context(context));
        }

        let fog_color = context.fog.color;
        let all = ClearFlags::COLOR | ClearFlags::DEPTH | ClearFlags::STENCIL;

        if context.render_reflection && self.settings.reflection_level != ReflectionLevel::None {
            self.view.borrow_mut().bind(&mut self.device, B::Reflection)?;
            self.device.clear_render_target(all, fog_color, 1.0, 0)?;
            self.run_pass(context, RenderPass::Reflection, &mut stats);
        }

        self.view.borrow_mut().bind(&mut self.device, B::Light)?;
        self.device.clear_render_target(all, fog_color, 1.0, 0)?;
        self.run_pass(context, RenderPass::Lighting, &mut stats);

        if self.glow_on() {
            self.glow.start_glow_pass(&mut self.device, &mut self.view.borrow_mut())?;
            self.run_pass(context, RenderPass::Glow, &mut stats);
            self.glow.end_glow_pass(
                &mut self.device,
                &mut self.view.borrow_mut(),
                &self.quad.borrow(),
                &context.main_light,
            )?;
        }

        let plan = self.post_fx.borrow_mut().post_fx(
            &mut self.device,
            &mut self.view.borrow_mut(),
            &self.quad.borrow(),
            &context.post_fx,
        )?;
        stats.post_fx = Some(plan);

        match context.accumulation {
            Some(source_factor) => self.post_fx.borrow_mut().accumulate(
                &mut self.device,
                &mut self.view.borrow_mut(),
                &self.quad.borrow(),
                source_factor,
            )?,
            None => self.post_fx.borrow_mut().reset_accumulation(&mut self.device),
        }

        self.device.flush()?;

        let view_stats = self.view.borrow().stats();
        stats.bind_history = view_stats.history;
        stats.refraction_copies = view_stats.refraction_layers + view_stats.forced_refraction_layers;
        Ok(stats)
    }
}
