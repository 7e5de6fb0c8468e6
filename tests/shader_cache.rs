use std::rc::Rc;

use anima_render::error::RenderError;
use anima_render::gfx::{RecordingDevice, ShaderMacro};
use anima_render::renderer::{install_shader_sources, ShaderLib, ShaderVersion};
use anima_render::vfs::{MemoryVfs, Vfs};

const SOURCE_DIR: &str = "shaders/src";
const BINARY_DIR: &str = "shaders/bin";
const GLOW_BINARY: &str = "shaders/bin/glow.psh_ps_2_0_ps_main_.obj";

fn shader_vfs() -> Rc<MemoryVfs> {
    let vfs = Rc::new(MemoryVfs::new());
    install_shader_sources(&vfs, SOURCE_DIR, 100);
    vfs
}

fn shader_lib(vfs: &Rc<MemoryVfs>) -> ShaderLib {
    let vfs: Rc<dyn Vfs> = vfs.clone();
    ShaderLib::new(vfs, SOURCE_DIR, BINARY_DIR)
}

fn load_glow(lib: &mut ShaderLib, device: &mut RecordingDevice) -> Result<(), RenderError> {
    lib.get_pshader(device, "glow.psh", ShaderVersion::Ps2_0, "ps_main", &[])
        .map(|_| ())
}

#[test]
fn compiled_binary_is_written_under_its_key() {
    let vfs = shader_vfs();
    let mut device = RecordingDevice::new();
    let mut lib = shader_lib(&vfs);

    load_glow(&mut lib, &mut device).unwrap();

    assert_eq!(device.compile_count(), 1);
    assert!(vfs.file_exists(GLOW_BINARY));
}

#[test]
fn fresh_binary_is_reused_by_a_new_library() {
    let vfs = shader_vfs();
    load_glow(&mut shader_lib(&vfs), &mut RecordingDevice::new()).unwrap();

    let mut device = RecordingDevice::new();
    let mut lib = shader_lib(&vfs);
    load_glow(&mut lib, &mut device).unwrap();

    assert_eq!(device.compile_count(), 0);
    assert_eq!(lib.pixel_shader_count(), 1);
}

#[test]
fn edited_source_is_recompiled() {
    let vfs = shader_vfs();
    load_glow(&mut shader_lib(&vfs), &mut RecordingDevice::new()).unwrap();

    let binary_time = vfs.last_modified(GLOW_BINARY).unwrap();
    let stamp = binary_time
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    vfs.set_modified(&format!("{SOURCE_DIR}/glow.psh"), stamp + 5);

    let mut device = RecordingDevice::new();
    load_glow(&mut shader_lib(&vfs), &mut device).unwrap();

    assert_eq!(device.compile_count(), 1);
    assert!(vfs.last_modified(GLOW_BINARY).unwrap() > binary_time);
}

#[test]
fn edited_include_invalidates_every_binary() {
    let vfs = shader_vfs();
    load_glow(&mut shader_lib(&vfs), &mut RecordingDevice::new()).unwrap();

    vfs.insert(&format!("{SOURCE_DIR}/extra.sh"), "", 10_000);

    let mut device = RecordingDevice::new();
    load_glow(&mut shader_lib(&vfs), &mut device).unwrap();

    assert_eq!(device.compile_count(), 1);
}

#[test]
fn permutations_are_cached_separately() {
    let vfs = shader_vfs();
    let mut device = RecordingDevice::new();
    let mut lib = shader_lib(&vfs);
    let gaussian = [ShaderMacro::new("GAUSSIAN_FLAG", "1")];

    let plain = lib
        .get_pshader(&mut device, "blur-3.psh", ShaderVersion::Ps2_0, "ps_main", &[])
        .unwrap();
    let weighted = lib
        .get_pshader(&mut device, "blur-3.psh", ShaderVersion::Ps2_0, "ps_main", &gaussian)
        .unwrap();
    let again = lib
        .get_pshader(&mut device, "blur-3.psh", ShaderVersion::Ps2_0, "ps_main", &gaussian)
        .unwrap();

    assert_ne!(plain, weighted);
    assert_eq!(weighted, again);
    assert_eq!(device.compile_count(), 2);
    assert!(vfs.file_exists("shaders/bin/blur-3.psh_ps_2_0_ps_main_GAUSSIAN_FLAG=1_.obj"));
}

#[test]
fn missing_source_without_binary_fails() {
    let vfs = shader_vfs();
    let mut device = RecordingDevice::new();
    let mut lib = shader_lib(&vfs);

    let result = lib.get_pshader(&mut device, "missing.psh", ShaderVersion::Ps2_0, "ps_main", &[]);

    assert!(result.is_err());
    assert_eq!(lib.pixel_shader_count(), 0);
}

#[test]
fn retry_handler_is_asked_until_it_gives_up() {
    let vfs = shader_vfs();
    let mut device = RecordingDevice::new();
    let mut lib = shader_lib(&vfs);
    let asked = Rc::new(std::cell::Cell::new(0));
    let counter = asked.clone();
    lib.set_retry_handler(Some(Box::new(move |_: &str, _: &RenderError| {
        counter.set(counter.get() + 1);
        counter.get() < 3
    })));

    let result = lib.get_pshader(&mut device, "missing.psh", ShaderVersion::Ps2_0, "ps_main", &[]);

    assert!(result.is_err());
    assert_eq!(asked.get(), 3);
}
