//! Cache of compiled shaders backed by precompiled binaries on the VFS.
//!
//! Each shader permutation is identified by a key built from its file name,
//! target version, entry point and macros. The key doubles as the binary file
//! name: a binary newer than both its source and every `.sh` include file is
//! loaded as is, anything else is recompiled and written back.

use std::rc::Rc;
use std::time::SystemTime;

use log::{error, info, warn};

use crate::error::RenderError;
use crate::gfx::{Device, DeviceError, ShaderBinary, ShaderId, ShaderIncluder, ShaderMacro, ShaderStage};
use crate::resource::ResourceCache;
use crate::vfs::Vfs;

/// Shader model a permutation is compiled for. Part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderVersion {
    Vs1_1,
    Vs2_0,
    Ps1_1,
    Ps2_0,
}

impl ShaderVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ShaderVersion::Vs1_1 => "vs_1_1",
            ShaderVersion::Vs2_0 => "vs_2_0",
            ShaderVersion::Ps1_1 => "ps_1_1",
            ShaderVersion::Ps2_0 => "ps_2_0",
        }
    }

    pub fn stage(self) -> ShaderStage {
        match self {
            ShaderVersion::Vs1_1 | ShaderVersion::Vs2_0 => ShaderStage::Vertex,
            ShaderVersion::Ps1_1 | ShaderVersion::Ps2_0 => ShaderStage::Pixel,
        }
    }
}

/// Asked whether a failed shader load should be attempted again, typically
/// after the user fixed the source. Receives the shader name and the failure.
pub type CompileRetryHandler = Box<dyn FnMut(&str, &RenderError) -> bool>;

/// `name_version_entry_` followed by `NAME=VALUE_` per macro, then `.obj`.
///
/// Macro order is significant: the same set given in another order yields
/// another key.
pub fn shader_key(name: &str, version: ShaderVersion, entry: &str, macros: &[ShaderMacro]) -> String {
    let mut key = format!("{}_{}_{}_", name, version.as_str(), entry);
    for shader_macro in macros {
        key.push_str(&shader_macro.name);
        key.push('=');
        key.push_str(&shader_macro.value);
        key.push('_');
    }
    key.push_str(".obj");
    key
}

struct VfsIncluder<'a> {
    vfs: &'a dyn Vfs,
    source_dir: &'a str,
}

impl ShaderIncluder for VfsIncluder<'_> {
    fn open(&mut self, file: &str) -> Option<String> {
        let path = format!("{}{}", self.source_dir, file);
        match self.vfs.read_file(&path) {
            Ok(data) => match String::from_utf8(data) {
                Ok(text) => Some(text),
                Err(_) => {
                    warn!("Include file {} is not valid UTF-8", path);
                    None
                }
            },
            Err(_) => {
                warn!("Unable to find include file {}", path);
                None
            }
        }
    }
}

pub struct ShaderLib {
    vfs: Rc<dyn Vfs>,
    source_dir: String,
    binary_dir: String,
    last_include: SystemTime,
    vertex_shaders: ResourceCache<String, ShaderId>,
    pixel_shaders: ResourceCache<String, ShaderId>,
    retry_handler: Option<CompileRetryHandler>,
}

impl ShaderLib {
    /// Scans `source_dir` for `.sh` include files to find the newest one.
    pub fn new(vfs: Rc<dyn Vfs>, source_dir: &str, binary_dir: &str) -> Self {
        let source_dir = as_dir(source_dir);
        let binary_dir = as_dir(binary_dir);

        let last_include = vfs
            .list_files(&source_dir)
            .iter()
            .filter(|file| file.ends_with(".sh"))
            .filter_map(|file| vfs.last_modified(&format!("{}{}", source_dir, file)))
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Self {
            vfs,
            source_dir,
            binary_dir,
            last_include,
            vertex_shaders: ResourceCache::new(),
            pixel_shaders: ResourceCache::new(),
            retry_handler: None,
        }
    }

    pub fn set_retry_handler(&mut self, handler: Option<CompileRetryHandler>) {
        self.retry_handler = handler;
    }

    pub fn last_include(&self) -> SystemTime {
        self.last_include
    }

    pub fn vertex_shader_count(&self) -> usize {
        self.vertex_shaders.len()
    }

    pub fn pixel_shader_count(&self) -> usize {
        self.pixel_shaders.len()
    }

    pub fn get_vshader(
        &mut self,
        device: &mut dyn Device,
        name: &str,
        version: ShaderVersion,
        entry: &str,
        macros: &[ShaderMacro],
    ) -> Result<ShaderId, RenderError> {
        debug_assert_eq!(version.stage(), ShaderStage::Vertex);
        self.get_shader(device, name, version, entry, macros)
    }

    pub fn get_pshader(
        &mut self,
        device: &mut dyn Device,
        name: &str,
        version: ShaderVersion,
        entry: &str,
        macros: &[ShaderMacro],
    ) -> Result<ShaderId, RenderError> {
        debug_assert_eq!(version.stage(), ShaderStage::Pixel);
        self.get_shader(device, name, version, entry, macros)
    }

    fn get_shader(
        &mut self,
        device: &mut dyn Device,
        name: &str,
        version: ShaderVersion,
        entry: &str,
        macros: &[ShaderMacro],
    ) -> Result<ShaderId, RenderError> {
        let stage = version.stage();
        let Self {
            vfs,
            source_dir,
            binary_dir,
            last_include,
            vertex_shaders,
            pixel_shaders,
            retry_handler,
        } = self;
        let loader = BinaryLoader {
            vfs: &**vfs,
            source_dir: source_dir.as_str(),
            binary_dir: binary_dir.as_str(),
            last_include: *last_include,
        };
        let cache = match stage {
            ShaderStage::Vertex => vertex_shaders,
            ShaderStage::Pixel => pixel_shaders,
        };

        cache.get_or_try_load(shader_key(name, version, entry, macros), |key| loop {
            match loader.load(device, stage, name, key, entry, macros) {
                Ok(shader) => return Ok(shader),
                Err(err) => {
                    error!(
                        "Unable to initialise {} shader '{}': {}",
                        stage.as_str(),
                        name,
                        err
                    );
                    let retry = retry_handler.as_mut().is_some_and(|handler| handler(name, &err));
                    if !retry {
                        return Err(err);
                    }
                }
            }
        })
    }
}

/// Resolves one permutation from its binary or its source.
struct BinaryLoader<'a> {
    vfs: &'a dyn Vfs,
    source_dir: &'a str,
    binary_dir: &'a str,
    last_include: SystemTime,
}

impl BinaryLoader<'_> {
    fn load(
        &self,
        device: &mut dyn Device,
        stage: ShaderStage,
        name: &str,
        key: &str,
        entry: &str,
        macros: &[ShaderMacro],
    ) -> Result<ShaderId, RenderError> {
        let src_path = format!("{}{}", self.source_dir, name);
        let bin_path = format!("{}{}", self.binary_dir, key);

        let bin_exists = self.vfs.file_exists(&bin_path);
        let src_exists = self.vfs.file_exists(&src_path);
        let modified = |path: &str| {
            self.vfs
                .last_modified(path)
                .unwrap_or(SystemTime::UNIX_EPOCH)
        };

        let binary_is_fresh = bin_exists
            && (!src_exists || {
                let bin_time = modified(&bin_path);
                bin_time >= modified(&src_path) && bin_time >= self.last_include
            });

        let binary = if binary_is_fresh {
            let bytes = self
                .vfs
                .read_file(&bin_path)
                .map_err(|err| RenderError::from_vfs(&bin_path, err))?;
            let binary = ShaderBinary::from_bytes(&bytes)?;
            if binary.stage != stage {
                return Err(DeviceError::InvalidBinary(format!(
                    "'{}' holds a {} shader",
                    bin_path,
                    binary.stage.as_str()
                ))
                .into());
            }
            binary
        } else if src_exists {
            info!("Compiling shader {} as {}", src_path, bin_path);
            let bytes = self
                .vfs
                .read_file(&src_path)
                .map_err(|err| RenderError::from_vfs(&src_path, err))?;
            let source = String::from_utf8(bytes).map_err(|_| RenderError::ShaderIo {
                path: src_path.clone(),
                message: format!("File '{}' is not valid UTF-8.", src_path),
            })?;

            let mut includer = VfsIncluder {
                vfs: self.vfs,
                source_dir: self.source_dir,
            };
            let binary = device
                .compile_shader(stage, &source, entry, macros, &mut includer)
                .map_err(|err| RenderError::ShaderCompile {
                    shader: name.to_string(),
                    message: err.to_string(),
                })?;

            if let Err(err) = self.vfs.write_file(&bin_path, &binary.to_bytes()) {
                warn!("Unable to write shader binary {}: {}", bin_path, err);
            }
            binary
        } else {
            return Err(RenderError::shader_not_found(&src_path));
        };

        Ok(device.create_shader(&binary)?)
    }
}

fn as_dir(dir: &str) -> String {
    let dir = dir.replace('\\', "/");
    if dir.is_empty() || dir.ends_with('/') {
        dir
    } else {
        format!("{dir}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::RecordingDevice;
    use crate::vfs::MemoryVfs;

    #[test]
    fn key_lists_macros_in_caller_order() {
        let a = ShaderMacro::new("SPRITE_FLAG", "1");
        let b = ShaderMacro::new("REFRACTION_FLAG", "1");

        assert_eq!(
            shader_key("billboard.vsh", ShaderVersion::Vs1_1, "vs_main", &[]),
            "billboard.vsh_vs_1_1_vs_main_.obj"
        );
        assert_eq!(
            shader_key("billboard.vsh", ShaderVersion::Vs1_1, "vs_main", &[a.clone(), b.clone()]),
            "billboard.vsh_vs_1_1_vs_main_SPRITE_FLAG=1_REFRACTION_FLAG=1_.obj"
        );
        assert_ne!(
            shader_key("billboard.vsh", ShaderVersion::Vs1_1, "vs_main", &[a.clone(), b.clone()]),
            shader_key("billboard.vsh", ShaderVersion::Vs1_1, "vs_main", &[b, a])
        );
    }

    #[test]
    fn last_include_tracks_newest_header_only() {
        let vfs = Rc::new(MemoryVfs::new());
        vfs.insert("shaders/common.sh", "", 10);
        vfs.insert("shaders/fog.sh", "", 40);
        vfs.insert("shaders/billboard.vsh", "fn vs_main() {}", 90);

        let lib = ShaderLib::new(vfs, "shaders", "cache");
        assert_eq!(
            lib.last_include(),
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(40)
        );
    }

    #[test]
    fn cached_permutation_skips_the_vfs() {
        let vfs = Rc::new(MemoryVfs::new());
        vfs.insert("shaders/glow.psh", "fn ps_main() {}", 1);
        let mut lib = ShaderLib::new(vfs.clone(), "shaders", "bin");
        let mut device = RecordingDevice::new();

        let first = lib
            .get_pshader(&mut device, "glow.psh", ShaderVersion::Ps2_0, "ps_main", &[])
            .unwrap();
        vfs.reset_counters();
        let second = lib
            .get_pshader(&mut device, "glow.psh", ShaderVersion::Ps2_0, "ps_main", &[])
            .unwrap();

        assert_eq!(first, second);
        assert_eq!((vfs.read_count(), vfs.write_count()), (0, 0));
        assert_eq!(device.compile_count(), 1);
        assert_eq!(lib.pixel_shader_count(), 1);
        assert_eq!(lib.vertex_shader_count(), 0);
    }

    #[test]
    fn missing_source_and_binary_is_reported() {
        let vfs = Rc::new(MemoryVfs::new());
        let mut lib = ShaderLib::new(vfs, "shaders/", "cache/");
        let mut device = RecordingDevice::new();

        let err = lib
            .get_pshader(&mut device, "bloom.psh", ShaderVersion::Ps2_0, "ps_main", &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "File 'shaders/bloom.psh' not found.");
    }

    #[test]
    fn retry_handler_gets_a_second_chance() {
        let vfs = Rc::new(MemoryVfs::new());
        vfs.insert("shaders/glow.psh", "fn broken() {}", 1);
        let mut lib = ShaderLib::new(vfs.clone(), "shaders/", "cache/");

        let fixer = vfs.clone();
        let mut asked = 0;
        lib.set_retry_handler(Some(Box::new(move |name: &str, err: &RenderError| {
            assert_eq!(name, "glow.psh");
            assert!(matches!(err, RenderError::ShaderCompile { .. }));
            asked += 1;
            fixer.insert("shaders/glow.psh", "fn ps_main() {}", 2);
            asked == 1
        })));

        let mut device = RecordingDevice::new();
        assert!(lib
            .get_pshader(&mut device, "glow.psh", ShaderVersion::Ps2_0, "ps_main", &[])
            .is_ok());
        assert_eq!(device.compile_count(), 2);
    }
}
