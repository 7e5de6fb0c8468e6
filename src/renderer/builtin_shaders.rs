//! Shader sources shipped with the crate.

use crate::vfs::MemoryVfs;

pub const SHADER_SOURCES: &[(&str, &str)] = &[
    ("vs-registers.sh", include_str!("../shader/vs-registers.sh")),
    ("ps-registers.sh", include_str!("../shader/ps-registers.sh")),
    ("screen.sh", include_str!("../shader/screen.sh")),
    ("billboard.vsh", include_str!("../shader/billboard.vsh")),
    ("decal.vsh", include_str!("../shader/decal.vsh")),
    ("water-final-fixed.vsh", include_str!("../shader/water-final-fixed.vsh")),
    ("screenquad.vsh", include_str!("../shader/screenquad.vsh")),
    ("passthru-tex.psh", include_str!("../shader/passthru-tex.psh")),
    ("bloom.psh", include_str!("../shader/bloom.psh")),
    ("blur-3.psh", include_str!("../shader/blur-3.psh")),
    ("blur-5.psh", include_str!("../shader/blur-5.psh")),
    ("blur-9.psh", include_str!("../shader/blur-9.psh")),
    ("blur-h.psh", include_str!("../shader/blur-h.psh")),
    ("blur-v.psh", include_str!("../shader/blur-v.psh")),
    ("glow.psh", include_str!("../shader/glow.psh")),
    ("radialblur-9.psh", include_str!("../shader/radialblur-9.psh")),
    ("postfx.psh", include_str!("../shader/postfx.psh")),
    ("accum.psh", include_str!("../shader/accum.psh")),
];

/// Copies every built-in source under `source_dir`, stamped `modified`.
pub fn install_shader_sources(vfs: &MemoryVfs, source_dir: &str, modified: u64) {
    let dir = source_dir.trim_end_matches('/');
    for (name, source) in SHADER_SOURCES {
        vfs.insert(&format!("{dir}/{name}"), source.as_bytes(), modified);
    }
}

pub fn shader_source(name: &str) -> Option<&'static str> {
    SHADER_SOURCES
        .iter()
        .find(|(file, _)| *file == name)
        .map(|(_, source)| *source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{preprocess, ConstantTable, ShaderIncluder, ShaderMacro};
    use crate::renderer::permutation::permutation_macros;
    use crate::renderer::primitives::PrimitiveFlags;
    use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

    struct BuiltinIncludes;

    impl ShaderIncluder for BuiltinIncludes {
        fn open(&mut self, file: &str) -> Option<String> {
            shader_source(file).map(str::to_string)
        }
    }

    #[test]
    fn sprite_constants_exist_only_in_sprite_permutations() {
        let source = shader_source("billboard.vsh").unwrap();
        let plain = preprocess(source, &[], &mut BuiltinIncludes).unwrap();
        let sprite = preprocess(
            source,
            &[ShaderMacro::new("SPRITE_FLAG", "1")],
            &mut BuiltinIncludes,
        )
        .unwrap();

        let plain = ConstantTable::parse(&plain);
        let sprite = ConstantTable::parse(&sprite);
        assert!(plain.index_of("SpriteCount").is_none());
        assert!(sprite.index_of("SpriteCount").is_some());
        assert!(plain.index_of("FixedTexture").is_some());
        assert_eq!(plain.register_binding(), Some(0));
    }

    #[test]
    fn pixel_shaders_use_their_own_register_binding() {
        let expanded = preprocess(shader_source("postfx.psh").unwrap(), &[], &mut BuiltinIncludes).unwrap();
        let table = ConstantTable::parse(&expanded);
        assert_eq!(table.register_binding(), Some(1));
        for name in ["BlurFactor", "Saturation", "Fade", "SamplerTexture", "SamplerBlur"] {
            assert!(table.index_of(name).is_some(), "{name} missing");
        }
    }

    /// Every macro set the renderer compiles `name` with.
    fn permutations_of(name: &str) -> Vec<Vec<ShaderMacro>> {
        match name {
            "billboard.vsh" => [false, true]
                .into_iter()
                .flat_map(|refraction| {
                    [PrimitiveFlags::empty(), PrimitiveFlags::SPRITE]
                        .into_iter()
                        .map(move |flags| permutation_macros(refraction, flags))
                })
                .collect(),
            "decal.vsh" => vec![
                permutation_macros(false, PrimitiveFlags::empty()),
                permutation_macros(false, PrimitiveFlags::SPRITE),
            ],
            "blur-3.psh" | "blur-5.psh" | "blur-9.psh" => {
                vec![Vec::new(), vec![ShaderMacro::new("GAUSSIAN_FLAG", "1")]]
            }
            _ => vec![Vec::new()],
        }
    }

    #[test]
    fn every_permutation_is_valid_wgsl() {
        let mut validated = 0;
        for (name, source) in SHADER_SOURCES.iter().filter(|(name, _)| !name.ends_with(".sh")) {
            for macros in permutations_of(name) {
                let expanded = preprocess(source, &macros, &mut BuiltinIncludes)
                    .unwrap_or_else(|err| panic!("{name} {macros:?}: {err}"));
                let module = wgpu::naga::front::wgsl::parse_str(&expanded).unwrap_or_else(|err| {
                    panic!("{name} {macros:?}:\n{}", err.emit_to_string(&expanded))
                });
                Validator::new(ValidationFlags::all(), Capabilities::default())
                    .validate(&module)
                    .unwrap_or_else(|err| {
                        panic!("{name} {macros:?}:\n{}", err.emit_to_string(&expanded))
                    });
                validated += 1;
            }
        }
        assert_eq!(validated, 22);
    }
}
