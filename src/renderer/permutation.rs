use crate::gfx::{
    BlendDesc, CompareFunc, CullMode, DepthStencilDesc, Device, PipelineStateDesc,
    RasterizerDesc, ShaderId, ShaderMacro, StateId, VertexFormatId,
};

use super::primitives::PrimitiveFlags;

/// Everything a draw of one shader permutation binds before its constants.
#[derive(Debug, Clone, Copy)]
pub struct ShaderParams<C> {
    pub vertex_shader: ShaderId,
    pub format: VertexFormatId,
    pub state: StateId,
    pub constants: C,
}

impl<C> ShaderParams<C> {
    /// Binds state, format and vertex shader, leaving the pixel stage on the
    /// fixed texture path.
    pub fn bind(&self, device: &mut dyn Device) {
        device.set_state(self.state);
        device.set_vertex_format(self.format);
        device.set_vertex_shader(Some(self.vertex_shader));
        device.set_pixel_shader(None);
    }
}

/// Dense `mode x flags` table of shader permutations.
#[derive(Debug, Clone)]
pub struct PermutationTable<T> {
    rows: Vec<[T; PrimitiveFlags::COUNT]>,
}

impl<T> PermutationTable<T> {
    /// Builds every permutation in mode order. Stops at the first failure.
    pub fn build<M, E, F>(modes: impl IntoIterator<Item = M>, mut build: F) -> Result<Self, E>
    where
        M: Copy,
        F: FnMut(M, PrimitiveFlags) -> Result<T, E>,
    {
        let mut rows = Vec::new();
        for mode in modes {
            rows.push([
                build(mode, PrimitiveFlags::empty())?,
                build(mode, PrimitiveFlags::SPRITE)?,
            ]);
        }
        Ok(Self { rows })
    }

    pub fn get(&self, mode: usize, flags: PrimitiveFlags) -> Option<&T> {
        self.rows.get(mode)?.get(flags.bits() as usize)
    }

    pub fn len(&self) -> usize {
        self.rows.len() * PrimitiveFlags::COUNT
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn permutation_macros(refraction: bool, flags: PrimitiveFlags) -> Vec<ShaderMacro> {
    let mut macros = Vec::new();
    if refraction {
        macros.push(ShaderMacro::new("REFRACTION_FLAG", "1"));
    }
    if flags.contains(PrimitiveFlags::SPRITE) {
        macros.push(ShaderMacro::new("SPRITE_FLAG", "1"));
    }
    macros
}

/// No culling, depth tested with `depth_func` but never written.
pub fn blended_state(blend: BlendDesc, depth_func: CompareFunc) -> PipelineStateDesc {
    PipelineStateDesc {
        raster: RasterizerDesc {
            cull: CullMode::None,
        },
        depth: DepthStencilDesc {
            depth_test: true,
            depth_write: false,
            depth_func,
        },
        blend,
    }
}

/// State of the image-space passes: depth off, no culling.
pub fn screen_state(blend: BlendDesc) -> PipelineStateDesc {
    PipelineStateDesc {
        raster: RasterizerDesc {
            cull: CullMode::None,
        },
        depth: DepthStencilDesc::DISABLED,
        blend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_mode_then_flags() {
        let table: PermutationTable<(u8, u32)> =
            PermutationTable::build([10u8, 20, 30], |mode, flags| Ok::<_, ()>((mode, flags.bits())))
                .unwrap();

        assert_eq!(table.len(), 6);
        assert_eq!(table.get(1, PrimitiveFlags::SPRITE), Some(&(20, 1)));
        assert_eq!(table.get(2, PrimitiveFlags::empty()), Some(&(30, 0)));
        assert_eq!(table.get(3, PrimitiveFlags::empty()), None);
    }

    #[test]
    fn build_stops_at_the_first_failure() {
        let mut calls = 0;
        let result: Result<PermutationTable<()>, &str> = PermutationTable::build([0, 1], |mode, _| {
            calls += 1;
            if mode == 1 {
                Err("broken")
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap_err(), "broken");
        assert_eq!(calls, 3);
    }

    #[test]
    fn macros_keep_refraction_before_sprite() {
        let macros = permutation_macros(true, PrimitiveFlags::SPRITE);
        let names: Vec<_> = macros.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["REFRACTION_FLAG", "SPRITE_FLAG"]);
        assert!(permutation_macros(false, PrimitiveFlags::empty()).is_empty());
    }
}
