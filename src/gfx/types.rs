use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

resource_id!(
    /// Vertex or index buffer owned by a device.
    BufferId
);
resource_id!(
    /// 2D texture, render target or depth-stencil surface.
    TextureId
);
resource_id!(ShaderId);
resource_id!(
    /// Rasterizer + depth-stencil + blend state block.
    StateId
);
resource_id!(SamplerId);
resource_id!(VertexFormatId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Pixel => "pixel",
        }
    }
}

// Buffers -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    /// 16-bit indices.
    Index16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Filled at creation, never written again.
    Immutable,
    /// CPU-written every frame.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub usage: BufferUsage,
    pub size: u64,
}

impl BufferDesc {
    pub fn vertex(usage: BufferUsage, size: u64) -> Self {
        Self {
            kind: BufferKind::Vertex,
            usage,
            size,
        }
    }

    pub fn index16(usage: BufferUsage, index_count: u64) -> Self {
        Self {
            kind: BufferKind::Index16,
            usage,
            size: index_count * std::mem::size_of::<u16>() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Previous contents are thrown away.
    WriteDiscard,
    /// Caller promises not to touch data in flight.
    WriteNoOverwrite,
}

// Textures -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Argb8,
    R32F,
    D24S8,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D24S8)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        4
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureBind: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture2dDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub bind: TextureBind,
    pub sample_count: u32,
}

impl Texture2dDesc {
    pub fn render_target(label: &'static str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label,
            width: width.max(1),
            height: height.max(1),
            format,
            bind: TextureBind::RENDER_TARGET | TextureBind::SHADER_RESOURCE,
            sample_count: 1,
        }
    }

    pub fn depth_stencil(label: &'static str, width: u32, height: u32) -> Self {
        Self {
            label,
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::D24S8,
            bind: TextureBind::DEPTH_STENCIL,
            sample_count: 1,
        }
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }
}

// Pipeline state ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizerDesc {
    pub cull: CullMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    Less,
    LessEqual,
    Equal,
    Greater,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunc::LessEqual,
        }
    }
}

impl DepthStencilDesc {
    pub const DISABLED: Self = Self {
        depth_test: false,
        depth_write: false,
        depth_func: CompareFunc::Always,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    InvSrcAlpha,
    SrcColor,
    InvSrcColor,
    DestColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendDesc {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self::OPAQUE
    }
}

impl BlendDesc {
    pub const OPAQUE: Self = Self {
        enabled: false,
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        op: BlendOp::Add,
    };

    /// `src * a + dst`
    pub const ADD: Self = Self {
        enabled: true,
        src: BlendFactor::SrcAlpha,
        dst: BlendFactor::One,
        op: BlendOp::Add,
    };

    /// `src * a + dst * (1 - a)`
    pub const LERP: Self = Self {
        enabled: true,
        src: BlendFactor::SrcAlpha,
        dst: BlendFactor::InvSrcAlpha,
        op: BlendOp::Add,
    };

    pub const ONE_ONE: Self = Self {
        enabled: true,
        src: BlendFactor::One,
        dst: BlendFactor::One,
        op: BlendOp::Add,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineStateDesc {
    pub raster: RasterizerDesc,
    pub depth: DepthStencilDesc,
    pub blend: BlendDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Point,
    Bilinear,
    Trilinear,
    Anisotropic(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Clamp,
    Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub address: AddressMode,
}

impl SamplerDesc {
    pub fn clamp(filter: SamplerFilter) -> Self {
        Self {
            filter,
            address: AddressMode::Clamp,
        }
    }
}

// Vertex input -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    TexCoord(u8),
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttribFormat {
    Float2,
    Float3,
    Float4,
    /// Four normalized unsigned bytes.
    UByte4N,
    /// Packed colour, normalized.
    Color,
}

impl VertexAttribFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexAttribFormat::Float2 => 8,
            VertexAttribFormat::Float3 => 12,
            VertexAttribFormat::Float4 => 16,
            VertexAttribFormat::UByte4N | VertexAttribFormat::Color => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub semantic: VertexSemantic,
    pub format: VertexAttribFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexFormatDesc {
    pub elements: Vec<VertexElement>,
    /// Unused bytes after the last element.
    pub padding: u32,
}

impl VertexFormatDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an element packed right after the previous one.
    pub fn with(mut self, semantic: VertexSemantic, format: VertexAttribFormat) -> Self {
        let offset = self.stride() - self.padding;
        self.elements.push(VertexElement {
            semantic,
            format,
            offset,
        });
        self
    }

    pub fn with_padding(mut self, bytes: u32) -> Self {
        self.padding += bytes;
        self
    }

    pub fn stride(&self) -> u32 {
        self.elements
            .last()
            .map(|last| last.offset + last.format.size())
            .unwrap_or(0)
            + self.padding
    }
}

// Drawing ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

impl Topology {
    pub fn index_count(self, primitive_count: u32) -> u32 {
        match self {
            Topology::TriangleList => primitive_count * 3,
            Topology::TriangleStrip => primitive_count + 2,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

// Constants ----------------------------------------------------------------------------

/// Slot of a named constant inside a shader's constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstantIndex(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    Float(f32),
    Float2(Vec2),
    Float3(Vec3),
    Float4(Vec4),
    Matrix(Mat4),
}

impl ConstantValue {
    /// Number of vec4 registers the value occupies.
    pub fn register_count(&self) -> usize {
        match self {
            ConstantValue::Matrix(_) => 4,
            _ => 1,
        }
    }

    pub fn write_registers(&self, out: &mut [[f32; 4]]) {
        match *self {
            ConstantValue::Float(v) => out[0] = [v, 0.0, 0.0, 0.0],
            ConstantValue::Float2(v) => out[0] = [v.x, v.y, 0.0, 0.0],
            ConstantValue::Float3(v) => out[0] = [v.x, v.y, v.z, 0.0],
            ConstantValue::Float4(v) => out[0] = v.to_array(),
            ConstantValue::Matrix(m) => {
                for (register, column) in out.iter_mut().zip(m.to_cols_array_2d()) {
                    *register = column;
                }
            }
        }
    }
}

impl From<f32> for ConstantValue {
    fn from(value: f32) -> Self {
        ConstantValue::Float(value)
    }
}

impl From<Vec2> for ConstantValue {
    fn from(value: Vec2) -> Self {
        ConstantValue::Float2(value)
    }
}

impl From<Vec3> for ConstantValue {
    fn from(value: Vec3) -> Self {
        ConstantValue::Float3(value)
    }
}

impl From<Vec4> for ConstantValue {
    fn from(value: Vec4) -> Self {
        ConstantValue::Float4(value)
    }
}

impl From<Mat4> for ConstantValue {
    fn from(value: Mat4) -> Self {
        ConstantValue::Matrix(value)
    }
}
