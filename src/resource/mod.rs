pub mod cache;
pub mod gpu;

pub use cache::ResourceCache;
pub use gpu::{GpuResource, GpuResourceLib, ResourceKey};
