pub mod export;
pub mod model;
pub mod trace;
pub mod weights;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;
#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;
