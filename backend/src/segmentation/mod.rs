pub mod loader;
pub mod model;
pub mod normalization;
pub mod orchestrator;
pub mod reconstruct;
pub mod render;
pub mod tiler;
#[cfg(feature = "torch")]
pub mod torch_model;
