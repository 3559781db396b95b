pub mod config;
pub mod device_map;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod service;
pub mod validation;
mod util;

mod flux;

pub use config::*;
pub use device_map::*;
pub use error::*;
pub use flux::{FluxLoader, FluxModel};
use image::DynamicImage;
pub use loader::*;
pub use pipeline::LazyPipeline;
pub use service::*;
pub use util::*;
pub use validation::*;

/// A validated generation request with its seed already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
