use std::ops::RangeInclusive;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GenerationRequest;

pub const PROMPT_CHARS: RangeInclusive<usize> = 1..=1600;
pub const DIMENSION_RANGE: RangeInclusive<usize> = 256..=4096;
pub const STEPS_RANGE: RangeInclusive<usize> = 10..=200;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 0.0..=20.0;

/// Image sides are rounded down to a multiple of this (VAE factor 8 times
/// the 2x2 latent packing).
pub const DIMENSION_MULTIPLE: usize = 16;

/// Upper bound (exclusive) for randomly drawn seeds.
pub const RANDOM_SEED_BOUND: u64 = (1 << 31) - 1;

/// Rounds an image side down to the nearest size the pipeline can produce.
pub fn align_dimension(value: usize) -> usize {
    value / DIMENSION_MULTIPLE * DIMENSION_MULTIPLE
}

/// Body of a generation request as it arrives on the wire.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_dimension")]
    pub height: usize,
    #[serde(default = "default_dimension")]
    pub width: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_dimension() -> usize {
    4096
}

fn default_steps() -> usize {
    50
}

fn default_guidance() -> f64 {
    4.0
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            height: default_dimension(),
            width: default_dimension(),
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance(),
            seed: None,
        }
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let prompt_chars = self.prompt.chars().count();
        if !PROMPT_CHARS.contains(&prompt_chars) {
            return Err(ValidationError::PromptLength(prompt_chars));
        }
        for (field, value) in [("height", self.height), ("width", self.width)] {
            if !DIMENSION_RANGE.contains(&value) {
                return Err(ValidationError::Dimension { field, value });
            }
        }
        if !STEPS_RANGE.contains(&self.num_inference_steps) {
            return Err(ValidationError::Steps(self.num_inference_steps));
        }
        if !GUIDANCE_RANGE.contains(&self.guidance_scale) {
            return Err(ValidationError::Guidance(self.guidance_scale));
        }
        Ok(())
    }

    /// Validates the request, pins down its seed and aligns its dimensions.
    pub fn resolve(self) -> Result<GenerationRequest, ValidationError> {
        self.validate()?;
        let seed = self
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..RANDOM_SEED_BOUND));
        Ok(GenerationRequest {
            prompt: self.prompt,
            height: align_dimension(self.height),
            width: align_dimension(self.width),
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            seed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("prompt must be between {min} and {max} characters, got {0}", min = PROMPT_CHARS.start(), max = PROMPT_CHARS.end())]
    PromptLength(usize),
    #[error("{field} must be between {min} and {max}, got {value}", min = DIMENSION_RANGE.start(), max = DIMENSION_RANGE.end())]
    Dimension { field: &'static str, value: usize },
    #[error("num_inference_steps must be between {min} and {max}, got {0}", min = STEPS_RANGE.start(), max = STEPS_RANGE.end())]
    Steps(usize),
    #[error("guidance_scale must be between {min} and {max}, got {0}", min = GUIDANCE_RANGE.start(), max = GUIDANCE_RANGE.end())]
    Guidance(f64),
}
