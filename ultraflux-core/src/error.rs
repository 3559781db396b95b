use thiserror::Error;

use crate::ValidationError;

/// Markers the CUDA driver and the Metal allocator put in allocation
/// failures. Compared case-insensitively.
const OOM_MARKERS: &[&str] = &["out of memory", "out_of_memory"];

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("accelerator out of memory: {0}")]
    OutOfMemory(String),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

impl ServiceError {
    /// Sorts a pipeline failure into out-of-memory or anything else.
    pub fn from_generation(err: anyhow::Error) -> Self {
        if is_out_of_memory(&err) {
            Self::OutOfMemory(format!("{err:#}"))
        } else {
            Self::Failed(err)
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let text = cause.to_string().to_lowercase();
        OOM_MARKERS.iter().any(|marker| text.contains(marker))
    })
}
