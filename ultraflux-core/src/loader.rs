use std::future::Future;

use anyhow::Result;

use crate::{ModelLike, PipelineConfig};

/// Builds a ready-to-run model from a [`PipelineConfig`].
pub trait Loader: Send + Sync + 'static {
    type Model: ModelLike + 'static;

    fn load(&self, config: PipelineConfig) -> impl Future<Output = Result<Self::Model>> + Send;
}
