//! Process-wide, lazily constructed pipeline.
//!
//! The first caller builds the model through its [`Loader`]; every later
//! caller gets the cached instance without touching a lock. Concurrent first
//! callers wait on the one construction in flight instead of starting their
//! own. A failed construction leaves the cell empty, so the next caller
//! starts over from scratch.

use std::{sync::Arc, time::Instant};

use anyhow::Result;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{Loader, PipelineConfig};

pub struct LazyPipeline<L: Loader> {
    loader: L,
    config: PipelineConfig,
    model: OnceCell<Arc<L::Model>>,
}

impl<L: Loader> LazyPipeline<L> {
    pub fn new(loader: L, config: PipelineConfig) -> Self {
        Self {
            loader,
            config,
            model: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether construction has completed successfully.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Returns the cached model, constructing it first if needed.
    pub async fn get(&self) -> Result<Arc<L::Model>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let started = Instant::now();
                info!(model_id = %self.config.model_id, device = %self.config.device, "loading pipeline");
                match self.loader.load(self.config.clone()).await {
                    Ok(model) => {
                        info!(elapsed = ?started.elapsed(), "pipeline ready");
                        Ok(Arc::new(model))
                    }
                    Err(err) => {
                        warn!("pipeline construction failed: {err:#}");
                        Err(err)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(model))
    }
}
