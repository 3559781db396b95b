use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    save_jpeg, GenerateRequest, LazyPipeline, Loader, ModelLike, PipelineConfig, ServiceConfig,
    ServiceError,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub prompt: String,
    pub seed: u64,
    pub image_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Initializing,
}

serde_plain::derive_display_from_serialize!(HealthStatus);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Health {
    pub status: HealthStatus,
    pub device: String,
}

/// Validates requests, runs them one at a time on the shared pipeline and
/// stores the results.
pub struct ImageService<L: Loader> {
    pipeline: LazyPipeline<L>,
    // Held for the whole model call, so at most one generation runs at once.
    inference_lock: Arc<Mutex<()>>,
    results_dir: PathBuf,
}

impl<L: Loader> ImageService<L> {
    pub fn new(loader: L, config: ServiceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.results_dir).with_context(|| {
            format!("failed to create results dir {}", config.results_dir.display())
        })?;
        Ok(Self {
            pipeline: LazyPipeline::new(loader, config.pipeline),
            inference_lock: Arc::new(Mutex::new(())),
            results_dir: config.results_dir,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn health(&self) -> Health {
        let status = if self.pipeline.is_loaded() {
            HealthStatus::Ok
        } else {
            HealthStatus::Initializing
        };
        Health {
            status,
            device: self.config().device.to_string(),
        }
    }

    /// Constructs the pipeline ahead of the first request.
    pub async fn warm_up(&self) -> Result<()> {
        self.pipeline.get().await.map(|_| ())
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ServiceError> {
        let request = request.resolve()?;
        let model = self
            .pipeline
            .get()
            .await
            .map_err(ServiceError::from_generation)?;

        let permit = self.inference_lock.clone().lock_owned().await;
        info!(
            seed = request.seed,
            height = request.height,
            width = request.width,
            steps = request.num_inference_steps,
            "starting generation"
        );
        let started = Instant::now();
        let params = request.clone();
        // The permit moves into the blocking task: a caller that goes away
        // does not release the lock before the model call returns.
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.run(&params)
        })
        .await
        .map_err(|err| ServiceError::Failed(anyhow!("generation task failed: {err}")))?;
        let image = outcome.map_err(|err| {
            warn!(seed = request.seed, "generation failed: {err:#}");
            ServiceError::from_generation(err)
        })?;

        let dir = self.results_dir.clone();
        let stem = format!("ultraflux_{}", unix_millis());
        let path = tokio::task::spawn_blocking(move || save_jpeg(&image, &dir, &stem))
            .await
            .map_err(|err| ServiceError::Failed(anyhow!("image save task failed: {err}")))?
            .map_err(ServiceError::Failed)?;
        info!(
            seed = request.seed,
            elapsed = ?started.elapsed(),
            path = %path.display(),
            "generation finished"
        );

        Ok(GenerateResponse {
            prompt: request.prompt,
            seed: request.seed,
            image_path: path.display().to_string(),
        })
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
