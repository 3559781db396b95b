use std::path::PathBuf;

use clap::Args;

use crate::DeviceMap;

pub const DEFAULT_MODEL_ID: &str = "Owen777/UltraFlux-v1";
pub const DEFAULT_TRANSFORMER_SUBFOLDER: &str = "transformer";
pub const DEFAULT_VAE_SUBFOLDER: &str = "vae";
pub const DEFAULT_DEVICE: &str = "cuda";
pub const DEFAULT_RESULTS_DIR: &str = "results";
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 512;
pub const DEFAULT_TIME_SHIFT: f64 = 4.0;

/// Where the pipeline weights come from and how they are placed.
///
/// Every field can be given on the command line or through its
/// `ULTRAFLUX_*` environment variable.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Hub repository id or local directory holding the model
    #[arg(long, env = "ULTRAFLUX_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Subfolder of the model holding the transformer weights
    #[arg(
        long,
        env = "ULTRAFLUX_TRANSFORMER_SUBFOLDER",
        default_value = DEFAULT_TRANSFORMER_SUBFOLDER
    )]
    pub transformer_subfolder: String,

    /// Subfolder of the model holding the VAE weights
    #[arg(long, env = "ULTRAFLUX_VAE_SUBFOLDER", default_value = DEFAULT_VAE_SUBFOLDER)]
    pub vae_subfolder: String,

    /// Target device: cpu, cuda, cuda:N, metal or metal:N
    #[arg(long, env = "ULTRAFLUX_DEVICE", default_value = DEFAULT_DEVICE)]
    pub device: DeviceMap,

    /// Maximum number of T5 tokens fed to the transformer
    #[arg(
        long,
        env = "ULTRAFLUX_MAX_SEQUENCE_LENGTH",
        default_value_t = DEFAULT_MAX_SEQUENCE_LENGTH
    )]
    pub max_sequence_length: usize,

    /// Static shift applied to the flow-matching schedule
    #[arg(long, env = "ULTRAFLUX_TIME_SHIFT", default_value_t = DEFAULT_TIME_SHIFT)]
    pub time_shift: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            transformer_subfolder: DEFAULT_TRANSFORMER_SUBFOLDER.to_string(),
            vae_subfolder: DEFAULT_VAE_SUBFOLDER.to_string(),
            device: DeviceMap::default(),
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            time_shift: DEFAULT_TIME_SHIFT,
        }
    }
}

/// Options shared by the HTTP service and the batch runner.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    #[command(flatten)]
    pub pipeline: PipelineConfig,

    /// Directory generated images are written to
    #[arg(long, env = "ULTRAFLUX_RESULTS_DIR", default_value = DEFAULT_RESULTS_DIR)]
    pub results_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
        }
    }
}
