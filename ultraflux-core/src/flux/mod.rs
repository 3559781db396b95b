use std::sync::Mutex;

use anyhow::{anyhow, ensure, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{self, ClipTextTransformer},
    flux::{autoencoder::AutoEncoder, model::Flux, sampling},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod config;
mod schedule;
mod source;
mod weights;

use config::{TransformerConfig, VaeConfig};
use schedule::shifted_schedule;
use source::ModelSource;

use crate::{
    align_dimension, seeded_noise, select_best_device, tensor_to_image, GenerationRequest, Loader, ModelLike,
    PipelineConfig,
};

/// Longest T5 sequence the encoder was trained with.
const MAX_T5_SEQUENCE_LENGTH: usize = 512;

pub struct FluxModel {
    device: Device,
    dtype: DType,
    time_shift: f64,
    max_sequence_length: usize,
    // The T5 encoder keeps per-call state, so it needs exclusive access.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    clip_max_tokens: usize,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn encode_t5(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(self.max_sequence_length, 0);
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut t5 = self
            .t5_model
            .lock()
            .map_err(|_| anyhow!("T5 encoder lock poisoned"))?;
        Ok(t5.forward(&input_ids)?)
    }

    fn encode_clip(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        // Keep the end-of-text token, the pooled output is read from it.
        if tokens.len() > self.clip_max_tokens {
            let eot = tokens[tokens.len() - 1];
            tokens.truncate(self.clip_max_tokens - 1);
            tokens.push(eot);
        }
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_ids)?)
    }
}

impl ModelLike for FluxModel {
    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        let (height, width) = (align_dimension(request.height), align_dimension(request.width));

        let noise_img = seeded_noise(request.seed, height, width, self.dtype, &self.device)?;
        let t5_emb = self.encode_t5(&request.prompt)?;
        let clip_emb = self.encode_clip(&request.prompt)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = shifted_schedule(request.num_inference_steps, self.time_shift);

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            request.guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!(seed = request.seed, "denoised latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!(seed = request.seed, "decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

/// Loads the Flux transformer and VAE from the configured model, plus the
/// T5 and CLIP text encoders, onto the configured device.
#[derive(Debug, Default, Clone, Copy)]
pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(&self, config: PipelineConfig) -> Result<FluxModel> {
        tokio::task::spawn_blocking(move || load_blocking(&config))
            .await
            .context("pipeline loading task failed")?
    }
}

fn mmap_weights(files: &[std::path::PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    // SAFETY: the weight files are not modified while the process runs.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? };
    Ok(vb)
}

fn load_blocking(config: &PipelineConfig) -> Result<FluxModel> {
    ensure!(
        (1..=MAX_T5_SEQUENCE_LENGTH).contains(&config.max_sequence_length),
        "max_sequence_length must be between 1 and {MAX_T5_SEQUENCE_LENGTH}, got {}",
        config.max_sequence_length
    );
    ensure!(
        config.time_shift.is_finite() && config.time_shift > 0.0,
        "time_shift must be positive, got {}",
        config.time_shift
    );

    let device = select_best_device(config.device).context("failed to set up device")?;
    let dtype = device.bf16_default_to_f32();
    let api = Api::new().context("failed to create hf hub API")?;
    let source = ModelSource::resolve(&config.model_id, &api);

    // --- VAE ---
    let vae_dir = &config.vae_subfolder;
    info!(subfolder = %vae_dir, "loading VAE");
    let vae_config = VaeConfig::from_json(&source.read_to_string(&format!("{vae_dir}/config.json"))?)?;
    let vae_levels = vae_config.block_out_channels.len();
    let vae_vb = weights::vae_var_builder(&source.weight_files(vae_dir)?, vae_levels, dtype, &device)
        .context("failed to build VAE var builder")?;
    let autoencoder =
        AutoEncoder::new(&vae_config.to_flux(), vae_vb).context("failed to load VAE")?;

    // --- Transformer ---
    let transformer_dir = &config.transformer_subfolder;
    info!(subfolder = %transformer_dir, "loading transformer");
    let transformer_config = TransformerConfig::from_json(
        &source.read_to_string(&format!("{transformer_dir}/config.json"))?,
    )?;
    let flux_vb = weights::transformer_var_builder(
        &source.weight_files(transformer_dir)?,
        transformer_config.num_layers,
        transformer_config.num_single_layers,
        dtype,
        &device,
    )
    .context("failed to build transformer var builder")?;
    let flux_model =
        Flux::new(&transformer_config.to_flux(), flux_vb).context("failed to load transformer")?;

    // --- T5 encoder and tokenizer ---
    info!("loading T5 text encoder");
    let t5_repo = api.repo(hf_hub::Repo::with_revision(
        "google/t5-v1_1-xxl".to_string(),
        hf_hub::RepoType::Model,
        "refs/pr/2".to_string(),
    ));
    let t5_model_file = t5_repo
        .get("model.safetensors")
        .context("failed to get T5 model file")?;
    let t5_vb = mmap_weights(&[t5_model_file], dtype, &device)
        .context("failed to build T5 var builder")?;
    let t5_config_file = t5_repo.get("config.json").context("failed to get T5 config")?;
    let t5_config: t5::Config = serde_json::from_str(
        &std::fs::read_to_string(&t5_config_file).context("failed to read T5 config")?,
    )
    .context("failed to parse T5 config")?;
    let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
    let t5_tokenizer_file = api
        .model("lmz/mt5-tokenizers".to_string())
        .get("t5-v1_1-xxl.tokenizer.json")
        .context("failed to get T5 tokenizer")?;
    let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_file)
        .map_err(Error::msg)
        .context("failed to load T5 tokenizer")?;

    // --- CLIP encoder and tokenizer ---
    info!("loading CLIP text encoder");
    let clip_repo = api.repo(hf_hub::Repo::model(
        "openai/clip-vit-large-patch14".to_string(),
    ));
    let clip_model_file = clip_repo
        .get("model.safetensors")
        .context("failed to get CLIP model file")?;
    let clip_vb = mmap_weights(&[clip_model_file], dtype, &device)
        .context("failed to build CLIP var builder")?;
    let clip_config = text_model::ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
        .context("failed to load CLIP model")?;
    let clip_tokenizer_file = clip_repo
        .get("tokenizer.json")
        .context("failed to get CLIP tokenizer")?;
    let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_file)
        .map_err(Error::msg)
        .context("failed to load CLIP tokenizer")?;

    info!(device = ?device, dtype = ?dtype, "pipeline assembled");
    Ok(FluxModel {
        device,
        dtype,
        time_shift: config.time_shift,
        max_sequence_length: config.max_sequence_length,
        t5_model: Mutex::new(t5_model),
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        clip_max_tokens: clip_config.max_position_embeddings,
        autoencoder,
        flux_model,
    })
}
