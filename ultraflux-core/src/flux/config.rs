//! Diffusers-style `config.json` files mapped onto candle's Flux configs.

use anyhow::{ensure, Context, Result};
use candle_transformers::models::flux::{autoencoder, model};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Keys some upstream configs carry that the loaded model revision does not
/// accept. They are dropped before the config is interpreted.
pub(crate) const UNSUPPORTED_KEYS: &[&str] = &["enable_gqa", "use_gqa", "gqa"];

/// Keys that are known and have no counterpart in candle's configs.
const IGNORED_KEYS: &[&str] = &["patch_size", "out_channels", "sample_size", "force_upcast"];

/// Removes every [`UNSUPPORTED_KEYS`] entry, returning the keys removed.
pub(crate) fn strip_unsupported_keys(config: &mut Map<String, Value>) -> Vec<&'static str> {
    UNSUPPORTED_KEYS
        .iter()
        .copied()
        .filter(|key| config.remove(*key).is_some())
        .collect()
}

fn parse_sanitized<T: DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    let mut map: Map<String, Value> =
        serde_json::from_str(text).with_context(|| format!("{what} config is not a JSON object"))?;
    for key in strip_unsupported_keys(&mut map) {
        debug!(key, "dropped unsupported {what} config key");
    }
    serde_json::from_value(Value::Object(map)).with_context(|| format!("invalid {what} config"))
}

fn warn_unrecognized(extra: &Map<String, Value>, what: &str) {
    for key in extra.keys() {
        if !key.starts_with('_') && !IGNORED_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "ignoring unrecognized {what} config key");
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct TransformerConfig {
    #[serde(default = "TransformerConfig::default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "TransformerConfig::default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "TransformerConfig::default_num_single_layers")]
    pub num_single_layers: usize,
    #[serde(default = "TransformerConfig::default_attention_head_dim")]
    pub attention_head_dim: usize,
    #[serde(default = "TransformerConfig::default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "TransformerConfig::default_joint_attention_dim")]
    pub joint_attention_dim: usize,
    #[serde(default = "TransformerConfig::default_pooled_projection_dim")]
    pub pooled_projection_dim: usize,
    #[serde(default = "TransformerConfig::default_guidance_embeds")]
    pub guidance_embeds: bool,
    #[serde(default = "TransformerConfig::default_axes_dims_rope")]
    pub axes_dims_rope: Vec<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransformerConfig {
    fn default_in_channels() -> usize {
        64
    }
    fn default_num_layers() -> usize {
        19
    }
    fn default_num_single_layers() -> usize {
        38
    }
    fn default_attention_head_dim() -> usize {
        128
    }
    fn default_num_attention_heads() -> usize {
        24
    }
    fn default_joint_attention_dim() -> usize {
        4096
    }
    fn default_pooled_projection_dim() -> usize {
        768
    }
    fn default_guidance_embeds() -> bool {
        true
    }
    fn default_axes_dims_rope() -> Vec<usize> {
        vec![16, 56, 56]
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = parse_sanitized(text, "transformer")?;
        warn_unrecognized(&config.extra, "transformer");
        ensure!(
            config.axes_dims_rope.iter().sum::<usize>() == config.attention_head_dim,
            "axes_dims_rope {:?} must sum to attention_head_dim {}",
            config.axes_dims_rope,
            config.attention_head_dim
        );
        Ok(config)
    }

    pub fn to_flux(&self) -> model::Config {
        model::Config {
            in_channels: self.in_channels,
            vec_in_dim: self.pooled_projection_dim,
            context_in_dim: self.joint_attention_dim,
            hidden_size: self.num_attention_heads * self.attention_head_dim,
            mlp_ratio: 4.0,
            num_heads: self.num_attention_heads,
            depth: self.num_layers,
            depth_single_blocks: self.num_single_layers,
            axes_dim: self.axes_dims_rope.clone(),
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: self.guidance_embeds,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct VaeConfig {
    #[serde(default = "VaeConfig::default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "VaeConfig::default_out_channels")]
    pub out_channels: usize,
    #[serde(default = "VaeConfig::default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "VaeConfig::default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "VaeConfig::default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "VaeConfig::default_scaling_factor")]
    pub scaling_factor: f64,
    #[serde(default = "VaeConfig::default_shift_factor")]
    pub shift_factor: f64,
    #[serde(default = "VaeConfig::default_sample_size")]
    pub sample_size: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VaeConfig {
    fn default_in_channels() -> usize {
        3
    }
    fn default_out_channels() -> usize {
        3
    }
    fn default_block_out_channels() -> Vec<usize> {
        vec![128, 256, 512, 512]
    }
    fn default_layers_per_block() -> usize {
        2
    }
    fn default_latent_channels() -> usize {
        16
    }
    fn default_scaling_factor() -> f64 {
        0.3611
    }
    fn default_shift_factor() -> f64 {
        0.1159
    }
    fn default_sample_size() -> usize {
        256
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = parse_sanitized(text, "vae")?;
        warn_unrecognized(&config.extra, "vae");
        let base = config.block_out_channels.first().copied().unwrap_or(0);
        ensure!(
            base > 0 && config.block_out_channels.iter().all(|c| c % base == 0),
            "block_out_channels {:?} must be positive multiples of the first entry",
            config.block_out_channels
        );
        Ok(config)
    }

    pub fn to_flux(&self) -> autoencoder::Config {
        let ch = self.block_out_channels[0];
        autoencoder::Config {
            resolution: self.sample_size,
            in_channels: self.in_channels,
            ch,
            out_ch: self.out_channels,
            ch_mult: self.block_out_channels.iter().map(|c| c / ch).collect(),
            num_res_blocks: self.layers_per_block,
            z_channels: self.latent_channels,
            scale_factor: self.scaling_factor,
            shift_factor: self.shift_factor,
        }
    }
}
