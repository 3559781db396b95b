//! Loads diffusers-format Flux checkpoints under the tensor names candle's
//! `flux::model::Flux` and `flux::autoencoder::AutoEncoder` read.
//!
//! Checkpoints already saved in that layout (`img_in.weight`,
//! `decoder.up.0.block.0...`) are passed through untouched.

use std::{collections::HashMap, path::PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, warn};

type Tensors = HashMap<String, Tensor>;

/// Reads every tensor of a (possibly sharded) safetensors checkpoint.
pub(crate) fn load_tensors(files: &[PathBuf], device: &Device) -> Result<Tensors> {
    let mut tensors = Tensors::new();
    for file in files {
        let shard = candle_core::safetensors::load(file, device)
            .with_context(|| format!("failed to read {}", file.display()))?;
        tensors.extend(shard);
    }
    Ok(tensors)
}

pub(crate) fn transformer_var_builder(
    files: &[PathBuf],
    depth: usize,
    depth_single_blocks: usize,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let tensors = load_tensors(files, device)?;
    let tensors = convert_transformer(tensors, depth, depth_single_blocks)?;
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

pub(crate) fn vae_var_builder(
    files: &[PathBuf],
    levels: usize,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let tensors = load_tensors(files, device)?;
    let tensors = convert_vae(tensors, levels)?;
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

/// Moves tensors out of the diffusers map into the renamed one.
struct Renamer {
    src: Tensors,
    dst: Tensors,
}

impl Renamer {
    fn new(src: Tensors) -> Self {
        Self {
            src,
            dst: Tensors::new(),
        }
    }

    fn take(&mut self, name: &str) -> Result<Tensor> {
        self.src
            .remove(name)
            .with_context(|| format!("checkpoint is missing tensor {name}"))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let tensor = self.take(from)?;
        self.dst.insert(to.to_string(), tensor);
        Ok(())
    }

    /// Renames a linear layer, with its bias when the checkpoint has one.
    fn linear(&mut self, from: &str, to: &str) -> Result<()> {
        self.rename(&format!("{from}.weight"), &format!("{to}.weight"))?;
        if let Some(bias) = self.src.remove(&format!("{from}.bias")) {
            self.dst.insert(format!("{to}.bias"), bias);
        }
        Ok(())
    }

    /// Fuses several linear layers into one by stacking their outputs.
    fn fused_linear(&mut self, from: &[String], to: &str) -> Result<()> {
        for suffix in ["weight", "bias"] {
            let names: Vec<String> = from.iter().map(|f| format!("{f}.{suffix}")).collect();
            if suffix == "bias" && !self.src.contains_key(&names[0]) {
                continue;
            }
            let parts = names
                .iter()
                .map(|name| self.take(name))
                .collect::<Result<Vec<_>>>()?;
            self.dst
                .insert(format!("{to}.{suffix}"), Tensor::cat(&parts, 0)?);
        }
        Ok(())
    }

    /// Renames a modulation layer whose output halves come in the opposite
    /// order: diffusers stores (scale, shift), candle reads (shift, scale).
    fn swapped_linear(&mut self, from: &str, to: &str) -> Result<()> {
        for suffix in ["weight", "bias"] {
            let name = format!("{from}.{suffix}");
            if suffix == "bias" && !self.src.contains_key(&name) {
                continue;
            }
            let tensor = self.take(&name)?;
            let half = tensor.dim(0)? / 2;
            let swapped = Tensor::cat(&[tensor.narrow(0, half, half)?, tensor.narrow(0, 0, half)?], 0)?;
            self.dst.insert(format!("{to}.{suffix}"), swapped);
        }
        Ok(())
    }

    fn finish(self, what: &str) -> Tensors {
        if !self.src.is_empty() {
            let mut leftover: Vec<&String> = self.src.keys().collect();
            leftover.sort();
            warn!(count = leftover.len(), first = %leftover[0], "ignoring unused {what} tensors");
        }
        self.dst
    }
}

fn is_diffusers_transformer(tensors: &Tensors) -> bool {
    tensors.contains_key("x_embedder.weight")
}

pub(crate) fn convert_transformer(
    tensors: Tensors,
    depth: usize,
    depth_single_blocks: usize,
) -> Result<Tensors> {
    if !is_diffusers_transformer(&tensors) {
        if !tensors.contains_key("img_in.weight") {
            bail!("transformer checkpoint has neither x_embedder nor img_in weights");
        }
        debug!("transformer checkpoint already uses candle names");
        return Ok(tensors);
    }
    debug!(depth, depth_single_blocks, "converting diffusers transformer checkpoint");

    let mut r = Renamer::new(tensors);
    r.linear("x_embedder", "img_in")?;
    r.linear("context_embedder", "txt_in")?;
    for (from, to) in [
        ("timestep_embedder", "time_in"),
        ("text_embedder", "vector_in"),
        ("guidance_embedder", "guidance_in"),
    ] {
        let from = format!("time_text_embed.{from}");
        if to == "guidance_in" && !r.src.contains_key(&format!("{from}.linear_1.weight")) {
            continue;
        }
        r.linear(&format!("{from}.linear_1"), &format!("{to}.in_layer"))?;
        r.linear(&format!("{from}.linear_2"), &format!("{to}.out_layer"))?;
    }

    for i in 0..depth {
        let from = format!("transformer_blocks.{i}");
        let to = format!("double_blocks.{i}");
        r.linear(&format!("{from}.norm1.linear"), &format!("{to}.img_mod.lin"))?;
        r.linear(&format!("{from}.norm1_context.linear"), &format!("{to}.txt_mod.lin"))?;

        let img_qkv = ["to_q", "to_k", "to_v"].map(|p| format!("{from}.attn.{p}"));
        r.fused_linear(&img_qkv, &format!("{to}.img_attn.qkv"))?;
        let txt_qkv = ["add_q_proj", "add_k_proj", "add_v_proj"].map(|p| format!("{from}.attn.{p}"));
        r.fused_linear(&txt_qkv, &format!("{to}.txt_attn.qkv"))?;

        for (norm, stream, target) in [
            ("norm_q", "img_attn", "query_norm"),
            ("norm_k", "img_attn", "key_norm"),
            ("norm_added_q", "txt_attn", "query_norm"),
            ("norm_added_k", "txt_attn", "key_norm"),
        ] {
            r.rename(
                &format!("{from}.attn.{norm}.weight"),
                &format!("{to}.{stream}.norm.{target}.scale"),
            )?;
        }
        r.linear(&format!("{from}.attn.to_out.0"), &format!("{to}.img_attn.proj"))?;
        r.linear(&format!("{from}.attn.to_add_out"), &format!("{to}.txt_attn.proj"))?;

        for (ff, mlp) in [("ff", "img_mlp"), ("ff_context", "txt_mlp")] {
            r.linear(&format!("{from}.{ff}.net.0.proj"), &format!("{to}.{mlp}.0"))?;
            r.linear(&format!("{from}.{ff}.net.2"), &format!("{to}.{mlp}.2"))?;
        }
    }

    for i in 0..depth_single_blocks {
        let from = format!("single_transformer_blocks.{i}");
        let to = format!("single_blocks.{i}");
        let linear1 = [
            format!("{from}.attn.to_q"),
            format!("{from}.attn.to_k"),
            format!("{from}.attn.to_v"),
            format!("{from}.proj_mlp"),
        ];
        r.fused_linear(&linear1, &format!("{to}.linear1"))?;
        r.linear(&format!("{from}.proj_out"), &format!("{to}.linear2"))?;
        r.linear(&format!("{from}.norm.linear"), &format!("{to}.modulation.lin"))?;
        r.rename(&format!("{from}.attn.norm_q.weight"), &format!("{to}.norm.query_norm.scale"))?;
        r.rename(&format!("{from}.attn.norm_k.weight"), &format!("{to}.norm.key_norm.scale"))?;
    }

    r.swapped_linear("norm_out.linear", "final_layer.adaLN_modulation.1")?;
    r.linear("proj_out", "final_layer.linear")?;
    Ok(r.finish("transformer"))
}

fn is_diffusers_vae(tensors: &Tensors) -> bool {
    tensors
        .keys()
        .any(|k| k.starts_with("encoder.down_blocks.") || k.starts_with("decoder.up_blocks."))
}

pub(crate) fn convert_vae(tensors: Tensors, levels: usize) -> Result<Tensors> {
    if !is_diffusers_vae(&tensors) {
        debug!("VAE checkpoint already uses candle names");
        return Ok(tensors);
    }
    debug!(levels, "converting diffusers VAE checkpoint");

    let mut converted = Tensors::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        if name.starts_with("quant_conv.") || name.starts_with("post_quant_conv.") {
            continue;
        }
        let renamed = vae_tensor_name(&name, levels)?;
        // Mid-block attention is a linear layer in diffusers and a 1x1 conv in candle.
        let tensor = if renamed.contains(".mid.attn_1.") && renamed.ends_with(".weight") && tensor.rank() == 2 {
            let (out_dim, in_dim) = tensor.dims2()?;
            tensor.reshape((out_dim, in_dim, 1, 1))?
        } else {
            tensor
        };
        converted.insert(renamed, tensor);
    }
    Ok(converted)
}

fn resnet_tail(rest: &[&str]) -> String {
    match rest {
        ["conv_shortcut", tail @ ..] => format!("nin_shortcut.{}", tail.join(".")),
        _ => rest.join("."),
    }
}

fn attention_layer(layer: &str) -> &str {
    match layer {
        "group_norm" => "norm",
        "to_q" | "query" => "q",
        "to_k" | "key" => "k",
        "to_v" | "value" => "v",
        "proj_attn" => "proj_out",
        other => other,
    }
}

/// Maps one diffusers VAE tensor name to the name candle's autoencoder reads.
/// Up blocks are numbered from the lowest resolution in diffusers and from
/// the highest in candle, hence the flip.
fn vae_tensor_name(name: &str, levels: usize) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    let flip = |level: &str| -> Result<usize> {
        let level: usize = level
            .parse()
            .with_context(|| format!("bad block index in {name}"))?;
        match levels.checked_sub(level + 1) {
            Some(flipped) => Ok(flipped),
            None => bail!("{name} refers to up block {level}, the VAE has {levels}"),
        }
    };
    let renamed = match parts.as_slice() {
        [side, "down_blocks", level, "resnets", block, rest @ ..] => {
            format!("{side}.down.{level}.block.{block}.{}", resnet_tail(rest))
        }
        [side, "down_blocks", level, "downsamplers", "0", rest @ ..] => {
            format!("{side}.down.{level}.downsample.{}", rest.join("."))
        }
        [side, "up_blocks", level, "resnets", block, rest @ ..] => {
            format!("{side}.up.{}.block.{block}.{}", flip(*level)?, resnet_tail(rest))
        }
        [side, "up_blocks", level, "upsamplers", "0", rest @ ..] => {
            format!("{side}.up.{}.upsample.{}", flip(*level)?, rest.join("."))
        }
        [side, "mid_block", "resnets", block, rest @ ..] => {
            let block: usize = block
                .parse()
                .with_context(|| format!("bad block index in {name}"))?;
            format!("{side}.mid.block_{}.{}", block + 1, resnet_tail(rest))
        }
        [side, "mid_block", "attentions", "0", "to_out", "0", rest @ ..] => {
            format!("{side}.mid.attn_1.proj_out.{}", rest.join("."))
        }
        [side, "mid_block", "attentions", "0", layer, rest @ ..] => {
            format!("{side}.mid.attn_1.{}.{}", attention_layer(layer), rest.join("."))
        }
        [side, "conv_norm_out", rest @ ..] => format!("{side}.norm_out.{}", rest.join(".")),
        _ => name.to_string(),
    };
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use candle_transformers::models::flux::model::{self, Flux};

    use super::*;

    const HIDDEN: usize = 16;
    const HEAD_DIM: usize = 8;
    const MLP: usize = 4 * HIDDEN;
    const IN_CHANNELS: usize = 4;
    const CONTEXT: usize = 6;
    const VEC: usize = 5;

    fn tiny_config() -> model::Config {
        model::Config {
            in_channels: IN_CHANNELS,
            vec_in_dim: VEC,
            context_in_dim: CONTEXT,
            hidden_size: HIDDEN,
            mlp_ratio: 4.0,
            num_heads: HIDDEN / HEAD_DIM,
            depth: 1,
            depth_single_blocks: 1,
            axes_dim: vec![2, 2, 4],
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: true,
        }
    }

    fn filled(value: f32, shape: &[usize]) -> Tensor {
        Tensor::full(value, shape, &Device::Cpu).unwrap()
    }

    fn put_linear(ts: &mut Tensors, name: &str, out_dim: usize, in_dim: usize) {
        ts.insert(format!("{name}.weight"), filled(0.0, &[out_dim, in_dim]));
        ts.insert(format!("{name}.bias"), filled(0.0, &[out_dim]));
    }

    /// A transformer checkpoint with diffusers names and one block of each kind.
    fn tiny_diffusers_transformer() -> Tensors {
        let mut ts = Tensors::new();
        put_linear(&mut ts, "x_embedder", HIDDEN, IN_CHANNELS);
        put_linear(&mut ts, "context_embedder", HIDDEN, CONTEXT);
        for (embedder, in_dim) in [("timestep_embedder", 256), ("guidance_embedder", 256), ("text_embedder", VEC)] {
            put_linear(&mut ts, &format!("time_text_embed.{embedder}.linear_1"), HIDDEN, in_dim);
            put_linear(&mut ts, &format!("time_text_embed.{embedder}.linear_2"), HIDDEN, HIDDEN);
        }

        let b = "transformer_blocks.0";
        put_linear(&mut ts, &format!("{b}.norm1.linear"), 6 * HIDDEN, HIDDEN);
        put_linear(&mut ts, &format!("{b}.norm1_context.linear"), 6 * HIDDEN, HIDDEN);
        for (i, proj) in ["to_q", "to_k", "to_v"].iter().enumerate() {
            ts.insert(format!("{b}.attn.{proj}.weight"), filled(i as f32 + 1.0, &[HIDDEN, HIDDEN]));
            ts.insert(format!("{b}.attn.{proj}.bias"), filled(i as f32 + 1.0, &[HIDDEN]));
        }
        for proj in ["add_q_proj", "add_k_proj", "add_v_proj", "to_out.0", "to_add_out"] {
            put_linear(&mut ts, &format!("{b}.attn.{proj}"), HIDDEN, HIDDEN);
        }
        for norm in ["norm_q", "norm_k", "norm_added_q", "norm_added_k"] {
            ts.insert(format!("{b}.attn.{norm}.weight"), filled(1.0, &[HEAD_DIM]));
        }
        for ff in ["ff", "ff_context"] {
            put_linear(&mut ts, &format!("{b}.{ff}.net.0.proj"), MLP, HIDDEN);
            put_linear(&mut ts, &format!("{b}.{ff}.net.2"), HIDDEN, MLP);
        }

        let s = "single_transformer_blocks.0";
        put_linear(&mut ts, &format!("{s}.norm.linear"), 3 * HIDDEN, HIDDEN);
        for proj in ["to_q", "to_k", "to_v"] {
            put_linear(&mut ts, &format!("{s}.attn.{proj}"), HIDDEN, HIDDEN);
        }
        put_linear(&mut ts, &format!("{s}.proj_mlp"), MLP, HIDDEN);
        put_linear(&mut ts, &format!("{s}.proj_out"), HIDDEN, HIDDEN + MLP);
        for norm in ["norm_q", "norm_k"] {
            ts.insert(format!("{s}.attn.{norm}.weight"), filled(1.0, &[HEAD_DIM]));
        }

        // First half scale, second half shift.
        let norm_out = Tensor::cat(&[filled(1.0, &[HIDDEN, HIDDEN]), filled(2.0, &[HIDDEN, HIDDEN])], 0).unwrap();
        ts.insert("norm_out.linear.weight".to_string(), norm_out);
        ts.insert("norm_out.linear.bias".to_string(), filled(0.0, &[2 * HIDDEN]));
        put_linear(&mut ts, "proj_out", IN_CHANNELS, HIDDEN);
        ts
    }

    #[test]
    fn diffusers_transformer_loads_through_flux() -> Result<()> {
        let converted = convert_transformer(tiny_diffusers_transformer(), 1, 1)?;
        let vb = VarBuilder::from_tensors(converted, DType::F32, &Device::Cpu);
        Flux::new(&tiny_config(), vb)?;
        Ok(())
    }

    #[test]
    fn attention_projections_are_fused_in_qkv_order() -> Result<()> {
        let converted = convert_transformer(tiny_diffusers_transformer(), 1, 1)?;

        let qkv = &converted["double_blocks.0.img_attn.qkv.bias"];
        assert_eq!(qkv.dims(), &[3 * HIDDEN]);
        let qkv = qkv.to_vec1::<f32>()?;
        assert_eq!(qkv[0], 1.0);
        assert_eq!(qkv[HIDDEN], 2.0);
        assert_eq!(qkv[2 * HIDDEN], 3.0);

        assert_eq!(converted["single_blocks.0.linear1.weight"].dims(), &[3 * HIDDEN + MLP, HIDDEN]);
        assert!(!converted.keys().any(|k| k.contains("transformer_blocks")));
        Ok(())
    }

    #[test]
    fn final_modulation_puts_shift_first() -> Result<()> {
        let converted = convert_transformer(tiny_diffusers_transformer(), 1, 1)?;
        let rows = converted["final_layer.adaLN_modulation.1.weight"].to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 2.0);
        assert_eq!(rows[HIDDEN][0], 1.0);
        Ok(())
    }

    #[test]
    fn candle_layout_passes_through() -> Result<()> {
        let mut ts = Tensors::new();
        put_linear(&mut ts, "img_in", HIDDEN, IN_CHANNELS);
        let converted = convert_transformer(ts, 19, 38)?;
        assert!(converted.contains_key("img_in.weight"));

        assert!(convert_transformer(Tensors::new(), 1, 1).is_err());
        Ok(())
    }

    #[test]
    fn missing_block_tensors_are_reported() {
        let mut ts = tiny_diffusers_transformer();
        ts.remove("transformer_blocks.0.attn.to_k.weight");
        let err = convert_transformer(ts, 1, 1).unwrap_err();
        assert!(err.to_string().contains("transformer_blocks.0.attn.to_k.weight"));
    }

    #[test]
    fn vae_names_follow_the_autoencoder() -> Result<()> {
        let cases = [
            ("encoder.conv_in.weight", "encoder.conv_in.weight"),
            ("encoder.down_blocks.1.resnets.0.conv1.weight", "encoder.down.1.block.0.conv1.weight"),
            (
                "encoder.down_blocks.1.resnets.0.conv_shortcut.bias",
                "encoder.down.1.block.0.nin_shortcut.bias",
            ),
            ("encoder.down_blocks.0.downsamplers.0.conv.weight", "encoder.down.0.downsample.conv.weight"),
            ("encoder.mid_block.resnets.1.norm2.weight", "encoder.mid.block_2.norm2.weight"),
            ("encoder.mid_block.attentions.0.group_norm.bias", "encoder.mid.attn_1.norm.bias"),
            ("encoder.mid_block.attentions.0.to_q.weight", "encoder.mid.attn_1.q.weight"),
            ("decoder.mid_block.attentions.0.to_out.0.weight", "decoder.mid.attn_1.proj_out.weight"),
            ("decoder.up_blocks.0.resnets.2.conv2.weight", "decoder.up.3.block.2.conv2.weight"),
            ("decoder.up_blocks.3.resnets.0.conv_shortcut.weight", "decoder.up.0.block.0.nin_shortcut.weight"),
            ("decoder.up_blocks.1.upsamplers.0.conv.bias", "decoder.up.2.upsample.conv.bias"),
            ("decoder.conv_norm_out.weight", "decoder.norm_out.weight"),
        ];
        for (from, to) in cases {
            assert_eq!(vae_tensor_name(from, 4)?, to, "{from}");
        }
        assert!(vae_tensor_name("decoder.up_blocks.4.resnets.0.conv1.weight", 4).is_err());
        Ok(())
    }

    #[test]
    fn vae_attention_weights_become_1x1_convs() -> Result<()> {
        let mut ts = Tensors::new();
        ts.insert("decoder.mid_block.attentions.0.to_v.weight".into(), filled(0.0, &[32, 32]));
        ts.insert("decoder.mid_block.attentions.0.to_v.bias".into(), filled(0.0, &[32]));
        ts.insert("decoder.up_blocks.0.resnets.0.conv1.weight".into(), filled(0.0, &[32, 32, 3, 3]));
        ts.insert("quant_conv.weight".into(), filled(0.0, &[8, 8, 1, 1]));

        let converted = convert_vae(ts, 2)?;
        assert_eq!(converted["decoder.mid.attn_1.v.weight"].dims(), &[32, 32, 1, 1]);
        assert_eq!(converted["decoder.mid.attn_1.v.bias"].dims(), &[32]);
        assert!(converted.contains_key("decoder.up.1.block.0.conv1.weight"));
        assert!(!converted.contains_key("quant_conv.weight"));
        Ok(())
    }
}
