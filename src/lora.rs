//! LoRA adapter loading and weight merging.
//!
//! Adapters are merged into the base weights before the models are built:
//! `W' = W + strength * (alpha / rank) * (up @ down)`. Both kohya underscore
//! naming (`lora_unet_..._to_q.lora_down.weight`) and diffusers/peft dotted
//! naming (`unet....to_q.lora_A.weight`) are accepted.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};

/// Model component a LoRA block applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraTarget {
    Unet,
    TextEncoder,
    TextEncoder2,
}

/// A single low-rank weight pair.
pub struct LoraWeight {
    /// Down projection, `[rank, in_features]` (possibly with conv dims).
    pub down: Tensor,
    /// Up projection, `[out_features, rank]` (possibly with conv dims).
    pub up: Tensor,
    /// Scaling numerator, defaults to the rank when the file carries none.
    pub alpha: f64,
    pub rank: usize,
}

impl LoraWeight {
    /// Dense update `up @ down`, reshaped back to conv layout when needed.
    fn delta(&self) -> Result<Tensor> {
        let down_dims = self.down.dims().to_vec();
        let up_dims = self.up.dims().to_vec();
        let down2 = if down_dims.len() > 2 {
            self.down.flatten_from(1)?
        } else {
            self.down.clone()
        };
        let up2 = if up_dims.len() > 2 {
            self.up.flatten_from(1)?
        } else {
            self.up.clone()
        };
        let delta = up2
            .to_dtype(DType::F32)?
            .matmul(&down2.to_dtype(DType::F32)?)?;
        if down_dims.len() == 4 {
            // Conv LoRA: restore [out, in, kh, kw].
            let out = up_dims[0];
            Ok(delta.reshape((out, down_dims[1], down_dims[2], down_dims[3]))?)
        } else {
            Ok(delta)
        }
    }
}

/// All weight pairs of an adapter, grouped by target component and keyed by
/// the candle parameter path (without the trailing `.weight`).
pub struct LoraAdapter {
    blocks: HashMap<LoraTarget, HashMap<String, LoraWeight>>,
}

enum KeyKind {
    Down,
    Up,
    Alpha,
}

fn split_key(key: &str) -> Option<(String, KeyKind)> {
    if let Some(base) = key.strip_suffix(".alpha") {
        return Some((base.to_string(), KeyKind::Alpha));
    }
    for marker in [".lora_down.", ".lora_A."] {
        if let Some(pos) = key.find(marker) {
            return Some((key[..pos].to_string(), KeyKind::Down));
        }
    }
    for marker in [".lora_up.", ".lora_B."] {
        if let Some(pos) = key.find(marker) {
            return Some((key[..pos].to_string(), KeyKind::Up));
        }
    }
    None
}

fn classify_base(base: &str) -> Option<(LoraTarget, String)> {
    for (prefix, target, kohya) in [
        ("lora_unet_", LoraTarget::Unet, true),
        ("lora_te1_", LoraTarget::TextEncoder, true),
        ("lora_te2_", LoraTarget::TextEncoder2, true),
        ("lora_te_", LoraTarget::TextEncoder, true),
        ("unet.", LoraTarget::Unet, false),
        ("text_encoder_2.", LoraTarget::TextEncoder2, false),
        ("text_encoder.", LoraTarget::TextEncoder, false),
    ] {
        if let Some(rest) = base.strip_prefix(prefix) {
            let module = if kohya {
                normalize_kohya_module(rest)
            } else {
                rest.to_string()
            };
            return Some((target, module));
        }
    }
    None
}

/// Turn a kohya underscore module name into the candle parameter path, e.g.
/// `down_blocks_1_attentions_0_transformer_blocks_0_attn1_to_q`
/// -> `down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q`.
pub fn normalize_kohya_module(name: &str) -> String {
    // Underscores become dots, with block indices attached to their block name.
    let parts: Vec<&str> = name.split('_').collect();
    let mut pieces = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        if i + 1 < parts.len() && parts[i + 1].chars().all(|c| c.is_ascii_digit()) {
            pieces.push(format!("{}.{}", parts[i], parts[i + 1]));
            i += 2;
        } else {
            pieces.push(parts[i].to_string());
            i += 1;
        }
    }
    let mut dotted = pieces.join(".");

    // Compound names that keep their underscore in the diffusers layout.
    for (from, to) in [
        ("time.emb.proj", "time_emb_proj"),
        ("down.blocks", "down_blocks"),
        ("up.blocks", "up_blocks"),
        ("mid.block", "mid_block"),
        ("transformer.blocks", "transformer_blocks"),
        ("to.q", "to_q"),
        ("to.k", "to_k"),
        ("to.v", "to_v"),
        ("to.out", "to_out"),
        ("proj.in", "proj_in"),
        ("proj.out", "proj_out"),
        ("conv.shortcut", "conv_shortcut"),
        ("text.model", "text_model"),
        ("self.attn", "self_attn"),
        ("q.proj", "q_proj"),
        ("k.proj", "k_proj"),
        ("v.proj", "v_proj"),
        ("out.proj", "out_proj"),
        ("final.layer.norm", "final_layer_norm"),
    ] {
        dotted = dotted.replace(from, to);
    }
    dotted
}

impl LoraAdapter {
    /// Load an adapter from a safetensors file.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading LoRA adapter from {}", path.display());
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read LoRA file {}", path.display()))?;

        let mut downs: HashMap<(LoraTarget, String), Tensor> = HashMap::new();
        let mut ups: HashMap<(LoraTarget, String), Tensor> = HashMap::new();
        let mut alphas: HashMap<(LoraTarget, String), f64> = HashMap::new();

        for (key, tensor) in tensors {
            let Some((base, kind)) = split_key(&key) else {
                debug!("Skipping non-LoRA tensor {key}");
                continue;
            };
            let Some(slot) = classify_base(&base) else {
                warn!("Unrecognized LoRA key prefix: {key}");
                continue;
            };
            match kind {
                KeyKind::Down => {
                    downs.insert(slot, tensor);
                }
                KeyKind::Up => {
                    ups.insert(slot, tensor);
                }
                KeyKind::Alpha => {
                    let value = tensor
                        .to_dtype(DType::F32)?
                        .flatten_all()?
                        .to_vec1::<f32>()?;
                    if let Some(&alpha) = value.first() {
                        alphas.insert(slot, alpha as f64);
                    }
                }
            }
        }

        let mut blocks: HashMap<LoraTarget, HashMap<String, LoraWeight>> = HashMap::new();
        for ((target, module), down) in downs {
            let Some(up) = ups.remove(&(target, module.clone())) else {
                warn!("LoRA down tensor without matching up tensor: {module}");
                continue;
            };
            let rank = down.dims()[0];
            let alpha = alphas
                .get(&(target, module.clone()))
                .copied()
                .unwrap_or(rank as f64);
            blocks
                .entry(target)
                .or_default()
                .insert(module, LoraWeight { down, up, alpha, rank });
        }
        for (_, module) in ups.keys() {
            warn!("LoRA up tensor without matching down tensor: {module}");
        }

        let total: usize = blocks.values().map(|b| b.len()).sum();
        anyhow::ensure!(total > 0, "no LoRA weight pairs found in {}", path.display());
        info!(
            "Loaded {total} LoRA weight pairs ({} unet, {} te1, {} te2)",
            blocks.get(&LoraTarget::Unet).map_or(0, |b| b.len()),
            blocks.get(&LoraTarget::TextEncoder).map_or(0, |b| b.len()),
            blocks.get(&LoraTarget::TextEncoder2).map_or(0, |b| b.len()),
        );
        Ok(Self { blocks })
    }

    pub fn has_target(&self, target: LoraTarget) -> bool {
        self.blocks.get(&target).is_some_and(|b| !b.is_empty())
    }

    /// Merge this adapter's block for `target` into a base weight map.
    /// Returns the number of parameters updated. Pairs whose computed update
    /// does not match the base shape are skipped with a warning.
    pub fn merge_into(
        &self,
        target: LoraTarget,
        weights: &mut HashMap<String, Tensor>,
        strength: f64,
    ) -> Result<usize> {
        let Some(block) = self.blocks.get(&target) else {
            return Ok(0);
        };
        let mut merged = 0;
        for (module, pair) in block {
            let param = format!("{module}.weight");
            let Some(base) = weights.get(&param) else {
                warn!("LoRA targets unknown parameter {param}");
                continue;
            };
            let delta = pair.delta()?;
            if delta.dims() != base.dims() {
                warn!(
                    "LoRA shape mismatch for {param}: base {:?}, update {:?}",
                    base.dims(),
                    delta.dims()
                );
                continue;
            }
            let scale = strength * pair.alpha / pair.rank as f64;
            let dtype = base.dtype();
            let updated = (base.to_dtype(DType::F32)? + (delta * scale)?)?.to_dtype(dtype)?;
            weights.insert(param, updated);
            merged += 1;
        }
        debug!("Merged {merged}/{} LoRA pairs into {target:?}", block.len());
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_kohya_attention_keys() {
        assert_eq!(
            normalize_kohya_module(
                "down_blocks_1_attentions_0_transformer_blocks_0_attn1_to_q"
            ),
            "down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q"
        );
        assert_eq!(
            normalize_kohya_module(
                "up_blocks_0_attentions_2_transformer_blocks_1_attn2_to_out_0"
            ),
            "up_blocks.0.attentions.2.transformer_blocks.1.attn2.to_out.0"
        );
        assert_eq!(
            normalize_kohya_module("mid_block_attentions_0_proj_in"),
            "mid_block.attentions.0.proj_in"
        );
        assert_eq!(
            normalize_kohya_module(
                "down_blocks_2_attentions_1_transformer_blocks_3_ff_net_0_proj"
            ),
            "down_blocks.2.attentions.1.transformer_blocks.3.ff.net.0.proj"
        );
    }

    #[test]
    fn normalizes_kohya_text_encoder_keys() {
        assert_eq!(
            normalize_kohya_module("text_model_encoder_layers_11_self_attn_q_proj"),
            "text_model.encoder.layers.11.self_attn.q_proj"
        );
        assert_eq!(
            normalize_kohya_module("text_model_encoder_layers_0_mlp_fc1"),
            "text_model.encoder.layers.0.mlp.fc1"
        );
    }

    #[test]
    fn classifies_key_formats() {
        let (base, _) =
            split_key("lora_unet_mid_block_attentions_0_to_q.lora_down.weight").unwrap();
        let (target, module) = classify_base(&base).unwrap();
        assert_eq!(target, LoraTarget::Unet);
        assert_eq!(module, "mid_block.attentions.0.to_q");

        let (base, _) = split_key(
            "text_encoder_2.text_model.encoder.layers.3.self_attn.k_proj.lora_A.weight",
        )
        .unwrap();
        let (target, module) = classify_base(&base).unwrap();
        assert_eq!(target, LoraTarget::TextEncoder2);
        assert_eq!(module, "text_model.encoder.layers.3.self_attn.k_proj");

        assert!(split_key("unet.conv_in.weight").is_none());
    }

    #[test]
    fn merges_scaled_update_into_base() {
        let device = Device::Cpu;
        let module = "lora_unet_mid_block_attentions_0_transformer_blocks_0_attn1_to_q";
        let down = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        let up = Tensor::ones((4, 2), DType::F32, &device).unwrap();
        let alpha = Tensor::new(1.0f32, &device).unwrap();

        let mut file = HashMap::new();
        file.insert(format!("{module}.lora_down.weight"), down);
        file.insert(format!("{module}.lora_up.weight"), up);
        file.insert(format!("{module}.alpha"), alpha);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        candle_core::safetensors::save(&file, &path).unwrap();

        let adapter = LoraAdapter::load(&path, &device).unwrap();
        assert!(adapter.has_target(LoraTarget::Unet));
        assert!(!adapter.has_target(LoraTarget::TextEncoder));

        let param = "mid_block.attentions.0.transformer_blocks.0.attn1.to_q.weight";
        let mut base = HashMap::new();
        base.insert(
            param.to_string(),
            Tensor::zeros((4, 4), DType::F32, &device).unwrap(),
        );

        let merged = adapter
            .merge_into(LoraTarget::Unet, &mut base, 0.5)
            .unwrap();
        assert_eq!(merged, 1);

        // up @ down of all-ones is 2 everywhere; 0.5 * (1/2) * 2 = 0.5.
        let values: Vec<f32> = base[param].flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn skips_mismatched_shapes() {
        let device = Device::Cpu;
        let module = "lora_unet_mid_block_attentions_0_to_q";
        let mut file = HashMap::new();
        file.insert(
            format!("{module}.lora_down.weight"),
            Tensor::ones((2, 4), DType::F32, &device).unwrap(),
        );
        file.insert(
            format!("{module}.lora_up.weight"),
            Tensor::ones((4, 2), DType::F32, &device).unwrap(),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        candle_core::safetensors::save(&file, &path).unwrap();
        let adapter = LoraAdapter::load(&path, &device).unwrap();

        let mut base = HashMap::new();
        base.insert(
            "mid_block.attentions.0.to_q.weight".to_string(),
            Tensor::zeros((8, 8), DType::F32, &device).unwrap(),
        );
        let merged = adapter
            .merge_into(LoraTarget::Unet, &mut base, 1.0)
            .unwrap();
        assert_eq!(merged, 0);
    }
}
