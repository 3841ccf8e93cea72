#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::{fmt::Display, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{config_bail, Error, Result},
    serde_default_fn,
};

serde_default_fn!(usize, patch_size, 2);
serde_default_fn!(usize, in_channels, 4);
serde_default_fn!(usize, hidden_size, 1152);
serde_default_fn!(usize, depth, 28);
serde_default_fn!(usize, num_heads, 16);
serde_default_fn!(f64, mlp_ratio, 4.0);
serde_default_fn!(bool, learn_sigma, true);
serde_default_fn!(usize, text_states_dim, 1024);
serde_default_fn!(usize, text_states_dim_t5, 2048);
serde_default_fn!(usize, text_len, 77);
serde_default_fn!(usize, text_len_t5, 256);
serde_default_fn!(String, norm, "layer".to_string());
serde_default_fn!(bool, qk_norm, true);
serde_default_fn!(usize, pooler_heads, 8);
serde_default_fn!(usize, pooler_out_dim, 1024);
serde_default_fn!(usize, frequency_embedding_size, 256);
serde_default_fn!([usize; 2], size_cond_prefix, [1024, 1024]);
serde_default_fn!([usize; 2], crop_offset, [0, 0]);
serde_default_fn!(usize, vae_scale_factor, 8);
serde_default_fn!(usize, rope_base_size, 512);
serde_default_fn!(f64, rope_theta, 10000.0);

/// Number of scalar fields in the image-meta condition:
/// original size (w, h), target size (w, h), crop offset (top, left).
pub const IMAGE_META_FIELDS: usize = 6;

/// HunYuan-DiT model configuration.
///
/// Every field has a default matching the released DiT-XL/2 checkpoint layout,
/// so an HF-style `config.json` only needs to list what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "patch_size")]
    pub patch_size: usize,
    #[serde(default = "in_channels")]
    pub in_channels: usize,
    #[serde(default = "hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "depth")]
    pub depth: usize,
    #[serde(default = "num_heads")]
    pub num_heads: usize,
    #[serde(default = "mlp_ratio")]
    pub mlp_ratio: f64,
    /// Predict a variance alongside the noise; doubles the output channels.
    #[serde(default = "learn_sigma")]
    pub learn_sigma: bool,
    /// Width of the CLIP text states and of the common text width.
    #[serde(default = "text_states_dim")]
    pub text_states_dim: usize,
    /// Width of the raw T5 text states before `mlp_t5`.
    #[serde(default = "text_states_dim_t5")]
    pub text_states_dim_t5: usize,
    #[serde(default = "text_len")]
    pub text_len: usize,
    #[serde(default = "text_len_t5")]
    pub text_len_t5: usize,
    /// `"layer"` or `"rms"`. Validated when the model is built.
    #[serde(default = "norm")]
    pub norm: String,
    #[serde(default = "qk_norm")]
    pub qk_norm: bool,
    #[serde(default = "pooler_heads")]
    pub pooler_heads: usize,
    #[serde(default = "pooler_out_dim")]
    pub pooler_out_dim: usize,
    #[serde(default = "frequency_embedding_size")]
    pub frequency_embedding_size: usize,
    /// Leading `(width, height)` of the image-meta condition.
    #[serde(default = "size_cond_prefix")]
    pub size_cond_prefix: [usize; 2],
    /// Trailing `(top, left)` crop offset of the image-meta condition.
    #[serde(default = "crop_offset")]
    pub crop_offset: [usize; 2],
    /// Pixel size per latent element.
    #[serde(default = "vae_scale_factor")]
    pub vae_scale_factor: usize,
    /// Pixel resolution the rotary grid is normalised against.
    #[serde(default = "rope_base_size")]
    pub rope_base_size: usize,
    #[serde(default = "rope_theta")]
    pub rope_theta: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            patch_size: patch_size(),
            in_channels: in_channels(),
            hidden_size: hidden_size(),
            depth: depth(),
            num_heads: num_heads(),
            mlp_ratio: mlp_ratio(),
            learn_sigma: learn_sigma(),
            text_states_dim: text_states_dim(),
            text_states_dim_t5: text_states_dim_t5(),
            text_len: text_len(),
            text_len_t5: text_len_t5(),
            norm: norm(),
            qk_norm: qk_norm(),
            pooler_heads: pooler_heads(),
            pooler_out_dim: pooler_out_dim(),
            frequency_embedding_size: frequency_embedding_size(),
            size_cond_prefix: size_cond_prefix(),
            crop_offset: crop_offset(),
            vae_scale_factor: vae_scale_factor(),
            rope_base_size: rope_base_size(),
            rope_theta: rope_theta(),
        }
    }
}

impl Config {
    pub fn from_preset(preset: DitPreset) -> Self {
        let (depth, hidden_size, patch_size, num_heads, mlp_ratio) = preset.dims();
        Self {
            depth,
            hidden_size,
            patch_size,
            num_heads,
            mlp_ratio,
            ..Default::default()
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read an HF-style `config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn out_channels(&self) -> usize {
        if self.learn_sigma {
            self.in_channels * 2
        } else {
            self.in_channels
        }
    }

    pub fn mlp_hidden(&self) -> usize {
        (self.hidden_size as f64 * self.mlp_ratio) as usize
    }

    /// Width of the concatenated pooled-text, image-meta and style vector.
    pub fn extra_in_dim(&self) -> usize {
        self.pooler_out_dim + IMAGE_META_FIELDS * self.frequency_embedding_size + self.hidden_size
    }

    /// Total text sequence length after CLIP and T5 states are concatenated.
    pub fn text_seq_len(&self) -> usize {
        self.text_len + self.text_len_t5
    }

    /// Checks the invariants the layers rely on. Called by the model
    /// constructor.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            config_bail!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size,
                self.num_heads
            );
        }
        if self.head_dim() % 4 != 0 {
            config_bail!(
                "head_dim {} must be a multiple of 4 for 2D rotary embeddings",
                self.head_dim()
            );
        }
        if self.pooler_heads == 0 || self.text_states_dim_t5 % self.pooler_heads != 0 {
            config_bail!(
                "text_states_dim_t5 {} is not divisible by pooler_heads {}",
                self.text_states_dim_t5,
                self.pooler_heads
            );
        }
        if self.patch_size == 0 || self.vae_scale_factor == 0 {
            config_bail!("patch_size and vae_scale_factor must be non-zero");
        }
        if self.rope_base_size / self.vae_scale_factor / self.patch_size == 0 {
            config_bail!(
                "rope_base_size {} is smaller than one patch",
                self.rope_base_size
            );
        }
        Ok(())
    }
}

/// Named model scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DitPreset {
    /// `DiT-g/2`
    G2,
    /// `DiT-XL/2`
    XL2,
    /// `DiT-L/2`
    L2,
    /// `DiT-B/2`
    B2,
}

impl DitPreset {
    pub const ALL: [DitPreset; 4] = [Self::G2, Self::XL2, Self::L2, Self::B2];

    /// `(depth, hidden_size, patch_size, num_heads, mlp_ratio)`
    fn dims(&self) -> (usize, usize, usize, usize, f64) {
        match self {
            Self::G2 => (40, 1408, 2, 16, 4.3637),
            Self::XL2 => (28, 1152, 2, 16, 4.0),
            Self::L2 => (24, 1024, 2, 16, 4.0),
            Self::B2 => (12, 768, 2, 12, 4.0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::G2 => "DiT-g/2",
            Self::XL2 => "DiT-XL/2",
            Self::L2 => "DiT-L/2",
            Self::B2 => "DiT-B/2",
        }
    }
}

impl Display for DitPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DitPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown preset `{s}`, expected one of DiT-g/2, DiT-XL/2, DiT-L/2, DiT-B/2"
                ))
            })
    }
}
