#![allow(clippy::cast_precision_loss)]

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

use crate::layers::{self, WeightInit};

/// Sinusoidal embedding of scalar values, `[cos, sin]` halves, max period
/// 10000. Odd `dim` is zero-padded by one column. Always returns f32.
pub fn timestep_embedding(t: &Tensor, dim: usize) -> Result<Tensor> {
    const MAX_PERIOD: f64 = 10000.;
    let dev = t.device();
    let half = dim / 2;
    let freqs = frequencies(half, MAX_PERIOD, dev)?;
    let args = t
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, dev)?;
        Tensor::cat(&[emb, pad], D::Minus1)
    } else {
        Ok(emb)
    }
}

fn frequencies(half: usize, max_period: f64, dev: &Device) -> Result<Tensor> {
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    (arange * (-max_period.ln() / half as f64))?.exp()
}

/// Timestep -> conditioning width: sinusoidal features then
/// `Linear -> SiLU -> Linear`.
#[derive(Debug, Clone)]
pub struct TimestepEmbedder {
    linear_1: Linear,
    linear_2: Linear,
    frequency_embedding_size: usize,
}

impl TimestepEmbedder {
    pub fn new(hidden_size: usize, frequency_embedding_size: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("mlp");
        let linear_1 = layers::linear(
            frequency_embedding_size,
            hidden_size,
            WeightInit::Normal(0.02),
            vb.pp(0),
        )?;
        let linear_2 = layers::linear(hidden_size, hidden_size, WeightInit::Normal(0.02), vb.pp(2))?;
        Ok(Self {
            linear_1,
            linear_2,
            frequency_embedding_size,
        })
    }
}

impl Module for TimestepEmbedder {
    fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let dtype = self.linear_1.weight().dtype();
        timestep_embedding(t, self.frequency_embedding_size)?
            .to_dtype(dtype)?
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)
    }
}

/// Strided-conv patch embedding: `(B, C, H, W) -> (B, (H/p)(W/p), hidden)`.
#[derive(Debug, Clone)]
pub struct PatchEmbed {
    proj: Conv2d,
    patch_size: usize,
}

impl PatchEmbed {
    pub fn new(
        patch_size: usize,
        in_channels: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: patch_size,
            ..Default::default()
        };
        let proj = layers::conv2d(
            in_channels,
            hidden_size,
            patch_size,
            cfg,
            WeightInit::XavierUniform,
            vb.pp("proj"),
        )?;
        Ok(Self { proj, patch_size })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        if h % self.patch_size != 0 || w % self.patch_size != 0 {
            candle_core::bail!(
                "spatial size {h}x{w} is not divisible by patch size {}",
                self.patch_size
            )
        }
        xs.apply(&self.proj)?.flatten_from(2)?.transpose(1, 2)
    }
}

/// Attention pooling of a token sequence into one vector: a mean token is
/// prepended and used as the only query.
#[derive(Debug, Clone)]
pub struct AttentionPool {
    positional_embedding: Tensor,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    c_proj: Linear,
    num_heads: usize,
}

impl AttentionPool {
    pub fn new(
        spacial_dim: usize,
        embed_dim: usize,
        num_heads: usize,
        output_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let positional_embedding = vb.get_with_hints(
            (spacial_dim + 1, embed_dim),
            "positional_embedding",
            Init::Randn {
                mean: 0.,
                stdev: 1. / (embed_dim as f64).sqrt(),
            },
        )?;
        let q_proj = layers::linear(embed_dim, embed_dim, WeightInit::XavierUniform, vb.pp("q_proj"))?;
        let k_proj = layers::linear(embed_dim, embed_dim, WeightInit::XavierUniform, vb.pp("k_proj"))?;
        let v_proj = layers::linear(embed_dim, embed_dim, WeightInit::XavierUniform, vb.pp("v_proj"))?;
        let c_proj = layers::linear(embed_dim, output_dim, WeightInit::XavierUniform, vb.pp("c_proj"))?;
        Ok(Self {
            positional_embedding,
            q_proj,
            k_proj,
            v_proj,
            c_proj,
            num_heads,
        })
    }
}

impl Module for AttentionPool {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, l, c) = xs.dims3()?;
        if l + 1 != self.positional_embedding.dim(0)? {
            candle_core::bail!(
                "attention pool expects {} tokens, got {l}",
                self.positional_embedding.dim(0)? - 1
            )
        }
        let head_dim = c / self.num_heads;
        let xs = Tensor::cat(&[&xs.mean_keepdim(1)?, xs], 1)?;
        let xs = xs.broadcast_add(&self.positional_embedding.to_dtype(xs.dtype())?.unsqueeze(0)?)?;

        let q = (xs.narrow(1, 0, 1)?.contiguous()?.apply(&self.q_proj)? * (head_dim as f64).powf(-0.5))?;
        let k = xs.apply(&self.k_proj)?;
        let v = xs.apply(&self.v_proj)?;
        let q = q.reshape((b, 1, self.num_heads, head_dim))?.transpose(1, 2)?;
        let k = k.reshape((b, l + 1, self.num_heads, head_dim))?.transpose(1, 2)?;
        let v = v.reshape((b, l + 1, self.num_heads, head_dim))?.transpose(1, 2)?;
        let out = layers::scaled_dot_product_attention(&q, &k, &v)?;
        out.transpose(1, 2)?
            .reshape((b, c))?
            .apply(&self.c_proj)
    }
}
