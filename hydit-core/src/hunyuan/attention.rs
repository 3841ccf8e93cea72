use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::rope::RopeEmbedding;
use crate::layers::{self, WeightInit};

const QK_NORM_EPS: f64 = 1e-6;

fn qk_norms(
    qk_norm: bool,
    head_dim: usize,
    vb: &VarBuilder,
) -> Result<(Option<LayerNorm>, Option<LayerNorm>)> {
    if !qk_norm {
        return Ok((None, None));
    }
    Ok((
        Some(layers::layer_norm(head_dim, QK_NORM_EPS, vb.pp("q_norm"))?),
        Some(layers::layer_norm(head_dim, QK_NORM_EPS, vb.pp("k_norm"))?),
    ))
}

fn apply_norm(xs: Tensor, norm: Option<&LayerNorm>) -> Result<Tensor> {
    match norm {
        Some(norm) => norm.forward(&xs),
        None => Ok(xs),
    }
}

/// `(B, L, H, D)` heads out of a fused projection at slot `idx` along axis 2.
fn take_heads(xs: &Tensor, idx: usize) -> Result<Tensor> {
    xs.narrow(2, idx, 1)?.squeeze(2)
}

/// Image self-attention with a fused `Wqkv` projection. RoPE rotates both
/// queries and keys.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    wqkv: Linear,
    q_norm: Option<LayerNorm>,
    k_norm: Option<LayerNorm>,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new(dim: usize, num_heads: usize, qk_norm: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let wqkv = layers::linear(dim, dim * 3, WeightInit::XavierUniform, vb.pp("Wqkv"))?;
        let (q_norm, k_norm) = qk_norms(qk_norm, head_dim, &vb)?;
        let out_proj = layers::linear(dim, dim, WeightInit::XavierUniform, vb.pp("out_proj"))?;
        Ok(Self {
            wqkv,
            q_norm,
            k_norm,
            out_proj,
            num_heads,
            head_dim,
        })
    }

    pub fn forward(&self, xs: &Tensor, rope: &RopeEmbedding) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = xs
            .apply(&self.wqkv)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?;
        let q = apply_norm(take_heads(&qkv, 0)?, self.q_norm.as_ref())?.transpose(1, 2)?;
        let k = apply_norm(take_heads(&qkv, 1)?, self.k_norm.as_ref())?.transpose(1, 2)?;
        let v = take_heads(&qkv, 2)?.transpose(1, 2)?;

        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;
        let q = (q * (self.head_dim as f64).powf(-0.5))?;

        layers::scaled_dot_product_attention(&q, &k, &v)?
            .transpose(1, 2)?
            .reshape((b, n, c))?
            .apply(&self.out_proj)
    }
}

/// Image-to-text cross-attention. Only the image queries are rotated; there
/// is no attention mask, padded text positions carry the learned padding
/// embedding instead.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    q_proj: Linear,
    kv_proj: Linear,
    q_norm: Option<LayerNorm>,
    k_norm: Option<LayerNorm>,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl CrossAttention {
    pub fn new(
        qdim: usize,
        kdim: usize,
        num_heads: usize,
        qk_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = qdim / num_heads;
        let q_proj = layers::linear(qdim, qdim, WeightInit::XavierUniform, vb.pp("q_proj"))?;
        let kv_proj = layers::linear(kdim, qdim * 2, WeightInit::XavierUniform, vb.pp("kv_proj"))?;
        let (q_norm, k_norm) = qk_norms(qk_norm, head_dim, &vb)?;
        let out_proj = layers::linear(qdim, qdim, WeightInit::XavierUniform, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            kv_proj,
            q_norm,
            k_norm,
            out_proj,
            num_heads,
            head_dim,
        })
    }

    /// `xs: (B, S1, qdim)` attends to `context: (B, S2, kdim)`.
    pub fn forward(&self, xs: &Tensor, context: &Tensor, rope: &RopeEmbedding) -> Result<Tensor> {
        let (b, s1, c) = xs.dims3()?;
        let (_, s2, _) = context.dims3()?;
        let q = xs
            .apply(&self.q_proj)?
            .reshape((b, s1, self.num_heads, self.head_dim))?;
        let kv = context
            .apply(&self.kv_proj)?
            .reshape((b, s2, 2, self.num_heads, self.head_dim))?;

        let q = apply_norm(q, self.q_norm.as_ref())?.transpose(1, 2)?;
        let k = apply_norm(take_heads(&kv, 0)?, self.k_norm.as_ref())?.transpose(1, 2)?;
        let v = take_heads(&kv, 1)?.transpose(1, 2)?;

        let q = rope.apply(&q)?;
        let q = (q * (self.head_dim as f64).powf(-0.5))?;

        layers::scaled_dot_product_attention(&q, &k, &v)?
            .transpose(1, 2)?
            .reshape((b, s1, c))?
            .apply(&self.out_proj)
    }
}
