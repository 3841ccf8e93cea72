#![allow(clippy::cast_precision_loss)]

use std::str::FromStr;

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, Init, LayerNorm, Linear, VarBuilder};

use crate::error::{Error, Result as CrateResult};

/// How a freshly created parameter is initialised when the `VarBuilder` is
/// backed by a `VarMap`. Ignored when loading from safetensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightInit {
    XavierUniform,
    Normal(f64),
    Const(f64),
}

impl WeightInit {
    pub const ZEROS: Self = Self::Const(0.);

    fn hint(self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            Self::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            Self::Normal(stdev) => Init::Randn { mean: 0., stdev },
            Self::Const(v) => Init::Const(v),
        }
    }
}

/// Linear layer with bias. The bias always starts at zero.
pub fn linear(in_dim: usize, out_dim: usize, init: WeightInit, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init.hint(in_dim, out_dim))?;
    let bs = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Affine layer norm (weight starts at one, bias at zero).
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Layer norm without learned parameters; nothing is read from `vb`.
pub fn layer_norm_no_affine(size: usize, eps: f64, vb: &VarBuilder) -> Result<LayerNorm> {
    let ws = Tensor::ones(size, vb.dtype(), vb.device())?;
    Ok(LayerNorm::new_no_bias(ws, eps))
}

/// Square-kernel conv2d with bias. Xavier is computed over the flattened
/// kernel, the way the patch embedding is initialised for a linear layer.
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    init: WeightInit,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let fan_in = in_channels / cfg.groups * kernel_size * kernel_size;
    let ws = vb.get_with_hints(
        (
            out_channels,
            in_channels / cfg.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        init.hint(fan_in, out_channels),
    )?;
    let bs = vb.get_with_hints(out_channels, "bias", Init::Const(0.))?;
    Ok(Conv2d::new(ws, Some(bs), cfg))
}

pub fn embedding(
    in_size: usize,
    out_size: usize,
    init: WeightInit,
    vb: VarBuilder,
) -> Result<Embedding> {
    let embeddings = vb.get_with_hints((in_size, out_size), "weight", init.hint(in_size, out_size))?;
    Ok(Embedding::new(embeddings, out_size))
}

/// SiLU evaluated in f32 and cast back to the input dtype.
pub fn fp32_silu(xs: &Tensor) -> Result<Tensor> {
    xs.to_dtype(DType::F32)?.silu()?.to_dtype(xs.dtype())
}

/// adaLN modulation: `x * (1 + scale) + shift`, with `shift`/`scale` of shape
/// `(B, D)` broadcast over the sequence axis of `x: (B, L, D)`.
pub fn modulate(xs: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
        .broadcast_add(&shift.unsqueeze(1)?)
}

/// LayerNorm computed in f32 regardless of the activation dtype.
#[derive(Debug, Clone)]
pub struct Fp32LayerNorm {
    inner: LayerNorm,
}

impl Fp32LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .get_with_hints(size, "weight", Init::Const(1.))?
            .to_dtype(DType::F32)?;
        let bias = vb
            .get_with_hints(size, "bias", Init::Const(0.))?
            .to_dtype(DType::F32)?;
        Ok(Self {
            inner: LayerNorm::new(weight, bias, eps),
        })
    }
}

impl Module for Fp32LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let initial_type = xs.dtype();
        xs.to_dtype(DType::F32)?
            .contiguous()?
            .apply(&self.inner)?
            .to_dtype(initial_type)
    }
}

/// RMSNorm computed in f32; the weight is applied after casting back.
#[derive(Debug, Clone)]
pub struct F32RmsNorm {
    w: Tensor,
    eps: f64,
}

impl F32RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w: vb.get_with_hints(size, "weight", Init::Const(1.))?,
            eps,
        })
    }
}

impl Module for F32RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let initial_type = xs.dtype();
        let mut xs = xs.to_dtype(DType::F32)?;
        let var = xs.sqr()?.mean_keepdim(D::Minus1)?;
        xs = xs.broadcast_mul(&(&var + self.eps)?.sqrt()?.recip()?)?;
        xs.to_dtype(initial_type)?.broadcast_mul(&self.w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    Layer,
    Rms,
}

impl FromStr for NormType {
    type Err = Error;

    fn from_str(s: &str) -> CrateResult<Self> {
        match s {
            "layer" => Ok(Self::Layer),
            "rms" => Ok(Self::Rms),
            other => Err(Error::Config(format!("unknown norm_type: {other}"))),
        }
    }
}

/// The block norm selected by `norm_type`.
#[derive(Debug, Clone)]
pub enum Norm {
    Layer(Fp32LayerNorm),
    Rms(F32RmsNorm),
}

impl Norm {
    pub fn new(kind: NormType, size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        match kind {
            NormType::Layer => Ok(Self::Layer(Fp32LayerNorm::new(size, eps, vb)?)),
            NormType::Rms => Ok(Self::Rms(F32RmsNorm::new(size, eps, vb)?)),
        }
    }
}

impl Module for Norm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(n) => n.forward(xs),
            Self::Rms(n) => n.forward(xs),
        }
    }
}

/// Two-layer feed-forward network with tanh-approximated GELU.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(in_sz: usize, hidden_sz: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(in_sz, hidden_sz, WeightInit::XavierUniform, vb.pp("fc1"))?;
        let fc2 = linear(hidden_sz, in_sz, WeightInit::XavierUniform, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.gelu()?.apply(&self.fc2)
    }
}

/// Softmax attention over `(B, H, Lq, D)` x `(B, H, Lk, D)`; `q` is expected to
/// be pre-scaled.
pub fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let attn_weights = q.contiguous()?.matmul(&k.t()?.contiguous()?)?;
    candle_nn::ops::softmax_last_dim(&attn_weights)?.matmul(&v.contiguous()?)
}
