//! 2D rotary position embeddings for the image token grid.
//!
//! The grid is first fitted into a square `base_size` canvas (resize to fill,
//! then centre crop), so every aspect-ratio bucket shares the same position
//! range as the base resolution.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]

use candle_core::{DType, Device, Result, Tensor, D};
use indexmap::IndexMap;
use tracing::debug;

use crate::{
    config::Config,
    resolution::{Resolution, ResolutionGroup},
};

/// Cosine and sine tables, each `(th * tw, head_dim)`.
#[derive(Debug, Clone)]
pub struct RopeEmbedding {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl RopeEmbedding {
    pub fn seq_len(&self) -> Result<usize> {
        self.cos.dim(0)
    }

    /// Rotate `x: (B, H, L, D)` by the tables. Computed in f32 and cast back.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let (_b, _h, seq_len, _d) = x.dims4()?;
        if seq_len != self.seq_len()? {
            candle_core::bail!(
                "rotary table covers {} positions but the sequence has {seq_len}",
                self.seq_len()?
            )
        }
        let cos = self.cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.unsqueeze(0)?.unsqueeze(0)?;
        let rotated = rotate_half(&x)?;
        (x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?.to_dtype(dtype)
    }
}

/// `(x0, x1, x2, x3, ...) -> (-x1, x0, -x3, x2, ...)` over the last axis.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let (b, h, l, d) = x.dims4()?;
    let x = x.reshape((b, h, l, d / 2, 2))?;
    let x_real = x.narrow(D::Minus1, 0, 1)?;
    let x_imag = x.narrow(D::Minus1, 1, 1)?;
    Tensor::cat(&[&x_imag.neg()?, &x_real], D::Minus1)?.reshape(dims)
}

/// Fit `src` into a square `tgt` canvas keeping its aspect ratio, returning
/// the `(top, left)` and `(bottom, right)` corners of the centred crop.
pub fn get_fill_resize_and_crop(
    src: (usize, usize),
    tgt: usize,
) -> ((usize, usize), (usize, usize)) {
    let (th, tw) = (tgt as f64, tgt as f64);
    let (h, w) = (src.0 as f64, src.1 as f64);
    let tr = th / tw;
    let r = h / w;
    let (resize_height, resize_width) = if r > tr {
        (th, (th / h * w).round_ties_even())
    } else {
        ((tw / w * h).round_ties_even(), tw)
    };
    let crop_top = ((th - resize_height) / 2.0).round_ties_even();
    let crop_left = ((tw - resize_width) / 2.0).round_ties_even();
    (
        (crop_top as usize, crop_left as usize),
        (
            (crop_top + resize_height) as usize,
            (crop_left + resize_width) as usize,
        ),
    )
}

/// `num` evenly spaced points in `[start, stop)`.
fn linspace(start: usize, stop: usize, num: usize) -> Vec<f32> {
    let step = (stop as f64 - start as f64) / num as f64;
    (0..num)
        .map(|i| (start as f64 + i as f64 * step) as f32)
        .collect()
}

/// 1D rotary embedding for `pos`; each frequency is repeated twice so it
/// covers one (real, imag) pair. Returns row-major `(pos.len(), dim)` cos/sin.
fn rotary_1d(dim: usize, pos: &[f32], theta: f64) -> (Vec<f32>, Vec<f32>) {
    let freqs: Vec<f64> = (0..dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f64 / dim as f64))
        .collect();
    let mut cos = Vec::with_capacity(pos.len() * dim);
    let mut sin = Vec::with_capacity(pos.len() * dim);
    for &p in pos {
        for &f in &freqs {
            let angle = (p as f64 * f) as f32;
            let (s, c) = angle.sin_cos();
            cos.extend([c, c]);
            sin.extend([s, s]);
        }
    }
    (cos, sin)
}

/// Rotary tables for a `grid = (th, tw)` patch grid whose positions span
/// `[start, stop)`. The first half of `head_dim` encodes the column position,
/// the second half the row position.
pub fn get_2d_rotary_pos_embed(
    head_dim: usize,
    start: (usize, usize),
    stop: (usize, usize),
    grid: (usize, usize),
    theta: f64,
    device: &Device,
) -> Result<RopeEmbedding> {
    if head_dim % 4 != 0 {
        candle_core::bail!("head_dim {head_dim} must be a multiple of 4")
    }
    let (th, tw) = grid;
    let rows = linspace(start.0, stop.0, th);
    let cols = linspace(start.1, stop.1, tw);
    let mut col_pos = Vec::with_capacity(th * tw);
    let mut row_pos = Vec::with_capacity(th * tw);
    for &r in &rows {
        for &c in &cols {
            col_pos.push(c);
            row_pos.push(r);
        }
    }
    let half = head_dim / 2;
    let (cos_w, sin_w) = rotary_1d(half, &col_pos, theta);
    let (cos_h, sin_h) = rotary_1d(half, &row_pos, theta);

    let n = th * tw;
    let mut cos = Vec::with_capacity(n * head_dim);
    let mut sin = Vec::with_capacity(n * head_dim);
    for i in 0..n {
        cos.extend_from_slice(&cos_w[i * half..(i + 1) * half]);
        cos.extend_from_slice(&cos_h[i * half..(i + 1) * half]);
        sin.extend_from_slice(&sin_w[i * half..(i + 1) * half]);
        sin.extend_from_slice(&sin_h[i * half..(i + 1) * half]);
    }
    Ok(RopeEmbedding {
        cos: Tensor::from_vec(cos, (n, head_dim), device)?,
        sin: Tensor::from_vec(sin, (n, head_dim), device)?,
    })
}

/// Rotary tables precomputed for the supported resolution buckets.
///
/// Keys are `HxW` in pixels. Lookups for other sizes are computed on demand
/// and not stored.
#[derive(Debug, Clone)]
pub struct RopeTable {
    head_dim: usize,
    patch_size: usize,
    vae_scale_factor: usize,
    base_size: usize,
    theta: f64,
    device: Device,
    tables: IndexMap<String, RopeEmbedding>,
}

impl RopeTable {
    pub fn new(cfg: &Config, resolutions: &ResolutionGroup, device: &Device) -> Result<Self> {
        let mut this = Self {
            head_dim: cfg.head_dim(),
            patch_size: cfg.patch_size,
            vae_scale_factor: cfg.vae_scale_factor,
            base_size: cfg.rope_base_size / cfg.vae_scale_factor / cfg.patch_size,
            theta: cfg.rope_theta,
            device: device.clone(),
            tables: IndexMap::with_capacity(resolutions.len()),
        };
        for reso in resolutions.iter() {
            let rope = this.calc_rope(reso.height, reso.width)?;
            this.tables.insert(reso.to_string(), rope);
        }
        Ok(this)
    }

    /// Compute the tables for a pixel-space `height x width` image.
    pub fn calc_rope(&self, height: usize, width: usize) -> Result<RopeEmbedding> {
        let th = height / self.vae_scale_factor / self.patch_size;
        let tw = width / self.vae_scale_factor / self.patch_size;
        let (start, stop) = get_fill_resize_and_crop((th, tw), self.base_size);
        get_2d_rotary_pos_embed(self.head_dim, start, stop, (th, tw), self.theta, &self.device)
    }

    /// Table lookup by `HxW` key with on-demand fallback.
    pub fn get(&self, height: usize, width: usize) -> Result<RopeEmbedding> {
        let key = Resolution::new(width, height).to_string();
        match self.tables.get(&key) {
            Some(rope) => Ok(rope.clone()),
            None => {
                debug!("No precomputed rotary table for {key}, computing on demand.");
                self.calc_rope(height, width)
            }
        }
    }

    pub fn contains(&self, height: usize, width: usize) -> bool {
        self.tables
            .contains_key(&Resolution::new(width, height).to_string())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}
