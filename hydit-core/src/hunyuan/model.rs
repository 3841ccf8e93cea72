#![allow(clippy::cast_precision_loss)]

use std::{path::Path, sync::Arc};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use tracing::info;

use super::{
    block::{FinalLayer, HunYuanDiTBlock, SkipPlan},
    embeddings::{timestep_embedding, AttentionPool, PatchEmbed, TimestepEmbedder},
    patch::unpatchify,
    rope::RopeTable,
};
use crate::{
    config::{Config, IMAGE_META_FIELDS},
    error::{shape_bail, Error, Result},
    layers::{self, NormType, WeightInit},
    observer::{ForwardObserver, TracePoint, TracingObserver},
    resolution::ResolutionGroup,
    DEBUG,
};

/// Output of the two text encoders for one batch.
///
/// Masks are `(B, L)` with 1 for real tokens and 0 for padding, in any dtype.
#[derive(Debug, Clone)]
pub struct TextEmbeddings {
    /// `(B, text_len, text_states_dim)`
    pub clip: Tensor,
    pub clip_mask: Tensor,
    /// `(B, text_len_t5, text_states_dim_t5)`
    pub t5: Tensor,
    pub t5_mask: Tensor,
}

impl TextEmbeddings {
    /// Stack two batches along the batch axis, `self` first.
    pub fn concat(&self, other: &Self) -> Result<Self> {
        let cat = |a: &Tensor, b: &Tensor| -> Result<Tensor> {
            let b = if b.dtype() == a.dtype() {
                b.clone()
            } else {
                b.to_dtype(a.dtype())?
            };
            Ok(Tensor::cat(&[a, &b], 0)?)
        };
        Ok(Self {
            clip: cat(&self.clip, &other.clip)?,
            clip_mask: cat(&self.clip_mask, &other.clip_mask)?,
            t5: cat(&self.t5, &other.t5)?,
            t5_mask: cat(&self.t5_mask, &other.t5_mask)?,
        })
    }
}

/// Conditional and unconditional text for classifier-free guidance.
#[derive(Debug, Clone)]
pub struct GuidedText {
    pub cond: TextEmbeddings,
    pub uncond: TextEmbeddings,
}

/// Nonzero entries become 1, as `u8`.
fn mask_to_u8(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.ne(&mask.zeros_like()?)?)
}

/// HunYuan-DiT: a diffusion transformer over latent image patches,
/// conditioned on timestep, bilingual text, image size and style.
#[derive(Clone)]
pub struct HunYuanDiT {
    x_embedder: PatchEmbed,
    t_embedder: TimestepEmbedder,
    extra_embedder_1: Linear,
    extra_embedder_2: Linear,
    mlp_t5_1: Linear,
    mlp_t5_2: Linear,
    text_embedding_padding: Tensor,
    pooler: AttentionPool,
    style_embedder: Embedding,
    blocks: Vec<HunYuanDiTBlock>,
    skip_plan: SkipPlan,
    final_layer: FinalLayer,
    rope_table: RopeTable,
    cfg: Config,
    dtype: DType,
    observer: Option<Arc<dyn ForwardObserver>>,
}

impl HunYuanDiT {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let norm_type: NormType = cfg.norm.parse()?;
        let skip_plan = SkipPlan::new(cfg.depth)?;
        let hidden = cfg.hidden_size;

        let x_embedder = PatchEmbed::new(
            cfg.patch_size,
            cfg.in_channels,
            hidden,
            vb.pp("x_embedder"),
        )?;
        let t_embedder =
            TimestepEmbedder::new(hidden, cfg.frequency_embedding_size, vb.pp("t_embedder"))?;

        let extra_vb = vb.pp("extra_embedder");
        let extra_embedder_1 = layers::linear(
            cfg.extra_in_dim(),
            hidden * 4,
            WeightInit::Normal(0.02),
            extra_vb.pp(0),
        )?;
        let extra_embedder_2 =
            layers::linear(hidden * 4, hidden, WeightInit::Normal(0.02), extra_vb.pp(2))?;

        let t5_vb = vb.pp("mlp_t5");
        let t5_dim = cfg.text_states_dim_t5;
        let mlp_t5_1 = layers::linear(t5_dim, t5_dim * 4, WeightInit::XavierUniform, t5_vb.pp(0))?;
        let mlp_t5_2 = layers::linear(
            t5_dim * 4,
            cfg.text_states_dim,
            WeightInit::XavierUniform,
            t5_vb.pp(2),
        )?;
        let text_embedding_padding = vb.get_with_hints(
            (cfg.text_seq_len(), cfg.text_states_dim),
            "text_embedding_padding",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        let pooler = AttentionPool::new(
            cfg.text_len_t5,
            t5_dim,
            cfg.pooler_heads,
            cfg.pooler_out_dim,
            vb.pp("pooler"),
        )?;
        let style_embedder =
            layers::embedding(1, hidden, WeightInit::Normal(1.), vb.pp("style_embedder"))?;

        let blocks_vb = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(cfg.depth);
        for (i, step) in skip_plan.steps().iter().enumerate() {
            blocks.push(HunYuanDiTBlock::new(
                cfg,
                norm_type,
                step.has_skip_input,
                blocks_vb.pp(i),
            )?);
        }
        let final_layer = FinalLayer::new(
            hidden,
            cfg.patch_size,
            cfg.out_channels(),
            vb.pp("final_layer"),
        )?;
        let rope_table = RopeTable::new(cfg, &ResolutionGroup::new(), vb.device())?;

        info!(
            "HunYuan-DiT: {} blocks, hidden size {}, {} heads, `{}` norm, {} skip connections.",
            cfg.depth,
            hidden,
            cfg.num_heads,
            cfg.norm,
            skip_plan.producers()
        );
        let observer: Option<Arc<dyn ForwardObserver>> =
            if DEBUG.load(std::sync::atomic::Ordering::Relaxed) {
                Some(Arc::new(TracingObserver))
            } else {
                None
            };

        Ok(Self {
            x_embedder,
            t_embedder,
            extra_embedder_1,
            extra_embedder_2,
            mlp_t5_1,
            mlp_t5_2,
            text_embedding_padding,
            pooler,
            style_embedder,
            blocks,
            skip_plan,
            final_layer,
            rope_table,
            cfg: cfg.clone(),
            dtype: vb.dtype(),
            observer,
        })
    }

    /// Load weights from memory-mapped safetensors files.
    pub fn from_safetensors<P: AsRef<Path>>(
        cfg: &Config,
        paths: &[P],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!("Loading {} safetensors file(s).", paths.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        Self::new(cfg, vb)
    }

    pub fn with_observer(mut self, observer: Arc<dyn ForwardObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn skip_plan(&self) -> &SkipPlan {
        &self.skip_plan
    }

    pub fn rope_table(&self) -> &RopeTable {
        &self.rope_table
    }

    fn observe(&self, point: TracePoint, tensor: &Tensor) {
        if let Some(observer) = &self.observer {
            observer.observe(point, tensor);
        }
    }

    /// `cat([clip, mlp_t5(t5)])` with padded positions replaced by the learned
    /// padding rows. Returns `(B, text_len + text_len_t5, text_states_dim)`.
    pub fn build_text_states(&self, text: &TextEmbeddings) -> Result<Tensor> {
        let cfg = &self.cfg;
        let (b, clip_len, clip_dim) = text.clip.dims3()?;
        let (b_t5, t5_len, t5_dim) = text.t5.dims3()?;
        if b_t5 != b {
            shape_bail!("clip batch {b} and t5 batch {b_t5} differ");
        }
        if clip_dim != cfg.text_states_dim || t5_dim != cfg.text_states_dim_t5 {
            shape_bail!(
                "text widths ({clip_dim}, {t5_dim}) do not match the configured ({}, {})",
                cfg.text_states_dim,
                cfg.text_states_dim_t5
            );
        }
        let seq_len = self.text_embedding_padding.dim(0)?;
        if clip_len + t5_len != seq_len {
            shape_bail!(
                "text lengths {clip_len} + {t5_len} do not match the padding table of {seq_len}"
            );
        }
        if text.clip_mask.dims() != [b, clip_len] || text.t5_mask.dims() != [b, t5_len] {
            shape_bail!(
                "masks {:?} and {:?} do not match the text states",
                text.clip_mask.dims(),
                text.t5_mask.dims()
            );
        }

        let t5 = text
            .t5
            .to_dtype(self.dtype)?
            .apply(&self.mlp_t5_1)?;
        let t5 = layers::fp32_silu(&t5)?.apply(&self.mlp_t5_2)?;
        let text_states = Tensor::cat(&[&text.clip.to_dtype(self.dtype)?, &t5], 1)?;

        let mask = Tensor::cat(
            &[&mask_to_u8(&text.clip_mask)?, &mask_to_u8(&text.t5_mask)?],
            1,
        )?;
        let shape = text_states.shape();
        let mask = mask.unsqueeze(2)?.broadcast_as(shape)?;
        let padding = self
            .text_embedding_padding
            .to_dtype(self.dtype)?
            .unsqueeze(0)?
            .broadcast_as(shape)?;
        Ok(mask.where_cond(&text_states, &padding)?)
    }

    /// `[size_cond_prefix, target_w, target_h, crop_offset]` for every sample.
    fn default_image_meta(
        &self,
        batch: usize,
        target_w: usize,
        target_h: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let [orig_w, orig_h] = self.cfg.size_cond_prefix;
        let [crop_top, crop_left] = self.cfg.crop_offset;
        let row = [orig_w, orig_h, target_w, target_h, crop_top, crop_left].map(|v| v as f32);
        let data: Vec<f32> = row.iter().copied().cycle().take(batch * IMAGE_META_FIELDS).collect();
        Ok(Tensor::from_vec(data, (batch, IMAGE_META_FIELDS), device)?)
    }

    /// One denoiser evaluation without guidance doubling.
    ///
    /// `x: (N, in_channels, H, W)` latents, `t: (N)` timesteps. `image_meta_size`
    /// is `(N, 6)` and `style` is `(N)` integer ids; both default from the
    /// config. Returns `(N, out_channels, H, W)`.
    pub fn forward_raw(
        &self,
        x: &Tensor,
        t: &Tensor,
        text: &TextEmbeddings,
        image_meta_size: Option<&Tensor>,
        style: Option<&Tensor>,
    ) -> Result<Tensor> {
        let cfg = &self.cfg;
        let device = x.device();
        let (b, c, height, width) = x.dims4()?;
        if c != cfg.in_channels {
            shape_bail!("expected {} latent channels, got {c}", cfg.in_channels);
        }
        let p = cfg.patch_size;
        if height % p != 0 || width % p != 0 {
            shape_bail!("latent size {height}x{width} is not divisible by patch size {p}");
        }
        if t.dims1()? != b {
            shape_bail!("{} timesteps for a batch of {b}", t.dims1()?);
        }
        if text.clip.dim(0)? != b {
            shape_bail!("text batch {} for a latent batch of {b}", text.clip.dim(0)?);
        }
        let (th, tw) = (height / p, width / p);

        let text_states = self.build_text_states(text)?;
        self.observe(TracePoint::TextStates, &text_states);

        let scale = cfg.vae_scale_factor;
        let target_h = height * scale / 16 * 16;
        let target_w = width * scale / 16 * 16;
        let rope = self.rope_table.get(target_h, target_w)?;
        if rope.seq_len()? != th * tw {
            shape_bail!(
                "rotary table for {target_h}x{target_w} covers {} positions, latent grid has {}",
                rope.seq_len()?,
                th * tw
            );
        }

        let t_emb = self.t_embedder.forward(t)?;
        self.observe(TracePoint::TimestepEmbedded, &t_emb);

        let pooled = text.t5.to_dtype(self.dtype)?.apply(&self.pooler)?;

        let image_meta = match image_meta_size {
            Some(meta) => {
                if meta.dims() != [b, IMAGE_META_FIELDS] {
                    shape_bail!(
                        "image meta must be ({b}, {IMAGE_META_FIELDS}), got {:?}",
                        meta.dims()
                    );
                }
                meta.clone()
            }
            None => self.default_image_meta(b, target_w, target_h, device)?,
        };
        let freq = cfg.frequency_embedding_size;
        let image_meta = timestep_embedding(&image_meta.flatten_all()?, freq)?
            .to_dtype(self.dtype)?
            .reshape((b, IMAGE_META_FIELDS * freq))?;

        let style = match style {
            Some(style) => {
                if style.dims1()? != b {
                    shape_bail!("{} style ids for a batch of {b}", style.dims1()?);
                }
                style.clone()
            }
            None => Tensor::zeros(b, DType::U32, device)?,
        };
        let style = self.style_embedder.forward(&style)?;

        let extra_vec = Tensor::cat(&[&pooled, &image_meta, &style], 1)?;
        self.observe(TracePoint::ExtraVector, &extra_vec);
        let extra = extra_vec.apply(&self.extra_embedder_1)?;
        let extra = layers::fp32_silu(&extra)?.apply(&self.extra_embedder_2)?;
        let c = (t_emb + extra)?;
        self.observe(TracePoint::Conditioning, &c);

        let mut xs = x.to_dtype(self.dtype)?.apply(&self.x_embedder)?;
        self.observe(TracePoint::PatchEmbedded, &xs);

        let mut skips = Vec::with_capacity(self.skip_plan.producers());
        for (layer, (block, step)) in self
            .blocks
            .iter()
            .zip(self.skip_plan.steps())
            .enumerate()
        {
            let skip = if step.has_skip_input {
                Some(skips.pop().ok_or(Error::SkipUnderflow { layer })?)
            } else {
                None
            };
            xs = block.forward(&xs, &c, &text_states, &rope, skip.as_ref())?;
            if step.produces_skip_output {
                skips.push(xs.clone());
            }
            self.observe(TracePoint::BlockOutput { layer }, &xs);
        }

        let xs = self.final_layer.forward(&xs, &c)?;
        self.observe(TracePoint::FinalLayer, &xs);
        unpatchify(&xs, th, tw, p, cfg.out_channels())
    }

    /// Guided denoiser evaluation: the batch is doubled with `cond` text on
    /// the first half and `uncond` on the second. Returns the conditional
    /// half `(B, in_channels, H, W)`.
    pub fn forward(&self, x: &Tensor, t: &Tensor, text: &GuidedText) -> Result<Tensor> {
        let b = x.dim(0)?;
        let x = x.repeat((2, 1, 1, 1))?;
        let t = t.repeat(2)?;
        let text = text.cond.concat(&text.uncond)?;
        let out = self.forward_raw(&x, &t, &text, None, None)?;
        Ok(out.narrow(0, 0, b)?.narrow(1, 0, self.cfg.in_channels)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    use super::*;

    fn tiny_cfg() -> Config {
        Config {
            hidden_size: 32,
            depth: 4,
            num_heads: 4,
            text_states_dim: 16,
            text_states_dim_t5: 24,
            text_len: 3,
            text_len_t5: 5,
            pooler_out_dim: 8,
            frequency_embedding_size: 8,
            ..Default::default()
        }
    }

    fn text(cfg: &Config, b: usize, dev: &Device) -> Result<TextEmbeddings> {
        Ok(TextEmbeddings {
            clip: Tensor::randn(0f32, 1., (b, cfg.text_len, cfg.text_states_dim), dev)?,
            clip_mask: Tensor::ones((b, cfg.text_len), DType::U8, dev)?,
            t5: Tensor::randn(0f32, 1., (b, cfg.text_len_t5, cfg.text_states_dim_t5), dev)?,
            t5_mask: Tensor::ones((b, cfg.text_len_t5), DType::F32, dev)?,
        })
    }

    #[test]
    fn padded_positions_take_the_learned_padding() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let mut text = text(&cfg, 1, &dev)?;
        text.clip_mask = Tensor::new(&[[1u8, 1, 0]], &dev)?;

        let states = model.build_text_states(&text)?;
        assert_eq!(states.dims(), &[1, 8, 16]);
        let padding = model.text_embedding_padding.i(2)?;
        let diff = (states.i((0, 2))? - &padding)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        let kept = (states.i((0, 1))? - text.clip.i((0, 1))?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(kept, 0.);
        Ok(())
    }

    #[test]
    fn wrong_text_length_is_shape_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let mut text = text(&cfg, 1, &dev)?;
        text.clip = Tensor::zeros((1, 4, 16), DType::F32, &dev)?;
        text.clip_mask = Tensor::ones((1, 4), DType::U8, &dev)?;
        assert!(matches!(
            model.build_text_states(&text),
            Err(Error::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn default_meta_row_uses_config() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = Config {
            crop_offset: [3, 4],
            ..tiny_cfg()
        };
        let varmap = VarMap::new();
        let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let meta = model.default_image_meta(2, 128, 96, &dev)?;
        assert_eq!(meta.dims(), &[2, 6]);
        let row: Vec<f32> = meta.i(1)?.to_vec1()?;
        assert_eq!(row, vec![1024., 1024., 128., 96., 3., 4.]);
        Ok(())
    }

    fn rms(data: &std::collections::HashMap<String, candle_core::Var>, name: &str) -> f32 {
        data.get(name)
            .unwrap()
            .as_tensor()
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
            .sqrt()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn fresh_parameters_follow_initialisation_rules() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let _model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let data = varmap.data().lock().unwrap();

        // N(0, 1): 8 x 16 padding rows and a 32-wide style row
        let padding = rms(&data, "text_embedding_padding");
        assert!((0.7..1.3).contains(&padding), "{padding}");
        let style = rms(&data, "style_embedder.weight");
        assert!((0.5..1.5).contains(&style), "{style}");

        // N(0, 1/sqrt(C)) with C = 24
        let expected = 1. / 24f32.sqrt();
        let pos = rms(&data, "pooler.positional_embedding");
        assert!((pos - expected).abs() < 0.3 * expected, "{pos} vs {expected}");

        let extra = rms(&data, "extra_embedder.0.weight");
        assert!((extra - 0.02).abs() < 0.005, "{extra}");

        for layer in 0..cfg.depth {
            for param in ["weight", "bias"] {
                let name = format!("blocks.{layer}.default_modulation.1.{param}");
                assert_eq!(rms(&data, &name), 0., "{name}");
            }
        }
        for name in [
            "final_layer.linear.weight",
            "final_layer.adaLN_modulation.1.bias",
        ] {
            assert_eq!(rms(&data, name), 0., "{name}");
        }
        Ok(())
    }

    #[test]
    fn checkpoint_names_are_registered() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let _model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let data = varmap.data().lock().unwrap();
        for name in [
            "x_embedder.proj.weight",
            "t_embedder.mlp.2.bias",
            "extra_embedder.0.weight",
            "mlp_t5.2.weight",
            "text_embedding_padding",
            "pooler.positional_embedding",
            "pooler.c_proj.weight",
            "style_embedder.weight",
            "blocks.0.attn1.Wqkv.weight",
            "blocks.3.skip_linear.weight",
            "final_layer.adaLN_modulation.1.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        // depth 4: only block 3 consumes a skip
        assert!(!data.contains_key("blocks.2.skip_norm.weight"));
        Ok(())
    }
}
