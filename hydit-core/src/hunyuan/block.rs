use candle_core::{Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::{
    attention::{CrossAttention, SelfAttention},
    rope::RopeEmbedding,
};
use crate::{
    config::Config,
    error::{config_bail, Result as CrateResult},
    layers::{self, Mlp, Norm, NormType, WeightInit},
};

const NORM_EPS: f64 = 1e-6;

/// Skip-connection role of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipStep {
    pub has_skip_input: bool,
    pub produces_skip_output: bool,
}

/// Long skip connections between the shallow and deep halves of the stack.
///
/// Block `i` pops a skip when `i > depth / 2` and pushes its output when
/// `i < depth / 2 - 1`; the middle blocks do neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipPlan {
    steps: Vec<SkipStep>,
}

impl SkipPlan {
    pub fn new(depth: usize) -> CrateResult<Self> {
        let half = depth / 2;
        let steps: Vec<_> = (0..depth)
            .map(|i| SkipStep {
                has_skip_input: i > half,
                produces_skip_output: i + 1 < half,
            })
            .collect();

        let mut pending = 0usize;
        for (layer, step) in steps.iter().enumerate() {
            if step.has_skip_input {
                if pending == 0 {
                    config_bail!("depth {depth}: block {layer} consumes a skip before one is produced");
                }
                pending -= 1;
            }
            if step.produces_skip_output {
                pending += 1;
            }
        }
        if pending != 0 {
            config_bail!(
                "depth {depth} gives an unbalanced skip plan ({} producers, {} consumers)",
                steps.iter().filter(|s| s.produces_skip_output).count(),
                steps.iter().filter(|s| s.has_skip_input).count()
            );
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[SkipStep] {
        &self.steps
    }

    pub fn producers(&self) -> usize {
        self.steps.iter().filter(|s| s.produces_skip_output).count()
    }

    pub fn consumers(&self) -> usize {
        self.steps.iter().filter(|s| s.has_skip_input).count()
    }
}

#[derive(Debug, Clone)]
struct Skip {
    norm: Norm,
    linear: Linear,
}

/// One transformer block: optional skip fusion, modulated self-attention,
/// text cross-attention and the feed-forward network.
#[derive(Debug, Clone)]
pub struct HunYuanDiTBlock {
    norm1: Norm,
    attn1: SelfAttention,
    norm2: Norm,
    norm3: Norm,
    attn2: CrossAttention,
    mlp: Mlp,
    default_modulation: Linear,
    skip: Option<Skip>,
}

impl HunYuanDiTBlock {
    pub fn new(cfg: &Config, norm_type: NormType, has_skip: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let norm1 = Norm::new(norm_type, hidden, NORM_EPS, vb.pp("norm1"))?;
        let attn1 = SelfAttention::new(hidden, cfg.num_heads, cfg.qk_norm, vb.pp("attn1"))?;
        let norm2 = Norm::new(norm_type, hidden, NORM_EPS, vb.pp("norm2"))?;
        let norm3 = Norm::new(norm_type, hidden, NORM_EPS, vb.pp("norm3"))?;
        let attn2 = CrossAttention::new(
            hidden,
            cfg.text_states_dim,
            cfg.num_heads,
            cfg.qk_norm,
            vb.pp("attn2"),
        )?;
        let mlp = Mlp::new(hidden, cfg.mlp_hidden(), vb.pp("mlp"))?;
        let default_modulation = layers::linear(
            hidden,
            hidden,
            WeightInit::ZEROS,
            vb.pp("default_modulation").pp(1),
        )?;
        let skip = if has_skip {
            Some(Skip {
                norm: Norm::new(norm_type, 2 * hidden, NORM_EPS, vb.pp("skip_norm"))?,
                linear: layers::linear(
                    2 * hidden,
                    hidden,
                    WeightInit::XavierUniform,
                    vb.pp("skip_linear"),
                )?,
            })
        } else {
            None
        };
        Ok(Self {
            norm1,
            attn1,
            norm2,
            norm3,
            attn2,
            mlp,
            default_modulation,
            skip,
        })
    }

    pub fn has_skip_input(&self) -> bool {
        self.skip.is_some()
    }

    /// `skip` must be given exactly when the block was built with a skip input.
    pub fn forward(
        &self,
        xs: &Tensor,
        c: &Tensor,
        text_states: &Tensor,
        rope: &RopeEmbedding,
        skip: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut xs = match (&self.skip, skip) {
            (Some(fuse), Some(skip)) => Tensor::cat(&[xs, skip], D::Minus1)?
                .apply(&fuse.norm)?
                .apply(&fuse.linear)?,
            (None, None) => xs.clone(),
            (Some(_), None) => candle_core::bail!("block expects a skip input"),
            (None, Some(_)) => candle_core::bail!("block does not take a skip input"),
        };

        let shift_msa = layers::fp32_silu(c)?
            .apply(&self.default_modulation)?
            .unsqueeze(1)?;
        let attn_in = xs.apply(&self.norm1)?.broadcast_add(&shift_msa)?;
        xs = (&xs + self.attn1.forward(&attn_in, rope)?)?;

        let cross_in = xs.apply(&self.norm3)?;
        xs = (&xs + self.attn2.forward(&cross_in, text_states, rope)?)?;

        let mlp_out = xs.apply(&self.norm2)?.apply(&self.mlp)?;
        xs + mlp_out
    }
}

/// adaLN-modulated head projecting tokens to `p * p * out_channels`.
#[derive(Debug, Clone)]
pub struct FinalLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl FinalLayer {
    pub fn new(
        hidden_size: usize,
        patch_size: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm_final = layers::layer_norm_no_affine(hidden_size, NORM_EPS, &vb)?;
        let linear = layers::linear(
            hidden_size,
            patch_size * patch_size * out_channels,
            WeightInit::ZEROS,
            vb.pp("linear"),
        )?;
        let ada_ln_modulation = layers::linear(
            hidden_size,
            2 * hidden_size,
            WeightInit::ZEROS,
            vb.pp("adaLN_modulation").pp(1),
        )?;
        Ok(Self {
            norm_final,
            linear,
            ada_ln_modulation,
        })
    }

    pub fn forward(&self, xs: &Tensor, c: &Tensor) -> Result<Tensor> {
        let chunks = layers::fp32_silu(c)?
            .apply(&self.ada_ln_modulation)?
            .chunk(2, D::Minus1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        let xs = layers::modulate(&xs.apply(&self.norm_final)?, shift, scale)?;
        xs.apply(&self.linear)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;
    use crate::{error::Error, hunyuan::rope::get_2d_rotary_pos_embed};

    #[test]
    fn preset_depths_are_balanced() {
        for (depth, expected) in [(12, 5), (24, 11), (28, 13), (40, 19)] {
            let plan = SkipPlan::new(depth).unwrap();
            assert_eq!(plan.producers(), expected);
            assert_eq!(plan.consumers(), expected);

            // replay the stack: never underflows, ends empty
            let mut stack = 0usize;
            for step in plan.steps() {
                if step.has_skip_input {
                    stack = stack.checked_sub(1).expect("skip underflow");
                }
                if step.produces_skip_output {
                    stack += 1;
                }
            }
            assert_eq!(stack, 0);
        }
    }

    #[test]
    fn middle_blocks_have_no_skips() {
        let plan = SkipPlan::new(28).unwrap();
        for i in [13, 14] {
            assert_eq!(
                plan.steps()[i],
                SkipStep {
                    has_skip_input: false,
                    produces_skip_output: false
                }
            );
        }
        assert!(plan.steps()[15].has_skip_input);
        assert!(plan.steps()[12].produces_skip_output);
    }

    #[test]
    fn odd_depth_is_rejected() {
        for depth in [3, 5, 7, 29] {
            assert!(matches!(SkipPlan::new(depth), Err(Error::Config(_))));
        }
        // too shallow for any skip
        assert_eq!(SkipPlan::new(2).unwrap().producers(), 0);
        assert_eq!(SkipPlan::new(1).unwrap().consumers(), 0);
    }

    fn tiny_cfg() -> Config {
        Config {
            hidden_size: 32,
            num_heads: 4,
            text_states_dim: 16,
            mlp_ratio: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn block_with_skip_fuses_input() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = tiny_cfg();
        let block = HunYuanDiTBlock::new(&cfg, NormType::Layer, true, vb.pp("blocks").pp(3))?;
        assert!(block.has_skip_input());

        let rope = get_2d_rotary_pos_embed(8, (0, 0), (2, 4), (2, 4), 10000., &dev)?;
        let xs = Tensor::randn(0f32, 1., (2, 8, 32), &dev)?;
        let c = Tensor::randn(0f32, 1., (2, 32), &dev)?;
        let text = Tensor::randn(0f32, 1., (2, 5, 16), &dev)?;
        let out = block.forward(&xs, &c, &text, &rope, Some(&xs))?;
        assert_eq!(out.dims(), &[2, 8, 32]);
        assert!(block.forward(&xs, &c, &text, &rope, None).is_err());

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("blocks.3.default_modulation.1.weight"));
        assert!(data.contains_key("blocks.3.skip_norm.weight"));
        assert!(data.contains_key("blocks.3.skip_linear.bias"));
        Ok(())
    }

    #[test]
    fn fresh_final_layer_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = FinalLayer::new(32, 2, 8, vb.pp("final_layer"))?;
        let xs = Tensor::randn(0f32, 1., (1, 6, 32), &dev)?;
        let c = Tensor::randn(0f32, 1., (1, 32), &dev)?;
        let out = layer.forward(&xs, &c)?;
        assert_eq!(out.dims(), &[1, 6, 2 * 2 * 8]);
        assert_eq!(out.abs()?.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }
}
