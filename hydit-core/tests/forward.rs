use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hydit_core::{
    Config, DitPreset, Error, ForwardObserver, GuidedText, HunYuanDiT, Result, TextEmbeddings,
    TracePoint,
};

/// Same depth, heads and mlp ratio as the preset with narrow layers.
fn scaled_down(preset: DitPreset) -> Config {
    let full = Config::from_preset(preset);
    Config {
        hidden_size: full.num_heads * 8,
        text_states_dim: 16,
        text_states_dim_t5: 24,
        text_len: 3,
        text_len_t5: 5,
        pooler_out_dim: 8,
        ..full
    }
}

fn text(cfg: &Config, b: usize, dev: &Device) -> Result<TextEmbeddings> {
    Ok(TextEmbeddings {
        clip: Tensor::randn(0f32, 1., (b, cfg.text_len, cfg.text_states_dim), dev)?,
        clip_mask: Tensor::ones((b, cfg.text_len), DType::U8, dev)?,
        t5: Tensor::randn(0f32, 1., (b, cfg.text_len_t5, cfg.text_states_dim_t5), dev)?,
        t5_mask: Tensor::ones((b, cfg.text_len_t5), DType::I64, dev)?,
    })
}

fn randomize(varmap: &VarMap, names: &[&str]) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    for name in names {
        let var = data.get(*name).unwrap();
        var.set(&Tensor::randn(0f32, 0.5, var.shape(), var.device())?)?;
    }
    Ok(())
}

fn max_abs(t: &Tensor) -> Result<f32> {
    Ok(t.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn scaled_down_presets_run_forward() -> Result<()> {
    let dev = Device::Cpu;
    for preset in DitPreset::ALL {
        let cfg = scaled_down(preset);
        let varmap = VarMap::new();
        let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        assert_eq!(model.skip_plan().steps().len(), cfg.depth);

        let x = Tensor::randn(0f32, 1., (1, 4, 16, 16), &dev)?;
        let t = Tensor::new(&[500f32], &dev)?;
        let guided = GuidedText {
            cond: text(&cfg, 1, &dev)?,
            uncond: text(&cfg, 1, &dev)?,
        };
        let out = model.forward(&x, &t, &guided)?;
        assert_eq!(out.dims(), &[1, 4, 16, 16], "{preset}");

        let raw = model.forward_raw(&x, &t, &guided.cond, None, None)?;
        assert_eq!(raw.dims(), &[1, 8, 16, 16], "{preset}");
    }
    Ok(())
}

#[test]
fn non_square_latent_uses_on_demand_rope() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 4,
        ..scaled_down(DitPreset::B2)
    };
    let varmap = VarMap::new();
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    assert!(!model.rope_table().contains(96, 128));

    let x = Tensor::randn(0f32, 1., (2, 4, 12, 16), &dev)?;
    let t = Tensor::new(&[10f32, 900.], &dev)?;
    let out = model.forward_raw(&x, &t, &text(&cfg, 2, &dev)?, None, None)?;
    assert_eq!(out.dims(), &[2, 8, 12, 16]);
    Ok(())
}

#[test]
fn guided_forward_returns_conditional_half() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 4,
        ..scaled_down(DitPreset::XL2)
    };
    let varmap = VarMap::new();
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    randomize(
        &varmap,
        &[
            "final_layer.linear.weight",
            "final_layer.adaLN_modulation.1.weight",
        ],
    )?;

    let x = Tensor::randn(0f32, 1., (1, 4, 8, 8), &dev)?;
    let t = Tensor::new(&[250f32], &dev)?;
    let guided = GuidedText {
        cond: text(&cfg, 1, &dev)?,
        uncond: text(&cfg, 1, &dev)?,
    };
    let out = model.forward(&x, &t, &guided)?;
    assert!(max_abs(&out)? > 0.);

    let cond_only = model.forward_raw(&x, &t, &guided.cond, None, None)?;
    let cond_only = cond_only.narrow(1, 0, 4)?;
    assert!(max_abs(&(out - cond_only)?)? < 1e-4);
    Ok(())
}

#[test]
fn zero_initialised_model_outputs_zero() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 2,
        hidden_size: 64,
        num_heads: 4,
        patch_size: 2,
        ..scaled_down(DitPreset::B2)
    };
    let varmap = VarMap::new();
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    let x = Tensor::zeros((1, 4, 8, 8), DType::F32, &dev)?;
    let t = Tensor::zeros(1, DType::F32, &dev)?;
    let out = model.forward_raw(&x, &t, &text(&cfg, 1, &dev)?, None, None)?;
    assert_eq!(out.dims(), &[1, 8, 8, 8]);
    assert_eq!(max_abs(&out)?, 0.);
    Ok(())
}

#[test]
fn explicit_meta_and_style_are_checked() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 2,
        ..scaled_down(DitPreset::L2)
    };
    let varmap = VarMap::new();
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    let x = Tensor::randn(0f32, 1., (1, 4, 8, 8), &dev)?;
    let t = Tensor::new(&[1f32], &dev)?;
    let text = text(&cfg, 1, &dev)?;

    let meta = Tensor::new(&[[1024f32, 1024., 64., 64., 0., 0.]], &dev)?;
    let style = Tensor::new(&[0u32], &dev)?;
    let out = model.forward_raw(&x, &t, &text, Some(&meta), Some(&style))?;
    assert_eq!(out.dims(), &[1, 8, 8, 8]);

    let bad_meta = Tensor::zeros((1, 4), DType::F32, &dev)?;
    assert!(matches!(
        model.forward_raw(&x, &t, &text, Some(&bad_meta), None),
        Err(Error::ShapeMismatch(_))
    ));

    let batch_of_two = Tensor::randn(0f32, 1., (2, 4, 8, 8), &dev)?;
    let two_steps = Tensor::new(&[1f32, 2.], &dev)?;
    assert!(matches!(
        model.forward_raw(&batch_of_two, &two_steps, &text, None, None),
        Err(Error::ShapeMismatch(_))
    ));

    let two_styles = Tensor::new(&[0u32, 0], &dev)?;
    assert!(matches!(
        model.forward_raw(&x, &t, &text, None, Some(&two_styles)),
        Err(Error::ShapeMismatch(_))
    ));

    let odd = Tensor::zeros((1, 4, 7, 8), DType::F32, &dev)?;
    assert!(matches!(
        model.forward_raw(&odd, &t, &text, None, None),
        Err(Error::ShapeMismatch(_))
    ));
    Ok(())
}

#[test]
fn invalid_configs_fail_at_construction() {
    let dev = Device::Cpu;
    let build = |cfg: Config| {
        let varmap = VarMap::new();
        HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))
    };
    let cfg = Config {
        norm: "group".to_string(),
        ..scaled_down(DitPreset::B2)
    };
    assert!(matches!(build(cfg), Err(Error::Config(_))));

    let cfg = Config {
        depth: 3,
        ..scaled_down(DitPreset::B2)
    };
    assert!(matches!(build(cfg), Err(Error::Config(_))));

    let cfg = Config {
        hidden_size: 100,
        ..scaled_down(DitPreset::B2)
    };
    assert!(matches!(build(cfg), Err(Error::Config(_))));
}

#[test]
fn rms_norm_variant_builds() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 2,
        norm: "rms".to_string(),
        qk_norm: false,
        ..scaled_down(DitPreset::B2)
    };
    let varmap = VarMap::new();
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    let x = Tensor::randn(0f32, 1., (1, 4, 8, 8), &dev)?;
    let t = Tensor::new(&[3f32], &dev)?;
    let out = model.forward_raw(&x, &t, &text(&cfg, 1, &dev)?, None, None)?;
    assert_eq!(out.dims(), &[1, 8, 8, 8]);
    assert!(!varmap.data().lock().unwrap().contains_key("blocks.0.attn1.q_norm.weight"));
    Ok(())
}

#[derive(Default)]
struct Recorder(Mutex<Vec<TracePoint>>);

impl ForwardObserver for Recorder {
    fn observe(&self, point: TracePoint, _tensor: &Tensor) {
        self.0.lock().unwrap().push(point);
    }
}

#[test]
fn observer_sees_trace_points_in_order() -> Result<()> {
    let dev = Device::Cpu;
    let cfg = Config {
        depth: 4,
        ..scaled_down(DitPreset::B2)
    };
    let varmap = VarMap::new();
    let recorder = Arc::new(Recorder::default());
    let model = HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?
        .with_observer(recorder.clone());
    let x = Tensor::randn(0f32, 1., (1, 4, 8, 8), &dev)?;
    let t = Tensor::new(&[7f32], &dev)?;
    model.forward_raw(&x, &t, &text(&cfg, 1, &dev)?, None, None)?;

    let mut expected = vec![
        TracePoint::TextStates,
        TracePoint::TimestepEmbedded,
        TracePoint::ExtraVector,
        TracePoint::Conditioning,
        TracePoint::PatchEmbedded,
    ];
    expected.extend((0..4).map(|layer| TracePoint::BlockOutput { layer }));
    expected.push(TracePoint::FinalLayer);
    assert_eq!(*recorder.0.lock().unwrap(), expected);
    Ok(())
}
