use std::{fmt::Display, time::Instant};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use hydit_core::{
    initialize_logging, Config, DitPreset, GuidedText, HunYuanDiT, ModelDType, ResolutionGroup,
    TextEmbeddings, TryIntoDType,
};
use tracing::{info, warn};

enum TestName {
    Guided(usize),
    Raw(usize),
}

impl Display for TestName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestName::Guided(n) => format!("cfg b{}", n),
            TestName::Raw(n) => format!("raw b{}", n),
        };
        write!(f, "{}", name)
    }
}

struct BenchResult {
    millis: Vec<f32>,
    test_name: TestName,
}

struct UncertainMs {
    mean: f32,
    std_dev: f32,
}

impl Display for UncertainMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

fn get_ms(result: &BenchResult) -> UncertainMs {
    let measurements = &result.millis;
    // Calculate uncertainty
    let mean = measurements.iter().sum::<f32>() / measurements.len() as f32;
    let variance = measurements
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f32>()
        / measurements.len() as f32;
    let std_dev = variance.sqrt();
    UncertainMs { mean, std_dev }
}

struct Inputs {
    x: Tensor,
    t: Tensor,
    text: GuidedText,
}

fn random_text(cfg: &Config, batch: usize, device: &Device) -> anyhow::Result<TextEmbeddings> {
    Ok(TextEmbeddings {
        clip: Tensor::randn(0f32, 1., (batch, cfg.text_len, cfg.text_states_dim), device)?,
        clip_mask: Tensor::ones((batch, cfg.text_len), DType::U8, device)?,
        t5: Tensor::randn(
            0f32,
            1.,
            (batch, cfg.text_len_t5, cfg.text_states_dim_t5),
            device,
        )?,
        t5_mask: Tensor::ones((batch, cfg.text_len_t5), DType::U8, device)?,
    })
}

fn make_inputs(
    cfg: &Config,
    batch: usize,
    latent: (usize, usize),
    device: &Device,
) -> anyhow::Result<Inputs> {
    let (h, w) = latent;
    Ok(Inputs {
        x: Tensor::randn(0f32, 1., (batch, cfg.in_channels, h, w), device)?,
        t: Tensor::new(vec![999f32; batch], device)?,
        text: GuidedText {
            cond: random_text(cfg, batch, device)?,
            uncond: random_text(cfg, batch, device)?,
        },
    })
}

fn run_once(model: &HunYuanDiT, inputs: &Inputs, test_name: &TestName) -> anyhow::Result<()> {
    match test_name {
        TestName::Guided(_) => model.forward(&inputs.x, &inputs.t, &inputs.text)?,
        TestName::Raw(_) => {
            model.forward_raw(&inputs.x, &inputs.t, &inputs.text.cond, None, None)?
        }
    };
    inputs.x.device().synchronize()?;
    Ok(())
}

fn run_bench(
    model: &HunYuanDiT,
    inputs: &Inputs,
    repetitions: usize,
    test_name: TestName,
) -> anyhow::Result<BenchResult> {
    let mut millis = Vec::with_capacity(repetitions);
    for _ in 0..repetitions {
        let start = Instant::now();
        run_once(model, inputs, &test_name)?;
        millis.push(start.elapsed().as_secs_f32() * 1000.);
    }
    Ok(BenchResult { millis, test_name })
}

fn print_usage(model: &str, device: &Device, resolution: &str, results: Vec<BenchResult>) {
    let backend = match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    };
    let results: Vec<Vec<CellStruct>> = results
        .into_iter()
        .map(|r| {
            let ms = get_ms(&r);
            let per_sample = match r.test_name {
                TestName::Guided(b) | TestName::Raw(b) => ms.mean / b as f32,
            };
            vec![
                model.cell(),
                backend.cell(),
                resolution.cell(),
                r.test_name.to_string().cell(),
                ms.cell().justify(Justify::Right),
                format!("{per_sample:.3}").cell().justify(Justify::Right),
            ]
        })
        .collect();

    let table = results
        .table()
        .title(vec![
            "model".cell().bold(true),
            "backend".cell().bold(true),
            "resolution".cell().bold(true),
            "test".cell().bold(true),
            "ms/step".cell().bold(true),
            "ms/sample".cell().bold(true),
        ])
        .bold(true);
    if let Err(e) = print_stdout(table) {
        warn!("Failed to print results table: {e}");
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Model scale: DiT-g/2, DiT-XL/2, DiT-L/2 or DiT-B/2.
    #[arg(long, default_value = "DiT-g/2")]
    preset: String,

    /// HF-style `config.json`. Overrides `--preset`.
    #[arg(long)]
    config: Option<String>,

    /// Safetensors files to load the weights from. Without this the model is
    /// randomly initialised.
    #[arg(long, value_delimiter = ',')]
    weights: Option<Vec<String>>,

    /// Image height in pixels.
    #[arg(long, default_value_t = 1024)]
    height: usize,

    /// Image width in pixels.
    #[arg(long, default_value_t = 1024)]
    width: usize,

    /// Number of images per step. Guided steps run twice this batch.
    #[arg(long, short, default_value_t = 1)]
    batch_size: usize,

    /// Number of times to repeat each test.
    #[arg(long, short, default_value_t = 5)]
    repetitions: usize,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Model dtype: auto, bf16, f16 or f32.
    #[arg(long, short, default_value = "auto")]
    dtype: String,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    if args.repetitions == 0 {
        anyhow::bail!("`repetitions` must be a strictly positive integer, got 0.");
    }

    let (cfg, model_name) = match &args.config {
        Some(path) => (Config::from_file(path)?, path.clone()),
        None => {
            let preset: DitPreset = args.preset.parse()?;
            (Config::from_preset(preset), preset.to_string())
        }
    };

    let device = if args.cpu {
        Device::Cpu
    } else {
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;
        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        device
    };
    if let Some(seed) = args.seed {
        device.set_seed(seed)?;
    }
    info!(
        "avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let dtype = args.dtype.parse::<ModelDType>()?.try_into_dtype(&device)?;

    if !ResolutionGroup::new().is_valid(args.width, args.height) {
        warn!(
            "{}x{} is not a trained resolution bucket, rotary tables will be computed per step.",
            args.width, args.height
        );
    }
    let scale = cfg.vae_scale_factor;
    let latent = (args.height / scale, args.width / scale);

    let model = match &args.weights {
        Some(paths) => HunYuanDiT::from_safetensors(&cfg, paths.as_slice(), dtype, &device)?,
        None => {
            info!("No weights given, using random initialisation.");
            let varmap = VarMap::new();
            HunYuanDiT::new(&cfg, VarBuilder::from_varmap(&varmap, dtype, &device))?
        }
    };

    let inputs = make_inputs(&cfg, args.batch_size, latent, &device)?;

    info!("Starting warmup run.");
    run_once(&model, &inputs, &TestName::Raw(args.batch_size))?;
    info!("Finished warmup run.");
    info!("Starting benchmarks.");

    let results = vec![
        run_bench(
            &model,
            &inputs,
            args.repetitions,
            TestName::Raw(args.batch_size),
        )?,
        run_bench(
            &model,
            &inputs,
            args.repetitions,
            TestName::Guided(args.batch_size),
        )?,
    ];

    let resolution = format!("{}x{}", args.height, args.width);
    print_usage(&model_name, &device, &resolution, results);

    Ok(())
}
