//! HunYuan-DiT, the bilingual diffusion transformer, on candle.
//!
//! The crate implements the denoiser forward pass: patch embedding,
//! timestep/text/image-meta conditioning, the skip-connected transformer
//! stack with 2D rotary embeddings, and the adaLN final layer. Schedulers,
//! VAEs and text encoders are out of scope; text embeddings are inputs.

use std::sync::atomic::AtomicBool;

mod config;
mod error;
pub mod hunyuan;
pub mod layers;
mod observer;
mod resolution;
mod utils;

pub use config::{Config, DitPreset, IMAGE_META_FIELDS};
pub use error::{Error, Result};
pub use hunyuan::{
    patchify, unpatchify, GuidedText, HunYuanDiT, RopeEmbedding, RopeTable, SkipPlan,
    TextEmbeddings,
};
pub use layers::modulate;
pub use observer::{ForwardObserver, TracePoint, TracingObserver};
pub use resolution::{Resolution, ResolutionGroup};
pub use utils::debug::initialize_logging;
pub use utils::dtype::{ModelDType, TryIntoDType};

/// `true` if `HYDIT_DEBUG` contains a `1`. Set by [`initialize_logging`].
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
