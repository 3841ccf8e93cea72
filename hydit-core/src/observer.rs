//! Hooks for inspecting intermediate activations of the forward pass.

use std::fmt::Display;

use candle_core::Tensor;
use tracing::debug;

/// Where in the forward pass an activation was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    /// Image tokens after the patch embedding.
    PatchEmbedded,
    /// Timestep embedding, before the extra conditioning is added.
    TimestepEmbedded,
    /// Concatenated and padded text states.
    TextStates,
    /// Pooled text, image meta and style, concatenated.
    ExtraVector,
    /// Final conditioning vector `c`.
    Conditioning,
    BlockOutput {
        layer: usize,
    },
    /// Token output of the final layer, before unpatchify.
    FinalLayer,
}

impl Display for TracePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PatchEmbedded => write!(f, "patch_embedded"),
            Self::TimestepEmbedded => write!(f, "timestep_embedded"),
            Self::TextStates => write!(f, "text_states"),
            Self::ExtraVector => write!(f, "extra_vector"),
            Self::Conditioning => write!(f, "conditioning"),
            Self::BlockOutput { layer } => write!(f, "block_output.{layer}"),
            Self::FinalLayer => write!(f, "final_layer"),
        }
    }
}

/// Receives intermediate activations. Implementations must not assume the
/// tensors outlive the call.
pub trait ForwardObserver: Send + Sync {
    fn observe(&self, point: TracePoint, tensor: &Tensor);
}

/// Logs shape and dtype of every trace point at `DEBUG` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ForwardObserver for TracingObserver {
    fn observe(&self, point: TracePoint, tensor: &Tensor) {
        debug!("{point}: shape {:?}, dtype {:?}", tensor.dims(), tensor.dtype());
    }
}
