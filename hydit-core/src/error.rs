//! Error types for the HunYuan-DiT model.

use thiserror::Error;

/// Error type for model construction and the forward pass.
///
/// Tensor-level failures raised inside candle are carried through
/// [`Error::Candle`]; the other variants are the structural invariants the
/// model checks itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A tensor did not have the shape the model expects (patch grid vs.
    /// sequence length, spatial size vs. patch size, text length vs. the
    /// padding table, ...).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The configuration cannot describe a valid model. Raised at
    /// construction time, never from `forward`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A block that consumes a skip connection found the skip stack empty.
    #[error("skip connection stack is empty at block {layer}")]
    SkipUnderflow {
        /// Index of the block that tried to pop.
        layer: usize,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::ShapeMismatch(format!($($arg)*)))
    };
}

macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Config(format!($($arg)*)))
    };
}

pub(crate) use config_bail;
pub(crate) use shape_bail;
