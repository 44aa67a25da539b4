//! # `DetNet` Errors

use thiserror::Error;

/// Errors raised while building a network or importing weights into it.
#[derive(Debug, Error)]
pub enum DetNetError {
    /// Consecutive blocks disagree on their channel counts.
    #[error("channel mismatch in {context}: {producer} emits {produced} planes, {consumer} expects {expected}")]
    ChannelMismatch {
        /// Where the mismatch was found.
        context: String,
        /// Name of the producing block.
        producer: String,
        /// Planes produced.
        produced: usize,
        /// Name of the consuming block.
        consumer: String,
        /// Planes expected.
        expected: usize,
    },

    /// A stage or head config holds no blocks.
    #[error("{context} has no blocks")]
    EmptyStage {
        /// Where the empty block list was found.
        context: String,
    },

    /// Requested depth is not one of the defined configurations.
    #[error("unsupported configuration: depth '{requested}' (supported: {supported})")]
    UnsupportedDepth {
        /// The requested depth.
        requested: String,
        /// Comma separated supported names.
        supported: String,
    },

    /// A weight with a matching name carries a different shape.
    #[error("invalid configuration: weight '{name}' has shape {found:?}, parameter expects {expected:?}")]
    WeightShapeMismatch {
        /// Parameter name.
        name: String,
        /// Parameter shape.
        expected: Vec<usize>,
        /// Source shape.
        found: Vec<usize>,
    },

    /// Weight source name is not in the provided registry.
    #[error("unknown weight source '{name}' - available sources: {available}")]
    UnknownWeightSource {
        /// The requested source.
        name: String,
        /// Comma separated available names.
        available: String,
    },

    /// Checkpoint could not be read or parsed.
    #[error("failed to load weights from {path}: {reason}")]
    WeightLoad {
        /// Checkpoint location.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// An option value is out of its valid range.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption {
        /// Option key.
        key: String,
        /// Why it is invalid.
        reason: String,
    },
}

/// Result alias for [`DetNetError`].
pub type Result<T> = core::result::Result<T, DetNetError>;
