use candle_core::{DType, Shape};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatGlm3Error {
    /// Half-precision loss was requested for logits that are not `F16`.
    #[error("fp16 cross-entropy requested but logits are {found:?}")]
    PrecisionMismatch { found: DType },

    #[error("missing checkpoint key `{key}`")]
    MissingCheckpointKey { key: String },

    #[error("unexpected checkpoint keys: {}", keys.join(", "))]
    UnexpectedCheckpointKeys { keys: Vec<String> },

    #[error("checkpoint entry `{key}` is not a {expected}")]
    InvalidCheckpointEntry { key: String, expected: &'static str },

    #[error("shape mismatch for `{key}`: expected {expected:?}, found {found:?}")]
    ParameterShapeMismatch {
        key: String,
        expected: Shape,
        found: Shape,
    },

    /// Two entries of a nested dictionary flatten to the same dotted name.
    #[error("flattened tensor name `{name}` is not unique")]
    DuplicateTensorName { name: String },

    /// The loss mask selects no tokens, so the mean loss is undefined.
    #[error("loss mask sums to zero")]
    DegenerateMask,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("invalid parameter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatGlm3Error>;
