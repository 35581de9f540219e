//! Forward, loss and checkpoint-state plumbing for a ChatGLM-3 language model
//! trained with tensor, pipeline and sequence parallelism.
//!
//! The transformer itself is supplied through [`LanguageModelStage`]; process
//! groups through [`Communicator`]. This crate decides what a rank does with
//! the hidden states it produces and how its parameters are laid out in a
//! checkpoint.

pub mod checkpoint;
pub mod config;
pub mod curriculum;
pub mod error;
pub mod logging;
pub mod models;
pub mod parallel;

pub use checkpoint::{
    universal_checkpoint_info, CheckpointSlot, MergeStrategy, ParameterTree, StateDict,
    StateValue, UniversalCheckpointInfo,
};
pub use config::ChatGlm3Config;
pub use curriculum::CurriculumHandle;
pub use error::{ChatGlm3Error, Result};
pub use models::{
    post_language_model_processing, ChatGlm3Inputs, ChatGlm3Model, ChatGlm3Output,
    InferenceParams, LanguageModelInputs, LanguageModelStage, OutputWeightSource, PipelineStage,
    RetrieverInputs, StageOutput, WordEmbeddings,
};
pub use parallel::{
    compute_lm_loss, masked_lm_loss, CollectiveCrossEntropy, Communicator,
    CrossEntropyAlgorithm, ParallelContext, ReduceOp, SingleProcessComm, VocabCrossEntropy,
};
