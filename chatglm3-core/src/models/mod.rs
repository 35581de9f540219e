pub(crate) mod chatglm3;
pub(crate) mod embedding;

use candle_core::Tensor;

use crate::checkpoint::StateDict;
use crate::error::Result;

pub use chatglm3::{
    post_language_model_processing, ChatGlm3Inputs, ChatGlm3Model, ChatGlm3Output,
    OutputWeightSource, PipelineStage,
};
pub use embedding::WordEmbeddings;

/// Retrieval-augmented inputs. Passed to the inner stage untouched.
#[derive(Debug, Clone, Copy)]
pub struct RetrieverInputs<'a> {
    pub input_ids: &'a Tensor,
    pub position_ids: &'a Tensor,
    pub attention_mask: &'a Tensor,
}

/// Incremental-decoding bookkeeping owned by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceParams {
    pub max_batch_size: usize,
    pub max_sequence_length: usize,
    pub sequence_len_offset: usize,
    pub batch_size_offset: usize,
}

impl InferenceParams {
    pub fn new(max_batch_size: usize, max_sequence_length: usize) -> Self {
        Self {
            max_batch_size,
            max_sequence_length,
            ..Default::default()
        }
    }
}

/// Inputs of the embedding + transformer stage, already truncated.
///
/// `input_ids`, `position_ids`: `[b, s]`. `attention_mask`: `[1, 1, s, s]`.
#[derive(Debug, Clone, Copy)]
pub struct LanguageModelInputs<'a> {
    pub input_ids: &'a Tensor,
    pub position_ids: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub retriever: Option<RetrieverInputs<'a>>,
    pub inference_params: Option<&'a InferenceParams>,
}

/// Output of the embedding + transformer stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// `[s, b, h]`.
    pub hidden_states: Tensor,
    /// One auxiliary loss per MoE layer on this stage. Empty for dense models.
    pub moe_losses: Vec<Tensor>,
}

/// The embedding + transformer stack of one pipeline stage.
///
/// Attention, MLP and normalization kernels live behind this trait. The
/// stage owns the word embeddings when it pre-processes and the untied output
/// layer when it post-processes.
pub trait LanguageModelStage: Send + Sync {
    fn forward(&self, inputs: LanguageModelInputs<'_>) -> Result<StageOutput>;

    /// Hidden states received from the previous pipeline stage.
    fn set_input_tensor(&mut self, input_tensor: Option<Tensor>);

    /// `[v_local, h]`, present on pre-processing stages.
    fn word_embeddings_weight(&self) -> Option<&Tensor>;

    /// `[v_local, h]`, present on post-processing stages with untied weights.
    fn output_layer_weight(&self) -> Option<&Tensor>;

    /// May contain a `moe_state_dict` sub-dictionary with expert parameters.
    fn state_dict_for_save_checkpoint(&self, prefix: &str, keep_vars: bool) -> Result<StateDict>;

    /// Expert parameters, if any, arrive under `moe_state_dict`.
    fn load_state_dict(&mut self, state_dict: StateDict, strict: bool) -> Result<()>;
}
