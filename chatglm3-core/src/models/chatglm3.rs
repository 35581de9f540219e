//! ChatGLM-3 model as seen by one rank of a tensor-, pipeline- and
//! sequence-parallel training run.
//!
//! The rank may own the embeddings (`pre_process`), the output head
//! (`post_process`), both or neither:
//!
//! ```text
//! input ids ─► [curriculum truncation] ─► LanguageModelStage ─► hidden [s b h]
//!                                                                   │
//!                               post_process? ──────────────────────┤
//!                                     │                             │
//!                   post_language_model_processing                  ▼
//!                   logits [b s v]  or  loss [b s]            hidden [s b h]
//! ```
//!
//! Internally every sequence tensor is `[s, b, ...]`; everything crossing the
//! model boundary is `[b, s, ...]`.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::embedding::WordEmbeddings;
use super::{
    InferenceParams, LanguageModelInputs, LanguageModelStage, RetrieverInputs, StageOutput,
};
use crate::checkpoint::adapter::{
    attach_moe_state, hoist_moe_state, split_checkpoint, CheckpointParts,
};
use crate::checkpoint::{
    universal_checkpoint_info, StateDict, UniversalCheckpointInfo, LANGUAGE_MODEL_KEY,
    WORD_EMBEDDINGS_FOR_HEAD_KEY,
};
use crate::config::ChatGlm3Config;
use crate::curriculum::CurriculumHandle;
use crate::error::{ChatGlm3Error, Result};
use crate::parallel::{
    compute_lm_loss, parallel_lm_logits, CollectiveCrossEntropy, ParallelContext, ReduceOp,
    VocabCrossEntropy,
};

/// Which ends of the network this pipeline stage owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineStage {
    pub pre_process: bool,
    pub post_process: bool,
}

impl PipelineStage {
    /// No pipeline parallelism: the rank owns everything.
    pub const SINGLE: Self = Self {
        pre_process: true,
        post_process: true,
    };
    pub const FIRST: Self = Self {
        pre_process: true,
        post_process: false,
    };
    pub const INTERMEDIATE: Self = Self {
        pre_process: false,
        post_process: false,
    };
    pub const LAST: Self = Self {
        pre_process: false,
        post_process: true,
    };

    pub fn is_post_process_only(&self) -> bool {
        self.post_process && !self.pre_process
    }
}

/// Where the output head gets its `[v_local, h]` projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputWeightSource {
    /// Reuse the word-embedding table.
    Tied,
    /// The inner stage's own output layer.
    Untied,
}

impl OutputWeightSource {
    pub fn from_config(cfg: &ChatGlm3Config) -> Self {
        if cfg.untie_embeddings_and_output_weights {
            Self::Untied
        } else {
            Self::Tied
        }
    }
}

/// Inputs of [`ChatGlm3Model::forward`]. Sequence tensors are `[b, s]`, the
/// attention mask `[1, 1, s, s]`.
#[derive(Debug, Clone, Copy)]
pub struct ChatGlm3Inputs<'a> {
    pub input_ids: &'a Tensor,
    pub position_ids: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub retriever: Option<RetrieverInputs<'a>>,
    pub labels: Option<&'a Tensor>,
    pub inference_params: Option<&'a InferenceParams>,
    pub curriculum_seqlen: Option<usize>,
}

impl<'a> ChatGlm3Inputs<'a> {
    pub fn new(input_ids: &'a Tensor, position_ids: &'a Tensor, attention_mask: &'a Tensor) -> Self {
        Self {
            input_ids,
            position_ids,
            attention_mask,
            retriever: None,
            labels: None,
            inference_params: None,
            curriculum_seqlen: None,
        }
    }

    pub fn with_labels(mut self, labels: &'a Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_retriever(mut self, retriever: RetrieverInputs<'a>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_inference_params(mut self, params: &'a InferenceParams) -> Self {
        self.inference_params = Some(params);
        self
    }

    pub fn with_curriculum_seqlen(mut self, seqlen: usize) -> Self {
        self.curriculum_seqlen = Some(seqlen);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChatGlm3Output {
    /// Loss `[b, s]` when labels were given, logits `[b, s, v]` otherwise.
    /// Hidden states `[s, b, h]` on stages without the output head.
    pub output: Tensor,
    /// Per-layer MoE auxiliary losses, when the model surfaces them.
    pub moe_losses: Option<Vec<Tensor>>,
}

/// Project `lm_output` (`[s, b, h]`) to logits and, given labels (`[b, s]`),
/// to per-token loss.
///
/// Without labels returns logits `[b, s, v]`; `v` is the local vocabulary
/// shard when `parallel_output` is set. With labels returns loss `[b, s]`.
pub fn post_language_model_processing(
    lm_output: &Tensor,
    labels: Option<&Tensor>,
    logit_weights: &Tensor,
    parallel_output: bool,
    fp16_lm_cross_entropy: bool,
    parallel: &ParallelContext,
    kernels: &dyn VocabCrossEntropy,
) -> Result<Tensor> {
    // Output. Format [s b h]
    let output = parallel_lm_logits(
        lm_output,
        logit_weights,
        parallel_output,
        &*parallel.tensor_parallel,
    )?;

    match labels {
        // [s b h] => [b s h]
        None => Ok(output.transpose(0, 1)?.contiguous()?),
        Some(labels) => {
            // [b s] => [s b]
            let labels = labels.t()?.contiguous()?;
            let loss = compute_lm_loss(
                kernels,
                parallel.sequence_parallel_world_size(),
                &output,
                &labels,
                fp16_lm_cross_entropy,
            )?;
            // [s b] => [b s]
            Ok(loss.t()?.contiguous()?)
        }
    }
}

/// ChatGLM-3 language model on one rank.
pub struct ChatGlm3Model<L: LanguageModelStage> {
    language_model: L,
    stage: PipelineStage,
    output_weights: OutputWeightSource,
    /// Head copy of the tied embeddings, only on post-process-only stages.
    word_embeddings: Option<WordEmbeddings>,
    parallel_output: bool,
    fp16_lm_cross_entropy: bool,
    return_moe_loss: bool,
    curriculum_learning_legacy: bool,
    universal_checkpoint_available: bool,
    seq_length: usize,
    parallel: ParallelContext,
    cross_entropy: Arc<dyn VocabCrossEntropy>,
    curriculum: CurriculumHandle,
}

impl<L: LanguageModelStage> ChatGlm3Model<L> {
    /// `dtype` and `device` are used for the head embedding copy when this
    /// stage needs one.
    pub fn new(
        cfg: &ChatGlm3Config,
        language_model: L,
        stage: PipelineStage,
        parallel: ParallelContext,
        curriculum: CurriculumHandle,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        cfg.validate()?;
        let output_weights = OutputWeightSource::from_config(cfg);

        match output_weights {
            OutputWeightSource::Untied
                if stage.post_process && language_model.output_layer_weight().is_none() =>
            {
                return Err(ChatGlm3Error::Config(
                    "untied output weights require an output layer on the post-process stage"
                        .into(),
                ));
            }
            OutputWeightSource::Tied
                if stage.pre_process && language_model.word_embeddings_weight().is_none() =>
            {
                return Err(ChatGlm3Error::Config(
                    "tied output weights require word embeddings on the pre-process stage".into(),
                ));
            }
            _ => {}
        }

        let cross_entropy: Arc<dyn VocabCrossEntropy> =
            Arc::new(CollectiveCrossEntropy::from_context(&parallel));
        let mut model = Self {
            language_model,
            stage,
            output_weights,
            word_embeddings: None,
            parallel_output: cfg.parallel_output,
            fp16_lm_cross_entropy: cfg.fp16_lm_cross_entropy,
            return_moe_loss: cfg.return_moe_loss,
            curriculum_learning_legacy: cfg.curriculum_learning_legacy,
            universal_checkpoint_available: cfg.universal_checkpoint_info,
            seq_length: cfg.seq_length,
            parallel,
            cross_entropy,
            curriculum,
        };
        model.initialize_word_embeddings(cfg, dtype, device)?;

        tracing::info!(
            pre_process = stage.pre_process,
            post_process = stage.post_process,
            output_weights = ?output_weights,
            tp_world_size = model.parallel.tensor_parallel_world_size(),
            sp_world_size = model.parallel.sequence_parallel_world_size(),
            num_experts = cfg.num_experts,
            "ChatGLM-3 model initialized"
        );
        Ok(model)
    }

    /// Replace the cross-entropy kernels, e.g. with fused implementations.
    pub fn with_cross_entropy(mut self, kernels: Arc<dyn VocabCrossEntropy>) -> Self {
        self.cross_entropy = kernels;
        self
    }

    fn initialize_word_embeddings(
        &mut self,
        cfg: &ChatGlm3Config,
        dtype: DType,
        device: &Device,
    ) -> Result<()> {
        if self.output_weights != OutputWeightSource::Tied {
            return Ok(());
        }
        if self.stage.is_post_process_only() {
            let mut embeddings = WordEmbeddings::zeros(
                cfg.vocab_size,
                cfg.hidden_size,
                self.parallel.tensor_parallel_world_size(),
                dtype,
                device,
            )?;
            if let Some(group) = &self.parallel.embedding_group {
                embeddings.sync(&**group)?;
            }
            tracing::debug!("allocated head copy of tied word embeddings");
            self.word_embeddings = Some(embeddings);
        } else if self.stage.pre_process && !self.stage.post_process {
            if let Some(group) = &self.parallel.embedding_group {
                // Every other member contributes zeros, so the local table is
                // already the result.
                group.all_reduce(self.shared_embedding_or_output_weight()?, ReduceOp::Sum)?;
                tracing::debug!("shared word embeddings with the embedding group");
            }
        }
        Ok(())
    }

    pub fn language_model(&self) -> &L {
        &self.language_model
    }

    pub fn language_model_mut(&mut self) -> &mut L {
        &mut self.language_model
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn output_weight_source(&self) -> OutputWeightSource {
        self.output_weights
    }

    pub fn curriculum(&self) -> &CurriculumHandle {
        &self.curriculum
    }

    pub fn word_embeddings(&self) -> Option<&WordEmbeddings> {
        self.word_embeddings.as_ref()
    }

    /// See [`LanguageModelStage::set_input_tensor`].
    pub fn set_input_tensor(&mut self, input_tensor: Option<Tensor>) {
        self.language_model.set_input_tensor(input_tensor);
    }

    /// The word-embedding table: the inner stage's on pre-process stages, the
    /// head copy otherwise.
    pub fn shared_embedding_or_output_weight(&self) -> Result<&Tensor> {
        let weight = if self.stage.pre_process {
            self.language_model.word_embeddings_weight()
        } else {
            self.word_embeddings.as_ref().map(WordEmbeddings::weight).transpose()?
        };
        weight.ok_or_else(|| {
            ChatGlm3Error::Config("this stage holds no word embeddings".into())
        })
    }

    fn logit_weights(&self) -> Result<&Tensor> {
        match self.output_weights {
            OutputWeightSource::Tied => self.shared_embedding_or_output_weight(),
            OutputWeightSource::Untied => {
                self.language_model.output_layer_weight().ok_or_else(|| {
                    ChatGlm3Error::Config("this stage holds no output layer".into())
                })
            }
        }
    }

    pub fn forward(&self, inputs: ChatGlm3Inputs<'_>) -> Result<ChatGlm3Output> {
        let mut input_ids = inputs.input_ids.clone();
        let mut position_ids = inputs.position_ids.clone();
        let mut attention_mask = inputs.attention_mask.clone();
        let mut labels = inputs.labels.cloned();

        match inputs.curriculum_seqlen {
            Some(seqlen) => {
                self.curriculum.set(seqlen);
                let current = input_ids.dim(1)?;
                if seqlen < current {
                    tracing::debug!(seqlen, current, "truncating batch to curriculum length");
                    input_ids = truncate_sequence(&input_ids, seqlen)?;
                    position_ids = truncate_sequence(&position_ids, seqlen)?;
                    labels = labels
                        .as_ref()
                        .map(|l| truncate_sequence(l, seqlen))
                        .transpose()?;
                    attention_mask = truncate_attention_mask(&attention_mask, seqlen)?;
                }
            }
            None if self.curriculum_learning_legacy => {
                self.curriculum.set(self.seq_length);
            }
            None => {}
        }

        let StageOutput {
            hidden_states,
            moe_losses,
        } = self.language_model.forward(LanguageModelInputs {
            input_ids: &input_ids,
            position_ids: &position_ids,
            attention_mask: &attention_mask,
            retriever: inputs.retriever,
            inference_params: inputs.inference_params,
        })?;

        let output = if self.stage.post_process {
            post_language_model_processing(
                &hidden_states,
                labels.as_ref(),
                self.logit_weights()?,
                self.parallel_output,
                self.fp16_lm_cross_entropy,
                &self.parallel,
                &*self.cross_entropy,
            )?
        } else {
            hidden_states
        };

        Ok(ChatGlm3Output {
            output,
            moe_losses: self.return_moe_loss.then_some(moe_losses),
        })
    }

    fn owns_head_embeddings(&self) -> bool {
        self.stage.is_post_process_only() && self.output_weights == OutputWeightSource::Tied
    }

    /// Checkpoint dictionary in the layout the distributed writer expects:
    /// expert entries at the top level, the rest under `language_model`, and
    /// the head embeddings under `word_embeddings_for_head` where present.
    pub fn state_dict_for_save_checkpoint(&self, prefix: &str, keep_vars: bool) -> Result<StateDict> {
        let mut state_dict = StateDict::new();
        let mut language_model_state = self
            .language_model
            .state_dict_for_save_checkpoint(prefix, keep_vars)?;
        let hoisted = hoist_moe_state(&mut language_model_state, &mut state_dict)?;
        state_dict.insert(LANGUAGE_MODEL_KEY, language_model_state);

        if self.owns_head_embeddings() {
            if let Some(embeddings) = &self.word_embeddings {
                state_dict.insert(
                    WORD_EMBEDDINGS_FOR_HEAD_KEY,
                    embeddings.state_dict(prefix, keep_vars),
                );
            }
        }
        tracing::debug!(hoisted, entries = state_dict.len(), "built checkpoint state dict");
        Ok(state_dict)
    }

    /// Inverse of [`Self::state_dict_for_save_checkpoint`]. Also accepts a
    /// dictionary without the `language_model` level. The head embeddings are
    /// committed only after the inner stage loaded, so a failed load leaves
    /// them untouched.
    pub fn load_state_dict(&mut self, state_dict: StateDict, strict: bool) -> Result<()> {
        let CheckpointParts {
            language_model,
            head_embeddings,
            moe,
            regular,
        } = split_checkpoint(state_dict)?;

        let staged_head = self.stage_head_embeddings(head_embeddings, strict)?;

        let mut language_model_state = match language_model {
            Some(inner) if regular.is_empty() => inner,
            Some(inner) => {
                let keys: Vec<String> = regular.keys().map(str::to_string).collect();
                if strict {
                    return Err(ChatGlm3Error::UnexpectedCheckpointKeys { keys });
                }
                tracing::warn!(?keys, "ignoring entries beside the language model state");
                inner
            }
            None => regular,
        };
        let gathered = moe.len();
        attach_moe_state(&mut language_model_state, moe);
        tracing::debug!(gathered, strict, "loading language model state");
        self.language_model
            .load_state_dict(language_model_state, strict)?;

        if let Some(head) = staged_head {
            self.word_embeddings = Some(head);
        }
        Ok(())
    }

    /// Load the head dictionary into a copy of the current head embeddings.
    fn stage_head_embeddings(
        &self,
        head: Option<StateDict>,
        strict: bool,
    ) -> Result<Option<WordEmbeddings>> {
        let current = match self.word_embeddings.as_ref() {
            Some(current) if self.owns_head_embeddings() => current,
            _ => {
                if head.is_some() {
                    tracing::debug!("stage keeps no head embeddings, skipping checkpoint entry");
                }
                return Ok(None);
            }
        };
        match head {
            Some(head) => {
                let mut staged = current.clone();
                staged.load_state_dict(&head, strict)?;
                Ok(Some(staged))
            }
            None if strict => Err(ChatGlm3Error::MissingCheckpointKey {
                key: WORD_EMBEDDINGS_FOR_HEAD_KEY.to_string(),
            }),
            None => {
                tracing::warn!("checkpoint has no head word embeddings");
                Ok(None)
            }
        }
    }

    pub fn universal_checkpoint_info(&self) -> UniversalCheckpointInfo {
        universal_checkpoint_info(self.universal_checkpoint_available)
    }
}

/// `[b, s] -> [b, len]`, copied out of the source buffer.
fn truncate_sequence(t: &Tensor, len: usize) -> candle_core::Result<Tensor> {
    t.narrow(1, 0, len)?.force_contiguous()
}

/// `[.., .., s, s] -> [.., .., len, len]`, copied out of the source buffer.
fn truncate_attention_mask(mask: &Tensor, len: usize) -> candle_core::Result<Tensor> {
    mask.narrow(2, 0, len)?.narrow(3, 0, len)?.force_contiguous()
}
