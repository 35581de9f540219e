//! Vocabulary-parallel cross-entropy.
//!
//! Two reductions exist and the sequence-parallel degree picks between them:
//!
//! - **Tensor parallel**: the vocabulary axis is sharded. Max, target logit and
//!   softmax denominator are each all-reduced over the tensor-parallel group.
//! - **Sequence parallel**: each rank holds the full vocabulary for a slice of
//!   the sequence. Loss is computed locally and all-gathered along the
//!   sequence axis.
//!
//! Both take logits `[s, b, v]` and labels `[s, b]` and return loss shaped like
//! the labels (the sequence-parallel variant covers the full sequence).

use std::sync::Arc;

use candle_core::{DType, Result, Tensor, D};

use super::layers::{vocab_dim, vocab_range};
use super::{Communicator, ParallelContext, ReduceOp};
use crate::error::{ChatGlm3Error, Result as ModelResult};

/// Per-token cross-entropy kernels for both parallel layouts.
pub trait VocabCrossEntropy: Send + Sync {
    fn sequence_parallel_xent(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor>;

    fn tensor_parallel_xent(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossEntropyAlgorithm {
    SequenceParallel,
    TensorParallel,
}

impl CrossEntropyAlgorithm {
    pub fn select(sequence_parallel_world_size: usize) -> Self {
        if sequence_parallel_world_size > 1 {
            Self::SequenceParallel
        } else {
            Self::TensorParallel
        }
    }

    pub fn apply(
        self,
        kernels: &dyn VocabCrossEntropy,
        logits: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor> {
        match self {
            Self::SequenceParallel => kernels.sequence_parallel_xent(logits, labels),
            Self::TensorParallel => kernels.tensor_parallel_xent(logits, labels),
        }
    }
}

/// Cross-entropy kernels backed by the tensor- and sequence-parallel groups.
#[derive(Clone)]
pub struct CollectiveCrossEntropy {
    tensor_parallel: Arc<dyn Communicator>,
    sequence_parallel: Arc<dyn Communicator>,
}

impl CollectiveCrossEntropy {
    pub fn new(
        tensor_parallel: Arc<dyn Communicator>,
        sequence_parallel: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            tensor_parallel,
            sequence_parallel,
        }
    }

    pub fn from_context(ctx: &ParallelContext) -> Self {
        Self::new(ctx.tensor_parallel.clone(), ctx.sequence_parallel.clone())
    }
}

impl VocabCrossEntropy for CollectiveCrossEntropy {
    fn sequence_parallel_xent(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        vocab_sequence_parallel_cross_entropy(logits, labels, &*self.sequence_parallel)
    }

    fn tensor_parallel_xent(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        vocab_parallel_cross_entropy(logits, labels, &*self.tensor_parallel)
    }
}

/// Cross-entropy over a vocabulary sharded across `comm`.
///
/// Rank `r` holds vocabulary rows `[r * v_local, (r + 1) * v_local)`. Targets
/// outside that range contribute zero to the local target logit.
pub fn vocab_parallel_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    comm: &dyn Communicator,
) -> Result<Tensor> {
    let labels_shape = labels.shape().clone();
    let local_vocab = vocab_dim(logits)?;
    let n = labels.elem_count();
    let logits = logits.reshape((n, local_vocab))?;

    // Subtract the global max for numerical stability.
    let logits_max = comm.all_reduce(&logits.max_keepdim(1)?, ReduceOp::Max)?;
    let logits = logits.broadcast_sub(&logits_max)?;

    let (start, end) = vocab_range(local_vocab, comm.rank());
    let labels = labels.flatten_all()?.to_dtype(DType::I64)?;
    let in_range = labels
        .ge(start as i64)?
        .mul(&labels.lt(end as i64)?)?;
    let shifted = labels.broadcast_sub(&Tensor::new(start as i64, labels.device())?)?;
    let masked_target = in_range
        .where_cond(&shifted, &shifted.zeros_like()?)?
        .to_dtype(DType::U32)?;

    let predicted = logits.gather(&masked_target.unsqueeze(1)?, 1)?.squeeze(1)?;
    let predicted = (predicted * in_range.to_dtype(logits.dtype())?)?;
    let predicted = comm.all_reduce(&predicted, ReduceOp::Sum)?;

    let sum_exp = comm.all_reduce(&logits.exp()?.sum(1)?, ReduceOp::Sum)?;
    (sum_exp.log()? - predicted)?.reshape(labels_shape)
}

/// Cross-entropy for a sequence split across `comm`, full vocabulary per rank.
///
/// `logits`: `[s / p, b, v]`, `labels`: `[s / p, b]`. Returns `[s, b]`.
pub fn vocab_sequence_parallel_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    comm: &dyn Communicator,
) -> Result<Tensor> {
    let (s_local, b) = labels.dims2()?;
    let vocab = vocab_dim(logits)?;
    let log_probs =
        candle_nn::ops::log_softmax(&logits.reshape((s_local * b, vocab))?, D::Minus1)?;
    let target = labels.flatten_all()?.to_dtype(DType::U32)?.unsqueeze(1)?;
    let loss = log_probs
        .gather(&target, 1)?
        .squeeze(1)?
        .neg()?
        .reshape((s_local, b))?;
    comm.all_gather(&loss, 0)
}

/// Per-token LM loss for logits `[s, b, v]` and labels `[s, b]`.
///
/// With `fp16_lm_cross_entropy` the logits must already be `F16`; otherwise
/// they are promoted to `F32` first.
pub fn compute_lm_loss(
    kernels: &dyn VocabCrossEntropy,
    sequence_parallel_world_size: usize,
    logits: &Tensor,
    labels: &Tensor,
    fp16_lm_cross_entropy: bool,
) -> ModelResult<Tensor> {
    let logits = if fp16_lm_cross_entropy {
        if logits.dtype() != DType::F16 {
            return Err(ChatGlm3Error::PrecisionMismatch {
                found: logits.dtype(),
            });
        }
        logits.clone()
    } else {
        logits.to_dtype(DType::F32)?
    };
    let algorithm = CrossEntropyAlgorithm::select(sequence_parallel_world_size);
    tracing::trace!(?algorithm, sequence_parallel_world_size, "computing lm loss");
    Ok(algorithm.apply(kernels, &logits, labels)?)
}

/// Mean LM loss over the tokens selected by `loss_mask`.
///
/// `output`: logits `[s, b, v]`; `labels` and `loss_mask`: `[b, s]`. The
/// denominator is the mask sum, so an all-zero mask is rejected.
pub fn masked_lm_loss(
    kernels: &dyn VocabCrossEntropy,
    output: &Tensor,
    labels: &Tensor,
    loss_mask: &Tensor,
) -> ModelResult<Tensor> {
    // [b s] => [s b]
    let labels = labels.t()?.contiguous()?;
    let output = output.contiguous()?.to_dtype(DType::F32)?;
    let losses = kernels.tensor_parallel_xent(&output, &labels)?;
    // [s b] => [b s]
    let losses = losses.t()?.contiguous()?;

    let loss_mask = loss_mask.to_dtype(DType::F32)?.flatten_all()?;
    let denominator = loss_mask.sum_all()?.to_scalar::<f32>()?;
    if denominator == 0.0 {
        return Err(ChatGlm3Error::DegenerateMask);
    }
    let numerator = (losses.flatten_all()? * loss_mask)?.sum_all()?;
    Ok((numerator / f64::from(denominator))?)
}
