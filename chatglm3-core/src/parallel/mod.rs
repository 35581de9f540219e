//! Parallel-group plumbing.
//!
//! The collectives themselves (NCCL, MPI, ...) live outside this crate and are
//! reached through [`Communicator`]. Every rank runs the same forward and
//! checkpoint code; ranks only meet inside these calls.
//!
//! ```text
//! ParallelContext
//!   ├── tensor_parallel     - vocabulary / hidden sharding
//!   ├── sequence_parallel   - sequence-axis sharding
//!   └── embedding_group     - first + last pipeline stage (tied embeddings)
//! ```

pub mod cross_entropy;
pub mod layers;

use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};

pub use cross_entropy::{
    compute_lm_loss, masked_lm_loss, CollectiveCrossEntropy, CrossEntropyAlgorithm,
    VocabCrossEntropy,
};
pub use layers::parallel_lm_logits;

/// Reduction applied by [`Communicator::all_reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// A process group the current rank belongs to.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise reduction of `tensor` across the group. Every rank gets the result.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Concatenate every rank's `tensor` along `dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// The trivial group of one process. All collectives are identities.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcessComm;

impl Communicator for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

/// The process groups one model replica talks to.
#[derive(Clone)]
pub struct ParallelContext {
    pub tensor_parallel: Arc<dyn Communicator>,
    pub sequence_parallel: Arc<dyn Communicator>,
    /// Ranks holding a copy of the tied word embeddings. `None` outside pipeline runs.
    pub embedding_group: Option<Arc<dyn Communicator>>,
}

impl ParallelContext {
    pub fn new(
        tensor_parallel: Arc<dyn Communicator>,
        sequence_parallel: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            tensor_parallel,
            sequence_parallel,
            embedding_group: None,
        }
    }

    /// Every group is this process alone.
    pub fn single_process() -> Self {
        Self::new(Arc::new(SingleProcessComm), Arc::new(SingleProcessComm))
    }

    pub fn with_embedding_group(mut self, group: Arc<dyn Communicator>) -> Self {
        self.embedding_group = Some(group);
        self
    }

    pub fn tensor_parallel_world_size(&self) -> usize {
        self.tensor_parallel.world_size()
    }

    pub fn tensor_parallel_rank(&self) -> usize {
        self.tensor_parallel.rank()
    }

    pub fn sequence_parallel_world_size(&self) -> usize {
        self.sequence_parallel.world_size()
    }
}

impl fmt::Debug for ParallelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelContext")
            .field("tp_rank", &self.tensor_parallel.rank())
            .field("tp_world_size", &self.tensor_parallel.world_size())
            .field("sp_rank", &self.sequence_parallel.rank())
            .field("sp_world_size", &self.sequence_parallel.world_size())
            .field("has_embedding_group", &self.embedding_group.is_some())
            .finish()
    }
}
