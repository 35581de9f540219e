//! Word-embedding copy held by the last pipeline stage.
//!
//! With tied weights the output head reuses the word embeddings, but those
//! live on the first stage. A post-process-only stage therefore keeps its own
//! vocabulary shard, zero-initialized and then summed over the embedding group
//! so both ends start from the same table.

use candle_core::{DType, Device, Tensor};

use crate::checkpoint::{ParameterTree, StateDict};
use crate::error::{ChatGlm3Error, Result};
use crate::parallel::{Communicator, ReduceOp};

const WEIGHT: &str = "weight";

#[derive(Debug, Clone)]
pub struct WordEmbeddings {
    params: ParameterTree,
}

impl WordEmbeddings {
    /// Zero-initialized `[vocab_size / tp_world_size, hidden_size]` shard.
    pub fn zeros(
        vocab_size: usize,
        hidden_size: usize,
        tp_world_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if tp_world_size == 0 || vocab_size % tp_world_size != 0 {
            return Err(ChatGlm3Error::Config(format!(
                "vocab_size ({vocab_size}) must be divisible by tensor-parallel size ({tp_world_size})"
            )));
        }
        let weight = Tensor::zeros((vocab_size / tp_world_size, hidden_size), dtype, device)?;
        Ok(Self::from_weight(weight))
    }

    pub fn from_weight(weight: Tensor) -> Self {
        let mut params = ParameterTree::new();
        params.insert(WEIGHT, weight);
        Self { params }
    }

    pub fn weight(&self) -> Result<&Tensor> {
        self.params
            .get(WEIGHT)
            .ok_or_else(|| ChatGlm3Error::MissingCheckpointKey {
                key: WEIGHT.to_string(),
            })
    }

    /// Sum the table over `group`. The first stage joins the same collective
    /// with its trained embeddings, the other members with zeros.
    pub fn sync(&mut self, group: &dyn Communicator) -> Result<()> {
        let synced = group.all_reduce(self.weight()?, ReduceOp::Sum)?;
        self.params.insert(WEIGHT, synced);
        Ok(())
    }

    pub fn state_dict(&self, prefix: &str, keep_vars: bool) -> StateDict {
        self.params.state_dict(prefix, keep_vars)
    }

    pub fn load_state_dict(&mut self, state_dict: &StateDict, strict: bool) -> Result<()> {
        self.params.load_state_dict(state_dict, strict)
    }
}
