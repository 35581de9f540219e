//! Model and runtime configuration.
//!
//! Mirrors the training arguments that decide how the model is wired and how
//! its loss is computed. Loaded from JSON like a HuggingFace `config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChatGlm3Error, Result};

#[macro_export]
macro_rules! serde_default_fn {
    ($t:ty, $name:ident, $v:expr) => {
        fn $name() -> $t {
            $v
        }
    };
}

serde_default_fn!(bool, untie_default, false);
serde_default_fn!(bool, fp16_lm_cross_entropy_default, false);
serde_default_fn!(bool, parallel_output_default, true);
serde_default_fn!(bool, return_moe_loss_default, true);
serde_default_fn!(bool, curriculum_legacy_default, false);
serde_default_fn!(bool, universal_checkpoint_info_default, true);
serde_default_fn!(usize, num_experts_default, 1);

/// Configuration for a ChatGLM-3 model replica on one rank.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatGlm3Config {
    /// Full (padded) vocabulary size across all tensor-parallel ranks.
    pub vocab_size: usize,
    pub hidden_size: usize,
    /// Configured training sequence length.
    pub seq_length: usize,
    #[serde(default = "num_experts_default")]
    pub num_experts: usize,
    /// Keep a separate output-layer weight instead of reusing the word embeddings.
    #[serde(default = "untie_default")]
    pub untie_embeddings_and_output_weights: bool,
    /// Compute the LM cross-entropy directly on half-precision logits.
    #[serde(default = "fp16_lm_cross_entropy_default")]
    pub fp16_lm_cross_entropy: bool,
    /// Leave logits sharded over the vocabulary instead of gathering them.
    #[serde(default = "parallel_output_default")]
    pub parallel_output: bool,
    #[serde(default = "return_moe_loss_default")]
    pub return_moe_loss: bool,
    /// Reset the curriculum length to `seq_length` whenever a forward call
    /// does not supply one.
    #[serde(default = "curriculum_legacy_default")]
    pub curriculum_learning_legacy: bool,
    /// Whether the checkpoint converter understands universal-checkpoint metadata.
    #[serde(default = "universal_checkpoint_info_default")]
    pub universal_checkpoint_info: bool,
}

impl ChatGlm3Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(ChatGlm3Error::Config("vocab_size must be non-zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(ChatGlm3Error::Config("hidden_size must be non-zero".into()));
        }
        if self.seq_length == 0 {
            return Err(ChatGlm3Error::Config("seq_length must be non-zero".into()));
        }
        if self.num_experts == 0 {
            return Err(ChatGlm3Error::Config("num_experts must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether the output head reuses the word-embedding table.
    pub fn tie_word_embeddings(&self) -> bool {
        !self.untie_embeddings_and_output_weights
    }

    pub fn is_moe(&self) -> bool {
        self.num_experts > 1
    }
}
