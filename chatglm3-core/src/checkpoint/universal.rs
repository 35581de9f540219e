//! Universal-checkpoint metadata.
//!
//! A universal checkpoint can be re-sharded for a different parallel layout.
//! The converter needs to know, per parameter name, how tensor-parallel slices
//! combine:
//!
//! | Category | Merge |
//! |---|---|
//! | vocabulary | concatenate rows, then strip vocabulary padding |
//! | tp-replicated | identical on every rank, average |
//! | row-parallel | concatenate along dim 1 |
//! | anything else | concatenate along dim 0 |
//!
//! Pattern strings are consumed verbatim by the converter and must not change.
//! Names are matched from their start.

use candle_core::Tensor;
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;

use crate::error::{ChatGlm3Error, Result};

pub const VOCABULARY_PARAMETER_PATTERNS: &str = "vocabulary_parameter_patterns";
pub const TP_REPLICATED_PARAMETER_PATTERNS: &str = "tp_replicated_parameter_patterns";
pub const PARAMETER_WITH_ROW_PARALLELISM_PATTERNS: &str =
    "parameter_with_row_parallelism_patterns";

const VOCABULARY_PATTERNS: &[&str] = &[r"tied_modules.embed.word_embeddings.weight"];

const TP_REPLICATED_PATTERNS: &[&str] = &[
    r"tied_modules.embed.position_embeddings.weight",
    r"\d+.input_layernorm.weight",
    r"\d+.input_layernorm.bias",
    r"\d+.post_attention_layernorm.weight",
    r"\d+.post_attention_layernorm.bias",
    r"\d+.self_attention.dense.bias",
    r"\d+.mlp.dense_4h_to_h.bias",
    r"\d+.weight",
    r"\d+.bias",
];

const ROW_PARALLEL_PATTERNS: &[&str] = &[
    r"\d+.mlp.dense_4h_to_h.weight",
    r"\d+.self_attention.dense.weight",
];

/// Category label to ordered pattern list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UniversalCheckpointInfo {
    categories: IndexMap<&'static str, Vec<&'static str>>,
}

/// Metadata for the converter. Empty when the runtime has no
/// universal-checkpoint support.
pub fn universal_checkpoint_info(available: bool) -> UniversalCheckpointInfo {
    let mut categories = IndexMap::new();
    if available {
        categories.insert(VOCABULARY_PARAMETER_PATTERNS, VOCABULARY_PATTERNS.to_vec());
        categories.insert(
            TP_REPLICATED_PARAMETER_PATTERNS,
            TP_REPLICATED_PATTERNS.to_vec(),
        );
        categories.insert(
            PARAMETER_WITH_ROW_PARALLELISM_PATTERNS,
            ROW_PARALLEL_PATTERNS.to_vec(),
        );
    }
    UniversalCheckpointInfo { categories }
}

impl UniversalCheckpointInfo {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn get(&self, category: &str) -> Option<&[&'static str]> {
        self.categories.get(category).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[&'static str])> + '_ {
        self.categories.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Compile the pattern tables for per-parameter lookups.
    pub fn matcher(&self) -> Result<ParameterMatcher> {
        let compile = |category: &str| -> Result<Vec<Regex>> {
            self.get(category)
                .unwrap_or_default()
                .iter()
                .map(|p| Regex::new(&format!("^(?:{p})")).map_err(ChatGlm3Error::from))
                .collect()
        };
        Ok(ParameterMatcher {
            vocabulary: compile(VOCABULARY_PARAMETER_PATTERNS)?,
            tp_replicated: compile(TP_REPLICATED_PARAMETER_PATTERNS)?,
            row_parallel: compile(PARAMETER_WITH_ROW_PARALLELISM_PATTERNS)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Slices are replicas; average them.
    Average,
    /// Slices are shards along `dim`.
    Concat { dim: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergePlan {
    pub strategy: MergeStrategy,
    /// Rows past the original vocabulary size are padding to drop after merging.
    pub vocabulary: bool,
}

impl MergePlan {
    /// Combine tensor-parallel slices, ordered by rank.
    pub fn merge(&self, slices: &[Tensor], original_vocab_size: Option<usize>) -> Result<Tensor> {
        if slices.is_empty() {
            return Err(ChatGlm3Error::Config("no slices to merge".into()));
        }
        let merged = match self.strategy {
            MergeStrategy::Average => Tensor::stack(slices, 0)?.mean(0)?,
            MergeStrategy::Concat { dim } => Tensor::cat(slices, dim)?,
        };
        match (self.vocabulary, original_vocab_size) {
            (true, Some(vocab)) if vocab < merged.dim(0)? => Ok(merged.narrow(0, 0, vocab)?),
            _ => Ok(merged),
        }
    }
}

/// Compiled pattern tables.
#[derive(Debug, Clone)]
pub struct ParameterMatcher {
    vocabulary: Vec<Regex>,
    tp_replicated: Vec<Regex>,
    row_parallel: Vec<Regex>,
}

impl ParameterMatcher {
    pub fn plan(&self, name: &str) -> MergePlan {
        let hit = |set: &[Regex]| set.iter().any(|re| re.is_match(name));
        let strategy = if hit(&self.tp_replicated) {
            MergeStrategy::Average
        } else if hit(&self.row_parallel) {
            MergeStrategy::Concat { dim: 1 }
        } else {
            MergeStrategy::Concat { dim: 0 }
        };
        MergePlan {
            strategy,
            vocabulary: hit(&self.vocabulary),
        }
    }
}
