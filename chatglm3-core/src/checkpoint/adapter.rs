//! Relocation of MoE and head-embedding state between the model's own
//! dictionaries and the layout the distributed checkpoint writer expects.
//!
//! ```text
//! inner stage                         checkpoint (top level)
//! ─────────────────────────           ──────────────────────────────
//! { ...,                              { <expert key>: T, ...          ← hoisted
//!   moe_state_dict: {                   language_model: { ... },
//!     <expert key>: T, ... } }          word_embeddings_for_head: {..} }
//! ```
//!
//! The writer does not understand nested MoE state, so expert entries travel
//! at the top level and are regrouped on load. Which keys count as expert
//! state is decided by substring match; those strings are part of the
//! checkpoint format.

use super::{StateDict, StateValue};
use crate::error::{ChatGlm3Error, Result};

pub const LANGUAGE_MODEL_KEY: &str = "language_model";
pub const WORD_EMBEDDINGS_FOR_HEAD_KEY: &str = "word_embeddings_for_head";
pub const MOE_STATE_DICT_KEY: &str = "moe_state_dict";

const EXPERT_MARKER: &str = "expert";
const MOE_GATE_WEIGHT: &str = "moe.gate.wg.weight";

/// Where a top-level checkpoint entry belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// The language-model sub-dictionary.
    LanguageModel,
    /// Word embeddings kept by the last pipeline stage for the tied head.
    HeadEmbedding,
    /// Expert parameters of an MoE layer (the router gate is not one).
    MoeExpert,
    Regular,
}

impl CheckpointSlot {
    pub fn classify(key: &str) -> Self {
        match key {
            LANGUAGE_MODEL_KEY => Self::LanguageModel,
            WORD_EMBEDDINGS_FOR_HEAD_KEY => Self::HeadEmbedding,
            k if k.contains(EXPERT_MARKER) && !k.contains(MOE_GATE_WEIGHT) => Self::MoeExpert,
            _ => Self::Regular,
        }
    }
}

/// Move every entry of `inner[moe_state_dict]` to the top of `out` and drop the
/// now-empty sub-dictionary. Returns how many entries moved.
pub fn hoist_moe_state(inner: &mut StateDict, out: &mut StateDict) -> Result<usize> {
    let Some(moe) = inner.take_dict(MOE_STATE_DICT_KEY)? else {
        return Ok(0);
    };
    let moved = moe.len();
    for (key, value) in moe {
        out.insert(key, value);
    }
    Ok(moved)
}

/// Top-level checkpoint entries grouped by [`CheckpointSlot`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointParts {
    pub language_model: Option<StateDict>,
    pub head_embeddings: Option<StateDict>,
    pub moe: StateDict,
    /// Entries of a dictionary saved without the `language_model` level.
    pub regular: StateDict,
}

/// Route every top-level entry by its slot. The language-model and head slots
/// must hold dictionaries.
pub fn split_checkpoint(state_dict: StateDict) -> Result<CheckpointParts> {
    let mut parts = CheckpointParts::default();
    for (key, value) in state_dict {
        match CheckpointSlot::classify(&key) {
            CheckpointSlot::LanguageModel => parts.language_model = Some(into_dict(key, value)?),
            CheckpointSlot::HeadEmbedding => parts.head_embeddings = Some(into_dict(key, value)?),
            CheckpointSlot::MoeExpert => parts.moe.insert(key, value),
            CheckpointSlot::Regular => parts.regular.insert(key, value),
        }
    }
    Ok(parts)
}

fn into_dict(key: String, value: StateValue) -> Result<StateDict> {
    match value {
        StateValue::Dict(d) => Ok(d),
        StateValue::Tensor(_) => Err(ChatGlm3Error::InvalidCheckpointEntry {
            key,
            expected: "dictionary",
        }),
    }
}

/// Put gathered expert entries back under `moe_state_dict`. Empty sets add nothing.
pub fn attach_moe_state(inner: &mut StateDict, moe: StateDict) {
    if !moe.is_empty() {
        inner.insert(MOE_STATE_DICT_KEY, moe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn t() -> Tensor {
        Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            CheckpointSlot::classify("language_model"),
            CheckpointSlot::LanguageModel
        );
        assert_eq!(
            CheckpointSlot::classify("word_embeddings_for_head"),
            CheckpointSlot::HeadEmbedding
        );
        assert_eq!(
            CheckpointSlot::classify(
                "encoder.layers.1.mlp.deepspeed_moe.experts.deepspeed_experts.0.dense_h_to_4h.weight"
            ),
            CheckpointSlot::MoeExpert
        );
        assert_eq!(
            CheckpointSlot::classify("encoder.layers.1.mlp.deepspeed_moe.gate.wg.weight"),
            CheckpointSlot::Regular
        );
        assert_eq!(
            CheckpointSlot::classify("encoder.final_layernorm.weight"),
            CheckpointSlot::Regular
        );
    }

    #[test]
    fn test_gate_with_expert_marker_stays_regular() {
        // A gate weight under an "expert"-named module is still routed with the model.
        assert_eq!(
            CheckpointSlot::classify("experts_block.moe.gate.wg.weight"),
            CheckpointSlot::Regular
        );
    }

    #[test]
    fn test_hoist_then_split() {
        let mut moe = StateDict::new();
        moe.insert("layers.0.experts.0.w", t());
        moe.insert("layers.0.experts.1.w", t());
        let mut inner = StateDict::new();
        inner.insert("embedding.word_embeddings.weight", t());
        inner.insert(MOE_STATE_DICT_KEY, moe);

        let mut out = StateDict::new();
        assert_eq!(hoist_moe_state(&mut inner, &mut out).unwrap(), 2);
        assert!(!inner.contains_key(MOE_STATE_DICT_KEY));
        out.insert(LANGUAGE_MODEL_KEY, inner);
        out.insert(WORD_EMBEDDINGS_FOR_HEAD_KEY, StateDict::new());
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            vec![
                "layers.0.experts.0.w",
                "layers.0.experts.1.w",
                "language_model",
                "word_embeddings_for_head"
            ]
        );

        let parts = split_checkpoint(out).unwrap();
        assert_eq!(parts.moe.len(), 2);
        assert!(parts.regular.is_empty());
        assert!(parts.head_embeddings.unwrap().is_empty());
        let mut inner = parts.language_model.unwrap();
        attach_moe_state(&mut inner, parts.moe);
        assert_eq!(
            inner.keys().collect::<Vec<_>>(),
            vec!["embedding.word_embeddings.weight", "moe_state_dict"]
        );
    }

    #[test]
    fn test_split_unwrapped_dictionary() {
        let mut inner = StateDict::new();
        inner.insert("w", t());
        let mut out = StateDict::new();
        assert_eq!(hoist_moe_state(&mut inner, &mut out).unwrap(), 0);

        let mut flat = StateDict::new();
        flat.insert("w", t());
        flat.insert("encoder.layers.0.mlp.deepspeed_moe.gate.wg.weight", t());
        let parts = split_checkpoint(flat).unwrap();
        assert!(parts.language_model.is_none());
        assert!(parts.moe.is_empty());
        let mut inner = parts.regular;
        attach_moe_state(&mut inner, parts.moe);
        assert_eq!(
            inner.keys().collect::<Vec<_>>(),
            vec!["w", "encoder.layers.0.mlp.deepspeed_moe.gate.wg.weight"]
        );
    }

    #[test]
    fn test_split_rejects_tensor_in_dictionary_slot() {
        let mut sd = StateDict::new();
        sd.insert(WORD_EMBEDDINGS_FOR_HEAD_KEY, t());
        let err = split_checkpoint(sd).unwrap_err();
        assert!(matches!(
            err,
            ChatGlm3Error::InvalidCheckpointEntry { ref key, .. } if key == WORD_EMBEDDINGS_FOR_HEAD_KEY
        ));
    }
}
