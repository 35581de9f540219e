//! Checkpoint dictionaries and parameter trees.
//!
//! A [`StateDict`] is the nested, ordered dictionary the distributed checkpoint
//! writer consumes: leaves are tensors, inner nodes are stage sub-dictionaries
//! such as `language_model`. A [`ParameterTree`] is the flat `name -> tensor`
//! view a module owns and loads into.
//!
//! On disk a state dictionary is flattened to dotted names and stored as
//! safetensors. The nesting travels in the file's `__metadata__` under
//! [`LAYOUT_METADATA_KEY`], so loading rebuilds every level in order.

pub mod adapter;
pub mod universal;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use indexmap::IndexMap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::error::{ChatGlm3Error, Result};

pub use adapter::{
    split_checkpoint, CheckpointParts, CheckpointSlot, LANGUAGE_MODEL_KEY, MOE_STATE_DICT_KEY, WORD_EMBEDDINGS_FOR_HEAD_KEY,
};
pub use universal::{universal_checkpoint_info, MergeStrategy, UniversalCheckpointInfo};

/// `__metadata__` entry holding the nesting of a saved [`StateDict`].
pub const LAYOUT_METADATA_KEY: &str = "state_dict_layout";

/// Skeleton of a [`StateDict`]: keys in order, tensors by their flattened name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LayoutNode {
    Tensor(String),
    Dict(Vec<(String, LayoutNode)>),
}

fn dotted(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[derive(Debug, Clone)]
pub enum StateValue {
    Tensor(Tensor),
    Dict(StateDict),
}

impl StateValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Dict(_) => None,
        }
    }

    pub fn as_dict(&self) -> Option<&StateDict> {
        match self {
            Self::Dict(d) => Some(d),
            Self::Tensor(_) => None,
        }
    }
}

impl From<Tensor> for StateValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<StateDict> for StateValue {
    fn from(d: StateDict) -> Self {
        Self::Dict(d)
    }
}

/// Ordered checkpoint dictionary. Insertion order is preserved so saved
/// checkpoints list keys the same way on every rank.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: IndexMap<String, StateValue>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert or replace `key`, keeping its original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    pub fn get_tensor(&self, key: &str) -> Option<&Tensor> {
        self.get(key).and_then(StateValue::as_tensor)
    }

    pub fn get_dict(&self, key: &str) -> Option<&StateDict> {
        self.get(key).and_then(StateValue::as_dict)
    }

    /// Remove `key`, keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.entries.shift_remove(key)
    }

    /// Remove a nested dictionary. A tensor under `key` is an error and stays in place.
    pub fn take_dict(&mut self, key: &str) -> Result<Option<StateDict>> {
        if let Some(StateValue::Tensor(_)) = self.entries.get(key) {
            return Err(ChatGlm3Error::InvalidCheckpointEntry {
                key: key.to_string(),
                expected: "dictionary",
            });
        }
        match self.remove(key) {
            Some(StateValue::Dict(d)) => Ok(Some(d)),
            _ => Ok(None),
        }
    }

    /// Remove every entry for which `pred` holds, in order.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&str) -> bool) -> StateDict {
        let mut taken = StateDict::new();
        let mut kept = IndexMap::with_capacity(self.entries.len());
        for (key, value) in self.entries.drain(..) {
            if pred(&key) {
                taken.entries.insert(key, value);
            } else {
                kept.insert(key, value);
            }
        }
        self.entries = kept;
        taken
    }

    /// Flatten nested dictionaries into dotted names.
    pub fn flatten(&self) -> IndexMap<String, Tensor> {
        let mut out = IndexMap::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut IndexMap<String, Tensor>) {
        for (key, value) in &self.entries {
            let name = dotted(prefix, key);
            match value {
                StateValue::Tensor(t) => {
                    out.insert(name, t.clone());
                }
                StateValue::Dict(d) => d.flatten_into(&name, out),
            }
        }
    }

    /// Rebuild nesting from dotted names, splitting at the first `.` whose head
    /// is one of `nested_keys`. Other names stay flat.
    pub fn unflatten<I>(flat: I, nested_keys: &[&str]) -> Self
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut root = StateDict::new();
        for (name, tensor) in flat {
            match name.split_once('.') {
                Some((head, rest)) if nested_keys.contains(&head) => {
                    let child = root
                        .entries
                        .entry(head.to_string())
                        .or_insert_with(|| StateValue::Dict(StateDict::new()));
                    if let StateValue::Dict(d) = child {
                        d.insert_dotted(rest, tensor, nested_keys);
                    }
                }
                _ => root.insert(name, tensor),
            }
        }
        root
    }

    fn insert_dotted(&mut self, name: &str, tensor: Tensor, nested_keys: &[&str]) {
        match name.split_once('.') {
            Some((head, rest)) if nested_keys.contains(&head) => {
                let child = self
                    .entries
                    .entry(head.to_string())
                    .or_insert_with(|| StateValue::Dict(StateDict::new()));
                if let StateValue::Dict(d) = child {
                    d.insert_dotted(rest, tensor, nested_keys);
                }
            }
            _ => self.insert(name, tensor),
        }
    }

    fn layout(
        &self,
        prefix: &str,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<(String, LayoutNode)>> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let name = dotted(prefix, key);
                let node = match value {
                    StateValue::Tensor(_) => {
                        if !seen.insert(name.clone()) {
                            return Err(ChatGlm3Error::DuplicateTensorName { name });
                        }
                        LayoutNode::Tensor(name)
                    }
                    StateValue::Dict(d) => LayoutNode::Dict(d.layout(&name, seen)?),
                };
                Ok((key.clone(), node))
            })
            .collect()
    }

    fn from_layout(
        layout: Vec<(String, LayoutNode)>,
        tensors: &mut HashMap<String, Tensor>,
    ) -> Result<Self> {
        let mut sd = StateDict::new();
        for (key, node) in layout {
            match node {
                LayoutNode::Tensor(name) => {
                    let tensor = tensors
                        .remove(&name)
                        .ok_or(ChatGlm3Error::MissingCheckpointKey { key: name })?;
                    sd.insert(key, tensor);
                }
                LayoutNode::Dict(children) => sd.insert(key, Self::from_layout(children, tensors)?),
            }
        }
        Ok(sd)
    }

    /// Write every tensor under its dotted name, plus the nesting as metadata.
    ///
    /// Fails with [`ChatGlm3Error::DuplicateTensorName`] when two entries
    /// flatten to the same name, e.g. a key `"a.b"` next to a dictionary `a`
    /// holding `b`.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let layout = self.layout("", &mut HashSet::new())?;
        let metadata = HashMap::from([(
            LAYOUT_METADATA_KEY.to_string(),
            serde_json::to_string(&layout)?,
        )]);
        let flat = self.flatten();
        safetensors::serialize_to_file(
            flat.iter().map(|(name, t)| (name.as_str(), t)),
            &Some(metadata),
            path.as_ref(),
        )?;
        Ok(())
    }

    /// Load a checkpoint written by [`Self::save_safetensors`].
    ///
    /// Files without layout metadata only get the fixed stage sub-dictionaries
    /// (`language_model`, `word_embeddings_for_head`, `moe_state_dict`) back;
    /// everything else stays under its dotted name.
    pub fn load_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
        let mut tensors = candle_core::safetensors::load_buffer(&buffer, device)?;

        let Some(layout) = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(LAYOUT_METADATA_KEY))
        else {
            let mut flat: Vec<(String, Tensor)> = tensors.into_iter().collect();
            // safetensors does not keep insertion order
            flat.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(Self::unflatten(
                flat,
                &[
                    LANGUAGE_MODEL_KEY,
                    WORD_EMBEDDINGS_FOR_HEAD_KEY,
                    MOE_STATE_DICT_KEY,
                ],
            ));
        };

        let layout: Vec<(String, LayoutNode)> = serde_json::from_str(layout)?;
        let sd = Self::from_layout(layout, &mut tensors)?;
        if !tensors.is_empty() {
            let mut keys: Vec<String> = tensors.into_keys().collect();
            keys.sort();
            return Err(ChatGlm3Error::UnexpectedCheckpointKeys { keys });
        }
        Ok(sd)
    }
}

impl IntoIterator for StateDict {
    type Item = (String, StateValue);
    type IntoIter = indexmap::map::IntoIter<String, StateValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, StateValue)> for StateDict {
    fn from_iter<T: IntoIterator<Item = (String, StateValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Named parameters owned by one module.
#[derive(Debug, Clone, Default)]
pub struct ParameterTree {
    params: IndexMap<String, Tensor>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.params.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Snapshot as a checkpoint dictionary with `prefix` prepended to every name.
    /// Without `keep_vars` the tensors are detached from any autograd graph.
    pub fn state_dict(&self, prefix: &str, keep_vars: bool) -> StateDict {
        self.params
            .iter()
            .map(|(name, t)| {
                let t = if keep_vars { t.clone() } else { t.detach() };
                (format!("{prefix}{name}"), StateValue::Tensor(t))
            })
            .collect()
    }

    /// Replace parameters from `state_dict`.
    ///
    /// Shapes must match. With `strict`, every parameter must be present and no
    /// extra keys are allowed. Nothing is replaced unless all checks pass.
    pub fn load_state_dict(&mut self, state_dict: &StateDict, strict: bool) -> Result<()> {
        let mut missing = Vec::new();
        let mut updates = Vec::with_capacity(self.params.len());
        for (name, current) in &self.params {
            match state_dict.get(name) {
                None => missing.push(name.clone()),
                Some(StateValue::Dict(_)) => {
                    return Err(ChatGlm3Error::InvalidCheckpointEntry {
                        key: name.clone(),
                        expected: "tensor",
                    })
                }
                Some(StateValue::Tensor(t)) => {
                    if t.shape() != current.shape() {
                        return Err(ChatGlm3Error::ParameterShapeMismatch {
                            key: name.clone(),
                            expected: current.shape().clone(),
                            found: t.shape().clone(),
                        });
                    }
                    updates.push((name.clone(), t.clone()));
                }
            }
        }
        let unexpected: Vec<String> = state_dict
            .keys()
            .filter(|k| !self.params.contains_key(*k))
            .map(str::to_string)
            .collect();

        if strict {
            if let Some(key) = missing.into_iter().next() {
                return Err(ChatGlm3Error::MissingCheckpointKey { key });
            }
            if !unexpected.is_empty() {
                return Err(ChatGlm3Error::UnexpectedCheckpointKeys { keys: unexpected });
            }
        } else if !missing.is_empty() || !unexpected.is_empty() {
            tracing::warn!(?missing, ?unexpected, "non-strict load skipped keys");
        }

        for (name, tensor) in updates {
            self.params.insert(name, tensor);
        }
        Ok(())
    }
}

impl FromIterator<(String, Tensor)> for ParameterTree {
    fn from_iter<T: IntoIterator<Item = (String, Tensor)>>(iter: T) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}
