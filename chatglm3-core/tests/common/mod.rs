//! Shared fixtures: a recording inner stage and an in-process process group.

#![allow(dead_code)]

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use chatglm3_core::checkpoint::MOE_STATE_DICT_KEY;
use chatglm3_core::{
    ChatGlm3Config, ChatGlm3Error, Communicator, InferenceParams, LanguageModelInputs,
    LanguageModelStage, ParameterTree, PipelineStage, ReduceOp, Result, StageOutput, StateDict,
};

pub const WORD_EMBEDDINGS: &str = "embedding.word_embeddings.weight";
pub const OUTPUT_LAYER: &str = "output_layer.weight";
pub const FINAL_LAYERNORM: &str = "encoder.final_layernorm.weight";
pub const MOE_GATE: &str = "encoder.layers.0.mlp.deepspeed_moe.gate.wg.weight";
pub const EXPERT_0: &str =
    "encoder.layers.0.mlp.deepspeed_moe.experts.deepspeed_experts.0.dense_h_to_4h.weight";
pub const EXPERT_1: &str =
    "encoder.layers.0.mlp.deepspeed_moe.experts.deepspeed_experts.1.dense_h_to_4h.weight";

pub fn config(vocab_size: usize, hidden_size: usize, seq_length: usize) -> ChatGlm3Config {
    ChatGlm3Config::from_json_str(&format!(
        r#"{{"vocab_size": {vocab_size}, "hidden_size": {hidden_size}, "seq_length": {seq_length}}}"#
    ))
    .unwrap()
}

/// What the inner stage was called with.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub input_ids: Tensor,
    pub position_ids: Tensor,
    pub attention_mask: Tensor,
    pub had_retriever: bool,
    pub inference_params: Option<InferenceParams>,
}

/// Inner stage stand-in. Embeds tokens on pre-process stages, otherwise
/// passes the received input tensor through (zeros when none was set).
pub struct MockStage {
    pub params: ParameterTree,
    pub experts: ParameterTree,
    pub moe_layers: usize,
    hidden_size: usize,
    input_tensor: Option<Tensor>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockStage {
    /// Random weights for the parts `stage` owns.
    pub fn new(
        cfg: &ChatGlm3Config,
        stage: PipelineStage,
        untied: bool,
        moe: bool,
        dtype: DType,
    ) -> Self {
        let dev = Device::Cpu;
        let rand = |shape: (usize, usize)| {
            Tensor::randn(0f32, 1., shape, &dev)
                .unwrap()
                .to_dtype(dtype)
                .unwrap()
        };
        let (v, h) = (cfg.vocab_size, cfg.hidden_size);

        let mut params = ParameterTree::new();
        if stage.pre_process {
            params.insert(WORD_EMBEDDINGS, rand((v, h)));
        }
        params.insert(
            FINAL_LAYERNORM,
            Tensor::ones(h, dtype, &dev).unwrap(),
        );
        if stage.post_process && untied {
            params.insert(OUTPUT_LAYER, rand((v, h)));
        }

        let mut experts = ParameterTree::new();
        if moe {
            params.insert(MOE_GATE, rand((2, h)));
            experts.insert(EXPERT_0, rand((4 * h, h)));
            experts.insert(EXPERT_1, rand((4 * h, h)));
        }

        Self {
            params,
            experts,
            moe_layers: usize::from(moe),
            hidden_size: h,
            input_tensor: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Same layout with every parameter zeroed.
    pub fn zeroed_like(other: &Self) -> Self {
        let zero = |tree: &ParameterTree| -> ParameterTree {
            tree.names()
                .map(|n| (n.to_string(), tree.get(n).unwrap().zeros_like().unwrap()))
                .collect()
        };
        Self {
            params: zero(&other.params),
            experts: zero(&other.experts),
            moe_layers: other.moe_layers,
            hidden_size: other.hidden_size,
            input_tensor: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl LanguageModelStage for MockStage {
    fn forward(&self, inputs: LanguageModelInputs<'_>) -> Result<StageOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            input_ids: inputs.input_ids.clone(),
            position_ids: inputs.position_ids.clone(),
            attention_mask: inputs.attention_mask.clone(),
            had_retriever: inputs.retriever.is_some(),
            inference_params: inputs.inference_params.cloned(),
        });

        let (b, s) = inputs.input_ids.dims2()?;
        let hidden_states = match (self.params.get(WORD_EMBEDDINGS), &self.input_tensor) {
            (Some(table), _) => {
                let ids = inputs.input_ids.flatten_all()?;
                // [b s h] => [s b h]
                table
                    .index_select(&ids, 0)?
                    .reshape((b, s, self.hidden_size))?
                    .transpose(0, 1)?
                    .contiguous()?
            }
            (None, Some(received)) => received.clone(),
            (None, None) => Tensor::zeros(
                (s, b, self.hidden_size),
                DType::F32,
                inputs.input_ids.device(),
            )?,
        };

        let moe_losses = (0..self.moe_layers)
            .map(|i| Tensor::new(0.1f32 * (i + 1) as f32, hidden_states.device()))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(StageOutput {
            hidden_states,
            moe_losses,
        })
    }

    fn set_input_tensor(&mut self, input_tensor: Option<Tensor>) {
        self.input_tensor = input_tensor;
    }

    fn word_embeddings_weight(&self) -> Option<&Tensor> {
        self.params.get(WORD_EMBEDDINGS)
    }

    fn output_layer_weight(&self) -> Option<&Tensor> {
        self.params.get(OUTPUT_LAYER)
    }

    fn state_dict_for_save_checkpoint(&self, prefix: &str, keep_vars: bool) -> Result<StateDict> {
        let mut sd = self.params.state_dict(prefix, keep_vars);
        if !self.experts.is_empty() {
            sd.insert(MOE_STATE_DICT_KEY, self.experts.state_dict(prefix, keep_vars));
        }
        Ok(sd)
    }

    fn load_state_dict(&mut self, mut state_dict: StateDict, strict: bool) -> Result<()> {
        let moe = state_dict.take_dict(MOE_STATE_DICT_KEY)?;
        self.params.load_state_dict(&state_dict, strict)?;
        match moe {
            Some(moe) => self.experts.load_state_dict(&moe, strict),
            None if strict && !self.experts.is_empty() => Err(ChatGlm3Error::MissingCheckpointKey {
                key: MOE_STATE_DICT_KEY.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Identity collectives that report an arbitrary world size.
#[derive(Debug, Clone, Copy)]
pub struct FixedWorld {
    pub rank: usize,
    pub world_size: usize,
}

impl Communicator for FixedWorld {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> CandleResult<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> CandleResult<Tensor> {
        Ok(tensor.clone())
    }
}

struct LocalGroup {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// One member of a process group whose ranks are threads of this process.
pub struct LocalComm {
    rank: usize,
    world_size: usize,
    group: Arc<LocalGroup>,
}

impl LocalComm {
    pub fn group(world_size: usize) -> Vec<Arc<LocalComm>> {
        let group = Arc::new(LocalGroup {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| {
                Arc::new(LocalComm {
                    rank,
                    world_size,
                    group: group.clone(),
                })
            })
            .collect()
    }

    fn exchange(&self, tensor: &Tensor) -> Vec<Tensor> {
        self.group.slots.lock().unwrap()[self.rank] = Some(tensor.clone());
        self.group.barrier.wait();
        let all = self
            .group
            .slots
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.clone().unwrap())
            .collect();
        self.group.barrier.wait();
        all
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> CandleResult<Tensor> {
        let all = self.exchange(tensor);
        let mut acc = all[0].clone();
        for t in &all[1..] {
            acc = match op {
                ReduceOp::Sum => (acc + t)?,
                ReduceOp::Max => acc.maximum(t)?,
            };
        }
        Ok(acc)
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> CandleResult<Tensor> {
        Tensor::cat(&self.exchange(tensor), dim)
    }
}

pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    assert_eq!(a.dims(), b.dims());
    let diff = (a.to_dtype(DType::F32).unwrap() - b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff <= tol, "max abs diff {diff} > {tol}");
}
