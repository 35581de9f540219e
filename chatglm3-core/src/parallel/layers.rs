use candle_core::{Result, Tensor, D};

use super::Communicator;

/// Project hidden states onto the (possibly sharded) vocabulary.
///
/// `hidden`: `[s, b, h]`, `word_embeddings`: `[v_local, h]`. Returns
/// `[s, b, v_local]` when `parallel_output` is set, otherwise the vocabulary
/// shards of the tensor-parallel group are gathered into `[s, b, v]`.
pub fn parallel_lm_logits(
    hidden: &Tensor,
    word_embeddings: &Tensor,
    parallel_output: bool,
    tp_comm: &dyn Communicator,
) -> Result<Tensor> {
    let (s, b, h) = hidden.dims3()?;
    let local_vocab = word_embeddings.dim(0)?;
    let logits = hidden
        .reshape((s * b, h))?
        .matmul(&word_embeddings.t()?)?
        .reshape((s, b, local_vocab))?;
    if parallel_output || tp_comm.world_size() == 1 {
        return Ok(logits);
    }
    tp_comm.all_gather(&logits, 2)
}

/// Index of the first vocabulary row resident on `rank`, and one past the last.
pub fn vocab_range(local_vocab_size: usize, rank: usize) -> (usize, usize) {
    let start = local_vocab_size * rank;
    (start, start + local_vocab_size)
}

/// Vocabulary width of a logits tensor, whatever its leading axes are.
pub(crate) fn vocab_dim(logits: &Tensor) -> Result<usize> {
    logits.dim(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{ReduceOp, SingleProcessComm};
    use candle_core::{DType, Device};

    /// Two-rank group where the peer holds the same shard.
    struct MirrorComm;

    impl Communicator for MirrorComm {
        fn rank(&self) -> usize {
            0
        }
        fn world_size(&self) -> usize {
            2
        }
        fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
            match op {
                ReduceOp::Sum => tensor + tensor,
                ReduceOp::Max => Ok(tensor.clone()),
            }
        }
        fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
            Tensor::cat(&[tensor, tensor], dim)
        }
    }

    #[test]
    fn test_logits_shape_and_values() {
        let dev = Device::Cpu;
        // s=2, b=1, h=2
        let hidden = Tensor::new(&[[[1f32, 0.]], [[0., 1.]]], &dev).unwrap();
        // v=3
        let weight = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &dev).unwrap();
        let logits = parallel_lm_logits(&hidden, &weight, true, &SingleProcessComm).unwrap();
        assert_eq!(logits.dims(), &[2, 1, 3]);
        assert_eq!(
            logits.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1., 3., 5.]], vec![vec![2., 4., 6.]]]
        );
    }

    #[test]
    fn test_gather_only_without_parallel_output() {
        let dev = Device::Cpu;
        let hidden = Tensor::ones((4, 2, 8), DType::F32, &dev).unwrap();
        let weight = Tensor::ones((5, 8), DType::F32, &dev).unwrap();

        let sharded = parallel_lm_logits(&hidden, &weight, true, &MirrorComm).unwrap();
        assert_eq!(sharded.dims(), &[4, 2, 5]);

        let gathered = parallel_lm_logits(&hidden, &weight, false, &MirrorComm).unwrap();
        assert_eq!(gathered.dims(), &[4, 2, 10]);
        assert_eq!(vocab_dim(&gathered).unwrap(), 10);
    }

    #[test]
    fn test_vocab_range() {
        assert_eq!(vocab_range(100, 0), (0, 100));
        assert_eq!(vocab_range(100, 3), (300, 400));
    }
}
