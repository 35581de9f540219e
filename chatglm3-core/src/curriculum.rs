//! Sequence-length curriculum state shared within one training process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Handle to the current curriculum sequence length.
///
/// Clones share the same value. The model overwrites it on every forward call
/// that supplies a length, so concurrent forward passes with different lengths
/// in one process need outside synchronization.
#[derive(Debug, Clone)]
pub struct CurriculumHandle {
    seqlen: Arc<AtomicUsize>,
}

impl CurriculumHandle {
    pub fn new(initial_seqlen: usize) -> Self {
        Self {
            seqlen: Arc::new(AtomicUsize::new(initial_seqlen)),
        }
    }

    pub fn current(&self) -> usize {
        self.seqlen.load(Ordering::Acquire)
    }

    pub fn set(&self, seqlen: usize) {
        self.seqlen.store(seqlen, Ordering::Release);
    }
}
