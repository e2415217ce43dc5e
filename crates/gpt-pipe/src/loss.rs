//! Masked token-level cross entropy.

use crate::tensor::{DType, Tensor};
use anyhow::{ensure, Result};

/// Cross entropy over unnormalized logits with a 0/1 token mask:
/// `sum(per-token loss * mask) / sum(mask)`.
///
/// `fp16` records that the surrounding training loop runs the head in half
/// precision; the host reduction itself always accumulates in `f32`, so the
/// flag is carried for the runtime rather than acted on here.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss {
    pub fp16: bool,
}

impl CrossEntropyLoss {
    pub fn new(fp16: bool) -> Self {
        CrossEntropyLoss { fp16 }
    }

    /// Reduces `[.., vocab]` logits against integer labels and a loss mask
    /// whose shapes match the logits' leading axes.
    pub fn compute(&self, logits: &Tensor, labels: &Tensor, loss_mask: &Tensor) -> Result<f32> {
        let dims = logits.shape().dims();
        ensure!(
            dims.len() >= 2,
            "logits must be at least 2D, got {:?}",
            dims
        );
        let vocab = dims[dims.len() - 1];
        let rows: usize = dims[..dims.len() - 1].iter().product();
        ensure!(
            labels.dtype() == DType::I32,
            "labels must have dtype I32, got {:?}",
            labels.dtype()
        );
        ensure!(
            labels.len() == rows && loss_mask.len() == rows,
            "labels ({}) and loss mask ({}) must cover {} tokens",
            labels.len(),
            loss_mask.len(),
            rows
        );

        let lv = logits.data();
        let labelv = labels.data_i32();
        let maskv = loss_mask.data();

        let mut weighted = 0.0f32;
        let mut mask_sum = 0.0f32;
        for r in 0..rows {
            let mask = maskv[r];
            mask_sum += mask;
            if mask == 0.0 {
                continue;
            }
            let label = labelv[r];
            ensure!(
                label >= 0 && (label as usize) < vocab,
                "label {} at token {} out of range for vocabulary of {}",
                label,
                r,
                vocab
            );
            let row = &lv[r * vocab..(r + 1) * vocab];
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
            weighted += (log_sum - row[label as usize]) * mask;
        }
        ensure!(mask_sum > 0.0, "loss mask selects no tokens");
        Ok(weighted / mask_sum)
    }
}
