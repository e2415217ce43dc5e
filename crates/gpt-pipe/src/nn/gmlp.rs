//! Attention-free gated-MLP layer variant.
//!
//! Replaces attention with a SwiGLU expansion followed by a causally masked
//! spatial-gating step: per-position mixing weights over the sequence axis,
//! masked with the same rule the attention layers use and normalized with a
//! softmax. The layer owns no key/value cache; in inference it forwards the
//! cache containers untouched.

use super::norm::LayerNormParams;
use crate::config::GptPipeConfig;
use crate::ops::functional;
use crate::pipe::io::{causal_mask, StageIo, StageValue};
use crate::pipe::spec::MaskRule;
use crate::tensor::{Shape, Tensor};
use anyhow::{bail, ensure, Result};
use rand::Rng;

#[derive(Debug)]
pub struct GatedMlpBlockStage {
    index: usize,
    mask: MaskRule,
    context_length: usize,
    pub ln: LayerNormParams,
    pub w_gate: Tensor,
    pub b_gate: Tensor,
    pub w_up: Tensor,
    pub b_up: Tensor,
    pub w_spatial: Tensor,
    pub w_down: Tensor,
    pub b_down: Tensor,
}

impl GatedMlpBlockStage {
    pub fn random(
        index: usize,
        mask: MaskRule,
        config: &GptPipeConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let h = config.hidden_size;
        let m = config.mlp_hidden();
        let ctx = config.context_length;
        let std = config.init_std;
        GatedMlpBlockStage {
            index,
            mask,
            context_length: ctx,
            ln: LayerNormParams::identity(h, config.layer_norm_eps),
            w_gate: Tensor::randn(Shape::new([h, m]), std, rng),
            b_gate: Tensor::zeros(Shape::new([m])),
            w_up: Tensor::randn(Shape::new([h, m]), std, rng),
            b_up: Tensor::zeros(Shape::new([m])),
            w_spatial: Tensor::randn(Shape::new([ctx, ctx]), std, rng),
            w_down: Tensor::randn(Shape::new([m, h]), std, rng),
            b_down: Tensor::zeros(Shape::new([h])),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Mixing weights for a length-`s` segment: the `[s, s]` corner of the
    /// spatial table, masked and row-normalized.
    fn spatial_weights(&self, s: usize) -> Result<Tensor> {
        ensure!(
            s <= self.context_length,
            "sequence length {} exceeds context length {}",
            s,
            self.context_length
        );
        let full = self.w_spatial.data();
        let mut corner = Vec::with_capacity(s * s);
        for i in 0..s {
            let row = i * self.context_length;
            corner.extend_from_slice(&full[row..row + s]);
        }
        let mut logits = Tensor::from_vec(Shape::new([s, s]), corner)?;
        // Gating is strictly local to the current segment, so the causal
        // structure is rebuilt here rather than taken from the inter-stage
        // mask (whose key axis covers the cached history too).
        let local_mask = causal_mask(s, s)?;
        self.mask.apply(&mut logits, &local_mask)?;
        functional::softmax_last_axis(&logits)
    }

    fn block_forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let dims = hidden.shape().dims();
        ensure!(
            dims.len() == 3,
            "gated-mlp block expects [seq, batch, hidden], got {:?}",
            dims
        );
        let (s, b) = (dims[0], dims[1]);

        let normed = self.ln.forward(hidden)?;
        let gate = functional::add_bias(&functional::matmul(&normed, &self.w_gate)?, &self.b_gate)?;
        let up = functional::add_bias(&functional::matmul(&normed, &self.w_up)?, &self.b_up)?;
        let expanded = functional::swiglu(&gate, &up)?;

        let m = expanded.shape().dims()[2];
        let weights = self.spatial_weights(s)?;
        let wv = weights.data();
        let ev = expanded.data();
        let mut mixed = vec![0.0f32; s * b * m];
        for t in 0..s {
            for j in 0..s {
                let w = wv[t * s + j];
                if w == 0.0 {
                    continue;
                }
                for bi in 0..b {
                    let dst = (t * b + bi) * m;
                    let src = (j * b + bi) * m;
                    for c in 0..m {
                        mixed[dst + c] += w * ev[src + c];
                    }
                }
            }
        }
        let mixed = Tensor::from_vec(Shape::new([s, b, m]), mixed)?;
        let down = functional::add_bias(&functional::matmul(&mixed, &self.w_down)?, &self.b_down)?;
        functional::add(&down, hidden)
    }

    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("GatedMlpBlockStage::forward");
        match io.len() {
            2 => match io.into_array::<2>("gated-mlp block")? {
                [StageValue::Tensor(hidden), StageValue::Tensor(mask)] => {
                    let out = self.block_forward(&hidden)?;
                    Ok(StageIo::training(out, mask))
                }
                [first, second] => bail!(
                    "gated-mlp block expected (hidden, mask), got ({}, {})",
                    first.kind_name(),
                    second.kind_name()
                ),
            },
            4 => match io.into_array::<4>("gated-mlp block")? {
                [StageValue::Tensor(hidden), StageValue::Cache(past), StageValue::Cache(presents), StageValue::Tensor(mask)] =>
                {
                    let out = self.block_forward(&hidden)?;
                    Ok(StageIo::inference(out, past, presents, mask))
                }
                values => bail!(
                    "gated-mlp block expected (hidden, past, presents, mask), got ({}, {}, {}, {})",
                    values[0].kind_name(),
                    values[1].kind_name(),
                    values[2].kind_name(),
                    values[3].kind_name()
                ),
            },
            arity => bail!(
                "gated-mlp block expected 2 (training) or 4 (inference) inputs, got {}",
                arity
            ),
        }
    }
}
