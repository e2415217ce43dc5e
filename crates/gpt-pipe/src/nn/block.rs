//! Standard transformer layer: pre-norm causal attention plus a GELU MLP.

use super::norm::LayerNormParams;
use super::SupportsCaching;
use crate::config::GptPipeConfig;
use crate::ops::functional::{self, KvCache};
use crate::pipe::io::{StageIo, StageValue};
use crate::pipe::spec::MaskRule;
use crate::tensor::{Shape, Tensor};
use anyhow::{bail, Result};
use rand::Rng;

/// One standard transformer layer, operating on sequence-major hidden
/// states between the two boundary adapters.
#[derive(Debug)]
pub struct TransformerBlockStage {
    index: usize,
    num_heads: usize,
    mask: MaskRule,
    caching: bool,
    pub ln_attn: LayerNormParams,
    pub w_qkv: Tensor,
    pub b_qkv: Tensor,
    pub w_out: Tensor,
    pub b_out: Tensor,
    pub ln_mlp: LayerNormParams,
    pub w_in: Tensor,
    pub b_in: Tensor,
    pub w_proj: Tensor,
    pub b_proj: Tensor,
}

impl TransformerBlockStage {
    pub fn random(
        index: usize,
        mask: MaskRule,
        caching: bool,
        config: &GptPipeConfig,
        rng: &mut impl Rng,
    ) -> Self {
        let h = config.hidden_size;
        let m = config.mlp_hidden();
        let std = config.init_std;
        TransformerBlockStage {
            index,
            num_heads: config.num_heads,
            mask,
            caching,
            ln_attn: LayerNormParams::identity(h, config.layer_norm_eps),
            w_qkv: Tensor::randn(Shape::new([h, 3 * h]), std, rng),
            b_qkv: Tensor::zeros(Shape::new([3 * h])),
            w_out: Tensor::randn(Shape::new([h, h]), std, rng),
            b_out: Tensor::zeros(Shape::new([h])),
            ln_mlp: LayerNormParams::identity(h, config.layer_norm_eps),
            w_in: Tensor::randn(Shape::new([h, m]), std, rng),
            b_in: Tensor::zeros(Shape::new([m])),
            w_proj: Tensor::randn(Shape::new([m, h]), std, rng),
            b_proj: Tensor::zeros(Shape::new([h])),
        }
    }

    /// Index of this layer in the transformer chain; selects which slot of
    /// the key/value containers belongs to it.
    pub fn index(&self) -> usize {
        self.index
    }

    fn mlp(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = functional::add_bias(&functional::matmul(x, &self.w_in)?, &self.b_in)?;
        let activated = functional::gelu(&hidden)?;
        functional::add_bias(&functional::matmul(&activated, &self.w_proj)?, &self.b_proj)
    }

    fn block_forward(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        past: Option<&KvCache>,
    ) -> Result<(Tensor, KvCache)> {
        let normed = self.ln_attn.forward(hidden)?;
        let attn = functional::causal_attention(
            &normed,
            self.num_heads,
            &self.w_qkv,
            &self.b_qkv,
            &self.w_out,
            &self.b_out,
            mask,
            self.mask.fill_value(),
            past,
        )?;
        let residual = functional::add(&attn.output, hidden)?;
        let normed2 = self.ln_mlp.forward(&residual)?;
        let mlp_out = self.mlp(&normed2)?;
        Ok((functional::add(&mlp_out, &residual)?, attn.present))
    }

    /// Training input is `(hidden, mask)`. Inference input is
    /// `(hidden, past, presents, mask)`: the layer reads its own slot of
    /// `past`, and deposits the refreshed keys/values into `presents` when
    /// caching is enabled.
    #[deny(clippy::disallowed_methods, clippy::disallowed_types)]
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("TransformerBlockStage::forward");
        match io.len() {
            2 => match io.into_array::<2>("transformer block")? {
                [StageValue::Tensor(hidden), StageValue::Tensor(mask)] => {
                    let (out, _present) = self.block_forward(&hidden, &mask, None)?;
                    Ok(StageIo::training(out, mask))
                }
                [first, second] => bail!(
                    "transformer block expected (hidden, mask), got ({}, {})",
                    first.kind_name(),
                    second.kind_name()
                ),
            },
            4 => match io.into_array::<4>("transformer block")? {
                [StageValue::Tensor(hidden), StageValue::Cache(past), StageValue::Cache(mut presents), StageValue::Tensor(mask)] =>
                {
                    let layer_past = past.get(self.index);
                    let (out, present) = self.block_forward(&hidden, &mask, layer_past)?;
                    if self.caching {
                        presents.insert(self.index, present);
                    }
                    Ok(StageIo::inference(out, past, presents, mask))
                }
                values => bail!(
                    "transformer block expected (hidden, past, presents, mask), got ({}, {}, {}, {})",
                    values[0].kind_name(),
                    values[1].kind_name(),
                    values[2].kind_name(),
                    values[3].kind_name()
                ),
            },
            arity => bail!(
                "transformer block expected 2 (training) or 4 (inference) inputs, got {}",
                arity
            ),
        }
    }
}

impl SupportsCaching for TransformerBlockStage {
    fn set_caching(&mut self, enabled: bool) {
        self.caching = enabled;
    }

    fn caching_enabled(&self) -> bool {
        self.caching
    }
}
