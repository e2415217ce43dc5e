//! Layer normalization parameters and the final-norm stage.

use crate::config::GptPipeConfig;
use crate::ops::functional;
use crate::pipe::io::{StageIo, StageValue};
use crate::tensor::{Shape, Tensor};
use anyhow::{bail, Result};

/// Learnable `gamma`/`beta` pair applied over the hidden axis.
#[derive(Debug, Clone)]
pub struct LayerNormParams {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNormParams {
    /// Identity initialization: unit gain, zero shift.
    pub fn identity(width: usize, eps: f32) -> Self {
        LayerNormParams {
            gamma: Tensor::ones(Shape::new([width])),
            beta: Tensor::zeros(Shape::new([width])),
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        functional::layer_norm(x, &self.gamma, &self.beta, self.eps)
    }
}

/// The normalization applied after the last transformer layer.
#[derive(Debug, Clone)]
pub struct FinalNormStage {
    pub norm: LayerNormParams,
}

impl FinalNormStage {
    pub fn new(config: &GptPipeConfig) -> Self {
        FinalNormStage {
            norm: LayerNormParams::identity(config.hidden_size, config.layer_norm_eps),
        }
    }

    /// Training input is the bare hidden states; inference input carries the
    /// accumulated key/values alongside, which pass through untouched.
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("FinalNormStage::forward");
        match io.len() {
            1 => {
                let hidden = io.into_single_tensor("final norm")?;
                Ok(StageIo::single(self.norm.forward(&hidden)?))
            }
            2 => match io.into_array::<2>("final norm")? {
                [StageValue::Tensor(hidden), StageValue::Cache(presents)] => {
                    Ok(StageIo::from_values([
                        StageValue::Tensor(self.norm.forward(&hidden)?),
                        StageValue::Cache(presents),
                    ]))
                }
                [first, second] => bail!(
                    "final norm expected (hidden, presents), got ({}, {})",
                    first.kind_name(),
                    second.kind_name()
                ),
            },
            arity => bail!(
                "final norm expected 1 (training) or 2 (inference) inputs, got {}",
                arity
            ),
        }
    }
}
